//! Basic blocks, branches, phi nodes, and data-flow edges.
//!
//! A block owns an ordered instruction sequence, a set of phi nodes, an
//! optional terminator, and the outgoing data-flow edges that feed
//! successor phis. Phis are either argument phis (function parameters,
//! entry block only) or data-flow phis collecting one incoming edge per
//! predecessor.

use crate::ir::instruction::InstId;
use crate::ir::value::ValueId;

/// Handle to a basic block. Block handles double as the stable block
/// ordering used by the allocator's program counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Handle to a phi node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhiId(pub u32);

/// Handle to a data-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

/// Block terminator, generic and x86 kinds in one closed sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    /// Return `operands.len()` values.
    FunctionReturn { operands: Vec<ValueId> },
    Unconditional { target: BlockId },
    Conditional {
        operand: ValueId,
        if_target: BlockId,
        else_target: BlockId,
    },
    /// x86 lowering of `FunctionReturn`.
    Ret { operands: Vec<ValueId> },
    /// x86 lowering of `Unconditional`.
    Jmp { target: BlockId },
    /// x86 lowering of `Conditional`: test-and-branch on non-zero.
    Jnz {
        operand: ValueId,
        if_target: BlockId,
        else_target: BlockId,
    },
}

impl Branch {
    pub fn is_generic(&self) -> bool {
        matches!(
            self,
            Branch::FunctionReturn { .. } | Branch::Unconditional { .. } | Branch::Conditional { .. }
        )
    }

    /// Value operands of the branch, in slot order.
    pub fn operands(&self) -> &[ValueId] {
        match self {
            Branch::FunctionReturn { operands } | Branch::Ret { operands } => operands,
            Branch::Conditional { operand, .. } | Branch::Jnz { operand, .. } => {
                std::slice::from_ref(operand)
            }
            Branch::Unconditional { .. } | Branch::Jmp { .. } => &[],
        }
    }

    pub(crate) fn operand_slot(&mut self, index: usize) -> &mut ValueId {
        match self {
            Branch::FunctionReturn { operands } | Branch::Ret { operands } => &mut operands[index],
            Branch::Conditional { operand, .. } | Branch::Jnz { operand, .. } => {
                debug_assert_eq!(index, 0);
                operand
            }
            Branch::Unconditional { .. } | Branch::Jmp { .. } => {
                panic!("branch has no value operands")
            }
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Branch::FunctionReturn { .. } => "return",
            Branch::Unconditional { .. } => "branch",
            Branch::Conditional { .. } => "branch.cond",
            Branch::Ret { .. } => "ret",
            Branch::Jmp { .. } => "jmp",
            Branch::Jnz { .. } => "jnz",
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Phi classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhiKind {
    /// Function parameter number `index`, materialised in the entry
    /// block. Arrives in the SysV argument register of that index.
    Argument { index: usize },
    /// Join of one incoming data-flow edge per predecessor.
    DataFlow,
}

/// Storage behind a [`PhiId`].
#[derive(Debug)]
pub struct PhiData {
    pub kind: PhiKind,
    pub block: BlockId,
    /// The value this phi produces; its origin points back here.
    pub(crate) value: ValueId,
    /// Incoming edges (the data-flow sink). Empty for argument phis.
    pub(crate) edges: Vec<EdgeId>,
}

impl PhiData {
    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }
}

/// Storage behind an [`EdgeId`]: one source-block-to-sink-phi data-flow
/// connection carrying the value the predecessor contributes.
#[derive(Debug)]
pub struct EdgeData {
    pub source: BlockId,
    pub sink: PhiId,
    pub(crate) alias: Option<ValueId>,
}

impl EdgeData {
    pub fn alias(&self) -> Option<ValueId> {
        self.alias
    }
}

/// Storage behind a [`BlockId`].
#[derive(Debug, Default)]
pub struct BasicBlock {
    pub(crate) insts: Vec<InstId>,
    pub(crate) phis: Vec<PhiId>,
    pub(crate) branch: Option<Branch>,
    /// Outgoing data-flow edges (the data-flow source).
    pub(crate) source_edges: Vec<EdgeId>,
}

impl BasicBlock {
    pub fn instructions(&self) -> &[InstId] {
        &self.insts
    }

    pub fn phis(&self) -> &[PhiId] {
        &self.phis
    }

    pub fn branch(&self) -> Option<&Branch> {
        self.branch.as_ref()
    }

    pub fn source_edges(&self) -> &[EdgeId] {
        &self.source_edges
    }

    /// Positional index of an instruction within the block.
    pub fn index_of(&self, inst: InstId) -> Option<usize> {
        self.insts.iter().position(|i| *i == inst)
    }
}
