//! Instruction kinds for the generic IR and the x86-64 architecture IR.
//!
//! A single closed sum covers both levels; the kind tag plus the checked
//! `is_generic` predicate replace the open class hierarchy of a
//! pointer-based IR. Operand and result slots live on the instruction
//! record itself with fixed positional conventions per kind (documented
//! on each variant).

use crate::ir::value::ValueId;

/// Handle to an instruction stored in a [`Function`](crate::ir::Function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// Opcodes of `UnaryMath`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryMathOp {
    Negate,
}

/// Opcodes of `BinaryMath`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryMathOp {
    Add,
    BitwiseAnd,
}

/// Instruction classification.
///
/// x86 kinds follow the `<opcode><operands>` naming scheme of the
/// architecture IR: `M` is a register-or-memory reference (ModR/M), `R` a
/// register, `C` an immediate constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    // ---------------------------------------------------------------
    // Generic IR. Consumed by the lowering pass.
    // ---------------------------------------------------------------
    /// No operands; one result.
    LoadConst { value: u64 },
    /// Operand 0: base pointer; one result (the loaded value).
    LoadOffset { offset: i32 },
    /// Operand 0: the sole input; one result.
    UnaryMath { op: UnaryMathOp },
    /// Operand 0: left (in-place side), operand 1: right; one result.
    BinaryMath { op: BinaryMathOp },
    /// Operands: call arguments in ABI order; one result.
    Invoke { function: String },

    // ---------------------------------------------------------------
    // x86-64 architecture IR. Produced by lowering and the allocator.
    // ---------------------------------------------------------------
    /// No operands; one register-mode result.
    MovMC { value: u64 },
    /// Operand 0: source register value; one result (the destination).
    MovMR,
    /// Operand 0: source memory value; one register-mode result.
    MovRM,
    /// Operands 0/1: the two values to swap; results 0/1 mirror them.
    XchgMR,
    /// Operand 0: primary (in-place); one result.
    NegM,
    /// Operand 0: primary (in-place), operand 1: secondary; one result.
    AddMR,
    /// Operand 0: primary (in-place), operand 1: secondary; one result.
    AndMR,
    /// Operands: arguments in ABI order; one result fixed to RAX.
    Call { function: String },
    /// Operand 0: base register value; one memory-mode result. Emits no
    /// bytes; exists purely to name and type the addressed slot.
    DefineOffset { displacement: i32 },
    /// No operands or results; prologue save of a callee-saved register.
    PushSave { register: u8 },
    /// No operands or results; epilogue restore.
    PopRestore { register: u8 },
    /// No operands or results; `SUB RSP, amount`.
    DecrementStack { amount: i32 },
    /// No operands or results; `ADD RSP, amount`.
    IncrementStack { amount: i32 },
    /// Emits nothing; left behind by fused pseudo-moves.
    Nop,
    /// Operand 0 copied to result 0. Placeholder inserted by the
    /// allocator at single-value coalescing sites.
    PseudoMoveSingle,
    /// Operand i copied to result i, all in parallel. Placeholder for
    /// block-boundary and call/return copy groups.
    PseudoMoveMultiple,
}

impl InstKind {
    /// True for machine-independent kinds that lowering must replace.
    pub fn is_generic(&self) -> bool {
        matches!(
            self,
            InstKind::LoadConst { .. }
                | InstKind::LoadOffset { .. }
                | InstKind::UnaryMath { .. }
                | InstKind::BinaryMath { .. }
                | InstKind::Invoke { .. }
        )
    }

    /// True for the in-place x86 kinds whose result must share the
    /// primary operand's register.
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            InstKind::NegM | InstKind::AddMR | InstKind::AndMR | InstKind::DefineOffset { .. }
        )
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstKind::LoadConst { .. } => "load.const",
            InstKind::LoadOffset { .. } => "load.offset",
            InstKind::UnaryMath { .. } => "unary.math",
            InstKind::BinaryMath { .. } => "binary.math",
            InstKind::Invoke { .. } => "invoke",
            InstKind::MovMC { .. } => "mov.mc",
            InstKind::MovMR => "mov.mr",
            InstKind::MovRM => "mov.rm",
            InstKind::XchgMR => "xchg.mr",
            InstKind::NegM => "neg.m",
            InstKind::AddMR => "add.mr",
            InstKind::AndMR => "and.mr",
            InstKind::Call { .. } => "call",
            InstKind::DefineOffset { .. } => "define.offset",
            InstKind::PushSave { .. } => "push.save",
            InstKind::PopRestore { .. } => "pop.restore",
            InstKind::DecrementStack { .. } => "decrement.stack",
            InstKind::IncrementStack { .. } => "increment.stack",
            InstKind::Nop => "nop",
            InstKind::PseudoMoveSingle => "pseudo.move.single",
            InstKind::PseudoMoveMultiple => "pseudo.move.multiple",
        }
    }
}

impl std::fmt::Display for InstKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Storage behind an [`InstId`].
#[derive(Debug)]
pub struct InstData {
    pub kind: InstKind,
    pub(crate) operands: Vec<ValueId>,
    pub(crate) results: Vec<ValueId>,
}

impl InstData {
    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    /// The single result of a one-result instruction.
    pub fn result(&self) -> ValueId {
        debug_assert_eq!(self.results.len(), 1);
        self.results[0]
    }
}
