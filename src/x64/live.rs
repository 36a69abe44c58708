//! Live intervals, compounds, and the ordered interval index.
//!
//! The allocator's object graph is cyclic (intervals point at their
//! compound, compounds list their intervals), so the whole graph lives in
//! a `bumpalo` arena supplied by the driver and mutates through
//! `Cell`/`RefCell` fields, in the style of the compilation-session
//! arenas used elsewhere in this codebase's lineage.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::ir::{BlockId, ValueId};
use crate::x64::RegMask;

/// Position of a program counter relative to a block's instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubBlock {
    BeforeBlock,
    InBlock,
    AfterBlock,
}

/// Position of a program counter relative to one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubInstruction {
    BeforeInstruction,
    AtInstruction,
    AfterInstruction,
}

/// A totally ordered point of the function at which allocation decisions
/// are made. Ordering is lexicographic over (block, sub-block,
/// instruction index, sub-instruction); block handles provide the stable
/// inter-block order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProgramCounter {
    pub block: BlockId,
    pub sub_block: SubBlock,
    pub index: i32,
    pub sub_index: SubInstruction,
}

/// Instruction index standing in for the block terminator.
pub const BRANCH_INDEX: i32 = i32::MAX;

impl ProgramCounter {
    pub fn before_block(block: BlockId) -> Self {
        Self {
            block,
            sub_block: SubBlock::BeforeBlock,
            index: 0,
            sub_index: SubInstruction::AtInstruction,
        }
    }

    pub fn after_block(block: BlockId) -> Self {
        Self {
            block,
            sub_block: SubBlock::AfterBlock,
            index: 0,
            sub_index: SubInstruction::AtInstruction,
        }
    }

    pub fn at(block: BlockId, index: i32, sub_index: SubInstruction) -> Self {
        Self {
            block,
            sub_block: SubBlock::InBlock,
            index,
            sub_index,
        }
    }
}

/// One contiguous lifetime of a value (or of a clobber reservation).
pub struct LiveInterval<'a> {
    /// Value whose lifetime this interval covers. Clobber intervals carry
    /// no value. For compounds that represent phi nodes the associated
    /// value differs per source block.
    pub associated_value: Option<ValueId>,
    /// Values that originate from the same source may share a register;
    /// overlap between intervals with equal equivalence pointers does not
    /// block a register.
    pub equivalence: Option<ValueId>,
    pub origin_pc: ProgramCounter,
    pub final_pc: ProgramCounter,
    pub compound: Cell<Option<&'a LiveCompound<'a>>>,
}

impl<'a> LiveInterval<'a> {
    pub fn overlaps(&self, origin: ProgramCounter, final_pc: ProgramCounter) -> bool {
        self.origin_pc <= final_pc && origin <= self.final_pc
    }

    pub fn compound(&self) -> &'a LiveCompound<'a> {
        self.compound.get().expect("interval without compound")
    }
}

/// A set of intervals that must all land in one physical register.
pub struct LiveCompound<'a> {
    pub intervals: RefCell<BumpVec<'a, &'a LiveInterval<'a>>>,
    pub possible_registers: Cell<RegMask>,
    pub allocated_register: Cell<Option<u8>>,
    /// Penalty peers: allocation is biased toward the registers already
    /// granted to these compounds, fusing copies into no-ops.
    pub penalties: RefCell<BumpVec<'a, &'a LiveCompound<'a>>>,
}

impl<'a> LiveCompound<'a> {
    pub fn new_in(arena: &'a Bump, possible_registers: RegMask) -> &'a LiveCompound<'a> {
        arena.alloc(LiveCompound {
            intervals: RefCell::new(BumpVec::new_in(arena)),
            possible_registers: Cell::new(possible_registers),
            allocated_register: Cell::new(None),
            penalties: RefCell::new(BumpVec::new_in(arena)),
        })
    }

    /// True when ABI constraints pin this compound to a single register.
    pub fn is_restricted(&self) -> bool {
        self.possible_registers.get().count_ones() == 1
    }
}

/// Allocate an interval in the arena and attach it to its compound.
pub fn attach_interval<'a>(
    arena: &'a Bump,
    compound: &'a LiveCompound<'a>,
    associated_value: Option<ValueId>,
    equivalence: Option<ValueId>,
    origin_pc: ProgramCounter,
    final_pc: ProgramCounter,
) -> &'a LiveInterval<'a> {
    debug_assert!(origin_pc <= final_pc);
    let interval = arena.alloc(LiveInterval {
        associated_value,
        equivalence,
        origin_pc,
        final_pc,
        compound: Cell::new(Some(compound)),
    });
    compound.intervals.borrow_mut().push(interval);
    interval
}

/// Ordered index over allocated intervals, keyed by origin PC.
///
/// The ordered-map form of the red-black interval tree: an overlap query
/// walks every interval whose origin precedes the query end and filters
/// by final PC. Duplicate origins are disambiguated by a running counter.
#[derive(Default)]
pub struct IntervalIndex<'a> {
    tree: BTreeMap<(ProgramCounter, u32), &'a LiveInterval<'a>>,
    next: u32,
}

impl<'a> IntervalIndex<'a> {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            next: 0,
        }
    }

    pub fn insert(&mut self, interval: &'a LiveInterval<'a>) {
        let key = (interval.origin_pc, self.next);
        self.next += 1;
        self.tree.insert(key, interval);
    }

    /// Visit every stored interval overlapping `[origin, final_pc]`.
    pub fn for_overlaps(
        &self,
        origin: ProgramCounter,
        final_pc: ProgramCounter,
        mut visit: impl FnMut(&'a LiveInterval<'a>),
    ) {
        let upper = (final_pc, u32::MAX);
        for (_, interval) in self.tree.range(..=upper) {
            if interval.final_pc >= origin {
                visit(interval);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a LiveInterval<'a>> + '_ {
        self.tree.values().copied()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
