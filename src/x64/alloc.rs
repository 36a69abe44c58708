//! Global register allocation over the x86-64 architecture IR.
//!
//! The pass runs in four stages over a fully lowered function:
//!
//! 1. **Pseudo-move insertion** materialises every SSA-to-register copy
//!    site as an explicit placeholder instruction: single copies in front
//!    of argument phis, in-place instructions and `Jnz` operands;
//!    parallel copy groups at block boundaries and around `Call`/`Ret`.
//! 2. **Interval collection** builds one [`LiveCompound`] per register
//!    constraint group, with ABI-pinned compounds for arguments, call
//!    operands/results/clobbers, and return values.
//! 3. **Assignment** drains two FIFO queues (single-register compounds
//!    first), blocking registers through overlap queries on the interval
//!    index and biasing the choice by penalty edges so copies fuse.
//! 4. **Establishing** rewrites pseudo-moves into `Nop`/`MovMR`/`XchgMR`
//!    sequences via move-chain resolution and wraps the function in its
//!    prologue and epilogue.
//!
//! Spilling is not implemented: an unsatisfiable compound surfaces as
//! [`BackendError::LiveRangeSplitting`].

use std::collections::{HashMap, VecDeque};

use bumpalo::Bump;

use crate::error::{BackendError, BackendResult};
use crate::ir::{
    BlockId, Branch, Function, InstId, InstKind, PhiKind, UseSite, ValueId, ValueKind,
};
use crate::x64::live::{
    attach_interval, IntervalIndex, LiveCompound, ProgramCounter, SubInstruction, BRANCH_INDEX,
};
use crate::x64::{
    reg_bit, RegMask, ARGUMENT_REGISTERS, CALLEE_SAVED_MASK, CALLER_SAVED_MASK, GPR_MASK,
    REGISTER_NAMES, RETURN_REGISTERS,
};

/// Classification of a `PseudoMoveSingle`, recorded at insertion time.
#[derive(Debug, Clone, Copy)]
enum SingleRole {
    /// Copy out of an argument phi or into a `Jnz` operand.
    Plain,
    /// Copy feeding an in-place instruction; the copy result and the
    /// parent's result share one compound.
    InPlace { parent: InstId },
}

/// Global register allocator for one function.
pub struct AllocateRegisters<'a, 'f> {
    arena: &'a Bump,
    function: &'f mut Function,

    /// Monotone instruction numbering, fixed after pseudo-move insertion.
    index_map: HashMap<InstId, i32>,
    inst_block: HashMap<InstId, BlockId>,
    pms_roles: HashMap<InstId, SingleRole>,
    /// The data-flow-edge pseudo-move at the end of each block that has
    /// outgoing edges.
    edge_pmm: HashMap<BlockId, InstId>,
    /// Values whose compound is pinned to a single ABI register.
    pinned: HashMap<ValueId, u8>,
    /// Copy roots: a pseudo-move result inherits the root of its operand,
    /// so overlapping copies of one value may share a register.
    equivalence: HashMap<ValueId, ValueId>,
    /// Compound that defines each value.
    value_compounds: HashMap<ValueId, &'a LiveCompound<'a>>,

    restricted: VecDeque<&'a LiveCompound<'a>>,
    unrestricted: VecDeque<&'a LiveCompound<'a>>,
    allocated: IntervalIndex<'a>,

    used_registers: RegMask,
    has_calls: bool,
}

impl<'a, 'f> AllocateRegisters<'a, 'f> {
    pub fn new(arena: &'a Bump, function: &'f mut Function) -> Self {
        Self {
            arena,
            function,
            index_map: HashMap::new(),
            inst_block: HashMap::new(),
            pms_roles: HashMap::new(),
            edge_pmm: HashMap::new(),
            pinned: HashMap::new(),
            equivalence: HashMap::new(),
            value_compounds: HashMap::new(),
            restricted: VecDeque::new(),
            unrestricted: VecDeque::new(),
            allocated: IntervalIndex::new(),
            used_registers: 0,
            has_calls: false,
        }
    }

    pub fn run(mut self) -> BackendResult<()> {
        assert!(self.function.num_blocks() > 0, "function without blocks");

        let blocks: Vec<BlockId> = self.function.blocks().collect();
        for block in &blocks {
            self.insert_pseudo_moves(*block);
        }
        self.number_instructions(&blocks);
        for block in &blocks {
            self.collect_phi_intervals(*block);
        }
        for block in &blocks {
            self.collect_instruction_intervals(*block);
        }
        self.assign()?;
        self.check_consistency();
        for block in &blocks {
            self.establish_block(*block)?;
        }
        self.insert_prologue_epilogue();
        Ok(())
    }

    fn root(&self, value: ValueId) -> ValueId {
        self.equivalence.get(&value).copied().unwrap_or(value)
    }

    fn size_of(&self, value: ValueId) -> crate::ir::OperandSize {
        self.function.value(value).kind.size()
    }

    fn new_copy_of(&mut self, value: ValueId) -> ValueId {
        let size = self.size_of(value);
        let copy = self.function.new_value(ValueKind::Register {
            size,
            register: None,
        });
        self.equivalence.insert(copy, self.root(value));
        copy
    }

    // ------------------------------------------------------------------
    // Stage 1: pseudo-move insertion.
    // ------------------------------------------------------------------

    fn insert_pseudo_moves(&mut self, block: BlockId) {
        // Copies out of argument phis, at the very top of the block. The
        // phi's value stays pinned to its ABI register; every consumer is
        // rewritten to the copy.
        let mut at = 0;
        for phi in self.function.block(block).phis().to_vec() {
            let index = match self.function.phi(phi).kind {
                PhiKind::Argument { index } => index,
                PhiKind::DataFlow => continue,
            };
            let value = self.function.phi_value(phi);
            self.pinned.insert(value, ARGUMENT_REGISTERS[index]);
            let copy = self.new_copy_of(value);
            self.function.replace_all_uses(value, copy);
            let pms = self.function.insert_instruction(
                block,
                at,
                InstKind::PseudoMoveSingle,
                &[value],
                vec![copy],
            );
            self.pms_roles.insert(pms, SingleRole::Plain);
            at += 1;
        }

        // Copies in front of in-place instructions and calls.
        while at < self.function.block(block).instructions().len() {
            let inst = self.function.block(block).instructions()[at];
            let kind = self.function.inst_kind(inst).clone();
            if kind.is_in_place() {
                let primary = self.function.inst(inst).operands()[0];
                let copy = self.new_copy_of(primary);
                let pms = self.function.insert_instruction(
                    block,
                    at,
                    InstKind::PseudoMoveSingle,
                    &[primary],
                    vec![copy],
                );
                self.function.set_operand(inst, 0, copy);
                self.pms_roles.insert(pms, SingleRole::InPlace { parent: inst });
                at += 2;
            } else if let InstKind::Call { .. } = kind {
                self.has_calls = true;
                let args = self.function.inst(inst).operands().to_vec();
                assert!(
                    args.len() <= ARGUMENT_REGISTERS.len(),
                    "stack arguments are not supported"
                );
                if !args.is_empty() {
                    let mut results = Vec::with_capacity(args.len());
                    for (i, arg) in args.iter().enumerate() {
                        let copy = self.new_copy_of(*arg);
                        self.pinned.insert(copy, ARGUMENT_REGISTERS[i]);
                        results.push(copy);
                    }
                    self.function.insert_instruction(
                        block,
                        at,
                        InstKind::PseudoMoveMultiple,
                        &args,
                        results.clone(),
                    );
                    for (i, copy) in results.iter().enumerate() {
                        self.function.set_operand(inst, i, *copy);
                    }
                    at += 1;
                }
                self.pinned
                    .insert(self.function.inst(inst).result(), crate::x64::RAX);
                at += 1;
            } else {
                at += 1;
            }
        }

        // Copy of the Jnz operand, ahead of the block-boundary moves.
        let branch = self
            .function
            .block(block)
            .branch()
            .expect("block without terminator")
            .clone();
        match branch {
            Branch::Jnz { operand, .. } => {
                let copy = self.new_copy_of(operand);
                let pms = self.function.append_instruction(
                    block,
                    InstKind::PseudoMoveSingle,
                    &[operand],
                    vec![copy],
                );
                self.pms_roles.insert(pms, SingleRole::Plain);
                self.function.set_branch_operand(block, 0, copy);
            }
            Branch::Ret { operands } => {
                assert!(
                    operands.len() <= RETURN_REGISTERS.len(),
                    "too many return values"
                );
                if !operands.is_empty() {
                    let mut results = Vec::with_capacity(operands.len());
                    for (i, op) in operands.iter().enumerate() {
                        let copy = self.new_copy_of(*op);
                        self.pinned.insert(copy, RETURN_REGISTERS[i]);
                        results.push(copy);
                    }
                    self.function.append_instruction(
                        block,
                        InstKind::PseudoMoveMultiple,
                        &operands,
                        results.clone(),
                    );
                    for (i, copy) in results.iter().enumerate() {
                        self.function.set_branch_operand(block, i, *copy);
                    }
                }
            }
            Branch::Jmp { .. } => {}
            other => panic!("unexpected IR branch during allocation: {other}"),
        }

        // Parallel copies feeding successor phis, at the end of the block.
        let edges = self.function.block(block).source_edges().to_vec();
        if !edges.is_empty() {
            let mut operands = Vec::with_capacity(edges.len());
            let mut results = Vec::with_capacity(edges.len());
            for edge in &edges {
                let alias = self
                    .function
                    .edge(*edge)
                    .alias()
                    .expect("data-flow edge without alias");
                operands.push(alias);
                results.push(self.new_copy_of(alias));
            }
            let pmm = self.function.append_instruction(
                block,
                InstKind::PseudoMoveMultiple,
                &operands,
                results.clone(),
            );
            for (edge, copy) in edges.iter().zip(&results) {
                self.function.set_edge_alias(*edge, *copy);
            }
            self.edge_pmm.insert(block, pmm);
        }
    }

    // ------------------------------------------------------------------
    // Stage 2: interval collection.
    // ------------------------------------------------------------------

    fn number_instructions(&mut self, blocks: &[BlockId]) {
        for block in blocks {
            for (index, inst) in self.function.block(*block).instructions().iter().enumerate() {
                self.index_map.insert(*inst, index as i32);
                self.inst_block.insert(*inst, *block);
            }
        }
    }

    /// Final PC of a value defined at `origin_pc` in `block`: the largest
    /// use position. Data-flow-edge uses are excluded; their lifetime is
    /// carried by the edge intervals of the sink phi's compound.
    fn final_pc(&self, block: BlockId, origin_pc: ProgramCounter, value: ValueId) -> ProgramCounter {
        let mut final_pc = origin_pc;
        for site in self.function.value(value).uses() {
            let pc = match *site {
                UseSite::Operand { inst, .. } => {
                    assert_eq!(
                        self.inst_block[&inst], block,
                        "cross-block use outside a data-flow edge"
                    );
                    ProgramCounter::at(
                        block,
                        self.index_map[&inst],
                        SubInstruction::BeforeInstruction,
                    )
                }
                UseSite::BranchOperand { block: b, .. } => {
                    assert_eq!(b, block, "cross-block use outside a data-flow edge");
                    ProgramCounter::at(block, BRANCH_INDEX, SubInstruction::BeforeInstruction)
                }
                UseSite::EdgeAlias(_) => continue,
            };
            if pc > final_pc {
                final_pc = pc;
            }
        }
        final_pc
    }

    fn mask_for(&self, value: ValueId) -> RegMask {
        match self.pinned.get(&value) {
            Some(reg) => reg_bit(*reg),
            None => GPR_MASK,
        }
    }

    fn enqueue(&mut self, compound: &'a LiveCompound<'a>) {
        if compound.is_restricted() {
            self.restricted.push_back(compound);
        } else {
            self.unrestricted.push_back(compound);
        }
    }

    /// Phi compounds cross block boundaries: the node's own interval
    /// plus one interval per incoming edge, living at the tail of the
    /// source block.
    fn collect_phi_intervals(&mut self, block: BlockId) {
        for phi in self.function.block(block).phis().to_vec() {
            let value = self.function.phi_value(phi);
            let compound = LiveCompound::new_in(self.arena, self.mask_for(value));
            let origin = ProgramCounter::before_block(block);
            attach_interval(
                self.arena,
                compound,
                Some(value),
                Some(self.root(value)),
                origin,
                self.final_pc(block, origin, value),
            );
            self.value_compounds.insert(value, compound);

            for edge in self.function.phi(phi).edges().to_vec() {
                let source = self.function.edge(edge).source;
                let alias = self
                    .function
                    .edge(edge)
                    .alias()
                    .expect("data-flow edge without alias");
                let pmm = self.edge_pmm[&source];
                let origin = ProgramCounter::at(
                    source,
                    self.index_map[&pmm],
                    SubInstruction::AfterInstruction,
                );
                attach_interval(
                    self.arena,
                    compound,
                    Some(alias),
                    Some(self.root(alias)),
                    origin,
                    ProgramCounter::after_block(source),
                );
                self.value_compounds.insert(alias, compound);
            }

            self.enqueue(compound);
        }
    }

    fn collect_instruction_intervals(&mut self, block: BlockId) {
        for (index, inst) in self
            .function
            .block(block)
            .instructions()
            .to_vec()
            .into_iter()
            .enumerate()
        {
            let index = index as i32;
            let kind = self.function.inst_kind(inst).clone();
            match kind {
                InstKind::MovMC { .. } | InstKind::MovRM => {
                    let result = self.function.inst(inst).result();
                    self.collect_plain_result(block, index, result);
                }
                InstKind::PseudoMoveSingle => match self.pms_roles[&inst] {
                    SingleRole::Plain => {
                        let result = self.function.inst(inst).result();
                        self.collect_plain_result(block, index, result);
                    }
                    SingleRole::InPlace { parent } => {
                        let copy = self.function.inst(inst).result();
                        let operand = self.function.inst(inst).operands()[0];
                        let parent_result = self.function.inst(parent).result();
                        let parent_index = self.index_map[&parent];

                        let compound = LiveCompound::new_in(self.arena, GPR_MASK);
                        let copy_origin =
                            ProgramCounter::at(block, index, SubInstruction::AfterInstruction);
                        attach_interval(
                            self.arena,
                            compound,
                            Some(copy),
                            Some(self.root(copy)),
                            copy_origin,
                            self.final_pc(block, copy_origin, copy),
                        );
                        let result_origin = ProgramCounter::at(
                            block,
                            parent_index,
                            SubInstruction::AfterInstruction,
                        );
                        attach_interval(
                            self.arena,
                            compound,
                            Some(parent_result),
                            Some(self.root(parent_result)),
                            result_origin,
                            self.final_pc(block, result_origin, parent_result),
                        );
                        self.value_compounds.insert(copy, compound);
                        self.value_compounds.insert(parent_result, compound);

                        // Bias the copy toward its source register so the
                        // move fuses into a no-op.
                        let peer = self.value_compounds[&operand];
                        compound.penalties.borrow_mut().push(peer);
                        peer.penalties.borrow_mut().push(compound);

                        self.enqueue(compound);
                    }
                },
                InstKind::PseudoMoveMultiple => {
                    for result in self.function.inst(inst).results().to_vec() {
                        if self.is_edge_copy(result) {
                            continue;
                        }
                        self.collect_constrained_result(block, index, result);
                    }
                }
                InstKind::Call { .. } => {
                    let result = self.function.inst(inst).result();
                    self.collect_constrained_result(block, index, result);
                    self.collect_call_clobbers(block, index, inst);
                }
                InstKind::NegM
                | InstKind::AddMR
                | InstKind::AndMR
                | InstKind::DefineOffset { .. }
                | InstKind::Nop => {
                    // In-place results are covered by their pseudo-move's
                    // compound.
                }
                other => panic!("unexpected IR instruction during allocation: {other}"),
            }
        }
    }

    fn is_edge_copy(&self, value: ValueId) -> bool {
        self.function
            .value(value)
            .uses()
            .iter()
            .any(|site| matches!(site, UseSite::EdgeAlias(_)))
    }

    fn collect_plain_result(&mut self, block: BlockId, index: i32, result: ValueId) {
        let compound = LiveCompound::new_in(self.arena, GPR_MASK);
        let origin = ProgramCounter::at(block, index, SubInstruction::AfterInstruction);
        attach_interval(
            self.arena,
            compound,
            Some(result),
            Some(self.root(result)),
            origin,
            self.final_pc(block, origin, result),
        );
        self.value_compounds.insert(result, compound);
        self.enqueue(compound);
    }

    fn collect_constrained_result(&mut self, block: BlockId, index: i32, result: ValueId) {
        let compound = LiveCompound::new_in(self.arena, self.mask_for(result));
        let origin = ProgramCounter::at(block, index, SubInstruction::AfterInstruction);
        attach_interval(
            self.arena,
            compound,
            Some(result),
            Some(self.root(result)),
            origin,
            self.final_pc(block, origin, result),
        );
        self.value_compounds.insert(result, compound);
        self.enqueue(compound);
    }

    /// Registers a call tramples that are not already pinned operands or
    /// its result: zero-width reservations at the call site keep live
    /// values out of them.
    fn collect_call_clobbers(&mut self, block: BlockId, index: i32, call: InstId) {
        let mut pinned_here = reg_bit(crate::x64::RAX);
        for i in 0..self.function.inst(call).operands().len() {
            pinned_here |= reg_bit(ARGUMENT_REGISTERS[i]);
        }
        let at = ProgramCounter::at(block, index, SubInstruction::AtInstruction);
        for reg in 0..16u8 {
            if CALLER_SAVED_MASK & reg_bit(reg) == 0 || pinned_here & reg_bit(reg) != 0 {
                continue;
            }
            let compound = LiveCompound::new_in(self.arena, reg_bit(reg));
            attach_interval(self.arena, compound, None, None, at, at);
            self.enqueue(compound);
        }
    }

    // ------------------------------------------------------------------
    // Stage 3: assignment.
    // ------------------------------------------------------------------

    fn assign(&mut self) -> BackendResult<()> {
        while let Some(compound) = self.restricted.pop_front() {
            self.assign_compound(compound)?;
        }
        while let Some(compound) = self.unrestricted.pop_front() {
            self.assign_compound(compound)?;
        }
        Ok(())
    }

    fn assign_compound(&mut self, compound: &'a LiveCompound<'a>) -> BackendResult<()> {
        let mut blocked: RegMask = 0;
        for interval in compound.intervals.borrow().iter() {
            self.allocated
                .for_overlaps(interval.origin_pc, interval.final_pc, |other| {
                    let may_share = match (interval.equivalence, other.equivalence) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    };
                    if !may_share {
                        let reg = other
                            .compound()
                            .allocated_register
                            .get()
                            .expect("allocated interval without register");
                        blocked |= reg_bit(reg);
                    }
                });
        }

        let possible = compound.possible_registers.get() & !blocked;
        if possible == 0 {
            let value = compound.intervals.borrow()[0]
                .associated_value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<clobber>".to_string());
            return Err(BackendError::LiveRangeSplitting { value });
        }

        // Relative costs from the penalty list: already-placed peers make
        // their register cheaper.
        let mut relative = [0i32; 16];
        for peer in compound.penalties.borrow().iter() {
            if let Some(reg) = peer.allocated_register.get() {
                relative[reg as usize] -= 1;
            }
        }

        let mut choice: Option<u8> = None;
        for reg in 0..16u8 {
            if possible & reg_bit(reg) == 0 {
                continue;
            }
            match choice {
                Some(best) if relative[reg as usize] >= relative[best as usize] => {}
                _ => choice = Some(reg),
            }
        }
        let reg = choice.expect("non-empty mask yields a register");

        compound.allocated_register.set(Some(reg));
        self.used_registers |= reg_bit(reg);
        log::trace!("allocating compound to {}", REGISTER_NAMES[reg as usize]);
        for interval in compound.intervals.borrow().iter().copied() {
            self.allocated.insert(interval);
            if let Some(value) = interval.associated_value {
                self.function.set_register(value, reg);
            }
        }
        Ok(())
    }

    /// No two overlapping intervals of distinct origin may occupy one
    /// register.
    fn check_consistency(&self) {
        let intervals: Vec<_> = self.allocated.iter().collect();
        for (i, a) in intervals.iter().enumerate() {
            for b in &intervals[i + 1..] {
                if !a.overlaps(b.origin_pc, b.final_pc) {
                    continue;
                }
                let may_share = match (a.equivalence, b.equivalence) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                };
                if may_share || std::ptr::eq(a.compound(), b.compound()) {
                    continue;
                }
                assert_ne!(
                    a.compound().allocated_register.get(),
                    b.compound().allocated_register.get(),
                    "overlapping intervals share a register"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage 4: establishing the allocation.
    // ------------------------------------------------------------------

    fn register_of(&self, value: ValueId) -> u8 {
        self.function
            .value(value)
            .register()
            .expect("value without an allocated register")
    }

    fn establish_block(&mut self, block: BlockId) -> BackendResult<()> {
        let old_order = self.function.block(block).instructions().to_vec();
        let mut order = Vec::with_capacity(old_order.len());
        for inst in old_order {
            match self.function.inst_kind(inst).clone() {
                InstKind::PseudoMoveSingle => {
                    let operand = self.function.inst(inst).operands()[0];
                    let result = self.function.inst(inst).result();
                    if self.register_of(operand) == self.register_of(result) {
                        // Fused: the copy result collapses into its operand.
                        self.function.detach_instruction(inst);
                        self.function.replace_all_uses(result, operand);
                        order.push(inst);
                    } else {
                        self.function.set_inst_kind(inst, InstKind::MovMR);
                        order.push(inst);
                    }
                }
                InstKind::PseudoMoveMultiple => {
                    self.resolve_parallel_copy(block, inst, &mut order)?;
                }
                _ => order.push(inst),
            }
        }
        self.function.set_block_insts(block, order);
        Ok(())
    }

    /// Resolve a parallel copy group into an ordered move sequence.
    ///
    /// One node per physical register; each operand-to-result pair adds an
    /// edge from source register to destination register. Every node has
    /// in-degree at most one, so the graph decomposes into paths plus
    /// disjoint cycles: emit moves into exhausted targets until only
    /// cycles remain, then break each 2-cycle with an exchange.
    fn resolve_parallel_copy(
        &mut self,
        block: BlockId,
        pmm: InstId,
        order: &mut Vec<InstId>,
    ) -> BackendResult<()> {
        let operands = self.function.inst(pmm).operands().to_vec();
        let results = self.function.inst(pmm).results().to_vec();
        self.function.detach_instruction(pmm);

        struct Move {
            src: u8,
            dst: u8,
            operand: ValueId,
            result: ValueId,
        }

        let mut pending = Vec::new();
        for (operand, result) in operands.into_iter().zip(results) {
            let src = self.register_of(operand);
            let dst = self.register_of(result);
            if src == dst {
                // Self-loop: the result fuses into the operand's range.
                self.function.replace_all_uses(result, operand);
            } else {
                pending.push(Move {
                    src,
                    dst,
                    operand,
                    result,
                });
            }
        }

        // Paths: emit every move whose target register is no longer
        // needed as a source; each emission may expose new tails.
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < pending.len() {
                let dst = pending[i].dst;
                if pending.iter().any(|m| m.src == dst) {
                    i += 1;
                    continue;
                }
                let mv = pending.swap_remove(i);
                let at = self.function.block(block).instructions().len();
                let id = self.function.insert_instruction(
                    block,
                    at,
                    InstKind::MovMR,
                    &[mv.operand],
                    vec![mv.result],
                );
                order.push(id);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        // Cycles. Every remaining register is both a source and a target,
        // so following source-of-target links from any move walks a
        // closed cycle. A 2-cycle resolves with a single exchange; longer
        // cycles would need a scratch register.
        while !pending.is_empty() {
            let mut cycle = vec![0usize];
            let mut cursor = pending[0].dst;
            while cursor != pending[0].src {
                let next = pending
                    .iter()
                    .position(|m| m.src == cursor)
                    .expect("unresolved move outside a cycle");
                cycle.push(next);
                cursor = pending[next].dst;
            }
            if cycle.len() != 2 {
                return Err(BackendError::MoveCycleTooLong { length: cycle.len() });
            }
            let mut indices = cycle;
            indices.sort_unstable();
            let second = pending.swap_remove(indices[1]);
            let first = pending.swap_remove(indices[0]);
            let at = self.function.block(block).instructions().len();
            let id = self.function.insert_instruction(
                block,
                at,
                InstKind::XchgMR,
                &[first.operand, second.operand],
                vec![first.result, second.result],
            );
            order.push(id);
        }

        Ok(())
    }

    fn insert_prologue_epilogue(&mut self) {
        let saved: Vec<u8> = (0..16u8)
            .filter(|reg| self.used_registers & CALLEE_SAVED_MASK & reg_bit(*reg) != 0)
            .collect();
        // The return address leaves the stack 8 bytes past a 16-byte
        // boundary; realign only when the body performs calls.
        let frame_space = if self.has_calls && (8 + 8 * saved.len()) % 16 != 0 {
            8
        } else {
            0
        };

        let entry = BlockId(0);
        let mut at = 0;
        for reg in &saved {
            self.function.insert_instruction(
                entry,
                at,
                InstKind::PushSave { register: *reg },
                &[],
                vec![],
            );
            at += 1;
        }
        if frame_space > 0 {
            self.function.insert_instruction(
                entry,
                at,
                InstKind::DecrementStack {
                    amount: frame_space,
                },
                &[],
                vec![],
            );
        }

        for block in self.function.blocks().collect::<Vec<_>>() {
            if !matches!(self.function.block(block).branch(), Some(Branch::Ret { .. })) {
                continue;
            }
            if frame_space > 0 {
                self.function.append_instruction(
                    block,
                    InstKind::IncrementStack {
                        amount: frame_space,
                    },
                    &[],
                    vec![],
                );
            }
            for reg in saved.iter().rev() {
                self.function.append_instruction(
                    block,
                    InstKind::PopRestore { register: *reg },
                    &[],
                    vec![],
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Type, UnaryMathOp};
    use crate::x64::lower::lower_function;
    use crate::x64::{RAX, RDI, RSI};

    fn allocate(function: &mut Function) {
        let arena = Bump::new();
        AllocateRegisters::new(&arena, function).run().unwrap();
    }

    fn negate_function() -> Function {
        let mut f = Function::new("g");
        let b = f.add_block();
        let phi = f.add_argument_phi(b, 0, Type::Int32);
        let x = f.phi_value(phi);
        let neg = f.append_generic(
            b,
            InstKind::UnaryMath {
                op: UnaryMathOp::Negate,
            },
            &[x],
            Type::Int32,
        );
        f.set_branch(b, Branch::FunctionReturn { operands: vec![neg] });
        f
    }

    #[test]
    fn test_argument_lands_in_rdi() {
        let mut f = negate_function();
        lower_function(&mut f);
        allocate(&mut f);
        let b = BlockId(0);
        let phi = f.block(b).phis()[0];
        assert_eq!(f.value(f.phi_value(phi)).register(), Some(RDI));
    }

    #[test]
    fn test_negate_coalesces_into_return_register() {
        let mut f = negate_function();
        lower_function(&mut f);
        allocate(&mut f);
        let b = BlockId(0);
        // The negate's result must sit in RAX so the return copy fuses.
        for inst in f.block(b).instructions() {
            if matches!(f.inst_kind(*inst), InstKind::NegM) {
                assert_eq!(f.value(f.inst(*inst).result()).register(), Some(RAX));
            }
        }
        // Exactly one real move materialises (rdi -> rax); the in-place
        // copy and the return copy fuse.
        let moves = f
            .block(b)
            .instructions()
            .iter()
            .filter(|i| matches!(f.inst_kind(**i), InstKind::MovMR))
            .count();
        assert_eq!(moves, 1);
    }

    #[test]
    fn test_no_pseudo_moves_survive() {
        let mut f = negate_function();
        lower_function(&mut f);
        allocate(&mut f);
        for block in f.blocks().collect::<Vec<_>>() {
            for inst in f.block(block).instructions() {
                assert!(!matches!(
                    f.inst_kind(*inst),
                    InstKind::PseudoMoveSingle | InstKind::PseudoMoveMultiple
                ));
            }
        }
    }

    #[test]
    fn test_add_arguments_get_distinct_registers() {
        let mut f = Function::new("h");
        let b = f.add_block();
        let pa = f.add_argument_phi(b, 0, Type::Int32);
        let pb = f.add_argument_phi(b, 1, Type::Int32);
        let a = f.phi_value(pa);
        let c = f.phi_value(pb);
        let sum = f.append_generic(
            b,
            InstKind::BinaryMath {
                op: crate::ir::BinaryMathOp::Add,
            },
            &[a, c],
            Type::Int32,
        );
        f.set_branch(b, Branch::FunctionReturn { operands: vec![sum] });
        lower_function(&mut f);
        allocate(&mut f);

        assert_eq!(f.value(a).register(), Some(RDI));
        assert_eq!(f.value(c).register(), Some(RSI));
        // The add writes its primary copy; the secondary keeps its own
        // register distinct from the in-place result.
        for inst in f.block(b).instructions() {
            if matches!(f.inst_kind(*inst), InstKind::AddMR) {
                let data = f.inst(*inst);
                let primary = f.value(data.operands()[0]).register().unwrap();
                let secondary = f.value(data.operands()[1]).register().unwrap();
                let result = f.value(data.result()).register().unwrap();
                assert_eq!(primary, result);
                assert_ne!(secondary, result);
            }
        }
    }

    #[test]
    fn test_phi_compound_spans_predecessors() {
        // Diamond: both predecessors feed one data-flow phi; every alias
        // copy must land in the phi's register.
        let mut f = Function::new("p");
        let b0 = f.add_block();
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        let cond_phi = f.add_argument_phi(b0, 0, Type::Int32);
        let cond = f.phi_value(cond_phi);
        f.set_branch(
            b0,
            Branch::Conditional {
                operand: cond,
                if_target: b1,
                else_target: b2,
            },
        );
        let one = f.append_generic(b1, InstKind::LoadConst { value: 1 }, &[], Type::Int32);
        let two = f.append_generic(b2, InstKind::LoadConst { value: 2 }, &[], Type::Int32);
        let join = f.add_data_flow_phi(b3, Type::Int32);
        f.add_data_flow_edge(b1, join, one);
        f.add_data_flow_edge(b2, join, two);
        f.set_branch(b1, Branch::Unconditional { target: b3 });
        f.set_branch(b2, Branch::Unconditional { target: b3 });
        let joined = f.phi_value(join);
        f.set_branch(b3, Branch::FunctionReturn { operands: vec![joined] });

        lower_function(&mut f);
        allocate(&mut f);

        let phi_reg = f.value(joined).register().unwrap();
        for edge in f.phi(join).edges() {
            let alias = f.edge(*edge).alias().unwrap();
            assert_eq!(f.value(alias).register(), Some(phi_reg));
        }
    }

    #[test]
    fn test_register_pressure_reports_splitting() {
        // Sixteen constants stay live into an add chain; fifteen
        // allocatable registers cannot hold them.
        let mut f = Function::new("r");
        let b = f.add_block();
        let consts: Vec<_> = (0..16u64)
            .map(|i| f.append_generic(b, InstKind::LoadConst { value: i }, &[], Type::Int32))
            .collect();
        let mut acc = consts[0];
        for c in &consts[1..] {
            acc = f.append_generic(
                b,
                InstKind::BinaryMath {
                    op: crate::ir::BinaryMathOp::Add,
                },
                &[acc, *c],
                Type::Int32,
            );
        }
        f.set_branch(b, Branch::FunctionReturn { operands: vec![acc] });
        lower_function(&mut f);

        let arena = Bump::new();
        let result = AllocateRegisters::new(&arena, &mut f).run();
        assert!(matches!(
            result,
            Err(BackendError::LiveRangeSplitting { .. })
        ));
    }

    #[test]
    fn test_swap_loop_resolves_with_exchange() {
        // A loop that swaps two phi values every iteration: the parallel
        // copy on the back edge is a register cycle of length two.
        let mut f = Function::new("s");
        let b0 = f.add_block();
        let b1 = f.add_block();
        let b2 = f.add_block();
        let one = f.append_generic(b0, InstKind::LoadConst { value: 1 }, &[], Type::Int32);
        let two = f.append_generic(b0, InstKind::LoadConst { value: 2 }, &[], Type::Int32);
        let pa = f.add_data_flow_phi(b1, Type::Int32);
        let pb = f.add_data_flow_phi(b1, Type::Int32);
        f.add_data_flow_edge(b0, pa, one);
        f.add_data_flow_edge(b0, pb, two);
        f.set_branch(b0, Branch::Unconditional { target: b1 });

        let a = f.phi_value(pa);
        let b = f.phi_value(pb);
        let mask = f.append_generic(b1, InstKind::LoadConst { value: 1 }, &[], Type::Int32);
        let test = f.append_generic(
            b1,
            InstKind::BinaryMath {
                op: crate::ir::BinaryMathOp::BitwiseAnd,
            },
            &[a, mask],
            Type::Int32,
        );
        f.add_data_flow_edge(b1, pa, b);
        f.add_data_flow_edge(b1, pb, a);
        let pr = f.add_data_flow_phi(b2, Type::Int32);
        f.add_data_flow_edge(b1, pr, a);
        f.set_branch(
            b1,
            Branch::Conditional {
                operand: test,
                if_target: b1,
                else_target: b2,
            },
        );
        let r = f.phi_value(pr);
        f.set_branch(b2, Branch::FunctionReturn { operands: vec![r] });

        lower_function(&mut f);
        allocate(&mut f);

        // The two phis overlap, so they hold distinct registers, and the
        // back-edge swap must come out as a single exchange.
        assert_ne!(f.value(a).register(), f.value(b).register());
        let exchanges = f
            .block(b1)
            .instructions()
            .iter()
            .filter(|i| matches!(f.inst_kind(**i), InstKind::XchgMR))
            .count();
        assert_eq!(exchanges, 1);
    }

    #[test]
    fn test_call_pins_arguments_and_result() {
        let mut f = Function::new("k");
        let b = f.add_block();
        let pp = f.add_argument_phi(b, 0, Type::Pointer);
        let p = f.phi_value(pp);
        let zero = f.append_generic(b, InstKind::LoadConst { value: 0 }, &[], Type::Int32);
        let ret = f.append_generic(
            b,
            InstKind::Invoke {
                function: "__mmio_read32".to_string(),
            },
            &[p, zero],
            Type::Int32,
        );
        f.set_branch(b, Branch::FunctionReturn { operands: vec![ret] });
        lower_function(&mut f);
        allocate(&mut f);

        for inst in f.block(b).instructions() {
            if let InstKind::Call { .. } = f.inst_kind(*inst) {
                let data = f.inst(*inst);
                assert_eq!(f.value(data.operands()[0]).register(), Some(RDI));
                assert_eq!(f.value(data.operands()[1]).register(), Some(RSI));
                assert_eq!(f.value(data.result()).register(), Some(RAX));
            }
        }
        // A call forces the alignment frame.
        assert!(f
            .block(b)
            .instructions()
            .iter()
            .any(|i| matches!(f.inst_kind(*i), InstKind::DecrementStack { amount: 8 })));
    }
}
