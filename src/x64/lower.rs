//! Lowering from the generic IR to the x86-64 architecture IR.
//!
//! The pass works one basic block at a time: it rewrites every phi
//! result into a register-mode value, replaces every generic instruction
//! by one or more x86 instructions, and swaps the terminator for its x86
//! counterpart. Each rewrite preserves SSA by routing the old result's
//! uses to the new result via `replace_all_uses`.

use crate::ir::{BinaryMathOp, BlockId, Branch, Function, InstKind, UnaryMathOp, ValueId, ValueKind};

/// Per-block lowering pass.
pub struct LowerCode<'f> {
    function: &'f mut Function,
    block: BlockId,
}

impl<'f> LowerCode<'f> {
    pub fn new(function: &'f mut Function, block: BlockId) -> Self {
        Self { function, block }
    }

    pub fn run(mut self) {
        log::debug!(
            "lowering block {} of {}",
            self.block.0,
            self.function.name
        );
        self.lower_phis();
        self.lower_instructions();
        self.lower_branch();
    }

    /// Size of a generic value, derived from its type.
    fn size_of(&self, value: ValueId) -> crate::ir::OperandSize {
        match &self.function.value(value).kind {
            ValueKind::Local { ty } => ty.operand_size(),
            kind => kind.size(),
        }
    }

    fn lower_phis(&mut self) {
        for phi in self.function.block(self.block).phis().to_vec() {
            let value = self.function.phi_value(phi);
            let size = self.size_of(value);
            self.function.set_value_kind(
                value,
                ValueKind::Register {
                    size,
                    register: None,
                },
            );
        }
    }

    fn lower_instructions(&mut self) {
        let mut at = 0;
        while at < self.function.block(self.block).instructions().len() {
            let inst = self.function.block(self.block).instructions()[at];
            let kind = self.function.inst_kind(inst).clone();
            match kind {
                InstKind::LoadConst { value } => {
                    let old = self.function.inst(inst).result();
                    let size = self.size_of(old);
                    self.function.remove_instruction(self.block, at);
                    let new = self.function.new_value(ValueKind::Register {
                        size,
                        register: None,
                    });
                    self.function.insert_instruction(
                        self.block,
                        at,
                        InstKind::MovMC { value },
                        &[],
                        vec![new],
                    );
                    self.function.replace_all_uses(old, new);
                    at += 1;
                }
                InstKind::LoadOffset { offset } => {
                    let old = self.function.inst(inst).result();
                    let base = self.function.inst(inst).operands()[0];
                    let size = self.size_of(old);
                    self.function.remove_instruction(self.block, at);
                    let slot = self.function.new_value(ValueKind::BaseDispMemory {
                        size,
                        base_register: None,
                        displacement: offset,
                    });
                    self.function.insert_instruction(
                        self.block,
                        at,
                        InstKind::DefineOffset {
                            displacement: offset,
                        },
                        &[base],
                        vec![slot],
                    );
                    let loaded = self.function.new_value(ValueKind::Register {
                        size,
                        register: None,
                    });
                    self.function.insert_instruction(
                        self.block,
                        at + 1,
                        InstKind::MovRM,
                        &[slot],
                        vec![loaded],
                    );
                    self.function.replace_all_uses(old, loaded);
                    at += 2;
                }
                InstKind::UnaryMath { op } => {
                    let old = self.function.inst(inst).result();
                    let operand = self.function.inst(inst).operands()[0];
                    let size = self.size_of(old);
                    self.function.remove_instruction(self.block, at);
                    let new = self.function.new_value(ValueKind::Register {
                        size,
                        register: None,
                    });
                    let lowered = match op {
                        UnaryMathOp::Negate => InstKind::NegM,
                    };
                    self.function
                        .insert_instruction(self.block, at, lowered, &[operand], vec![new]);
                    self.function.replace_all_uses(old, new);
                    at += 1;
                }
                InstKind::BinaryMath { op } => {
                    let old = self.function.inst(inst).result();
                    let left = self.function.inst(inst).operands()[0];
                    let right = self.function.inst(inst).operands()[1];
                    let size = self.size_of(old);
                    self.function.remove_instruction(self.block, at);
                    let new = self.function.new_value(ValueKind::Register {
                        size,
                        register: None,
                    });
                    let lowered = match op {
                        BinaryMathOp::Add => InstKind::AddMR,
                        BinaryMathOp::BitwiseAnd => InstKind::AndMR,
                    };
                    self.function
                        .insert_instruction(self.block, at, lowered, &[left, right], vec![new]);
                    self.function.replace_all_uses(old, new);
                    at += 1;
                }
                InstKind::Invoke { function } => {
                    let old = self.function.inst(inst).result();
                    let operands = self.function.inst(inst).operands().to_vec();
                    let size = self.size_of(old);
                    self.function.remove_instruction(self.block, at);
                    let new = self.function.new_value(ValueKind::Register {
                        size,
                        register: None,
                    });
                    self.function.insert_instruction(
                        self.block,
                        at,
                        InstKind::Call { function },
                        &operands,
                        vec![new],
                    );
                    self.function.replace_all_uses(old, new);
                    at += 1;
                }
                other => panic!("unexpected generic IR instruction: {other}"),
            }
        }
    }

    fn lower_branch(&mut self) {
        let branch = self
            .function
            .block(self.block)
            .branch()
            .expect("block without terminator")
            .clone();
        let lowered = match branch {
            Branch::FunctionReturn { operands } => Branch::Ret { operands },
            Branch::Unconditional { target } => Branch::Jmp { target },
            Branch::Conditional {
                operand,
                if_target,
                else_target,
            } => Branch::Jnz {
                operand,
                if_target,
                else_target,
            },
            other => panic!("unexpected generic IR branch: {other}"),
        };
        self.function.set_branch(self.block, lowered);
    }
}

/// Lower every block of a function.
pub fn lower_function(function: &mut Function) {
    for block in function.blocks().collect::<Vec<_>>() {
        LowerCode::new(function, block).run();
    }
}
