//! Machine-code emission: turns an allocated function into `.text`
//! bytes, `.got`/`.plt` entries, symbols, and relocations on the ELF
//! object.
//!
//! Every inter-function call indirects through a 6-byte PLT stub and a
//! GOT slot resolved by the dynamic linker; branch targets become
//! internal per-block symbols fixed up by the internal link pass.

use std::collections::HashMap;

use crate::elf::consts::{SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS};
use crate::elf::object::{Fragment, FragmentId, FragmentKind, Object, Relocation, SymbolId};
use crate::error::{BackendError, BackendResult};
use crate::ir::{BlockId, Branch, Function, InstId, InstKind, OperandSize, ValueId, ValueKind};
use crate::util::ByteEncoder;
use crate::x64::encoding::{MOperand, ModRmEncoding};

/// Per-function machine-code emitter.
pub struct MachineCodeEmitter<'f, 'o> {
    function: &'f Function,
    object: &'o mut Object,
    text: FragmentId,
    got: FragmentId,
    plt: FragmentId,
    block_symbols: HashMap<BlockId, SymbolId>,
    /// One PLT stub per distinct callee within this function.
    plt_symbols: HashMap<String, SymbolId>,
}

impl<'f, 'o> MachineCodeEmitter<'f, 'o> {
    pub fn new(function: &'f Function, object: &'o mut Object) -> Self {
        let text = ensure_section(object, ".text", SHF_ALLOC | SHF_EXECINSTR);
        let got = ensure_section(object, ".got", SHF_ALLOC);
        let plt = ensure_section(object, ".plt", SHF_ALLOC | SHF_EXECINSTR);
        Self {
            function,
            object,
            text,
            got,
            plt,
            block_symbols: HashMap::new(),
            plt_symbols: HashMap::new(),
        }
    }

    pub fn run(mut self) -> BackendResult<()> {
        log::debug!("emitting machine code for {}", self.function.name);

        // The function's global symbol plus one internal symbol per
        // basic block, fixed to its start offset as blocks are emitted.
        let name = self.object.add_string(self.function.name.clone());
        self.object.add_symbol(name, Some(self.text), self.text_offset());
        for block in self.function.blocks() {
            let name = self
                .object
                .add_string(format!("{}.bb{}", self.function.name, block.0));
            let symbol = self.object.add_symbol(name, Some(self.text), 0);
            self.block_symbols.insert(block, symbol);
        }

        for block in self.function.blocks().collect::<Vec<_>>() {
            let offset = self.text_offset();
            self.object.symbol_mut(self.block_symbols[&block]).value = offset;
            for inst in self.function.block(block).instructions() {
                self.emit_instruction(*inst)?;
            }
            self.emit_branch(block)?;
        }
        Ok(())
    }

    fn text_offset(&self) -> u64 {
        self.object.fragment(self.text).buffer.len() as u64
    }

    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.object
            .fragment_mut(self.text)
            .buffer
            .extend_from_slice(bytes);
    }

    fn encode(&mut self, encoding: ModRmEncoding, opcode: &[u8]) {
        let buffer = &mut self.object.fragment_mut(self.text).buffer;
        let mut enc = ByteEncoder::new(buffer);
        encoding.encode(&mut enc, opcode);
    }

    fn register_of(&self, value: ValueId) -> u8 {
        self.function
            .value(value)
            .register()
            .expect("emission requires allocated registers")
    }

    fn size_of(&self, value: ValueId) -> OperandSize {
        self.function.value(value).kind.size()
    }

    fn m_operand(&self, value: ValueId) -> MOperand {
        match self.function.value(value).kind {
            ValueKind::Register { register, .. } => {
                MOperand::Register(register.expect("emission requires allocated registers"))
            }
            ValueKind::BaseDispMemory {
                base_register,
                displacement,
                ..
            } => MOperand::BaseDisp {
                base: base_register.expect("emission requires allocated registers"),
                displacement,
            },
            ValueKind::Local { .. } => panic!("generic value reached the emitter"),
        }
    }

    fn emit_instruction(&mut self, inst: InstId) -> BackendResult<()> {
        let kind = self.function.inst_kind(inst).clone();
        let data = self.function.inst(inst);
        match kind {
            InstKind::MovMC { value } => {
                let result = data.result();
                let size = self.size_of(result);
                let m = self.m_operand(result);
                match (m, size) {
                    (MOperand::Register(reg), OperandSize::Dword) if reg < 8 => {
                        let imm = u32::try_from(value).map_err(|_| {
                            BackendError::UnsupportedEncoding {
                                reason: format!("constant {value:#x} exceeds 32 bits"),
                            }
                        })?;
                        self.emit_bytes(&[0xB8 + reg]);
                        self.emit_bytes(&imm.to_le_bytes());
                    }
                    _ => {
                        let imm = if size == OperandSize::Qword {
                            i32::try_from(value as i64).map_err(|_| {
                                BackendError::UnsupportedEncoding {
                                    reason: format!(
                                        "constant {value:#x} does not sign-extend from 32 bits"
                                    ),
                                }
                            })? as u32
                        } else {
                            u32::try_from(value).map_err(|_| BackendError::UnsupportedEncoding {
                                reason: format!("constant {value:#x} exceeds 32 bits"),
                            })?
                        };
                        self.encode(ModRmEncoding::with_extension(size, m, 0), &[0xC7]);
                        self.emit_bytes(&imm.to_le_bytes());
                    }
                }
            }
            InstKind::MovMR => {
                let source = data.operands()[0];
                let result = data.result();
                self.encode(
                    ModRmEncoding::with_register(
                        self.size_of(result),
                        self.m_operand(result),
                        self.register_of(source),
                    ),
                    &[0x89],
                );
            }
            InstKind::MovRM => {
                let source = data.operands()[0];
                let result = data.result();
                self.encode(
                    ModRmEncoding::with_register(
                        self.size_of(result),
                        self.m_operand(source),
                        self.register_of(result),
                    ),
                    &[0x8B],
                );
            }
            InstKind::XchgMR => {
                let first = data.operands()[0];
                let second = data.operands()[1];
                self.encode(
                    ModRmEncoding::with_register(
                        self.size_of(first),
                        self.m_operand(first),
                        self.register_of(second),
                    ),
                    &[0x87],
                );
            }
            InstKind::NegM => {
                let result = data.result();
                self.encode(
                    ModRmEncoding::with_extension(self.size_of(result), self.m_operand(result), 3),
                    &[0xF7],
                );
            }
            InstKind::AddMR => {
                let secondary = data.operands()[1];
                let result = data.result();
                self.encode(
                    ModRmEncoding::with_register(
                        self.size_of(result),
                        self.m_operand(result),
                        self.register_of(secondary),
                    ),
                    &[0x01],
                );
            }
            InstKind::AndMR => {
                let secondary = data.operands()[1];
                let result = data.result();
                self.encode(
                    ModRmEncoding::with_register(
                        self.size_of(result),
                        self.m_operand(result),
                        self.register_of(secondary),
                    ),
                    &[0x21],
                );
            }
            InstKind::Call { function } => {
                let target = self.plt_symbol(&function);
                self.emit_bytes(&[0xE8]);
                let site = self.text_offset();
                self.object.add_internal_relocation(Relocation {
                    section: self.text,
                    offset: site,
                    symbol: target,
                    addend: Some(-4),
                    designated_index: None,
                });
                self.emit_bytes(&[0, 0, 0, 0]);
            }
            InstKind::PushSave { register } => {
                if register < 8 {
                    self.emit_bytes(&[0x50 + register]);
                } else {
                    self.emit_bytes(&[0x41, 0xFF, 0xC0 | 6 << 3 | (register & 7)]);
                }
            }
            InstKind::PopRestore { register } => {
                if register < 8 {
                    self.emit_bytes(&[0x58 + register]);
                } else {
                    self.emit_bytes(&[0x41, 0x8F, 0xC0 | (register & 7)]);
                }
            }
            InstKind::DecrementStack { amount } => self.emit_stack_adjust(5, amount),
            InstKind::IncrementStack { amount } => self.emit_stack_adjust(0, amount),
            InstKind::DefineOffset { .. } | InstKind::Nop => {}
            other => {
                return Err(BackendError::UnexpectedInstruction {
                    stage: "emission",
                    kind: other.to_string(),
                })
            }
        }
        Ok(())
    }

    /// `SUB`/`ADD RSP, imm` via the group-1 opcode extension.
    fn emit_stack_adjust(&mut self, xop: u8, amount: i32) {
        if let Ok(imm) = i8::try_from(amount) {
            self.emit_bytes(&[0x48, 0x83, 0xC0 | xop << 3 | crate::x64::RSP, imm as u8]);
        } else {
            self.emit_bytes(&[0x48, 0x81, 0xC0 | xop << 3 | crate::x64::RSP]);
            self.emit_bytes(&(amount as u32).to_le_bytes());
        }
    }

    fn emit_branch(&mut self, block: BlockId) -> BackendResult<()> {
        let branch = self
            .function
            .block(block)
            .branch()
            .expect("block without terminator")
            .clone();
        match branch {
            Branch::Ret { .. } => {
                self.emit_bytes(&[0xC3]);
            }
            Branch::Jmp { target } => {
                self.emit_bytes(&[0xE9]);
                self.emit_block_fixup(target);
            }
            Branch::Jnz {
                operand,
                if_target,
                else_target,
            } => {
                let reg = self.register_of(operand);
                self.encode(
                    ModRmEncoding::with_register(
                        self.size_of(operand),
                        MOperand::Register(reg),
                        reg,
                    ),
                    &[0x85],
                );
                self.emit_bytes(&[0x0F, 0x85]);
                self.emit_block_fixup(if_target);
                self.emit_bytes(&[0xE9]);
                self.emit_block_fixup(else_target);
            }
            other => {
                return Err(BackendError::UnexpectedInstruction {
                    stage: "emission",
                    kind: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn emit_block_fixup(&mut self, target: BlockId) {
        let symbol = self.block_symbols[&target];
        let site = self.text_offset();
        self.object.add_internal_relocation(Relocation {
            section: self.text,
            offset: site,
            symbol,
            addend: Some(-4),
            designated_index: None,
        });
        self.emit_bytes(&[0, 0, 0, 0]);
    }

    /// GOT slot, PLT stub, and symbols for an external callee. The stub
    /// is `FF 25 disp32`, a rip-relative indirect jump through the slot.
    fn plt_symbol(&mut self, name: &str) -> SymbolId {
        if let Some(symbol) = self.plt_symbols.get(name) {
            return *symbol;
        }

        let string = self.object.add_string(name.to_string());
        let external = self.object.add_symbol(string, None, 0);

        let got_offset = self.object.fragment(self.got).buffer.len() as u64;
        self.object
            .fragment_mut(self.got)
            .buffer
            .extend_from_slice(&[0; 8]);
        self.object.add_external_relocation(Relocation {
            section: self.got,
            offset: got_offset,
            symbol: external,
            addend: None,
            designated_index: None,
        });
        let string = self.object.add_string(format!("{name}@got"));
        let got_symbol = self.object.add_symbol(string, Some(self.got), got_offset);

        let plt_offset = self.object.fragment(self.plt).buffer.len() as u64;
        self.object
            .fragment_mut(self.plt)
            .buffer
            .extend_from_slice(&[0xFF, 0x25, 0, 0, 0, 0]);
        self.object.add_internal_relocation(Relocation {
            section: self.plt,
            offset: plt_offset + 2,
            symbol: got_symbol,
            addend: Some(-4),
            designated_index: None,
        });
        let string = self.object.add_string(format!("{name}@plt"));
        let plt_symbol = self.object.add_symbol(string, Some(self.plt), plt_offset);

        self.plt_symbols.insert(name.to_string(), plt_symbol);
        plt_symbol
    }
}

/// Find or create one of the per-object byte sections.
fn ensure_section(object: &mut Object, name: &str, flags: u64) -> FragmentId {
    if let Some(existing) = object.find_section_by_name(name) {
        return existing;
    }
    let string = object.add_string(name.to_string());
    let mut fragment = Fragment::new(FragmentKind::Byte);
    fragment.name = Some(string);
    fragment.section_type = SHT_PROGBITS;
    fragment.flags = flags;
    object.insert_fragment(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::x64::alloc::AllocateRegisters;
    use crate::x64::lower::lower_function;
    use bumpalo::Bump;

    fn emit(function: &mut Function) -> (Object, Vec<u8>) {
        lower_function(function);
        let arena = Bump::new();
        AllocateRegisters::new(&arena, function).run().unwrap();
        let mut object = Object::new();
        MachineCodeEmitter::new(function, &mut object).run().unwrap();
        let text = object.find_section_by_name(".text").unwrap();
        let bytes = object.fragment(text).buffer.clone();
        (object, bytes)
    }

    #[test]
    fn test_minimal_ret() {
        let mut f = Function::new("f");
        let b = f.add_block();
        f.set_branch(b, Branch::FunctionReturn { operands: vec![] });
        let (_, bytes) = emit(&mut f);
        assert_eq!(bytes, [0xC3]);
    }

    #[test]
    fn test_constant_return() {
        let mut f = Function::new("f");
        let b = f.add_block();
        let c = f.append_generic(b, InstKind::LoadConst { value: 0x2A }, &[], Type::Int32);
        f.set_branch(b, Branch::FunctionReturn { operands: vec![c] });
        let (_, bytes) = emit(&mut f);
        assert_eq!(bytes, [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
    }

    #[test]
    fn test_negate_argument() {
        let mut f = Function::new("g");
        let b = f.add_block();
        let phi = f.add_argument_phi(b, 0, Type::Int32);
        let x = f.phi_value(phi);
        let neg = f.append_generic(
            b,
            InstKind::UnaryMath {
                op: crate::ir::UnaryMathOp::Negate,
            },
            &[x],
            Type::Int32,
        );
        f.set_branch(b, Branch::FunctionReturn { operands: vec![neg] });
        let (_, bytes) = emit(&mut f);
        // mov eax, edi; neg eax; ret
        assert_eq!(bytes, [0x89, 0xF8, 0xF7, 0xD8, 0xC3]);
    }

    #[test]
    fn test_call_synthesises_got_and_plt() {
        let mut f = Function::new("k");
        let b = f.add_block();
        let phi = f.add_argument_phi(b, 0, Type::Pointer);
        let p = f.phi_value(phi);
        let r = f.append_generic(
            b,
            InstKind::Invoke {
                function: "__mmio_read32".to_string(),
            },
            &[p],
            Type::Int32,
        );
        f.set_branch(b, Branch::FunctionReturn { operands: vec![r] });
        let (object, bytes) = emit(&mut f);

        let plt = object.find_section_by_name(".plt").unwrap();
        assert_eq!(
            object.fragment(plt).buffer,
            [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]
        );
        let got = object.find_section_by_name(".got").unwrap();
        assert_eq!(object.fragment(got).buffer.len(), 8);
        assert_eq!(object.external_relocations().len(), 1);
        // Call site: E8 followed by a zeroed disp32 awaiting the
        // internal link pass.
        assert!(bytes.windows(5).any(|w| w == [0xE8, 0, 0, 0, 0]));
        // One internal relocation for the call, one for the stub.
        assert_eq!(object.internal_relocations().len(), 2);
    }

    #[test]
    fn test_block_symbols_cover_every_block() {
        let mut f = Function::new("j");
        let b0 = f.add_block();
        let b1 = f.add_block();
        f.set_branch(b0, Branch::Unconditional { target: b1 });
        f.set_branch(b1, Branch::FunctionReturn { operands: vec![] });
        let (object, bytes) = emit(&mut f);
        // jmp disp32; ret
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(bytes[5], 0xC3);
        let names: Vec<String> = object
            .symbols()
            .map(|s| object.string(object.symbol(s).name).text.clone())
            .collect();
        assert!(names.contains(&"j".to_string()));
        assert!(names.contains(&"j.bb0".to_string()));
        assert!(names.contains(&"j.bb1".to_string()));
        // The second block's symbol points past the jmp.
        let bb1 = object
            .symbols()
            .find(|s| object.string(object.symbol(*s).name).text == "j.bb1")
            .unwrap();
        assert_eq!(object.symbol(bb1).value, 5);
    }
}
