//! End-to-end pipeline scenarios: build generic IR, compile to an ELF
//! image, then check the emitted machine code and object inventory.
//!
//! The emitted image is re-parsed with the `object` crate and `.text` is
//! decoded with `iced-x86` as an independent oracle for the hand-rolled
//! encoders.

use elfsmith::ir::{BinaryMathOp, Branch, Function, InstKind, Type, UnaryMathOp};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};
use object::{Object as _, ObjectSection as _, ObjectSymbol as _};

fn compile(function: Function) -> Vec<u8> {
    elfsmith::compile(&mut [function]).expect("compilation failed")
}

fn text_of(image: &[u8]) -> Vec<u8> {
    let file = object::File::parse(image).expect("emitted image must parse");
    let section = file.section_by_name(".text").expect(".text missing");
    section.data().unwrap().to_vec()
}

fn decode_at(data: &[u8], ip: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, data, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    while decoder.can_decode() {
        instructions.push(decoder.decode());
    }
    instructions
}

fn decode(data: &[u8]) -> Vec<Instruction> {
    decode_at(data, 0)
}

#[test]
fn minimal_ret() {
    let mut f = Function::new("f");
    let b = f.add_block();
    f.set_branch(b, Branch::FunctionReturn { operands: vec![] });
    let image = compile(f);
    assert_eq!(text_of(&image), [0xC3]);
}

#[test]
fn constant_return() {
    let mut f = Function::new("f");
    let b = f.add_block();
    let c = f.append_generic(b, InstKind::LoadConst { value: 0x2A }, &[], Type::Int32);
    f.set_branch(b, Branch::FunctionReturn { operands: vec![c] });
    let image = compile(f);
    assert_eq!(text_of(&image), [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
}

#[test]
fn negate_argument() {
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
    let image = compile(f);

    let decoded = decode(&text_of(&image));
    let mnemonics: Vec<Mnemonic> = decoded.iter().map(|i| i.mnemonic()).collect();
    assert_eq!(mnemonics, [Mnemonic::Mov, Mnemonic::Neg, Mnemonic::Ret]);
    assert_eq!(decoded[0].op0_register(), Register::EAX);
    assert_eq!(decoded[0].op1_register(), Register::EDI);
    assert_eq!(decoded[1].op0_register(), Register::EAX);
}

#[test]
fn add_two_arguments() {
    let mut f = Function::new("h");
    let b = f.add_block();
    let pa = f.add_argument_phi(b, 0, Type::Int32);
    let pb = f.add_argument_phi(b, 1, Type::Int32);
    let a = f.phi_value(pa);
    let c = f.phi_value(pb);
    let sum = f.append_generic(
        b,
        InstKind::BinaryMath {
            op: BinaryMathOp::Add,
        },
        &[a, c],
        Type::Int32,
    );
    f.set_branch(b, Branch::FunctionReturn { operands: vec![sum] });
    let image = compile(f);

    let decoded = decode(&text_of(&image));
    // The copy out of ESI may or may not fuse; the essential shape is a
    // move into the accumulator, one add, and the return.
    assert_eq!(decoded.first().unwrap().mnemonic(), Mnemonic::Mov);
    assert_eq!(decoded.first().unwrap().op0_register(), Register::EAX);
    assert_eq!(decoded.first().unwrap().op1_register(), Register::EDI);
    assert_eq!(decoded.last().unwrap().mnemonic(), Mnemonic::Ret);
    let adds: Vec<&Instruction> = decoded
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Add)
        .collect();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].op0_register(), Register::EAX);
    // Result lands in EAX and nothing clobbers it before the return.
    assert!(decoded
        .iter()
        .all(|i| i.mnemonic() != Mnemonic::Call && i.mnemonic() != Mnemonic::Pop));
}

#[test]
fn external_call_object_inventory() {
    let mut f = Function::new("k");
    let b = f.add_block();
    let pp = f.add_argument_phi(b, 0, Type::Pointer);
    let p = f.phi_value(pp);
    let zero = f.append_generic(b, InstKind::LoadConst { value: 0 }, &[], Type::Int32);
    let r = f.append_generic(
        b,
        InstKind::Invoke {
            function: "__mmio_read32".to_string(),
        },
        &[p, zero],
        Type::Int32,
    );
    f.set_branch(b, Branch::FunctionReturn { operands: vec![r] });
    let image = compile(f);

    let file = object::File::parse(&image[..]).unwrap();

    // Global symbol for the function itself, defined in .text.
    let text = file.section_by_name(".text").unwrap();
    let k = file.symbols().find(|s| s.name() == Ok("k")).unwrap();
    assert_eq!(k.address(), text.address());

    // Undefined dynamic symbol for the callee.
    let callee = file
        .symbols()
        .find(|s| s.name() == Ok("__mmio_read32"))
        .unwrap();
    assert_eq!(callee.address(), 0);

    // A 6-byte PLT stub indirecting through the GOT.
    let plt = file.section_by_name(".plt").unwrap();
    let got = file.section_by_name(".got").unwrap();
    let plt_data = plt.data().unwrap();
    assert_eq!(plt_data.len(), 6);
    assert_eq!(&plt_data[..2], &[0xFF, 0x25]);
    // The stub's resolved disp32 reaches the GOT slot.
    let disp = i32::from_le_bytes(plt_data[2..6].try_into().unwrap()) as i64;
    assert_eq!(plt.address() as i64 + 6 + disp, got.address() as i64);

    // Exactly one R_X86_64_JUMP_SLOT against the callee, at the slot.
    let rela = file.section_by_name(".rela.plt").unwrap();
    let rela_data = rela.data().unwrap();
    assert_eq!(rela_data.len(), 24);
    let r_offset = u64::from_le_bytes(rela_data[0..8].try_into().unwrap());
    let r_info = u64::from_le_bytes(rela_data[8..16].try_into().unwrap());
    let r_addend = u64::from_le_bytes(rela_data[16..24].try_into().unwrap());
    assert_eq!(r_offset, got.address());
    assert_eq!(r_info & 0xFFFF_FFFF, 7); // R_X86_64_JUMP_SLOT
    assert_eq!(r_info >> 32, callee.index().0 as u64);
    assert_eq!(r_addend, 0);

    // The call site's resolved disp32 reaches the PLT stub.
    let decoded = decode_at(text.data().unwrap(), text.address());
    let call = decoded
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Call)
        .expect("call missing");
    assert_eq!(call.near_branch_target(), plt.address());
}

#[test]
fn conditional_branch_lands_on_block_symbols() {
    // if (x & 23) return 7; else return 9;
    let mut f = Function::new("c");
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let phi = f.add_argument_phi(b0, 0, Type::Int32);
    let x = f.phi_value(phi);
    let mask = f.append_generic(b0, InstKind::LoadConst { value: 23 }, &[], Type::Int32);
    let masked = f.append_generic(
        b0,
        InstKind::BinaryMath {
            op: BinaryMathOp::BitwiseAnd,
        },
        &[x, mask],
        Type::Int32,
    );
    f.set_branch(
        b0,
        Branch::Conditional {
            operand: masked,
            if_target: b1,
            else_target: b2,
        },
    );
    let seven = f.append_generic(b1, InstKind::LoadConst { value: 7 }, &[], Type::Int32);
    f.set_branch(b1, Branch::FunctionReturn { operands: vec![seven] });
    let nine = f.append_generic(b2, InstKind::LoadConst { value: 9 }, &[], Type::Int32);
    f.set_branch(b2, Branch::FunctionReturn { operands: vec![nine] });
    let image = compile(f);

    let file = object::File::parse(&image[..]).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let decoded = decode_at(text.data().unwrap(), text.address());

    // Exactly one TEST / JNZ / JMP triplet.
    let count = |m: Mnemonic| decoded.iter().filter(|i| i.mnemonic() == m).count();
    assert_eq!(count(Mnemonic::Test), 1);
    assert_eq!(count(Mnemonic::Jne), 1);
    assert_eq!(count(Mnemonic::Jmp), 1);

    let symbol_address = |name: &str| {
        file.symbols()
            .find(|s| s.name() == Ok(name))
            .unwrap()
            .address()
    };
    let jne = decoded.iter().find(|i| i.mnemonic() == Mnemonic::Jne).unwrap();
    assert_eq!(jne.near_branch_target(), symbol_address("c.bb1"));
    let jmp = decoded.iter().find(|i| i.mnemonic() == Mnemonic::Jmp).unwrap();
    assert_eq!(jmp.near_branch_target(), symbol_address("c.bb2"));

    // Both targets return distinct constants.
    assert_eq!(count(Mnemonic::Ret), 2);
}

#[test]
fn diamond_phi_merges_in_one_register() {
    // r = cond ? 1 : 2, joined through a data-flow phi.
    let mut f = Function::new("d");
    let b0 = f.add_block();
    let b1 = f.add_block();
    let b2 = f.add_block();
    let b3 = f.add_block();
    let phi = f.add_argument_phi(b0, 0, Type::Int32);
    let cond = f.phi_value(phi);
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
    let image = compile(f);

    let file = object::File::parse(&image[..]).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let decoded = decode_at(text.data().unwrap(), text.address());

    // Both arms load their constant straight into the phi's register and
    // fall through to a plain ret in the join block.
    let loads: Vec<&Instruction> = decoded
        .iter()
        .filter(|i| {
            i.mnemonic() == Mnemonic::Mov && i.op_kind(1) == iced_x86::OpKind::Immediate32
        })
        .collect();
    let constants: Vec<u64> = loads.iter().map(|i| i.immediate(1)).collect();
    assert!(constants.contains(&1));
    assert!(constants.contains(&2));
    let first = loads[0].op0_register();
    assert!(loads.iter().all(|i| i.op0_register() == first));
    assert_eq!(decoded.last().unwrap().mnemonic(), Mnemonic::Ret);
}

#[test]
fn multiple_functions_share_the_text_section() {
    let mut f = Function::new("one");
    let b = f.add_block();
    let c = f.append_generic(b, InstKind::LoadConst { value: 1 }, &[], Type::Int32);
    f.set_branch(b, Branch::FunctionReturn { operands: vec![c] });

    let mut g = Function::new("two");
    let b = g.add_block();
    let c = g.append_generic(b, InstKind::LoadConst { value: 2 }, &[], Type::Int32);
    g.set_branch(b, Branch::FunctionReturn { operands: vec![c] });

    let image = elfsmith::compile(&mut [f, g]).unwrap();
    let file = object::File::parse(&image[..]).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let one = file.symbols().find(|s| s.name() == Ok("one")).unwrap();
    let two = file.symbols().find(|s| s.name() == Ok("two")).unwrap();
    assert_eq!(one.address(), text.address());
    assert_eq!(two.address(), text.address() + 6);
    // mov eax, 1; ret; mov eax, 2; ret
    assert_eq!(
        text.data().unwrap(),
        [0xB8, 1, 0, 0, 0, 0xC3, 0xB8, 2, 0, 0, 0, 0xC3]
    );
}
