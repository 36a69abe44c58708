//! Thin driver shell: builds a small demo module and writes the emitted
//! shared object to disk.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use elfsmith::ir::{BinaryMathOp, Branch, Function, InstKind, Type, UnaryMathOp};

#[derive(Parser)]
#[command(about = "Compile a built-in demo module to an ELF shared object")]
struct Args {
    /// Output path for the shared object.
    #[arg(short, long, default_value = "demo.so")]
    output: PathBuf,
}

/// `neg32(x) = -x`
fn build_neg32() -> Function {
    let mut f = Function::new("neg32");
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

/// `mask_add(a, b) = (a & 0x7FFF) + b`
fn build_mask_add() -> Function {
    let mut f = Function::new("mask_add");
    let b = f.add_block();
    let pa = f.add_argument_phi(b, 0, Type::Int32);
    let pb = f.add_argument_phi(b, 1, Type::Int32);
    let a = f.phi_value(pa);
    let c = f.phi_value(pb);
    let mask = f.append_generic(b, InstKind::LoadConst { value: 0x7FFF }, &[], Type::Int32);
    let masked = f.append_generic(
        b,
        InstKind::BinaryMath {
            op: BinaryMathOp::BitwiseAnd,
        },
        &[a, mask],
        Type::Int32,
    );
    let sum = f.append_generic(
        b,
        InstKind::BinaryMath {
            op: BinaryMathOp::Add,
        },
        &[masked, c],
        Type::Int32,
    );
    f.set_branch(b, Branch::FunctionReturn { operands: vec![sum] });
    f
}

/// `read_slot(p) = __mmio_read32(p, 0)`
fn build_read_slot() -> Function {
    let mut f = Function::new("read_slot");
    let b = f.add_block();
    let pp = f.add_argument_phi(b, 0, Type::Pointer);
    let p = f.phi_value(pp);
    let zero = f.append_generic(b, InstKind::LoadConst { value: 0 }, &[], Type::Int32);
    let value = f.append_generic(
        b,
        InstKind::Invoke {
            function: "__mmio_read32".to_string(),
        },
        &[p, zero],
        Type::Int32,
    );
    f.set_branch(b, Branch::FunctionReturn { operands: vec![value] });
    f
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut functions = vec![build_neg32(), build_mask_add(), build_read_slot()];
    let image = match elfsmith::compile(&mut functions) {
        Ok(image) => image,
        Err(error) => {
            eprintln!("compilation failed: {error}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = std::fs::write(&args.output, &image) {
        eprintln!("could not write {}: {error}", args.output.display());
        return ExitCode::FAILURE;
    }
    println!("wrote {} ({} bytes)", args.output.display(), image.len());
    ExitCode::SUCCESS
}
