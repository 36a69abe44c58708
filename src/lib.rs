//! elfsmith - an ahead-of-time x86-64 compiler back-end.
//!
//! The crate ingests an in-memory SSA IR of one or more functions and
//! emits a position-independent x86-64 ELF shared object with machine
//! code, relocations, a dynamic symbol table, and a SysV hash table.
//!
//! # Pipeline
//!
//! ```ignore
//! use elfsmith::ir::{Branch, Function, InstKind, Type};
//!
//! let mut f = Function::new("f");
//! let b = f.add_block();
//! let c = f.append_generic(b, InstKind::LoadConst { value: 42 }, &[], Type::Int32);
//! f.set_branch(b, Branch::FunctionReturn { operands: vec![c] });
//!
//! let image = elfsmith::compile(&mut [f])?;
//! std::fs::write("out.so", image)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - generic and x86 SSA IR: values, uses, instructions, phis,
//!   branches, blocks, functions
//! - [`x64`] - lowering, live-interval register allocation, byte-level
//!   encoding, machine-code emission
//! - [`elf`] - the fragment-based object model and the header, layout,
//!   internal-link, and file-emission passes

pub mod elf;
pub mod error;
pub mod ir;
pub mod pipeline;
pub mod util;
pub mod x64;

pub use error::{BackendError, BackendResult};
pub use pipeline::compile;
