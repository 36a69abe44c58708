//! The driver sequence: lowering, allocation, and emission per function,
//! then the ELF passes over the shared object.

use bumpalo::Bump;

use crate::elf::{CreateHeaders, FileEmitter, InternalLink, Layout, Object};
use crate::error::BackendResult;
use crate::ir::Function;
use crate::x64::{AllocateRegisters, LowerCode, MachineCodeEmitter};

/// Compile a set of functions into a complete `ET_DYN` byte image.
pub fn compile(functions: &mut [Function]) -> BackendResult<Vec<u8>> {
    let mut object = Object::new();

    for function in functions.iter_mut() {
        for block in function.blocks().collect::<Vec<_>>() {
            LowerCode::new(function, block).run();
        }
        let arena = Bump::new();
        AllocateRegisters::new(&arena, function).run()?;
        MachineCodeEmitter::new(function, &mut object).run()?;
    }

    CreateHeaders::new(&mut object).run();
    Layout::new(&mut object).run();
    InternalLink::new(&mut object).run();

    let mut emitter = FileEmitter::new(&object);
    emitter.run()?;
    Ok(emitter.into_bytes())
}
