//! The internal link pass: resolves back-end-owned relocations once the
//! layout has fixed every virtual address.
//!
//! Only the PC-relative 32-bit shape is supported; that covers every
//! fix-up the machine-code emitter produces (branch targets, call sites,
//! and PLT-to-GOT displacements).

use crate::elf::object::Object;

pub struct InternalLink<'o> {
    object: &'o mut Object,
}

impl<'o> InternalLink<'o> {
    pub fn new(object: &'o mut Object) -> Self {
        Self { object }
    }

    pub fn run(self) {
        log::debug!(
            "internal link: {} relocations",
            self.object.internal_relocations().len()
        );
        let mut patches = Vec::with_capacity(self.object.internal_relocations().len());
        for relocation in self.object.internal_relocations() {
            let section = self.object.fragment(relocation.section);
            let section_address = section
                .virtual_address
                .expect("section layout must be fixed before internal linking");
            let relocation_address = section_address + relocation.offset;

            let symbol = self.object.symbol(relocation.symbol);
            let symbol_section = self
                .object
                .fragment(symbol.section.expect("internal relocation against undefined symbol"));
            let symbol_address = symbol_section
                .virtual_address
                .expect("section layout must be fixed before internal linking")
                + symbol.value;

            let value = symbol_address as i64 - relocation_address as i64
                + relocation.addend.unwrap_or(0);
            patches.push((relocation.section, relocation.offset, value as u32));
        }
        for (section, offset, value) in patches {
            self.object.patch32(section, offset, value);
        }
    }
}
