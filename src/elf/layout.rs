//! The layout pass: fixes every fragment's size, file offset, and
//! virtual address, designates string-table offsets, symbol and
//! relocation indices, and section-header indices.
//!
//! Layout is deterministic and stateless on the metadata it computes:
//! running it twice yields identical results.

use crate::elf::consts::*;
use crate::elf::object::{FragmentId, FragmentKind, Object};
use crate::elf::{ceil2_power, elf_hash};

pub struct Layout<'o> {
    object: &'o mut Object,
}

impl<'o> Layout<'o> {
    pub fn new(object: &'o mut Object) -> Self {
        Self { object }
    }

    pub fn run(self) {
        let object = self.object;
        let order = object.emission_order();

        let mut offset: u64 = EHDR_SIZE;
        let mut address: u64 = EHDR_SIZE;
        let mut section_index = 0usize;

        for id in order {
            let size = Self::compute_size(object, id);
            let is_section = object.fragment(id).is_section();

            if is_section {
                // Sections are 8-byte aligned in the file and start on a
                // fresh page in memory, congruent to their file offset
                // modulo the page size.
                offset = (offset + 7) & !7;
                address = ((address + 0xFFF) & !0xFFF) + (offset & 0xFFF);
                section_index += 1;
            }

            log::debug!(
                "laying out fragment {:?} at {:#x}/{:#x}, size {:#x}",
                object.fragment(id).kind,
                offset,
                address,
                size
            );

            let fragment = object.fragment_mut(id);
            fragment.file_offset = Some(offset);
            fragment.virtual_address = Some(address);
            fragment.computed_size = Some(size);
            fragment.designated_index = is_section.then_some(section_index);

            offset += size;
            address += size;
        }
    }

    fn compute_size(object: &mut Object, id: FragmentId) -> u64 {
        match object.fragment(id).kind {
            FragmentKind::Phdrs => (object.number_of_fragments() as u64 + 1) * PHDR_SIZE,
            FragmentKind::Shdrs => (1 + object.number_of_sections() as u64) * SHDR_SIZE,
            FragmentKind::Dynamic => 6 * DYNAMIC_ENTRY_SIZE,
            FragmentKind::StringTable => {
                let mut size = 1;
                for string in object.strings().collect::<Vec<_>>() {
                    object.string_mut(string).designated_offset = Some(size);
                    size += object.string(string).text.len() as u64 + 1;
                }
                size
            }
            FragmentKind::SymbolTable => {
                for (index, symbol) in object.symbols().collect::<Vec<_>>().into_iter().enumerate()
                {
                    object.symbol_mut(symbol).designated_index = Some(index + 1);
                }
                (1 + object.number_of_symbols() as u64) * SYMBOL_SIZE
            }
            FragmentKind::Relocation => {
                let relocations = object.external_relocations_mut();
                for (index, relocation) in relocations.iter_mut().enumerate() {
                    relocation.designated_index = Some(index);
                }
                relocations.len() as u64 * RELA_SIZE
            }
            FragmentKind::Hash => {
                let symbol_count = object.number_of_symbols();
                let bucket_count = ceil2_power(symbol_count);
                (2 + bucket_count as u64 + symbol_count as u64 + 1) * 4
            }
            FragmentKind::Byte => object.fragment(id).buffer.len() as u64,
        }
    }
}

/// Hash-table geometry shared between layout and file emission.
pub(crate) fn hash_table_words(object: &Object) -> (Vec<u32>, Vec<u32>) {
    let symbol_count = object.number_of_symbols();
    let bucket_count = ceil2_power(symbol_count);
    let mut buckets = vec![0u32; bucket_count];
    let mut chains = vec![0u32; symbol_count + 1];
    for symbol in object.symbols() {
        let data = object.symbol(symbol);
        let index = data
            .designated_index
            .expect("symbol index must be designated before hashing") as u32;
        let hash = elf_hash(&object.string(data.name).text) as usize % bucket_count;
        chains[index as usize] = buckets[hash];
        buckets[hash] = index;
    }
    (buckets, chains)
}
