//! The file emitter: serialises the laid-out object into the final ELF
//! byte image in one forward pass.

use crate::elf::consts::*;
use crate::elf::layout::hash_table_words;
use crate::elf::object::{FragmentId, FragmentKind, Object};
use crate::error::{BackendError, BackendResult};
use crate::util::ByteEncoder;

pub struct FileEmitter<'o> {
    object: &'o Object,
    buffer: Vec<u8>,
}

impl<'o> FileEmitter<'o> {
    pub fn new(object: &'o Object) -> Self {
        Self {
            object,
            buffer: Vec::new(),
        }
    }

    /// The emitted image. Valid after [`run`](Self::run).
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn run(&mut self) -> BackendResult<()> {
        self.emit_ehdr();
        for id in self.object.emission_order() {
            self.pad_to(self.object.fragment(id).file_offset.expect("fragment without offset"))?;
            match self.object.fragment(id).kind {
                FragmentKind::Phdrs => self.emit_phdrs(),
                FragmentKind::Shdrs => self.emit_shdrs(),
                FragmentKind::Dynamic => self.emit_dynamic(),
                FragmentKind::StringTable => self.emit_string_table(),
                FragmentKind::SymbolTable => self.emit_symbol_table(),
                FragmentKind::Relocation => self.emit_relocation_table(),
                FragmentKind::Hash => self.emit_hash(),
                FragmentKind::Byte => {
                    let section = self.object.fragment(id);
                    self.buffer.extend_from_slice(&section.buffer);
                }
            }
        }
        Ok(())
    }

    fn pad_to(&mut self, offset: u64) -> BackendResult<()> {
        if (self.buffer.len() as u64) > offset {
            return Err(BackendError::LayoutViolation {
                reason: format!(
                    "emission cursor {:#x} past fragment offset {:#x}",
                    self.buffer.len(),
                    offset
                ),
            });
        }
        self.buffer.resize(offset as usize, 0);
        Ok(())
    }

    fn fragment_field(&self, id: Option<FragmentId>, f: impl Fn(&crate::elf::Fragment) -> u64) -> u64 {
        f(self.object.fragment(id.expect("well-known fragment missing")))
    }

    fn emit_ehdr(&mut self) {
        let phoff = self.fragment_field(self.object.phdrs_fragment, |f| f.file_offset.unwrap());
        let shoff = self.fragment_field(self.object.shdrs_fragment, |f| f.file_offset.unwrap());
        let shstrndx = self.fragment_field(self.object.string_table_fragment, |f| {
            f.designated_index.unwrap() as u64
        });

        let mut enc = ByteEncoder::new(&mut self.buffer);
        enc.encode8(0x7F);
        enc.encode_chars("ELF");
        enc.encode8(ELFCLASS64);
        enc.encode8(ELFDATA2LSB);
        enc.encode8(EV_CURRENT);
        enc.encode8(ELFOSABI_SYSV);
        enc.encode8(0); // ABI version; not defined for the SysV ABI.
        for _ in 9..EI_NIDENT {
            enc.encode8(0);
        }
        enc.encode16(ET_DYN);
        enc.encode16(EM_X86_64);
        enc.encode32(1); // e_version
        enc.encode64(0); // e_entry
        enc.encode64(phoff);
        enc.encode64(shoff);
        enc.encode32(0); // e_flags
        enc.encode16(EHDR_SIZE as u16);
        enc.encode16(PHDR_SIZE as u16);
        enc.encode16(self.object.number_of_fragments() as u16 + 1);
        enc.encode16(SHDR_SIZE as u16);
        enc.encode16(1 + self.object.number_of_sections() as u16);
        enc.encode16(shstrndx as u16);
        debug_assert_eq!(enc.offset(), EHDR_SIZE as usize);
    }

    fn program_flags(flags: u64) -> u32 {
        let mut p = PF_R;
        if flags & SHF_EXECINSTR != 0 {
            p |= PF_X;
        }
        if flags & SHF_WRITE != 0 {
            p |= PF_W;
        }
        p
    }

    /// One `PT_LOAD` per fragment in emission order plus one trailing
    /// `PT_DYNAMIC`. Coalescing adjacent loads is a known follow-up; the
    /// redundant form is kept deliberately.
    fn emit_phdrs(&mut self) {
        let order = self.object.emission_order();
        let mut enc = ByteEncoder::new(&mut self.buffer);
        for id in order {
            let fragment = self.object.fragment(id);
            enc.encode32(PT_LOAD);
            enc.encode32(Self::program_flags(fragment.flags));
            enc.encode64(fragment.file_offset.unwrap());
            enc.encode64(fragment.virtual_address.unwrap());
            enc.encode64(0); // p_paddr
            enc.encode64(fragment.computed_size.unwrap());
            enc.encode64(fragment.computed_size.unwrap());
            enc.encode64(0x1000);
        }
        let dynamic = self
            .object
            .fragment(self.object.dynamic_fragment.expect("dynamic fragment missing"));
        enc.encode32(PT_DYNAMIC);
        enc.encode32(PF_R | PF_W);
        enc.encode64(dynamic.file_offset.unwrap());
        enc.encode64(dynamic.virtual_address.unwrap());
        enc.encode64(0);
        enc.encode64(dynamic.computed_size.unwrap());
        enc.encode64(dynamic.computed_size.unwrap());
        enc.encode64(8);
    }

    fn emit_shdrs(&mut self) {
        let order = self.object.emission_order();
        let mut enc = ByteEncoder::new(&mut self.buffer);
        // Index zero is the SHN_UNDEF entry.
        for _ in 0..SHDR_SIZE / 8 {
            enc.encode64(0);
        }
        for id in order {
            let fragment = self.object.fragment(id);
            if !fragment.is_section() {
                continue;
            }
            let name = fragment
                .name
                .map(|n| {
                    self.object
                        .string(n)
                        .designated_offset
                        .expect("string table layout must be fixed for the file emitter")
                })
                .unwrap_or(0);
            let link = fragment
                .section_link
                .map(|l| self.object.fragment(l).designated_index.unwrap() as u32)
                .unwrap_or(0);
            enc.encode32(name as u32);
            enc.encode32(fragment.section_type);
            enc.encode64(fragment.flags);
            enc.encode64(fragment.virtual_address.unwrap());
            enc.encode64(fragment.file_offset.unwrap());
            enc.encode64(fragment.computed_size.unwrap());
            enc.encode32(link);
            enc.encode32(fragment.section_info);
            enc.encode64(8); // sh_addralign
            enc.encode64(fragment.entry_size);
        }
    }

    fn emit_dynamic(&mut self) {
        let strtab = self.fragment_field(self.object.string_table_fragment, |f| {
            f.virtual_address.unwrap()
        });
        let symtab = self.fragment_field(self.object.symbol_table_fragment, |f| {
            f.virtual_address.unwrap()
        });
        let hash = self.fragment_field(self.object.hash_fragment, |f| f.virtual_address.unwrap());
        let jmprel = self.fragment_field(self.object.plt_relocation_fragment, |f| {
            f.virtual_address.unwrap()
        });
        let pltrelsz = self.fragment_field(self.object.plt_relocation_fragment, |f| {
            f.computed_size.unwrap()
        });

        let mut enc = ByteEncoder::new(&mut self.buffer);
        for (tag, value) in [
            (DT_STRTAB, strtab),
            (DT_SYMTAB, symtab),
            (DT_HASH, hash),
            (DT_JMPREL, jmprel),
            (DT_PLTRELSZ, pltrelsz),
            (DT_NULL, 0),
        ] {
            enc.encode64(tag);
            enc.encode64(value);
        }
    }

    fn emit_string_table(&mut self) {
        let mut enc = ByteEncoder::new(&mut self.buffer);
        enc.encode8(0); // Index zero names the empty string.
        for id in self.object.strings() {
            enc.encode_chars(&self.object.string(id).text);
            enc.encode8(0);
        }
    }

    fn emit_symbol_table(&mut self) {
        let mut enc = ByteEncoder::new(&mut self.buffer);
        // The null entry.
        for _ in 0..SYMBOL_SIZE / 8 {
            enc.encode64(0);
        }
        for id in self.object.symbols() {
            let symbol = self.object.symbol(id);
            let name = self
                .object
                .string(symbol.name)
                .designated_offset
                .expect("string table layout must be fixed for the file emitter");
            let (shndx, value) = match symbol.section {
                Some(section) => {
                    let fragment = self.object.fragment(section);
                    (
                        fragment.designated_index.unwrap() as u16,
                        fragment.virtual_address.unwrap() + symbol.value,
                    )
                }
                None => (0, 0),
            };
            enc.encode32(name as u32);
            enc.encode8(STB_GLOBAL << 4 | STT_FUNC);
            enc.encode8(0); // st_other
            enc.encode16(shndx);
            enc.encode64(value);
            enc.encode64(0); // st_size
        }
    }

    fn emit_relocation_table(&mut self) {
        let mut records = Vec::with_capacity(self.object.external_relocations().len());
        for relocation in self.object.external_relocations() {
            let section = self.object.fragment(relocation.section);
            let address = section.virtual_address.unwrap() + relocation.offset;
            let symbol_index = self
                .object
                .symbol(relocation.symbol)
                .designated_index
                .expect("symbol index must be designated for the file emitter")
                as u64;
            records.push((address, symbol_index));
        }
        let mut enc = ByteEncoder::new(&mut self.buffer);
        for (address, symbol_index) in records {
            enc.encode64(address);
            enc.encode64(symbol_index << 32 | R_X86_64_JUMP_SLOT as u64);
            enc.encode64(0); // r_addend
        }
    }

    fn emit_hash(&mut self) {
        let (buckets, chains) = hash_table_words(self.object);
        let mut enc = ByteEncoder::new(&mut self.buffer);
        enc.encode32(buckets.len() as u32);
        enc.encode32(chains.len() as u32);
        for word in buckets.iter().chain(chains.iter()) {
            enc.encode32(*word);
        }
    }
}
