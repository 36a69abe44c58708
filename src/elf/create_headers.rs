//! Installation of the canonical leading fragments.

use crate::elf::consts::*;
use crate::elf::object::{Fragment, FragmentKind, Object};

/// Inserts the fixed header fragments and the linking-view sections:
/// program headers, section headers, `.dynamic`, `.strtab`, `.symtab`,
/// `.rela.plt`, and `.hash`. Emission order places these ahead of any
/// byte sections regardless of when the machine-code emitter created the
/// latter.
pub struct CreateHeaders<'o> {
    object: &'o mut Object,
}

impl<'o> CreateHeaders<'o> {
    pub fn new(object: &'o mut Object) -> Self {
        Self { object }
    }

    pub fn run(self) {
        let object = self.object;

        let phdrs = object.insert_fragment(Fragment::new(FragmentKind::Phdrs));
        object.phdrs_fragment = Some(phdrs);

        let shdrs = object.insert_fragment(Fragment::new(FragmentKind::Shdrs));
        object.shdrs_fragment = Some(shdrs);

        let name = object.add_string(".dynamic");
        let mut dynamic = Fragment::new(FragmentKind::Dynamic);
        dynamic.name = Some(name);
        dynamic.section_type = SHT_DYNAMIC;
        dynamic.flags = SHF_ALLOC | SHF_WRITE;
        dynamic.entry_size = DYNAMIC_ENTRY_SIZE;
        let dynamic = object.insert_fragment(dynamic);
        object.dynamic_fragment = Some(dynamic);

        let name = object.add_string(".strtab");
        let mut strtab = Fragment::new(FragmentKind::StringTable);
        strtab.name = Some(name);
        strtab.section_type = SHT_STRTAB;
        strtab.flags = SHF_ALLOC;
        let strtab = object.insert_fragment(strtab);
        object.string_table_fragment = Some(strtab);

        let name = object.add_string(".symtab");
        let mut symtab = Fragment::new(FragmentKind::SymbolTable);
        symtab.name = Some(name);
        symtab.section_type = SHT_SYMTAB;
        symtab.flags = SHF_ALLOC;
        symtab.section_link = Some(strtab);
        symtab.section_info = 1;
        symtab.entry_size = SYMBOL_SIZE;
        let symtab = object.insert_fragment(symtab);
        object.symbol_table_fragment = Some(symtab);

        let name = object.add_string(".rela.plt");
        let mut rela = Fragment::new(FragmentKind::Relocation);
        rela.name = Some(name);
        rela.section_type = SHT_RELA;
        rela.flags = SHF_ALLOC;
        rela.section_link = Some(symtab);
        rela.entry_size = RELA_SIZE;
        let rela = object.insert_fragment(rela);
        object.plt_relocation_fragment = Some(rela);

        let name = object.add_string(".hash");
        let mut hash = Fragment::new(FragmentKind::Hash);
        hash.name = Some(name);
        hash.section_type = SHT_HASH;
        hash.flags = SHF_ALLOC;
        hash.section_link = Some(symtab);
        let hash = object.insert_fragment(hash);
        object.hash_fragment = Some(hash);
    }
}
