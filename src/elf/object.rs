//! The ELF object model: fragments, pooled strings, symbols, relocation
//! pools, and the [`Object`] that owns them all.
//!
//! A fragment is anything that occupies space in the file; fragments at
//! or after [`FragmentKind::Byte`] in the kind ordering are sections and
//! receive a section-header-table index during layout. All references
//! between entities are ids into the object's pools, so replacing a
//! fragment rewrites every use at once.

/// Handle to a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId(pub usize);

/// Handle to a pooled string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(pub usize);

/// Handle to a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub usize);

/// Fragment classification. The discriminant order fixes the section
/// predicate: everything at or after `Byte` is a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FragmentKind {
    Phdrs,
    Shdrs,
    Byte,
    Dynamic,
    StringTable,
    SymbolTable,
    Relocation,
    Hash,
}

/// A unit of the output file.
#[derive(Debug)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub name: Option<StringId>,
    pub section_type: u32,
    pub flags: u64,
    /// 1-based section-header index; index 0 is the `SHN_UNDEF` slot.
    pub designated_index: Option<usize>,
    pub file_offset: Option<u64>,
    pub virtual_address: Option<u64>,
    pub computed_size: Option<u64>,
    /// `sh_link` target.
    pub section_link: Option<FragmentId>,
    pub section_info: u32,
    pub entry_size: u64,
    /// Contents of byte sections; empty for synthesised fragments.
    pub buffer: Vec<u8>,
}

impl Fragment {
    pub fn new(kind: FragmentKind) -> Self {
        Self {
            kind,
            name: None,
            section_type: 0,
            flags: 0,
            designated_index: None,
            file_offset: None,
            virtual_address: None,
            computed_size: None,
            section_link: None,
            section_info: 0,
            entry_size: 0,
            buffer: Vec::new(),
        }
    }

    pub fn is_section(&self) -> bool {
        self.kind >= FragmentKind::Byte
    }
}

/// A pooled string; its table offset is designated during layout.
#[derive(Debug)]
pub struct StringData {
    pub text: String,
    pub designated_offset: Option<u64>,
}

/// A symbol: name, optional defining section, and value within it.
#[derive(Debug)]
pub struct SymbolData {
    pub name: StringId,
    pub section: Option<FragmentId>,
    pub value: u64,
    /// 1-based symbol-table index; index 0 is the null entry.
    pub designated_index: Option<usize>,
}

/// A relocation record. External relocations are resolved by the dynamic
/// linker through `.rela.plt`; internal ones are patched by the back-end
/// once the layout is fixed.
#[derive(Debug)]
pub struct Relocation {
    pub section: FragmentId,
    pub offset: u64,
    pub symbol: SymbolId,
    pub addend: Option<i64>,
    pub designated_index: Option<usize>,
}

/// The object under construction: owner of all fragments, strings,
/// symbols, and relocations, with named slots for the well-known
/// fragments.
#[derive(Debug, Default)]
pub struct Object {
    fragments: Vec<Fragment>,
    strings: Vec<StringData>,
    symbols: Vec<SymbolData>,
    external_relocations: Vec<Relocation>,
    internal_relocations: Vec<Relocation>,

    pub phdrs_fragment: Option<FragmentId>,
    pub shdrs_fragment: Option<FragmentId>,
    pub dynamic_fragment: Option<FragmentId>,
    pub string_table_fragment: Option<FragmentId>,
    pub symbol_table_fragment: Option<FragmentId>,
    pub plt_relocation_fragment: Option<FragmentId>,
    pub hash_fragment: Option<FragmentId>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Fragments.
    // ------------------------------------------------------------------

    pub fn insert_fragment(&mut self, fragment: Fragment) -> FragmentId {
        let id = FragmentId(self.fragments.len());
        self.fragments.push(fragment);
        id
    }

    pub fn fragment(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id.0]
    }

    pub fn fragment_mut(&mut self, id: FragmentId) -> &mut Fragment {
        &mut self.fragments[id.0]
    }

    /// Replace a fragment's contents wholesale. Because all references
    /// are ids, every use observes the replacement.
    pub fn replace_fragment(&mut self, id: FragmentId, fragment: Fragment) {
        self.fragments[id.0] = fragment;
    }

    pub fn fragments(&self) -> impl Iterator<Item = FragmentId> {
        (0..self.fragments.len()).map(FragmentId)
    }

    pub fn number_of_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn number_of_sections(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_section()).count()
    }

    /// Emission order: the canonical header fragments lead (in fragment
    /// kind order), byte sections follow in insertion order.
    pub fn emission_order(&self) -> Vec<FragmentId> {
        let mut order: Vec<FragmentId> = self.fragments().collect();
        order.sort_by_key(|id| {
            let f = self.fragment(*id);
            let class = match f.kind {
                FragmentKind::Phdrs => 0,
                FragmentKind::Shdrs => 1,
                FragmentKind::Dynamic => 2,
                FragmentKind::StringTable => 3,
                FragmentKind::SymbolTable => 4,
                FragmentKind::Relocation => 5,
                FragmentKind::Hash => 6,
                FragmentKind::Byte => 7,
            };
            (class, id.0)
        });
        order
    }

    /// Find a byte section by its name.
    pub fn find_section_by_name(&self, name: &str) -> Option<FragmentId> {
        self.fragments().find(|id| {
            self.fragment(*id)
                .name
                .map(|n| self.string(n).text == name)
                .unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // Strings.
    // ------------------------------------------------------------------

    pub fn add_string(&mut self, text: impl Into<String>) -> StringId {
        let id = StringId(self.strings.len());
        self.strings.push(StringData {
            text: text.into(),
            designated_offset: None,
        });
        id
    }

    pub fn string(&self, id: StringId) -> &StringData {
        &self.strings[id.0]
    }

    pub fn string_mut(&mut self, id: StringId) -> &mut StringData {
        &mut self.strings[id.0]
    }

    pub fn strings(&self) -> impl Iterator<Item = StringId> {
        (0..self.strings.len()).map(StringId)
    }

    // ------------------------------------------------------------------
    // Symbols.
    // ------------------------------------------------------------------

    pub fn add_symbol(&mut self, name: StringId, section: Option<FragmentId>, value: u64) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        self.symbols.push(SymbolData {
            name,
            section,
            value,
            designated_index: None,
        });
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &SymbolData {
        &self.symbols[id.0]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut SymbolData {
        &mut self.symbols[id.0]
    }

    pub fn symbols(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len()).map(SymbolId)
    }

    pub fn number_of_symbols(&self) -> usize {
        self.symbols.len()
    }

    // ------------------------------------------------------------------
    // Relocations.
    // ------------------------------------------------------------------

    pub fn add_external_relocation(&mut self, relocation: Relocation) {
        self.external_relocations.push(relocation);
    }

    pub fn add_internal_relocation(&mut self, relocation: Relocation) {
        self.internal_relocations.push(relocation);
    }

    pub fn external_relocations(&self) -> &[Relocation] {
        &self.external_relocations
    }

    pub fn external_relocations_mut(&mut self) -> &mut [Relocation] {
        &mut self.external_relocations
    }

    pub fn internal_relocations(&self) -> &[Relocation] {
        &self.internal_relocations
    }

    /// Patch helper for the internal link pass: write a little-endian
    /// 32-bit value into a section buffer.
    pub fn patch32(&mut self, section: FragmentId, offset: u64, value: u32) {
        let buffer = &mut self.fragments[section.0].buffer;
        let offset = offset as usize;
        buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
