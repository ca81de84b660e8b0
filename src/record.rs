use crate::cfi::{CfiRow, ExprArena};
use crate::interner::{StrRef, StringTable};
use crate::storage::{CfiTable, FpoEntry, FpoTable, LineTable, SymTable, Symbol};
use crate::var::{TypeRef, TypeTable, VarInfo, Variable};

/// One observed mapping of an object: where it landed, how much, and the
/// file offset it was mapped from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub avma: u64,
    pub size: u64,
    pub foff: u64,
}

impl Mapping {
    pub fn contains(&self, avma: u64) -> bool {
        self.size > 0 && avma >= self.avma && avma - self.avma < self.size
    }

    pub(crate) fn overlaps(&self, other: &Mapping) -> bool {
        if self.size == 0 || other.size == 0 {
            return false;
        }
        let e1 = self.avma + self.size - 1;
        let e2 = other.avma + other.size - 1;
        !(e1 < other.avma || e2 < self.avma)
    }
}

/// The loaded extent of one section, in the running image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub avma: u64,
    pub size: u64,
}

impl Extent {
    pub fn contains(&self, avma: u64) -> bool {
        self.size > 0 && avma >= self.avma && avma - self.avma < self.size
    }
}

/// Section extents, so tools can see which section an address is in.
#[derive(Clone, Copy, Debug, Default)]
pub struct SectionMap {
    pub text: Option<Extent>,
    pub data: Option<Extent>,
    pub sdata: Option<Extent>,
    pub bss: Option<Extent>,
    pub sbss: Option<Extent>,
    pub rodata: Option<Extent>,
    pub plt: Option<Extent>,
    pub got: Option<Extent>,
    pub got_plt: Option<Extent>,
    pub opd: Option<Extent>,
}

/// The bias values a PDB reader needs. Symbols, line tables,
/// second-generation line tables and FPO data are biased separately;
/// the four values are computed independently even though they come out
/// equal for every PDB seen so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdbBiases {
    pub symbols: u64,
    pub lines: u64,
    pub lines2: u64,
    pub fpo: u64,
}

impl PdbBiases {
    pub fn from_mappings(rx: &Mapping, text_bias: u64) -> Self {
        Self {
            symbols: text_bias,
            lines: text_bias,
            lines2: text_bias,
            fpo: rx.avma.wrapping_sub(rx.foff),
        }
    }
}

/// Everything known about one loaded object: identity, mappings,
/// sections, and (once read) the canonicalised debug-info tables.
///
/// Readers populate a record through the `add_*` methods while
/// `have_dinfo` is still false; after canonicalisation the tables are
/// read-only for the record's lifetime.
pub struct ObjectRecord {
    handle: u64,
    filename: String,
    memname: Option<String>,
    soname: Option<String>,

    pub(crate) rx_map: Option<Mapping>,
    pub(crate) rw_map: Option<Mapping>,
    sections: SectionMap,
    text_bias: u64,

    symtab: SymTable,
    loctab: LineTable,
    cfitab: CfiTable,
    fpotab: FpoTable,

    strings: StringTable,
    exprs: ExprArena,
    types: TypeTable,
    vars: VarInfo,

    pub(crate) have_dinfo: bool,
    /// Transient bit used by the overlap-discard sweep.
    pub(crate) mark: bool,
}

impl ObjectRecord {
    pub(crate) fn new(handle: u64, filename: &str, memname: Option<&str>) -> Self {
        Self {
            handle,
            filename: filename.to_owned(),
            memname: memname.map(str::to_owned),
            soname: None,
            rx_map: None,
            rw_map: None,
            sections: SectionMap::default(),
            text_bias: 0,
            symtab: SymTable::default(),
            loctab: LineTable::default(),
            cfitab: CfiTable::default(),
            fpotab: FpoTable::default(),
            strings: StringTable::new(),
            exprs: ExprArena::new(),
            types: TypeTable::default(),
            vars: VarInfo::default(),
            have_dinfo: false,
            mark: false,
        }
    }

    /// The opaque handle identifying this acquisition. Never zero, never
    /// reused, survives the discard of every other record.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn memname(&self) -> Option<&str> {
        self.memname.as_deref()
    }

    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    pub fn set_soname(&mut self, soname: &str) {
        self.soname = Some(soname.to_owned());
    }

    pub fn rx_mapping(&self) -> Option<&Mapping> {
        self.rx_map.as_ref()
    }

    pub fn rw_mapping(&self) -> Option<&Mapping> {
        self.rw_map.as_ref()
    }

    pub fn sections(&self) -> &SectionMap {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut SectionMap {
        &mut self.sections
    }

    /// actual-minus-stated delta for text addresses.
    pub fn text_bias(&self) -> u64 {
        self.text_bias
    }

    pub fn set_text_bias(&mut self, bias: u64) {
        self.text_bias = bias;
    }

    pub fn has_debug_info(&self) -> bool {
        self.have_dinfo
    }

    pub fn text_contains(&self, avma: u64) -> bool {
        self.sections.text.is_some_and(|t| t.contains(avma))
    }

    pub(crate) fn data_contains(&self, avma: u64) -> bool {
        [
            self.sections.data,
            self.sections.sdata,
            self.sections.bss,
            self.sections.sbss,
            self.sections.rodata,
        ]
        .iter()
        .any(|s| s.is_some_and(|s| s.contains(avma)))
    }

    /// Do the rx/rw mappings of the two records overlap in any way?
    pub(crate) fn overlaps(&self, other: &ObjectRecord) -> bool {
        let maps = |r: &ObjectRecord| [r.rx_map, r.rw_map];
        maps(self).iter().flatten().any(|m1| {
            maps(other).iter().flatten().any(|m2| m1.overlaps(m2))
        })
    }

    // ---- string / expression / type storage ----

    pub fn intern(&mut self, s: &str) -> StrRef {
        self.strings.intern(s)
    }

    pub fn string(&self, r: StrRef) -> &str {
        self.strings.get(r)
    }

    pub fn exprs(&self) -> &ExprArena {
        &self.exprs
    }

    pub fn exprs_mut(&mut self) -> &mut ExprArena {
        &mut self.exprs
    }

    pub fn add_type(&mut self, name: Option<StrRef>, size: u64) -> Option<TypeRef> {
        self.types.add(name, size)
    }

    pub fn type_size(&self, r: TypeRef) -> u64 {
        self.types.size_of(r)
    }

    pub fn type_name(&self, r: TypeRef) -> Option<&str> {
        self.types.name_of(r).map(|s| self.strings.get(s))
    }

    pub(crate) fn types(&self) -> &TypeTable {
        &self.types
    }

    // ---- table population (readers only; pre-canonicalisation) ----

    pub fn add_symbol(&mut self, sym: Symbol) {
        self.symtab.add(sym);
    }

    pub fn add_line_span(
        &mut self,
        start: u64,
        end: u64,
        line: u32,
        file: StrRef,
        dir: Option<StrRef>,
    ) {
        self.loctab.add(start, end, line, file, dir);
    }

    pub fn add_cfi_row(&mut self, row: CfiRow) {
        self.cfitab.add(row);
    }

    pub fn add_fpo(&mut self, ent: FpoEntry) {
        self.fpotab.add(ent);
    }

    pub fn add_global_var(&mut self, var: Variable) {
        self.vars.add_global(var);
    }

    pub fn add_local_var(&mut self, scope_level: usize, ranges: &[(u64, u64)], var: &Variable) {
        self.vars.add_local(scope_level, ranges, var);
    }

    // ---- table access (queries) ----

    pub(crate) fn symtab(&self) -> &SymTable {
        &self.symtab
    }

    pub(crate) fn loctab(&self) -> &LineTable {
        &self.loctab
    }

    pub(crate) fn cfitab(&self) -> &CfiTable {
        &self.cfitab
    }

    pub(crate) fn fpotab(&self) -> &FpoTable {
        &self.fpotab
    }

    pub(crate) fn vars(&self) -> &VarInfo {
        &self.vars
    }

    pub fn symbols(&self) -> &[Symbol] {
        self.symtab.syms()
    }

    pub fn cfi_rows(&self) -> &[CfiRow] {
        self.cfitab.rows()
    }

    /// Prepare all tables for querying. Called exactly once, after the
    /// reader reports success; tables are immutable afterwards.
    pub(crate) fn canonicalise_tables(&mut self) {
        self.symtab.canonicalise(&self.strings);
        self.loctab.canonicalise();
        self.cfitab.canonicalise();
        self.fpotab.canonicalise();
    }

    /// Post-acquisition sanity: CFI rows are ordered, non-overlapping,
    /// and inside the read+execute mapping.
    pub(crate) fn check_cfi_invariants(&self) {
        let rx = self.rx_map.as_ref().expect("acquired without rx mapping");
        if self.cfitab.is_empty() {
            return;
        }
        self.cfitab.check_invariants();
        assert!(self.cfitab.min_avma() >= rx.avma);
        assert!(self.cfitab.max_avma() < rx.avma + rx.size);
    }
}
