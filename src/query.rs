use tracing::debug;

use crate::cfi::{eval_expr, EvalCtx};
use crate::record::ObjectRecord;
use crate::registry::{AddressSpace, DebugDb, DebugReader, SegmentKind};
use crate::var::Variable;

/// Answer to [`DebugDb::describe_code_address`]. Any field may be
/// absent independently of the others.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeDescription {
    pub object: Option<String>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub dir: Option<String>,
    pub line: Option<u32>,
}

/// A two-line human description of a data address, e.g.
///
/// ```text
/// Location 0x7fefff6cf is 543 bytes inside local var "a",
/// in frame #1 of thread 1
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDescription {
    pub line1: String,
    pub line2: String,
}

/// The stacktrace provider used by data-address descriptions: thread
/// enumeration, stack extents, current registers, and a bounded
/// stacktrace as `(ip, sp, fp)` triples.
pub trait ThreadStacks {
    fn threads(&self) -> Vec<u32>;
    /// `(stack_min, stack_max)` for the thread, if it has a stack.
    fn stack_bounds(&self, tid: u32) -> Option<(u64, u64)>;
    fn regs(&self, tid: u32) -> Option<(u64, u64, u64)>;
    fn stacktrace(&self, tid: u32, max_frames: usize) -> Vec<(u64, u64, u64)>;
}

/// Frames examined per thread when attributing a data address.
const N_FRAMES: usize = 8;

/// Bytes below the lowest stack address still treated as stack (the ABI
/// red zone).
const STACK_REDZONE: u64 = 128;

const N_CFSI_CACHE: usize = 511;

#[derive(Clone, Copy)]
struct CacheEnt {
    ip: u64,
    /// `Some((handle, index))` when a row covers `ip`; `None` when the
    /// address is known to have no CFI.
    found: Option<(u64, u32)>,
}

/// Direct-mapped cache for CFI lookups, which are extremely frequent
/// during stack unwinding. Rows are identified by record handle plus
/// table index (stable across list reordering); the cache is zapped
/// wholesale whenever the registry changes shape, so a live entry can
/// never name a discarded record.
pub(crate) struct CfsiCache {
    slots: Box<[Option<CacheEnt>; N_CFSI_CACHE]>,
}

impl CfsiCache {
    pub fn new() -> Self {
        Self {
            slots: Box::new([None; N_CFSI_CACHE]),
        }
    }

    pub fn invalidate(&mut self) {
        self.slots.fill(None);
    }

    /// Outer `None`: cache miss. Inner value: the authoritative lookup
    /// result, including negative knowledge.
    fn lookup(&self, ip: u64) -> Option<Option<(u64, u32)>> {
        let ent = self.slots[(ip % N_CFSI_CACHE as u64) as usize]?;
        (ent.ip == ip).then_some(ent.found)
    }

    fn store(&mut self, ip: u64, found: Option<(u64, u32)>) {
        self.slots[(ip % N_CFSI_CACHE as u64) as usize] = Some(CacheEnt { ip, found });
    }

    #[cfg(test)]
    pub(crate) fn is_cold(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Simple `*`/`?` glob match, used for soname patterns.
fn string_match(patt: &str, s: &str) -> bool {
    fn go(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&p[1..], s) || (!s.is_empty() && go(p, &s[1..])),
            (Some(b'?'), Some(_)) => go(&p[1..], &s[1..]),
            (Some(c), Some(d)) if c == d => go(&p[1..], &s[1..]),
            _ => false,
        }
    }
    go(patt.as_bytes(), s.as_bytes())
}

impl<S: AddressSpace, R: DebugReader> DebugDb<S, R> {
    // ---- low-level searches over all records ----

    /// Find the symbol covering `avma`. Searches only records whose
    /// relevant section ranges bracket the address, and only tables of
    /// fully acquired records.
    fn search_all_symtabs(
        &mut self,
        avma: u64,
        match_at_entry: bool,
        want_text: bool,
    ) -> Option<(u64, usize)> {
        for rec in &self.recs {
            if !rec.has_debug_info() || rec.symtab().is_empty() {
                continue;
            }
            let in_range = if want_text {
                rec.text_contains(avma)
            } else {
                rec.data_contains(avma)
            };
            if !in_range {
                continue;
            }
            if let Some(i) = rec.symtab().search(avma, match_at_entry, want_text) {
                return Some((rec.handle(), i));
            }
            return None;
        }
        None
    }

    fn search_all_loctabs(&mut self, avma: u64) -> Option<(u64, usize)> {
        for rec in &self.recs {
            if !rec.has_debug_info() || rec.loctab().is_empty() {
                continue;
            }
            if !rec.text_contains(avma) {
                continue;
            }
            if let Some(i) = rec.loctab().search(avma) {
                return Some((rec.handle(), i));
            }
            return None;
        }
        None
    }

    /// CFI lookup with the fast-path cache in front. The result,
    /// positive or negative, is authoritative for `ip`.
    pub(crate) fn find_cfi_row(&mut self, ip: u64) -> Option<(u64, u32)> {
        if let Some(res) = self.cfi_cache.lookup(ip) {
            return res;
        }
        let found = self.search_all_cfi(ip);
        self.cfi_cache.store(ip, found);
        found
    }

    fn search_all_cfi(&mut self, ip: u64) -> Option<(u64, u32)> {
        self.cfi_searches += 1;
        let mut found = None;
        for rec in &self.recs {
            if !rec.has_debug_info() || rec.cfitab().is_empty() {
                continue;
            }
            // O(1) rejection on the summary bounds.
            if ip < rec.cfitab().min_avma() || ip > rec.cfitab().max_avma() {
                continue;
            }
            if let Some(i) = rec.cfitab().search(ip) {
                found = Some((rec.handle(), i as u32));
                break;
            }
        }
        if let Some((handle, _)) = found {
            // Every 16th hit, nudge the record toward the list head so
            // unwind-heavy phases stop paying for the full list walk.
            if self.cfi_searches & 0xF == 0 {
                self.move_one_step_forward(handle);
            }
        }
        found
    }

    pub(crate) fn find_fpo_entry(&mut self, ip: u64) -> Option<(u64, u32)> {
        self.fpo_searches += 1;
        let mut found = None;
        for rec in &self.recs {
            if !rec.has_debug_info() || rec.fpotab().is_empty() {
                continue;
            }
            if ip < rec.fpotab().min_avma() || ip > rec.fpotab().max_avma() {
                continue;
            }
            if let Some(i) = rec.fpotab().search(ip) {
                found = Some((rec.handle(), i as u32));
                break;
            }
        }
        if let Some((handle, _)) = found {
            if self.fpo_searches & 0x3F == 0 {
                self.move_one_step_forward(handle);
            }
        }
        found
    }

    fn demangled(&self, raw: &str, cxx: bool) -> String {
        match &self.demangler {
            Some(d) => d.demangle(cxx, cxx, raw).unwrap_or_else(|| raw.to_owned()),
            None => raw.to_owned(),
        }
    }

    // ---- public queries ----

    /// The name of the function containing `avma`, demangled when a
    /// demangler is installed.
    pub fn function_name(&mut self, avma: u64) -> Option<String> {
        let (h, i) = self.search_all_symtabs(avma, false, true)?;
        let rec = self.object_by_handle(h)?;
        let sym = rec.symtab().syms()[i];
        Some(self.demangled(rec.string(sym.name), true))
    }

    /// Like [`Self::function_name`], but only when `avma` is exactly a
    /// function entry point.
    pub fn function_name_if_entry(&mut self, avma: u64) -> Option<String> {
        let (h, i) = self.search_all_symtabs(avma, true, true)?;
        let rec = self.object_by_handle(h)?;
        let sym = rec.symtab().syms()[i];
        Some(self.demangled(rec.string(sym.name), true))
    }

    /// The data symbol covering `avma`, with the probe's offset from the
    /// symbol start. Undemangled.
    pub fn data_symbol_at(&mut self, avma: u64) -> Option<(String, u64)> {
        let (h, i) = self.search_all_symtabs(avma, false, false)?;
        let rec = self.object_by_handle(h)?;
        let sym = rec.symtab().syms()[i];
        Some((rec.string(sym.name).to_owned(), avma - sym.avma))
    }

    /// The TOC pointer in force at the entry of the function containing
    /// `avma`; zero when unknown or unused on this architecture.
    pub fn tocptr_at(&mut self, avma: u64) -> u64 {
        match self.search_all_symtabs(avma, false, true) {
            Some((h, i)) => self
                .object_by_handle(h)
                .map_or(0, |rec| rec.symtab().syms()[i].tocptr),
            None => 0,
        }
    }

    /// The object (or archive member) whose text contains `avma`. Falls
    /// back to the address-space manager's segment name, which covers
    /// code we never read debug info for.
    pub fn object_name_at(&mut self, avma: u64) -> Option<String> {
        for rec in &self.recs {
            if rec.text_contains(avma) {
                return Some(match rec.memname() {
                    Some(m) => format!("{}({})", rec.filename(), m),
                    None => rec.filename().to_owned(),
                });
            }
        }
        match self.address_space().segment_at(avma)?.kind {
            SegmentKind::File { filename, .. } | SegmentKind::FrameworkSelf { filename } => {
                Some(filename)
            }
            SegmentKind::Anonymous => None,
        }
    }

    /// Source file / directory / line for a code address.
    pub fn source_location(&mut self, avma: u64) -> Option<(String, Option<String>, u32)> {
        let (h, i) = self.search_all_loctabs(avma)?;
        let rec = self.object_by_handle(h)?;
        let loc = rec.loctab().locs()[i];
        Some((
            rec.string(loc.file).to_owned(),
            loc.dir.map(|d| rec.string(d).to_owned()),
            loc.line(),
        ))
    }

    /// Everything known about a code address, in one shot.
    pub fn describe_code_address(&mut self, avma: u64) -> CodeDescription {
        let function = self.function_name(avma);
        let object = self.object_name_at(avma);
        let (file, dir, line) = match self.source_location(avma) {
            Some((f, d, l)) => (Some(f), d, Some(l)),
            None => (None, None, None),
        };
        CodeDescription {
            object,
            function,
            file,
            dir,
            line,
        }
    }

    /// Map a symbol name to its entry point and TOC pointer by linear
    /// search of every record whose soname matches the glob. Slow by
    /// design; pass `"*"` to search everything. With `require_toc`, a
    /// symbol only counts if it carries a nonzero TOC pointer.
    pub fn lookup_symbol_by_name(
        &self,
        soname_glob: &str,
        name: &str,
        require_toc: bool,
    ) -> Option<(u64, u64)> {
        for rec in &self.recs {
            if !rec.has_debug_info() {
                continue;
            }
            if !string_match(soname_glob, rec.soname().unwrap_or("NONE")) {
                continue;
            }
            for sym in rec.symtab().syms() {
                if rec.string(sym.name) == name && (!require_toc || sym.tocptr != 0) {
                    return Some((sym.avma, sym.tocptr));
                }
            }
        }
        None
    }

    // ---- data-address attribution ----

    /// Evaluate whether `var`'s location at the given frame covers
    /// `data_addr`; if so return the offset of the address inside it.
    fn data_address_in_var(
        rec: &ObjectRecord,
        var: &Variable,
        regs: Option<(u64, u64, u64)>,
        data_addr: u64,
    ) -> Option<u64> {
        let var_size = rec.types().size_of(var.ty);
        debug_assert!(var_size > 0);
        let mut no_mem = |_| Err(());
        let mut ctx = EvalCtx {
            regs,
            frame_base: None,
            min_accessible: 1,
            max_accessible: 0,
        };
        if let Some(fb) = var.frame_base {
            let frame_base = eval_expr(rec.exprs(), fb, &ctx, &mut no_mem);
            ctx.frame_base = frame_base;
        }
        let loc = eval_expr(rec.exprs(), var.location, &ctx, &mut no_mem)?;
        (data_addr >= loc && data_addr - loc < var_size).then(|| data_addr - loc)
    }

    fn format_var_description(
        rec: &ObjectRecord,
        var: &Variable,
        data_addr: u64,
        var_offset: u64,
        frame_no: Option<usize>,
        tid: u32,
    ) -> DataDescription {
        let plural = if var_offset == 1 { "" } else { "s" };
        let name = rec.string(var.name);
        let srcloc = match (var.file, var.line) {
            (Some(f), Some(l)) => Some(format!("declared at {}:{}", rec.string(f), l)),
            _ => None,
        };
        let (line1, line2) = match frame_no {
            Some(frame_no) => {
                let head = format!(
                    "Location 0x{data_addr:x} is {var_offset} byte{plural} inside local var \"{name}\""
                );
                match srcloc {
                    Some(s) => (head, format!("{s}, in frame #{frame_no} of thread {tid}")),
                    None => (
                        format!("{head},"),
                        format!("in frame #{frame_no} of thread {tid}"),
                    ),
                }
            }
            None => {
                let line1 = format!(
                    "Location 0x{data_addr:x} is {var_offset} byte{plural} inside global var \"{name}\""
                );
                (line1, srcloc.unwrap_or_default())
            }
        };
        DataDescription { line1, line2 }
    }

    /// Is `data_addr` inside a local variable of the frame characterised
    /// by `(ip, sp, fp)`? Walks scopes innermost-first; the global scope
    /// is never considered here.
    fn consider_vars_in_frame(
        &mut self,
        data_addr: u64,
        (ip, sp, fp): (u64, u64, u64),
        tid: u32,
        frame_no: usize,
    ) -> Option<DataDescription> {
        self.var_searches += 1;
        let handle = self
            .recs
            .iter()
            .find(|r| r.has_debug_info() && r.text_contains(ip))
            .map(|r| r.handle())?;
        if self.var_searches & 0xFFFF == 0 {
            self.move_one_step_forward(handle);
        }
        let rec = self.object_by_handle(handle)?;
        if rec.vars().is_empty() {
            return None;
        }
        for arange in rec.vars().local_ranges_containing(ip) {
            debug_assert!(arange.min <= ip && ip <= arange.max);
            // A range covering the whole address space can only be the
            // global scope's, which this walk never visits.
            debug_assert!(!(arange.min == 0 && arange.max == u64::MAX && !arange.vars().is_empty()));
            for var in arange.vars() {
                if let Some(off) =
                    Self::data_address_in_var(rec, var, Some((ip, sp, fp)), data_addr)
                {
                    return Some(Self::format_var_description(
                        rec,
                        var,
                        data_addr,
                        off,
                        Some(frame_no),
                        tid,
                    ));
                }
            }
        }
        None
    }

    /// Try to describe `data_addr` via the debug info: first as a global
    /// variable of any record, then as a local in some frame of some
    /// thread's stack.
    pub fn describe_data_address(
        &mut self,
        data_addr: u64,
        threads: &dyn ThreadStacks,
    ) -> Option<DataDescription> {
        // Global scopes of every record first.
        for rec in &self.recs {
            if !rec.has_debug_info() || rec.vars().is_empty() {
                continue;
            }
            for var in rec.vars().global_vars() {
                // No register context: a global's location must not
                // depend on one, and evaluation fails if it does.
                if let Some(off) = Self::data_address_in_var(rec, var, None, data_addr) {
                    return Some(Self::format_var_description(
                        rec, var, data_addr, off, None, 0,
                    ));
                }
            }
        }

        // Top frame of every thread. This picks up variables that are
        // neither stack-allocated nor globally visible, e.g.
        // compilation-unit scoped ones living at scope level 1.
        for tid in threads.threads() {
            let Some((lo, hi)) = threads.stack_bounds(tid) else {
                continue;
            };
            if lo >= hi {
                continue;
            }
            if let Some(regs) = threads.regs(tid) {
                if let Some(d) = self.consider_vars_in_frame(data_addr, regs, tid, 0) {
                    return Some(d);
                }
            }
        }

        // Whose stack is the address on?
        let tid = threads.threads().into_iter().find(|&tid| {
            threads.stack_bounds(tid).is_some_and(|(lo, hi)| {
                lo < hi && lo.saturating_sub(STACK_REDZONE) <= data_addr && data_addr <= hi
            })
        })?;

        let frames = threads.stacktrace(tid, N_FRAMES);
        for (j, &frame) in frames.iter().enumerate() {
            if let Some(d) = self.consider_vars_in_frame(data_addr, frame, tid, j) {
                return Some(d);
            }
            // Compilers sometimes end a variable's location range just
            // before the call instruction of a non-innermost frame;
            // retry one byte past the return address.
            if j > 0 {
                let (ip, sp, fp) = frame;
                if let Some(d) = self.consider_vars_in_frame(data_addr, (ip + 1, sp, fp), tid, j) {
                    return Some(d);
                }
            }
        }

        debug!(data_addr, "no variable found covering data address");
        None
    }
}
