use tracing::debug;

use crate::cfi::CfiRow;
use crate::interner::StrRef;

/// A symbol: the lowest address of an entity, its extent, and its name.
#[derive(Clone, Copy, Debug)]
pub struct Symbol {
    pub avma: u64,
    /// Value the TOC register should hold at entry, on architectures
    /// that use one. Zero elsewhere.
    pub tocptr: u64,
    pub size: u32,
    pub name: StrRef,
    pub is_text: bool,
}

pub(crate) const LINE_BITS: u32 = 20;
pub(crate) const SPAN_BITS: u32 = 32 - LINE_BITS;
pub(crate) const MAX_LINE: u32 = (1 << LINE_BITS) - 1;
/// Instruction ranges per source line are almost never wider than this.
pub(crate) const MAX_SPAN: u32 = (1 << SPAN_BITS) - 1;

/// An address-to-source-line record. There can be a great many of these,
/// hence the dense packing: the span and line number share one word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRecord {
    pub avma: u64,
    packed: u32,
    pub file: StrRef,
    pub dir: Option<StrRef>,
}

impl LineRecord {
    pub fn size(&self) -> u32 {
        self.packed >> LINE_BITS
    }

    pub fn line(&self) -> u32 {
        self.packed & MAX_LINE
    }

    fn with_size(self, size: u32) -> Self {
        debug_assert!(size <= MAX_SPAN);
        Self {
            packed: (size << LINE_BITS) | self.line(),
            ..self
        }
    }

    fn same_payload(&self, other: &LineRecord) -> bool {
        self.line() == other.line() && self.file == other.file && self.dir == other.dir
    }
}

/// A PDB frame-layout descriptor for the procedure starting at `avma`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FpoEntry {
    pub avma: u64,
    pub proc_size: u32,
    pub cb_prolog: u32,
    pub cb_regs: u32,
    pub cdw_locals: u32,
    pub cdw_params: u32,
}

/// Find the index of the last element whose key is <= `probe`.
fn floor_index<T, K: Fn(&T) -> u64>(items: &[T], probe: u64, key: K) -> Option<usize> {
    let i = items.partition_point(|it| key(it) <= probe);
    i.checked_sub(1)
}

#[derive(Default)]
pub struct SymTable {
    syms: Vec<Symbol>,
    canonical: bool,
}

impl SymTable {
    pub fn add(&mut self, sym: Symbol) {
        debug_assert!(!self.canonical);
        self.syms.push(sym);
    }

    pub fn syms(&self) -> &[Symbol] {
        &self.syms
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Sort, drop zero-sized entries, and collapse duplicate addresses,
    /// preferring the larger then textual then longer-named entry.
    pub fn canonicalise(&mut self, strings: &crate::interner::StringTable) {
        self.syms.retain(|s| s.size > 0);
        self.syms.sort_by(|a, b| {
            a.avma
                .cmp(&b.avma)
                .then(b.size.cmp(&a.size))
                .then(b.is_text.cmp(&a.is_text))
                .then(strings.get(b.name).len().cmp(&strings.get(a.name).len()))
        });
        self.syms.dedup_by_key(|s| s.avma);
        self.canonical = true;
    }

    /// Binary search for the symbol covering `avma`. With
    /// `match_at_entry`, only an exact match of the start address counts.
    pub fn search(&self, avma: u64, match_at_entry: bool, want_text: bool) -> Option<usize> {
        let i = floor_index(&self.syms, avma, |s| s.avma)?;
        let s = &self.syms[i];
        if s.is_text != want_text {
            return None;
        }
        let contained = avma - s.avma < u64::from(s.size);
        if match_at_entry {
            (avma == s.avma).then_some(i)
        } else {
            contained.then_some(i)
        }
    }
}

#[derive(Default)]
pub struct LineTable {
    locs: Vec<LineRecord>,
    canonical: bool,
}

impl LineTable {
    /// Add one source-line span. Records with no usable line number are
    /// dropped; spans wider than the packed field are truncated.
    pub fn add(&mut self, start: u64, end: u64, line: u32, file: StrRef, dir: Option<StrRef>) {
        debug_assert!(!self.canonical);
        if end <= start {
            return;
        }
        if line == 0 || line > MAX_LINE {
            debug!(line, "dropping line record with out-of-range line number");
            return;
        }
        let size = u32::try_from(end - start).unwrap_or(u32::MAX).min(MAX_SPAN);
        self.locs.push(LineRecord {
            avma: start,
            packed: (size << LINE_BITS) | line,
            file,
            dir,
        });
    }

    pub fn locs(&self) -> &[LineRecord] {
        &self.locs
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    /// Sort by address, truncate overlapping spans, drop empties, and
    /// coalesce contiguous records that describe the same source line.
    pub fn canonicalise(&mut self) {
        self.locs.sort_by_key(|l| (l.avma, l.line()));
        for i in 0..self.locs.len().saturating_sub(1) {
            let next_start = self.locs[i + 1].avma;
            let cur = &self.locs[i];
            if cur.avma + u64::from(cur.size()) > next_start {
                let clipped = next_start.saturating_sub(cur.avma).min(u64::from(MAX_SPAN));
                self.locs[i] = self.locs[i].with_size(clipped as u32);
            }
        }
        self.locs.retain(|l| l.size() > 0);
        self.locs.dedup_by(|next, cur| {
            let contiguous = cur.avma + u64::from(cur.size()) == next.avma;
            let combined = u64::from(cur.size()) + u64::from(next.size());
            if contiguous && cur.same_payload(next) && combined <= u64::from(MAX_SPAN) {
                *cur = cur.with_size(combined as u32);
                true
            } else {
                false
            }
        });
        self.canonical = true;
    }

    pub fn search(&self, avma: u64) -> Option<usize> {
        let i = floor_index(&self.locs, avma, |l| l.avma)?;
        let l = &self.locs[i];
        (avma - l.avma < u64::from(l.size())).then_some(i)
    }
}

/// The CFI summary table, plus the min/max addresses covered by any row
/// so lookups can reject whole objects in O(1).
#[derive(Default)]
pub struct CfiTable {
    rows: Vec<CfiRow>,
    min_avma: u64,
    max_avma: u64,
    canonical: bool,
}

impl CfiTable {
    pub fn add(&mut self, row: CfiRow) {
        debug_assert!(!self.canonical);
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[CfiRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn min_avma(&self) -> u64 {
        self.min_avma
    }

    pub fn max_avma(&self) -> u64 {
        self.max_avma
    }

    pub fn canonicalise(&mut self) {
        self.rows.sort_by_key(|r| r.base);
        for i in 0..self.rows.len().saturating_sub(1) {
            let next_base = self.rows[i + 1].base;
            let cur = &mut self.rows[i];
            if cur.base + u64::from(cur.len) > next_base {
                cur.len = next_base.saturating_sub(cur.base) as u32;
            }
        }
        self.rows.retain(|r| r.len > 0);
        self.rows.dedup_by(|next, cur| {
            let contiguous = cur.base + u64::from(cur.len) == next.base;
            let same = (cur.cfa, cur.ra, cur.sp, cur.fp) == (next.cfa, next.ra, next.sp, next.fp);
            let combined = u64::from(cur.len) + u64::from(next.len);
            if contiguous && same && u32::try_from(combined).is_ok() {
                cur.len = combined as u32;
                true
            } else {
                false
            }
        });
        if let (Some(first), Some(last)) = (self.rows.first(), self.rows.last()) {
            self.min_avma = first.base;
            self.max_avma = last.base + u64::from(last.len) - 1;
        } else {
            self.min_avma = 0;
            self.max_avma = 0;
        }
        self.canonical = true;
    }

    pub fn search(&self, avma: u64) -> Option<usize> {
        let i = floor_index(&self.rows, avma, |r| r.base)?;
        self.rows[i].contains(avma).then_some(i)
    }

    /// Table-order invariant: strictly ordered, non-overlapping, all
    /// rows inside the summary bounds. Holds for every canonicalised
    /// table; a violation after `have_dinfo` is a bug in this crate.
    pub(crate) fn check_invariants(&self) {
        for w in self.rows.windows(2) {
            assert!(w[0].base + u64::from(w[0].len) <= w[1].base);
        }
        for r in &self.rows {
            assert!(r.len > 0);
            assert!(r.base >= self.min_avma);
            assert!(r.base + u64::from(r.len) - 1 <= self.max_avma);
        }
    }
}

#[derive(Default)]
pub struct FpoTable {
    ents: Vec<FpoEntry>,
    min_avma: u64,
    max_avma: u64,
}

impl FpoTable {
    pub fn add(&mut self, ent: FpoEntry) {
        self.ents.push(ent);
    }

    pub fn ents(&self) -> &[FpoEntry] {
        &self.ents
    }

    pub fn is_empty(&self) -> bool {
        self.ents.is_empty()
    }

    pub fn min_avma(&self) -> u64 {
        self.min_avma
    }

    pub fn max_avma(&self) -> u64 {
        self.max_avma
    }

    pub fn canonicalise(&mut self) {
        self.ents.sort_by_key(|e| e.avma);
        self.ents.retain(|e| e.proc_size > 0);
        if let (Some(first), Some(last)) = (self.ents.first(), self.ents.last()) {
            self.min_avma = first.avma;
            self.max_avma = last.avma + u64::from(last.proc_size) - 1;
        }
    }

    pub fn search(&self, avma: u64) -> Option<usize> {
        let i = floor_index(&self.ents, avma, |e| e.avma)?;
        let e = &self.ents[i];
        (avma - e.avma < u64::from(e.proc_size)).then_some(i)
    }
}
