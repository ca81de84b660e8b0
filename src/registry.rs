use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::ReadError;
use crate::query::CfsiCache;
use crate::record::{Mapping, ObjectRecord};

/// One segment of the guest address space, as reported by the embedding
/// framework's address-space manager.
#[derive(Clone, Debug)]
pub struct Segment {
    pub avma: u64,
    pub size: u64,
    pub foff: u64,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub kind: SegmentKind,
}

#[derive(Clone, Debug)]
pub enum SegmentKind {
    /// Backed by a guest-visible file.
    File {
        filename: String,
        /// Archive member name, when the mapping comes from inside an
        /// archive rather than a plain object.
        member: Option<String>,
    },
    /// Backed by the instrumentation framework's own image. Only read
    /// when the caller explicitly allows it.
    FrameworkSelf { filename: String },
    Anonymous,
}

/// The address-space-manager interface this subsystem consumes. All file
/// and segment inspection goes through here so embedders control how the
/// guest's view of the world is accessed.
pub trait AddressSpace {
    fn segment_at(&self, avma: u64) -> Option<Segment>;

    /// True for plain regular files: symlink targets that are devices,
    /// sockets or directories must report false.
    fn is_regular_file(&self, path: &str) -> bool;

    /// Read up to `buf.len()` leading bytes of the file, for format
    /// signature sniffing.
    fn file_prefix(&self, path: &str, buf: &mut [u8]) -> std::io::Result<usize>;

    /// A transient in-memory copy of the whole file, alive only for the
    /// duration of one read.
    fn file_image(&self, path: &str) -> std::io::Result<Vec<u8>>;

    /// Modification time in seconds, for PDB/PE freshness comparison.
    fn file_mtime(&self, path: &str) -> std::io::Result<u64>;
}

/// A format-specific debug-info reader. Implementations fill the
/// record's sections, tables and string storage from the object image;
/// the registry owns everything around that (lifecycle, canonicalisation
/// and invariant checking).
pub trait DebugReader {
    /// Does this prefix of the file look like a format this reader can
    /// handle?
    fn recognizes(&self, prefix: &[u8]) -> bool;

    fn read(&mut self, rec: &mut ObjectRecord, image: &[u8]) -> Result<(), ReadError>;

    /// PDB side-channel path; only meaningful for readers that handle
    /// PE/PDB pairs.
    fn read_pdb(
        &mut self,
        _rec: &mut ObjectRecord,
        _pe_avma: u64,
        _reloc_bias: u64,
        _pdb_image: &[u8],
        _pdb_name: &str,
        _pdb_mtime: u64,
    ) -> Result<(), ReadError> {
        Err(ReadError::UnrecognizedFormat)
    }
}

/// Observer for the symbol-redirection machinery. Notified exactly once
/// at acquisition and once at discard. Observers must key any state they
/// keep by the record's handle; a discard notification invalidates
/// everything known about that handle.
pub trait RedirObserver {
    fn notify_new(&mut self, rec: &ObjectRecord);
    fn notify_delete(&mut self, handle: u64);
}

/// The default observer: nobody listening.
pub struct NullRedir;

impl RedirObserver for NullRedir {
    fn notify_new(&mut self, _rec: &ObjectRecord) {}
    fn notify_delete(&mut self, _handle: u64) {}
}

/// Name demangling hook. `cxx` selects full C++ demangling, `z` the
/// Z-encoding used by the redirection machinery.
pub trait Demangler {
    fn demangle(&self, cxx: bool, z: bool, raw: &str) -> Option<String>;
}

/// The permission-combination rule for classifying mappings, which
/// varies per platform. On x86 the dynamic loader produces rwx text
/// segments, so the strict "text must not be writable" test would lose
/// real code; everywhere else the strict test avoids misreading the
/// writable copy of a doubly-mapped object.
#[derive(Clone, Copy, Debug)]
pub struct MappingPolicy {
    pub text_requires_not_writable: bool,
    pub data_requires_not_executable: bool,
}

impl MappingPolicy {
    pub fn strict() -> Self {
        Self {
            text_requires_not_writable: true,
            data_requires_not_executable: true,
        }
    }

    pub fn lenient() -> Self {
        Self {
            text_requires_not_writable: false,
            data_requires_not_executable: false,
        }
    }
}

impl Default for MappingPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

/// The debug-info database: the registry of object records plus the
/// query-side caches. See the crate docs for the lifecycle.
pub struct DebugDb<S: AddressSpace, R: DebugReader> {
    space: S,
    reader: R,
    policy: MappingPolicy,
    redir: Box<dyn RedirObserver>,
    pub(crate) demangler: Option<Box<dyn Demangler>>,

    /// Record list in search order; index 0 is the head. Queries may
    /// move a record one step toward the head after a hit, so the order
    /// is not stable across queries (results are, latency is not).
    pub(crate) recs: Vec<ObjectRecord>,
    pos_by_handle: HashMap<u64, usize>,
    next_handle: u64,

    pub(crate) cfi_cache: CfsiCache,
    pub(crate) cfi_searches: u64,
    pub(crate) fpo_searches: u64,
    pub(crate) var_searches: u64,
}

impl<S: AddressSpace, R: DebugReader> DebugDb<S, R> {
    pub fn new(space: S, reader: R, policy: MappingPolicy) -> Self {
        Self {
            space,
            reader,
            policy,
            redir: Box::new(NullRedir),
            demangler: None,
            recs: Vec::new(),
            pos_by_handle: HashMap::new(),
            next_handle: 1,
            cfi_cache: CfsiCache::new(),
            cfi_searches: 0,
            fpo_searches: 0,
            var_searches: 0,
        }
    }

    pub fn set_redir_observer(&mut self, redir: Box<dyn RedirObserver>) {
        self.redir = redir;
    }

    pub fn set_demangler(&mut self, demangler: Box<dyn Demangler>) {
        self.demangler = Some(demangler);
    }

    pub fn address_space(&self) -> &S {
        &self.space
    }

    /// All currently registered records, in search order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.recs.iter()
    }

    pub fn object_by_handle(&self, handle: u64) -> Option<&ObjectRecord> {
        self.pos_by_handle.get(&handle).map(|&i| &self.recs[i])
    }

    // ---- notifications ----

    /// Tell the database about a new mapping at `avma`. If the mapping
    /// completes an object (both text-like and data-like mappings seen)
    /// its debug info is read; the returned handle is nonzero exactly
    /// when new debug info was acquired.
    pub fn notify_mmap(&mut self, avma: u64, allow_framework_self: bool) -> u64 {
        let Some(seg) = self.space.segment_at(avma) else {
            return 0;
        };
        let (filename, member) = match &seg.kind {
            SegmentKind::File { filename, member } => (filename.clone(), member.clone()),
            SegmentKind::FrameworkSelf { filename } if allow_framework_self => {
                (filename.clone(), None)
            }
            _ => return 0,
        };

        if !self.space.is_regular_file(&filename) {
            return 0;
        }

        let is_rx = seg.read
            && seg.execute
            && (!self.policy.text_requires_not_writable || !seg.write);
        let is_rw = seg.read
            && seg.write
            && (!self.policy.data_requires_not_executable || !seg.execute);
        if !is_rx && !is_rw {
            return 0;
        }

        let mut prefix = [0u8; 1024];
        let n = match self.space.file_prefix(&filename, &mut prefix) {
            Ok(n) if n > 0 => n,
            Ok(_) => return 0,
            Err(e) => {
                debug!(file = %filename, error = %e, "cannot inspect object header");
                return 0;
            }
        };
        if !self.reader.recognizes(&prefix[..n]) {
            return 0;
        }

        let handle = self.find_or_create(&filename, member.as_deref());
        let idx = self.pos_by_handle[&handle];
        let mapping = Mapping {
            avma: seg.avma,
            size: seg.size,
            foff: seg.foff,
        };
        let rec = &mut self.recs[idx];
        if is_rx && rec.rx_map.is_none() {
            rec.rx_map = Some(mapping);
        }
        if is_rw && rec.rw_map.is_none() {
            rec.rw_map = Some(mapping);
        }

        if !(rec.rx_map.is_some() && rec.rw_map.is_some() && !rec.have_dinfo) {
            return 0;
        }
        self.acquire(handle)
    }

    /// Throw away every record whose text range intersects
    /// `[avma, avma + len)`.
    pub fn notify_munmap(&mut self, avma: u64, len: u64) {
        self.discard_in_range(avma, len);
    }

    /// Deliberately does nothing: dynamic linkers mprotect themselves
    /// noisily, and acting on that traffic would discard live info.
    pub fn notify_mprotect(&mut self, _avma: u64, _len: u64, _new_prot: (bool, bool, bool)) {}

    /// PE/PDB side channel: the framework has loaded a PE image at
    /// `pe_avma`; find its PDB next to it on disk and read that.
    pub fn notify_pdb_debuginfo(&mut self, pe_avma: u64, total_size: u64, reloc_bias: u64) -> u64 {
        let Some(seg) = self.space.segment_at(pe_avma) else {
            return 0;
        };
        let (SegmentKind::File { filename, .. } | SegmentKind::FrameworkSelf { filename }) =
            &seg.kind
        else {
            return 0;
        };
        let exename = filename.clone();
        let pdbname = match exename.rsplit_once('.') {
            Some((stem, _ext)) => format!("{stem}.pdb"),
            None => format!("{exename}.pdb"),
        };
        if !self.space.is_regular_file(&pdbname) {
            warn!(pdb = %pdbname, "no PDB file found next to PE image");
            return 0;
        }
        let (Ok(pe_mtime), Ok(pdb_mtime)) = (
            self.space.file_mtime(&exename),
            self.space.file_mtime(&pdbname),
        ) else {
            return 0;
        };
        if pdb_mtime < pe_mtime {
            warn!(pdb = %pdbname, "PDB file is older than the PE image; symbols may be wrong");
        }
        let pdb_image = match self.space.file_image(&pdbname) {
            Ok(image) => image,
            Err(e) => {
                debug!(pdb = %pdbname, error = %e, "cannot read PDB image");
                return 0;
            }
        };

        self.cfi_cache.invalidate();
        self.discard_in_range(pe_avma, total_size);

        let handle = self.find_or_create(&exename, None);
        let idx = self.pos_by_handle[&handle];
        let mapping = Mapping {
            avma: pe_avma,
            size: total_size,
            foff: 0,
        };
        self.recs[idx].rx_map = Some(mapping);
        self.recs[idx].rw_map = Some(mapping);
        let res = self.reader.read_pdb(
            &mut self.recs[idx],
            pe_avma,
            reloc_bias,
            &pdb_image,
            &pdbname,
            pdb_mtime,
        );
        self.finish_acquisition(handle, res)
    }

    /// Register an object whose code/data placement the caller already
    /// knows (segment-change notifications on platforms without mapping
    /// observation). Runs the normal acquisition pipeline.
    pub fn acquire_with_mappings(
        &mut self,
        filename: &str,
        member: Option<&str>,
        rx: Mapping,
        rw: Mapping,
    ) -> u64 {
        let handle = self.find_or_create(filename, member);
        let idx = self.pos_by_handle[&handle];
        let rec = &mut self.recs[idx];
        if rec.rx_map.is_none() {
            rec.rx_map = Some(rx);
        }
        if rec.rw_map.is_none() {
            rec.rw_map = Some(rw);
        }
        if rec.have_dinfo {
            return 0;
        }
        self.acquire(handle)
    }

    /// Drop everything. Used at shutdown and when the guest execs.
    pub fn discard_all(&mut self) {
        while let Some(rec) = self.recs.last() {
            let handle = rec.handle();
            self.discard(handle);
        }
    }

    // ---- lifecycle internals ----

    fn find_or_create(&mut self, filename: &str, member: Option<&str>) -> u64 {
        let found = self
            .recs
            .iter()
            .find(|r| r.filename() == filename && r.memname() == member);
        if let Some(rec) = found {
            return rec.handle();
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        // New records go to the head of the search order, like the
        // dynamic linker's most-recently-mapped-first behaviour.
        self.recs.insert(0, ObjectRecord::new(handle, filename, member));
        self.reindex();
        handle
    }

    /// Both mappings are present and nothing has been read yet: discard
    /// whatever overlaps, run the reader, canonicalise, publish.
    fn acquire(&mut self, handle: u64) -> u64 {
        self.discard_overlapping_with(handle);

        let idx = self.pos_by_handle[&handle];
        let filename = self.recs[idx].filename().to_owned();
        let image = match self.space.file_image(&filename) {
            Ok(image) => image,
            Err(e) => {
                debug!(file = %filename, error = %e, "cannot read object image");
                self.cfi_cache.invalidate();
                return 0;
            }
        };
        let res = self.reader.read(&mut self.recs[idx], &image);
        self.finish_acquisition(handle, res)
    }

    fn finish_acquisition(&mut self, handle: u64, res: Result<(), ReadError>) -> u64 {
        self.cfi_cache.invalidate();
        let idx = self.pos_by_handle[&handle];
        match res {
            Ok(()) => {
                let rec = &mut self.recs[idx];
                rec.canonicalise_tables();
                rec.have_dinfo = true;
                rec.check_cfi_invariants();
                self.check_rx_disjoint();
                self.redir.notify_new(&self.recs[idx]);
                handle
            }
            Err(e) => {
                // Keep the record: it still carries the mapping
                // descriptors, so later mappings coalesce correctly.
                let rec = &self.recs[idx];
                debug!(file = rec.filename(), error = %e, "debug info reading failed");
                debug_assert!(!self.recs[idx].have_dinfo);
                0
            }
        }
    }

    fn discard(&mut self, handle: u64) {
        let Some(&idx) = self.pos_by_handle.get(&handle) else {
            return;
        };
        let rec = &self.recs[idx];
        if rec.have_dinfo {
            if let Some(text) = rec.sections().text {
                info!(
                    file = rec.filename(),
                    "discarding syms at 0x{:x}-0x{:x}",
                    text.avma,
                    text.avma + text.size
                );
            }
            self.redir.notify_delete(handle);
        }
        self.recs.remove(idx);
        self.reindex();
        self.cfi_cache.invalidate();
    }

    /// Repeatedly scan for records whose text intersects the range and
    /// discard them; iteration restarts after each discard because the
    /// discard reshapes the list.
    fn discard_in_range(&mut self, avma: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let mut any = false;
        loop {
            let found = self.recs.iter().find(|r| {
                r.sections().text.is_some_and(|t| {
                    t.size > 0 && avma + len - 1 >= t.avma && t.avma + t.size - 1 >= avma
                })
            });
            match found {
                Some(rec) => {
                    let handle = rec.handle();
                    self.discard(handle);
                    any = true;
                }
                None => return any,
            }
        }
    }

    /// The mark-and-sweep overlap discard: set the mark on everything
    /// that overlaps the reference record (except the reference itself),
    /// then discard marked records one at a time.
    fn discard_overlapping_with(&mut self, ref_handle: u64) {
        let ref_idx = self.pos_by_handle[&ref_handle];
        for i in 0..self.recs.len() {
            let mark = i != ref_idx && self.recs[i].overlaps(&self.recs[ref_idx]);
            self.recs[i].mark = mark;
        }
        while let Some(i) = self.recs.iter().position(|r| r.mark) {
            let handle = self.recs[i].handle();
            self.discard(handle);
        }
    }

    fn reindex(&mut self) {
        self.pos_by_handle = self
            .recs
            .iter()
            .enumerate()
            .map(|(i, r)| (r.handle(), i))
            .collect();
    }

    /// Move a record one position toward the head of the search order,
    /// making the next search for it cheaper. Never changes query
    /// results, only latency.
    pub(crate) fn move_one_step_forward(&mut self, handle: u64) {
        let Some(&idx) = self.pos_by_handle.get(&handle) else {
            return;
        };
        if idx == 0 {
            return;
        }
        let other = self.recs[idx - 1].handle();
        self.recs.swap(idx - 1, idx);
        self.pos_by_handle.insert(handle, idx - 1);
        self.pos_by_handle.insert(other, idx);
    }

    /// Invariant: the read+execute mappings of any two records with
    /// nonempty text are disjoint. Checked after every acquisition; a
    /// violation is a bug in the overlap-discard protocol.
    fn check_rx_disjoint(&self) {
        for (i, a) in self.recs.iter().enumerate() {
            let Some(ma) = a.rx_map.filter(|m| m.size > 0) else {
                continue;
            };
            for b in &self.recs[i + 1..] {
                if let Some(mb) = b.rx_map.filter(|m| m.size > 0) {
                    assert!(
                        !ma.overlaps(&mb),
                        "rx mappings of {} and {} overlap",
                        a.filename(),
                        b.filename()
                    );
                }
            }
        }
    }
}
