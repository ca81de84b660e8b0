//! End-to-end lifecycle tests: mapping notifications in, queries out,
//! with fake address-space and reader collaborators standing in for the
//! embedding framework.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use framedb::{
    AddressSpace, CfaHow, CfiOp, CfiReg, CfiRow, DebugDb, DebugReader, Error, Extent, FpoEntry,
    Mapping, MappingPolicy, ObjectRecord, ReadError, RegHow, Segment, SegmentKind, Symbol,
    ThreadStacks, UnwindRegs, Variable,
};

const ELF_MAGIC: &[u8] = b"\x7fELF\x02\x01\x01\x00";

#[derive(Default)]
struct SpaceState {
    segments: Vec<Segment>,
    files: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeSpace {
    inner: Rc<RefCell<SpaceState>>,
}

impl FakeSpace {
    fn add_file(&self, path: &str) {
        self.inner.borrow_mut().files.push(path.to_owned());
    }

    fn add_segment(&self, avma: u64, size: u64, perms: (bool, bool, bool), path: &str) {
        self.inner.borrow_mut().segments.push(Segment {
            avma,
            size,
            foff: 0,
            read: perms.0,
            write: perms.1,
            execute: perms.2,
            kind: SegmentKind::File {
                filename: path.to_owned(),
                member: None,
            },
        });
    }

    fn drop_segments_overlapping(&self, avma: u64, len: u64) {
        self.inner
            .borrow_mut()
            .segments
            .retain(|s| s.avma + s.size <= avma || s.avma >= avma + len);
    }
}

impl AddressSpace for FakeSpace {
    fn segment_at(&self, avma: u64) -> Option<Segment> {
        self.inner
            .borrow()
            .segments
            .iter()
            .find(|s| avma >= s.avma && avma < s.avma + s.size)
            .cloned()
    }

    fn is_regular_file(&self, path: &str) -> bool {
        self.inner.borrow().files.iter().any(|f| f == path)
    }

    fn file_prefix(&self, path: &str, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.is_regular_file(path) {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        }
        let n = ELF_MAGIC.len().min(buf.len());
        buf[..n].copy_from_slice(&ELF_MAGIC[..n]);
        Ok(n)
    }

    fn file_image(&self, path: &str) -> std::io::Result<Vec<u8>> {
        if !self.is_regular_file(path) {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        }
        Ok(ELF_MAGIC.to_vec())
    }

    fn file_mtime(&self, _path: &str) -> std::io::Result<u64> {
        Ok(1)
    }
}

type Plan = Box<dyn Fn(&mut ObjectRecord) -> Result<(), ReadError>>;

#[derive(Default)]
struct FakeReader {
    plans: HashMap<String, Plan>,
}

impl FakeReader {
    fn plan(mut self, path: &str, f: impl Fn(&mut ObjectRecord) -> Result<(), ReadError> + 'static) -> Self {
        self.plans.insert(path.to_owned(), Box::new(f));
        self
    }
}

impl DebugReader for FakeReader {
    fn recognizes(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(b"\x7fELF")
    }

    fn read(&mut self, rec: &mut ObjectRecord, _image: &[u8]) -> Result<(), ReadError> {
        match self.plans.get(rec.filename()) {
            Some(plan) => plan(rec),
            None => Err(ReadError::UnrecognizedFormat),
        }
    }
}

/// The standard fixture object: function `foo` at text+0x100 spanning 32
/// bytes, one line record covering it mapped to foo.c:10, and CFI for
/// the same range saying CFA = SP+16, RA = *(CFA-8), FP unchanged.
fn fixture_plan(rec: &mut ObjectRecord) -> Result<(), ReadError> {
    let rx = *rec.rx_mapping().unwrap();
    rec.sections_mut().text = Some(Extent {
        avma: rx.avma,
        size: rx.size,
    });
    let name = rec.intern("foo");
    rec.add_symbol(Symbol {
        avma: rx.avma + 0x100,
        tocptr: 0,
        size: 32,
        name,
        is_text: true,
    });
    let file = rec.intern("foo.c");
    rec.add_line_span(rx.avma + 0x100, rx.avma + 0x120, 10, file, None);
    rec.add_cfi_row(CfiRow {
        base: rx.avma + 0x100,
        len: 0x20,
        cfa: CfaHow::SpRel(16),
        ra: RegHow::MemCfaRel(-8),
        sp: RegHow::CfaRel(0),
        fp: RegHow::Same,
    });
    Ok(())
}

fn db_with(
    space: &FakeSpace,
    reader: FakeReader,
) -> DebugDb<FakeSpace, FakeReader> {
    DebugDb::new(space.clone(), reader, MappingPolicy::strict())
}

/// Map the rx then rw halves of an object and return the handle from
/// the completing notification.
fn map_object(db: &mut DebugDb<FakeSpace, FakeReader>, space: &FakeSpace, path: &str, base: u64) -> u64 {
    space.add_file(path);
    space.add_segment(base, 0x1000, (true, false, true), path);
    assert_eq!(db.notify_mmap(base, false), 0, "rx alone must not acquire");
    space.add_segment(base + 0x1000, 0x1000, (true, true, false), path);
    db.notify_mmap(base + 0x1000, false)
}

#[test]
fn single_elf_acquisition() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", fixture_plan);
    let mut db = db_with(&space, reader);

    let handle = map_object(&mut db, &space, "/bin/prog", 0x400000);
    assert!(handle > 0);

    let d = db.describe_code_address(0x400110);
    assert_eq!(d.function.as_deref(), Some("foo"));
    assert_eq!(d.file.as_deref(), Some("foo.c"));
    assert_eq!(d.line, Some(10));
    assert_eq!(d.object.as_deref(), Some("/bin/prog"));

    // The returned line record's range contains the probe.
    let (_, _, line) = db.source_location(0x40011f).unwrap();
    assert_eq!(line, 10);
    assert!(db.source_location(0x400120).is_none());

    // Entry-point matching is exact.
    assert_eq!(db.function_name_if_entry(0x400100).as_deref(), Some("foo"));
    assert_eq!(db.function_name_if_entry(0x400101), None);
}

#[test]
fn unmap_discards_and_cache_stays_coherent() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", fixture_plan);
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    // Warm the CFI fast path.
    let sp = 0x7fff_0000u64;
    let mut read = move |addr| if addr == sp + 8 { Ok(0xdead_beef) } else { Err(()) };
    let regs = UnwindRegs::new(0x400110, sp, 0x7fff_1000);
    assert!(db
        .unwind_one_frame(&regs, sp, sp + 0x1000, &mut read)
        .is_ok());

    space.drop_segments_overlapping(0x400000, 0x2000);
    db.notify_munmap(0x400000, 0x2000);

    assert_eq!(db.describe_code_address(0x400110), Default::default());
    assert_eq!(
        db.unwind_one_frame(&regs, sp, sp + 0x1000, &mut read),
        Err(Error::NoUnwindInfo(0x400110))
    );
    assert_eq!(db.objects().count(), 0);
}

#[test]
fn overlapping_mapping_replaces_old_record() {
    let space = FakeSpace::default();
    let reader = FakeReader::default()
        .plan("/bin/prog", fixture_plan)
        .plan("/lib/other.so", fixture_plan);
    let mut db = db_with(&space, reader);

    let h1 = map_object(&mut db, &space, "/bin/prog", 0x400000);
    assert!(h1 > 0);

    // A different file lands on the same addresses without an unmap.
    space.drop_segments_overlapping(0x400000, 0x2000);
    let h2 = map_object(&mut db, &space, "/lib/other.so", 0x400000);
    assert!(h2 > h1, "handles are strictly increasing");

    let names: Vec<_> = db.objects().map(|r| r.filename().to_owned()).collect();
    assert_eq!(names, vec!["/lib/other.so"]);

    // The survivor answers; the old handle is gone.
    assert!(db.object_by_handle(h1).is_none());
    assert!(db.object_by_handle(h2).is_some());
    assert_eq!(
        db.describe_code_address(0x400110).function.as_deref(),
        Some("foo")
    );
}

#[test]
fn cfi_unwind_round_trip() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", fixture_plan);
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    let sp = 0x7fff_0000u64;
    let fp = 0x7fff_2000u64;
    // RA slot is CFA-8 = (sp+16)-8 = sp+8.
    let mut read = move |addr| if addr == sp + 8 { Ok(0xdead_beefu64) } else { Err(()) };

    let regs = UnwindRegs::new(0x400110, sp, fp);
    let caller = db
        .unwind_one_frame(&regs, sp, sp + 0x1000, &mut read)
        .unwrap();
    assert_eq!(caller.ip(), 0xdead_beef);
    assert_eq!(caller.sp(), sp + 16);
    assert_eq!(caller.fp(), fp);

    // Same probe with the RA slot outside the accessible range fails
    // and produces nothing.
    let res = db.unwind_one_frame(&regs, sp + 0x10, sp + 0x1000, &mut read);
    assert_eq!(res, Err(Error::AddressOutsideSandbox(sp + 8)));
}

#[test]
fn expression_cfa_with_out_of_range_deref_fails_cleanly() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", |rec| {
        let rx = *rec.rx_mapping().unwrap();
        rec.sections_mut().text = Some(Extent {
            avma: rx.avma,
            size: rx.size,
        });
        // CFA = *(sp - 1): the load straddles the bottom of the
        // accessible range and must fail the whole unwind.
        let arena = rec.exprs_mut();
        let spr = arena.reg(CfiReg::Sp);
        let one = arena.constant(1);
        let below = arena.binop(CfiOp::Sub, spr, one);
        let cfa = arena.deref(below);
        rec.add_cfi_row(CfiRow {
            base: 0x400100,
            len: 0x20,
            cfa: CfaHow::Expr(cfa),
            ra: RegHow::MemCfaRel(-8),
            sp: RegHow::CfaRel(0),
            fp: RegHow::Same,
        });
        Ok(())
    });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    let sp = 0x7fff_0000u64;
    let mut read = |_| Ok(0u64);
    let regs = UnwindRegs::new(0x400110, sp, 0);
    assert_eq!(
        db.unwind_one_frame(&regs, sp, sp + 0x1000, &mut read),
        Err(Error::ExpressionFailed)
    );
}

#[test]
fn reorder_does_not_change_results() {
    let space = FakeSpace::default();
    let reader = FakeReader::default()
        .plan("/bin/prog", fixture_plan)
        .plan("/lib/other.so", |rec| {
            let rx = *rec.rx_mapping().unwrap();
            rec.sections_mut().text = Some(Extent {
                avma: rx.avma,
                size: rx.size,
            });
            let name = rec.intern("bar");
            rec.add_symbol(Symbol {
                avma: 0x500100,
                tocptr: 0,
                size: 32,
                name,
                is_text: true,
            });
            rec.add_cfi_row(CfiRow {
                base: 0x500100,
                len: 0x20,
                cfa: CfaHow::SpRel(8),
                ra: RegHow::MemCfaRel(-8),
                sp: RegHow::CfaRel(0),
                fp: RegHow::Same,
            });
            Ok(())
        });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);
    map_object(&mut db, &space, "/lib/other.so", 0x500000);

    let baseline_foo = db.describe_code_address(0x400110);
    let baseline_bar = db.describe_code_address(0x500110);

    // Distinct probe addresses so each search misses the cache; enough
    // of them to trip the move-to-front heuristic several times.
    let sp = 0x7fff_0000u64;
    for i in 0..100u64 {
        let mut read = move |addr| if addr == sp { Ok(1u64) } else { Err(()) };
        let regs = UnwindRegs::new(0x500100 + (i % 0x20), sp, 0);
        let _ = db.unwind_one_frame(&regs, sp, sp + 0x100, &mut read);
    }

    assert_eq!(db.describe_code_address(0x400110), baseline_foo);
    assert_eq!(db.describe_code_address(0x500110), baseline_bar);
    assert_eq!(db.objects().count(), 2);
}

#[test]
fn handles_are_never_reissued() {
    let space = FakeSpace::default();
    let reader = FakeReader::default()
        .plan("/bin/prog", fixture_plan)
        .plan("/lib/other.so", fixture_plan);
    let mut db = db_with(&space, reader);

    let h1 = map_object(&mut db, &space, "/bin/prog", 0x400000);
    space.drop_segments_overlapping(0x400000, 0x2000);
    db.notify_munmap(0x400000, 0x2000);
    let h2 = map_object(&mut db, &space, "/bin/prog", 0x400000);
    space.drop_segments_overlapping(0x400000, 0x2000);
    db.notify_munmap(0x400000, 0x2000);
    let h3 = map_object(&mut db, &space, "/lib/other.so", 0x400000);

    assert!(h1 > 0);
    assert!(h2 > h1);
    assert!(h3 > h2);
}

#[test]
fn mprotect_is_ignored() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", fixture_plan);
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    db.notify_mprotect(0x400000, 0x2000, (true, true, false));
    assert_eq!(
        db.describe_code_address(0x400110).function.as_deref(),
        Some("foo")
    );
}

#[test]
fn acquired_cfi_tables_are_ordered_and_bounded() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", |rec| {
        fixture_plan(rec)?;
        // Deliberately unsorted and overlapping input rows.
        rec.add_cfi_row(CfiRow {
            base: 0x400090,
            len: 0x80,
            cfa: CfaHow::SpRel(8),
            ra: RegHow::MemCfaRel(-8),
            sp: RegHow::CfaRel(0),
            fp: RegHow::Same,
        });
        Ok(())
    });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    let rec = db.objects().next().unwrap();
    let rows = rec.cfi_rows();
    assert!(!rows.is_empty());
    for w in rows.windows(2) {
        assert!(w[0].base + u64::from(w[0].len) <= w[1].base);
    }
}

#[test]
fn discard_all_empties_the_registry() {
    let space = FakeSpace::default();
    let reader = FakeReader::default()
        .plan("/bin/prog", fixture_plan)
        .plan("/lib/other.so", fixture_plan);
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);
    map_object(&mut db, &space, "/lib/other.so", 0x600000);
    assert_eq!(db.objects().count(), 2);

    db.discard_all();
    assert_eq!(db.objects().count(), 0);
    assert_eq!(db.describe_code_address(0x400110), Default::default());
}

#[test]
fn symbol_lookup_by_name_honours_soname_glob() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/lib/libc-2.31.so", |rec| {
        fixture_plan(rec)?;
        rec.set_soname("libc.so.6");
        Ok(())
    });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/lib/libc-2.31.so", 0x400000);

    assert_eq!(
        db.lookup_symbol_by_name("libc.so*", "foo", false),
        Some((0x400100, 0))
    );
    assert_eq!(db.lookup_symbol_by_name("libm*", "foo", false), None);
    assert_eq!(db.lookup_symbol_by_name("*", "nosuch", false), None);
    // TOC-requiring lookups reject TOC-less symbols.
    assert_eq!(db.lookup_symbol_by_name("*", "foo", true), None);
}

#[test]
fn fpo_unwind_uses_fixed_frame_layout() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/win.exe", |rec| {
        let rx = *rec.rx_mapping().unwrap();
        rec.sections_mut().text = Some(Extent {
            avma: rx.avma,
            size: rx.size,
        });
        rec.add_fpo(FpoEntry {
            avma: 0x400100,
            proc_size: 0x40,
            cb_prolog: 4,
            cb_regs: 2,
            cdw_locals: 4,
            cdw_params: 1,
        });
        Ok(())
    });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/win.exe", 0x400000);

    let sp = 0x7fff_0000u64;
    let mut read = move |addr| match addr {
        a if a == sp + 24 => Ok(0x401234u64), // return address slot
        a if a == sp + 8 => Ok(0xfeedu64),    // saved frame pointer
        _ => Err(()),
    };
    let regs = UnwindRegs::new(0x400110, sp, 7);
    let caller = db
        .unwind_one_frame_fpo(&regs, sp, sp + 0x100, &mut read)
        .unwrap();
    assert_eq!(caller.ip(), 0x401234);
    assert_eq!(caller.sp(), sp + 32);
    assert_eq!(caller.fp(), 0xfeed);

    // Shrinking the accessible range below the saved-fp slot fails the
    // whole step.
    assert_eq!(
        db.unwind_one_frame_fpo(&regs, sp + 9, sp + 0x100, &mut read),
        Err(Error::AddressOutsideSandbox(sp + 8))
    );
    // And no FPO entry means no result at all.
    let far = UnwindRegs::new(0x400200, sp, 7);
    assert_eq!(
        db.unwind_one_frame_fpo(&far, sp, sp + 0x100, &mut read),
        Err(Error::NoUnwindInfo(0x400200))
    );
}

struct OneThread {
    tid: u32,
    bounds: (u64, u64),
    regs: (u64, u64, u64),
}

impl ThreadStacks for OneThread {
    fn threads(&self) -> Vec<u32> {
        vec![self.tid]
    }

    fn stack_bounds(&self, tid: u32) -> Option<(u64, u64)> {
        (tid == self.tid).then_some(self.bounds)
    }

    fn regs(&self, tid: u32) -> Option<(u64, u64, u64)> {
        (tid == self.tid).then_some(self.regs)
    }

    fn stacktrace(&self, tid: u32, _max_frames: usize) -> Vec<(u64, u64, u64)> {
        if tid == self.tid {
            vec![self.regs]
        } else {
            Vec::new()
        }
    }
}

#[test]
fn data_address_attributed_to_local_variable() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", |rec| {
        let rx = *rec.rx_mapping().unwrap();
        rec.sections_mut().text = Some(Extent {
            avma: rx.avma,
            size: rx.size,
        });
        let name = rec.intern("bar");
        rec.add_symbol(Symbol {
            avma: 0x400100,
            tocptr: 0,
            size: 64,
            name,
            is_text: true,
        });
        // buf: 16 bytes at frame_base - 32, live over all of bar.
        let buf_name = rec.intern("buf");
        let file = rec.intern("bar.c");
        let ty = rec.add_type(None, 16).unwrap();
        let arena = rec.exprs_mut();
        let fb = arena.reg(CfiReg::Fp);
        let base = arena.frame_base();
        let minus32 = arena.constant((-32i64) as u64);
        let loc = arena.binop(CfiOp::Add, base, minus32);
        let var = Variable {
            name: buf_name,
            ty,
            location: loc,
            frame_base: Some(fb),
            file: Some(file),
            line: Some(5),
        };
        rec.add_local_var(1, &[(0x400100, 0x40013f)], &var);
        Ok(())
    });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    let fp = 0x7fff_f000u64;
    let threads = OneThread {
        tid: 1,
        bounds: (0x7fff_e000, 0x7fff_ffff),
        regs: (0x400110, fp - 0x100, fp),
    };
    // fp - 32 + 4
    let probe = 0x7fff_efe4;
    let d = db.describe_data_address(probe, &threads).unwrap();
    assert_eq!(
        d.line1,
        format!("Location 0x{probe:x} is 4 bytes inside local var \"buf\"")
    );
    assert_eq!(d.line2, "declared at bar.c:5, in frame #0 of thread 1");

    // An address past the variable's 16 bytes is not attributed.
    assert!(db.describe_data_address(fp - 32 + 16, &threads).is_none());
}

#[test]
fn data_address_attributed_to_global_variable() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", |rec| {
        let rx = *rec.rx_mapping().unwrap();
        rec.sections_mut().text = Some(Extent {
            avma: rx.avma,
            size: rx.size,
        });
        let name = rec.intern("counters");
        let ty = rec.add_type(None, 8).unwrap();
        let loc = rec.exprs_mut().constant(0x601000);
        rec.add_global_var(Variable {
            name,
            ty,
            location: loc,
            frame_base: None,
            file: None,
            line: None,
        });
        Ok(())
    });
    let mut db = db_with(&space, reader);
    map_object(&mut db, &space, "/bin/prog", 0x400000);

    let threads = OneThread {
        tid: 1,
        bounds: (0x7fff_e000, 0x7fff_ffff),
        regs: (0x400110, 0x7fff_ef00, 0x7fff_f000),
    };
    let d = db.describe_data_address(0x601004, &threads).unwrap();
    assert!(d.line1.contains("global var \"counters\""));
    assert!(d.line1.contains("4 bytes"));
    assert!(db.describe_data_address(0x601008, &threads).is_none());
}

#[test]
fn failed_read_keeps_mappings_for_coalescing() {
    let space = FakeSpace::default();
    let reader = FakeReader::default().plan("/bin/prog", |_rec| {
        Err(ReadError::UnrecognizedFormat)
    });
    let mut db = db_with(&space, reader);

    let handle = map_object(&mut db, &space, "/bin/prog", 0x400000);
    assert_eq!(handle, 0);
    // The record survives with its mappings but is invisible to queries.
    assert_eq!(db.objects().count(), 1);
    let rec = db.objects().next().unwrap();
    assert!(!rec.has_debug_info());
    assert_eq!(
        rec.rx_mapping(),
        Some(&Mapping {
            avma: 0x400000,
            size: 0x1000,
            foff: 0
        })
    );
    assert_eq!(db.describe_code_address(0x400110), Default::default());
}
