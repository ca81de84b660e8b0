//! The bundled ELF debug-info reader.
//!
//! Walks the object's sections and fills the record's section map,
//! symbol table, line table and CFI table. DIE-level variable and type
//! information is not read here; richer readers populate the variable
//! tree through the same [`ObjectRecord`] API.

use std::marker::PhantomData;

use gimli::{BaseAddresses, EndianSlice, LittleEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use tracing::debug;

use crate::arch::Arch;
use crate::error::ReadError;
use crate::line::read_line_program;
use crate::record::{Extent, ObjectRecord};
use crate::registry::DebugReader;
use crate::storage::Symbol;
use crate::summarize::{read_debug_frame, read_eh_frame};

type Slice<'d> = EndianSlice<'d, LittleEndian>;

const ELF_MAGIC: &[u8; 4] = &[0x7f, b'E', b'L', b'F'];

pub struct ElfReader<A: Arch> {
    _arch: PhantomData<A>,
}

impl<A: Arch> ElfReader<A> {
    pub fn new() -> Self {
        Self { _arch: PhantomData }
    }
}

impl<A: Arch> Default for ElfReader<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> DebugReader for ElfReader<A> {
    fn recognizes(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(ELF_MAGIC)
    }

    fn read(&mut self, rec: &mut ObjectRecord, image: &[u8]) -> Result<(), ReadError> {
        let file = object::File::parse(image)?;
        let rx = *rec.rx_mapping().ok_or(ReadError::NoTextMapping)?;

        // Position-independent objects state addresses from (close to)
        // zero; what the loader adds to them is the bias. Fixed-address
        // executables are loaded where they state.
        let bias = match file.kind() {
            object::ObjectKind::Dynamic => rx.avma.wrapping_sub(rx.foff),
            _ => 0,
        };
        rec.set_text_bias(bias);

        let extent_of = |name: &str| -> Option<Extent> {
            let s = file.section_by_name(name)?;
            (s.size() > 0).then(|| Extent {
                avma: s.address().wrapping_add(bias),
                size: s.size(),
            })
        };
        {
            let sections = rec.sections_mut();
            sections.text = extent_of(".text");
            sections.data = extent_of(".data");
            sections.sdata = extent_of(".sdata");
            sections.bss = extent_of(".bss");
            sections.sbss = extent_of(".sbss");
            sections.rodata = extent_of(".rodata");
            sections.plt = extent_of(".plt");
            sections.got = extent_of(".got");
            sections.got_plt = extent_of(".got.plt");
            sections.opd = extent_of(".opd");
        }

        if file.kind() == object::ObjectKind::Dynamic {
            // Shared objects are matched by soname in by-name lookups;
            // the file's base name is what the soname is in practice.
            let soname = rec
                .filename()
                .rsplit_once('/')
                .map_or_else(|| rec.filename().to_owned(), |(_, base)| base.to_owned());
            rec.set_soname(&soname);
        }

        for sym in file.symbols().chain(file.dynamic_symbols()) {
            let is_text = match sym.kind() {
                object::SymbolKind::Text => true,
                object::SymbolKind::Data => false,
                _ => continue,
            };
            if !sym.is_definition() || sym.size() == 0 {
                continue;
            }
            let Ok(name) = sym.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let name = rec.intern(name);
            rec.add_symbol(Symbol {
                avma: sym.address().wrapping_add(bias),
                tocptr: 0,
                size: u32::try_from(sym.size()).unwrap_or(u32::MAX),
                name,
                is_text,
            });
        }

        // Line numbers, one compilation unit at a time. A malformed unit
        // loses only itself.
        let dwarf = gimli::Dwarf::load(|id| -> Result<Slice, gimli::Error> {
            Ok(Slice::new(section_data(&file, id.name()), LittleEndian))
        })?;
        let mut units = dwarf.units();
        loop {
            let header = match units.next() {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) => {
                    debug!(file = rec.filename(), error = %e, "bad compilation unit header");
                    break;
                }
            };
            let unit = match dwarf.unit(header) {
                Ok(u) => u,
                Err(e) => {
                    debug!(file = rec.filename(), error = %e, "skipping unreadable unit");
                    continue;
                }
            };
            if let Some(program) = unit.line_program.clone() {
                let comp_dir = unit.comp_dir.map(|d| d.to_string_lossy().into_owned());
                if let Err(e) = read_line_program(program, comp_dir.as_deref(), bias, rec) {
                    debug!(file = rec.filename(), error = %e, "line program failed");
                }
            }
        }

        // Call-frame info. Section addresses for gimli are stated ones;
        // the summariser rebiases row addresses itself.
        let svma_of = |name: &str| file.section_by_name(name).map_or(0, |s| s.address());
        let bases = BaseAddresses::default()
            .set_eh_frame(svma_of(".eh_frame"))
            .set_eh_frame_hdr(svma_of(".eh_frame_hdr"))
            .set_text(svma_of(".text"))
            .set_got(svma_of(".got"));

        let eh_frame = section_data(&file, ".eh_frame");
        if !eh_frame.is_empty() {
            if let Err(e) = read_eh_frame::<A>(eh_frame, &bases, bias, rec) {
                debug!(file = rec.filename(), error = %e, ".eh_frame summarisation failed");
            }
        }
        let debug_frame = section_data(&file, ".debug_frame");
        if !debug_frame.is_empty() {
            if let Err(e) = read_debug_frame::<A>(debug_frame, &bases, bias, rec) {
                debug!(file = rec.filename(), error = %e, ".debug_frame summarisation failed");
            }
        }

        Ok(())
    }
}

fn section_data<'d>(file: &object::File<'d>, name: &str) -> &'d [u8] {
    file.section_by_name(name)
        .and_then(|s| s.data().ok())
        .unwrap_or(&[])
}
