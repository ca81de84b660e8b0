//! Turns DWARF line programs into the per-object line table.
//!
//! gimli runs the line-number state machine; this module watches the
//! row stream and emits one record per statement-boundary interval,
//! the way the rest of the crate wants them: `[boundary, next)` with
//! the boundary's file and line. File and directory names are interned
//! once per program and reused across records.

use std::collections::HashMap;

use gimli::{EndianSlice, IncompleteLineProgram, LineProgramHeader, LittleEndian};
use tracing::trace;

use crate::interner::StrRef;
use crate::record::ObjectRecord;

type Slice<'d> = EndianSlice<'d, LittleEndian>;

struct Boundary {
    avma: u64,
    file: u64,
    line: u32,
}

/// Run one compilation unit's line program and add its records.
pub(crate) fn read_line_program<'d>(
    program: IncompleteLineProgram<Slice<'d>>,
    comp_dir: Option<&str>,
    text_bias: u64,
    rec: &mut ObjectRecord,
) -> Result<(), gimli::Error> {
    let mut names: HashMap<u64, (StrRef, Option<StrRef>)> = HashMap::new();
    let mut boundary: Option<Boundary> = None;

    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        // Code cannot live at address zero; rows there come from
        // sequences the linker dropped.
        if row.address() == 0 {
            continue;
        }
        let avma = row.address().wrapping_add(text_bias);

        if row.end_sequence() {
            if let Some(b) = boundary.take() {
                emit(rec, header, &mut names, comp_dir, &b, avma);
            }
            continue;
        }
        if !row.is_stmt() {
            continue;
        }
        if let Some(b) = &boundary {
            if avma > b.avma {
                emit(rec, header, &mut names, comp_dir, b, avma);
            }
        }
        boundary = Some(Boundary {
            avma,
            file: row.file_index(),
            line: row.line().map_or(0, |l| l.get().min(u64::from(u32::MAX)) as u32),
        });
    }
    Ok(())
}

fn emit(
    rec: &mut ObjectRecord,
    header: &LineProgramHeader<Slice<'_>>,
    names: &mut HashMap<u64, (StrRef, Option<StrRef>)>,
    comp_dir: Option<&str>,
    b: &Boundary,
    end: u64,
) {
    let (file, dir) = resolve_file(rec, header, names, comp_dir, b.file);
    rec.add_line_span(b.avma, end, b.line, file, dir);
}

/// Look up (and intern, once) the file and directory names for a file
/// index. Index resolution failures map to a placeholder name rather
/// than losing the record.
fn resolve_file(
    rec: &mut ObjectRecord,
    header: &LineProgramHeader<Slice<'_>>,
    names: &mut HashMap<u64, (StrRef, Option<StrRef>)>,
    comp_dir: Option<&str>,
    index: u64,
) -> (StrRef, Option<StrRef>) {
    if let Some(&cached) = names.get(&index) {
        return cached;
    }

    let mut file_name = None;
    let mut dir_name = None;
    if let Some(entry) = header.file(index) {
        if let Some(name) = attr_string(entry.path_name()) {
            file_name = Some(name);
        }
        if let Some(dir) = entry.directory(header).and_then(attr_string) {
            dir_name = Some(dir);
        }
    } else {
        trace!(index, "line row references unknown file index");
    }

    let file_name = file_name.unwrap_or_else(|| "???".to_owned());
    // Absolute file paths stand alone; otherwise resolve the directory
    // against the compilation directory.
    let dir_name = if file_name.starts_with('/') {
        None
    } else {
        match (dir_name, comp_dir) {
            (Some(d), _) if d.starts_with('/') => Some(d),
            (Some(d), Some(cd)) => Some(format!("{cd}/{d}")),
            (Some(d), None) => Some(d),
            (None, Some(cd)) => Some(cd.to_owned()),
            (None, None) => None,
        }
    };

    let file = rec.intern(&file_name);
    let dir = dir_name.map(|d| rec.intern(&d));
    names.insert(index, (file, dir));
    (file, dir)
}

fn attr_string(attr: gimli::AttributeValue<Slice<'_>>) -> Option<String> {
    match attr {
        gimli::AttributeValue::String(s) => Some(s.to_string_lossy().into_owned()),
        _ => None,
    }
}
