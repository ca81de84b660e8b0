//! A queryable in-memory database of debug information for the objects
//! loaded into a running process.
//!
//! The embedding framework feeds this crate mapping notifications
//! ([`DebugDb::notify_mmap`] and friends) as the dynamic linker maps and
//! unmaps objects. Whenever both the read+execute and read+write mappings
//! of an object have been observed, the object's debug info is read
//! through a [`DebugReader`], canonicalised, and becomes visible to
//! queries:
//!
//! - [`DebugDb::describe_code_address`]: which object / function /
//!   source line does a code address belong to?
//! - [`DebugDb::unwind_one_frame`]: given `(ip, sp, fp)`, what were the
//!   caller frame's register values? Backed by summarised DWARF CFI and
//!   a direct-mapped per-address cache.
//! - [`DebugDb::describe_data_address`]: which global or local variable
//!   covers a data address, in which frame of which thread?
//!
//! All state lives in the [`DebugDb`] value; there is no global state and
//! no internal concurrency. Every entry point runs to completion before
//! returning, so the embedder can call it from synchronous callbacks.

mod arch;
mod cfi;
mod elf;
mod error;
mod interner;
mod line;
mod query;
mod record;
mod registry;
mod storage;
mod summarize;
mod unwind;
mod var;

pub use arch::{Aarch64, Arch, X86_64};
pub use cfi::{CfaHow, CfiExpr, CfiOp, CfiReg, CfiRow, ExprArena, ExprRef, RegHow};
pub use elf::ElfReader;
pub use error::{Error, ReadError};
pub use interner::{StrRef, StringTable};
pub use query::{CodeDescription, DataDescription, ThreadStacks};
pub use record::{Extent, Mapping, ObjectRecord, PdbBiases, SectionMap};
pub use registry::{
    AddressSpace, DebugDb, DebugReader, Demangler, MappingPolicy, NullRedir, RedirObserver,
    Segment, SegmentKind,
};
pub use storage::{FpoEntry, LineRecord, Symbol};
pub use unwind::UnwindRegs;
pub use var::{AddrRange, TypeRef, Variable};
