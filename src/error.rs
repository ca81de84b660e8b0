/// The error type returned by queries and by the unwind entry points.
///
/// A query failure never leaves any persistent state behind; the caller's
/// register values are untouched and the database is unchanged.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("No unwind info covers address 0x{0:x}")]
    NoUnwindInfo(u64),

    #[error("Could not read stack memory at 0x{0:x}")]
    CouldNotReadStack(u64),

    #[error("Stack address 0x{0:x} is outside the accessible range")]
    AddressOutsideSandbox(u64),

    #[error("The unwind rule for the register is unknown")]
    RegisterRuleUnknown,

    #[error("Location expression evaluation failed")]
    ExpressionFailed,

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,
}

/// The error type produced while reading one object's debug info.
///
/// Reader errors stay local to the record being populated: the record
/// keeps its mapping descriptors, `have_dinfo` stays false, and later
/// mappings of the same image coalesce normally.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("I/O error on object file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object parsing failed: {0}")]
    Object(#[from] object::read::Error),

    #[error("DWARF parsing failed: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("Object has no usable text mapping")]
    NoTextMapping,

    #[error("Unrecognized object format")]
    UnrecognizedFormat,
}
