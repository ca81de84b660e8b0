use gimli::Register;

use crate::cfi::CfiReg;

/// The architecture parameter for the CFI summariser.
///
/// Summarised unwind rows use portable IP/SP/FP register references; the
/// architecture decides which DWARF register numbers those correspond to.
pub trait Arch {
    /// The DWARF number of the stack pointer register.
    const SP: Register;
    /// The DWARF number of the frame pointer register.
    const FP: Register;

    /// Map a DWARF register number to a portable register, if it has
    /// one. `ra_reg` is the return-address register named by the CIE.
    fn cfi_reg(reg: Register, ra_reg: Register) -> Option<CfiReg> {
        if reg == Self::SP {
            Some(CfiReg::Sp)
        } else if reg == Self::FP {
            Some(CfiReg::Fp)
        } else if reg == ra_reg {
            Some(CfiReg::Ip)
        } else {
            None
        }
    }
}

pub struct X86_64;

impl Arch for X86_64 {
    const SP: Register = gimli::X86_64::RSP;
    const FP: Register = gimli::X86_64::RBP;
}

pub struct Aarch64;

impl Arch for Aarch64 {
    const SP: Register = gimli::AArch64::SP;
    const FP: Register = gimli::AArch64::X29;
}
