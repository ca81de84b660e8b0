use std::fmt::Debug;

use crate::cfi::EvalCtx;
use crate::error::Error;
use crate::registry::{AddressSpace, DebugDb, DebugReader};

/// The register triple a one-step unwind consumes and produces.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UnwindRegs {
    ip: u64,
    sp: u64,
    fp: u64,
}

impl UnwindRegs {
    pub fn new(ip: u64, sp: u64, fp: u64) -> Self {
        Self { ip, sp, fp }
    }

    #[inline(always)]
    pub fn ip(&self) -> u64 {
        self.ip
    }
    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.sp
    }
    #[inline(always)]
    pub fn fp(&self) -> u64 {
        self.fp
    }
}

impl Debug for UnwindRegs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindRegs")
            .field("ip", &format_args!("{:#x}", self.ip))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("fp", &format_args!("{:#x}", self.fp))
            .finish()
    }
}

impl<S: AddressSpace, R: DebugReader> DebugDb<S, R> {
    /// Compute the caller frame's `(ip, sp, fp)` from the current one
    /// using summarised DWARF CFI.
    ///
    /// Stack memory is only read through `read_stack`, and only at
    /// addresses wholly inside `[min_accessible, max_accessible]`. On
    /// failure nothing is returned and nothing was written: the caller's
    /// register values are untouched.
    pub fn unwind_one_frame<F>(
        &mut self,
        regs: &UnwindRegs,
        min_accessible: u64,
        max_accessible: u64,
        read_stack: &mut F,
    ) -> Result<UnwindRegs, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let ip = regs.ip();
        let (handle, ix) = self
            .find_cfi_row(ip)
            .ok_or(Error::NoUnwindInfo(ip))?;
        let rec = self
            .object_by_handle(handle)
            .ok_or(Error::NoUnwindInfo(ip))?;
        let row = rec.cfi_rows()[ix as usize];
        debug_assert!(row.contains(ip));

        let ctx = EvalCtx {
            regs: Some((ip, regs.sp(), regs.fp())),
            frame_base: None,
            min_accessible,
            max_accessible,
        };
        let arena = rec.exprs();
        let cfa = row.cfa.compute(arena, &ctx, read_stack)?;
        let ip2 = row.ra.recover(arena, cfa, regs.ip(), &ctx, read_stack)?;
        let sp2 = row.sp.recover(arena, cfa, regs.sp(), &ctx, read_stack)?;
        let fp2 = row.fp.recover(arena, cfa, regs.fp(), &ctx, read_stack)?;
        Ok(UnwindRegs::new(ip2, sp2, fp2))
    }

    /// One-step unwind through an FPO entry (PDB-sourced objects).
    ///
    /// The frame layout on entry to the procedure body is fixed:
    ///
    /// ```text
    /// sp ->  4 * cb_regs     saved registers
    ///        4 * cdw_locals  locals
    ///        return address
    ///        4 * cdw_params  parameters       <- caller's sp
    /// ```
    pub fn unwind_one_frame_fpo<F>(
        &mut self,
        regs: &UnwindRegs,
        min_accessible: u64,
        max_accessible: u64,
        read_stack: &mut F,
    ) -> Result<UnwindRegs, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let ip = regs.ip();
        let (handle, ix) = self.find_fpo_entry(ip).ok_or(Error::NoUnwindInfo(ip))?;
        let rec = self
            .object_by_handle(handle)
            .ok_or(Error::NoUnwindInfo(ip))?;
        let fpo = rec.fpotab().ents()[ix as usize];

        let sp = regs.sp();
        let sandboxed_read = |addr: u64, read: &mut F| -> Result<u64, Error> {
            let in_bounds = addr >= min_accessible
                && addr
                    .checked_add(7)
                    .is_some_and(|end| end <= max_accessible);
            if !in_bounds {
                return Err(Error::AddressOutsideSandbox(addr));
            }
            read(addr).map_err(|_| Error::CouldNotReadStack(addr))
        };

        let ra_slot = sp
            .checked_add(4 * u64::from(fpo.cb_regs + fpo.cdw_locals))
            .ok_or(Error::IntegerOverflow)?;
        let ip2 = sandboxed_read(ra_slot, read_stack)?;
        let sp2 = sp
            .checked_add(4 * u64::from(fpo.cb_regs + fpo.cdw_locals + 1 + fpo.cdw_params))
            .ok_or(Error::IntegerOverflow)?;
        let fp_slot = sp.checked_add(8).ok_or(Error::IntegerOverflow)?;
        let fp2 = sandboxed_read(fp_slot, read_stack)?;
        Ok(UnwindRegs::new(ip2, sp2, fp2))
    }
}
