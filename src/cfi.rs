use gimli::Register;

use crate::error::Error;

/// A portable register reference usable in summarised unwind rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiReg {
    Ip,
    Sp,
    Fp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiOp {
    Add,
    Sub,
    And,
    Mul,
}

/// A reference to an expression node in an [`ExprArena`].
///
/// Children are referenced by index, never by pointer, so growing the
/// arena while a tree is being built does not invalidate anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExprRef(u32);

/// One node of a location-expression tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiExpr {
    Binop {
        op: CfiOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },
    /// Load an `u64` from the address computed by the child.
    Deref(ExprRef),
    Const(u64),
    /// A portable register reference. The only register form allowed in
    /// a record's arena.
    Reg(CfiReg),
    /// A source-DWARF register reference. Appears only transiently while
    /// the summariser converts expressions; conversion either rewrites
    /// it into [`CfiExpr::Reg`] or rejects the row.
    DwReg(Register),
    /// The frame base of the enclosing function. Used by variable
    /// location expressions; resolved against the variable's frame-base
    /// expression before the location itself is evaluated.
    FrameBase,
}

/// Arena of expression nodes. Each object record owns one; the CFI
/// summariser additionally keeps a scratch arena per FDE.
#[derive(Default)]
pub struct ExprArena {
    nodes: Vec<CfiExpr>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: CfiExpr) -> ExprRef {
        debug_assert!(self.nodes.len() < u32::MAX as usize);
        let r = ExprRef(self.nodes.len() as u32);
        self.nodes.push(node);
        r
    }

    pub fn binop(&mut self, op: CfiOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        self.push(CfiExpr::Binop { op, lhs, rhs })
    }

    pub fn deref(&mut self, addr: ExprRef) -> ExprRef {
        self.push(CfiExpr::Deref(addr))
    }

    pub fn constant(&mut self, value: u64) -> ExprRef {
        self.push(CfiExpr::Const(value))
    }

    pub fn reg(&mut self, reg: CfiReg) -> ExprRef {
        self.push(CfiExpr::Reg(reg))
    }

    pub fn dw_reg(&mut self, reg: Register) -> ExprRef {
        self.push(CfiExpr::DwReg(reg))
    }

    pub fn frame_base(&mut self) -> ExprRef {
        self.push(CfiExpr::FrameBase)
    }

    pub fn get(&self, r: ExprRef) -> CfiExpr {
        self.nodes[r.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// How to compute the CFA for a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaHow {
    /// `cfa = sp + offset`
    SpRel(i64),
    /// `cfa = fp + offset`
    FpRel(i64),
    Expr(ExprRef),
}

/// How to recover one register value given the CFA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegHow {
    Unknown,
    /// Same value as in the current frame.
    Same,
    /// `value = cfa + offset`
    CfaRel(i64),
    /// `value = *(cfa + offset)`
    MemCfaRel(i64),
    Expr(ExprRef),
}

/// A summarised unwind row covering the instruction range
/// `[base, base + len)`.
///
/// If `(ip, sp, fp)` are known and `ip` lies in the range, the row says
/// how to compute the CFA and from it the caller's ip/sp/fp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CfiRow {
    pub base: u64,
    pub len: u32,
    pub cfa: CfaHow,
    pub ra: RegHow,
    pub sp: RegHow,
    pub fp: RegHow,
}

impl CfiRow {
    pub fn contains(&self, avma: u64) -> bool {
        avma >= self.base && avma - self.base < u64::from(self.len)
    }
}

/// Everything an expression evaluation may consult: the current register
/// values (absent for global-variable locations, which must not depend
/// on any register), the resolved frame base (variable lookups only),
/// and the accessible guest-memory range for dereferences.
pub(crate) struct EvalCtx {
    /// `(ip, sp, fp)` of the frame being examined.
    pub regs: Option<(u64, u64, u64)>,
    pub frame_base: Option<u64>,
    pub min_accessible: u64,
    pub max_accessible: u64,
}

impl EvalCtx {
    /// Is an 8-byte load at `addr` entirely inside the sandbox?
    fn readable(&self, addr: u64) -> bool {
        addr >= self.min_accessible
            && addr
                .checked_add(7)
                .is_some_and(|end| end <= self.max_accessible)
    }
}

/// Evaluate the expression rooted at `ix`. Returns `None` on any
/// failure: out-of-sandbox dereference, unresolved frame base, or a
/// source-register node that survived conversion.
pub(crate) fn eval_expr<F>(
    arena: &ExprArena,
    ix: ExprRef,
    ctx: &EvalCtx,
    read: &mut F,
) -> Option<u64>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    match arena.get(ix) {
        CfiExpr::Binop { op, lhs, rhs } => {
            let l = eval_expr(arena, lhs, ctx, read)?;
            let r = eval_expr(arena, rhs, ctx, read)?;
            Some(match op {
                CfiOp::Add => l.wrapping_add(r),
                CfiOp::Sub => l.wrapping_sub(r),
                CfiOp::And => l & r,
                CfiOp::Mul => l.wrapping_mul(r),
            })
        }
        CfiExpr::Deref(addr) => {
            let a = eval_expr(arena, addr, ctx, read)?;
            if !ctx.readable(a) {
                return None;
            }
            read(a).ok()
        }
        CfiExpr::Const(c) => Some(c),
        CfiExpr::Reg(CfiReg::Ip) => ctx.regs.map(|(ip, _, _)| ip),
        CfiExpr::Reg(CfiReg::Sp) => ctx.regs.map(|(_, sp, _)| sp),
        CfiExpr::Reg(CfiReg::Fp) => ctx.regs.map(|(_, _, fp)| fp),
        // Conversion is the only producer of DwReg nodes and rewrites
        // them or rejects the row, so hitting one here is a query
        // failure, not a panic.
        CfiExpr::DwReg(_) => None,
        CfiExpr::FrameBase => ctx.frame_base,
    }
}

impl CfaHow {
    pub(crate) fn compute<F>(&self, arena: &ExprArena, ctx: &EvalCtx, read: &mut F) -> Result<u64, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let (_, sp, fp) = ctx.regs.ok_or(Error::ExpressionFailed)?;
        match *self {
            CfaHow::SpRel(off) => add_offset(sp, off),
            CfaHow::FpRel(off) => add_offset(fp, off),
            CfaHow::Expr(ix) => {
                eval_expr(arena, ix, ctx, read).ok_or(Error::ExpressionFailed)
            }
        }
    }
}

impl RegHow {
    /// Recover one caller-frame register value. `current` is the
    /// register's value in this frame (for the `Same` rule).
    pub(crate) fn recover<F>(
        &self,
        arena: &ExprArena,
        cfa: u64,
        current: u64,
        ctx: &EvalCtx,
        read: &mut F,
    ) -> Result<u64, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        match *self {
            RegHow::Unknown => Err(Error::RegisterRuleUnknown),
            RegHow::Same => Ok(current),
            RegHow::CfaRel(off) => add_offset(cfa, off),
            RegHow::MemCfaRel(off) => {
                let a = add_offset(cfa, off)?;
                if !ctx.readable(a) {
                    return Err(Error::AddressOutsideSandbox(a));
                }
                read(a).map_err(|_| Error::CouldNotReadStack(a))
            }
            RegHow::Expr(ix) => {
                eval_expr(arena, ix, ctx, read).ok_or(Error::ExpressionFailed)
            }
        }
    }
}

fn add_offset(base: u64, off: i64) -> Result<u64, Error> {
    base.checked_add_signed(off).ok_or(Error::IntegerOverflow)
}
