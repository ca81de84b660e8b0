//! Summarises DWARF call-frame information into the per-object table of
//! compact unwind rows.
//!
//! gimli executes the CFI byte-code; this module drives it over every
//! FDE of a frame section and converts each resulting unwind-table row
//! into a [`CfiRow`], rewriting DWARF register numbers into portable
//! IP/SP/FP references on the way. Rows that cannot be represented are
//! dropped individually; an FDE whose byte-code fails to execute
//! contributes nothing at all.

use arrayvec::ArrayVec;
use gimli::{
    BaseAddresses, CfaRule, CieOrFde, CommonInformationEntry, DebugFrame, EhFrame, Encoding,
    EndianSlice, Expression, FrameDescriptionEntry, LittleEndian, Operation, Register,
    RegisterRule, UnwindContext, UnwindOffset, UnwindSection, UnwindTableRow,
};
use tracing::{debug, trace};

use crate::arch::Arch;
use crate::cfi::{CfaHow, CfiOp, CfiRow, ExprArena, ExprRef, RegHow};
use crate::record::ObjectRecord;

type Slice<'d> = EndianSlice<'d, LittleEndian>;

/// Maximum depth of the expression conversion stack.
const EXPR_STACK: usize = 20;

/// Rows wider than this are assumed to come from corrupt input.
const MAX_ROW_SPAN: u64 = 10_000_000;

/// Why one unwind-table row could not be summarised. Rejection drops the
/// row and nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowReject {
    CfaFromUnknownRegister,
    RuleNotRepresentable,
    ReturnAddressIsSame,
    EmptyRange,
    SpanTooLarge,
    ExprParseFailed,
    ExprTooDeep,
    ExprStackUnderflow,
    ExprUnsupportedOp,
    ExprUnknownRegister,
    ExprBadDerefSize,
    ExprNoCfaAvailable,
}

pub(crate) fn read_eh_frame<'d, A: Arch>(
    data: &'d [u8],
    bases: &BaseAddresses,
    text_bias: u64,
    rec: &mut ObjectRecord,
) -> Result<(), gimli::Error> {
    let mut section = EhFrame::from(Slice::new(data, LittleEndian));
    section.set_address_size(8);
    summarize_section::<A, _>(&section, bases, text_bias, rec)
}

pub(crate) fn read_debug_frame<'d, A: Arch>(
    data: &'d [u8],
    bases: &BaseAddresses,
    text_bias: u64,
    rec: &mut ObjectRecord,
) -> Result<(), gimli::Error> {
    let mut section = DebugFrame::from(Slice::new(data, LittleEndian));
    section.set_address_size(8);
    summarize_section::<A, _>(&section, bases, text_bias, rec)
}

fn summarize_section<'d, A: Arch, Sec: UnwindSection<Slice<'d>>>(
    section: &Sec,
    bases: &BaseAddresses,
    text_bias: u64,
    rec: &mut ObjectRecord,
) -> Result<(), gimli::Error> {
    let mut ctx = Box::new(UnwindContext::new());
    let mut cur_cie: Option<CommonInformationEntry<Slice<'d>>> = None;
    let mut entries = section.entries(bases);
    while let Some(entry) = entries.next()? {
        match entry {
            CieOrFde::Cie(cie) => cur_cie = Some(cie),
            CieOrFde::Fde(partial) => {
                let fde = match partial.parse(|sec, bases, cie_offset| {
                    if let Some(cie) = &cur_cie {
                        if cie.offset() == <Sec::Offset as UnwindOffset<usize>>::into(cie_offset) {
                            return Ok(cie.clone());
                        }
                    }
                    let cie = sec.cie_from_offset(bases, cie_offset);
                    if let Ok(cie) = &cie {
                        cur_cie = Some(cie.clone());
                    }
                    cie
                }) {
                    Ok(fde) => fde,
                    Err(e) => {
                        debug!(file = rec.filename(), error = %e, "skipping unparseable FDE");
                        continue;
                    }
                };
                if let Err(e) = summarize_fde::<A, Sec>(&fde, section, bases, &mut ctx, text_bias, rec)
                {
                    debug!(
                        file = rec.filename(),
                        fde_start = format_args!("{:#x}", fde.initial_address()),
                        error = %e,
                        "CFI program failed; FDE dropped"
                    );
                }
            }
        }
    }
    Ok(())
}

/// Run one FDE and append its summarised rows. Rows are buffered so a
/// byte-code failure part way through retains nothing from this FDE.
fn summarize_fde<'d, A: Arch, Sec: UnwindSection<Slice<'d>>>(
    fde: &FrameDescriptionEntry<Slice<'d>>,
    section: &Sec,
    bases: &BaseAddresses,
    ctx: &mut UnwindContext<usize>,
    text_bias: u64,
    rec: &mut ObjectRecord,
) -> Result<(), gimli::Error> {
    let encoding = fde.cie().encoding();
    let ra_reg = fde.cie().return_address_register();
    let mut rows = Vec::new();
    {
        let mut table = fde.rows(section, bases, ctx)?;
        while let Some(row) = table.next_row()? {
            match summarize_row::<A, Sec>(row, section, encoding, ra_reg, text_bias, rec.exprs_mut())
            {
                Ok(r) => rows.push(r),
                Err(reject) => {
                    trace!(
                        start = format_args!("{:#x}", row.start_address()),
                        ?reject,
                        "cannot summarise row"
                    );
                }
            }
        }
    }
    for r in rows {
        rec.add_cfi_row(r);
    }
    Ok(())
}

/// Produce one compact row from one unwind-table row, or say why not.
fn summarize_row<'d, A: Arch, Sec: UnwindSection<Slice<'d>>>(
    row: &UnwindTableRow<usize>,
    section: &Sec,
    encoding: Encoding,
    ra_reg: Register,
    text_bias: u64,
    arena: &mut ExprArena,
) -> Result<CfiRow, RowReject> {
    let span = row
        .end_address()
        .checked_sub(row.start_address())
        .ok_or(RowReject::EmptyRange)?;
    if span == 0 {
        return Err(RowReject::EmptyRange);
    }
    if span > MAX_ROW_SPAN {
        return Err(RowReject::SpanTooLarge);
    }

    let (cfa, cfa_expr) = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            if *register == A::SP {
                (CfaHow::SpRel(*offset), None)
            } else if *register == A::FP {
                (CfaHow::FpRel(*offset), None)
            } else {
                return Err(RowReject::CfaFromUnknownRegister);
            }
        }
        CfaRule::Expression(uexpr) => {
            let expr: Expression<Slice<'d>> =
                uexpr.get(section).map_err(|_| RowReject::ExprParseFailed)?;
            let ix = convert_expression::<A>(expr, encoding, ra_reg, None, arena)?;
            (CfaHow::Expr(ix), Some(ix))
        }
    };

    // The CFA as an expression node, for register-rule expressions that
    // start from it (the DWARF initial-stack convention).
    let cfa_seed = |arena: &mut ExprArena| match (cfa, cfa_expr) {
        (_, Some(ix)) => ix,
        (CfaHow::SpRel(off), _) => {
            let r = arena.reg(crate::cfi::CfiReg::Sp);
            let c = arena.constant(off as u64);
            arena.binop(CfiOp::Add, r, c)
        }
        (CfaHow::FpRel(off), _) => {
            let r = arena.reg(crate::cfi::CfiReg::Fp);
            let c = arena.constant(off as u64);
            arena.binop(CfiOp::Add, r, c)
        }
        (CfaHow::Expr(ix), _) => ix,
    };

    let translate = |rule: RegisterRule<usize>,
                     arena: &mut ExprArena|
     -> Result<RegHow, RowReject> {
        match rule {
            RegisterRule::Undefined => Ok(RegHow::Unknown),
            RegisterRule::SameValue => Ok(RegHow::Same),
            RegisterRule::Offset(off) => Ok(RegHow::MemCfaRel(off)),
            RegisterRule::ValOffset(off) => Ok(RegHow::CfaRel(off)),
            RegisterRule::Expression(uexpr) => {
                let expr: Expression<Slice<'d>> =
                    uexpr.get(section).map_err(|_| RowReject::ExprParseFailed)?;
                let seed = cfa_seed(arena);
                let addr = convert_expression::<A>(expr, encoding, ra_reg, Some(seed), arena)?;
                // The expression computes a location; the value needs
                // one more load.
                Ok(RegHow::Expr(arena.deref(addr)))
            }
            RegisterRule::ValExpression(uexpr) => {
                let expr: Expression<Slice<'d>> =
                    uexpr.get(section).map_err(|_| RowReject::ExprParseFailed)?;
                let seed = cfa_seed(arena);
                Ok(RegHow::Expr(convert_expression::<A>(
                    expr,
                    encoding,
                    ra_reg,
                    Some(seed),
                    arena,
                )?))
            }
            _ => Err(RowReject::RuleNotRepresentable),
        }
    };

    let ra = translate(row.register(ra_reg), arena)?;
    let mut fp = translate(row.register(A::FP), arena)?;
    // Compilers emit no rule at all for an untouched frame pointer.
    if fp == RegHow::Unknown {
        fp = RegHow::Same;
    }
    // A "same as before" return address can never terminate a walk.
    if ra == RegHow::Same {
        return Err(RowReject::ReturnAddressIsSame);
    }

    Ok(CfiRow {
        base: row.start_address().wrapping_add(text_bias),
        len: span as u32,
        cfa,
        ra,
        // The SP value before the call is the CFA on the architectures
        // this summariser targets.
        sp: RegHow::CfaRel(0),
        fp,
    })
}

/// Convert a DWARF location expression into an arena tree, rewriting
/// register references into portable ones. `cfa_seed` pre-populates the
/// stack for register-rule expressions, which start with the CFA pushed.
fn convert_expression<'d, A: Arch>(
    expr: Expression<Slice<'d>>,
    encoding: Encoding,
    ra_reg: Register,
    cfa_seed: Option<ExprRef>,
    arena: &mut ExprArena,
) -> Result<ExprRef, RowReject> {
    let mut stack = ArrayVec::<ExprRef, EXPR_STACK>::new();
    if let Some(seed) = cfa_seed {
        stack.push(seed);
    }

    let push = |stack: &mut ArrayVec<ExprRef, EXPR_STACK>, ix: ExprRef| {
        stack.try_push(ix).map_err(|_| RowReject::ExprTooDeep)
    };

    let mut ops = expr.operations(encoding);
    while let Some(op) = ops.next().map_err(|_| RowReject::ExprParseFailed)? {
        match op {
            Operation::UnsignedConstant { value } => {
                let c = arena.constant(value);
                push(&mut stack, c)?;
            }
            Operation::SignedConstant { value } => {
                let c = arena.constant(value as u64);
                push(&mut stack, c)?;
            }
            Operation::Register { register } => {
                let creg =
                    A::cfi_reg(register, ra_reg).ok_or(RowReject::ExprUnknownRegister)?;
                let r = arena.reg(creg);
                push(&mut stack, r)?;
            }
            Operation::RegisterOffset {
                register, offset, ..
            } => {
                let creg =
                    A::cfi_reg(register, ra_reg).ok_or(RowReject::ExprUnknownRegister)?;
                let r = arena.reg(creg);
                let c = arena.constant(offset as u64);
                let sum = arena.binop(CfiOp::Add, r, c);
                push(&mut stack, sum)?;
            }
            Operation::Plus | Operation::Minus | Operation::And | Operation::Mul => {
                let rhs = stack.pop().ok_or(RowReject::ExprStackUnderflow)?;
                let lhs = stack.pop().ok_or(RowReject::ExprStackUnderflow)?;
                let op = match op {
                    Operation::Plus => CfiOp::Add,
                    Operation::Minus => CfiOp::Sub,
                    Operation::And => CfiOp::And,
                    _ => CfiOp::Mul,
                };
                let node = arena.binop(op, lhs, rhs);
                push(&mut stack, node)?;
            }
            Operation::PlusConstant { value } => {
                let lhs = stack.pop().ok_or(RowReject::ExprStackUnderflow)?;
                let c = arena.constant(value);
                let node = arena.binop(CfiOp::Add, lhs, c);
                push(&mut stack, node)?;
            }
            Operation::Deref { size, space, .. } => {
                if space || size != encoding.address_size {
                    return Err(RowReject::ExprBadDerefSize);
                }
                let addr = stack.pop().ok_or(RowReject::ExprStackUnderflow)?;
                let node = arena.deref(addr);
                push(&mut stack, node)?;
            }
            Operation::CallFrameCFA => {
                let seed = cfa_seed.ok_or(RowReject::ExprNoCfaAvailable)?;
                push(&mut stack, seed)?;
            }
            Operation::Nop => {}
            _ => return Err(RowReject::ExprUnsupportedOp),
        }
    }
    stack.pop().ok_or(RowReject::ExprStackUnderflow)
}
