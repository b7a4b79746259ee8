//! Deferred-flags bookkeeping (§4.C "Flag lowering"). Rather than materializing all six x86
//! arithmetic flags on every instruction that is architecturally defined to set them, the lifter
//! records the most recent flag-setting op and its inputs as a single [`OpKind::FlagsFromOp`]
//! node; flags are only expanded into concrete IR when something downstream actually reads one
//! (an `MaterializeFlag` node). [`crate::opt::dce`] then deletes the record entirely if nothing
//! ever reads it.

use crate::ir::OpKind;

bitflags::bitflags! {
    /// Which of the six dynamic x86 status flags a node affects or reads. Distinct from
    /// [`crate::arch::x86::EflagsBits`], which is the packed-register bit layout used only when
    /// materializing the whole register at once (`pushf`); this is the lifter/optimizer's
    /// per-node dependency mask.
    pub struct FlagMask: u8 {
        const CF = 1 << 0;
        const PF = 1 << 1;
        const AF = 1 << 2;
        const ZF = 1 << 3;
        const SF = 1 << 4;
        const OF = 1 << 5;
    }
}

/// Which arithmetic operation a [`OpKind::FlagsFromOp`] node's flags derive from. Kept separate
/// from the general [`OpKind`] so a single canonical formula exists per flag per source op,
/// rather than re-deriving it from the result value's defining node (which may have already been
/// constant-folded away by the time a flag read needs it).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeferredOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Neg,
    Mul,
    /// `cmp`/`sub` without keeping the result, and `test`/`and` without keeping the result,
    /// share representations with [`DeferredOp::Sub`]/[`DeferredOp::And`] respectively: the
    /// lifter never materializes the discarded result, so there is no separate tag for them.
    Inc,
    Dec,
}

impl DeferredOp {
    /// Inverts the `as u32` cast [`IrBlock::push_flags_from_op`] uses to pack a `DeferredOp` into
    /// a node's `imm` field, for [`crate::codegen`] to recover it when materializing a flag.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => DeferredOp::Add,
            1 => DeferredOp::Sub,
            2 => DeferredOp::And,
            3 => DeferredOp::Or,
            4 => DeferredOp::Xor,
            5 => DeferredOp::Shl,
            6 => DeferredOp::Shr,
            7 => DeferredOp::Sar,
            8 => DeferredOp::Neg,
            9 => DeferredOp::Mul,
            10 => DeferredOp::Inc,
            11 => DeferredOp::Dec,
            other => unreachable!("{other} is not a valid DeferredOp discriminant"),
        }
    }

    /// The flags this arithmetic operation is architecturally defined to set. `Inc`/`Dec` do not
    /// affect CF, matching the x86 architectural definition.
    pub fn flags_written(self) -> FlagMask {
        match self {
            DeferredOp::Inc | DeferredOp::Dec => {
                FlagMask::PF | FlagMask::AF | FlagMask::ZF | FlagMask::SF | FlagMask::OF
            }
            DeferredOp::And | DeferredOp::Or | DeferredOp::Xor => {
                // Logical ops clear CF/OF and leave AF undefined; the lifter picks AF = 0
                // deterministically per §4.C ("may set any deterministic value").
                FlagMask::CF | FlagMask::PF | FlagMask::AF | FlagMask::ZF | FlagMask::SF | FlagMask::OF
            }
            _ => FlagMask::all(),
        }
    }
}

impl From<OpKind> for DeferredOp {
    fn from(op: OpKind) -> Self {
        match op {
            OpKind::Add => DeferredOp::Add,
            OpKind::Sub => DeferredOp::Sub,
            OpKind::And => DeferredOp::And,
            OpKind::Or => DeferredOp::Or,
            OpKind::Xor => DeferredOp::Xor,
            OpKind::Shl => DeferredOp::Shl,
            OpKind::Shr => DeferredOp::Shr,
            OpKind::Sar => DeferredOp::Sar,
            OpKind::Neg => DeferredOp::Neg,
            OpKind::Mul => DeferredOp::Mul,
            other => panic!("{other:?} does not define a flags formula"),
        }
    }
}
