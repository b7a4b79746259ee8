//! The typed SSA intermediate representation shared by the lifter (§4.C), the optimizer and
//! register allocator (§4.D) and the AArch64 code generator (§4.E).
//!
//! Per §3/§9, nodes live in a single contiguous arena per block and are referenced by 32-bit
//! index rather than through an intrusive pointer (the teacher's `OrderedNode*` equivalent would
//! be a linked handle; an arena index is stable across growth and half the size). A companion
//! side table (`Block::consts`) holds constant payloads so `Node` itself stays a small, `Copy`
//! struct.

pub mod flags;

use crate::arch::x86::Register;
pub use flags::{DeferredOp, FlagMask};

/// Identifies which runtime trampoline a [`OpKind::GuestCall`] node invokes (§4.C "failure
/// modes", §4.F helper dispatch). Shared between the lifter, which emits these calls, and the
/// code generator, which knows how to materialize each one.
pub mod helper_ids {
    pub const SYSCALL: u32 = 0;
    pub const CMPXCHG: u32 = 1;
    pub const CMPXCHG16B: u32 = 2;
    pub const UNSUPPORTED_OPCODE: u32 = 3;
    /// Cross-lane mask extraction (`MOVMSKPS`/`PMOVMSKB`); codegen routes this through a runtime
    /// trampoline rather than an inline NEON sequence (§4.E "helper-backed vector ops").
    pub const MOVMSK: u32 = 4;
    /// Immediate-controlled lane shuffle/pack (`PSHUFD` and friends) whose control byte doesn't
    /// map onto a single fixed `TBL` table.
    pub const SHUFFLE_PACK: u32 = 5;
    pub const PERMUTE: u32 = 6;
    pub const PCMP_ISTRI: u32 = 7;
    pub const PCMP_ISTRM: u32 = 8;
    /// Two-source lane select (`SHUFPS`): unlike [`SHUFFLE_PACK`], reads both operand slots.
    pub const SHUFFLE_PACK_2SRC_32: u32 = 9;
    /// As [`SHUFFLE_PACK_2SRC_32`], 64-bit lanes (`SHUFPD`).
    pub const SHUFFLE_PACK_2SRC_64: u32 = 10;
    pub const PACK_SS: u32 = 11;
    pub const PACK_US: u32 = 12;
    pub const SHIFT_V_LEFT: u32 = 13;
    pub const SHIFT_V_RIGHT_LOGICAL: u32 = 14;
    pub const SHIFT_V_RIGHT_ARITH: u32 = 15;
    /// Single-source 64-bit-lane immediate shuffle (`VPERMILPD`'s immediate form); distinct from
    /// [`SHUFFLE_PACK`] because that helper hardcodes 32-bit lanes.
    pub const PERMILPD: u32 = 16;
}

/// An index into a [`Block`]'s node arena. `NULL_REF` marks an absent/unused operand slot.
pub type Ref = u32;
pub const NULL_REF: Ref = u32::MAX;

/// Which physical register bank a node's result belongs in; used by the linear-scan allocator in
/// [`crate::opt::regalloc`] to partition live ranges into the GPR and vector banks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegClass {
    Gpr,
    Fpr,
}

/// The IR's op-kind tag. Integer/vector ops are parameterized at runtime by `element_size` and
/// `num_elements` on [`Node`] rather than monomorphized per width (§9: "replace [C++ template
/// per-width instantiation] with a single function taking those as runtime parameters").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Loads an immediate from `Block::consts[node.imm as usize]`.
    Constant,
    /// Reads a guest GPR identified by `node.imm` (cast to [`Register`]).
    LoadGpr,
    /// Writes `operands[0]` into the guest GPR identified by `node.imm`, sized per `element_size`
    /// (drives the 8/16-bit-preserve vs. 32-bit-zero-extend rule of §4.E).
    StoreGpr,
    /// Reads guest vector register `node.imm`.
    LoadVector,
    /// Writes `operands[0]` into guest vector register `node.imm`.
    StoreVector,

    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Mul,
    Neg,
    Not,

    /// Guest memory load at address `operands[0]`.
    Load,
    /// Guest memory store of `operands[1]` to address `operands[0]`.
    Store,

    Move,
    /// `operands[0] ? operands[1] : operands[2]`.
    Select,

    /// Deferred-flags record (§4.C "Flag lowering"): captures the arithmetic op and its two
    /// inputs that most recently would have set the flags, without materializing them.
    /// `operands[0]`/`operands[1]` are the inputs, `node.imm` encodes which arithmetic op they
    /// came from (as a [`flags::DeferredOp`]).
    FlagsFromOp,
    /// Materializes one concrete EFLAGS bit (`node.imm` as [`FlagMask`], exactly one bit set)
    /// from the nearest dominating `FlagsFromOp` referenced by `operands[0]`.
    MaterializeFlag,

    // -- Vector ops (§4.C "Vector semantics") --
    VBroadcast,
    VShuffleBytes,
    VShufflePack,
    VPermute,
    VAdd,
    VSub,
    VAnd,
    VOr,
    VXor,
    VMin,
    VMax,
    VCmpEq,
    VCmpGt,
    VPackSs,
    VPackUs,
    VUnpackLo,
    VUnpackHi,
    VMovMask,
    VFAdd,
    VFSub,
    VFMul,
    VFDiv,
    VFMin,
    VFMax,
    VFSqrt,
    VFRecipEstimate,
    VFRsqrtEstimate,
    VShiftLeft,
    VShiftRightLogical,
    VShiftRightArith,
    /// Zeroes bits `[MAXVL-1:128]` of the destination register; emitted after every 128-bit AVX
    /// vector op per §4.C.
    VZeroUpper,
    /// SSE4.2 `PCMPxSTRI`: computes the aggregated comparison, writes the resulting index to
    /// ECX and updates flags. `node.imm` packs the 8-bit control byte.
    PcmpIStrI,
    /// SSE4.2 `PCMPxSTRM`: as above but the result is written as a mask to XMM0.
    PcmpIStrM,

    /// A call into a runtime helper (unhandled-opcode trampoline, syscall dispatch). `node.imm`
    /// identifies the helper; the helper reads/writes [`crate::arch::x86::GuestCpuState`]
    /// directly rather than through IR operands.
    GuestCall,
}

impl OpKind {
    /// Inverts `as u8`, for [`crate::aot`] to decode a node written to the on-disk cache.
    pub fn from_raw(raw: u8) -> Self {
        const VARIANTS: &[OpKind] = &[
            OpKind::Constant,
            OpKind::LoadGpr,
            OpKind::StoreGpr,
            OpKind::LoadVector,
            OpKind::StoreVector,
            OpKind::Add,
            OpKind::Sub,
            OpKind::And,
            OpKind::Or,
            OpKind::Xor,
            OpKind::Shl,
            OpKind::Shr,
            OpKind::Sar,
            OpKind::Mul,
            OpKind::Neg,
            OpKind::Not,
            OpKind::Load,
            OpKind::Store,
            OpKind::Move,
            OpKind::Select,
            OpKind::FlagsFromOp,
            OpKind::MaterializeFlag,
            OpKind::VBroadcast,
            OpKind::VShuffleBytes,
            OpKind::VShufflePack,
            OpKind::VPermute,
            OpKind::VAdd,
            OpKind::VSub,
            OpKind::VAnd,
            OpKind::VOr,
            OpKind::VXor,
            OpKind::VMin,
            OpKind::VMax,
            OpKind::VCmpEq,
            OpKind::VCmpGt,
            OpKind::VPackSs,
            OpKind::VPackUs,
            OpKind::VUnpackLo,
            OpKind::VUnpackHi,
            OpKind::VMovMask,
            OpKind::VFAdd,
            OpKind::VFSub,
            OpKind::VFMul,
            OpKind::VFDiv,
            OpKind::VFMin,
            OpKind::VFMax,
            OpKind::VFSqrt,
            OpKind::VFRecipEstimate,
            OpKind::VFRsqrtEstimate,
            OpKind::VShiftLeft,
            OpKind::VShiftRightLogical,
            OpKind::VShiftRightArith,
            OpKind::VZeroUpper,
            OpKind::PcmpIStrI,
            OpKind::PcmpIStrM,
            OpKind::GuestCall,
        ];
        VARIANTS[raw as usize]
    }
}

impl RegClass {
    /// Inverts `as u8`, for [`crate::aot`].
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RegClass::Gpr,
            1 => RegClass::Fpr,
            other => unreachable!("{other} is not a valid RegClass discriminant"),
        }
    }
}

bitflags::bitflags! {
    /// Per-node: which of the element-wise/vector semantics apply. Kept separate from `OpKind`
    /// so the same `OpKind::VAdd` tag serves signed and unsigned, saturating and wrapping
    /// variants without a combinatorial explosion of tags (§9).
    pub struct VectorMode: u8 {
        const SIGNED     = 1 << 0;
        const SATURATING = 1 << 1;
        const SCALAR     = 1 << 2;
        /// Reads both operand slots rather than just the first (`SHUFPS`/`SHUFPD` vs. `PSHUFD`,
        /// which share [`OpKind::VShufflePack`] but differ in arity).
        const TWO_SOURCE = 1 << 3;
    }
}

/// One IR node. Deliberately small and `Copy`: 32 bytes on a 64-bit host.
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub op: OpKind,
    pub reg_class: RegClass,
    /// Element size in bytes (1/2/4/8/16 for vectors are expressed per-lane; a full 128-bit
    /// lane-count-1 operation uses `element_size = 16, num_elements = 1`).
    pub element_size: u8,
    pub num_elements: u8,
    pub vector_mode: VectorMode,
    pub operands: [Ref; 3],
    /// Interpretation depends on `op`: constant-pool index, register index, helper id, or a
    /// packed immediate control byte.
    pub imm: u32,
}

impl Node {
    fn leaf(op: OpKind, reg_class: RegClass) -> Self {
        Self {
            op,
            reg_class,
            element_size: 8,
            num_elements: 1,
            vector_mode: VectorMode::empty(),
            operands: [NULL_REF; 3],
            imm: 0,
        }
    }
}

/// How a basic block within a (possibly multiblock, §4.C) translation unit terminates.
#[derive(Clone, Debug)]
pub enum BlockExit {
    /// Falls through unconditionally to `next_rip`.
    Direct { next_rip: u64 },
    /// `cond` (an IR ref to a single materialized flag bit or comparison result) selects between
    /// the two successors.
    Conditional {
        cond: Ref,
        taken_rip: u64,
        not_taken_rip: u64,
    },
    /// The target is only known at runtime (e.g. `jmp rax`, `ret`); `target` is an IR ref holding
    /// the computed guest address.
    Indirect { target: Ref },
    /// The block ends in a `syscall`/`int 0x80` instruction.
    Syscall { next_rip: u64 },
    /// The block ends in `hlt`. `next_rip` is the address just past the `hlt` byte, matching the
    /// x86 rule that `RIP` advances past a halted instruction even though execution does not
    /// continue past it (§8 scenario 1: "RIP = 2" after a one-byte `hlt` at offset 1).
    Halt { next_rip: u64 },
}

/// One basic block's worth of IR within a (possibly multiblock) translation unit.
#[derive(Clone, Debug)]
pub struct Region {
    pub guest_rip: u64,
    pub node_range: std::ops::Range<u32>,
    pub exit: BlockExit,
}

/// The per-translation-unit IR arena (§3 `Block`, the IR portion of it). Holds one or more
/// [`Region`]s sharing a single node arena; single-block translations have exactly one region.
#[derive(Clone, Debug, Default)]
pub struct IrBlock {
    pub nodes: Vec<Node>,
    pub consts: Vec<u64>,
    pub regions: Vec<Region>,
    /// The guest address just past the last decoded instruction byte in this translation unit,
    /// across every region. [`Region::guest_rip`]/[`BlockExit`] expose where each region starts
    /// and (for most exit kinds) where control goes next, but not the byte range the decoded
    /// instructions themselves occupied — which is what the dispatcher's page-invalidation index
    /// needs to know which pages a compiled block's code depends on.
    pub guest_end_rip: u64,
}

impl IrBlock {
    pub fn push(&mut self, node: Node) -> Ref {
        let idx = self.nodes.len() as Ref;
        self.nodes.push(node);
        idx
    }

    pub fn push_const(&mut self, value: u64) -> Ref {
        let imm = self.consts.len() as u32;
        self.consts.push(value);
        self.push(Node {
            imm,
            ..Node::leaf(OpKind::Constant, RegClass::Gpr)
        })
    }

    pub fn push_load_gpr(&mut self, reg: Register, size: u8) -> Ref {
        self.push(Node {
            imm: reg as u32,
            element_size: size,
            ..Node::leaf(OpKind::LoadGpr, RegClass::Gpr)
        })
    }

    pub fn push_store_gpr(&mut self, reg: Register, value: Ref, size: u8) -> Ref {
        self.push(Node {
            imm: reg as u32,
            element_size: size,
            operands: [value, NULL_REF, NULL_REF],
            ..Node::leaf(OpKind::StoreGpr, RegClass::Gpr)
        })
    }

    pub fn push_binop(&mut self, op: OpKind, lhs: Ref, rhs: Ref, size: u8) -> Ref {
        self.push(Node {
            element_size: size,
            operands: [lhs, rhs, NULL_REF],
            ..Node::leaf(op, RegClass::Gpr)
        })
    }

    pub fn push_unop(&mut self, op: OpKind, src: Ref, size: u8) -> Ref {
        self.push(Node {
            element_size: size,
            operands: [src, NULL_REF, NULL_REF],
            ..Node::leaf(op, RegClass::Gpr)
        })
    }

    pub fn push_load(&mut self, addr: Ref, size: u8, reg_class: RegClass) -> Ref {
        self.push(Node {
            element_size: size,
            operands: [addr, NULL_REF, NULL_REF],
            ..Node::leaf(OpKind::Load, reg_class)
        })
    }

    pub fn push_store(&mut self, addr: Ref, value: Ref, size: u8) -> Ref {
        self.push(Node {
            element_size: size,
            operands: [addr, value, NULL_REF],
            ..Node::leaf(OpKind::Store, RegClass::Gpr)
        })
    }

    pub fn push_load_vector(&mut self, reg: u8, element_size: u8, num_elements: u8) -> Ref {
        self.push(Node {
            imm: reg as u32,
            element_size,
            num_elements,
            ..Node::leaf(OpKind::LoadVector, RegClass::Fpr)
        })
    }

    pub fn push_store_vector(&mut self, reg: u8, value: Ref, element_size: u8, num_elements: u8) -> Ref {
        self.push(Node {
            imm: reg as u32,
            element_size,
            num_elements,
            operands: [value, NULL_REF, NULL_REF],
            ..Node::leaf(OpKind::StoreVector, RegClass::Fpr)
        })
    }

    /// Pushes a vector op with up to three operands and an explicit lane shape/mode; covers every
    /// entry under "Vector semantics" (§4.C), which otherwise share no common arity.
    pub fn push_vecop(
        &mut self,
        op: OpKind,
        operands: [Ref; 3],
        element_size: u8,
        num_elements: u8,
        mode: VectorMode,
    ) -> Ref {
        self.push_vecop_imm(op, operands, element_size, num_elements, mode, 0)
    }

    /// As [`Self::push_vecop`], but for the handful of vector ops (`PSHUFD`, `PCMPxSTRI/M`) whose
    /// immediate control byte the codegen needs alongside the operand list.
    pub fn push_vecop_imm(
        &mut self,
        op: OpKind,
        operands: [Ref; 3],
        element_size: u8,
        num_elements: u8,
        mode: VectorMode,
        imm: u32,
    ) -> Ref {
        self.push(Node {
            element_size,
            num_elements,
            vector_mode: mode,
            operands,
            imm,
            ..Node::leaf(op, RegClass::Fpr)
        })
    }

    /// Builds a `VMovMask` node (`MOVMSKPS`/`PMOVMSKB`). Unlike the other vector ops, the result
    /// is a scalar bitmask consumed by GPR code, so — unlike [`Self::push_vecop`] — this node's
    /// result lives in the GPR bank even though its operand reads the FPR bank.
    pub fn push_vecmask(&mut self, operand: Ref, element_size: u8, num_elements: u8) -> Ref {
        self.push(Node {
            element_size,
            num_elements,
            operands: [operand, NULL_REF, NULL_REF],
            ..Node::leaf(OpKind::VMovMask, RegClass::Gpr)
        })
    }

    pub fn push_flags_from_op(&mut self, op: DeferredOp, lhs: Ref, rhs: Ref, size: u8) -> Ref {
        self.push(Node {
            element_size: size,
            imm: op as u32,
            operands: [lhs, rhs, NULL_REF],
            ..Node::leaf(OpKind::FlagsFromOp, RegClass::Gpr)
        })
    }

    pub fn push_materialize_flag(&mut self, flags_from_op: Ref, flag: FlagMask) -> Ref {
        self.push(Node {
            imm: flag.bits() as u32,
            operands: [flags_from_op, NULL_REF, NULL_REF],
            ..Node::leaf(OpKind::MaterializeFlag, RegClass::Gpr)
        })
    }

    /// Builds a `VZeroUpper` node targeting guest vector register `reg`'s 32-byte CPU-state slot
    /// (§4.C "128-bit AVX vector ops always zero the upper 128 bits of the destination"). Takes
    /// no value operand: it zeroes bytes [31:16] of that slot directly rather than producing an
    /// SSA result anything downstream reads.
    pub fn push_vzero_upper(&mut self, reg: u8) -> Ref {
        self.push(Node {
            imm: reg as u32,
            ..Node::leaf(OpKind::VZeroUpper, RegClass::Fpr)
        })
    }

    /// Builds a `PcmpIStrI` node. Unlike [`Self::push_vecop_imm`] (which always allocates its
    /// result in the `Fpr` bank), `PCMPxSTRI`'s real x86 result is the match index written to
    /// `ECX` — a GPR value — even though both its operands are vector registers, the same
    /// cross-bank shape [`Self::push_vecmask`] already uses for `MOVMSKPS`.
    pub fn push_pcmp_istri(&mut self, a: Ref, b: Ref, control: u8) -> Ref {
        self.push(Node {
            imm: control as u32,
            operands: [a, b, NULL_REF],
            ..Node::leaf(OpKind::PcmpIStrI, RegClass::Gpr)
        })
    }

    pub fn push_guest_call(&mut self, helper_id: u32, operands: [Ref; 3]) -> Ref {
        self.push(Node {
            imm: helper_id,
            operands,
            ..Node::leaf(OpKind::GuestCall, RegClass::Gpr)
        })
    }

    pub fn node(&self, r: Ref) -> &Node {
        &self.nodes[r as usize]
    }
}
