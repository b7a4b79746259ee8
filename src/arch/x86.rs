//! This module provides the guest-visible x86/x86-64 architectural state (§3 `GuestCpuState`)
//! and the register enumerations the decoder and lifter operate on.

use bitflags::bitflags;

/// Represents the general-purpose registers of the x86-64 architecture. 32-bit guests only ever
/// address the first eight variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Register {
    /// The accumulator register.
    Rax = 0,
    /// The counter register.
    Rcx = 1,
    /// The data register.
    Rdx = 2,
    /// The base register.
    Rbx = 3,
    /// The stack pointer register.
    Rsp = 4,
    /// The base pointer register.
    Rbp = 5,
    /// The source index register.
    Rsi = 6,
    /// The destination index register.
    Rdi = 7,
    /// The R8 register, only addressable in 64-bit mode.
    R8 = 8,
    /// The R9 register, only addressable in 64-bit mode.
    R9 = 9,
    /// The R10 register, only addressable in 64-bit mode.
    R10 = 10,
    /// The R11 register, only addressable in 64-bit mode.
    R11 = 11,
    /// The R12 register, only addressable in 64-bit mode.
    R12 = 12,
    /// The R13 register, only addressable in 64-bit mode.
    R13 = 13,
    /// The R14 register, only addressable in 64-bit mode.
    R14 = 14,
    /// The R15 register, only addressable in 64-bit mode.
    R15 = 15,
}

impl Register {
    /// Decodes a 4-bit (REX-extended) register encoding into a [`Register`].
    pub fn from_encoding(encoding: u8) -> Self {
        // SAFETY: `Register` is `repr(u8)` and covers every value in 0..=15.
        unsafe { std::mem::transmute(encoding & 0xf) }
    }
}

/// Represents the 256-bit vector registers (YMM, with XMM aliasing the low 128 bits). MMX/x87
/// registers alias the low 64/80 bits of the legacy x87 stack, modeled separately below.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct VectorRegister(pub u8);

/// Individually decomposed EFLAGS bits (§3). Each status flag is tracked as a single byte rather
/// than packed, matching the data model's description of the architected flags register as
/// decomposed state rather than an opaque word; [`DeferredFlags`] in the lifter is what makes
/// this affordable.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EflagsState {
    pub cf: u8,
    pub pf: u8,
    pub af: u8,
    pub zf: u8,
    pub sf: u8,
    pub of: u8,
    pub df: u8,
}

bitflags! {
    /// Bit positions of the flags within the packed 32-bit EFLAGS representation used when the
    /// lifter needs to materialize the whole register at once (e.g. `PUSHF`).
    pub struct EflagsBits: u32 {
        const CF   = 1 << 0;
        const PF   = 1 << 2;
        const AF   = 1 << 4;
        const ZF   = 1 << 6;
        const SF   = 1 << 7;
        const TF   = 1 << 8;
        const IF   = 1 << 9;
        const DF   = 1 << 10;
        const OF   = 1 << 11;
    }
}

bitflags! {
    /// The interpreted subset of MXCSR (§3, §9 open question: DAZ and the exception mask/flag
    /// bits are read/written for round-tripping `LDMXCSR`/`STMXCSR` but are not otherwise acted
    /// upon by the lifted code, matching the open question's observed teacher behavior).
    pub struct MxcsrBits: u32 {
        /// Flush-to-zero.
        const FTZ            = 1 << 15;
        /// Round-to-nearest (the default, value 0b00 in the rounding control field).
        const ROUND_NEAREST  = 0b00 << 13;
        const ROUND_DOWN     = 0b01 << 13;
        const ROUND_UP       = 0b10 << 13;
        const ROUND_TOWARD_0 = 0b11 << 13;
        const ROUND_MASK     = 0b11 << 13;
    }
}

/// The x87 tag word state: top-of-stack pointer plus per-register tag.
#[derive(Clone, Copy, Debug, Default)]
pub struct X87State {
    /// Three-bit top-of-stack pointer.
    pub top: u8,
    /// One tag nibble per ST(i) register: 0 = valid, 1 = zero, 2 = special, 3 = empty.
    pub tag_word: u16,
    /// x87 control word (rounding mode, precision, exception masks).
    pub fcw: u16,
    /// C0-C3 condition code flags, one byte each to simplify IR flag materialization.
    pub c0: u8,
    pub c1: u8,
    pub c2: u8,
    pub c3: u8,
}

/// One guest thread's complete architectural state (§3). This struct's field *offsets* are load
/// bearing: the code generator addresses it as `[cpu_state_base + offset]` from a register that
/// is pinned for the lifetime of a block, so fields must never be reordered by a refactor without
/// also updating [`crate::codegen::arm64::CpuStateLayout`].
#[repr(C)]
#[derive(Clone, Debug)]
pub struct GuestCpuState {
    /// 16 (x86-64) or 8 (x86) general-purpose registers, each held as a full 64-bit value; 32-bit
    /// guest writes are masked down by the lifter/codegen per the zero-extension rule in §4.E.
    pub gprs: [u64; 16],
    /// 16 (x86-64) or 8 (x86) vector registers, 256 bits each; low 128 bits alias XMM.
    pub vectors: [[u8; 32]; 16],
    /// 8 legacy x87/MMX registers, 80 bits each, stored in 128-bit slots for alignment.
    pub mmx: [[u8; 16]; 8],
    pub x87: X87State,
    pub eflags: EflagsState,
    /// Only the rounding-mode and FTZ fields of MXCSR are interpreted (see [`MxcsrBits`]); the
    /// rest round-trips.
    pub mxcsr: u32,
    pub fs_base: u64,
    pub gs_base: u64,
    /// Only updated at block exit, never mid-block (§3).
    pub rip: u64,
    /// Backing store for [`crate::opt::regalloc::Location::Spill`] GPR-class slots (§4.D "Spill
    /// slots live in a per-thread scratch area at a fixed offset from the CPU state"). Sized well
    /// above any single translation unit's expected spill count; [`crate::codegen::CpuStateLayout`]
    /// computes byte offsets into this array directly from the node's allocated slot index.
    pub gpr_spill: [u64; 64],
    /// Backing store for vector-class spill slots, one 128-bit lane per slot.
    pub fpr_spill: [[u8; 16]; 64],
    /// Staging area the code generator uses to pass/receive 128-bit vector operands across a
    /// runtime helper call (§4.E "helper-backed vector ops"): helpers take byte offsets into this
    /// struct rather than raw operand values, since a NEON register can't be named in the AAPCS64
    /// scalar argument registers a `BLR` call uses.
    pub helper_scratch: [[u8; 16]; 4],
}

impl Default for GuestCpuState {
    fn default() -> Self {
        Self {
            gprs: [0; 16],
            vectors: [[0; 32]; 16],
            mmx: [[0; 16]; 8],
            x87: X87State::default(),
            eflags: EflagsState::default(),
            mxcsr: MxcsrBits::ROUND_NEAREST.bits(),
            fs_base: 0,
            gs_base: 0,
            rip: 0,
            gpr_spill: [0; 64],
            fpr_spill: [[0; 16]; 64],
            helper_scratch: [[0; 16]; 4],
        }
    }
}

impl GuestCpuState {
    pub fn gpr(&self, reg: Register) -> u64 {
        self.gprs[reg as usize]
    }

    pub fn set_gpr(&mut self, reg: Register, value: u64) {
        self.gprs[reg as usize] = value;
    }

    /// Applies the x86 sub-register write rule: 8/16-bit writes leave the upper bits of the
    /// 64-bit register unchanged, but a 32-bit write zero-extends to 64 bits (the x86-64
    /// "upper-32-zeroing" rule in §4.E).
    pub fn write_gpr_sized(&mut self, reg: Register, value: u64, size: u8) {
        let slot = &mut self.gprs[reg as usize];
        *slot = match size {
            1 => (*slot & !0xff) | (value & 0xff),
            2 => (*slot & !0xffff) | (value & 0xffff),
            4 => value & 0xffff_ffff,
            8 => value,
            _ => unreachable!("invalid operand size {size}"),
        };
    }
}
