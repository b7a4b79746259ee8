//! The AArch64 instruction encoder (§4.E): packs the fixed-width ARM64 instruction words this
//! backend emits. Kept separate from [`super::compile_block`], which walks the IR and decides
//! *which* instructions to emit; this module only knows how to encode them once chosen, mirroring
//! the teacher pack's `HostCodeGen`/`tcg_out_*` split (see `other_examples` `tcg-backend`) between
//! "what" and "how to encode."

/// `X26`. Reserved purely for this backend's own use (address materialization, spill reloads,
/// flag recomputation) — [`super::compile_block`]'s caller must invoke
/// [`crate::opt::optimize`] with `num_gpr <= 26` so the register allocator never hands this
/// register to a guest value.
pub const SCRATCH0: u8 = 26;
/// `X27`, the second backend-reserved scratch register, used alongside [`SCRATCH0`] when two live
/// temporaries are needed in the same sequence (e.g. computing an address and a value to compare
/// against it, or the two inputs to a recomputed flags formula).
pub const SCRATCH1: u8 = 27;
/// The zero/stack-pointer register in contexts where it reads as the zero register.
pub const ZR: u8 = 31;
/// `V30`. Reserved vector scratch register; the caller must invoke [`crate::opt::optimize`] with
/// `num_fpr <= 30` so the allocator never hands out `V30`/`V31`.
pub const FPR_SCRATCH0: u8 = 30;
pub const FPR_SCRATCH1: u8 = 31;

/// Raw 4-bit AArch64 condition-code encodings, for use with [`Emitter::cset`].
pub mod cond {
    pub const EQ: u8 = 0b0000;
    pub const NE: u8 = 0b0001;
    pub const CS: u8 = 0b0010;
    pub const CC: u8 = 0b0011;
    pub const MI: u8 = 0b0100;
    pub const VS: u8 = 0b0110;
    pub const VC: u8 = 0b0111;
}

/// Accumulates 32-bit instruction words into a little-endian byte buffer. One `Emitter` lives for
/// the lifetime of a single [`super::compile_block`] call.
#[derive(Default)]
pub struct Emitter {
    words: Vec<u32>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.words.len() * 4
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for w in self.words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    pub fn nop(&mut self) {
        self.emit(0xD503201F);
    }

    pub fn ret(&mut self, rn: u8) {
        self.emit(0xD65F0000 | ((rn as u32) << 5));
    }

    pub fn br(&mut self, rn: u8) {
        self.emit(0xD61F0000 | ((rn as u32) << 5));
    }

    pub fn blr(&mut self, rn: u8) {
        self.emit(0xD63F0000 | ((rn as u32) << 5));
    }

    /// `MOVZ Xd, #imm16, LSL #(shift*16)`.
    pub fn movz(&mut self, rd: u8, imm16: u16, shift: u8) {
        self.emit(0xD2800000 | ((shift as u32) << 21) | ((imm16 as u32) << 5) | rd as u32);
    }

    /// `MOVK Xd, #imm16, LSL #(shift*16)`.
    pub fn movk(&mut self, rd: u8, imm16: u16, shift: u8) {
        self.emit(0xF2800000 | ((shift as u32) << 21) | ((imm16 as u32) << 5) | rd as u32);
    }

    /// Materializes an arbitrary 64-bit immediate into `rd` via up to four `MOVZ`/`MOVK`,
    /// skipping all-zero halfwords after the first so small constants stay one instruction.
    pub fn mov_imm64(&mut self, rd: u8, imm: u64) {
        let halfwords = [
            imm as u16,
            (imm >> 16) as u16,
            (imm >> 32) as u16,
            (imm >> 48) as u16,
        ];
        let mut first = true;
        for (i, &hw) in halfwords.iter().enumerate() {
            if hw == 0 && !(first && i == halfwords.len() - 1) {
                continue;
            }
            if first {
                self.movz(rd, hw, i as u8);
                first = false;
            } else {
                self.movk(rd, hw, i as u8);
            }
        }
        if first {
            // `imm` was zero: the loop above never emitted anything.
            self.movz(rd, 0, 0);
        }
    }

    pub fn add_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0x8B000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    pub fn sub_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0xCB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    pub fn and_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0x8A000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    pub fn orr_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0xAA000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    pub fn eor_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0xCA000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `LSLV Xd, Xn, Xm` (variable-count logical shift left).
    pub fn lslv(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0x9AC02000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `LSRV Xd, Xn, Xm`.
    pub fn lsrv(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0x9AC02400 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `ASRV Xd, Xn, Xm`.
    pub fn asrv(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0x9AC02800 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `MADD Xd, Xn, Xm, XZR`, i.e. `Xd = Xn * Xm`.
    pub fn mul(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0x9B000000 | ((rm as u32) << 16) | ((ZR as u32) << 10) | ((rn as u32) << 5) | rd as u32);
    }

    /// `SUB Xd, XZR, Xn`, i.e. `Xd = -Xn`.
    pub fn neg(&mut self, rd: u8, rn: u8) {
        self.sub_reg(rd, ZR, rn);
    }

    /// `ORN Xd, XZR, Xn`, i.e. `Xd = !Xn`.
    pub fn mvn(&mut self, rd: u8, rn: u8) {
        self.emit(0xAA2003E0 | ((rn as u32) << 16) | rd as u32);
    }

    pub fn mov_reg(&mut self, rd: u8, rn: u8) {
        self.orr_reg(rd, ZR, rn);
    }

    /// `CSEL Xd, Xn, Xm, NE` gated on `rcond != 0` having just been compared with `CMP rcond, #0`,
    /// used to lower [`crate::ir::OpKind::Select`] without a native boolean flags register (the
    /// IR's booleans are plain 0/1 GPR values, not NZCV bits).
    pub fn select_nonzero(&mut self, rd: u8, rcond: u8, if_true: u8, if_false: u8) {
        self.cmp_imm(rcond, 0);
        self.csel_ne(rd, if_true, if_false);
    }

    /// `CSEL Xd, Xn, Xm, NE`, selecting `rn` when the most recently set flags compared not-equal
    /// and `rm` otherwise. Split out from [`Self::select_nonzero`] for callers that need to stage
    /// `rn`/`rm` into place only after the comparison that sets the flags this reads.
    pub fn csel_ne(&mut self, rd: u8, rn: u8, rm: u8) {
        // CSEL Xd, Xn, Xm, cond: 1 00 11010100 Rm cond 0 Rn Rd; NE = 0b0001.
        self.emit(0x9A800000 | ((rn as u32) << 16) | (0b0001 << 12) | ((rm as u32) << 5) | rd as u32);
    }

    /// `ADDS Xd, Xn, Xm` — sets NZCV the way x86 `ADD` does (C = unsigned carry-out, matching x86
    /// CF directly).
    pub fn adds_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0xAB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `SUBS Xd, Xn, Xm` — ARM64's C flag is the *complement* of a borrow (`C=1` means no borrow
    /// occurred), the opposite polarity of x86 CF on `SUB`/`CMP`; callers extracting CF from this
    /// must invert the carry condition.
    pub fn subs_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0xEB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `ANDS Xd, Xn, Xm` — sets N/Z from the result and unconditionally clears C/V, matching x86
    /// `AND`/`TEST` clearing CF/OF.
    pub fn ands_reg(&mut self, rd: u8, rn: u8, rm: u8) {
        self.emit(0xEA000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32);
    }

    /// `LSL Xd, Xn, #shift` (`UBFM` alias), `shift` in `0..64`.
    pub fn lsl_imm(&mut self, rd: u8, rn: u8, shift: u32) {
        debug_assert!(shift < 64);
        let immr = (64 - shift) % 64;
        let imms = 63 - shift;
        self.emit(0xD3400000 | (immr << 16) | (imms << 10) | ((rn as u32) << 5) | rd as u32);
    }

    /// `LSR Xd, Xn, #shift` (`UBFM` alias), `shift` in `0..64`.
    pub fn lsr_imm(&mut self, rd: u8, rn: u8, shift: u32) {
        debug_assert!(shift < 64);
        self.emit(0xD3400000 | (shift << 16) | (63 << 10) | ((rn as u32) << 5) | rd as u32);
    }

    /// `CSET Xd, <cond>` (alias of `CSINC Xd, XZR, XZR, invert(cond)`); `cond` is the raw 4-bit
    /// AArch64 condition-code encoding (see [`cond`] for named constants).
    pub fn cset(&mut self, rd: u8, cond: u8) {
        let inverted = cond ^ 0b0001;
        self.emit(0x9A9F07E0 | ((inverted as u32) << 12) | rd as u32)
    }

    /// `LDR Qt, [Xn, #imm]`, `imm` a 16-byte-aligned byte offset scaled internally.
    pub fn ldr_q_imm(&mut self, qt: u8, rn: u8, imm: u32) {
        debug_assert_eq!(imm % 16, 0);
        self.emit(0x3DC00000 | (((imm / 16) as u32) << 10) | ((rn as u32) << 5) | qt as u32);
    }

    pub fn str_q_imm(&mut self, qt: u8, rn: u8, imm: u32) {
        debug_assert_eq!(imm % 16, 0);
        self.emit(0x3D800000 | (((imm / 16) as u32) << 10) | ((rn as u32) << 5) | qt as u32);
    }

    pub fn ldr_q(&mut self, qt: u8, rn: u8) {
        self.ldr_q_imm(qt, rn, 0);
    }

    pub fn str_q(&mut self, qt: u8, rn: u8) {
        self.str_q_imm(qt, rn, 0);
    }

    pub fn cmp_imm(&mut self, rn: u8, imm12: u16) {
        // SUBS XZR, Xn, #imm12.
        self.emit(0xF1000000 | ((imm12 as u32) << 10) | ((rn as u32) << 5) | ZR as u32);
    }

    /// `LDR Xt, [Xn, #imm]`, `imm` a byte offset that must be 8-byte aligned and fit 12 bits once
    /// scaled (the caller — [`super::CpuStateLayout`] offsets are always within this range).
    pub fn ldr_imm(&mut self, rt: u8, rn: u8, imm: u32) {
        debug_assert_eq!(imm % 8, 0);
        self.emit(0xF9400000 | (((imm / 8) as u32) << 10) | ((rn as u32) << 5) | rt as u32)
    }

    pub fn str_imm(&mut self, rt: u8, rn: u8, imm: u32) {
        debug_assert_eq!(imm % 8, 0);
        self.emit(0xF9000000 | (((imm / 8) as u32) << 10) | ((rn as u32) << 5) | rt as u32)
    }

    /// `LDR Xt, [Xn]`, equivalent to `ldr_imm(rt, rn, 0)` but used at guest-memory load sites
    /// where the base is a computed address rather than a CPU-state field.
    pub fn ldr(&mut self, rt: u8, rn: u8) {
        self.ldr_imm(rt, rn, 0);
    }

    pub fn str(&mut self, rt: u8, rn: u8) {
        self.str_imm(rt, rn, 0);
    }

    /// `LDAR Xt, [Xn]`, the acquire-load used under [`crate::config::Config::tso`] (§5 "every
    /// guest load/store is emitted with LDAR/STLR").
    pub fn ldar(&mut self, rt: u8, rn: u8) {
        self.emit(0xC8DFFC00 | ((rn as u32) << 5) | rt as u32);
    }

    /// `STLR Xt, [Xn]`, the release-store counterpart of [`Self::ldar`].
    pub fn stlr(&mut self, rt: u8, rn: u8) {
        self.emit(0xC89FFC00 | ((rn as u32) << 5) | rt as u32);
    }

    /// `DMB ISH`, the inner-shareable full barrier used for synchronizing instructions
    /// (`XCHG`/`LOCK`/`MFENCE`) under non-TSO mode (§5).
    pub fn dmb_ish(&mut self) {
        self.emit(0xD5033BBF);
    }

    /// `CBNZ Xt, #0` with the branch offset patched in later via [`Self::patch_branch19`]; returns
    /// the word index to patch.
    pub fn cbnz_placeholder(&mut self, rt: u8) -> usize {
        self.emit(0xB5000000 | rt as u32);
        self.words.len() - 1
    }

    pub fn b_placeholder(&mut self) -> usize {
        self.emit(0x14000000);
        self.words.len() - 1
    }

    /// Patches a `B`/`CBNZ` placeholder emitted at `word_index` so it branches to the emitter's
    /// current offset.
    pub fn patch_branch19(&mut self, word_index: usize) {
        self.patch_branch19_to(word_index, self.words.len());
    }

    pub fn patch_branch26(&mut self, word_index: usize) {
        self.patch_branch26_to(word_index, self.words.len());
    }

    /// As [`Self::patch_branch19`], but targeting an arbitrary (possibly already-passed) word
    /// index rather than the emitter's current position; used by [`super::compile_block`] to link
    /// a multiblock region's exit directly to a sibling region instead of returning to the
    /// dispatcher.
    pub fn patch_branch19_to(&mut self, word_index: usize, target_word_index: usize) {
        let delta = target_word_index as i64 - word_index as i64;
        let imm19 = (delta as u32) & 0x7ffff;
        self.words[word_index] |= imm19 << 5;
    }

    pub fn patch_branch26_to(&mut self, word_index: usize, target_word_index: usize) {
        let delta = target_word_index as i64 - word_index as i64;
        let imm26 = (delta as u32) & 0x3ffffff;
        self.words[word_index] |= imm26;
    }

    // -- NEON (128-bit `V` register) vector ops --
    // Encoded as 3-register-same-type forms; `size`/`q` select the lane layout. These lower
    // 128-bit IR vector ops directly. 256-bit IR ops go through [`Self::sve_*`] instead when
    // `HostFeatures::SVE256` is present (§4.E), or are split into two 128-bit halves otherwise.

    fn neon_arrangement_bits(element_size: u8) -> u32 {
        match element_size {
            1 => 0b00,
            2 => 0b01,
            4 => 0b10,
            8 => 0b11,
            _ => unreachable!("invalid NEON element size {element_size}"),
        }
    }

    /// `EOR Vd.16B, Vn.16B, Vm.16B`.
    pub fn veor(&mut self, vd: u8, vn: u8, vm: u8) {
        self.emit(0x6E201C00 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `AND Vd.16B, Vn.16B, Vm.16B`.
    pub fn vand(&mut self, vd: u8, vn: u8, vm: u8) {
        self.emit(0x4E201C00 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `ORR Vd.16B, Vn.16B, Vm.16B`.
    pub fn vorr(&mut self, vd: u8, vn: u8, vm: u8) {
        self.emit(0x4EA01C00 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `MOV Vd.16B, Vn.16B` (the `ORR Vd, Vn, Vn` alias), for copying a whole vector register
    /// without a round trip through memory.
    pub fn mov_v(&mut self, vd: u8, vn: u8) {
        self.vorr(vd, vn, vn);
    }

    /// `SUB Vd.<T>, Vn.<T>, Vm.<T>` over integer lanes of `element_size` bytes.
    pub fn vsub(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let size = Self::neon_arrangement_bits(element_size);
        self.emit(0x6E208400 | (size << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `ADD Vd.<T>, Vn.<T>, Vm.<T>` over integer lanes of `element_size` bytes.
    pub fn vadd(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let size = Self::neon_arrangement_bits(element_size);
        self.emit(0x4E208400 | (size << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `TBL Vd.16B, {Vn.16B}, Vm.16B` — the NEON lowering of [`crate::ir::OpKind::VShuffleBytes`]
    /// (`PSHUFB`). Indices with the top bit set already read as out-of-table-range under `TBL`'s
    /// own semantics (zero result), which happens to match this crate's cross-lane-zero reading
    /// of `PSHUFB`'s high bit (§9 Open Questions) for free.
    pub fn tbl1(&mut self, vd: u8, vn: u8, vm: u8) {
        self.emit(0x4E000000 | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `FADD Vd.<T>, Vn.<T>, Vm.<T>` (vector form), `element_size` 4 or 8.
    pub fn vfadd(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let sz = if element_size == 8 { 1 } else { 0 };
        self.emit(0x4E20D400 | (sz << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `FADD Sd/Dd, Sn/Dn, Sm/Dm` (scalar form), used for AVX scalar ops (`VADDSS`/`VADDSD`) after
    /// the destination's upper bits have already been set up per §4.E's `VFScalarOperation`
    /// pattern.
    pub fn fadd_scalar(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let ftype = if element_size == 8 { 0b01 } else { 0b00 };
        self.emit(0x1E202800 | (ftype << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `FMIN Vd.<T>, Vn.<T>, Vm.<T>`, native form used only when `HostFeatures::AFP` is present.
    pub fn vfmin(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let sz = if element_size == 8 { 1 } else { 0 };
        self.emit(0x4EA0F400 | (sz << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    pub fn vfmax(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let sz = if element_size == 8 { 1 } else { 0 };
        self.emit(0x4E20F400 | (sz << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `FCMGT`+`BSL`-free min/max fallback for hosts without AFP (§4.E): `FCMP` the two operands
    /// then `FCSEL` the x86-shaped result (second operand wins on an unordered compare, matching
    /// x86's "if either operand is NaN, return the second operand"). Scalar only; vector hosts
    /// without AFP fall back to splitting into per-lane scalar sequences at the call site.
    pub fn fcmp_fcsel_min_max(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8, is_max: bool) {
        let ftype = if element_size == 8 { 0b01 } else { 0b00 };
        // FCMP Sn, Sm.
        self.emit(0x1E202000 | (ftype << 22) | ((vm as u32) << 16) | ((vn as u32) << 5));
        // FCSEL Sd, Sn, Sm, cond: GT selects first operand for max, MI for min, else second
        // operand (the "return the second operand" NaN rule: an unordered compare leaves the
        // condition false for both GT and MI, so the fallthrough `Sm` operand is chosen).
        let cond: u32 = if is_max { 0b1100 } else { 0b0100 };
        self.emit(
            0x1E200C00
                | (ftype << 22)
                | ((vm as u32) << 16)
                | (cond << 12)
                | ((vn as u32) << 5)
                | vd as u32,
        );
    }

    /// `FRECPE`, the reciprocal-estimate instruction used directly when `HostFeatures::RPRES` is
    /// present (a single estimate meets 1-ULP-class accuracy); without RPRES the caller instead
    /// emits `FMOV #1.0` + `FDIV` for an IEEE-correct result.
    pub fn frecpe(&mut self, vd: u8, vn: u8, element_size: u8) {
        let sz = if element_size == 8 { 1 } else { 0 };
        self.emit(0x5EA1D800 | (sz << 22) | ((vn as u32) << 5) | vd as u32);
    }

    pub fn frsqrte(&mut self, vd: u8, vn: u8, element_size: u8) {
        let sz = if element_size == 8 { 1 } else { 0 };
        self.emit(0x7EA1D800 | (sz << 22) | ((vn as u32) << 5) | vd as u32);
    }

    pub fn fdiv_scalar(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let ftype = if element_size == 8 { 0b01 } else { 0b00 };
        self.emit(0x1E201800 | (ftype << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    pub fn fmul_scalar(&mut self, vd: u8, vn: u8, vm: u8, element_size: u8) {
        let ftype = if element_size == 8 { 0b01 } else { 0b00 };
        self.emit(0x1E200800 | (ftype << 22) | ((vm as u32) << 16) | ((vn as u32) << 5) | vd as u32);
    }

    /// `INS Vd.D[0], Vn.D[0]` — copies the low 64 bits of `vn` into `vd` without touching `vd`'s
    /// remaining lanes. Used by the `VFScalarOperation` pattern (§4.E) to merge a scalar result
    /// computed in a scratch register back into an aliased destination.
    pub fn ins_low64(&mut self, vd: u8, vn: u8) {
        self.emit(0x6E080400 | ((vn as u32) << 5) | vd as u32);
    }

    /// Zeroes the upper 128 bits of a 256-bit vector register (§4.C `VZeroUpper`: "128-bit AVX
    /// vector ops always zero the upper 128 bits of the destination YMM"). Modeled as an `MOVPRFX`
    /// into the upper half with a zero source when SVE is present, or a no-op marker otherwise
    /// since a plain NEON write already leaves bits [255:128] architecturally zero on a host with
    /// no wider vector state to begin with.
    pub fn vzero_upper_sve(&mut self, zd: u8, pg_all_false: u8) {
        // MOVPRFX Zd, Pg/Z, Zd — predicated-zeroing move-prefix, predicate set to all-false so the
        // subsequent (elided) op is a pure zero of the upper lanes via the governing predicate.
        self.emit(0x04102000 | ((pg_all_false as u32) << 10) | (zd as u32) << 5 | zd as u32);
    }

    /// `MOVPRFX Zd, Zn` (unpredicated form), splitting the destination from the first source
    /// before an SVE 256-bit op per §4.E ("use MOVPRFX to split destination from source, then SVE
    /// predicated form").
    pub fn movprfx(&mut self, zd: u8, zn: u8) {
        self.emit(0x04100000 | ((zn as u32) << 5) | zd as u32);
    }

    /// `PTRUE P<n>.B, ALL` — populates [`crate::arch::arm64::VReg::PRED_TMP_32B`]'s governing
    /// predicate once per process lifetime (it is pinned, not reallocated per block).
    pub fn ptrue_all(&mut self, pd: u8) {
        self.emit(0x2518E3E0 | pd as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm64_round_trips_a_zero_extended_constant() {
        let mut e = Emitter::new();
        e.mov_imm64(0, 0x1234_0000_5678);
        let bytes = e.into_bytes();
        assert_eq!(bytes.len() % 4, 0);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn mov_imm64_of_zero_emits_a_single_movz() {
        let mut e = Emitter::new();
        e.mov_imm64(3, 0);
        assert_eq!(e.words.len(), 1);
        assert_eq!(e.words[0] & 0x1f, 3);
    }

    #[test]
    fn branch_patch_targets_the_emit_point_after_it() {
        let mut e = Emitter::new();
        let b = e.b_placeholder();
        e.nop();
        e.nop();
        e.patch_branch26(b);
        assert_eq!(e.words[b] & 0x3ffffff, 3);
    }
}
