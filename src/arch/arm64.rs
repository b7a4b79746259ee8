//! This module provides code specific to the AArch64 host architecture: the register file the
//! code generator allocates into and the optional-extension feature set it probes at startup
//! (§4.E).

use bitflags::bitflags;
use std::sync::OnceLock;

/// The 31 general-purpose registers (X0-X30) plus the zero/stack-pointer register. Three are
/// reserved by the code generator and are never handed to the register allocator: `X28` holds the
/// guest CPU state base pointer, `X29` is the frame pointer and `X30` is the link register used by
/// the dispatcher's `bl`/`ret` trampolines.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum GpReg {
    X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13,
    X14, X15, X16, X17, X18, X19, X20, X21, X22, X23, X24, X25,
    X26, X27,
    /// Reserved: pinned to the base of the current thread's [`crate::arch::x86::GuestCpuState`].
    CpuStateBase,
    /// Reserved: frame pointer.
    Fp,
    /// Reserved: link register.
    Lr,
}

impl GpReg {
    pub const ALLOCATABLE: &'static [GpReg] = &[
        GpReg::X0, GpReg::X1, GpReg::X2, GpReg::X3, GpReg::X4, GpReg::X5, GpReg::X6, GpReg::X7,
        GpReg::X8, GpReg::X9, GpReg::X10, GpReg::X11, GpReg::X12, GpReg::X13, GpReg::X14,
        GpReg::X15, GpReg::X16, GpReg::X17, GpReg::X18, GpReg::X19, GpReg::X20, GpReg::X21,
        GpReg::X22, GpReg::X23, GpReg::X24, GpReg::X25, GpReg::X26, GpReg::X27,
    ];

    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// The 32 vector registers (V0-V31), addressable as NEON 128-bit `Q` registers or, when
/// [`HostFeatures::SVE128`]/[`HostFeatures::SVE256`] are set, as SVE `Z` registers of the
/// corresponding width.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct VReg(pub u8);

impl VReg {
    pub const ALLOCATABLE: std::ops::Range<u8> = 0..30;
    /// Reserved scratch predicate-all-true register used by the 256-bit SVE lowering path
    /// described in §4.E (`PRED_TMP_32B`).
    pub const PRED_TMP_32B: u8 = 15;
}

bitflags! {
    /// Optional AArch64 extensions the code generator uses opportunistically (§4.E). Detected
    /// once at process startup from `AT_HWCAP`/`AT_HWCAP2` and cached for the lifetime of the
    /// process.
    pub struct HostFeatures: u32 {
        /// 128-bit-or-wider SVE is present (implies NEON is also usable).
        const SVE128 = 1 << 0;
        /// 256-bit-or-wider SVE is present; required to lower a 256-bit IR vector op as a single
        /// host instruction instead of splitting it into two 128-bit ops.
        const SVE256 = 1 << 1;
        /// Alternate Floating-point Behaviors: native FMIN/FMAX match x86 "if either operand is
        /// NaN, return the second operand" semantics.
        const AFP    = 1 << 2;
        /// Reciprocal precision: FRECPE/FRSQRTE meet IEEE 1-ULP-class accuracy without a Newton
        /// refinement step.
        const RPRES  = 1 << 3;
    }
}

static HOST_FEATURES: OnceLock<HostFeatures> = OnceLock::new();

/// Returns the host's detected feature set, probing it on first use. Detection happens at most
/// once per process, matching §4.E's "occurs once at startup".
pub fn host_features() -> HostFeatures {
    *HOST_FEATURES.get_or_init(detect_host_features)
}

#[cfg(target_os = "linux")]
fn detect_host_features() -> HostFeatures {
    // Hardware capability bits, mirroring the layout of <asm/hwcap.h> on AArch64 Linux.
    const HWCAP_SVE: u64 = 1 << 22;
    const HWCAP2_SVE2: u64 = 1 << 1;
    const HWCAP2_AFP: u64 = 1 << 20;
    const HWCAP2_RPRES: u64 = 1 << 21;

    // SAFETY: `getauxval` with a well-known `AT_*` key is always safe to call; it returns 0 if
    // the key is absent rather than faulting.
    let hwcap = unsafe { libc::getauxval(libc::AT_HWCAP) };
    let hwcap2 = unsafe { libc::getauxval(25 /* AT_HWCAP2 */) };

    let mut features = HostFeatures::empty();
    if hwcap & HWCAP_SVE != 0 {
        features |= HostFeatures::SVE128;
        if hwcap2 & HWCAP2_SVE2 != 0 {
            features |= HostFeatures::SVE256;
        }
    }
    if hwcap2 & HWCAP2_AFP != 0 {
        features |= HostFeatures::AFP;
    }
    if hwcap2 & HWCAP2_RPRES != 0 {
        features |= HostFeatures::RPRES;
    }
    features
}

#[cfg(not(target_os = "linux"))]
fn detect_host_features() -> HostFeatures {
    HostFeatures::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_features_cache_is_stable() {
        let a = host_features();
        let b = host_features();
        assert_eq!(a, b);
    }
}
