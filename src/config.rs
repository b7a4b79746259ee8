//! The programmatic configuration surface (§1: "no config *file* format is implemented ... this
//! is purely the programmatic knobs the core consumes"). Half of a `Block`'s cache-key fingerprint
//! (§3) is derived from this struct; see [`Config::fingerprint`].

use crate::memory::SmcMode;

/// Knobs the embedder sets once at startup and that the translation pipeline reads on every
/// lift. Distinct from [`crate::arch::arm64::HostFeatures`], which is detected rather than
/// configured.
#[derive(Clone, Debug)]
pub struct Config {
    /// Whether to emit the extra barriers needed to match x86's total-store-order memory model
    /// on ARM64's weaker model.
    pub tso: bool,
    pub smc_mode: SmcMode,
    /// Whether the lifter may continue past a conditional branch into the same translation unit
    /// (§4.C "Multiblock").
    pub multiblock: bool,
    /// Upper bound on the number of guest instructions a single translation unit may lift before
    /// it is forced to close, regardless of `multiblock` (§4.C "Failure modes": `BlockTooLong`).
    pub branch_budget: u32,
    /// Guest-ABI-local flags folded into the `Block` fingerprint (§3) alongside `tso`/`smc_mode`/
    /// `multiblock`, for embedder-specific variants of the same guest code (e.g. a 32-bit
    /// compatibility ABI toggle) that must not share cached translations.
    pub abi_local_flags: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tso: true,
            smc_mode: SmcMode::Full,
            multiblock: true,
            branch_budget: 64,
            abi_local_flags: 0,
        }
    }
}

impl Config {
    /// The configuration half of a `Block`'s identity (§3: "starting guest RIP, configuration
    /// fingerprint = TSO flag ⊕ SMC mode ⊕ ABI-local-flags ⊕ multiblock flag"). Combined with a
    /// `multiblock` bit on the lookup side, not baked in here, since a single `Config` lifts both
    /// single- and multi-block translations of the same start RIP under separate cache entries.
    pub fn fingerprint(&self) -> u8 {
        let tso_bit = self.tso as u8;
        let smc_bits = match self.smc_mode {
            SmcMode::Full => 0b00,
            SmcMode::MmanOnly => 0b01,
            SmcMode::None => 0b10,
        };
        tso_bit ^ (smc_bits << 1) ^ self.abi_local_flags.rotate_left(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differing_smc_modes_fingerprint_differently() {
        let mut a = Config::default();
        let mut b = Config::default();
        a.smc_mode = SmcMode::Full;
        b.smc_mode = SmcMode::None;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
