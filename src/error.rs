//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The decoder could not make sense of the guest byte stream at the given guest address.
    #[error("failed to decode instruction at {rip:#x}")]
    Decode { rip: u64 },
    /// A VEX/XOP prefix was combined with a legacy prefix that is illegal in that combination,
    /// e.g. a LOCK prefix preceding a VEX-encoded instruction.
    #[error("illegal prefix combination at {rip:#x}")]
    IllegalPrefixCombo { rip: u64 },
    /// The opcode was decoded successfully but this crate has no lifting rule for it.
    #[error("unsupported opcode {mnemonic} at {rip:#x}")]
    UnsupportedOpcode { rip: u64, mnemonic: &'static str },
    /// Lifting a multiblock region exceeded the configured branch/instruction budget; the
    /// caller should retry the same start RIP as a single-block translation.
    #[error("block starting at {rip:#x} exceeded the branch budget")]
    BlockTooLong { rip: u64 },
    /// The guest accessed an address that is not backed by any mapping.
    #[error("guest address {addr:#x} is not mapped")]
    AddressTranslationFault { addr: u64 },
    /// The guest accessed a mapped address without the permission the access requires.
    #[error("guest address {addr:#x} does not permit this access")]
    PermissionFault { addr: u64 },
    /// The requested guest region could not be reserved, e.g. a 32-bit guest reservation that
    /// does not fit below 2^32.
    #[error("could not reserve a guest region of size {size:#x}")]
    OutOfGuestAddressSpace { size: u64 },
    /// An internal invariant was violated. This is never expected to happen during normal
    /// operation and indicates a bug in the translator rather than the guest program.
    #[error("internal invariant violated: {0}")]
    TranslationFailure(String),
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps [`mmap_rs::error::Error`].
    #[error(transparent)]
    Mmap(#[from] mmap_rs::error::Error),
    /// Wraps an error returned by a `libc`/socket call made through the [`nix`] crate, used by
    /// the daemon's lockfile and UNIX socket handling (§6).
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

/// Abort the process with a diagnostic dump. Used for [`Error::TranslationFailure`]-class bugs,
/// which the spec treats as non-recoverable host-side faults rather than guest-visible ones.
#[cold]
pub fn abort_with_diagnostic(message: &str) -> ! {
    eprintln!("dbtx: internal invariant violated: {message}");
    std::process::abort();
}
