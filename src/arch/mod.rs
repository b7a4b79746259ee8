//! Architecture-specific definitions: the guest x86/x86-64 state (`x86`) and the host AArch64
//! register file and feature set (`arm64`) that the code generator targets.

pub mod arm64;
pub mod x86;
