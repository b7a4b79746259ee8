//! `dbtx` is a user-mode dynamic binary translator: it runs unmodified x86/x86-64 Linux binaries
//! on an AArch64 host by decoding guest instructions, lifting them to an internal SSA-style IR,
//! optimizing and register-allocating that IR, and emitting native ARM64 machine code a
//! [`dispatch::Dispatcher`] jumps into directly.
//!
//! This crate owns the translation pipeline and nothing else: ELF loading, argument parsing and
//! guest memory provisioning are the embedder's job, expressed through the [`codeloader::CodeLoader`]
//! trait (§6 external interface) — see [`codeloader::load_into`] for wiring one up.
//!
//! Pipeline, in order:
//!  * [`memory`] — the Guest Memory Manager, tracking guest mappings and code pages.
//!  * [`decoder`] — turns a guest byte stream into decoded x86 instructions.
//!  * [`lifter`] — lifts decoded instructions into [`ir::IrBlock`]s.
//!  * [`opt`] — optimizes the IR and performs linear-scan register allocation.
//!  * [`codegen`] — emits ARM64 machine code for an optimized, allocated `IrBlock`.
//!  * [`dispatch`] — runs compiled blocks, looks up/evicts them from the block cache, and retires
//!    the few syscalls this crate emulates directly.
//!  * [`aot`] — persists optimized IR (not compiled code) across process runs.
//!  * [`daemon`] — the out-of-process service daemon's protocol, lockfile and coredump logic.

pub mod aot;
pub mod arch;
pub mod codegen;
pub mod codeloader;
pub mod config;
pub mod daemon;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod ir;
pub mod lifter;
pub mod memory;
pub mod opt;

pub use codeloader::CodeLoader;
pub use config::Config;
pub use error::Error;
