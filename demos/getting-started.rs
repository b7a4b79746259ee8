//! Runs a three-instruction x86-64 guest (`mov rax, 1`; `mov rdi, 1`; `hlt`) end to end through
//! the whole translation pipeline: a minimal in-memory [`CodeLoader`], one guest page, a single
//! [`Dispatcher::run_loop`] call compiling and executing the block, then printing the resulting
//! guest register state.

use dbtx::arch::x86::{GuestCpuState, Register};
use dbtx::codeloader::{load_into, CodeLoader};
use dbtx::config::Config;
use dbtx::decoder::Mode;
use dbtx::dispatch::{helpers, BlockCache, CodePool, Dispatcher, ShutdownReason};
use dbtx::memory::{GuestMemoryManager, SmcMode};
use std::sync::atomic::AtomicI32;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Dbtx(#[from] dbtx::Error),
}

/// A guest image that lives entirely in this process's memory: no ELF, no filesystem.
struct InlineLoader {
    code: Vec<u8>,
}

impl CodeLoader for InlineLoader {
    fn stack_size(&self) -> u64 {
        64 * 1024
    }

    fn setup_stack(&self, _host_ptr: *mut u8, guest_ptr: u64) -> u64 {
        // No argv/envp/auxv to write for this demo; just leave RSP 16-byte aligned near the top.
        (guest_ptr + self.stack_size() - 16) & !0xf
    }

    fn default_rip(&self) -> u64 {
        0
    }

    fn layout(&self) -> (u64, u64, u64) {
        let size = self.code.len() as u64;
        (0, size, size)
    }

    fn load_memory(&self, writer: &mut dyn FnMut(*const u8, u64, u64)) {
        writer(self.code.as_ptr(), 0, self.code.len() as u64);
    }
}

fn main() -> Result<(), Error> {
    // `mov eax, 1`; `mov edi, 1`; `hlt`
    let code = vec![0xb8, 0x01, 0x00, 0x00, 0x00, 0xbf, 0x01, 0x00, 0x00, 0x00, 0xf4];
    let loader = InlineLoader { code };

    let mut mem = GuestMemoryManager::new(SmcMode::Full, false);
    let (entry_rip, rsp) = load_into(&mut mem, &loader)?;

    let mut cpu = GuestCpuState::default();
    cpu.rip = entry_rip;
    cpu.set_gpr(Register::Rsp, rsp);

    let config = Config::default();
    let pool = CodePool::new();
    let mut cache = BlockCache::new();
    let helper_table = helpers::build_helper_table();
    let pending_signal = AtomicI32::new(0);

    let mut dispatcher = Dispatcher {
        mem: &mem,
        config: &config,
        pool: &pool,
        cache: &mut cache,
        helpers: &helper_table,
        mode: Mode::X86_64,
        pending_signal: &pending_signal,
        aot: None,
    };

    let reason = dispatcher.run_loop(&mut cpu)?;

    println!("Shutdown reason: {reason:?}");
    println!("rax = {:#x}, rdi = {:#x}, rip = {:#x}", cpu.gpr(Register::Rax), cpu.gpr(Register::Rdi), cpu.rip);
    assert!(matches!(reason, ShutdownReason::Hlt));
    assert_eq!(cpu.gpr(Register::Rax), 1);
    assert_eq!(cpu.gpr(Register::Rdi), 1);

    Ok(())
}
