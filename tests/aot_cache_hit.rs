//! §8 scenario 6: a translation persisted through [`AotCache::shutdown`] is picked back up by a
//! freshly opened [`AotCache`] over the same file, and a [`Dispatcher`] wired to that reopened
//! cache with a *cold* [`BlockCache`] still runs the guest correctly by taking the cache-hit path
//! straight to [`dbtx::codegen::compile_block`].
//!
//! This crate's memory model is identity-mapped (§4.A): a guest address only stays the same
//! across two [`GuestMemoryManager`]s if the host happens to `mmap` the same address twice, which
//! isn't guaranteed. So rather than simulate a whole new process, this reuses one `mem` (and one
//! guest `rip`) across two independently opened cache handles — the granularity this crate's
//! model actually supports persisting across.

use dbtx::aot::AotCache;
use dbtx::arch::x86::{GuestCpuState, Register};
use dbtx::codeloader::{load_into, CodeLoader};
use dbtx::config::Config;
use dbtx::decoder::Mode;
use dbtx::dispatch::{helpers, BlockCache, CodePool, Dispatcher, ShutdownReason};
use dbtx::memory::{GuestMemoryManager, SmcMode};
use std::path::PathBuf;
use std::sync::atomic::AtomicI32;

struct InlineLoader {
    code: Vec<u8>,
}

impl CodeLoader for InlineLoader {
    fn stack_size(&self) -> u64 {
        64 * 1024
    }
    fn setup_stack(&self, _host_ptr: *mut u8, guest_ptr: u64) -> u64 {
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

fn run_once(mem: &GuestMemoryManager, entry_rip: u64, rsp: u64, aot: Option<&AotCache>) -> GuestCpuState {
    let mut cpu = GuestCpuState::default();
    cpu.rip = entry_rip;
    cpu.set_gpr(Register::Rsp, rsp);

    let config = Config::default();
    let pool = CodePool::new();
    let mut cache = BlockCache::new();
    let helper_table = helpers::build_helper_table();
    let pending_signal = AtomicI32::new(0);

    let mut dispatcher = Dispatcher {
        mem,
        config: &config,
        pool: &pool,
        cache: &mut cache,
        helpers: &helper_table,
        mode: Mode::X86_64,
        pending_signal: &pending_signal,
        aot,
    };
    let reason = dispatcher.run_loop(&mut cpu).unwrap();
    assert!(matches!(reason, ShutdownReason::Hlt));
    cpu
}

#[test]
fn a_reopened_aot_cache_serves_a_cold_block_cache() {
    let code = vec![0x90, 0x90, 0x90, 0xf4]; // nop; nop; nop; hlt
    let loader = InlineLoader { code };
    let mut mem = GuestMemoryManager::new(SmcMode::Full, false);
    let (entry_rip, rsp) = load_into(&mut mem, &loader).unwrap();

    let config = Config::default();
    let exe_path = PathBuf::from("aot-cache-hit-test-binary");
    let cache_path = std::env::temp_dir().join(format!("dbtx-aot-test-{}.cache", std::process::id()));
    let _ = std::fs::remove_file(&cache_path);

    let cache1 = AotCache::open(&cache_path, &exe_path, &config);
    let cpu_first = run_once(&mem, entry_rip, rsp, Some(&cache1));
    assert_eq!(cpu_first.rip, entry_rip + 4);
    cache1.shutdown();

    let cache2 = AotCache::open(&cache_path, &exe_path, &config);
    assert!(cache2.lookup(&mem, entry_rip).is_some(), "persisted entry did not survive reopening the cache file");

    let cpu_second = run_once(&mem, entry_rip, rsp, Some(&cache2));
    assert_eq!(cpu_second.rip, entry_rip + 4);

    let _ = std::fs::remove_file(&cache_path);
}
