//! The dispatcher, per-thread block lookup cache and executable-code pool (§4.F): the runtime
//! loop that maps a guest `RIP` to host code, invoking the B→C→D→E translation pipeline (or the
//! on-disk AOT cache, §4.G) on a miss, and publishing the result into executable memory other
//! threads can jump into.

pub mod helpers;
pub mod syscall;

use crate::aot::AotCache;
use crate::arch::x86::GuestCpuState;
use crate::codegen::{self, exit_status, HelperTable};
use crate::config::Config;
use crate::decoder::Mode;
use crate::error::Error;
use crate::lifter;
use crate::memory::{GuestMemoryManager, PAGE_SIZE};
use crate::opt;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One byte-addressable slot per guest address within a page, so an entry point that doesn't fall
/// on a nice alignment still gets an exact cache slot (§4.F "two-level radix": the page number
/// selects a chunk, the in-page byte offset selects a slot within it).
const CHUNK_ENTRIES: usize = PAGE_SIZE as usize;

fn page_of(rip: u64) -> u64 {
    rip & !(PAGE_SIZE - 1)
}

fn offset_of_page(rip: u64) -> usize {
    (rip & (PAGE_SIZE - 1)) as usize
}

type Chunk = Box<[AtomicU64]>;

fn new_chunk() -> Chunk {
    (0..CHUNK_ENTRIES).map(|_| AtomicU64::new(0)).collect()
}

/// A newtype purely so `unsafe impl Sync` is ours to give rather than relying on whatever
/// `mmap_rs::Mmap` itself derives: the mapping is read+exec and never written to again after
/// [`CodePool::publish`] hands it back, so sharing the pointer it derefs to across threads is
/// sound even though raw pointers are `!Sync` by default.
struct ExecBuffer(mmap_rs::Mmap);

// SAFETY: see the struct doc comment — the mapping is immutable (read+exec, no write access)
// for the entire lifetime of the `ExecBuffer` that owns it.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

/// One published translation unit's worth of executable host code (§4.F, §4.E `CompiledBlock`).
/// Lives in its own small `mmap` rather than a shared bump-allocated arena: `mmap-rs` models
/// writable and executable mappings as distinct owned types (`MmapMut`/`Mmap`), and a pool that
/// kept appending into an already-published, already-executable region would need a second
/// writable alias of the same pages that `mmap-rs` has no way to hand out. One mapping per block
/// makes eviction trivial too — drop the `Arc` once nothing references it — at the cost of an
/// `mmap`/`munmap` per translation instead of a bump pointer; see `DESIGN.md`.
pub struct CompiledBlock {
    /// The translation unit's first region's guest `RIP`.
    pub rip: u64,
    /// [`Config::fingerprint`] at compile time, so a config change invalidates every previously
    /// compiled block on load rather than silently running stale code under new semantics.
    pub fingerprint: u8,
    /// Every guest `RIP` a caller can legally resume at: this block's own entry plus, for a
    /// multiblock translation, every sibling region's entry (§4.C), since each one needs its own
    /// [`BlockCache`] slot.
    pub entry_rips: Vec<u64>,
    /// Every guest page (§4.F) this block's *code bytes* span, from its first region's `RIP` up
    /// to [`crate::ir::IrBlock::guest_end_rip`]. Used only for SMC invalidation: a page can be the
    /// reason this block is invalid even if none of `entry_rips` falls on it.
    pub guest_pages: Vec<u64>,
    buf: ExecBuffer,
}

impl CompiledBlock {
    pub fn entry(&self) -> *const u8 {
        self.buf.0.as_ptr()
    }
}

/// Publishes freshly generated machine code into executable memory, serializing only the publish
/// step itself (§4.F "a shared code pool protected by a mutex, taken only during publish, never
/// during lookup or execution").
pub struct CodePool {
    publish_lock: Mutex<()>,
}

impl Default for CodePool {
    fn default() -> Self {
        Self::new()
    }
}

impl CodePool {
    pub fn new() -> Self {
        Self { publish_lock: Mutex::new(()) }
    }

    pub fn publish(
        &self,
        rip: u64,
        fingerprint: u8,
        entry_rips: Vec<u64>,
        guest_pages: Vec<u64>,
        code: &[u8],
    ) -> Result<Arc<CompiledBlock>, Error> {
        let _guard = self.publish_lock.lock().unwrap();
        let mut mapping = mmap_rs::MmapOptions::new(code.len().max(1))
            .map_err(Error::Mmap)?
            .map_mut()
            .map_err(Error::Mmap)?;
        mapping[..code.len()].copy_from_slice(code);
        let exec = mapping.make_exec().map_err(|(_, e)| Error::Mmap(e))?;
        Ok(Arc::new(CompiledBlock {
            rip,
            fingerprint,
            entry_rips,
            guest_pages,
            buf: ExecBuffer(exec),
        }))
    }
}

struct PageMembership {
    link: LinkedListLink,
    block: Arc<CompiledBlock>,
}

intrusive_adapter!(PageAdapter = Box<PageMembership>: PageMembership { link: LinkedListLink });

/// Maps guest `RIP` to host code entry point via a two-level radix (§4.F), plus a page→blocks
/// index used only to drive SMC invalidation. A block whose code spans more than one guest page
/// gets one [`PageMembership`] node per page it touches rather than trying to thread a single
/// intrusive link through several lists at once, which `intrusive_collections` does not support.
pub struct BlockCache {
    radix: HashMap<u64, Chunk>,
    pages: HashMap<u64, LinkedList<PageAdapter>>,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    pub fn new() -> Self {
        Self { radix: HashMap::new(), pages: HashMap::new() }
    }

    pub fn lookup(&self, rip: u64) -> Option<*const u8> {
        let chunk = self.radix.get(&page_of(rip))?;
        let raw = chunk[offset_of_page(rip)].load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(raw as *const u8)
        }
    }

    pub fn insert(&mut self, block: Arc<CompiledBlock>) {
        for &rip in &block.entry_rips {
            let chunk = self.radix.entry(page_of(rip)).or_insert_with(new_chunk);
            chunk[offset_of_page(rip)].store(block.entry() as u64, Ordering::Release);
        }
        for &page in &block.guest_pages {
            self.pages
                .entry(page)
                .or_insert_with(LinkedList::default)
                .push_back(Box::new(PageMembership { link: LinkedListLink::new(), block: block.clone() }));
        }
    }

    /// Drops every cache entry for every block whose code touches `page` (§4.C "a write to a
    /// mapped-executable page invalidates every compiled block that covers it"). `page` need not
    /// be page-aligned.
    pub fn invalidate_page(&mut self, page: u64) {
        let page = page_of(page);
        let Some(members) = self.pages.remove(&page) else {
            return;
        };
        let mut cursor = members.front();
        while let Some(member) = cursor.get() {
            for &rip in &member.block.entry_rips {
                if let Some(chunk) = self.radix.get(&page_of(rip)) {
                    chunk[offset_of_page(rip)].store(0, Ordering::Release);
                }
            }
            cursor.move_next();
        }
        // `members`' boxed nodes drop here. Any *other* page this block also spans still holds
        // its own independent membership node and is untouched until that page is invalidated.
    }
}

/// Why [`Dispatcher::run_loop`] returned control to its caller.
#[derive(Debug)]
pub enum ShutdownReason {
    /// The guest executed `hlt`.
    Hlt,
    /// The guest called `exit`/`exit_group`; carried through even though
    /// [`crate::dispatch::syscall::retire`] normally calls `std::process::exit` directly, for
    /// embedders that intercept it instead.
    Exit(i32),
    /// A signal became pending (§5); delivering it — constructing the guest-visible frame — is
    /// left to the [`crate::codeloader::CodeLoader`] embedder.
    Signal(i32),
}

/// Ties together block lookup, on-demand translation and publish, and guest-code execution for
/// one guest thread. Not `Sync`: each guest thread owns its own [`Dispatcher`] and [`BlockCache`],
/// sharing only the [`CodePool`] and [`HelperTable`] (§4.F "per-thread lookup cache").
pub struct Dispatcher<'a> {
    pub mem: &'a GuestMemoryManager,
    pub config: &'a Config,
    pub pool: &'a CodePool,
    pub cache: &'a mut BlockCache,
    pub helpers: &'a HelperTable,
    pub mode: Mode,
    /// Checked once per dispatch iteration (§5 "a pending-signal flag is checked at every
    /// dispatch boundary"); delivery is out of scope here, see [`ShutdownReason::Signal`].
    pub pending_signal: &'a AtomicI32,
    /// The on-disk IR cache (§4.G), consulted on every miss before falling back to decode/lift/
    /// optimize. `None` for embedders that don't want a persistent cache (e.g. short-lived guests).
    pub aot: Option<&'a AotCache>,
}

impl<'a> Dispatcher<'a> {
    /// Runs the guest starting from `cpu.rip` until it halts, exits, or a signal becomes pending.
    pub fn run_loop(&mut self, cpu: &mut GuestCpuState) -> Result<ShutdownReason, Error> {
        loop {
            let pending = self.pending_signal.swap(0, Ordering::AcqRel);
            if pending != 0 {
                return Ok(ShutdownReason::Signal(pending));
            }

            let rip = cpu.rip;
            let entry = match self.cache.lookup(rip) {
                Some(entry) => entry,
                None => {
                    let block = self.translate(rip)?;
                    let entry = block.entry();
                    self.cache.insert(block);
                    entry
                }
            };

            // SAFETY: `entry` was published by `self.pool` for this exact `cpu`'s architecture
            // and `self.config`, following the `X28` = CPU-state-pointer / `X0` = exit-status
            // convention `crate::codegen::compile_block` assumes.
            let status = unsafe { call_block(entry, cpu as *mut GuestCpuState) };
            match status {
                exit_status::HALT => return Ok(ShutdownReason::Hlt),
                exit_status::SYSCALL | exit_status::CONTINUE => continue,
                other => {
                    return Err(Error::TranslationFailure(format!(
                        "compiled block returned unrecognized exit status {other}"
                    )))
                }
            }
        }
    }

    fn translate(&self, rip: u64) -> Result<Arc<CompiledBlock>, Error> {
        let cached = self.aot.and_then(|aot| aot.lookup(self.mem, rip));
        let (ir, alloc) = match cached {
            Some(hit) => hit,
            None => {
                let mut ir = lifter::lift_block(self.mem, self.config, rip, self.mode)?;
                let alloc = opt::optimize(&mut ir, codegen::MAX_GPR_ALLOC, codegen::MAX_FPR_ALLOC);
                if let Some(aot) = self.aot {
                    aot.insert(self.mem, rip, ir.clone(), alloc.clone());
                }
                (ir, alloc)
            }
        };
        let code = codegen::compile_block(&ir, &alloc, self.config, self.helpers);

        let entry_rips: Vec<u64> = ir.regions.iter().map(|r| r.guest_rip).collect();
        let first_page = page_of(rip);
        let last_page = page_of(ir.guest_end_rip.max(rip));
        let guest_pages: Vec<u64> = (first_page..=last_page).step_by(PAGE_SIZE as usize).collect();

        self.pool.publish(rip, self.config.fingerprint(), entry_rips, guest_pages, &code)
    }
}

/// Enters a compiled block, pinning `X28` to `cpu` for the call's duration (the convention every
/// [`crate::codegen::compile_block`] output assumes) and returning the exit status the block left
/// in `X0` (`crate::codegen::exit_status`).
///
/// # Safety
/// `entry` must be the start of a mapping produced by [`CodePool::publish`] from code
/// [`crate::codegen::compile_block`] generated for this exact host, and `cpu` must be a valid,
/// exclusively borrowed [`GuestCpuState`] for the guest thread the block was compiled against.
#[cfg(target_arch = "aarch64")]
unsafe fn call_block(entry: *const u8, cpu: *mut GuestCpuState) -> u64 {
    let status: u64;
    std::arch::asm!(
        "mov x28, {cpu}",
        "blr {entry}",
        cpu = in(reg) cpu,
        entry = in(reg) entry,
        lateout("x0") status,
        lateout("x28") _,
        out("x1") _, out("x2") _, out("x3") _, out("x4") _, out("x5") _, out("x6") _,
        out("x7") _, out("x8") _, out("x9") _, out("x10") _, out("x11") _, out("x12") _,
        out("x13") _, out("x14") _, out("x15") _, out("x16") _, out("x17") _, out("x18") _,
        out("x19") _, out("x20") _, out("x21") _, out("x22") _, out("x23") _, out("x24") _,
        out("x25") _, out("x26") _, out("x27") _, out("lr") _,
        out("v0") _, out("v1") _, out("v2") _, out("v3") _, out("v4") _, out("v5") _,
        out("v6") _, out("v7") _, out("v8") _, out("v9") _, out("v10") _, out("v11") _,
        out("v12") _, out("v13") _, out("v14") _, out("v15") _, out("v16") _, out("v17") _,
        out("v18") _, out("v19") _, out("v20") _, out("v21") _, out("v22") _, out("v23") _,
        out("v24") _, out("v25") _, out("v26") _, out("v27") _, out("v28") _, out("v29") _,
        out("v30") _, out("v31") _,
    );
    status
}

#[cfg(not(target_arch = "aarch64"))]
unsafe fn call_block(_entry: *const u8, _cpu: *mut GuestCpuState) -> u64 {
    unreachable!("the code generator only targets aarch64 hosts")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::SmcMode;

    fn write_guest(mem: &mut GuestMemoryManager, addr: u64, bytes: &[u8]) {
        // SAFETY: `addr` was just returned by `allocate_guest_region`, within a WRITE mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
    }

    #[test]
    fn cache_insert_then_invalidate_clears_every_entry_rip() {
        let pool = CodePool::new();
        let block = pool
            .publish(0x1000, 0, vec![0x1000, 0x1004], vec![page_of(0x1000)], &[0xd6, 0x5f, 0x03, 0xc0])
            .unwrap();
        let mut cache = BlockCache::new();
        cache.insert(block);
        assert!(cache.lookup(0x1000).is_some());
        assert!(cache.lookup(0x1004).is_some());
        cache.invalidate_page(page_of(0x1000));
        assert!(cache.lookup(0x1000).is_none());
        assert!(cache.lookup(0x1004).is_none());
    }

    #[test]
    fn invalidating_an_unrelated_page_is_a_no_op() {
        let pool = CodePool::new();
        let block = pool
            .publish(0x2000, 0, vec![0x2000], vec![page_of(0x2000)], &[0xd6, 0x5f, 0x03, 0xc0])
            .unwrap();
        let mut cache = BlockCache::new();
        cache.insert(block);
        cache.invalidate_page(page_of(0x9000));
        assert!(cache.lookup(0x2000).is_some());
    }

    #[test]
    fn run_loop_halts_on_hlt_after_a_nop() {
        let mut mem = GuestMemoryManager::new(SmcMode::Full, false);
        let base = mem.allocate_guest_region(4096).unwrap();
        write_guest(&mut mem, base, &[0x90, 0xf4]);

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

        let mut cpu = GuestCpuState { rip: base, ..GuestCpuState::default() };
        let reason = dispatcher.run_loop(&mut cpu).unwrap();
        assert!(matches!(reason, ShutdownReason::Hlt));
        assert_eq!(cpu.rip, base + 2);
    }
}
