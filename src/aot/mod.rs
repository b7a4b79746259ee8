//! The content-addressed ahead-of-time IR cache (§4.G): persists the *optimized* IR and register
//! allocation for every translation unit a process produces, so a later run of the same binary
//! (or a sibling thread's translation of the same block) skips decode/lift/optimize and goes
//! straight to [`crate::codegen::compile_block`]. Deliberately does not cache the compiled host
//! code itself: a `HelperTable`'s addresses are only stable for the lifetime of one process.

mod format;

use crate::config::Config;
use crate::ir::IrBlock;
use crate::memory::GuestMemoryManager;
use crate::opt::Allocation;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;

/// Cookie identifying the file format; bumped whenever [`format`]'s encoding changes
/// incompatibly.
const COOKIE: &[u8; 8] = b"DBTXAOT1";

/// Entries buffered in memory are flushed to disk after this many accumulate, in addition to the
/// explicit flush on [`AotCache::shutdown`] (§4.G "flushing ... on shutdown or every N entries").
const FLUSH_INTERVAL: usize = 32;

struct CachedEntry {
    guest_rip: u64,
    guest_hash: u64,
    guest_length: u32,
    ir: IrBlock,
    alloc: Allocation,
}

/// Computes the string every cache file is tagged with at write time and checked against at open
/// time (§4.G): `{basename}-{xxhash of the guest binary's canonicalized path}-{config fingerprint
/// as hex}`. A mismatch means either a different binary or a different `Config` produced the
/// file, and the whole cache is discarded rather than partially trusted.
pub fn file_identifier(executable_path: &Path, config: &Config) -> String {
    let canonical = std::fs::canonicalize(executable_path).unwrap_or_else(|_| executable_path.to_path_buf());
    let path_hash = xxhash_rust::xxh3::xxh3_64(canonical.to_string_lossy().as_bytes());
    let basename = executable_path.file_name().and_then(|n| n.to_str()).unwrap_or("unknown");
    format!("{basename}-{path_hash:016x}-{:02x}", config.fingerprint())
}

/// A process-lifetime handle onto one guest binary's on-disk IR cache. Reads happen directly
/// against whatever was loaded from disk at [`AotCache::open`]; writes queue onto a background
/// thread so a translation miss is never held up by file I/O (§4.G).
pub struct AotCache {
    identifier: String,
    path: PathBuf,
    /// Guest start `RIP` -> cached entry, loaded once at open and extended as new translations
    /// are produced; the background writer flushes from a clone of this map's new entries, never
    /// mutating it directly, so a concurrent `lookup` never blocks on a flush in progress.
    entries: Mutex<HashMap<u64, CachedEntry>>,
    sender: mpsc::Sender<CachedEntry>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl AotCache {
    /// Opens (creating if absent) the cache file at `path` for `executable_path` under `config`.
    /// An existing file tagged with a different [`file_identifier`] is treated as absent rather
    /// than an error.
    pub fn open(path: &Path, executable_path: &Path, config: &Config) -> Self {
        let identifier = file_identifier(executable_path, config);
        let loaded = format::read_file(path, &identifier).unwrap_or_default();

        let entries: HashMap<u64, CachedEntry> = loaded
            .into_iter()
            .map(|e| {
                (
                    e.guest_rip,
                    CachedEntry {
                        guest_rip: e.guest_rip,
                        guest_hash: e.guest_hash,
                        guest_length: e.guest_length,
                        ir: e.ir,
                        alloc: e.alloc,
                    },
                )
            })
            .collect();

        let entries = Mutex::new(entries);
        let (sender, receiver) = mpsc::channel::<CachedEntry>();

        let worker_path = path.to_path_buf();
        let worker_identifier = identifier.clone();
        let worker = std::thread::Builder::new()
            .name("dbtx-aot-writer".into())
            .spawn(move || writer_loop(worker_path, worker_identifier, receiver))
            .ok();

        Self { identifier, path: path.to_path_buf(), entries, sender, worker }
    }

    /// Looks up a translation unit by its start `RIP`, re-reading exactly the cached
    /// `guest_length` live guest bytes from `rip` and verifying they still hash to what was
    /// cached — a cheap defense against a stale cache surviving a binary that self-modified since
    /// it was written.
    pub fn lookup(&self, mem: &GuestMemoryManager, rip: u64) -> Option<(IrBlock, Allocation)> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&rip)?;
        let mut buf = vec![0u8; entry.guest_length as usize];
        mem.read_guest_bytes(rip, &mut buf).ok()?;
        if xxhash_rust::xxh3::xxh3_64(&buf) != entry.guest_hash {
            return None;
        }
        Some((entry.ir.clone(), entry.alloc.clone()))
    }

    /// Queues a freshly produced translation for the background writer and makes it visible to
    /// subsequent [`lookup`] calls from this same process immediately (no need to wait for a
    /// flush to round-trip through disk).
    pub fn insert(&self, mem: &GuestMemoryManager, rip: u64, ir: IrBlock, alloc: Allocation) {
        let guest_length = (ir.guest_end_rip.saturating_sub(rip)) as u32;
        let mut buf = vec![0u8; guest_length as usize];
        if mem.read_guest_bytes(rip, &mut buf).is_err() {
            return;
        }
        let guest_hash = xxhash_rust::xxh3::xxh3_64(&buf);

        let entry = CachedEntry { guest_rip: rip, guest_hash, guest_length, ir, alloc };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(rip, clone_entry(&entry));
        drop(entries);
        let _ = self.sender.send(entry);
    }

    /// Blocks until every queued entry has been flushed to disk and the writer thread exits
    /// (§4.G "flushing ... on shutdown").
    pub fn shutdown(mut self) {
        drop(self.sender.clone());
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn clone_entry(entry: &CachedEntry) -> CachedEntry {
    CachedEntry {
        guest_rip: entry.guest_rip,
        guest_hash: entry.guest_hash,
        guest_length: entry.guest_length,
        ir: entry.ir.clone(),
        alloc: entry.alloc.clone(),
    }
}

fn writer_loop(path: PathBuf, identifier: String, receiver: mpsc::Receiver<CachedEntry>) {
    let mut pending: Vec<format::OwnedEntry> = format::read_file(&path, &identifier).unwrap_or_default();
    let mut since_flush = 0usize;

    for entry in receiver.iter() {
        pending.push(format::OwnedEntry {
            guest_rip: entry.guest_rip,
            guest_hash: entry.guest_hash,
            guest_length: entry.guest_length,
            ir: entry.ir,
            alloc: entry.alloc,
        });
        since_flush += 1;
        if since_flush >= FLUSH_INTERVAL {
            flush(&path, &identifier, &pending);
            since_flush = 0;
        }
    }
    // Channel closed (every `AotCache::sender` dropped): final flush before the thread exits.
    flush(&path, &identifier, &pending);
}

fn flush(path: &Path, identifier: &str, entries: &[format::OwnedEntry]) {
    let tmp_path = path.with_extension("tmp");
    let bytes = format::encode_file(identifier, entries);
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if let Err(err) = result {
        tracing::warn!(?err, path = %path.display(), "failed to flush AOT cache");
    }
}
