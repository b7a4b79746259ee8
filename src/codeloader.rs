//! The `CodeLoader` trait (§6): the seam between this crate and whatever supplies a guest memory
//! image and an entry point. This crate never reads an ELF file itself — ELF parsing, argument
//! handling and `/proc/self/exe`-style interpreter setup are explicit non-goals (§1) left to the
//! embedder. Tests construct an in-memory [`CodeLoader`] rather than pointing at a real binary.

use crate::error::Error;
use crate::memory::{GuestMemoryManager, GuestProt};

/// Supplies everything the translator needs to stand up a guest process image, but nothing about
/// *how* that image was produced. An ELF loader, a raw flat-binary loader and a test fixture that
/// pokes bytes directly into a `Vec<u8>` are all equally valid implementations.
pub trait CodeLoader {
    /// Size in bytes of the initial stack region to reserve (§6).
    fn stack_size(&self) -> u64;

    /// Writes the initial stack contents (argv/envp/auxv for an ELF loader, nothing for a flat
    /// test fixture) at `host_ptr`, which backs the guest stack region at `guest_ptr` under the
    /// identity mapping. Returns the initial guest `RSP`, which is not necessarily
    /// `guest_ptr + stack_size()` once alignment and the argv/envp/auxv footer are accounted for.
    fn setup_stack(&self, host_ptr: *mut u8, guest_ptr: u64) -> u64;

    /// The guest address execution should begin at absent any other instruction (e.g. an ELF
    /// entry point, or the interpreter's entry point for a dynamically linked guest).
    fn default_rip(&self) -> u64;

    /// The page-aligned `(start, end, size)` of the memory region this loader needs mapped
    /// before [`load_memory`](Self::load_memory) is called, so the translator can reserve guest
    /// address space in one shot rather than growing it segment by segment.
    fn layout(&self) -> (u64, u64, u64);

    /// Calls `writer` once per source region this loader needs copied into guest memory, passing
    /// a host pointer to the source bytes, the guest-relative offset within
    /// [`layout`](Self::layout)'s range the bytes belong at, and their length. The translator
    /// performs the actual copy (the loader does not know the host address the guest region
    /// ended up mapped at).
    fn load_memory(&self, writer: &mut dyn FnMut(*const u8, u64, u64));
}

/// Reserves `loader`'s [`CodeLoader::layout`] region and stack in `mem`, copies in everything
/// [`CodeLoader::load_memory`] supplies, and returns the `(entry_rip, initial_rsp)` pair a
/// [`crate::dispatch::Dispatcher`] needs to start running the guest.
pub fn load_into(mem: &mut GuestMemoryManager, loader: &dyn CodeLoader) -> Result<(u64, u64), Error> {
    let (start, end, size) = loader.layout();
    if end.saturating_sub(start) < size {
        return Err(Error::TranslationFailure(format!(
            "code loader layout ({start:#x}, {end:#x}, {size:#x}) is inconsistent"
        )));
    }

    let guest_base = mem.allocate_guest_region(size)?;
    mem.intercept_mmap(guest_base, size, GuestProt::READ | GuestProt::WRITE | GuestProt::EXECUTE)?;

    let mut copy_err = None;
    loader.load_memory(&mut |src, guest_off, len| {
        if copy_err.is_some() || len == 0 {
            return;
        }
        if guest_off.saturating_add(len) > size {
            copy_err = Some(Error::TranslationFailure(format!(
                "load_memory region [{guest_off:#x}, {:#x}) overruns layout size {size:#x}",
                guest_off + len
            )));
            return;
        }
        // SAFETY: `src` is valid for `len` bytes per the `CodeLoader` contract, and
        // `guest_base + guest_off` was just reserved above with `len <= size` checked.
        unsafe {
            std::ptr::copy_nonoverlapping(src, (guest_base + guest_off) as *mut u8, len as usize);
        }
    });
    if let Some(err) = copy_err {
        return Err(err);
    }

    let stack_size = loader.stack_size();
    let stack_base = mem.allocate_guest_region(stack_size)?;
    mem.intercept_mmap(stack_base, stack_size, GuestProt::READ | GuestProt::WRITE)?;
    let rsp = loader.setup_stack(stack_base as *mut u8, stack_base);

    Ok((loader.default_rip(), rsp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SmcMode;

    struct FlatLoader {
        image: Vec<u8>,
        entry: u64,
    }

    impl CodeLoader for FlatLoader {
        fn stack_size(&self) -> u64 {
            64 * 1024
        }

        fn setup_stack(&self, _host_ptr: *mut u8, guest_ptr: u64) -> u64 {
            guest_ptr + self.stack_size() - 16
        }

        fn default_rip(&self) -> u64 {
            self.entry
        }

        fn layout(&self) -> (u64, u64, u64) {
            let size = self.image.len() as u64;
            (0, size, size)
        }

        fn load_memory(&self, writer: &mut dyn FnMut(*const u8, u64, u64)) {
            writer(self.image.as_ptr(), 0, self.image.len() as u64);
        }
    }

    #[test]
    fn loads_image_bytes_into_reserved_guest_memory() {
        let mut mem = GuestMemoryManager::new(SmcMode::Full, false);
        let loader = FlatLoader { image: vec![0x90, 0xf4], entry: 0 };

        let (entry, rsp) = load_into(&mut mem, &loader).unwrap();
        assert_eq!(entry, 0);
        assert!(rsp > 0);

        let mut buf = [0u8; 2];
        mem.read_guest_bytes(0, &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0xf4]);
    }

    #[test]
    fn overrunning_layout_size_is_rejected() {
        let mut mem = GuestMemoryManager::new(SmcMode::Full, false);
        struct BadLoader;
        impl CodeLoader for BadLoader {
            fn stack_size(&self) -> u64 {
                4096
            }
            fn setup_stack(&self, _h: *mut u8, g: u64) -> u64 {
                g
            }
            fn default_rip(&self) -> u64 {
                0
            }
            fn layout(&self) -> (u64, u64, u64) {
                (0, 16, 16)
            }
            fn load_memory(&self, writer: &mut dyn FnMut(*const u8, u64, u64)) {
                let data = [0u8; 32];
                writer(data.as_ptr(), 0, data.len() as u64);
            }
        }

        let err = load_into(&mut mem, &BadLoader).unwrap_err();
        assert!(matches!(err, Error::TranslationFailure(_)));
    }
}
