//! The Guest Memory Manager (§4.A): owns the guest's virtual address space, applies
//! `mmap`/`mprotect`/`munmap` on the guest's behalf, and tracks which pages currently hold
//! translated code so self-modifying writes can be detected.
//!
//! Guest memory is identity-mapped: a guest address and the host address backing it are the same
//! number. Each [`Region`] keeps its own owned [`mmap_rs::MmapMut`] alive for as long as the
//! guest mapping it backs exists, the same way [`crate::dispatch::CodePool`] keeps one mapping
//! alive per compiled block, since many guest pages can share the one host mapping they were
//! carved out of.

use crate::error::Error;
use rangemap::RangeMap;
use std::collections::HashSet;

pub const PAGE_SIZE: u64 = 4096;

bitflags::bitflags! {
    /// Protection flags for a guest mapping, matching the subset `mmap(2)`/`mprotect(2)` expose.
    pub struct GuestProt: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Controls how aggressively self-modifying code is detected (§5, forms part of a [`Block`]'s
/// configuration fingerprint per §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SmcMode {
    /// Invalidate on any write to a page marked as containing code.
    Full,
    /// Only invalidate when a page transitions from executable to writable (cheaper, assumes
    /// guest programs do not write to their own live code through an aliasing mapping).
    MmanOnly,
    /// Never invalidate automatically; the embedder is responsible for calling
    /// [`GuestMemoryManager::mark_code_page`]/eviction manually. Used for read-only executables.
    None,
}

struct Region {
    mapping: mmap_rs::MmapMut,
    guest_base: u64,
}

/// Owns the guest's address space. One instance is shared (behind a lock, at the process level)
/// across all guest threads, since `mmap`/`munmap`/`mprotect` are process-wide operations on
/// real Linux, and code-page invalidation must be visible to every thread's [`crate::dispatch::BlockCache`].
pub struct GuestMemoryManager {
    regions: Vec<Region>,
    protections: RangeMap<u64, GuestProt>,
    code_pages: HashSet<u64>,
    smc_mode: SmcMode,
    is_32bit: bool,
}

impl GuestMemoryManager {
    pub fn new(smc_mode: SmcMode, is_32bit: bool) -> Self {
        Self {
            regions: Vec::new(),
            protections: RangeMap::new(),
            code_pages: HashSet::new(),
            smc_mode,
            is_32bit,
        }
    }

    /// Reserves a contiguous, host-observable guest region of `size` bytes (rounded up to a page)
    /// and returns its guest base address. For 32-bit guests the reservation must lie below
    /// 2^32; this is enforced by retrying allocation with a low hint and failing rather than
    /// silently returning an address the guest cannot represent.
    pub fn allocate_guest_region(&mut self, size: u64) -> Result<u64, Error> {
        let size = align_up(size, PAGE_SIZE) as usize;
        let mapping = mmap_rs::MmapOptions::new(size)?.map_mut()?;
        let guest_base = mapping.as_ptr() as u64;

        if self.is_32bit && guest_base.checked_add(size as u64).map_or(true, |end| end > u32::MAX as u64) {
            return Err(Error::OutOfGuestAddressSpace { size: size as u64 });
        }

        self.regions.push(Region { mapping, guest_base });
        self.protections.insert(
            guest_base..guest_base + size as u64,
            GuestProt::READ | GuestProt::WRITE,
        );

        Ok(guest_base)
    }

    /// Applies a guest `mmap`. Returns the set of pages that must be invalidated in every
    /// thread's block cache as a result (always empty for a fresh mapping, since a page cannot
    /// already hold cached code before it exists).
    pub fn intercept_mmap(
        &mut self,
        guest_addr: u64,
        len: u64,
        prot: GuestProt,
    ) -> Result<Vec<u64>, Error> {
        let len = align_up(len, PAGE_SIZE);
        let mapping = mmap_rs::MmapOptions::new(len as usize)?.map_mut()?;

        self.regions.push(Region {
            mapping,
            guest_base: guest_addr,
        });
        self.protections.insert(guest_addr..guest_addr + len, prot);

        Ok(Vec::new())
    }

    /// Applies a guest `mprotect`, returning the pages that must be invalidated: under
    /// [`SmcMode::Full`] any code page losing write-protection invalidates, under
    /// [`SmcMode::MmanOnly`] only a page that stops being executable or starts being writable
    /// invalidates.
    pub fn intercept_mprotect(
        &mut self,
        guest_addr: u64,
        len: u64,
        prot: GuestProt,
    ) -> Result<Vec<u64>, Error> {
        let len = align_up(len, PAGE_SIZE);
        let mut invalidated = Vec::new();

        let old_prots: Vec<_> = self
            .protections
            .overlapping(guest_addr..guest_addr + len)
            .map(|(range, prot)| (range.clone(), *prot))
            .collect();

        self.protections.insert(guest_addr..guest_addr + len, prot);

        let mut page = guest_addr & !(PAGE_SIZE - 1);
        while page < guest_addr + len {
            if self.code_pages.contains(&page) {
                let old_prot = old_prots
                    .iter()
                    .find(|(range, _)| range.contains(&page))
                    .map(|(_, p)| *p)
                    .unwrap_or(GuestProt::empty());

                let should_invalidate = match self.smc_mode {
                    SmcMode::Full => true,
                    SmcMode::MmanOnly => {
                        let was_exec = old_prot.contains(GuestProt::EXECUTE);
                        let becomes_writable = prot.contains(GuestProt::WRITE);
                        let loses_exec = !prot.contains(GuestProt::EXECUTE);
                        (was_exec && loses_exec) || becomes_writable
                    }
                    SmcMode::None => false,
                };

                if should_invalidate {
                    self.code_pages.remove(&page);
                    invalidated.push(page);
                }
            }
            page += PAGE_SIZE;
        }

        Ok(invalidated)
    }

    /// Applies a guest `munmap`, returning the pages that must be invalidated (any overlapping
    /// code page, unconditionally: there is no code left to execute there).
    pub fn intercept_munmap(&mut self, guest_addr: u64, len: u64) -> Vec<u64> {
        let len = align_up(len, PAGE_SIZE);
        self.protections.remove(guest_addr..guest_addr + len);
        self.regions.retain(|r| {
            let end = r.guest_base + r.mapping.size() as u64;
            !(r.guest_base >= guest_addr && end <= guest_addr + len)
        });

        let mut invalidated = Vec::new();
        let mut page = guest_addr & !(PAGE_SIZE - 1);
        while page < guest_addr + len {
            if self.code_pages.remove(&page) {
                invalidated.push(page);
            }
            page += PAGE_SIZE;
        }
        invalidated
    }

    pub fn is_code_page(&self, page: u64) -> bool {
        self.code_pages.contains(&(page & !(PAGE_SIZE - 1)))
    }

    pub fn mark_code_page(&mut self, page: u64) {
        self.code_pages.insert(page & !(PAGE_SIZE - 1));
    }

    /// Reads `buf.len()` guest bytes starting at `addr`, following the identity mapping. Used by
    /// the decoder to stream instruction bytes directly out of guest memory.
    pub fn read_guest_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.check_range(addr, buf.len() as u64, GuestProt::READ)?;
        // SAFETY: `check_range` established that `[addr, addr + buf.len())` lies entirely within
        // a mapping this manager owns with READ permission, and guest addresses are host
        // addresses under the identity mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn check_range(&self, addr: u64, len: u64, required: GuestProt) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        match self.protections.overlapping(addr..addr + 1).next() {
            Some((range, prot)) if prot.contains(required) => {
                if addr + len <= range.end {
                    Ok(())
                } else {
                    Err(Error::AddressTranslationFault { addr: range.end })
                }
            }
            Some(_) => Err(Error::PermissionFault { addr }),
            None => Err(Error::AddressTranslationFault { addr }),
        }
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_read_round_trip() {
        let mut mgr = GuestMemoryManager::new(SmcMode::Full, false);
        let base = mgr.allocate_guest_region(PAGE_SIZE).unwrap();

        mgr.read_guest_bytes(base, &mut [0u8; 16]).unwrap();
        // SAFETY: the region is within the manager's own mapping.
        unsafe {
            std::ptr::write_bytes(base as *mut u8, 0x90, 16);
        }
        let mut buf = [0u8; 16];
        mgr.read_guest_bytes(base, &mut buf).unwrap();
        assert_eq!(buf, [0x90; 16]);
    }

    #[test]
    fn out_of_range_read_faults() {
        let mgr = GuestMemoryManager::new(SmcMode::Full, false);
        let err = mgr.read_guest_bytes(0x1000, &mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::AddressTranslationFault { addr: 0x1000 }));
    }

    #[test]
    fn full_smc_mode_invalidates_on_any_code_page_write_protect_change() {
        let mut mgr = GuestMemoryManager::new(SmcMode::Full, false);
        let base = mgr.allocate_guest_region(PAGE_SIZE).unwrap();
        mgr.mark_code_page(base);

        let invalidated = mgr
            .intercept_mprotect(base, PAGE_SIZE, GuestProt::READ | GuestProt::WRITE)
            .unwrap();

        assert_eq!(invalidated, vec![base]);
        assert!(!mgr.is_code_page(base));
    }

    #[test]
    fn munmap_invalidates_overlapping_code_pages() {
        let mut mgr = GuestMemoryManager::new(SmcMode::Full, false);
        let base = mgr.allocate_guest_region(PAGE_SIZE).unwrap();
        mgr.mark_code_page(base);

        let invalidated = mgr.intercept_munmap(base, PAGE_SIZE);
        assert_eq!(invalidated, vec![base]);
    }
}
