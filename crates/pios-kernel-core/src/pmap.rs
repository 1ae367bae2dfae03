//! Address-space manager
//!
//! A two-level page directory (10/10/12 split) built over the frame arena.
//! The directory and every page table occupy a pinned frame so they are
//! accounted in physical memory, while the entries themselves are kept as
//! typed values indexed by directory and table slot.
//!
//! # Invariants
//!
//! - Every present leaf entry holds one reference on its frame; `map`,
//!   `unmap` and `destroy` are the only code paths that retain or release.
//! - `map` retains the new frame before releasing the replaced one, so
//!   re-mapping a page onto itself never frees it.
//! - Every edit invalidates the cached translation for the page.

use alloc::collections::btree_map::Entry;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use pios_axiom::Fnv1a;

use crate::error::{KernelError, KernelResult};
use crate::pmem::{FrameNumber, PhysicalMemory};
use crate::types::{
    page_aligned, pdx, ptx, round_down, PteFlags, NPTENTRIES, PDXSHIFT, PGSHIFT, PGSIZE, UINFO,
    UTOP, VA_LIMIT,
};

/// A present leaf entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameNumber,
    pub flags: PteFlags,
}

impl Pte {
    pub fn writable(&self) -> bool {
        self.flags.contains(PteFlags::WRITABLE)
    }

    pub fn user(&self) -> bool {
        self.flags.contains(PteFlags::USER)
    }
}

struct PageTable {
    frame: FrameNumber,
    entries: Vec<Option<Pte>>,
    present: usize,
}

/// A user access that the page tables refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserFault {
    /// First faulting address
    pub va: u64,
    /// True if the access was a store
    pub write: bool,
    /// True if a mapping existed but lacked permission
    pub protection: bool,
}

/// Translation-cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// One environment's address space.
pub struct AddressSpace {
    root: FrameNumber,
    tables: BTreeMap<usize, PageTable>,
    tlb: BTreeMap<u64, Pte>,
    tlb_stats: TlbStats,
}

fn check_va(va: u64) -> KernelResult<()> {
    if !page_aligned(va) || va >= VA_LIMIT {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

impl AddressSpace {
    /// Allocate a directory and map the shared kernel info page read-only.
    pub fn create(mem: &PhysicalMemory, shared: FrameNumber) -> KernelResult<Self> {
        let root = mem.allocate_pinned()?;
        let mut space = Self {
            root,
            tables: BTreeMap::new(),
            tlb: BTreeMap::new(),
            tlb_stats: TlbStats::default(),
        };
        if let Err(e) = space.map(mem, UINFO, shared, PteFlags::PRESENT | PteFlags::USER) {
            space.destroy(mem);
            return Err(e);
        }
        Ok(space)
    }

    /// Frame holding the page directory
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    fn invalidate(&mut self, va: u64) {
        if self.tlb.remove(&(va >> PGSHIFT)).is_some() {
            self.tlb_stats.invalidations += 1;
        }
    }

    /// Install or replace the mapping for `va`.
    ///
    /// Allocates the page table on demand; fails with `OutOfMemory` if that
    /// allocation fails, leaving the space unchanged.
    pub fn map(
        &mut self,
        mem: &PhysicalMemory,
        va: u64,
        frame: FrameNumber,
        flags: PteFlags,
    ) -> KernelResult<()> {
        check_va(va)?;
        let table = match self.tables.entry(pdx(va)) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(PageTable {
                frame: mem.allocate_pinned()?,
                entries: vec![None; NPTENTRIES],
                present: 0,
            }),
        };

        mem.retain(frame);
        let slot = &mut table.entries[ptx(va)];
        let old = slot.replace(Pte {
            frame,
            flags: flags | PteFlags::PRESENT,
        });
        match old {
            Some(old) => {
                mem.release(old.frame);
            }
            None => table.present += 1,
        }
        self.invalidate(va);
        Ok(())
    }

    /// Remove the mapping for `va`, returning the frame it referenced.
    pub fn unmap(&mut self, mem: &PhysicalMemory, va: u64) -> Option<FrameNumber> {
        if check_va(va).is_err() {
            return None;
        }
        let table = self.tables.get_mut(&pdx(va))?;
        let old = table.entries[ptx(va)].take()?;
        table.present -= 1;
        mem.release(old.frame);
        self.invalidate(va);
        Some(old.frame)
    }

    /// Change the permissions of an existing mapping.
    pub fn protect(&mut self, va: u64, flags: PteFlags) -> KernelResult<()> {
        check_va(va)?;
        let entry = self
            .tables
            .get_mut(&pdx(va))
            .and_then(|t| t.entries[ptx(va)].as_mut())
            .ok_or(KernelError::BadAddress)?;
        entry.flags = flags | PteFlags::PRESENT;
        self.invalidate(va);
        Ok(())
    }

    /// Walk the tables for `va` (any offset within the page).
    pub fn lookup(&self, va: u64) -> Option<Pte> {
        if va >= VA_LIMIT {
            return None;
        }
        self.tables
            .get(&pdx(va))
            .and_then(|t| t.entries[ptx(va)])
    }

    /// Translate through the cache, filling it on a miss.
    pub fn translate(&mut self, va: u64) -> Option<Pte> {
        let vpn = va >> PGSHIFT;
        if let Some(pte) = self.tlb.get(&vpn) {
            self.tlb_stats.hits += 1;
            return Some(*pte);
        }
        self.tlb_stats.misses += 1;
        let pte = self.lookup(va)?;
        self.tlb.insert(vpn, pte);
        Some(pte)
    }

    pub fn tlb_stats(&self) -> TlbStats {
        self.tlb_stats
    }

    /// Every present mapping, ascending by virtual address
    pub fn mappings(&self) -> impl Iterator<Item = (u64, Pte)> + '_ {
        self.tables.iter().flat_map(|(dir, table)| {
            table.entries.iter().enumerate().filter_map(move |(i, e)| {
                e.map(|pte| (((*dir as u64) << PDXSHIFT) | ((i as u64) << PGSHIFT), pte))
            })
        })
    }

    /// Mappings below UTOP (the part of the space user code controls)
    pub fn user_mappings(&self) -> impl Iterator<Item = (u64, Pte)> + '_ {
        self.mappings().filter(|(va, _)| *va < UTOP)
    }

    pub fn mapping_count(&self) -> usize {
        self.tables.values().map(|t| t.present).sum()
    }

    /// Frames used by page-table structure (directory first)
    pub fn table_frames(&self) -> Vec<FrameNumber> {
        let mut frames = Vec::with_capacity(self.tables.len() + 1);
        frames.push(self.root);
        frames.extend(self.tables.values().map(|t| t.frame));
        frames
    }

    /// Unmap everything, free every page table and the directory.
    ///
    /// Returns the number of mappings released.
    pub fn destroy(mut self, mem: &PhysicalMemory) -> usize {
        let mut released = 0;
        for (_, table) in core::mem::take(&mut self.tables) {
            for pte in table.entries.into_iter().flatten() {
                mem.release(pte.frame);
                released += 1;
            }
            mem.free(table.frame);
        }
        mem.free(self.root);
        released
    }

    // ========================================================================
    // User memory access
    // ========================================================================

    fn check_user(&mut self, va: u64, write: bool) -> Result<Pte, UserFault> {
        match self.translate(va) {
            None => Err(UserFault {
                va,
                write,
                protection: false,
            }),
            Some(pte) if !pte.user() || (write && (!pte.writable() || va >= UTOP)) => {
                Err(UserFault {
                    va,
                    write,
                    protection: true,
                })
            }
            Some(pte) => Ok(pte),
        }
    }

    /// Check that `[va, va+len)` is accessible to user code.
    pub fn user_mem_check(&mut self, va: u64, len: usize, write: bool) -> Result<(), UserFault> {
        if len == 0 {
            return Ok(());
        }
        let end = va
            .checked_add(len as u64)
            .filter(|end| *end <= VA_LIMIT)
            .ok_or(UserFault {
                va,
                write,
                protection: false,
            })?;
        let mut page = round_down(va);
        while page < end {
            self.check_user(page.max(va), write)?;
            page += PGSIZE;
        }
        Ok(())
    }

    /// Copy user memory into `buf` with user permissions.
    pub fn copy_from_user(
        &mut self,
        mem: &PhysicalMemory,
        va: u64,
        buf: &mut [u8],
    ) -> Result<(), UserFault> {
        self.user_mem_check(va, buf.len(), false)?;
        let mut done = 0;
        while done < buf.len() {
            let addr = va + done as u64;
            let offset = (addr % PGSIZE) as usize;
            let chunk = (PGSIZE as usize - offset).min(buf.len() - done);
            let pte = self.check_user(addr, false)?;
            mem.read(pte.frame, offset, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into user memory with user permissions.
    ///
    /// Nothing is written unless the whole range is writable.
    pub fn copy_to_user(
        &mut self,
        mem: &PhysicalMemory,
        va: u64,
        data: &[u8],
    ) -> Result<(), UserFault> {
        self.user_mem_check(va, data.len(), true)?;
        let mut done = 0;
        while done < data.len() {
            let addr = va + done as u64;
            let offset = (addr % PGSIZE) as usize;
            let chunk = (PGSIZE as usize - offset).min(data.len() - done);
            let pte = self.check_user(addr, true)?;
            mem.write(pte.frame, offset, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// FNV-1a over (address, contents) of every user-readable page below UTOP.
    pub fn checksum(&self, mem: &PhysicalMemory) -> u64 {
        let mut h = Fnv1a::new();
        for (va, pte) in self.user_mappings() {
            if !pte.user() {
                continue;
            }
            h.u64(va);
            mem.with_frame(pte.frame, |bytes| {
                h.bytes(bytes);
            });
        }
        h.finish()
    }

    /// Eager copy: a new space whose user pages are fresh copies of ours.
    pub fn duplicate(
        &self,
        mem: &PhysicalMemory,
        shared: FrameNumber,
    ) -> KernelResult<AddressSpace> {
        let mut child = AddressSpace::create(mem, shared)?;
        for (va, pte) in self.user_mappings() {
            let copied = mem.allocate().and_then(|frame| {
                mem.copy(pte.frame, frame);
                child.map(mem, va, frame, pte.flags).map_err(|e| {
                    mem.free(frame);
                    e
                })
            });
            if let Err(e) = copied {
                child.destroy(mem);
                return Err(e);
            }
        }
        Ok(child)
    }
}

/// Allocate a zeroed frame and map it at `va`, freeing it on failure.
pub fn map_fresh(
    space: &mut AddressSpace,
    mem: &PhysicalMemory,
    va: u64,
    flags: PteFlags,
) -> KernelResult<FrameNumber> {
    let frame = mem.allocate()?;
    if let Err(e) = space.map(mem, va, frame, flags) {
        mem.free(frame);
        return Err(e);
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER);
    const UR: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);

    fn setup(pages: usize) -> (PhysicalMemory, FrameNumber, AddressSpace) {
        let mem = PhysicalMemory::new(pages);
        let shared = mem.allocate().unwrap();
        mem.pin(shared);
        let space = AddressSpace::create(&mem, shared).unwrap();
        (mem, shared, space)
    }

    // ========================================================================
    // Creation / teardown
    // ========================================================================

    #[test]
    fn test_create_maps_only_info_page() {
        let (mem, shared, space) = setup(16);
        let mappings: Vec<_> = space.mappings().collect();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].0, UINFO);
        assert_eq!(mappings[0].1.frame, shared);
        assert!(!mappings[0].1.writable());
        assert_eq!(mem.refcount(shared), 1);
        assert_eq!(space.user_mappings().count(), 0);
    }

    #[test]
    fn test_destroy_returns_everything() {
        let (mem, shared, mut space) = setup(16);
        let before = mem.free_count();
        for i in 0..3 {
            map_fresh(&mut space, &mem, 0x1000 * (i + 1), URW).unwrap();
        }
        map_fresh(&mut space, &mem, 0x0080_0000, URW).unwrap();
        assert!(mem.free_count() < before);

        let released = space.destroy(&mem);
        assert_eq!(released, 5); // 4 user pages + info page
        // root + first table were allocated in setup; all return now
        assert_eq!(mem.free_count(), before + 2);
        assert_eq!(mem.refcount(shared), 0);
        assert!(!mem.is_free(shared));
    }

    // ========================================================================
    // map / unmap refcounts
    // ========================================================================

    #[test]
    fn test_refcount_tracks_mappings_across_spaces() {
        let (mem, shared, mut a) = setup(32);
        let mut b = AddressSpace::create(&mem, shared).unwrap();
        let frame = mem.allocate().unwrap();

        a.map(&mem, 0x1000, frame, URW).unwrap();
        a.map(&mem, 0x2000, frame, UR).unwrap();
        b.map(&mem, 0x5000, frame, UR).unwrap();
        assert_eq!(mem.refcount(frame), 3);

        a.unmap(&mem, 0x1000);
        assert_eq!(mem.refcount(frame), 2);

        let released = a.destroy(&mem);
        assert_eq!(released, 2);
        assert_eq!(mem.refcount(frame), 1);

        b.unmap(&mem, 0x5000);
        assert!(mem.is_free(frame));
    }

    #[test]
    fn test_remap_same_frame_does_not_free() {
        let (mem, _shared, mut space) = setup(16);
        let frame = map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        space.map(&mem, 0x1000, frame, UR).unwrap();
        assert_eq!(mem.refcount(frame), 1);
        assert!(!mem.is_free(frame));
        assert!(!space.lookup(0x1000).unwrap().writable());
    }

    #[test]
    fn test_replace_releases_old_frame() {
        let (mem, _shared, mut space) = setup(16);
        let old = map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        let new = map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        assert!(mem.is_free(old));
        assert_eq!(mem.refcount(new), 1);
        assert_eq!(space.mapping_count(), 2);
    }

    #[test]
    fn test_unmap_absent_is_noop() {
        let (mem, _shared, mut space) = setup(16);
        assert_eq!(space.unmap(&mem, 0x7000), None);
        assert_eq!(space.unmap(&mem, 0x7001), None);
    }

    #[test]
    fn test_map_rejects_bad_addresses() {
        let (mem, _shared, mut space) = setup(16);
        let frame = mem.allocate().unwrap();
        assert_eq!(
            space.map(&mem, 0x1001, frame, URW),
            Err(KernelError::BadAddress)
        );
        assert_eq!(
            space.map(&mem, VA_LIMIT, frame, URW),
            Err(KernelError::BadAddress)
        );
        assert_eq!(mem.refcount(frame), 0);
    }

    #[test]
    fn test_map_out_of_memory_for_table() {
        let (mem, _shared, mut space) = setup(4);
        // root, table for UINFO, shared = 3 frames used; one left
        let frame = mem.allocate().unwrap();
        assert_eq!(
            space.map(&mem, 0x1000, frame, URW),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(mem.refcount(frame), 0);
        assert!(space.lookup(0x1000).is_none());
    }

    #[test]
    fn test_protect() {
        let (mem, _shared, mut space) = setup(16);
        map_fresh(&mut space, &mem, 0x3000, URW).unwrap();
        space.protect(0x3000, UR).unwrap();
        assert!(!space.lookup(0x3000).unwrap().writable());
        assert_eq!(space.protect(0x4000, UR), Err(KernelError::BadAddress));
    }

    // ========================================================================
    // Translation cache
    // ========================================================================

    #[test]
    fn test_translation_cache_invalidated_on_edit() {
        let (mem, _shared, mut space) = setup(16);
        map_fresh(&mut space, &mem, 0x1000, URW).unwrap();

        assert!(space.translate(0x1234).unwrap().writable());
        assert!(space.translate(0x1FFF).unwrap().writable());
        assert_eq!(space.tlb_stats().hits, 1);

        space.protect(0x1000, UR).unwrap();
        assert!(!space.translate(0x1000).unwrap().writable());

        space.unmap(&mem, 0x1000);
        assert!(space.translate(0x1000).is_none());
        assert_eq!(space.tlb_stats().invalidations, 2);
    }

    // ========================================================================
    // User access
    // ========================================================================

    #[test]
    fn test_copy_to_and_from_user_across_pages() {
        let (mem, _shared, mut space) = setup(16);
        map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        map_fresh(&mut space, &mem, 0x2000, URW).unwrap();

        let data: Vec<u8> = (0..100u8).collect();
        space.copy_to_user(&mem, 0x2000 - 50, &data).unwrap();

        let mut back = vec![0u8; 100];
        space.copy_from_user(&mem, 0x2000 - 50, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_copy_to_read_only_page_faults() {
        let (mem, _shared, mut space) = setup(16);
        map_fresh(&mut space, &mem, 0x1000, UR).unwrap();
        let err = space.copy_to_user(&mem, 0x1010, b"x").unwrap_err();
        assert_eq!(
            err,
            UserFault {
                va: 0x1010,
                write: true,
                protection: true
            }
        );
    }

    #[test]
    fn test_copy_unmapped_faults_without_partial_write() {
        let (mem, _shared, mut space) = setup(16);
        map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        let err = space.copy_to_user(&mem, 0x1FFE, b"abcd").unwrap_err();
        assert_eq!(err.va, 0x2000);
        assert!(!err.protection);

        let mut buf = [0u8; 2];
        space.copy_from_user(&mem, 0x1FFE, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn test_info_page_readable_not_writable() {
        let (mem, shared, mut space) = setup(16);
        mem.write(shared, 0, &[9]);
        let mut b = [0u8; 1];
        space.copy_from_user(&mem, UINFO, &mut b).unwrap();
        assert_eq!(b[0], 9);
        assert!(space.copy_to_user(&mem, UINFO, &[1]).is_err());
    }

    // ========================================================================
    // Checksum / duplicate
    // ========================================================================

    #[test]
    fn test_checksum_detects_content_change() {
        let (mem, _shared, mut space) = setup(16);
        map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        let before = space.checksum(&mem);
        space.copy_to_user(&mem, 0x1000, b"z").unwrap();
        assert_ne!(space.checksum(&mem), before);
    }

    #[test]
    fn test_duplicate_copies_contents_into_fresh_frames() {
        let (mem, shared, mut space) = setup(32);
        map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        map_fresh(&mut space, &mem, 0x5000, UR).unwrap();
        space.copy_to_user(&mem, 0x1000, b"parent").unwrap();

        let mut child = space.duplicate(&mem, shared).unwrap();
        assert_eq!(child.checksum(&mem), space.checksum(&mem));
        assert_ne!(
            child.lookup(0x1000).unwrap().frame,
            space.lookup(0x1000).unwrap().frame
        );
        assert!(!child.lookup(0x5000).unwrap().writable());

        child.copy_to_user(&mem, 0x1000, b"child!").unwrap();
        let mut buf = [0u8; 6];
        space.copy_from_user(&mem, 0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn test_duplicate_out_of_memory_leaves_no_leak() {
        let (mem, shared, mut space) = setup(8);
        map_fresh(&mut space, &mem, 0x1000, URW).unwrap();
        map_fresh(&mut space, &mem, 0x2000, URW).unwrap();
        map_fresh(&mut space, &mem, 0x3000, URW).unwrap();
        let free_before = mem.free_count();
        assert!(space.duplicate(&mem, shared).is_err());
        assert_eq!(mem.free_count(), free_before);
    }
}
