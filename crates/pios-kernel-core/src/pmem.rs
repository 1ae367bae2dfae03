//! Physical page allocator
//!
//! Physical memory is an arena of fixed-size frames addressed by a checked
//! [`FrameNumber`]. Each frame carries a reference count (number of leaf
//! mappings pointing at it), a `pinned` flag for frames used as page-table
//! structure, and a free-list link.
//!
//! # Design
//!
//! - `allocate` hands out a frame with reference count 0; the first `map`
//!   brings it to 1.
//! - Only the address-space manager calls [`PhysicalMemory::retain`] and
//!   [`PhysicalMemory::release`]; release returns an unpinned frame to the
//!   free list exactly when its count reaches 0.
//! - `free` is for frames that were never mapped (or page-table frames);
//!   freeing a referenced or already-free frame is fatal.
//!
//! The arena lives behind its own `spin::Mutex` so CPUs can allocate while
//! another CPU holds the environment table lock (lock order: table, then
//! allocator).

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::invariants::fatal;
use crate::types::PGSIZE;

const FRAME_BYTES: usize = PGSIZE as usize;

/// Index of a physical frame.
///
/// Only the allocator creates frame numbers, so every value is in range for
/// the arena that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Simulated physical address of the frame
    pub fn paddr(self) -> u64 {
        self.0 as u64 * PGSIZE
    }
}

#[derive(Clone, Copy, Debug)]
struct FrameInfo {
    refcount: u32,
    pinned: bool,
    free: bool,
    next_free: Option<FrameNumber>,
}

/// Snapshot of one frame's bookkeeping, for invariant checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameState {
    pub frame: FrameNumber,
    pub refcount: u32,
    pub pinned: bool,
    pub free: bool,
}

struct FrameArena {
    info: Vec<FrameInfo>,
    data: Vec<u8>,
    free_head: Option<FrameNumber>,
    free_count: usize,
}

impl FrameArena {
    fn info(&self, frame: FrameNumber) -> &FrameInfo {
        &self.info[frame.index()]
    }

    fn info_mut(&mut self, frame: FrameNumber) -> &mut FrameInfo {
        &mut self.info[frame.index()]
    }

    fn bytes(&self, frame: FrameNumber) -> &[u8] {
        let start = frame.index() * FRAME_BYTES;
        &self.data[start..start + FRAME_BYTES]
    }

    fn bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        let start = frame.index() * FRAME_BYTES;
        &mut self.data[start..start + FRAME_BYTES]
    }

    fn push_free(&mut self, frame: FrameNumber) {
        let head = self.free_head;
        let info = self.info_mut(frame);
        info.free = true;
        info.pinned = false;
        info.next_free = head;
        self.free_head = Some(frame);
        self.free_count += 1;
    }
}

/// Reference-counted physical frame allocator.
pub struct PhysicalMemory {
    inner: Mutex<FrameArena>,
    total: usize,
}

impl PhysicalMemory {
    /// Create an allocator managing `pages` zeroed frames.
    ///
    /// Frames are handed out lowest-numbered first.
    pub fn new(pages: usize) -> Self {
        let mut arena = FrameArena {
            info: vec![
                FrameInfo {
                    refcount: 0,
                    pinned: false,
                    free: false,
                    next_free: None,
                };
                pages
            ],
            data: vec![0u8; pages * FRAME_BYTES],
            free_head: None,
            free_count: 0,
        };
        for index in (0..pages).rev() {
            arena.push_free(FrameNumber(index as u32));
        }
        Self {
            inner: Mutex::new(arena),
            total: pages,
        }
    }

    fn take(&self, pinned: bool) -> KernelResult<FrameNumber> {
        let mut arena = self.inner.lock();
        let frame = arena.free_head.ok_or(KernelError::OutOfMemory)?;
        let info = *arena.info(frame);
        if !info.free || info.refcount != 0 {
            fatal(
                "allocator_free_list",
                alloc::format!(
                    "frame {} on free list with refcount {} (free={})",
                    frame.0,
                    info.refcount,
                    info.free
                ),
            );
        }
        arena.free_head = info.next_free;
        arena.free_count -= 1;
        *arena.info_mut(frame) = FrameInfo {
            refcount: 0,
            pinned,
            free: false,
            next_free: None,
        };
        arena.bytes_mut(frame).fill(0);
        Ok(frame)
    }

    /// Allocate a zeroed frame with reference count 0.
    pub fn allocate(&self) -> KernelResult<FrameNumber> {
        self.take(false)
    }

    /// Allocate a zeroed frame for page-table structure.
    ///
    /// Pinned frames are never returned to the free list by `release`.
    pub fn allocate_pinned(&self) -> KernelResult<FrameNumber> {
        self.take(true)
    }

    /// Return a frame that holds no references to the free list.
    ///
    /// Freeing a frame that is still referenced, or already free, is fatal.
    pub fn free(&self, frame: FrameNumber) {
        let mut arena = self.inner.lock();
        let info = *arena.info(frame);
        if info.free {
            fatal(
                "allocator_double_free",
                alloc::format!("frame {} freed twice", frame.0),
            );
        }
        if info.refcount != 0 {
            fatal(
                "allocator_free_referenced",
                alloc::format!("frame {} freed with refcount {}", frame.0, info.refcount),
            );
        }
        arena.push_free(frame);
    }

    /// Add one mapping reference.
    pub(crate) fn retain(&self, frame: FrameNumber) {
        let mut arena = self.inner.lock();
        let info = arena.info_mut(frame);
        if info.free {
            fatal(
                "allocator_retain_free",
                alloc::format!("retain of free frame {}", frame.0),
            );
        }
        info.refcount += 1;
    }

    /// Drop one mapping reference; returns true if the frame was freed.
    pub(crate) fn release(&self, frame: FrameNumber) -> bool {
        let mut arena = self.inner.lock();
        let info = arena.info_mut(frame);
        if info.free || info.refcount == 0 {
            fatal(
                "allocator_release_unreferenced",
                alloc::format!("release of unreferenced frame {}", frame.0),
            );
        }
        info.refcount -= 1;
        if info.refcount == 0 && !info.pinned {
            arena.push_free(frame);
            true
        } else {
            false
        }
    }

    /// Pin an allocated frame (kernel-owned pages shared by every space).
    pub fn pin(&self, frame: FrameNumber) {
        self.inner.lock().info_mut(frame).pinned = true;
    }

    // ========================================================================
    // Frame contents
    // ========================================================================

    /// Copy `buf.len()` bytes out of `frame` starting at `offset`.
    pub fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        let arena = self.inner.lock();
        buf.copy_from_slice(&arena.bytes(frame)[offset..offset + buf.len()]);
    }

    /// Copy `data` into `frame` starting at `offset`.
    pub fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        let mut arena = self.inner.lock();
        arena.bytes_mut(frame)[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy the whole contents of one frame into another.
    pub fn copy(&self, src: FrameNumber, dst: FrameNumber) {
        let mut arena = self.inner.lock();
        let start = src.index() * FRAME_BYTES;
        let dst_start = dst.index() * FRAME_BYTES;
        arena
            .data
            .copy_within(start..start + FRAME_BYTES, dst_start);
    }

    /// Run `f` over the frame's bytes.
    pub fn with_frame<R>(&self, frame: FrameNumber, f: impl FnOnce(&[u8]) -> R) -> R {
        let arena = self.inner.lock();
        f(arena.bytes(frame))
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.inner.lock().info(frame).refcount
    }

    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.inner.lock().info(frame).free
    }

    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        self.inner.lock().info(frame).pinned
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Bookkeeping for every frame, in frame order
    pub fn frame_states(&self) -> Vec<FrameState> {
        let arena = self.inner.lock();
        arena
            .info
            .iter()
            .enumerate()
            .map(|(i, info)| FrameState {
                frame: FrameNumber(i as u32),
                refcount: info.refcount,
                pinned: info.pinned,
                free: info.free,
            })
            .collect()
    }

    /// Length of the free list, walked link by link
    pub fn free_list_len(&self) -> usize {
        let arena = self.inner.lock();
        let mut len = 0;
        let mut cursor = arena.free_head;
        while let Some(frame) = cursor {
            len += 1;
            cursor = arena.info(frame).next_free;
        }
        len
    }
}
