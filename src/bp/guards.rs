//! Pinned, latched page handles returned to callers.

use std::fmt::Debug;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::page::{zip_size_valid, Lsn, Page, PageId};

use super::descriptor::PageDescriptor;
use super::pool::PoolInstance;

/// Latch taken on the block for the lifetime of a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Pin only. The frame may be read, but a concurrent writer can be
    /// mutating it; callers use this for fields they re-validate.
    None,
    Shared,
    Exclusive,
}

/// A pinned page. Dropping the guard releases the latch and the pin, in
/// that order; the pin keeps the descriptor address stable throughout.
pub struct PageGuard<'a> {
    instance: &'a PoolInstance,
    idx: u32,
    mode: LatchMode,
    frame: NonNull<Page>,
    released: bool,
}

// SAFETY: the guard's frame pointer stays valid while the pin is held, and
// access follows the latch mode.
unsafe impl Send for PageGuard<'_> {}

impl<'a> PageGuard<'a> {
    /// The caller has already pinned the descriptor and taken `mode`.
    pub(super) fn new(instance: &'a PoolInstance, idx: u32, mode: LatchMode) -> Self {
        let desc = instance.desc(idx);
        debug_assert!(desc.pin_count() > 0);
        let frame = NonNull::new(desc.frame_ptr()).expect("guard over a frameless descriptor");
        PageGuard {
            instance,
            idx,
            mode,
            frame,
            released: false,
        }
    }

    fn desc(&self) -> &'a PageDescriptor {
        self.instance.desc(self.idx)
    }

    pub fn id(&self) -> PageId {
        self.desc().id().expect("guarded page without identity")
    }

    pub fn latch_mode(&self) -> LatchMode {
        self.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.desc().is_dirty()
    }

    pub fn oldest_modification(&self) -> Lsn {
        self.desc().oldest_lsn()
    }

    pub fn page(&self) -> &Page {
        // SAFETY: pin holds the frame; see `LatchMode::None` caveat.
        unsafe { self.frame.as_ref() }
    }

    /// Mutable frame access; the guard must hold the latch exclusively.
    pub fn page_mut(&mut self) -> &mut Page {
        assert_eq!(self.mode, LatchMode::Exclusive, "frame write without X latch");
        // SAFETY: exclusive latch plus pin.
        unsafe { self.frame.as_mut() }
    }

    /// Records a modification at `lsn`: bumps the newest LSN and links the
    /// page into the flush list on first dirtying.
    pub fn mark_dirty(&self, lsn: Lsn) {
        assert_eq!(self.mode, LatchMode::Exclusive, "dirtying without X latch");
        self.instance.mark_dirty(self.idx, lsn);
    }

    /// Attaches a compressed copy of the page, placing the block on the
    /// unzip-LRU.
    pub fn attach_compressed(&self, data: Vec<u8>) {
        assert_eq!(self.mode, LatchMode::Exclusive);
        assert!(zip_size_valid(data.len()), "invalid compressed size");
        self.instance
            .attach_compressed_to(self.idx, data.into_boxed_slice());
    }

    /// Exclusive → shared without releasing the pin.
    pub fn downgrade(mut self) -> PageGuard<'a> {
        assert_eq!(self.mode, LatchMode::Exclusive);
        self.desc().latch.downgrade(&self.instance.sync);
        self.mode = LatchMode::Shared;
        self
    }

    /// A stale-pointer token for later `optimistic_get`.
    pub fn page_ref(&self) -> PageRef {
        PageRef {
            instance: self.instance.no,
            idx: self.idx,
            id: self.id(),
            modify_clock: self.desc().modify_clock(),
        }
    }

    pub fn pin_count(&self) -> u32 {
        self.desc().pin_count()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let desc = self.desc();
        match self.mode {
            LatchMode::None => {}
            LatchMode::Shared => desc.latch.release_shared(&self.instance.sync),
            LatchMode::Exclusive => desc.latch.release_exclusive(&self.instance.sync),
        }
        desc.unpin();
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        self.page()
    }
}

impl Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("id", &self.desc().id())
            .field("mode", &self.mode)
            .field("pins", &self.desc().pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// What `optimistic_get` validates: the descriptor slot plus the modify
/// clock observed when the caller last held the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pub(super) instance: usize,
    pub(super) idx: u32,
    pub id: PageId,
    pub(super) modify_clock: u64,
}

/// A pool block taken out for private scratch use (`Memory` state). Not in
/// the page hash and not replaceable; the frame belongs to the allocating
/// thread until the guard drops.
pub struct MemoryBlock<'a> {
    instance: &'a PoolInstance,
    idx: u32,
    frame: NonNull<Page>,
}

// SAFETY: the frame is private to this guard until drop.
unsafe impl Send for MemoryBlock<'_> {}

impl<'a> MemoryBlock<'a> {
    pub(super) fn new(instance: &'a PoolInstance, idx: u32) -> Self {
        let frame = NonNull::new(instance.desc(idx).frame_ptr()).expect("frameless memory block");
        MemoryBlock {
            instance,
            idx,
            frame,
        }
    }
}

impl Drop for MemoryBlock<'_> {
    fn drop(&mut self) {
        self.instance.free_memory_block(self.idx);
    }
}

impl Deref for MemoryBlock<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        // SAFETY: exclusive by construction.
        unsafe { self.frame.as_ref() }
    }
}

impl std::ops::DerefMut for MemoryBlock<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: as above.
        unsafe { self.frame.as_mut() }
    }
}
