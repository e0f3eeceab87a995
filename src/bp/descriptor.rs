//! The page descriptor: metadata managing one cached page.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::page::{Lsn, Page, PageId};

use super::lists::{LinkKind, ListNode};

/// Lifecycle state of a descriptor. Legal transitions:
/// `Free → ReadyForUse → {Memory, FilePage}`, `Memory → Free`, and
/// `FilePage → RemoveHash → Free` when unpinned, clean and not in I/O.
/// `ZipClean`/`ZipDirty` describe descriptors whose uncompressed frame
/// contents are invalid and only the compressed frame holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Watch sentinel; lives in the pool's watch array and owns no frame.
    PoolWatch = 0,
    ZipClean = 1,
    ZipDirty = 2,
    Free = 3,
    ReadyForUse = 4,
    FilePage = 5,
    /// Private scratch block, never in the page hash.
    Memory = 6,
    /// Mid-eviction: unlinked from the hash, not yet on the free list.
    RemoveHash = 7,
}

impl PageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::PoolWatch,
            1 => PageState::ZipClean,
            2 => PageState::ZipDirty,
            3 => PageState::Free,
            4 => PageState::ReadyForUse,
            5 => PageState::FilePage,
            6 => PageState::Memory,
            7 => PageState::RemoveHash,
            _ => unreachable!("invalid page state {v}"),
        }
    }

    /// States in which the descriptor appears in the page hash.
    pub fn in_page_hash(&self) -> bool {
        matches!(
            self,
            PageState::FilePage | PageState::ZipClean | PageState::ZipDirty | PageState::PoolWatch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoState {
    None = 0,
    Reading = 1,
    Writing = 2,
    /// No I/O, but the descriptor must not be relocated.
    PinnedNoIo = 3,
}

impl IoState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => IoState::None,
            1 => IoState::Reading,
            2 => IoState::Writing,
            3 => IoState::PinnedNoIo,
            _ => unreachable!("invalid io state {v}"),
        }
    }
}

/// Packed `Option<PageId>` in one atomic word; `EMPTY` is the sentinel.
const EMPTY_ID: u64 = u64::MAX;

#[inline]
fn pack(id: PageId) -> u64 {
    let raw = ((id.space_id as u64) << 32) | id.page_no as u64;
    debug_assert_ne!(raw, EMPTY_ID, "reserved for the empty sentinel");
    raw
}

#[inline]
fn unpack(raw: u64) -> Option<PageId> {
    if raw == EMPTY_ID {
        None
    } else {
        Some(PageId::new((raw >> 32) as u32, raw as u32))
    }
}

/// Metadata for one cached page. Descriptors are created once per chunk at
/// pool initialization, never move, and cycle through `PageState` forever.
///
/// Field protection: `state`, `io_state` and the LSN pair change only under
/// the descriptor mutex or while the owner holds the documented latches;
/// the intrusive link cells change only under the mutex owning their list;
/// `pin_count` and the clocks are plain atomics.
#[repr(C, align(64))]
pub struct PageDescriptor {
    index: u32,
    id: AtomicU64,
    state: AtomicU8,
    io_state: AtomicU8,
    /// Resident in the old segment of the LRU.
    old: AtomicBool,
    pin_count: AtomicU32,
    newest_lsn: AtomicU64,
    oldest_lsn: AtomicU64,
    /// Milliseconds at first access while resident; 0 = never accessed.
    access_time: AtomicU64,
    /// Pool eviction-counter snapshot at the last promotion. Read without
    /// synchronization by the "too old" heuristic, which tolerates ±1
    /// staleness.
    freed_page_clock: AtomicU64,
    /// Bumped whenever the frame stops describing the same page (eviction,
    /// relocation, reuse); validates optimistic gets.
    modify_clock: AtomicU64,
    hash_next: AtomicU32,
    free_link: ListNode,
    lru_link: ListNode,
    flush_link: ListNode,
    unzip_link: ListNode,
    frame: AtomicPtr<Page>,
    /// Compressed frame, present for `Zip*` descriptors and unzip-LRU
    /// members. Guarded by the descriptor mutex.
    zip_frame: UnsafeCell<Option<Box<[u8]>>>,
    pub(crate) latch: crate::sync::RwLatch,
    pub(crate) mutex: crate::sync::Mutex,
    #[cfg(debug_assertions)]
    pub(crate) in_free_list: AtomicBool,
    #[cfg(debug_assertions)]
    pub(crate) in_lru_list: AtomicBool,
    #[cfg(debug_assertions)]
    pub(crate) in_flush_list: AtomicBool,
}

// SAFETY: `zip_frame` is only touched under the descriptor mutex; all other
// fields are atomics or internally synchronized.
unsafe impl Send for PageDescriptor {}
unsafe impl Sync for PageDescriptor {}

impl PageDescriptor {
    pub(crate) fn new(index: u32) -> Self {
        PageDescriptor {
            index,
            id: AtomicU64::new(EMPTY_ID),
            state: AtomicU8::new(PageState::Free as u8),
            io_state: AtomicU8::new(IoState::None as u8),
            old: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            newest_lsn: AtomicU64::new(0),
            oldest_lsn: AtomicU64::new(0),
            access_time: AtomicU64::new(0),
            freed_page_clock: AtomicU64::new(0),
            modify_clock: AtomicU64::new(0),
            hash_next: AtomicU32::new(super::lists::NIL),
            free_link: ListNode::new(),
            lru_link: ListNode::new(),
            flush_link: ListNode::new(),
            unzip_link: ListNode::new(),
            frame: AtomicPtr::new(std::ptr::null_mut()),
            zip_frame: UnsafeCell::new(None),
            latch: crate::sync::RwLatch::new(),
            mutex: crate::sync::Mutex::new(),
            #[cfg(debug_assertions)]
            in_free_list: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            in_lru_list: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            in_flush_list: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn set_frame(&self, frame: *mut Page) {
        self.frame.store(frame, Ordering::Release);
    }

    /// Null for watch sentinels.
    #[inline]
    pub(crate) fn frame_ptr(&self) -> *mut Page {
        self.frame.load(Ordering::Acquire)
    }

    pub fn id(&self) -> Option<PageId> {
        unpack(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn set_id(&self, id: Option<PageId>) {
        self.id
            .store(id.map_or(EMPTY_ID, pack), Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn io_state(&self) -> IoState {
        IoState::from_u8(self.io_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_io_state(&self, io: IoState) {
        self.io_state.store(io as u8, Ordering::Release);
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    pub fn newest_lsn(&self) -> Lsn {
        self.newest_lsn.load(Ordering::Acquire)
    }

    pub(crate) fn set_newest_lsn(&self, lsn: Lsn) {
        self.newest_lsn.store(lsn, Ordering::Release);
    }

    /// Zero iff the page is clean.
    pub fn oldest_lsn(&self) -> Lsn {
        self.oldest_lsn.load(Ordering::Acquire)
    }

    pub(crate) fn set_oldest_lsn(&self, lsn: Lsn) {
        self.oldest_lsn.store(lsn, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.oldest_lsn() != 0
    }

    pub(crate) fn is_old(&self) -> bool {
        self.old.load(Ordering::Relaxed)
    }

    pub(crate) fn set_old(&self, old: bool) {
        self.old.store(old, Ordering::Relaxed);
    }

    pub(crate) fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    pub(crate) fn set_access_time(&self, ms: u64) {
        self.access_time.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn freed_page_clock(&self) -> u64 {
        self.freed_page_clock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_freed_page_clock(&self, clock: u64) {
        self.freed_page_clock.store(clock, Ordering::Relaxed);
    }

    pub fn modify_clock(&self) -> u64 {
        self.modify_clock.load(Ordering::Acquire)
    }

    pub(crate) fn bump_modify_clock(&self) {
        self.modify_clock.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn hash_next(&self) -> u32 {
        self.hash_next.load(Ordering::Acquire)
    }

    pub(crate) fn set_hash_next(&self, idx: u32) {
        self.hash_next.store(idx, Ordering::Release);
    }

    pub(crate) fn node(&self, kind: LinkKind) -> &ListNode {
        match kind {
            LinkKind::Free => &self.free_link,
            LinkKind::Lru => &self.lru_link,
            LinkKind::Flush => &self.flush_link,
            LinkKind::Unzip => &self.unzip_link,
        }
    }

    /// Caller holds the descriptor mutex.
    pub(crate) fn set_zip_frame(&self, data: Option<Box<[u8]>>) -> Option<Box<[u8]>> {
        // SAFETY: as above.
        unsafe { std::mem::replace(&mut *self.zip_frame.get(), data) }
    }

    pub(crate) fn has_zip_frame(&self) -> bool {
        // SAFETY: as above.
        unsafe { (*self.zip_frame.get()).is_some() }
    }

    /// Eviction is permitted only for an unpinned, clean, I/O-idle file
    /// page. Caller holds the pool mutex.
    pub(crate) fn ready_for_eviction(&self) -> bool {
        matches!(self.state(), PageState::FilePage | PageState::ZipClean)
            && self.pin_count() == 0
            && self.io_state() == IoState::None
            && !self.is_dirty()
    }

    /// Resets page identity fields on return to the free list. List links
    /// are handled by the caller.
    pub(crate) fn reset_for_free(&self) {
        self.set_id(None);
        self.set_state(PageState::Free);
        self.set_io_state(IoState::None);
        self.set_old(false);
        self.set_newest_lsn(0);
        self.set_oldest_lsn(0);
        self.set_access_time(0);
        self.set_hash_next(super::lists::NIL);
        self.set_zip_frame(None);
    }
}

impl std::fmt::Debug for PageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageDescriptor")
            .field("index", &self.index)
            .field("id", &self.id())
            .field("state", &self.state())
            .field("io_state", &self.io_state())
            .field("pins", &self.pin_count())
            .field("oldest_lsn", &self.oldest_lsn())
            .field("old", &self.is_old())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_packing() {
        let desc = PageDescriptor::new(0);
        assert_eq!(desc.id(), None);
        let id = PageId::new(7, 3);
        desc.set_id(Some(id));
        assert_eq!(desc.id(), Some(id));
        desc.set_id(None);
        assert_eq!(desc.id(), None);
    }

    #[test]
    fn test_pin_discipline() {
        let desc = PageDescriptor::new(0);
        desc.pin();
        desc.pin();
        assert_eq!(desc.pin_count(), 2);
        desc.unpin();
        desc.unpin();
        assert_eq!(desc.pin_count(), 0);
    }

    #[test]
    fn test_eviction_gate() {
        let desc = PageDescriptor::new(0);
        desc.set_state(PageState::FilePage);
        assert!(desc.ready_for_eviction());
        desc.pin();
        assert!(!desc.ready_for_eviction());
        desc.unpin();
        desc.set_oldest_lsn(5);
        assert!(!desc.ready_for_eviction());
        desc.set_oldest_lsn(0);
        desc.set_io_state(IoState::Reading);
        assert!(!desc.ready_for_eviction());
        desc.set_io_state(IoState::None);
        assert!(desc.ready_for_eviction());
    }

    #[test]
    fn test_reset_for_free() {
        let desc = PageDescriptor::new(9);
        desc.set_id(Some(PageId::new(1, 2)));
        desc.set_state(PageState::FilePage);
        desc.set_oldest_lsn(10);
        desc.set_newest_lsn(20);
        desc.set_zip_frame(Some(vec![0u8; 1024].into_boxed_slice()));
        desc.reset_for_free();
        assert_eq!(desc.id(), None);
        assert_eq!(desc.state(), PageState::Free);
        assert!(!desc.is_dirty());
        assert!(!desc.has_zip_frame());
        assert_eq!(desc.index(), 9);
    }
}
