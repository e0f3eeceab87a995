//! Pool instances and the sharded buffer pool facade.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use concurrent_queue::ConcurrentQueue;

use crate::checksum;
use crate::error::{PoolError, Result};
use crate::io::{PageCipher, PageIo, ScratchPool};
use crate::log_debug;
use crate::page::{Lsn, Page, PageId, SpaceId};
use crate::sync::{Event, Mutex, SyncContext};

use super::config::PoolConfig;
use super::descriptor::{IoState, PageDescriptor, PageState};
use super::guards::{LatchMode, PageGuard, PageRef};
use super::hazard::HazardPointer;
use super::lists::{IndexList, LinkKind, NIL};
use super::page_hash::PageHash;
use super::stats::{PoolStats, StatsSnapshot};

/// How a caller wants a missing or present page treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Read the page in on a miss.
    GetAlways,
    /// Miss returns `NotInPool`.
    GetIfInPool,
    /// Like `GetIfInPool`, but without any LRU side effect.
    PeekIfInPool,
    /// `GetAlways` that only pins; no latch is taken.
    GetNoLatch,
    /// Like `GetIfInPool`, but a miss installs a watch sentinel.
    GetIfInPoolOrWatch,
    /// Like `GetAlways`, but a dropped tablespace is reported as
    /// `NotInPool` instead of an error.
    GetPossiblyFreed,
    /// Evict the page if present; always reports `NotInPool`.
    EvictIfInPool,
}

pub(super) const FLUSH_KINDS: usize = 3;

/// Flush batch types, each with its own "no batch in progress" event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    /// Frees clean pages near the LRU tail for the replacement path.
    LruTail = 0,
    /// Checkpoint-driven flushing in oldest-LSN order.
    FlushList = 1,
    /// A user thread flushing one page to get a free block now.
    SinglePage = 2,
}

/// One contiguous allocation of descriptors and their frames.
pub(super) struct Chunk {
    pub(super) descriptors: Box<[PageDescriptor]>,
    /// Owns the frame memory; descriptors hold raw pointers into it.
    _frames: Box<[Page]>,
}

impl Chunk {
    fn new(base_index: u32, n_pages: usize) -> Self {
        let mut frames: Box<[Page]> = (0..n_pages).map(|_| Page::new_empty()).collect();
        let descriptors: Box<[PageDescriptor]> = (0..n_pages)
            .map(|i| PageDescriptor::new(base_index + i as u32))
            .collect();
        for (desc, frame) in descriptors.iter().zip(frames.iter_mut()) {
            desc.set_frame(frame as *mut Page);
        }
        Chunk {
            descriptors,
            _frames: frames,
        }
    }
}

/// One shard of the buffer pool. A page hashes to an instance once and
/// never migrates.
pub struct PoolInstance {
    pub(super) no: usize,
    pub(super) config: Arc<PoolConfig>,
    pub(super) sync: Arc<SyncContext>,
    pub(super) io: Arc<dyn PageIo>,
    pub(super) cipher: Arc<dyn PageCipher>,
    pub(super) scratch: Arc<ScratchPool>,
    chunks: Vec<Chunk>,
    /// Watch sentinels; addressed as `capacity + slot`.
    watch: Box<[PageDescriptor]>,
    pub(super) capacity: u32,
    chunk_pages: u32,
    pub(super) hash: PageHash,
    pub(super) pool_mutex: Mutex,
    pub(super) flush_list_mutex: Mutex,
    pub(super) free_list: IndexList,
    pub(super) lru_list: IndexList,
    pub(super) unzip_list: IndexList,
    pub(super) flush_list: IndexList,
    /// Boundary of the LRU old segment: the old block closest to the head.
    pub(super) lru_old: AtomicU32,
    pub(super) lru_old_len: AtomicU32,
    pub(super) lru_hp: HazardPointer,
    pub(super) flush_hp: HazardPointer,
    pub(super) free_hints: ConcurrentQueue<u32>,
    pub(super) try_lru_scan: AtomicBool,
    /// Total pages evicted from this instance; descriptor snapshots of it
    /// drive the "too old to re-promote" heuristic.
    pub(super) freed_page_clock: AtomicU64,
    pub(super) stats: PoolStats,
    pub(super) init_flush: [AtomicBool; FLUSH_KINDS],
    pub(super) no_flush: [Event; FLUSH_KINDS],
    /// Mirror of the flush list during recovery, for ordered insertion.
    /// Guarded by the flush-list mutex.
    pub(super) recovery_tree: UnsafeCell<Option<BTreeMap<(Lsn, u32), ()>>>,
}

// SAFETY: `recovery_tree` is only accessed under the flush-list mutex; all
// other interior mutability is atomic or internally synchronized.
unsafe impl Sync for PoolInstance {}

impl PoolInstance {
    fn new(
        no: usize,
        config: Arc<PoolConfig>,
        sync: Arc<SyncContext>,
        io: Arc<dyn PageIo>,
        cipher: Arc<dyn PageCipher>,
        scratch: Arc<ScratchPool>,
    ) -> Self {
        let capacity = config.pages_per_instance() as u32;
        let chunk_pages = (config.chunk_pages as u32).min(capacity);
        let mut chunks = Vec::new();
        let mut base = 0;
        while base < capacity {
            let n = chunk_pages.min(capacity - base);
            chunks.push(Chunk::new(base, n as usize));
            base += n;
        }
        let watch: Box<[PageDescriptor]> = (0..config.watch_slots())
            .map(|i| {
                let desc = PageDescriptor::new(capacity + i as u32);
                desc.set_id(None);
                desc
            })
            .collect();

        let free_list = IndexList::new(LinkKind::Free);
        let free_hints = ConcurrentQueue::unbounded();
        let instance = PoolInstance {
            no,
            hash: PageHash::new(capacity as usize, config.page_hash_stripes),
            config,
            sync,
            io,
            cipher,
            scratch,
            chunks,
            watch,
            capacity,
            chunk_pages,
            pool_mutex: Mutex::new(),
            flush_list_mutex: Mutex::new(),
            free_list,
            lru_list: IndexList::new(LinkKind::Lru),
            unzip_list: IndexList::new(LinkKind::Unzip),
            flush_list: IndexList::new(LinkKind::Flush),
            lru_old: AtomicU32::new(NIL),
            lru_old_len: AtomicU32::new(0),
            lru_hp: HazardPointer::new(),
            flush_hp: HazardPointer::new(),
            free_hints,
            try_lru_scan: AtomicBool::new(true),
            freed_page_clock: AtomicU64::new(0),
            stats: PoolStats::new(),
            init_flush: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
            no_flush: [Event::new(), Event::new(), Event::new()],
            recovery_tree: UnsafeCell::new(None),
        };
        // Set means "no batch of this type in progress".
        for event in &instance.no_flush {
            event.set();
        }
        // All descriptors start free.
        let resolve = |i: u32| instance.desc(i);
        for idx in 0..capacity {
            instance.free_list.push_back(&resolve, idx);
            #[cfg(debug_assertions)]
            instance
                .desc(idx)
                .in_free_list
                .store(true, Ordering::Relaxed);
            instance.free_hints.push(idx).unwrap();
        }
        instance
    }

    /// Resolves a descriptor index; indices past `capacity` address the
    /// watch sentinel array.
    #[inline]
    pub(super) fn desc(&self, idx: u32) -> &PageDescriptor {
        if idx >= self.capacity {
            &self.watch[(idx - self.capacity) as usize]
        } else {
            let chunk = (idx / self.chunk_pages) as usize;
            &self.chunks[chunk].descriptors[(idx % self.chunk_pages) as usize]
        }
    }

    #[inline]
    pub(super) fn is_sentinel(&self, idx: u32) -> bool {
        idx >= self.capacity
    }

    #[inline]
    pub(super) fn resolver<'a>(&'a self) -> impl Fn(u32) -> &'a PageDescriptor + 'a {
        move |i| self.desc(i)
    }

    // ───── the get/create/release protocol ─────────────────────────────

    pub(super) fn get(&self, id: PageId, mode: GetMode, latch: LatchMode) -> Result<PageGuard<'_>> {
        self.stats.inc_page_gets();
        let latch = if mode == GetMode::GetNoLatch {
            LatchMode::None
        } else {
            latch
        };
        loop {
            let stripe = self.hash.stripe(id);
            stripe.shared(&self.sync);
            let found = self.hash.lookup(&self.resolver(), id);
            let Some(idx) = found else {
                stripe.release_shared(&self.sync);
                return match mode {
                    GetMode::GetIfInPool | GetMode::PeekIfInPool | GetMode::EvictIfInPool => {
                        Err(PoolError::NotInPool)
                    }
                    GetMode::GetIfInPoolOrWatch => {
                        self.watch_set(id);
                        Err(PoolError::NotInPool)
                    }
                    GetMode::GetAlways | GetMode::GetNoLatch | GetMode::GetPossiblyFreed => {
                        match self.read_page_in(id, latch) {
                            Ok(Some(guard)) => Ok(guard),
                            Ok(None) => continue, // raced with another reader
                            Err(PoolError::TablespaceDeleted(_))
                                if mode == GetMode::GetPossiblyFreed =>
                            {
                                Err(PoolError::NotInPool)
                            }
                            Err(e) => Err(e),
                        }
                    }
                };
            };

            if self.is_sentinel(idx) {
                stripe.release_shared(&self.sync);
                return match mode {
                    GetMode::GetAlways | GetMode::GetNoLatch | GetMode::GetPossiblyFreed => {
                        match self.read_page_in(id, latch) {
                            Ok(Some(guard)) => Ok(guard),
                            Ok(None) => continue,
                            Err(e) => Err(e),
                        }
                    }
                    // The watch stays installed; the page is still absent.
                    _ => Err(PoolError::NotInPool),
                };
            }

            let desc = self.desc(idx);
            match desc.state() {
                PageState::FilePage => {
                    // Pinning under the stripe lock excludes eviction.
                    desc.pin();
                    stripe.release_shared(&self.sync);

                    if mode == GetMode::EvictIfInPool {
                        desc.unpin();
                        self.try_evict(id);
                        return Err(PoolError::NotInPool);
                    }

                    if desc.io_state() == IoState::Reading {
                        // The read slot holds the latch exclusively; queue
                        // behind it, then re-validate.
                        desc.latch.shared(&self.sync);
                        let still_ok =
                            desc.state() == PageState::FilePage && desc.id() == Some(id);
                        desc.latch.release_shared(&self.sync);
                        if !still_ok {
                            desc.unpin();
                            continue;
                        }
                    }

                    if mode != GetMode::PeekIfInPool {
                        self.make_young_if_needed(idx);
                    }
                    match latch {
                        LatchMode::None => {}
                        LatchMode::Shared => desc.latch.shared(&self.sync),
                        LatchMode::Exclusive => desc.latch.exclusive(&self.sync),
                    }
                    if desc.state() != PageState::FilePage || desc.id() != Some(id) {
                        // The read we queued behind failed and the block
                        // was recycled.
                        match latch {
                            LatchMode::None => {}
                            LatchMode::Shared => desc.latch.release_shared(&self.sync),
                            LatchMode::Exclusive => desc.latch.release_exclusive(&self.sync),
                        }
                        desc.unpin();
                        continue;
                    }
                    return Ok(PageGuard::new(self, idx, latch));
                }
                PageState::ZipClean => {
                    stripe.release_shared(&self.sync);
                    // Only the compressed frame is valid; rebuild the
                    // uncompressed frame, then retry as a plain hit.
                    self.materialize_zip(id, idx)?;
                    continue;
                }
                PageState::RemoveHash => {
                    // Mid-eviction; the entry will be gone shortly.
                    stripe.release_shared(&self.sync);
                    std::hint::spin_loop();
                    continue;
                }
                state => {
                    stripe.release_shared(&self.sync);
                    log_debug!("page {} found in transient state {:?}", id, state);
                    std::thread::yield_now();
                    continue;
                }
            }
        }
    }

    /// Miss path: allocate a descriptor, register it as reading, fill it
    /// from the I/O collaborator. `Ok(None)` means another thread won the
    /// race and the caller should retry the lookup.
    fn read_page_in(&self, id: PageId, latch: LatchMode) -> Result<Option<PageGuard<'_>>> {
        if !self.io.space_exists(id.space_id) {
            return Err(PoolError::TablespaceDeleted(id.space_id));
        }
        let free_idx = self.alloc_free_descriptor()?;
        let desc = self.desc(free_idx);

        let stripe = self.hash.stripe(id);
        stripe.exclusive(&self.sync);
        let pool_guard = self.pool_mutex.lock(&self.sync);
        if let Some(existing) = self.hash.lookup(&self.resolver(), id) {
            if self.is_sentinel(existing) {
                // A watch was posted for this page: replace the sentinel.
                self.watch_remove_locked(id, existing);
            } else {
                drop(pool_guard);
                stripe.release_exclusive(&self.sync);
                self.return_free_descriptor(free_idx);
                return Ok(None);
            }
        }
        desc.set_id(Some(id));
        desc.set_state(PageState::FilePage);
        desc.set_io_state(IoState::Reading);
        desc.pin();
        // Uncontended: the descriptor is not yet visible.
        assert!(desc.latch.try_exclusive());
        self.hash.insert(&self.resolver(), id, free_idx);
        self.lru_insert(free_idx);
        drop(pool_guard);
        stripe.release_exclusive(&self.sync);

        self.stats.inc_pages_read();
        match self.fill_frame_from_disk(free_idx, id) {
            Ok(()) => {
                desc.set_io_state(IoState::None);
                match latch {
                    LatchMode::Exclusive => {}
                    LatchMode::Shared => desc.latch.downgrade(&self.sync),
                    LatchMode::None => desc.latch.release_exclusive(&self.sync),
                }
                Ok(Some(PageGuard::new(self, free_idx, latch)))
            }
            Err(e) => {
                self.abandon_failed_read(free_idx, id);
                Err(e)
            }
        }
    }

    /// Runs the external read plus decryption and checksum validation.
    pub(super) fn fill_frame_from_disk(&self, idx: u32, id: PageId) -> Result<()> {
        let desc = self.desc(idx);
        // SAFETY: the frame is private to the read slot: the descriptor is
        // pinned, exclusively latched and in `Reading` state.
        let frame = unsafe { &mut *desc.frame_ptr() };
        self.io.read_page(id, frame)?;
        self.cipher
            .decrypt_after_read(id, frame)
            .map_err(|_| PoolError::DecryptionFailed(id))?;
        if !checksum::validate(frame, self.config.checksum_algorithm) {
            return Err(PoolError::PageCorrupted(id));
        }
        desc.set_newest_lsn(frame.lsn());
        debug_assert_eq!(desc.oldest_lsn(), 0);
        Ok(())
    }

    /// Error cleanup for the miss path: unlink, wake queued waiters, and
    /// return the descriptor to the free list. No error leaves the
    /// descriptor in an intermediate state.
    fn abandon_failed_read(&self, idx: u32, id: PageId) {
        let desc = self.desc(idx);
        desc.set_io_state(IoState::None);
        {
            let stripe = self.hash.stripe(id);
            stripe.exclusive(&self.sync);
            let pool_guard = self.pool_mutex.lock(&self.sync);
            self.hash.remove(&self.resolver(), id, idx);
            self.lru_remove_locked(idx);
            self.lru_balance();
            desc.set_state(PageState::RemoveHash);
            drop(pool_guard);
            stripe.release_exclusive(&self.sync);
        }
        desc.bump_modify_clock();
        // Wake threads queued on the latch; they re-validate and retry.
        desc.latch.release_exclusive(&self.sync);
        while desc.pin_count() > 1 {
            std::thread::yield_now();
        }
        desc.unpin();
        self.return_free_descriptor_reset(idx);
    }

    /// Allocates a file page without reading it; the caller will overwrite
    /// the whole frame. Returns the page pinned and exclusively latched,
    /// clean, with `newest_modification_lsn == 0`.
    pub(super) fn create(&self, id: PageId) -> Result<PageGuard<'_>> {
        if !self.io.space_exists(id.space_id) {
            return Err(PoolError::TablespaceDeleted(id.space_id));
        }
        loop {
            let free_idx = self.alloc_free_descriptor()?;
            let desc = self.desc(free_idx);

            let stripe = self.hash.stripe(id);
            stripe.exclusive(&self.sync);
            let pool_guard = self.pool_mutex.lock(&self.sync);
            match self.hash.lookup(&self.resolver(), id) {
                Some(existing) if self.is_sentinel(existing) => {
                    self.watch_remove_locked(id, existing);
                }
                Some(_) => {
                    // The page is already resident: reuse it, zeroed.
                    drop(pool_guard);
                    stripe.release_exclusive(&self.sync);
                    self.return_free_descriptor(free_idx);
                    let mut guard = self.get(id, GetMode::GetAlways, LatchMode::Exclusive)?;
                    guard.page_mut().zero();
                    guard.page_mut().set_id(id);
                    return Ok(guard);
                }
                None => {}
            }
            desc.set_id(Some(id));
            desc.set_state(PageState::FilePage);
            desc.pin();
            assert!(desc.latch.try_exclusive());
            self.hash.insert(&self.resolver(), id, free_idx);
            self.lru_insert(free_idx);
            drop(pool_guard);
            stripe.release_exclusive(&self.sync);

            // SAFETY: pinned + exclusively latched; the frame is ours.
            let frame = unsafe { &mut *desc.frame_ptr() };
            frame.zero();
            frame.set_id(id);
            desc.set_newest_lsn(0);
            self.stats.inc_pages_created();
            return Ok(PageGuard::new(self, free_idx, LatchMode::Exclusive));
        }
    }

    /// Validated pointer re-use: take the latch and pin if the descriptor
    /// still caches the same page version the caller saw.
    pub(super) fn optimistic_get(
        &self,
        page_ref: &PageRef,
        latch: LatchMode,
    ) -> Result<PageGuard<'_>> {
        // The modify-clock check is only meaningful under a latch; an
        // unlatched request has nothing to hold the validation, so send
        // the caller down the ordinary get path.
        if latch == LatchMode::None {
            return Err(PoolError::NotInPool);
        }
        let idx = page_ref.idx;
        let desc = self.desc(idx);
        {
            // The descriptor mutex excludes eviction's final check, making
            // pin-if-still-resident atomic.
            let _block = desc.mutex.lock(&self.sync);
            if desc.state() != PageState::FilePage
                || desc.modify_clock() != page_ref.modify_clock
            {
                return Err(PoolError::NotInPool);
            }
            desc.pin();
        }
        let latched = match latch {
            LatchMode::Shared => desc.latch.try_shared(),
            LatchMode::Exclusive => desc.latch.try_exclusive(),
            LatchMode::None => false,
        };
        if !latched {
            desc.unpin();
            return Err(PoolError::NotInPool);
        }
        if desc.modify_clock() != page_ref.modify_clock || desc.state() != PageState::FilePage {
            match latch {
                LatchMode::Shared => desc.latch.release_shared(&self.sync),
                LatchMode::Exclusive => desc.latch.release_exclusive(&self.sync),
                LatchMode::None => {}
            }
            desc.unpin();
            return Err(PoolError::NotInPool);
        }
        self.stats.inc_page_gets();
        self.make_young_if_needed(idx);
        Ok(PageGuard::new(self, idx, latch))
    }

    // ───── free descriptors ─────────────────────────────────────────────

    /// Returns a descriptor in `ReadyForUse`, detached from every list.
    pub(super) fn alloc_free_descriptor(&self) -> Result<u32> {
        const MAX_ITERATIONS: u32 = 5;
        let mut iterations = 0;
        loop {
            // Fast path: hinted free indices.
            while let Ok(idx) = self.free_hints.pop() {
                let guard = self.pool_mutex.lock(&self.sync);
                if self.desc(idx).state() == PageState::Free {
                    self.take_free_locked(idx);
                    drop(guard);
                    return Ok(idx);
                }
                drop(guard);
            }
            {
                let guard = self.pool_mutex.lock(&self.sync);
                let head = self.free_list.head();
                if head != NIL {
                    self.take_free_locked(head);
                    drop(guard);
                    return Ok(head);
                }
            }
            if self.try_lru_scan.load(Ordering::Acquire) && self.scan_and_evict()? {
                continue;
            }
            // Nothing clean to evict: push one dirty page out and retry.
            if !self.flush_one_from_lru_tail()? {
                std::thread::sleep(std::time::Duration::from_millis(2));
            }
            iterations += 1;
            if iterations >= MAX_ITERATIONS {
                return Err(PoolError::NoFreeBlock(iterations));
            }
        }
    }

    /// Caller holds the pool mutex; `idx` is on the free list.
    fn take_free_locked(&self, idx: u32) {
        debug_assert_eq!(self.desc(idx).state(), PageState::Free);
        self.free_list.remove(&self.resolver(), idx);
        self.desc(idx).set_state(PageState::ReadyForUse);
        #[cfg(debug_assertions)]
        self.desc(idx).in_free_list.store(false, Ordering::Relaxed);
    }

    /// Returns an unused `ReadyForUse` descriptor to the free list.
    pub(super) fn return_free_descriptor(&self, idx: u32) {
        debug_assert_eq!(self.desc(idx).state(), PageState::ReadyForUse);
        let _guard = self.pool_mutex.lock(&self.sync);
        self.desc(idx).set_state(PageState::Free);
        self.free_list.push_front(&self.resolver(), idx);
        #[cfg(debug_assertions)]
        self.desc(idx).in_free_list.store(true, Ordering::Relaxed);
        let _ = self.free_hints.push(idx);
    }

    /// As above, but for descriptors that carried page identity.
    fn return_free_descriptor_reset(&self, idx: u32) {
        let _guard = self.pool_mutex.lock(&self.sync);
        self.desc(idx).reset_for_free();
        self.free_list.push_front(&self.resolver(), idx);
        #[cfg(debug_assertions)]
        self.desc(idx).in_free_list.store(true, Ordering::Relaxed);
        let _ = self.free_hints.push(idx);
    }

    /// Takes a block out of the pool for private in-memory use. The block
    /// is in no list and owns its frame exclusively until freed.
    pub(super) fn alloc_memory_block(&self) -> Result<super::guards::MemoryBlock<'_>> {
        let idx = self.alloc_free_descriptor()?;
        self.desc(idx).set_state(PageState::Memory);
        Ok(super::guards::MemoryBlock::new(self, idx))
    }

    pub(super) fn free_memory_block(&self, idx: u32) {
        debug_assert_eq!(self.desc(idx).state(), PageState::Memory);
        self.return_free_descriptor_reset(idx);
    }

    // ───── watches ──────────────────────────────────────────────────────

    /// Installs a watch sentinel for a missing page. Returns true when the
    /// page was already resident (no watch installed).
    pub(super) fn watch_set(&self, id: PageId) -> bool {
        let stripe = self.hash.stripe(id);
        stripe.exclusive(&self.sync);
        let pool_guard = self.pool_mutex.lock(&self.sync);
        let present = match self.hash.lookup(&self.resolver(), id) {
            Some(existing) => !self.is_sentinel(existing),
            None => {
                let slot = self
                    .watch
                    .iter()
                    .position(|w| w.state() == PageState::Free)
                    .expect("watch sentinel array exhausted");
                let sentinel = &self.watch[slot];
                sentinel.set_id(Some(id));
                sentinel.set_state(PageState::PoolWatch);
                let idx = self.capacity + slot as u32;
                self.hash.insert(&self.resolver(), id, idx);
                false
            }
        };
        drop(pool_guard);
        stripe.release_exclusive(&self.sync);
        present
    }

    /// True iff the watched page has been read in (present and not a
    /// sentinel). Valid between `watch_set` and `watch_unset`.
    pub(super) fn watch_occurred(&self, id: PageId) -> bool {
        let stripe = self.hash.stripe(id);
        stripe.shared(&self.sync);
        let found = self.hash.lookup(&self.resolver(), id);
        let occurred = matches!(found, Some(idx) if !self.is_sentinel(idx));
        stripe.release_shared(&self.sync);
        occurred
    }

    pub(super) fn watch_unset(&self, id: PageId) {
        let stripe = self.hash.stripe(id);
        stripe.exclusive(&self.sync);
        let pool_guard = self.pool_mutex.lock(&self.sync);
        if let Some(idx) = self.hash.lookup(&self.resolver(), id) {
            if self.is_sentinel(idx) {
                self.watch_remove_locked(id, idx);
            }
        }
        drop(pool_guard);
        stripe.release_exclusive(&self.sync);
    }

    /// Caller holds the stripe exclusively and the pool mutex.
    fn watch_remove_locked(&self, id: PageId, idx: u32) {
        debug_assert!(self.is_sentinel(idx));
        self.hash.remove(&self.resolver(), id, idx);
        let sentinel = self.desc(idx);
        sentinel.set_id(None);
        sentinel.set_state(PageState::Free);
    }

    // ───── checkpoint queries ───────────────────────────────────────────

    /// Smallest `oldest_modification_lsn` in this instance; 0 when clean.
    pub(super) fn oldest_modification(&self) -> Lsn {
        let _flush = self.flush_list_mutex.lock(&self.sync);
        if self.flush_list.is_empty() {
            0
        } else {
            self.desc(self.flush_list.tail()).oldest_lsn()
        }
    }

    pub(super) fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ───── validation (§8 invariants) ───────────────────────────────────

    /// Asserts the structural invariants at a quiescent point.
    pub(super) fn validate(&self) {
        let _pool = self.pool_mutex.lock(&self.sync);
        let _flush = self.flush_list_mutex.lock(&self.sync);
        let resolve = self.resolver();

        let mut in_free = std::collections::HashSet::new();
        let mut idx = self.free_list.head();
        while idx != NIL {
            assert!(in_free.insert(idx), "free list cycle");
            assert_eq!(self.desc(idx).state(), PageState::Free);
            idx = self.desc(idx).node(LinkKind::Free).next();
        }
        assert_eq!(in_free.len() as u32, self.free_list.len());

        let mut in_flush = std::collections::HashSet::new();
        let mut last_lsn = Lsn::MAX;
        idx = self.flush_list.head();
        while idx != NIL {
            let desc = self.desc(idx);
            assert!(in_flush.insert(idx), "flush list cycle");
            let lsn = desc.oldest_lsn();
            assert!(lsn > 0, "clean page on flush list");
            assert!(lsn <= last_lsn, "flush list out of order");
            last_lsn = lsn;
            idx = desc.node(LinkKind::Flush).next();
        }
        assert_eq!(in_flush.len() as u32, self.flush_list.len());

        let mut in_lru = std::collections::HashSet::new();
        let mut old_seen = 0;
        idx = self.lru_list.head();
        while idx != NIL {
            let desc = self.desc(idx);
            assert!(in_lru.insert(idx), "LRU cycle");
            if desc.is_old() {
                old_seen += 1;
            }
            idx = desc.node(LinkKind::Lru).next();
        }
        assert_eq!(in_lru.len() as u32, self.lru_list.len());
        assert_eq!(old_seen, self.lru_old_len.load(Ordering::Relaxed));

        let mut in_hash = std::collections::HashSet::new();
        self.hash.for_each(&resolve, |i| {
            assert!(in_hash.insert(i), "hash chain cycle");
            assert!(self.desc(i).state().in_page_hash());
        });

        for i in 0..self.capacity {
            let desc = self.desc(i);
            let state = desc.state();
            assert_eq!(state == PageState::Free, in_free.contains(&i));
            assert_eq!(desc.is_dirty(), in_flush.contains(&i), "desc {i}");
            assert_eq!(state.in_page_hash(), in_hash.contains(&i), "desc {i}");
            if state == PageState::FilePage || state == PageState::ZipClean {
                assert!(in_lru.contains(&i));
            }
            #[cfg(debug_assertions)]
            {
                assert_eq!(desc.in_free_list.load(Ordering::Relaxed), in_free.contains(&i));
                assert_eq!(desc.in_lru_list.load(Ordering::Relaxed), in_lru.contains(&i));
                assert_eq!(
                    desc.in_flush_list.load(Ordering::Relaxed),
                    in_flush.contains(&i)
                );
            }
        }
        for w in self.watch.iter() {
            if w.state() == PageState::PoolWatch {
                assert!(in_hash.contains(&w.index()));
            }
        }
    }

    #[cfg(test)]
    pub(super) fn free_len(&self) -> u32 {
        self.free_list.len()
    }
}

// ───── sharded facade ───────────────────────────────────────────────────────

/// The buffer pool: up to 64 instances, with page identity hashing to an
/// instance deterministically.
pub struct BufferPool {
    instances: Vec<PoolInstance>,
    config: Arc<PoolConfig>,
    sync: Arc<SyncContext>,
}

impl BufferPool {
    pub fn new(
        config: PoolConfig,
        sync: Arc<SyncContext>,
        io: Arc<dyn PageIo>,
        cipher: Arc<dyn PageCipher>,
    ) -> Self {
        let config = Arc::new(config.checked());
        let scratch = Arc::new(ScratchPool::new(config.scratch_slots));
        let instances = (0..config.instance_count)
            .map(|no| {
                PoolInstance::new(
                    no,
                    Arc::clone(&config),
                    Arc::clone(&sync),
                    Arc::clone(&io),
                    Arc::clone(&cipher),
                    Arc::clone(&scratch),
                )
            })
            .collect();
        BufferPool {
            instances,
            config,
            sync,
        }
    }

    #[inline]
    pub(super) fn instance_for(&self, id: PageId) -> &PoolInstance {
        let n = self.instances.len();
        &self.instances[(id.fingerprint() % n as u64) as usize]
    }

    pub(super) fn instance(&self, no: usize) -> &PoolInstance {
        &self.instances[no]
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn sync(&self) -> &Arc<SyncContext> {
        &self.sync
    }

    /// The general get protocol. Convenience wrappers below fix the common
    /// mode/latch combinations.
    pub fn get(&self, id: PageId, mode: GetMode, latch: LatchMode) -> Result<PageGuard<'_>> {
        self.instance_for(id).get(id, mode, latch)
    }

    pub fn get_read(&self, id: PageId) -> Result<PageGuard<'_>> {
        self.get(id, GetMode::GetAlways, LatchMode::Shared)
    }

    pub fn get_write(&self, id: PageId) -> Result<PageGuard<'_>> {
        self.get(id, GetMode::GetAlways, LatchMode::Exclusive)
    }

    /// Pin without latching (`GET_NO_LATCH`).
    pub fn get_pinned(&self, id: PageId) -> Result<PageGuard<'_>> {
        self.get(id, GetMode::GetNoLatch, LatchMode::None)
    }

    /// Allocates a scratch block from the least loaded-looking instance.
    pub fn alloc_memory_block(&self) -> Result<super::guards::MemoryBlock<'_>> {
        let instance = self
            .instances
            .iter()
            .max_by_key(|i| i.free_list.len())
            .expect("at least one instance");
        instance.alloc_memory_block()
    }

    /// Hints that `id` will be needed soon: pulls it into the pool without
    /// keeping any latch. Best effort; failures are swallowed.
    pub fn prefetch(&self, id: PageId) {
        let instance = self.instance_for(id);
        if instance.get(id, GetMode::GetNoLatch, LatchMode::None).is_ok() {
            instance.stats.inc_read_ahead();
        }
    }

    pub fn create(&self, id: PageId) -> Result<PageGuard<'_>> {
        self.instance_for(id).create(id)
    }

    /// Re-acquires a page through a stale reference without a hash lookup,
    /// if nothing invalidated it; otherwise `NotInPool` and the caller
    /// falls back to `get`. A real latch mode is required: `LatchMode::None`
    /// also reports `NotInPool`, since nothing would hold the validation.
    pub fn optimistic_get(&self, page_ref: &PageRef, latch: LatchMode) -> Result<PageGuard<'_>> {
        self.instance(page_ref.instance).optimistic_get(page_ref, latch)
    }

    /// True when the page is resident, with no LRU side effects.
    pub fn contains(&self, id: PageId) -> bool {
        let instance = self.instance_for(id);
        instance
            .hash
            .lookup_locked(&instance.sync, &instance.resolver(), id)
            .map(|idx| !instance.is_sentinel(idx))
            .unwrap_or(false)
    }

    pub fn watch_set(&self, id: PageId) -> bool {
        self.instance_for(id).watch_set(id)
    }

    pub fn watch_occurred(&self, id: PageId) -> bool {
        self.instance_for(id).watch_occurred(id)
    }

    pub fn watch_unset(&self, id: PageId) {
        self.instance_for(id).watch_unset(id)
    }

    /// Evicts the page if present and evictable.
    pub fn try_evict(&self, id: PageId) -> bool {
        self.instance_for(id).try_evict(id)
    }

    /// Drops every resident page of a tablespace that is evictable. Used
    /// when a tablespace is deleted.
    pub fn evict_space(&self, space_id: SpaceId) {
        for instance in &self.instances {
            instance.evict_space(space_id);
        }
    }

    /// Smallest `oldest_modification_lsn` across all instances; 0 when the
    /// pool is clean. Checkpoints advance past this value.
    pub fn oldest_modification(&self) -> Lsn {
        self.instances
            .iter()
            .map(|i| i.oldest_modification())
            .filter(|&lsn| lsn != 0)
            .min()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.instances
            .iter()
            .map(|i| i.snapshot())
            .fold(StatsSnapshot::default(), |a, b| a + b)
    }

    pub fn validate(&self) {
        for instance in &self.instances {
            instance.validate();
        }
        self.sync.validate();
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub(super) fn instances(&self) -> &[PoolInstance] {
        &self.instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::{get_test_pool, get_test_pool_with};
    use crate::checksum::{ChecksumAlgorithm, NO_CHECKSUM_MAGIC};
    use crate::page::{PAGE_SIZE, FIELD_CHECKSUM, FIELD_TRAILER_CHECKSUM};
    use std::thread;

    fn small_config(num_pages: usize) -> PoolConfig {
        PoolConfig {
            total_pool_bytes: num_pages * PAGE_SIZE,
            instance_count: 1,
            ..PoolConfig::default()
        }
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::Rng::fill(&mut rand::rng(), &mut bytes[..]);
        bytes
    }

    fn shuffled(mut pages: Vec<u32>) -> Vec<u32> {
        use rand::seq::SliceRandom;
        pages.shuffle(&mut rand::rng());
        pages
    }

    #[test]
    fn test_create_release_get_hit() {
        let (pool, io) = get_test_pool(64);
        io.create_space(7);
        let id = PageId::new(7, 3);
        let payload = random_payload(256);

        let frame_addr = {
            let mut guard = pool.create(id).unwrap();
            guard.page_mut()[100..356].copy_from_slice(&payload);
            assert_eq!(guard.pin_count(), 1);
            &guard[0] as *const u8 as usize
        };

        let gets_before = pool.stats().page_gets;
        {
            let guard = pool.get_read(id).unwrap();
            assert_eq!(&guard[0] as *const u8 as usize, frame_addr);
            assert_eq!(&guard[100..356], &payload[..]);
        }
        assert_eq!(pool.stats().page_gets, gets_before + 1);
        pool.validate();
    }

    #[test]
    fn test_pin_discipline_via_guards() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        let id = PageId::new(1, 9);
        pool.create(id).unwrap();

        let instance = pool.instance_for(id);
        let idx = instance
            .hash
            .lookup_locked(&instance.sync, &instance.resolver(), id)
            .unwrap();
        assert_eq!(instance.desc(idx).pin_count(), 0);
        {
            let _a = pool.get_read(id).unwrap();
            let _b = pool.get_read(id).unwrap();
            assert_eq!(instance.desc(idx).pin_count(), 2);
        }
        assert_eq!(instance.desc(idx).pin_count(), 0);
    }

    #[test]
    fn test_miss_reads_from_disk() {
        let (pool, io) = get_test_pool(64);
        io.create_space(7);
        let id = PageId::new(7, 9);
        let mut page = Page::new_empty();
        page.set_id(id);
        page[500] = 0x77;
        checksum::stamp(&mut page, ChecksumAlgorithm::Crc32, 33);
        io.store_raw(id, &page);

        let guard = pool.get_read(id).unwrap();
        assert_eq!(guard[500], 0x77);
        assert_eq!(guard.oldest_modification(), 0);
        assert_eq!(guard.pin_count(), 1);
        let instance = pool.instance_for(id);
        let idx = guard.page_ref().idx;
        assert_eq!(instance.desc(idx).state(), PageState::FilePage);
        assert_eq!(instance.desc(idx).io_state(), IoState::None);
        assert_eq!(instance.desc(idx).newest_lsn(), 33);
        drop(guard);
        assert_eq!(pool.stats().pages_read, 1);
        pool.validate();
    }

    #[test]
    fn test_corrupted_page_cleanup() {
        let (pool, io) = get_test_pool_with(PoolConfig {
            checksum_algorithm: ChecksumAlgorithm::StrictCrc32,
            ..small_config(64)
        });
        io.create_space(7);
        let id = PageId::new(7, 9);
        let mut page = Page::new_empty();
        page.set_id(id);
        page.set_lsn(1);
        page.write_u32(FIELD_CHECKSUM, NO_CHECKSUM_MAGIC);
        page.write_u32(FIELD_TRAILER_CHECKSUM, NO_CHECKSUM_MAGIC);
        io.store_raw(id, &page);

        let free_before = pool.instance(0).free_len();
        match pool.get_read(id) {
            Err(PoolError::PageCorrupted(got)) => assert_eq!(got, id),
            other => panic!("expected PageCorrupted, got {other:?}"),
        }
        assert_eq!(pool.instance(0).free_len(), free_before);
        assert!(!pool.contains(id));
        pool.validate();
    }

    #[test]
    fn test_read_io_failure_cleanup() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        io.fail_next_read();
        let free_before = pool.instance(0).free_len();
        assert!(matches!(
            pool.get_read(PageId::new(1, 5)),
            Err(PoolError::Io(_))
        ));
        assert_eq!(pool.instance(0).free_len(), free_before);
        pool.validate();
    }

    #[test]
    fn test_tablespace_deleted() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        pool.create(PageId::new(1, 0)).unwrap();
        io.drop_space(1);
        assert!(matches!(
            pool.get_read(PageId::new(1, 1)),
            Err(PoolError::TablespaceDeleted(1))
        ));
        // Residents of the dropped space are removed wholesale.
        pool.evict_space(1);
        assert!(!pool.contains(PageId::new(1, 0)));
        pool.validate();
    }

    #[test]
    fn test_get_modes() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        let id = PageId::new(1, 4);
        assert!(matches!(
            pool.get(id, GetMode::GetIfInPool, LatchMode::Shared),
            Err(PoolError::NotInPool)
        ));
        assert!(matches!(
            pool.get(id, GetMode::PeekIfInPool, LatchMode::Shared),
            Err(PoolError::NotInPool)
        ));
        pool.create(id).unwrap();
        assert!(pool.get(id, GetMode::GetIfInPool, LatchMode::Shared).is_ok());
        assert!(pool.get(id, GetMode::PeekIfInPool, LatchMode::Shared).is_ok());
        // No-latch get only pins.
        {
            let guard = pool.get_pinned(id).unwrap();
            assert_eq!(guard.latch_mode(), LatchMode::None);
            assert_eq!(guard.pin_count(), 1);
        }
        // Eviction mode reports NotInPool either way and removes the page.
        assert!(matches!(
            pool.get(id, GetMode::EvictIfInPool, LatchMode::None),
            Err(PoolError::NotInPool)
        ));
        assert!(!pool.contains(id));
        pool.validate();
    }

    #[test]
    fn test_no_free_block_when_all_pinned() {
        let (pool, io) = get_test_pool(16);
        io.create_space(1);
        let mut guards = Vec::new();
        for page_no in 0..16 {
            guards.push(pool.create(PageId::new(1, page_no)).unwrap());
        }
        assert!(matches!(
            pool.create(PageId::new(1, 99)),
            Err(PoolError::NoFreeBlock(_))
        ));
        drop(guards);
        // Unpinned and clean: the next miss evicts and succeeds.
        pool.create(PageId::new(1, 99)).unwrap();
        pool.validate();
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let (pool, io) = get_test_pool(16);
        io.create_space(1);
        let mut lsn = 0;
        for page_no in 0..64 {
            let mut guard = pool.create(PageId::new(1, page_no)).unwrap();
            guard.page_mut()[2000] = page_no as u8;
            lsn += 1;
            guard.mark_dirty(lsn);
        }
        // Everything must be recoverable: early pages were flushed on
        // demand and evicted. Revisit in random order.
        let order = shuffled((0..64).collect());
        for page_no in order {
            let guard = pool.get_read(PageId::new(1, page_no)).unwrap();
            assert_eq!(guard[2000], page_no as u8, "page {page_no}");
        }
        pool.validate();
    }

    #[test]
    fn test_flush_batch_oldest_first() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        let ids = [PageId::new(1, 0), PageId::new(1, 1), PageId::new(1, 2)];
        for (i, &id) in ids.iter().enumerate() {
            let guard = pool.create(id).unwrap();
            guard.mark_dirty(100 + 50 * i as u64);
        }
        assert_eq!(pool.oldest_modification(), 100);
        let written = pool.flush_batch(10, None).unwrap();
        assert_eq!(written, 3);
        assert_eq!(io.write_order(), ids.to_vec());
        assert_eq!(pool.oldest_modification(), 0);
        pool.validate();
    }

    #[test]
    fn test_flush_to_target_lsn() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        for i in 0..4u64 {
            let guard = pool.create(PageId::new(1, i as u32)).unwrap();
            guard.mark_dirty(100 * (i + 1));
        }
        pool.flush_for_checkpoint(250).unwrap();
        let oldest = pool.oldest_modification();
        assert!(oldest >= 250, "oldest {oldest}");
        pool.flush_all().unwrap();
        assert_eq!(pool.oldest_modification(), 0);
        pool.validate();
    }

    #[test]
    fn test_recovery_out_of_order_dirtying() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        pool.set_recovery_mode(true);
        let lsns = [300u64, 100, 200, 250, 50];
        for (i, &lsn) in lsns.iter().enumerate() {
            let guard = pool.create(PageId::new(1, i as u32)).unwrap();
            guard.mark_dirty(lsn);
        }
        pool.validate(); // flush list must already be ordered
        pool.set_recovery_mode(false);
        pool.flush_batch(10, None).unwrap();
        let order: Vec<u32> = io.write_order().iter().map(|id| id.page_no).collect();
        assert_eq!(order, vec![4, 1, 2, 3, 0]);
        pool.validate();
    }

    #[test]
    fn test_watch_protocol() {
        let (pool, io) = get_test_pool(64);
        io.create_space(7);
        let id = PageId::new(7, 12);

        assert!(!pool.watch_set(id)); // absent: watch installed
        assert!(!pool.watch_occurred(id));
        // A peer reads the page in, replacing the sentinel.
        {
            let mut page = Page::new_empty();
            page.set_id(id);
            checksum::stamp(&mut page, ChecksumAlgorithm::Crc32, 5);
            io.store_raw(id, &page);
            pool.get_read(id).unwrap();
        }
        assert!(pool.watch_occurred(id));
        pool.watch_unset(id);
        // Setting a watch on a resident page installs nothing.
        assert!(pool.watch_set(id));
        pool.validate();
    }

    #[test]
    fn test_watch_unset_without_read() {
        let (pool, io) = get_test_pool(64);
        io.create_space(7);
        let id = PageId::new(7, 13);
        assert!(!pool.watch_set(id));
        pool.watch_unset(id);
        assert!(!pool.contains(id));
        pool.validate();
    }

    #[test]
    fn test_optimistic_get() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        let id = PageId::new(1, 3);
        let page_ref = {
            let guard = pool.create(id).unwrap();
            guard.page_ref()
        };
        {
            let guard = pool.optimistic_get(&page_ref, LatchMode::Shared).unwrap();
            assert_eq!(guard.id(), id);
        }
        // An unlatched optimistic access cannot validate anything.
        assert!(matches!(
            pool.optimistic_get(&page_ref, LatchMode::None),
            Err(PoolError::NotInPool)
        ));
        // Eviction bumps the modify clock; the stale reference must fail.
        assert!(pool.try_evict(id));
        assert!(matches!(
            pool.optimistic_get(&page_ref, LatchMode::Shared),
            Err(PoolError::NotInPool)
        ));
        pool.validate();
    }

    #[test]
    fn test_midpoint_lru_scan_resistance() {
        let (pool, io) = get_test_pool_with(PoolConfig {
            lru_old_threshold_ms: 50,
            ..small_config(200)
        });
        io.create_space(1);
        for page_no in 0..100 {
            pool.create(PageId::new(1, page_no)).unwrap();
        }
        let once = PageId::new(1, 0);
        let twice = PageId::new(1, 1);
        pool.get_read(once).unwrap();
        pool.get_read(twice).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(60));
        // Re-accessed past the age threshold: promoted to the young end.
        pool.get_read(twice).unwrap();
        assert!(pool.stats().made_young >= 1);

        // A long unique scan must push the one-shot page out while the
        // promoted page survives.
        for page_no in 1000..1400 {
            pool.create(PageId::new(1, page_no)).unwrap();
        }
        assert!(!pool.contains(once));
        assert!(pool.contains(twice));
        pool.validate();
    }

    #[test]
    fn test_compressed_page_lifecycle() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        let id = PageId::new(1, 8);
        {
            let mut guard = pool.create(id).unwrap();
            guard.page_mut()[3000] = 0x3C;
            guard.mark_dirty(10);
            guard.attach_compressed(vec![0u8; 2048]);
        }
        pool.flush_all().unwrap();

        // Invalidate the uncompressed frame; the descriptor stays resident
        // as compressed-only.
        assert!(pool.instance(0).drop_uncompressed(id));
        assert!(pool.contains(id));
        // Relocate it onto a fresh descriptor, as buddy reassembly would.
        assert!(pool.instance(0).relocate_compressed(id).unwrap());
        pool.validate();

        // A get rebuilds the frame from disk.
        let guard = pool.get_read(id).unwrap();
        assert_eq!(guard[3000], 0x3C);
        drop(guard);
        pool.validate();
    }

    #[test]
    fn test_concurrent_writers_on_one_page() {
        let (pool, io) = get_test_pool(16);
        io.create_space(1);
        let id = PageId::new(1, 0);
        pool.create(id).unwrap();

        let num_threads: u64 = 4;
        let num_iterations: u64 = 50;
        thread::scope(|s| {
            for _ in 0..num_threads {
                s.spawn(|| {
                    for i in 0..num_iterations {
                        let mut guard = pool.get_write(id).unwrap();
                        guard.page_mut()[0] += 1;
                        guard.mark_dirty(i + 1);
                    }
                });
            }
        });
        let guard = pool.get_read(id).unwrap();
        assert_eq!(guard[0], (num_threads * num_iterations) as u8);
        drop(guard);
        pool.validate();
    }

    #[test]
    fn test_concurrent_churn_many_pages() {
        let (pool, io) = get_test_pool(32);
        io.create_space(1);
        let lsn = std::sync::atomic::AtomicU64::new(0);
        let pool = &pool;
        let lsn = &lsn;
        thread::scope(|s| {
            for t in 0..4u32 {
                s.spawn(move || {
                    for i in 0..100u32 {
                        let id = PageId::new(1, t * 1000 + i);
                        let mut guard = pool.create(id).unwrap();
                        guard.page_mut()[10] = t as u8;
                        guard.mark_dirty(lsn.fetch_add(1, Ordering::Relaxed) + 1);
                    }
                });
            }
        });
        pool.flush_all().unwrap();
        assert_eq!(pool.oldest_modification(), 0);
        pool.validate();
    }

    #[test]
    fn test_prefetch_counts_read_ahead() {
        let (pool, io) = get_test_pool(64);
        io.create_space(1);
        let id = PageId::new(1, 30);
        let mut page = Page::new_empty();
        page.set_id(id);
        checksum::stamp(&mut page, ChecksumAlgorithm::Crc32, 2);
        io.store_raw(id, &page);

        pool.prefetch(id);
        assert!(pool.contains(id));
        assert_eq!(pool.stats().read_ahead, 1);
        // Missing tablespace: best effort, no error.
        pool.prefetch(PageId::new(99, 0));
        pool.validate();
    }

    #[test]
    fn test_sharded_instances() {
        let (pool, io) = get_test_pool_with(PoolConfig {
            instance_count: 4,
            ..small_config(256)
        });
        io.create_space(1);
        for page_no in 0..64 {
            pool.create(PageId::new(1, page_no)).unwrap();
        }
        // Identity maps to a stable instance.
        for page_no in 0..64 {
            let id = PageId::new(1, page_no);
            assert!(pool.contains(id));
            let a = pool.instance_for(id).no;
            let b = pool.instance_for(id).no;
            assert_eq!(a, b);
        }
        let spread: std::collections::HashSet<usize> = (0..64)
            .map(|p| pool.instance_for(PageId::new(1, p)).no)
            .collect();
        assert!(spread.len() > 1, "sharding degenerated to one instance");
        pool.validate();
    }

    #[test]
    fn test_memory_block_cycle() {
        let (pool, _io) = get_test_pool(16);
        let free_before = pool.instance(0).free_len();
        {
            let mut block = pool.alloc_memory_block().unwrap();
            block[0] = 0xEE;
            assert_eq!(block[0], 0xEE);
            assert_eq!(pool.instance(0).free_len(), free_before - 1);
            pool.validate();
        }
        assert_eq!(pool.instance(0).free_len(), free_before);
        pool.validate();
    }

    #[test]
    fn test_no_flush_event_levels() {
        let (pool, io) = get_test_pool(16);
        io.create_space(1);
        // No batch in progress: must not block.
        pool.wait_for_no_flush(FlushKind::FlushList);
        let guard = pool.create(PageId::new(1, 0)).unwrap();
        guard.mark_dirty(1);
        drop(guard);
        pool.flush_batch(10, None).unwrap();
        pool.wait_for_no_flush(FlushKind::FlushList);
        pool.wait_for_no_flush(FlushKind::SinglePage);
        pool.validate();
    }
}
