//! Midpoint LRU replacement.
//!
//! The LRU is split into a young segment at the head and an old segment at
//! the tail; `lru_old` points at the old block closest to the head. New
//! pages enter at the midpoint so one-shot sequential scans cannot flush
//! the working set; an old block is promoted only when re-accessed later
//! than `lru_old_threshold_ms` after its first access. Eviction scans the
//! old tail under a hazard pointer.

use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::log_debug;
use crate::page::{PageId, SpaceId};
use crate::sync::now_ms;

use super::descriptor::{IoState, PageState};
use super::lists::{LinkKind, NIL};
use super::pool::PoolInstance;

/// Below this LRU length there is no old segment at all.
pub(super) const LRU_OLD_MIN_LEN: u32 = 80;
/// Slack on the old-segment length before the boundary is moved.
const LRU_OLD_TOLERANCE: u32 = 20;

impl PoolInstance {
    fn lru_desired_old_len(&self) -> u32 {
        (self.lru_list.len() as u64 * self.config.lru_old_ratio_pct as u64 / 100) as u32
    }

    /// Inserts a new page at the midpoint (or at the head while the list is
    /// too short to have segments). Caller holds the pool mutex.
    pub(super) fn lru_insert(&self, idx: u32) {
        let resolve = self.resolver();
        let desc = self.desc(idx);
        if self.lru_list.len() < LRU_OLD_MIN_LEN {
            self.lru_list.push_front(&resolve, idx);
            desc.set_old(false);
            if self.lru_list.len() == LRU_OLD_MIN_LEN {
                self.lru_old_init();
            }
        } else {
            // Just past the boundary block, on the old side.
            let boundary = self.lru_old.load(Ordering::Relaxed);
            debug_assert_ne!(boundary, NIL);
            self.lru_list.insert_after(&resolve, boundary, idx);
            desc.set_old(true);
            self.lru_old_len.fetch_add(1, Ordering::Relaxed);
            self.lru_old_adjust();
        }
        desc.set_access_time(0);
        desc.set_freed_page_clock(self.freed_page_clock.load(Ordering::Relaxed));
        #[cfg(debug_assertions)]
        desc.in_lru_list.store(true, Ordering::Relaxed);
    }

    /// The list just reached segment size: mark everything old and let the
    /// adjustment shrink the segment to the configured ratio.
    fn lru_old_init(&self) {
        let resolve = self.resolver();
        let mut idx = self.lru_list.head();
        while idx != NIL {
            self.desc(idx).set_old(true);
            idx = resolve(idx).node(LinkKind::Lru).next();
        }
        self.lru_old.store(self.lru_list.head(), Ordering::Relaxed);
        self.lru_old_len
            .store(self.lru_list.len(), Ordering::Relaxed);
        self.lru_old_adjust();
    }

    /// Drops segment bookkeeping when the list shrinks below the minimum.
    fn lru_clear_old(&self) {
        let resolve = self.resolver();
        let mut idx = self.lru_list.head();
        while idx != NIL {
            self.desc(idx).set_old(false);
            idx = resolve(idx).node(LinkKind::Lru).next();
        }
        self.lru_old.store(NIL, Ordering::Relaxed);
        self.lru_old_len.store(0, Ordering::Relaxed);
    }

    /// Moves the boundary until the old-segment length is within tolerance
    /// of the configured ratio. Caller holds the pool mutex.
    fn lru_old_adjust(&self) {
        let resolve = self.resolver();
        let desired = self.lru_desired_old_len();
        let mut boundary = self.lru_old.load(Ordering::Relaxed);
        if boundary == NIL {
            return;
        }
        loop {
            let old_len = self.lru_old_len.load(Ordering::Relaxed);
            if old_len + LRU_OLD_TOLERANCE < desired {
                // Grow the segment toward the head.
                let prev = resolve(boundary).node(LinkKind::Lru).prev();
                if prev == NIL {
                    break;
                }
                boundary = prev;
                resolve(boundary).set_old(true);
                self.lru_old.store(boundary, Ordering::Relaxed);
                self.lru_old_len.store(old_len + 1, Ordering::Relaxed);
            } else if old_len > desired + LRU_OLD_TOLERANCE {
                // Shrink: the boundary block becomes young.
                let next = resolve(boundary).node(LinkKind::Lru).next();
                if next == NIL {
                    break;
                }
                resolve(boundary).set_old(false);
                boundary = next;
                self.lru_old.store(boundary, Ordering::Relaxed);
                self.lru_old_len.store(old_len - 1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }

    /// Unlinks `idx` from the LRU, maintaining the hazard pointer and the
    /// boundary. Caller holds the pool mutex and re-balances afterwards.
    pub(super) fn lru_remove_locked(&self, idx: u32) {
        let resolve = self.resolver();
        let desc = self.desc(idx);
        // Tail-to-head iterators visit `prev` next.
        self.lru_hp.adjust(idx, desc.node(LinkKind::Lru).prev());
        if desc.is_old() {
            let old = self.lru_old_len.fetch_sub(1, Ordering::Relaxed);
            debug_assert!(old > 0);
        }
        if self.lru_old.load(Ordering::Relaxed) == idx {
            // The next node toward the tail is old or absent.
            self.lru_old
                .store(desc.node(LinkKind::Lru).next(), Ordering::Relaxed);
        }
        self.lru_list.remove(&resolve, idx);
        #[cfg(debug_assertions)]
        desc.in_lru_list.store(false, Ordering::Relaxed);
    }

    /// Restores segment invariants after removals or promotions. Caller
    /// holds the pool mutex.
    pub(super) fn lru_balance(&self) {
        if self.lru_list.len() < LRU_OLD_MIN_LEN {
            if self.lru_old.load(Ordering::Relaxed) != NIL {
                self.lru_clear_old();
            }
        } else if self.lru_old.load(Ordering::Relaxed) == NIL {
            self.lru_old_init();
        } else {
            self.lru_old_adjust();
        }
    }

    // ───── young/old promotion ──────────────────────────────────────────

    /// LRU bookkeeping on a page hit. First access stamps the access time;
    /// an old block is promoted once it is re-accessed past the age
    /// threshold; a young block is refreshed only when it has drifted far
    /// down, measured in evictions since its last promotion.
    pub(super) fn make_young_if_needed(&self, idx: u32) {
        let desc = self.desc(idx);
        let now = now_ms();
        if desc.access_time() == 0 {
            desc.set_access_time(now.max(1));
        }
        if desc.is_old() {
            let age = now.saturating_sub(desc.access_time());
            if age >= self.config.lru_old_threshold_ms {
                self.make_young(idx);
                self.stats.inc_made_young();
            } else {
                self.stats.inc_not_made_young();
            }
        } else if self.block_too_old(idx) {
            self.make_young(idx);
            self.stats.inc_made_young();
        }
    }

    /// Re-promotion heuristic: enough evictions have passed since this
    /// block's snapshot that its position has decayed. The relaxed read
    /// tolerates ±1 staleness.
    fn block_too_old(&self, idx: u32) -> bool {
        let desc = self.desc(idx);
        let pool_clock = self.freed_page_clock.load(Ordering::Relaxed);
        pool_clock > desc.freed_page_clock() + (self.capacity as u64 / 16).max(1)
    }

    fn make_young(&self, idx: u32) {
        let _guard = self.pool_mutex.lock(&self.sync);
        let desc = self.desc(idx);
        if !matches!(desc.state(), PageState::FilePage | PageState::ZipClean) {
            return;
        }
        self.lru_remove_locked(idx);
        self.lru_list.push_front(&self.resolver(), idx);
        desc.set_old(false);
        desc.set_freed_page_clock(self.freed_page_clock.load(Ordering::Relaxed));
        #[cfg(debug_assertions)]
        desc.in_lru_list.store(true, Ordering::Relaxed);
        self.lru_balance();
    }

    // ───── eviction ─────────────────────────────────────────────────────

    /// Scans the old tail for an evictable block and frees it. Returns
    /// false when `flush_scan_depth` candidates were examined without
    /// success, which also disarms `try_lru_scan` until a flush batch
    /// produces clean pages again.
    pub(super) fn scan_and_evict(&self) -> Result<bool> {
        let depth = self.config.flush_scan_depth;
        let mut scanned = 0;
        loop {
            let candidate = {
                let _guard = self.pool_mutex.lock(&self.sync);
                let mut idx = if self.lru_hp.is_set() {
                    self.lru_hp.get()
                } else {
                    self.lru_list.tail()
                };
                let mut found = None;
                while idx != NIL && scanned < depth {
                    let desc = self.desc(idx);
                    let prev = desc.node(LinkKind::Lru).prev();
                    if desc.ready_for_eviction() {
                        self.lru_hp.set(prev);
                        found = Some((idx, desc.id()));
                        break;
                    }
                    scanned += 1;
                    idx = prev;
                }
                found
            };
            let Some((idx, Some(id))) = candidate else {
                self.lru_hp.clear();
                self.try_lru_scan.store(false, Ordering::Release);
                log_debug!("LRU scan exhausted after {} candidates", scanned);
                return Ok(false);
            };

            // Lock order: stripe before pool mutex; the candidate must be
            // revalidated after the gap.
            let stripe = self.hash.stripe(id);
            stripe.exclusive(&self.sync);
            let guard = self.pool_mutex.lock(&self.sync);
            let desc = self.desc(idx);
            let evictable = desc.id() == Some(id) && {
                let _block = desc.mutex.lock(&self.sync);
                if desc.ready_for_eviction() {
                    // Claimed: optimistic pinners are now excluded.
                    desc.set_state(PageState::RemoveHash);
                    true
                } else {
                    false
                }
            };
            if evictable {
                self.evict_locked(idx, id);
                drop(guard);
                stripe.release_exclusive(&self.sync);
                self.lru_hp.clear();
                return Ok(true);
            }
            drop(guard);
            stripe.release_exclusive(&self.sync);
            if scanned >= depth {
                self.lru_hp.clear();
                self.try_lru_scan.store(false, Ordering::Release);
                return Ok(false);
            }
        }
    }

    /// Dual-frame blocks are on the unzip-LRU; compressed-only descriptors
    /// keep their zip frame but are not. Caller holds the pool mutex.
    fn in_unzip_list(&self, idx: u32) -> bool {
        let node = self.desc(idx).node(LinkKind::Unzip);
        node.prev() != NIL || node.next() != NIL || self.unzip_list.head() == idx
    }

    /// Final eviction step. Caller holds the stripe exclusively and the
    /// pool mutex, and has moved the descriptor to `RemoveHash` under the
    /// block mutex.
    pub(super) fn evict_locked(&self, idx: u32, id: PageId) {
        let resolve = self.resolver();
        let desc = self.desc(idx);
        debug_assert_eq!(desc.state(), PageState::RemoveHash);
        self.hash.remove(&resolve, id, idx);
        self.lru_remove_locked(idx);
        self.lru_balance();
        if self.in_unzip_list(idx) {
            self.unzip_list.remove(&resolve, idx);
        }
        desc.bump_modify_clock();
        desc.reset_for_free();
        self.free_list.push_front(&resolve, idx);
        #[cfg(debug_assertions)]
        desc.in_free_list.store(true, Ordering::Relaxed);
        self.freed_page_clock.fetch_add(1, Ordering::Relaxed);
        self.stats.inc_pages_evicted();
        let _ = self.free_hints.push(idx);
    }

    /// Evicts one specific page if it is present and evictable.
    pub(super) fn try_evict(&self, id: PageId) -> bool {
        let stripe = self.hash.stripe(id);
        stripe.exclusive(&self.sync);
        let guard = self.pool_mutex.lock(&self.sync);
        let found = self.hash.lookup(&self.resolver(), id);
        let evicted = match found {
            Some(idx) if !self.is_sentinel(idx) => {
                let desc = self.desc(idx);
                let claimed = {
                    let _block = desc.mutex.lock(&self.sync);
                    if desc.ready_for_eviction() {
                        desc.set_state(PageState::RemoveHash);
                        true
                    } else {
                        false
                    }
                };
                if claimed {
                    self.evict_locked(idx, id);
                }
                claimed
            }
            _ => false,
        };
        drop(guard);
        stripe.release_exclusive(&self.sync);
        evicted
    }

    /// Evicts every page of a dropped tablespace. Modifications of dropped
    /// pages are discarded, never written.
    pub(super) fn evict_space(&self, space_id: SpaceId) {
        let targets: Vec<PageId> = {
            let _guard = self.pool_mutex.lock(&self.sync);
            let resolve = self.resolver();
            let mut out = Vec::new();
            let mut idx = self.lru_list.head();
            while idx != NIL {
                if let Some(id) = self.desc(idx).id() {
                    if id.space_id == space_id {
                        out.push(id);
                    }
                }
                idx = resolve(idx).node(LinkKind::Lru).next();
            }
            out
        };
        for id in targets {
            self.discard_modifications(id);
            self.try_evict(id);
        }
    }

    /// Unlinks a page of a dropped tablespace from the flush list without
    /// writing it.
    fn discard_modifications(&self, id: PageId) {
        let stripe = self.hash.stripe(id);
        stripe.shared(&self.sync);
        if let Some(idx) = self.hash.lookup(&self.resolver(), id) {
            if !self.is_sentinel(idx) {
                let desc = self.desc(idx);
                let _flush = self.flush_list_mutex.lock(&self.sync);
                if desc.is_dirty() && desc.io_state() == IoState::None {
                    self.flush_list_remove_locked(idx);
                    desc.set_oldest_lsn(0);
                }
            }
        }
        stripe.release_shared(&self.sync);
    }

    // ───── compressed-page maintenance ──────────────────────────────────

    /// Installs a compressed copy next to the uncompressed frame, putting
    /// the block on the unzip-LRU. Caller holds the block exclusively
    /// through a write guard.
    pub(super) fn attach_compressed_to(&self, idx: u32, data: Box<[u8]>) {
        let guard = self.pool_mutex.lock(&self.sync);
        let desc = self.desc(idx);
        let had = {
            let _block = desc.mutex.lock(&self.sync);
            desc.set_zip_frame(Some(data))
        };
        if had.is_none() {
            self.unzip_list.push_front(&self.resolver(), idx);
        }
        drop(guard);
    }

    /// Invalidates the uncompressed frame of a clean, unpinned dual-frame
    /// block, leaving a compressed-only (`ZipClean`) descriptor. The next
    /// get re-reads the page into the frame.
    pub(super) fn drop_uncompressed(&self, id: PageId) -> bool {
        let stripe = self.hash.stripe(id);
        stripe.exclusive(&self.sync);
        let guard = self.pool_mutex.lock(&self.sync);
        let dropped = match self.hash.lookup(&self.resolver(), id) {
            Some(idx) if !self.is_sentinel(idx) => {
                let desc = self.desc(idx);
                let _block = desc.mutex.lock(&self.sync);
                if desc.state() == PageState::FilePage
                    && desc.has_zip_frame()
                    && desc.pin_count() == 0
                    && desc.io_state() == IoState::None
                    && !desc.is_dirty()
                {
                    desc.set_state(PageState::ZipClean);
                    desc.bump_modify_clock();
                    drop(_block);
                    self.unzip_list.remove(&self.resolver(), idx);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        drop(guard);
        stripe.release_exclusive(&self.sync);
        dropped
    }

    /// Moves a compressed-only descriptor onto a fresh descriptor so the
    /// buddy allocator can reassemble blocks. List positions and the hash
    /// chain entry are rewritten in place.
    pub(super) fn relocate_compressed(&self, id: PageId) -> Result<bool> {
        let to = self.alloc_free_descriptor()?;
        let stripe = self.hash.stripe(id);
        stripe.exclusive(&self.sync);
        let guard = self.pool_mutex.lock(&self.sync);
        let from = match self.hash.lookup(&self.resolver(), id) {
            Some(idx) if !self.is_sentinel(idx) => idx,
            _ => {
                drop(guard);
                stripe.release_exclusive(&self.sync);
                self.return_free_descriptor(to);
                return Ok(false);
            }
        };
        let d_from = self.desc(from);
        let d_to = self.desc(to);
        let _block = d_from.mutex.lock(&self.sync);
        if d_from.state() != PageState::ZipClean
            || d_from.pin_count() != 0
            || d_from.io_state() != IoState::None
        {
            drop(_block);
            drop(guard);
            stripe.release_exclusive(&self.sync);
            self.return_free_descriptor(to);
            return Ok(false);
        }
        let resolve = self.resolver();
        // Relocation pin on the destination while its fields settle.
        d_to.set_io_state(IoState::PinnedNoIo);
        d_to.set_id(Some(id));
        d_to.set_state(PageState::ZipClean);
        d_to.set_newest_lsn(d_from.newest_lsn());
        d_to.set_old(d_from.is_old());
        d_to.set_access_time(d_from.access_time());
        d_to.set_freed_page_clock(d_from.freed_page_clock());
        d_to.set_zip_frame(d_from.set_zip_frame(None));

        self.hash.replace(&resolve, id, from, to);
        self.lru_hp.adjust(from, d_from.node(LinkKind::Lru).prev());
        self.lru_list.replace(&resolve, from, to);
        if self.lru_old.load(Ordering::Relaxed) == from {
            self.lru_old.store(to, Ordering::Relaxed);
        }
        #[cfg(debug_assertions)]
        {
            d_from.in_lru_list.store(false, Ordering::Relaxed);
            d_to.in_lru_list.store(true, Ordering::Relaxed);
        }
        d_from.bump_modify_clock();
        d_from.reset_for_free();
        self.free_list.push_front(&resolve, from);
        #[cfg(debug_assertions)]
        d_from.in_free_list.store(true, Ordering::Relaxed);
        let _ = self.free_hints.push(from);
        d_to.set_io_state(IoState::None);
        drop(_block);
        drop(guard);
        stripe.release_exclusive(&self.sync);
        Ok(true)
    }

    /// Rebuilds the uncompressed frame of a `ZipClean` block by re-reading
    /// the page, then rejoins the unzip-LRU.
    pub(super) fn materialize_zip(&self, id: PageId, idx: u32) -> Result<()> {
        let desc = self.desc(idx);
        {
            let stripe = self.hash.stripe(id);
            stripe.exclusive(&self.sync);
            let guard = self.pool_mutex.lock(&self.sync);
            let still_there = self.hash.lookup(&self.resolver(), id) == Some(idx);
            let claimed = still_there && {
                let _block = desc.mutex.lock(&self.sync);
                if desc.state() == PageState::ZipClean {
                    desc.set_state(PageState::FilePage);
                    desc.set_io_state(IoState::Reading);
                    desc.pin();
                    assert!(desc.latch.try_exclusive());
                    true
                } else {
                    false
                }
            };
            drop(guard);
            stripe.release_exclusive(&self.sync);
            if !claimed {
                // Someone else materialized or evicted it; retry the get.
                return Ok(());
            }
        }
        self.stats.inc_pages_read();
        match self.fill_frame_from_disk(idx, id) {
            Ok(()) => {
                desc.set_io_state(IoState::None);
                {
                    let _guard = self.pool_mutex.lock(&self.sync);
                    if desc.has_zip_frame() && !self.in_unzip_list(idx) {
                        self.unzip_list.push_front(&self.resolver(), idx);
                    }
                }
                desc.latch.release_exclusive(&self.sync);
                desc.unpin();
                Ok(())
            }
            Err(e) => {
                desc.set_io_state(IoState::None);
                desc.set_state(PageState::ZipClean);
                desc.latch.release_exclusive(&self.sync);
                desc.unpin();
                Err(e)
            }
        }
    }
}
