//! Dirty-page tracking and flushing.
//!
//! First dirtying links a descriptor at the flush-list head, so the list
//! stays ordered by non-increasing `oldest_modification_lsn`. During
//! recovery, redo application dirties pages out of LSN order; a B-tree
//! mirror of the list makes the ordered insert logarithmic and is dropped
//! afterwards. Batches walk the tail (oldest first) under a hazard pointer
//! so concurrent completions can unlink nodes without invalidating the
//! iterator.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::Ordering;

use crate::checksum;
use crate::error::Result;
use crate::log_debug;
use crate::page::{Lsn, Page};

use super::descriptor::{IoState, PageState};
use super::lists::{LinkKind, NIL};
use super::pool::{BufferPool, FlushKind, PoolInstance};

impl PoolInstance {
    /// Registers the first modification of a page, or just advances its
    /// newest LSN. The caller holds the block latch exclusively.
    pub(super) fn mark_dirty(&self, idx: u32, lsn: Lsn) {
        let desc = self.desc(idx);
        debug_assert!(desc.latch.is_exclusive());
        debug_assert!(lsn > 0);
        if lsn > desc.newest_lsn() {
            desc.set_newest_lsn(lsn);
        }
        if desc.oldest_lsn() != 0 {
            return;
        }
        let _flush = self.flush_list_mutex.lock(&self.sync);
        if desc.oldest_lsn() != 0 {
            return;
        }
        desc.set_oldest_lsn(lsn);
        let resolve = self.resolver();
        // SAFETY: guarded by the flush-list mutex.
        let tree = unsafe { &mut *self.recovery_tree.get() };
        if let Some(tree) = tree.as_mut() {
            // Out-of-order insert: place it right after its closest
            // larger-LSN neighbor, which sits toward the head.
            let successor = tree
                .range((Excluded((lsn, idx)), Unbounded))
                .next()
                .map(|(&(_, i), _)| i);
            match successor {
                Some(pos) => self.flush_list.insert_after(&resolve, pos, idx),
                None => self.flush_list.push_front(&resolve, idx),
            }
            tree.insert((lsn, idx), ());
        } else {
            // Dirtiers normally arrive in LSN order, but a thread can be
            // preempted between LSN allocation and this insert; walk past
            // any larger-LSN entries that won the race.
            let head = self.flush_list.head();
            if head == NIL || self.desc(head).oldest_lsn() <= lsn {
                self.flush_list.push_front(&resolve, idx);
            } else {
                let mut pos = head;
                loop {
                    let next = self.desc(pos).node(LinkKind::Flush).next();
                    if next == NIL {
                        self.flush_list.insert_after(&resolve, pos, idx);
                        break;
                    }
                    if self.desc(next).oldest_lsn() <= lsn {
                        self.flush_list.insert_before(&resolve, next, idx);
                        break;
                    }
                    pos = next;
                }
            }
        }
        #[cfg(debug_assertions)]
        desc.in_flush_list.store(true, Ordering::Relaxed);
    }

    /// Unlinks a flushed page. Caller holds the flush-list mutex; the
    /// descriptor still carries its oldest LSN.
    pub(super) fn flush_list_remove_locked(&self, idx: u32) {
        let desc = self.desc(idx);
        self.flush_hp.adjust(idx, desc.node(LinkKind::Flush).prev());
        self.flush_list.remove(&self.resolver(), idx);
        // SAFETY: guarded by the flush-list mutex.
        let tree = unsafe { &mut *self.recovery_tree.get() };
        if let Some(tree) = tree.as_mut() {
            tree.remove(&(desc.oldest_lsn(), idx));
        }
        #[cfg(debug_assertions)]
        desc.in_flush_list.store(false, Ordering::Relaxed);
    }

    /// Enables or disables the recovery-time ordered-insert mirror.
    pub(super) fn set_recovery_mode(&self, on: bool) {
        let _flush = self.flush_list_mutex.lock(&self.sync);
        // SAFETY: guarded by the flush-list mutex.
        let tree = unsafe { &mut *self.recovery_tree.get() };
        if on {
            let mut mirror = BTreeMap::new();
            let mut idx = self.flush_list.head();
            while idx != NIL {
                let desc = self.desc(idx);
                mirror.insert((desc.oldest_lsn(), idx), ());
                idx = desc.node(LinkKind::Flush).next();
            }
            *tree = Some(mirror);
        } else {
            *tree = None;
        }
    }

    // ───── batches ──────────────────────────────────────────────────────

    /// Marks a batch of `kind` as running. Only one batch per kind; a
    /// refused start returns false and the caller skips its work.
    fn begin_batch(&self, kind: FlushKind) -> bool {
        let _guard = self.pool_mutex.lock(&self.sync);
        let k = kind as usize;
        if self.init_flush[k].load(Ordering::Relaxed) {
            return false;
        }
        self.init_flush[k].store(true, Ordering::Relaxed);
        self.no_flush[k].reset();
        true
    }

    fn end_batch(&self, kind: FlushKind) {
        let _guard = self.pool_mutex.lock(&self.sync);
        let k = kind as usize;
        self.init_flush[k].store(false, Ordering::Relaxed);
        self.no_flush[k].set();
        // The batch produced clean pages; eviction scans are worthwhile
        // again.
        self.try_lru_scan.store(true, Ordering::Release);
    }

    /// Blocks until no batch of `kind` is in progress.
    pub(super) fn wait_for_no_flush(&self, kind: FlushKind) {
        self.no_flush[kind as usize].wait_until_set();
    }

    /// Flush-list batch: writes up to `max` of the oldest dirty pages.
    /// With a target, stops once every remaining page has
    /// `oldest_modification_lsn >= target`.
    pub(super) fn flush_batch(
        &self,
        kind: FlushKind,
        max: u32,
        target: Option<Lsn>,
    ) -> Result<u32> {
        if !self.begin_batch(kind) {
            return Ok(0);
        }
        let result = self.do_flush_list_batch(max, target);
        self.end_batch(kind);
        result
    }

    fn do_flush_list_batch(&self, max: u32, target: Option<Lsn>) -> Result<u32> {
        let mut count = 0;
        let mut flush_guard = self.flush_list_mutex.lock(&self.sync);
        let mut idx = self.flush_list.tail();
        while idx != NIL && count < max {
            let desc = self.desc(idx);
            if let Some(target) = target {
                // Tail-to-head LSNs are non-decreasing; nothing further to
                // do once the target is reached.
                if desc.oldest_lsn() >= target {
                    break;
                }
            }
            // Publish the next node; completions adjust it if they unlink
            // that node while we are writing.
            self.flush_hp.set(desc.node(LinkKind::Flush).prev());
            if desc.io_state() == IoState::None && desc.latch.try_shared() {
                desc.set_io_state(IoState::Writing);
                drop(flush_guard);

                let res = self.write_page_out(idx);

                flush_guard = self.flush_list_mutex.lock(&self.sync);
                match res {
                    Ok(()) => {
                        self.flush_list_remove_locked(idx);
                        desc.set_oldest_lsn(0);
                        desc.set_io_state(IoState::None);
                        desc.latch.release_shared(&self.sync);
                        self.stats.inc_pages_written();
                        count += 1;
                    }
                    Err(e) => {
                        // The page stays dirty and listed.
                        desc.set_io_state(IoState::None);
                        desc.latch.release_shared(&self.sync);
                        self.flush_hp.clear();
                        drop(flush_guard);
                        return Err(e);
                    }
                }
            }
            idx = self.flush_hp.get();
        }
        self.flush_hp.clear();
        drop(flush_guard);
        log_debug!("flush batch wrote {} pages", count);
        Ok(count)
    }

    /// LRU-tail batch: writes dirty pages near the tail so the replacement
    /// path finds clean victims.
    pub(super) fn flush_lru_tail_batch(&self, max: u32) -> Result<u32> {
        if !self.begin_batch(FlushKind::LruTail) {
            return Ok(0);
        }
        let result = (|| {
            let candidates: Vec<u32> = {
                let _guard = self.pool_mutex.lock(&self.sync);
                let resolve = self.resolver();
                let mut out = Vec::new();
                let mut scanned = 0;
                self.lru_list.for_each_from_tail(&resolve, |idx| {
                    if scanned >= self.config.flush_scan_depth || (out.len() as u32) >= max {
                        return false;
                    }
                    let desc = self.desc(idx);
                    if desc.state() == PageState::FilePage
                        && desc.is_dirty()
                        && desc.io_state() == IoState::None
                    {
                        out.push(idx);
                    }
                    scanned += 1;
                    true
                });
                out
            };
            let mut flushed = 0;
            for idx in candidates {
                if self.flush_page(idx)? {
                    flushed += 1;
                }
            }
            Ok(flushed)
        })();
        self.end_batch(FlushKind::LruTail);
        result
    }

    /// A user thread needing a free block immediately: write one dirty
    /// page near the LRU tail.
    pub(super) fn flush_one_from_lru_tail(&self) -> Result<bool> {
        let candidate = {
            let _guard = self.pool_mutex.lock(&self.sync);
            let mut idx = self.lru_list.tail();
            let mut scanned = 0;
            let mut found = None;
            while idx != NIL && scanned < self.config.flush_scan_depth {
                let desc = self.desc(idx);
                if desc.state() == PageState::FilePage
                    && desc.is_dirty()
                    && desc.io_state() == IoState::None
                {
                    found = Some(idx);
                    break;
                }
                scanned += 1;
                idx = desc.node(LinkKind::Lru).prev();
            }
            found
        };
        let Some(idx) = candidate else {
            return Ok(false);
        };
        if !self.begin_batch(FlushKind::SinglePage) {
            return Ok(false);
        }
        let result = self.flush_page(idx);
        self.end_batch(FlushKind::SinglePage);
        result
    }

    /// Writes one page out if it is still dirty and idle.
    fn flush_page(&self, idx: u32) -> Result<bool> {
        let desc = self.desc(idx);
        {
            let _flush = self.flush_list_mutex.lock(&self.sync);
            if !desc.is_dirty() || desc.io_state() != IoState::None || !desc.latch.try_shared() {
                return Ok(false);
            }
            desc.set_io_state(IoState::Writing);
        }
        let res = self.write_page_out(idx);
        let _flush = self.flush_list_mutex.lock(&self.sync);
        match res {
            Ok(()) => {
                self.flush_list_remove_locked(idx);
                desc.set_oldest_lsn(0);
                desc.set_io_state(IoState::None);
                desc.latch.release_shared(&self.sync);
                self.stats.inc_pages_written();
                Ok(true)
            }
            Err(e) => {
                desc.set_io_state(IoState::None);
                desc.latch.release_shared(&self.sync);
                Err(e)
            }
        }
    }

    /// The actual write: copy the frame, stamp checksum fields, run the
    /// encryption hook, hand the result to the I/O collaborator. The
    /// caller holds the block latch at least shared and has the
    /// descriptor in `Writing`.
    fn write_page_out(&self, idx: u32) -> Result<()> {
        let desc = self.desc(idx);
        let id = desc.id().expect("flushing a block without identity");
        let newest = desc.newest_lsn();
        // SAFETY: the shared latch excludes frame writers; `Writing`
        // excludes eviction and relocation.
        let frame = unsafe { &*desc.frame_ptr() };

        let mut slot = self.scratch.acquire();
        let mut fallback = None;
        let (comp, crypt) = match slot.as_mut() {
            Some(slot) => slot.pair(),
            None => {
                // Every scratch slot in flight; pay for a transient pair.
                let bufs =
                    fallback.insert((Box::new(Page::new_empty()), Box::new(Page::new_empty())));
                (&mut *bufs.0, &mut *bufs.1)
            }
        };
        comp.clone_from(frame);
        checksum::stamp(comp, self.config.checksum_algorithm, newest);
        let out = self.cipher.encrypt_for_write(id, comp, crypt);
        self.io.write_page(id, out, newest)
    }
}

impl BufferPool {
    /// Background or checkpoint-driven flush: one flush-list batch per
    /// instance. Returns pages written.
    pub fn flush_batch(&self, max_per_instance: u32, target: Option<Lsn>) -> Result<u64> {
        let mut written = 0;
        for instance in self.instances() {
            written += instance.flush_batch(FlushKind::FlushList, max_per_instance, target)? as u64;
        }
        Ok(written)
    }

    /// Flushes until every remaining dirty page has
    /// `oldest_modification_lsn >= target`, enabling the checkpoint to
    /// advance past it.
    pub fn flush_for_checkpoint(&self, target: Lsn) -> Result<u64> {
        let batch = self.config().flush_batch_size;
        let mut total = 0;
        loop {
            let oldest = self.oldest_modification();
            if oldest == 0 || oldest >= target {
                return Ok(total);
            }
            let written = self.flush_batch(batch, Some(target))?;
            if written == 0 {
                // Batches raced or pages were briefly latched.
                for instance in self.instances() {
                    instance.wait_for_no_flush(FlushKind::FlushList);
                }
                std::thread::yield_now();
            }
            total += written;
        }
    }

    /// Writes every dirty page out. Mostly for tests and shutdown.
    pub fn flush_all(&self) -> Result<u64> {
        self.flush_for_checkpoint(Lsn::MAX)
    }

    /// LRU-tail sweep across instances, for the background flusher.
    pub fn flush_lru_tails(&self, max_per_instance: u32) -> Result<u64> {
        let mut written = 0;
        for instance in self.instances() {
            written += instance.flush_lru_tail_batch(max_per_instance)? as u64;
        }
        Ok(written)
    }

    /// Blocks until no batch of `kind` runs in any instance.
    pub fn wait_for_no_flush(&self, kind: FlushKind) {
        for instance in self.instances() {
            instance.wait_for_no_flush(kind);
        }
    }

    /// Switches the recovery-time ordered flush-list insertion on or off.
    pub fn set_recovery_mode(&self, on: bool) {
        for instance in self.instances() {
            instance.set_recovery_mode(on);
        }
    }
}
