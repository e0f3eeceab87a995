//! Reader/writer latch with a biased lock word.
//!
//! The lock word starts at `X_LOCK_DECR` and encodes the whole state in one
//! atomic:
//!
//! * `== X_LOCK_DECR` — unlocked.
//! * `(0, X_LOCK_DECR)` — `X_LOCK_DECR - lock_word` readers.
//! * `== 0` — one writer, no recursion.
//! * `(-X_LOCK_DECR, 0)` — a writer claimed the latch and is draining
//!   `-lock_word` residual readers.
//! * `<= -X_LOCK_DECR` — writer recursion levels.
//!
//! Shared acquisition is a decrement-if-positive; exclusive acquisition
//! claims the whole `X_LOCK_DECR` in one step and, when readers remain,
//! parks with the dedicated `RwWaitExclusive` request until the word drains
//! to zero. Recursion and upgrade are permitted for the owning thread only.

use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::sync::event::Event;
use crate::sync::mutex::spin_delay;
use crate::sync::wait_array::{RequestKind, WaitObject};
use crate::sync::{thread_id, SyncContext};

pub const X_LOCK_DECR: i32 = 0x0010_0000;

const SPIN_ROUNDS: u32 = 30;

/// Debug-build holder bookkeeping, consumed by deadlock analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HolderKind {
    Shared,
    Exclusive,
    WaitExclusive,
}

/// Outcome of one exclusive claim attempt.
enum Claim {
    /// Ownership is immediate: the latch was free, or this is recursion.
    Immediate,
    /// The lock word is claimed but residual readers must drain.
    Draining,
}

pub struct RwLatch {
    lock_word: AtomicI32,
    waiters: AtomicU32,
    /// True while `writer_thread` may be trusted for the recursion check.
    /// Cleared by the last exclusive release *before* the lock word is
    /// restored, so a stale id can never enable false recursion.
    recursive: AtomicBool,
    writer_thread: AtomicU64,
    /// Shared and exclusive waiters sleep here.
    event: Event,
    /// The claiming writer drains residual readers here.
    wait_ex_event: Event,
    #[cfg(debug_assertions)]
    holders: std::sync::Mutex<Vec<(u64, HolderKind)>>,
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLatch {
    pub fn new() -> Self {
        RwLatch {
            lock_word: AtomicI32::new(X_LOCK_DECR),
            waiters: AtomicU32::new(0),
            recursive: AtomicBool::new(false),
            writer_thread: AtomicU64::new(0),
            event: Event::new(),
            wait_ex_event: Event::new(),
            #[cfg(debug_assertions)]
            holders: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Subtracts `amount` from the lock word iff it is positive. Returns
    /// the previous value on success.
    #[inline]
    fn lock_word_decr(&self, amount: i32) -> Option<i32> {
        let mut v = self.lock_word.load(Ordering::Relaxed);
        loop {
            if v <= 0 {
                return None;
            }
            match self.lock_word.compare_exchange_weak(
                v,
                v - amount,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Some(prev),
                Err(actual) => v = actual,
            }
        }
    }

    // ── shared ──────────────────────────────────────────────────────────

    #[inline]
    pub fn try_shared(&self) -> bool {
        if self.lock_word_decr(1).is_some() {
            self.add_holder(HolderKind::Shared);
            true
        } else {
            false
        }
    }

    #[track_caller]
    pub fn shared(&self, sync: &SyncContext) {
        let location = Location::caller();
        loop {
            for _ in 0..SPIN_ROUNDS {
                if self.try_shared() {
                    return;
                }
                spin_delay();
            }
            std::thread::yield_now();

            let Ok(res) = sync.reserve(WaitObject::Rw(self), RequestKind::RwShared, location)
            else {
                std::thread::sleep(std::time::Duration::from_micros(100));
                continue;
            };
            self.waiters.store(1, Ordering::SeqCst);
            if self.try_shared() {
                sync.free_cell(res);
                return;
            }
            sync.wait(res);
        }
    }

    pub fn release_shared(&self, sync: &SyncContext) {
        self.remove_holder(HolderKind::Shared);
        let new = self.lock_word.fetch_add(1, Ordering::Release) + 1;
        if new == 0 {
            // Last residual reader: the claiming writer may proceed.
            self.wait_ex_event.set();
            sync.object_signalled();
        } else if new == X_LOCK_DECR && self.waiters.swap(0, Ordering::SeqCst) != 0 {
            self.event.set();
            sync.object_signalled();
        }
    }

    // ── exclusive ───────────────────────────────────────────────────────

    /// Claims the lock word or recurses, without draining readers. The
    /// caller finishes a `Draining` claim with `wait_for_readers`.
    fn try_claim(&self) -> Option<Claim> {
        if let Some(prev) = self.lock_word_decr(X_LOCK_DECR) {
            self.writer_thread.store(thread_id(), Ordering::Relaxed);
            self.recursive.store(true, Ordering::Release);
            if prev == X_LOCK_DECR {
                self.add_holder(HolderKind::Exclusive);
                Some(Claim::Immediate)
            } else {
                self.add_holder(HolderKind::WaitExclusive);
                Some(Claim::Draining)
            }
        } else if self.recursive.load(Ordering::Acquire)
            && self.writer_thread.load(Ordering::Relaxed) == thread_id()
        {
            // Writer recursion: one more level.
            self.lock_word.fetch_sub(X_LOCK_DECR, Ordering::Relaxed);
            self.add_holder(HolderKind::Exclusive);
            Some(Claim::Immediate)
        } else {
            None
        }
    }

    /// Blocks until every residual reader has released. Only the thread
    /// that claimed the lock word may call this.
    fn wait_for_readers(&self, sync: &SyncContext, location: &'static Location<'static>) {
        loop {
            for _ in 0..SPIN_ROUNDS {
                if self.lock_word.load(Ordering::Acquire) == 0 {
                    return;
                }
                spin_delay();
            }
            let Ok(res) =
                sync.reserve(WaitObject::Rw(self), RequestKind::RwWaitExclusive, location)
            else {
                std::thread::sleep(std::time::Duration::from_micros(100));
                continue;
            };
            if self.lock_word.load(Ordering::Acquire) == 0 {
                sync.free_cell(res);
                return;
            }
            sync.wait(res);
        }
    }

    #[inline]
    pub fn try_exclusive(&self) -> bool {
        if self
            .lock_word
            .compare_exchange(X_LOCK_DECR, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.writer_thread.store(thread_id(), Ordering::Relaxed);
            self.recursive.store(true, Ordering::Release);
            self.add_holder(HolderKind::Exclusive);
            true
        } else {
            self.recursive.load(Ordering::Acquire)
                && self.writer_thread.load(Ordering::Relaxed) == thread_id()
                && {
                    self.lock_word.fetch_sub(X_LOCK_DECR, Ordering::Relaxed);
                    self.add_holder(HolderKind::Exclusive);
                    true
                }
        }
    }

    #[track_caller]
    pub fn exclusive(&self, sync: &SyncContext) {
        let location = Location::caller();
        let claim = 'claimed: loop {
            for _ in 0..SPIN_ROUNDS {
                if let Some(claim) = self.try_claim() {
                    break 'claimed claim;
                }
                spin_delay();
            }
            std::thread::yield_now();

            let Ok(res) = sync.reserve(WaitObject::Rw(self), RequestKind::RwExclusive, location)
            else {
                std::thread::sleep(std::time::Duration::from_micros(100));
                continue;
            };
            self.waiters.store(1, Ordering::SeqCst);
            if let Some(claim) = self.try_claim() {
                sync.free_cell(res);
                break 'claimed claim;
            }
            sync.wait(res);
        };
        if let Claim::Draining = claim {
            self.wait_for_readers(sync, location);
            self.swap_holder(HolderKind::WaitExclusive, HolderKind::Exclusive);
        }
    }

    pub fn release_exclusive(&self, sync: &SyncContext) {
        self.remove_holder(HolderKind::Exclusive);
        if self.lock_word.load(Ordering::Relaxed) == 0 {
            // Last level: disarm recursion before the latch becomes
            // grabbable again.
            self.recursive.store(false, Ordering::Relaxed);
        }
        let new = self.lock_word.fetch_add(X_LOCK_DECR, Ordering::Release) + X_LOCK_DECR;
        if new == X_LOCK_DECR && self.waiters.swap(0, Ordering::SeqCst) != 0 {
            self.event.set();
            sync.object_signalled();
        }
    }

    // ── conversions ─────────────────────────────────────────────────────

    /// Upgrades a single shared holder to exclusive. Fails when other
    /// readers or a writer claim are present.
    pub fn try_upgrade(&self) -> bool {
        if self
            .lock_word
            .compare_exchange(X_LOCK_DECR - 1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.writer_thread.store(thread_id(), Ordering::Relaxed);
            self.recursive.store(true, Ordering::Release);
            self.swap_holder(HolderKind::Shared, HolderKind::Exclusive);
            true
        } else {
            false
        }
    }

    /// Converts a single-level exclusive hold into a shared hold.
    pub fn downgrade(&self, sync: &SyncContext) {
        self.swap_holder(HolderKind::Exclusive, HolderKind::Shared);
        self.recursive.store(false, Ordering::Relaxed);
        let new = self
            .lock_word
            .fetch_add(X_LOCK_DECR - 1, Ordering::Release)
            + (X_LOCK_DECR - 1);
        debug_assert_eq!(new, X_LOCK_DECR - 1);
        // Other readers may enter now.
        if self.waiters.swap(0, Ordering::SeqCst) != 0 {
            self.event.set();
            sync.object_signalled();
        }
    }

    // ── observers ───────────────────────────────────────────────────────

    #[inline]
    pub(crate) fn lock_word(&self) -> i32 {
        self.lock_word.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_word() != X_LOCK_DECR
    }

    pub fn is_exclusive(&self) -> bool {
        self.lock_word() <= 0
    }

    pub fn reader_count(&self) -> i32 {
        let v = self.lock_word();
        if v > 0 && v < X_LOCK_DECR {
            X_LOCK_DECR - v
        } else {
            0
        }
    }

    pub(crate) fn writer_thread(&self) -> u64 {
        self.writer_thread.load(Ordering::Relaxed)
    }

    pub(crate) fn event(&self) -> &Event {
        &self.event
    }

    pub(crate) fn wait_ex_event(&self) -> &Event {
        &self.wait_ex_event
    }

    // ── debug holder list ───────────────────────────────────────────────

    #[cfg(debug_assertions)]
    pub(crate) fn debug_holders(&self) -> Vec<(u64, HolderKind)> {
        self.holders.lock().unwrap().clone()
    }

    #[inline]
    fn add_holder(&self, _kind: HolderKind) {
        #[cfg(debug_assertions)]
        self.holders.lock().unwrap().push((thread_id(), _kind));
    }

    #[inline]
    fn remove_holder(&self, _kind: HolderKind) {
        #[cfg(debug_assertions)]
        {
            let mut holders = self.holders.lock().unwrap();
            let me = thread_id();
            let pos = holders
                .iter()
                .rposition(|&(t, k)| t == me && k == _kind)
                .expect("releasing a latch not held in this mode");
            holders.remove(pos);
        }
    }

    #[inline]
    fn swap_holder(&self, _from: HolderKind, _to: HolderKind) {
        #[cfg(debug_assertions)]
        {
            self.remove_holder(_from);
            self.add_holder(_to);
        }
    }
}

impl std::fmt::Debug for RwLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLatch")
            .field("lock_word", &self.lock_word())
            .field("readers", &self.reader_count())
            .field("writer_thread", &self.writer_thread())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_shared_allows_many_readers() {
        let sync = SyncContext::new(1, 8);
        let latch = RwLatch::new();
        latch.shared(&sync);
        latch.shared(&sync);
        assert_eq!(latch.reader_count(), 2);
        assert!(!latch.try_exclusive());
        latch.release_shared(&sync);
        latch.release_shared(&sync);
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_exclusive_excludes() {
        let sync = SyncContext::new(1, 8);
        let latch = RwLatch::new();
        latch.exclusive(&sync);
        assert!(latch.is_exclusive());
        assert!(!latch.try_shared());
        latch.release_exclusive(&sync);
        assert!(latch.try_shared());
        latch.release_shared(&sync);
    }

    #[test]
    fn test_writer_recursion() {
        let sync = SyncContext::new(1, 8);
        let latch = RwLatch::new();
        latch.exclusive(&sync);
        latch.exclusive(&sync);
        assert_eq!(latch.lock_word(), -X_LOCK_DECR);
        latch.release_exclusive(&sync);
        assert!(latch.is_exclusive());
        latch.release_exclusive(&sync);
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let sync = SyncContext::new(1, 8);
        let latch = RwLatch::new();
        latch.shared(&sync);
        assert!(latch.try_upgrade());
        assert!(latch.is_exclusive());
        latch.downgrade(&sync);
        assert_eq!(latch.reader_count(), 1);
        latch.release_shared(&sync);
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_upgrade_fails_with_two_readers() {
        let sync = SyncContext::new(1, 8);
        let latch = RwLatch::new();
        latch.shared(&sync);
        latch.shared(&sync);
        assert!(!latch.try_upgrade());
        latch.release_shared(&sync);
        latch.release_shared(&sync);
    }

    #[test]
    fn test_writer_drains_readers() {
        let sync = SyncContext::new(2, 16);
        let latch = RwLatch::new();
        let running = AtomicUsize::new(0);

        thread::scope(|s| {
            latch.shared(&sync);
            let writer = s.spawn(|| {
                latch.exclusive(&sync);
                running.fetch_add(1, Ordering::SeqCst);
                latch.release_exclusive(&sync);
            });
            // The writer must be stuck until the reader releases.
            thread::sleep(std::time::Duration::from_millis(30));
            assert_eq!(running.load(Ordering::SeqCst), 0);
            latch.release_shared(&sync);
            writer.join().unwrap();
            assert_eq!(running.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_readers_and_writers_counter() {
        let sync = SyncContext::new(2, 64);
        let latch = RwLatch::new();
        let counter = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        latch.exclusive(&sync);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        latch.release_exclusive(&sync);
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        latch.shared(&sync);
                        let _ = counter.load(Ordering::Relaxed);
                        latch.release_shared(&sync);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
        assert!(!latch.is_locked());
    }
}
