//! Spinning mutex for short critical sections.
//!
//! The fast path is a single compare-and-swap. Contended acquisition spins a
//! bounded number of rounds with randomized pauses, then parks through the
//! wait array. Release is a plain store plus an event set when waiters were
//! announced; the periodic unstick sweep covers the release/announce race.

use std::panic::Location;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::Rng;

use crate::sync::event::Event;
use crate::sync::wait_array::{RequestKind, WaitObject};
use crate::sync::{thread_id, SyncContext};

/// Spin rounds before giving up and reserving a wait-array cell.
const SPIN_ROUNDS: u32 = 30;
/// Maximum randomized pause iterations between lock-word polls.
const SPIN_DELAY: u32 = 6;

/// Randomized pause between lock-word polls, so contending spinners fall
/// out of lock-step.
#[inline]
pub(crate) fn spin_delay() {
    for _ in 0..rand::rng().random_range(0..=SPIN_DELAY) {
        std::hint::spin_loop();
    }
}

pub struct Mutex {
    lock_word: AtomicU32,
    waiters: AtomicU32,
    /// Thread id of the current holder, for diagnostics and deadlock
    /// analysis. 0 when unlocked (or not yet recorded).
    holder: AtomicU64,
    event: Event,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            lock_word: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            holder: AtomicU64::new(0),
            event: Event::new(),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.lock_word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn try_lock<'a>(&'a self, sync: &'a SyncContext) -> Option<MutexGuard<'a>> {
        if self.try_acquire() {
            self.holder.store(thread_id(), Ordering::Relaxed);
            Some(MutexGuard { mutex: self, sync })
        } else {
            None
        }
    }

    #[track_caller]
    pub fn lock<'a>(&'a self, sync: &'a SyncContext) -> MutexGuard<'a> {
        let location = Location::caller();
        loop {
            // Spin phase.
            for _ in 0..SPIN_ROUNDS {
                if self.lock_word.load(Ordering::Relaxed) == 0 {
                    if let Some(guard) = self.try_lock(sync) {
                        return guard;
                    }
                }
                spin_delay();
            }
            std::thread::yield_now();

            let Ok(res) = sync.reserve(WaitObject::Mutex(self), RequestKind::Mutex, location)
            else {
                // Array exhausted; back off and spin again.
                std::thread::sleep(std::time::Duration::from_micros(100));
                continue;
            };
            // Announce before the final re-check so the unlocker either sees
            // the flag or we see the zero lock word.
            self.waiters.store(1, Ordering::SeqCst);
            if let Some(guard) = self.try_lock(sync) {
                sync.free_cell(res);
                return guard;
            }
            sync.wait(res);
        }
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock_word.load(Ordering::Acquire) != 0
    }

    pub(crate) fn holder_thread(&self) -> u64 {
        self.holder.load(Ordering::Relaxed)
    }

    pub(crate) fn event(&self) -> &Event {
        &self.event
    }

    fn unlock(&self, sync: &SyncContext) {
        self.holder.store(0, Ordering::Relaxed);
        self.lock_word.store(0, Ordering::SeqCst);
        if self.waiters.swap(0, Ordering::SeqCst) != 0 {
            self.event.set();
            sync.object_signalled();
        }
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("holder", &self.holder_thread())
            .finish()
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    sync: &'a SyncContext,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.sync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_lock_excludes() {
        let sync = SyncContext::new(2, 8);
        let mutex = Mutex::new();
        let counter = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = mutex.lock(&sync);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_try_lock() {
        let sync = SyncContext::new(1, 4);
        let mutex = Mutex::new();
        let guard = mutex.try_lock(&sync).unwrap();
        assert!(mutex.try_lock(&sync).is_none());
        drop(guard);
        assert!(mutex.try_lock(&sync).is_some());
    }

    #[test]
    fn test_holder_recorded() {
        let sync = SyncContext::new(1, 4);
        let mutex = Mutex::new();
        let guard = mutex.lock(&sync);
        assert_eq!(mutex.holder_thread(), thread_id());
        drop(guard);
        assert_eq!(mutex.holder_thread(), 0);
    }
}
