//! Synchronization substrate: wait array, events, and the custom latches
//! built on them.

mod event;
mod mutex;
mod rwlatch;
mod wait_array;

pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use rwlatch::{RwLatch, X_LOCK_DECR};
pub use wait_array::NoCell;

pub(crate) use wait_array::{RequestKind, Reservation, WaitObject};

use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use wait_array::WaitArraySet;

use crate::log_error;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique dense id of the calling thread. Cheaper and more compact
/// than `std::thread::ThreadId`, and representable in atomics and wait
/// cells.
#[inline]
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a process-wide monotonic clock. Used for access
/// timestamps and LRU age decisions.
#[inline]
pub fn now_ms() -> u64 {
    CLOCK_ANCHOR
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis() as u64
}

/// Default long-wait warn threshold, seconds.
pub const LONG_WAIT_WARN_SECS: u64 = 240;

/// The engine-wide synchronization context: the partitioned wait array and
/// its counters. Threaded explicitly through every latch acquisition.
pub struct SyncContext {
    arrays: WaitArraySet,
}

impl SyncContext {
    pub fn new(n_arrays: usize, cells_per_array: usize) -> Self {
        SyncContext {
            arrays: WaitArraySet::new(n_arrays, cells_per_array),
        }
    }

    pub(crate) fn reserve(
        &self,
        object: WaitObject,
        kind: RequestKind,
        location: &'static Location<'static>,
    ) -> Result<Reservation, NoCell> {
        self.arrays.reserve(object, kind, location)
    }

    pub(crate) fn wait(&self, res: Reservation) {
        self.arrays.wait(res);
    }

    pub(crate) fn free_cell(&self, res: Reservation) {
        self.arrays.free_cell(res);
    }

    pub(crate) fn object_signalled(&self) {
        self.arrays.object_signalled();
    }

    pub(crate) fn arrays(&self) -> &WaitArraySet {
        &self.arrays
    }

    pub fn signalled_count(&self) -> u64 {
        self.arrays.signalled_count()
    }

    pub fn reservation_count(&self) -> u64 {
        self.arrays.reservation_count()
    }

    /// One monitor beat: run the unstick sweep, then the long-wait report.
    /// Returns true when the fatal threshold was exceeded; the monitor
    /// thread must then dump diagnostics and abort.
    pub fn monitor_tick(&self, fatal: Duration) -> bool {
        self.arrays.wake_threads_if_free();
        let fatal_hit = self
            .arrays
            .print_long_waits(Duration::from_secs(LONG_WAIT_WARN_SECS).min(fatal), fatal);
        if fatal_hit {
            log_error!("{}", self.print_info());
        }
        fatal_hit
    }

    pub fn validate(&self) {
        self.arrays.validate();
    }

    pub fn print_info(&self) -> String {
        self.arrays.print_info()
    }

    #[cfg(debug_assertions)]
    pub fn detect_deadlocks(&self) -> bool {
        self.arrays.detect_deadlocks()
    }

    #[cfg(debug_assertions)]
    pub fn set_abort_on_deadlock(&self, abort: bool) {
        self.arrays.set_abort_on_deadlock(abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_thread_ids_distinct() {
        let mine = thread_id();
        assert_ne!(mine, 0);
        let other = thread::spawn(thread_id).join().unwrap();
        assert_ne!(mine, other);
        // Stable within a thread.
        assert_eq!(mine, thread_id());
    }

    #[test]
    fn test_monitor_tick_quiet() {
        let sync = SyncContext::new(2, 4);
        assert!(!sync.monitor_tick(Duration::from_secs(600)));
        sync.validate();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_deadlock_detected_between_two_latches() {
        let sync = Arc::new(SyncContext::new(1, 8));
        sync.set_abort_on_deadlock(false);

        // Latches leak deliberately: the deadlocked threads below never
        // exit, so the latches must outlive the test.
        let a: &'static RwLatch = Box::leak(Box::new(RwLatch::new()));
        let b: &'static RwLatch = Box::leak(Box::new(RwLatch::new()));

        {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                a.exclusive(&sync);
                thread::sleep(Duration::from_millis(50));
                b.shared(&sync); // blocks on the other writer forever
            });
        }
        {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                b.exclusive(&sync);
                thread::sleep(Duration::from_millis(50));
                a.exclusive(&sync); // blocks forever
            });
        }

        // Give both threads time to block on each other.
        let mut found = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(20));
            if sync.detect_deadlocks() {
                found = true;
                break;
            }
        }
        assert!(found, "deadlock not detected");
    }
}
