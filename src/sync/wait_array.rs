//! The wait array: a bounded registry of suspended threads.
//!
//! The custom latches keep their fast paths atomic-only and delegate
//! suspension here. A thread that must block reserves a cell recording the
//! latch it waits for and the request kind, re-checks the latch, then waits
//! on the latch's embedded event. A monitor sweep signals events for cells
//! whose latch has since become available, which closes the missed-wakeup
//! race left open by the release paths' unordered flag accesses, and the
//! same sweep produces long-wait diagnostics and (in debug builds) deadlock
//! detection.

use std::fmt::Write as _;
use std::panic::Location;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use crate::sync::event::Event;
use crate::sync::mutex::Mutex;
#[cfg(debug_assertions)]
use crate::sync::rwlatch::HolderKind;
use crate::sync::rwlatch::{RwLatch, X_LOCK_DECR};
use crate::sync::thread_id;
use crate::{log_error, log_warn};

/// What a reserved cell is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Mutex,
    RwShared,
    RwExclusive,
    /// Writer that already claimed the lock word and is draining residual
    /// readers. Kept distinct from `RwExclusive` so wake-up predicates and
    /// deadlock analysis can tell "claimed, draining" from "not yet
    /// claimed".
    RwWaitExclusive,
}

/// Raw reference to the latch a cell waits on.
///
/// SAFETY invariant: the pointer is only dereferenced while the cell is
/// reserved, and a reserved cell implies the reserving thread is still
/// inside the latch acquisition call that borrowed the latch, so the latch
/// is alive.
#[derive(Clone, Copy)]
pub(crate) enum WaitObject {
    Mutex(*const Mutex),
    Rw(*const RwLatch),
}

unsafe impl Send for WaitObject {}
unsafe impl Sync for WaitObject {}

impl WaitObject {
    pub(crate) fn addr(&self) -> usize {
        match self {
            WaitObject::Mutex(p) => *p as usize,
            WaitObject::Rw(p) => *p as usize,
        }
    }

    /// The event a waiter with `kind` sleeps on. Shared and exclusive
    /// requests share the rw-latch's main event; a draining writer has its
    /// own.
    fn event(&self, kind: RequestKind) -> *const Event {
        match (self, kind) {
            (WaitObject::Mutex(p), _) => {
                // SAFETY: see type invariant.
                unsafe { (**p).event() as *const Event }
            }
            (WaitObject::Rw(p), RequestKind::RwWaitExclusive) => unsafe {
                (**p).wait_ex_event() as *const Event
            },
            (WaitObject::Rw(p), _) => unsafe { (**p).event() as *const Event },
        }
    }

    /// Release predicate for the periodic unstick sweep.
    fn can_wake(&self, kind: RequestKind) -> bool {
        match (self, kind) {
            (WaitObject::Mutex(p), _) => {
                // SAFETY: see type invariant.
                unsafe { !(**p).is_locked() }
            }
            (WaitObject::Rw(p), RequestKind::RwShared)
            | (WaitObject::Rw(p), RequestKind::RwExclusive) => {
                // Unlocked or only read locked.
                unsafe { (**p).lock_word() > 0 }
            }
            (WaitObject::Rw(p), RequestKind::RwWaitExclusive) => {
                // All residual readers have left.
                unsafe { (**p).lock_word() == 0 }
            }
            (WaitObject::Rw(_), RequestKind::Mutex) => unreachable!(),
        }
    }
}

struct WaitCell {
    object: Option<WaitObject>,
    request: RequestKind,
    thread: u64,
    /// True once the reserving thread has committed to sleeping.
    waiting: bool,
    signal_gen: u64,
    reserved_at: Instant,
    location: &'static Location<'static>,
}

impl WaitCell {
    fn empty() -> Self {
        WaitCell {
            object: None,
            request: RequestKind::Mutex,
            thread: 0,
            waiting: false,
            signal_gen: 0,
            reserved_at: Instant::now(),
            location: Location::caller(),
        }
    }

    fn describe(&self, out: &mut String) {
        let Some(object) = self.object else {
            return;
        };
        let _ = write!(
            out,
            "--Thread {} has waited at {}:{} for {:.2} seconds: ",
            self.thread,
            self.location.file(),
            self.location.line(),
            self.reserved_at.elapsed().as_secs_f64(),
        );
        match (object, self.request) {
            (WaitObject::Mutex(p), _) => {
                // SAFETY: cell is reserved (checked above) under the array
                // mutex, so the latch is alive.
                let m = unsafe { &*p };
                let _ = write!(
                    out,
                    "mutex at {:#x}, lock word {}, holder thread {}",
                    object.addr(),
                    m.is_locked() as u32,
                    m.holder_thread(),
                );
            }
            (WaitObject::Rw(p), kind) => {
                let rw = unsafe { &*p };
                let mode = match kind {
                    RequestKind::RwShared => "S-lock",
                    RequestKind::RwExclusive => "X-lock",
                    RequestKind::RwWaitExclusive => "X-lock (wait_ex)",
                    RequestKind::Mutex => unreachable!(),
                };
                let word = rw.lock_word();
                let readers = if word > 0 && word < X_LOCK_DECR {
                    X_LOCK_DECR - word
                } else {
                    0
                };
                let _ = write!(
                    out,
                    "{} on rw-latch at {:#x}, lock word {:#x}, readers {}, writer thread {}",
                    mode,
                    object.addr(),
                    word,
                    readers,
                    rw.writer_thread(),
                );
            }
        }
        if !self.waiting {
            let _ = write!(out, " (wait has ended)");
        }
        let _ = writeln!(out);
    }
}

struct ArrayInner {
    cells: Vec<WaitCell>,
    n_reserved: usize,
    /// Count of reservations since creation.
    res_count: u64,
}

// SAFETY: the raw latch pointers inside cells are only dereferenced while
// the cell is reserved; see the WaitObject invariant.
unsafe impl Send for ArrayInner {}

/// One wait-array instance. The protecting mutex is a plain OS mutex: this
/// structure is used to build the engine's own mutexes, so it cannot depend
/// on them.
pub(crate) struct WaitArray {
    inner: StdMutex<ArrayInner>,
}

/// Handle to a reserved cell.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reservation {
    pub(crate) array: usize,
    pub(crate) index: usize,
}

/// Every cell of the chosen arrays was occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoCell;

impl WaitArray {
    pub(crate) fn new(n_cells: usize) -> Self {
        assert!(n_cells > 0);
        let cells = (0..n_cells).map(|_| WaitCell::empty()).collect();
        WaitArray {
            inner: StdMutex::new(ArrayInner {
                cells,
                n_reserved: 0,
                res_count: 0,
            }),
        }
    }

    /// Records `(object, kind, current thread)` in a free cell and resets
    /// the object's event, snapshotting its generation. Returns the cell
    /// index, or `NoCell` when the array is full.
    fn reserve_cell(
        &self,
        object: WaitObject,
        kind: RequestKind,
        location: &'static Location<'static>,
    ) -> Result<usize, NoCell> {
        let mut inner = self.inner.lock().unwrap();
        inner.res_count += 1;
        let slot = inner.cells.iter().position(|c| c.object.is_none());
        let Some(index) = slot else {
            return Err(NoCell);
        };
        // The event must be reset while the cell is visible as reserved so
        // the unstick sweep cannot set it for a previous occupant.
        let generation = unsafe { &*object.event(kind) }.reset();
        let cell = &mut inner.cells[index];
        cell.object = Some(object);
        cell.request = kind;
        cell.thread = thread_id();
        cell.waiting = false;
        cell.signal_gen = generation;
        cell.reserved_at = Instant::now();
        cell.location = location;
        inner.n_reserved += 1;
        Ok(index)
    }

    /// Marks the cell waiting and returns what the caller needs to block
    /// outside the array mutex.
    fn begin_wait(&self, index: usize) -> (*const Event, u64) {
        let mut inner = self.inner.lock().unwrap();
        let cell = &mut inner.cells[index];
        let object = cell.object.expect("waiting on a free cell");
        assert!(!cell.waiting);
        debug_assert_eq!(cell.thread, thread_id());
        cell.waiting = true;
        (object.event(cell.request), cell.signal_gen)
    }

    fn free_cell(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        let cell = &mut inner.cells[index];
        assert!(cell.object.is_some());
        cell.object = None;
        cell.waiting = false;
        cell.signal_gen = 0;
        assert!(inner.n_reserved > 0);
        inner.n_reserved -= 1;
    }

    /// The unstick sweep: signal every reserved cell whose latch now
    /// satisfies its release predicate. Returns how many events were set.
    fn wake_if_free(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut signalled = 0;
        let mut seen = 0;
        for cell in &inner.cells {
            if seen == inner.n_reserved {
                break;
            }
            let Some(object) = cell.object else { continue };
            seen += 1;
            if object.can_wake(cell.request) {
                // SAFETY: cell reserved, array mutex held.
                unsafe { &*object.event(cell.request) }.set();
                signalled += 1;
            }
        }
        signalled
    }

    /// Long-wait report. Appends warnings to `report` for waits past
    /// `warn`, and returns true if any wait exceeded `fatal`.
    fn long_waits(&self, warn: Duration, fatal: Duration, report: &mut String) -> bool {
        let inner = self.inner.lock().unwrap();
        let mut is_fatal = false;
        for cell in &inner.cells {
            if cell.object.is_none() || !cell.waiting {
                continue;
            }
            let elapsed = cell.reserved_at.elapsed();
            if elapsed > warn {
                cell.describe(report);
            }
            if elapsed > fatal {
                is_fatal = true;
            }
        }
        is_fatal
    }

    fn validate(&self) {
        let inner = self.inner.lock().unwrap();
        let reserved = inner.cells.iter().filter(|c| c.object.is_some()).count();
        assert_eq!(reserved, inner.n_reserved);
    }

    fn info(&self, out: &mut String) {
        let inner = self.inner.lock().unwrap();
        let _ = writeln!(
            out,
            "wait array: {} cells, {} reserved, reservation count {}",
            inner.cells.len(),
            inner.n_reserved,
            inner.res_count
        );
        let mut seen = 0;
        for cell in &inner.cells {
            if seen == inner.n_reserved {
                break;
            }
            if cell.object.is_some() {
                seen += 1;
                cell.describe(out);
            }
        }
    }

    fn res_count(&self) -> u64 {
        self.inner.lock().unwrap().res_count
    }
}

/// The partitioned wait array plus the signalled counter; one per engine
/// context. Arrays are picked round-robin per reservation.
pub struct WaitArraySet {
    arrays: Vec<WaitArray>,
    next: std::sync::atomic::AtomicUsize,
    sg_count: std::sync::atomic::AtomicU64,
    /// Debug-test control: when false, a detected deadlock is logged but
    /// the process is not aborted.
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    abort_on_deadlock: std::sync::atomic::AtomicBool,
}

impl WaitArraySet {
    pub(crate) fn new(n_arrays: usize, cells_per_array: usize) -> Self {
        assert!(n_arrays > 0);
        WaitArraySet {
            arrays: (0..n_arrays).map(|_| WaitArray::new(cells_per_array)).collect(),
            next: std::sync::atomic::AtomicUsize::new(0),
            sg_count: std::sync::atomic::AtomicU64::new(0),
            abort_on_deadlock: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub(crate) fn reserve(
        &self,
        object: WaitObject,
        kind: RequestKind,
        location: &'static Location<'static>,
    ) -> Result<Reservation, NoCell> {
        use std::sync::atomic::Ordering;
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.arrays.len() {
            let array = (start + i) % self.arrays.len();
            if let Ok(index) = self.arrays[array].reserve_cell(object, kind, location) {
                return Ok(Reservation { array, index });
            }
        }
        Err(NoCell)
    }

    /// Blocks until the reserved cell's event advances past the generation
    /// snapshotted at reservation, then frees the cell. In debug builds a
    /// deadlock check runs first.
    pub(crate) fn wait(&self, res: Reservation) {
        let (event, generation) = self.arrays[res.array].begin_wait(res.index);
        #[cfg(debug_assertions)]
        {
            if self.deadlock_check_from(res) {
                if self.abort_on_deadlock.load(std::sync::atomic::Ordering::Relaxed) {
                    std::process::abort();
                }
            }
        }
        // SAFETY: we reserved the cell and still borrow the latch, so the
        // event is alive.
        unsafe { &*event }.wait(generation);
        self.free_cell(res);
    }

    /// Race-recovery path: the latch became available between reservation
    /// and wait, so just release the cell.
    pub(crate) fn free_cell(&self, res: Reservation) {
        self.arrays[res.array].free_cell(res.index);
    }

    /// Counts one event signalled by a latch release path.
    pub(crate) fn object_signalled(&self) {
        self.sg_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn signalled_count(&self) -> u64 {
        self.sg_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn reservation_count(&self) -> u64 {
        self.arrays.iter().map(|a| a.res_count()).sum()
    }

    /// The periodic unstick sweep (≈1 Hz from the monitor thread).
    pub fn wake_threads_if_free(&self) {
        for array in &self.arrays {
            let n = array.wake_if_free();
            self.sg_count
                .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Warns about long waits; returns true when a wait exceeded the fatal
    /// threshold and the caller must abort the process.
    pub fn print_long_waits(&self, warn: Duration, fatal: Duration) -> bool {
        let mut report = String::new();
        let mut is_fatal = false;
        for array in &self.arrays {
            if array.long_waits(warn, fatal, &mut report) {
                is_fatal = true;
            }
        }
        if !report.is_empty() {
            log_warn!("long semaphore waits:\n{report}");
            if is_fatal {
                log_error!("fatal semaphore wait threshold exceeded:\n{report}");
            }
            // Keep diagnostics visible even without the log features.
            if is_fatal {
                eprintln!("fatal semaphore wait threshold exceeded:\n{report}");
            }
        }
        is_fatal
    }

    /// Asserts that the number of non-free cells equals each array's
    /// reservation bookkeeping.
    pub fn validate(&self) {
        for array in &self.arrays {
            array.validate();
        }
    }

    pub fn print_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "signalled count {}", self.signalled_count());
        for array in &self.arrays {
            array.info(&mut out);
        }
        out
    }

    #[cfg(debug_assertions)]
    pub fn set_abort_on_deadlock(&self, abort: bool) {
        self.abort_on_deadlock
            .store(abort, std::sync::atomic::Ordering::Relaxed);
    }
}

// ───── deadlock detection (debug builds) ────────────────────────────────────

#[cfg(debug_assertions)]
#[derive(Clone, Copy)]
struct CellView {
    object: WaitObject,
    request: RequestKind,
    thread: u64,
    waiting: bool,
}

#[cfg(debug_assertions)]
impl WaitArraySet {
    /// Snapshot every reserved cell. Array mutexes are taken in index
    /// order, so two concurrent detectors cannot deadlock on them.
    fn snapshot(&self) -> Vec<CellView> {
        let mut view = Vec::new();
        for array in &self.arrays {
            let inner = array.inner.lock().unwrap();
            for cell in &inner.cells {
                if let Some(object) = cell.object {
                    view.push(CellView {
                        object,
                        request: cell.request,
                        thread: cell.thread,
                        waiting: cell.waiting,
                    });
                }
            }
        }
        view
    }

    fn deadlock_check_from(&self, res: Reservation) -> bool {
        let view = self.snapshot();
        let me = thread_id();
        let Some(start) = view.iter().position(|c| c.thread == me) else {
            return false;
        };
        let mut path = vec![start];
        if Self::detect(&view, start, start, 0, &mut path) {
            let mut dump = String::new();
            let _ = writeln!(dump, "DEADLOCK of threads detected!");
            for &i in &path {
                let c = &view[i];
                let _ = writeln!(
                    dump,
                    "  thread {} waits for {:?} on latch {:#x}",
                    c.thread,
                    c.request,
                    c.object.addr()
                );
            }
            let _ = res;
            log_error!("{dump}");
            eprintln!("{dump}");
            return true;
        }
        false
    }

    /// Public debug sweep: reports whether any waiting cell is part of a
    /// cycle. Used by tests; `wait` runs the same search inline.
    pub fn detect_deadlocks(&self) -> bool {
        let view = self.snapshot();
        for start in 0..view.len() {
            if !view[start].waiting {
                continue;
            }
            let mut path = vec![start];
            if Self::detect(&view, start, start, 0, &mut path) {
                return true;
            }
        }
        false
    }

    /// Recursion from `cell`: visit every thread that can be holding up
    /// this request; a path back to `start` is a cycle.
    ///
    /// The snapshot outlives the array mutexes, so a latch behind a view
    /// entry may have been released (but not freed: latches live until
    /// engine teardown) by the time it is inspected. A stale read can only
    /// produce a spurious negative, which the next check repeats.
    fn detect(view: &[CellView], start: usize, cell: usize, depth: usize, path: &mut Vec<usize>) -> bool {
        if depth > 100 {
            return false;
        }
        let c = &view[cell];
        if cell != start && !c.waiting {
            return false;
        }
        let step = |thread: u64, path: &mut Vec<usize>| -> bool {
            if thread == 0 {
                return false;
            }
            let Some(next) = view.iter().position(|v| v.thread == thread) else {
                return false;
            };
            if next == start {
                return true;
            }
            path.push(next);
            if Self::detect(view, start, next, depth + 1, path) {
                return true;
            }
            path.pop();
            false
        };
        match (c.object, c.request) {
            (WaitObject::Mutex(p), _) => {
                // SAFETY: cell was reserved when snapshotted; the reserving
                // thread is still blocked, keeping the latch alive.
                let m = unsafe { &*p };
                m.is_locked() && step(m.holder_thread(), path)
            }
            (WaitObject::Rw(p), RequestKind::RwShared) => {
                // A shared request can only be blocked by a writer or a
                // waiting writer.
                let rw = unsafe { &*p };
                rw.debug_holders().into_iter().any(|(thread, kind)| {
                    matches!(kind, HolderKind::Exclusive | HolderKind::WaitExclusive)
                        && step(thread, path)
                })
            }
            (WaitObject::Rw(p), _) => {
                // An exclusive request is blocked by any holder on another
                // thread, and by readers regardless of thread.
                let rw = unsafe { &*p };
                rw.debug_holders().into_iter().any(|(thread, kind)| {
                    let relevant = match kind {
                        HolderKind::Shared => true,
                        HolderKind::Exclusive | HolderKind::WaitExclusive => thread != c.thread,
                    };
                    relevant && step(thread, path)
                })
            }
        }
    }
}
