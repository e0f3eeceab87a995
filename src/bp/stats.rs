use std::sync::atomic::{AtomicU64, Ordering};

/// Per-instance counters. Increments are relaxed; these guide heuristics
/// and monitoring, never correctness.
#[derive(Default)]
pub struct PoolStats {
    n_page_gets: AtomicU64,
    n_pages_read: AtomicU64,
    n_pages_written: AtomicU64,
    n_pages_created: AtomicU64,
    n_pages_evicted: AtomicU64,
    n_pages_made_young: AtomicU64,
    n_pages_not_made_young: AtomicU64,
    n_read_ahead: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        #[inline]
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_page_gets, page_gets, n_page_gets);
    counter!(inc_pages_read, pages_read, n_pages_read);
    counter!(inc_pages_written, pages_written, n_pages_written);
    counter!(inc_pages_created, pages_created, n_pages_created);
    counter!(inc_pages_evicted, pages_evicted, n_pages_evicted);
    counter!(inc_made_young, made_young, n_pages_made_young);
    counter!(inc_not_made_young, not_made_young, n_pages_not_made_young);
    counter!(inc_read_ahead, read_ahead, n_read_ahead);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            page_gets: self.page_gets(),
            pages_read: self.pages_read(),
            pages_written: self.pages_written(),
            pages_created: self.pages_created(),
            pages_evicted: self.pages_evicted(),
            made_young: self.made_young(),
            not_made_young: self.not_made_young(),
            read_ahead: self.read_ahead(),
        }
    }

    pub fn clear(&self) {
        self.n_page_gets.store(0, Ordering::Relaxed);
        self.n_pages_read.store(0, Ordering::Relaxed);
        self.n_pages_written.store(0, Ordering::Relaxed);
        self.n_pages_created.store(0, Ordering::Relaxed);
        self.n_pages_evicted.store(0, Ordering::Relaxed);
        self.n_pages_made_young.store(0, Ordering::Relaxed);
        self.n_pages_not_made_young.store(0, Ordering::Relaxed);
        self.n_read_ahead.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters, summable across instances.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub page_gets: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub pages_created: u64,
    pub pages_evicted: u64,
    pub made_young: u64,
    pub not_made_young: u64,
    pub read_ahead: u64,
}

impl std::ops::Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, rhs: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            page_gets: self.page_gets + rhs.page_gets,
            pages_read: self.pages_read + rhs.pages_read,
            pages_written: self.pages_written + rhs.pages_written,
            pages_created: self.pages_created + rhs.pages_created,
            pages_evicted: self.pages_evicted + rhs.pages_evicted,
            made_young: self.made_young + rhs.made_young,
            not_made_young: self.not_made_young + rhs.not_made_young,
            read_ahead: self.read_ahead + rhs.read_ahead,
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gets {} reads {} writes {} created {} evicted {} young {} not-young {}",
            self.page_gets,
            self.pages_read,
            self.pages_written,
            self.pages_created,
            self.pages_evicted,
            self.made_young,
            self.not_made_young,
        )
    }
}
