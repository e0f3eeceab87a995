//! The engine context: pool, synchronization substrate, collaborators and
//! background threads, bundled behind one init/teardown pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bp::{BufferPool, PoolConfig};
use crate::error::Result;
use crate::io::{LsnSource, PageCipher, PageIo};
use crate::page::Lsn;
use crate::sync::{Event, SyncContext};
use crate::{log_error, log_info};

/// Wait-array instances per context; cells per instance come from the
/// configuration.
const WAIT_ARRAY_INSTANCES: usize = 4;

/// Process-wide mutable state of the core, made explicit: the wait arrays,
/// the pool instances and the background monitor and flusher threads.
pub struct Engine {
    sync: Arc<SyncContext>,
    pool: Arc<BufferPool>,
    lsn_source: Arc<dyn LsnSource>,
    shutdown: Arc<ShutdownFlag>,
    monitor: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

struct ShutdownFlag {
    requested: AtomicBool,
    event: Event,
}

impl ShutdownFlag {
    fn new() -> Self {
        ShutdownFlag {
            requested: AtomicBool::new(false),
            event: Event::new(),
        }
    }

    fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.event.set();
    }

    /// Sleeps up to `period`; returns true when shutdown was requested.
    fn sleep(&self, period: Duration) -> bool {
        if self.requested.load(Ordering::Acquire) {
            return true;
        }
        let generation = self.event.reset();
        if self.requested.load(Ordering::Acquire) {
            return true;
        }
        self.event.wait_timeout(generation, period);
        self.requested.load(Ordering::Acquire)
    }
}

impl Engine {
    pub fn new(
        config: PoolConfig,
        io: Arc<dyn PageIo>,
        cipher: Arc<dyn PageCipher>,
        lsn_source: Arc<dyn LsnSource>,
    ) -> Engine {
        let sync = Arc::new(SyncContext::new(
            WAIT_ARRAY_INSTANCES,
            config.wait_array_size,
        ));
        let fatal_wait = Duration::from_secs(config.fatal_semaphore_wait_seconds);
        let flush_period = Duration::from_millis(config.flush_interval_ms);
        let flush_batch = config.flush_batch_size;
        let pool = Arc::new(BufferPool::new(config, Arc::clone(&sync), io, cipher));
        let shutdown = Arc::new(ShutdownFlag::new());

        let monitor = {
            let sync = Arc::clone(&sync);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("ib-error-monitor".into())
                .spawn(move || {
                    while !shutdown.sleep(Duration::from_secs(1)) {
                        if sync.monitor_tick(fatal_wait) {
                            // Forward progress of every latch acquisition is
                            // a correctness assumption; a wait this long
                            // means the engine is wedged.
                            log_error!("fatal semaphore wait; aborting");
                            std::process::abort();
                        }
                    }
                })
                .expect("spawning error monitor")
        };

        let flusher = {
            let pool = Arc::clone(&pool);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("ib-page-flusher".into())
                .spawn(move || {
                    while !shutdown.sleep(flush_period) {
                        if let Err(e) = pool.flush_batch(flush_batch, None) {
                            log_error!("background flush batch failed: {e}");
                        }
                        if let Err(e) = pool.flush_lru_tails(flush_batch / 4 + 1) {
                            log_error!("background LRU-tail flush failed: {e}");
                        }
                    }
                })
                .expect("spawning page flusher")
        };

        log_info!("engine started");
        Engine {
            sync,
            pool,
            lsn_source,
            shutdown,
            monitor: Some(monitor),
            flusher: Some(flusher),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn sync(&self) -> &Arc<SyncContext> {
        &self.sync
    }

    pub fn lsn_source(&self) -> &Arc<dyn LsnSource> {
        &self.lsn_source
    }

    /// Flushes until the checkpoint can advance to the current durable
    /// LSN, and returns that LSN.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let target = self.lsn_source.current_lsn();
        self.pool.flush_for_checkpoint(target)?;
        Ok(target)
    }

    /// Debug sweep over every invariant the core maintains.
    pub fn validate(&self) {
        self.pool.validate();
    }

    /// Stops the background threads. Dirty pages are left to the caller;
    /// pool contents are ephemeral by contract.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.request();
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        log_info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::PoolConfig;
    use crate::io::{AtomicLsn, MemPageIo, NoopCipher};
    use crate::page::{PageId, PAGE_SIZE};

    fn test_engine(num_pages: usize) -> (Engine, Arc<MemPageIo>, Arc<AtomicLsn>) {
        let io = Arc::new(MemPageIo::new());
        let lsn = Arc::new(AtomicLsn::new(0));
        let engine = Engine::new(
            PoolConfig {
                total_pool_bytes: num_pages * PAGE_SIZE,
                instance_count: 1,
                flush_interval_ms: 20,
                ..PoolConfig::default()
            },
            Arc::clone(&io) as _,
            Arc::new(NoopCipher),
            Arc::clone(&lsn) as _,
        );
        (engine, io, lsn)
    }

    #[test]
    fn test_engine_lifecycle() {
        let (engine, io, _) = test_engine(64);
        io.create_space(1);
        {
            let guard = engine.pool().create(PageId::new(1, 0)).unwrap();
            assert_eq!(guard.id(), PageId::new(1, 0));
        }
        engine.validate();
        engine.shutdown();
    }

    #[test]
    fn test_background_flusher_cleans_pages() {
        let (engine, io, lsn) = test_engine(64);
        io.create_space(1);
        for page_no in 0..8 {
            let mut guard = engine.pool().create(PageId::new(1, page_no)).unwrap();
            guard.page_mut()[4096] = page_no as u8;
            guard.mark_dirty(lsn.next());
        }
        assert_ne!(engine.pool().oldest_modification(), 0);
        // The 20 ms flusher must clean everything without explicit help.
        for _ in 0..200 {
            if engine.pool().oldest_modification() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.pool().oldest_modification(), 0);
        assert_eq!(io.io_counts().1, 8);
        engine.validate();
    }

    #[test]
    fn test_checkpoint_flushes_to_target() {
        let (engine, io, lsn) = test_engine(64);
        io.create_space(1);
        for page_no in 0..4 {
            let guard = engine.pool().create(PageId::new(1, page_no)).unwrap();
            guard.mark_dirty(lsn.next());
        }
        let checkpoint = engine.checkpoint().unwrap();
        assert_eq!(checkpoint, lsn.current_lsn());
        let oldest = engine.pool().oldest_modification();
        assert!(oldest == 0 || oldest >= checkpoint);
        engine.validate();
    }
}
