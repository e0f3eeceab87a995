//! End-to-end scenarios exercising the pool through the public surface.

use std::sync::Arc;
use std::time::Duration;

use ironbuf::prelude::*;

fn config(num_pages: usize) -> PoolConfig {
    PoolConfig {
        total_pool_bytes: num_pages * PAGE_SIZE,
        instance_count: 1,
        flush_interval_ms: 50,
        ..PoolConfig::default()
    }
}

fn mem_engine(num_pages: usize) -> (Engine, Arc<MemPageIo>, Arc<AtomicLsn>) {
    let io = Arc::new(MemPageIo::new());
    let lsn = Arc::new(AtomicLsn::new(0));
    let engine = Engine::new(
        config(num_pages),
        Arc::clone(&io) as _,
        Arc::new(NoopCipher),
        Arc::clone(&lsn) as _,
    );
    (engine, io, lsn)
}

#[test]
fn scenario_hit_fast_path() {
    let (engine, io, _) = mem_engine(64);
    io.create_space(7);
    let pool = engine.pool();
    let id = PageId::new(7, 3);

    {
        let mut guard = pool.create(id).unwrap();
        guard.page_mut()[64] = 0xAB;
    }
    let gets_before = pool.stats().page_gets;
    {
        let guard = pool.get_read(id).unwrap();
        assert_eq!(guard[64], 0xAB);
    }
    assert_eq!(pool.stats().page_gets, gets_before + 1);
    engine.validate();
}

#[test]
fn scenario_write_read_roundtrip_through_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let io = Arc::new(FilePageIo::new(dir.path()).unwrap());
    io.create_space(3).unwrap();
    let lsn = Arc::new(AtomicLsn::new(0));

    // First engine: create pages, flush, shut down.
    {
        let engine = Engine::new(
            config(32),
            Arc::clone(&io) as Arc<dyn PageIo>,
            Arc::new(NoopCipher),
            Arc::clone(&lsn) as Arc<dyn LsnSource>,
        );
        for page_no in 0..16 {
            let mut guard = engine.pool().create(PageId::new(3, page_no)).unwrap();
            guard.page_mut()[128] = page_no as u8;
            guard.mark_dirty(lsn.next());
        }
        engine.pool().flush_all().unwrap();
        engine.validate();
    }

    // Second engine reads the same files back, checksums validating.
    let engine = Engine::new(
        config(32),
        Arc::clone(&io) as Arc<dyn PageIo>,
        Arc::new(NoopCipher),
        Arc::clone(&lsn) as Arc<dyn LsnSource>,
    );
    for page_no in 0..16 {
        let guard = engine.pool().get_read(PageId::new(3, page_no)).unwrap();
        assert_eq!(guard[128], page_no as u8);
    }
    engine.validate();
}

#[test]
fn scenario_encrypted_writes_roundtrip() {
    let io = Arc::new(MemPageIo::new());
    io.create_space(1);
    let lsn = Arc::new(AtomicLsn::new(0));
    let engine = Engine::new(
        config(32),
        Arc::clone(&io) as Arc<dyn PageIo>,
        Arc::new(XorCipher { key: 0x5A }),
        Arc::clone(&lsn) as Arc<dyn LsnSource>,
    );
    let pool = engine.pool();
    let id = PageId::new(1, 2);
    {
        let mut guard = pool.create(id).unwrap();
        guard.page_mut()[9000] = 0x17;
        guard.mark_dirty(lsn.next());
    }
    pool.flush_all().unwrap();
    // Evict the plaintext copy and force a decrypting read.
    assert!(pool.try_evict(id));
    let guard = pool.get_read(id).unwrap();
    assert_eq!(guard[9000], 0x17);
    drop(guard);
    engine.validate();
}

#[test]
fn scenario_watch_signals_peer_read() {
    let (engine, io, _) = mem_engine(64);
    io.create_space(9);
    let pool = engine.pool();
    let id = PageId::new(9, 40);

    assert!(!pool.watch_set(id));
    assert!(!pool.watch_occurred(id));
    std::thread::scope(|s| {
        s.spawn(|| {
            // Peer writes the page into existence.
            pool.create(id).unwrap();
        });
    });
    assert!(pool.watch_occurred(id));
    pool.watch_unset(id);
    engine.validate();
}

#[test]
fn scenario_checkpoint_advances_with_flushing() {
    let (engine, io, lsn) = mem_engine(64);
    io.create_space(1);
    let pool = engine.pool();

    assert_eq!(pool.oldest_modification(), 0);
    for page_no in 0..8 {
        let guard = pool.create(PageId::new(1, page_no)).unwrap();
        guard.mark_dirty(lsn.next());
    }
    assert_eq!(pool.oldest_modification(), 1);
    let checkpoint = engine.checkpoint().unwrap();
    assert_eq!(checkpoint, 8);
    let oldest = pool.oldest_modification();
    assert!(oldest == 0 || oldest >= checkpoint);
    pool.flush_all().unwrap();
    assert_eq!(pool.oldest_modification(), 0);
    engine.validate();
}

#[test]
fn scenario_optimistic_reacquire() {
    let (engine, io, _) = mem_engine(64);
    io.create_space(1);
    let pool = engine.pool();
    let id = PageId::new(1, 5);

    let page_ref = {
        let guard = pool.create(id).unwrap();
        guard.page_ref()
    };
    // Still resident: the optimistic path avoids the page hash.
    let reads_before = pool.stats().pages_read;
    {
        let guard = pool.optimistic_get(&page_ref, LatchMode::Shared).unwrap();
        assert_eq!(guard.id(), id);
    }
    assert_eq!(pool.stats().pages_read, reads_before);

    assert!(pool.try_evict(id));
    assert!(pool.optimistic_get(&page_ref, LatchMode::Shared).is_err());
    engine.validate();
}

#[test]
fn scenario_concurrent_mixed_workload() {
    let (engine, io, lsn) = mem_engine(128);
    io.create_space(1);
    let pool = engine.pool();

    std::thread::scope(|s| {
        for t in 0..4u32 {
            let lsn = Arc::clone(&lsn);
            s.spawn(move || {
                for i in 0..200u32 {
                    let id = PageId::new(1, t * 10_000 + i);
                    let mut guard = pool.create(id).unwrap();
                    guard.page_mut()[77] = t as u8;
                    guard.mark_dirty(lsn.next());
                    drop(guard);
                    if i % 3 == 0 {
                        let guard = pool.get_read(id).unwrap();
                        assert_eq!(guard[77], t as u8);
                    }
                }
            });
        }
        // A reader thread hammering recent pages while writers churn.
        s.spawn(|| {
            for i in 0..200u32 {
                let id = PageId::new(1, i % 50);
                match pool.get(id, GetMode::GetIfInPool, LatchMode::Shared) {
                    Ok(_) | Err(PoolError::NotInPool) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
    });
    pool.flush_all().unwrap();
    engine.validate();
}

#[test]
fn scenario_pool_exhaustion_and_recovery() {
    let (engine, io, _) = mem_engine(16);
    io.create_space(1);
    let pool = engine.pool();

    let mut guards = Vec::new();
    for page_no in 0..16 {
        guards.push(pool.create(PageId::new(1, page_no)).unwrap());
    }
    assert!(matches!(
        pool.create(PageId::new(1, 100)),
        Err(PoolError::NoFreeBlock(_))
    ));
    guards.clear();
    // All clean and unpinned: the next miss must succeed.
    pool.create(PageId::new(1, 100)).unwrap();
    engine.validate();
}

#[test]
fn scenario_background_flusher_keeps_pool_clean() {
    let (engine, io, lsn) = mem_engine(64);
    io.create_space(1);
    let pool = engine.pool();
    for page_no in 0..32 {
        let mut guard = pool.create(PageId::new(1, page_no)).unwrap();
        guard.page_mut()[1] = 1;
        guard.mark_dirty(lsn.next());
    }
    let mut clean = false;
    for _ in 0..300 {
        if pool.oldest_modification() == 0 {
            clean = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(clean, "background flusher never caught up");
    engine.validate();
}
