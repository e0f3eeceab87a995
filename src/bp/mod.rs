//! The buffer pool: sharded page cache with pinning, midpoint LRU
//! replacement, dirty-page tracking and watch sentinels.

mod config;
mod descriptor;
mod flush;
mod guards;
mod hazard;
mod lists;
mod lru;
mod page_hash;
mod pool;
mod stats;

use std::sync::Arc;

pub use config::PoolConfig;
pub use descriptor::{IoState, PageState};
pub use guards::{LatchMode, MemoryBlock, PageGuard, PageRef};
pub use pool::{BufferPool, FlushKind, GetMode, PoolInstance};
pub use stats::{PoolStats, StatsSnapshot};

use crate::io::{MemPageIo, NoopCipher};
use crate::page::PAGE_SIZE;
use crate::sync::SyncContext;

/// In-memory-backed pool for tests: `num_pages` frames in one instance,
/// with the I/O stub exposed for fault injection.
pub fn get_test_pool(num_pages: usize) -> (BufferPool, Arc<MemPageIo>) {
    get_test_pool_with(PoolConfig {
        total_pool_bytes: num_pages * PAGE_SIZE,
        instance_count: 1,
        ..PoolConfig::default()
    })
}

pub fn get_test_pool_with(config: PoolConfig) -> (BufferPool, Arc<MemPageIo>) {
    let sync = Arc::new(SyncContext::new(2, config.wait_array_size));
    let io = Arc::new(MemPageIo::new());
    let pool = BufferPool::new(config, sync, Arc::clone(&io) as _, Arc::new(NoopCipher));
    (pool, io)
}

pub mod prelude {
    pub use super::{
        BufferPool, FlushKind, GetMode, LatchMode, PageGuard, PageRef, PageState, PoolConfig,
        StatsSnapshot,
    };
}
