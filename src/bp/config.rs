use crate::checksum::ChecksumAlgorithm;
use crate::page::PAGE_SIZE;

/// Configuration of the buffer pool and its synchronization substrate.
///
/// All sizes are validated by [`PoolConfig::checked`]; construction of a
/// pool from an unchecked config panics on the same conditions.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Aggregate pool size in bytes across all instances.
    pub total_pool_bytes: usize,
    /// Number of pool instances, 1..=64. Chosen at init, immutable.
    pub instance_count: usize,
    /// Pages per allocation chunk inside one instance.
    pub chunk_pages: usize,
    /// Percentage of the LRU kept in the "old" segment.
    pub lru_old_ratio_pct: u8,
    /// Minimum age before an old block is promoted to the young segment.
    pub lru_old_threshold_ms: u64,
    /// Maximum blocks examined per LRU eviction / flush sweep.
    pub flush_scan_depth: u32,
    /// Pages written per background flush-list batch.
    pub flush_batch_size: u32,
    /// Background flusher period.
    pub flush_interval_ms: u64,
    /// Stripe count for the page hash; power of two.
    pub page_hash_stripes: usize,
    /// Cells per wait-array instance.
    pub wait_array_size: usize,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// A semaphore wait longer than this aborts the server.
    pub fatal_semaphore_wait_seconds: u64,
    /// Sizes the watch sentinel array (`purge_threads + 1` per instance).
    pub purge_threads: usize,
    /// Scratch buffer slots shared by the flush paths.
    pub scratch_slots: usize,
    /// Allocator hint only; chunk slabs are ordinary allocations.
    pub large_pages: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            total_pool_bytes: 16 * 1024 * 1024,
            instance_count: 1,
            chunk_pages: 256,
            lru_old_ratio_pct: 37,
            lru_old_threshold_ms: 1000,
            flush_scan_depth: 100,
            flush_batch_size: 100,
            flush_interval_ms: 1000,
            page_hash_stripes: 1024,
            wait_array_size: 64,
            checksum_algorithm: ChecksumAlgorithm::Crc32,
            fatal_semaphore_wait_seconds: 600,
            purge_threads: 4,
            scratch_slots: 16,
            large_pages: false,
        }
    }
}

impl PoolConfig {
    /// Panics if the configuration is not usable.
    pub fn checked(self) -> Self {
        assert!(
            (1..=64).contains(&self.instance_count),
            "instance_count must be in 1..=64"
        );
        assert!(
            self.pages_per_instance() >= 8,
            "pool too small: fewer than 8 pages per instance"
        );
        assert!(self.chunk_pages > 0, "chunk_pages must be positive");
        assert!(
            self.page_hash_stripes.is_power_of_two(),
            "page_hash_stripes must be a power of two"
        );
        assert!(self.wait_array_size > 0, "wait_array_size must be positive");
        assert!(
            self.lru_old_ratio_pct >= 5 && self.lru_old_ratio_pct <= 95,
            "lru_old_ratio_pct must be in 5..=95"
        );
        assert!(self.flush_scan_depth > 0, "flush_scan_depth must be positive");
        self
    }

    pub fn pages_per_instance(&self) -> usize {
        self.total_pool_bytes / PAGE_SIZE / self.instance_count
    }

    pub fn watch_slots(&self) -> usize {
        self.purge_threads + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PoolConfig::default().checked();
        assert_eq!(config.pages_per_instance(), 1024);
        assert_eq!(config.watch_slots(), 5);
    }

    #[test]
    #[should_panic(expected = "instance_count")]
    fn test_instance_count_bounds() {
        let _ = PoolConfig {
            instance_count: 65,
            ..PoolConfig::default()
        }
        .checked();
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_stripes_power_of_two() {
        let _ = PoolConfig {
            page_hash_stripes: 100,
            ..PoolConfig::default()
        }
        .checked();
    }
}
