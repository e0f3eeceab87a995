use crate::page::{PageId, SpaceId};

/// Errors surfaced to buffer pool callers.
///
/// Deadlock and fatal-long-wait conditions are not represented here: the
/// engine's invariants assume forward progress of every page get, so those
/// abort the process from the wait-array monitor instead of unwinding.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Informational result of the `*IfInPool` get modes.
    #[error("page not in pool")]
    NotInPool,

    /// The tablespace was dropped between lookup and I/O.
    #[error("tablespace {0} was deleted")]
    TablespaceDeleted(SpaceId),

    /// Checksum validation failed after a read.
    #[error("page {0} failed checksum validation")]
    PageCorrupted(PageId),

    /// The page decrypted "successfully" but the plaintext failed
    /// validation.
    #[error("page {0} failed post-decryption validation")]
    DecryptionFailed(PageId),

    /// The eviction scan could not produce a free descriptor.
    #[error("no free block available after {0} eviction attempts")]
    NoFreeBlock(u32),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
