pub mod bp;
pub mod checksum;
pub mod engine;
pub mod error;
pub mod io;
pub mod sync;

mod logger;
mod page;

pub mod prelude {
    pub use crate::bp::prelude::*;
    pub use crate::checksum::ChecksumAlgorithm;
    pub use crate::engine::Engine;
    pub use crate::error::{PoolError, Result};
    pub use crate::io::{
        AtomicLsn, FilePageIo, LsnSource, MemPageIo, NoopCipher, PageCipher, PageIo, ScratchPool,
        XorCipher,
    };
    pub use crate::page::*;
    pub use crate::sync::SyncContext;
}
