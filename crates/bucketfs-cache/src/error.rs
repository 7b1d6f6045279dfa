//! Error types for the cache crate.

use thiserror::Error;

/// Errors produced by the file-content cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Admission refused: the budget is exhausted and nothing can be evicted.
    #[error("cache full: cannot admit {needed} bytes within budget {budget}")]
    Full {
        /// Bytes the candidate entry needs.
        needed: u64,
        /// Configured byte budget.
        budget: u64,
    },

    /// A chunk download failed; the byte range cannot be served.
    #[error("chunk {chunk} of {name} failed to download")]
    ChunkFailed {
        /// Object the entry caches.
        name: String,
        /// Index of the failed chunk.
        chunk: u32,
    },

    /// The requested range is not present and no download is filling it.
    #[error("range [{start}, {end}) of {name} is not cached")]
    NotPresent {
        name: String,
        start: u64,
        end: u64,
    },

    /// The entry was invalidated (superseded generation) while in use.
    #[error("cache entry for {0} was invalidated")]
    Invalidated(String),

    /// Content failed checksum validation.
    #[error("crc mismatch for {name}: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        name: String,
        expected: u32,
        computed: u32,
    },

    /// The wait or download was cancelled.
    #[error("cache operation cancelled")]
    Cancelled,

    /// Local disk I/O failure.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sidecar index could not be read or written.
    #[error("cache index error: {0}")]
    Index(String),
}
