//! Caching layers for bucketfs.
//!
//! Three caches live here:
//!
//! - [`StatCache`]: bounded LRU of object metadata keyed by object name,
//!   including negative (remembered-404) entries, with wall-clock TTL.
//! - [`TypeCache`]: per-directory map of child name to kind, consulted
//!   before any stat during name resolution.
//! - [`content`]: the disk-backed chunked file-content cache with its
//!   download manager.

pub mod content;
pub mod error;
pub mod stat_cache;
pub mod type_cache;

pub use content::{CacheEntry, CacheKey, ChunkState, DownloadJob, DownloadMode, FileCacheManager};
pub use error::CacheError;
pub use stat_cache::StatCache;
pub use type_cache::{ChildKind, TypeCache};
