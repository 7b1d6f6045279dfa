//! Disk-backed chunked file-content cache.
//!
//! An entry caches one `(object name, generation)` pair as a dense data
//! file plus a sidecar index recording which fixed-size chunks are present.
//! Entries are reference-counted by open handles, bounded by a process-wide
//! byte budget, and evicted least-recently-used when admission needs room.
//!
//! A [`DownloadJob`] fills an entry's chunks from the object store, either
//! with a single sequential worker or a bounded pool of parallel workers.

pub mod download;
pub mod entry;
pub mod manager;

pub use download::{DownloadJob, DownloadMode};
pub use entry::{CacheEntry, CacheKey, ChunkState};
pub use manager::FileCacheManager;
