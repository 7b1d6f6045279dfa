//! bucketfs FUSE layer.
//!
//! Projects an object-store bucket as a POSIX-like filesystem:
//! - [`core::FsCore`] — the operation dispatcher: inode graph, name
//!   resolution, handle tables, readers, writers and cache coherence.
//! - [`filesystem::BucketFs`] — the `fuser::Filesystem` bridge feeding
//!   kernel operations into the core.
//!
//! The object store arrives as an `Arc<dyn ObjectStore>`; production
//! mounts hand in the HTTP client, tests hand in the in-memory fake.

pub mod core;
pub mod error;
pub mod filesystem;
pub mod handle;
pub mod inode;
pub mod inode_entry;
pub mod reader;
pub mod writer;

pub use crate::core::FsCore;
pub use error::FsError;
pub use filesystem::BucketFs;
