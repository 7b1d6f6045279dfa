//! Ports (interfaces) consumed by the bucketfs core.
//!
//! The only port is the object store itself; the kernel operation feed is
//! consumed directly as `fuser::Filesystem` callbacks in the FUSE crate.

pub mod object_store;

pub use object_store::{CreateRequest, ListRequest, Listing, ObjectStore, ReadRequest, StoreResult};
