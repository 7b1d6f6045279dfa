//! Core domain logic for bucketfs.
//!
//! This crate holds the vocabulary shared by every other bucketfs crate:
//! object names and generations, object metadata, the error taxonomy, the
//! `ObjectStore` port, and the typed configuration.
//!
//! It deliberately has no I/O of its own; adapters (the HTTP store client,
//! the caches, the FUSE layer) live in the sibling crates.

pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{
    errors::StoreError, name::ObjectName, object::Generation, object::Metageneration,
    object::ObjectMetadata,
};
pub use ports::object_store::{
    CreateRequest, ListRequest, Listing, ObjectStore, ReadRequest, StoreResult,
};
