//! Object store port (driven/secondary port).
//!
//! Defines the capability interface bucketfs requires of a remote object
//! store: a flat namespace of keyed blobs with per-name generations and
//! generation-conditional mutation. The HTTP adapter and the in-memory fake
//! both implement this trait; the `Bucket` wrapper in `bucketfs-store`
//! implements it too, layering rate limiting, retries and the stat cache on
//! top of an inner implementation.
//!
//! ## Design Notes
//!
//! - Errors are always [`StoreError`]; adapters are responsible for mapping
//!   their wire-level failures into the taxonomy so the retry wrapper can
//!   classify them.
//! - Range reads return the bytes directly rather than a stream. Readers
//!   above this layer issue bounded ranges (a chunk, a sequential window),
//!   so the largest single response is a configured chunk size.

use std::collections::HashMap;
use std::ops::Range;

use crate::domain::{Generation, ObjectMetadata, ObjectName, StoreError};

/// Result alias used across the port.
pub type StoreResult<T> = Result<T, StoreError>;

/// Parameters of a list request.
#[derive(Debug, Clone)]
pub struct ListRequest {
    /// Only names with this prefix are returned.
    pub prefix: String,
    /// When set, names are rolled up at the first occurrence of the
    /// delimiter past the prefix and reported as common prefixes.
    pub delimiter: Option<char>,
    /// Continuation token from a previous page.
    pub continuation_token: Option<String>,
    /// Upper bound on `objects.len() + prefixes.len()` for this page.
    pub max_results: usize,
}

impl ListRequest {
    /// A single-page directory listing request rooted at `prefix`.
    pub fn directory(prefix: impl Into<String>, max_results: usize) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: Some(crate::domain::name::SEPARATOR),
            continuation_token: None,
            max_results,
        }
    }

    /// The same request pointed at the next page.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.continuation_token = token;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Objects whose names fall directly under the prefix.
    pub objects: Vec<ObjectMetadata>,
    /// Rolled-up common prefixes (each ends with the delimiter).
    pub prefixes: Vec<String>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Parameters of a generation-pinned range read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// Object to read.
    pub name: ObjectName,
    /// Generation the caller is pinned to. The read fails with
    /// `PreconditionFailed` if this generation is no longer current.
    pub generation: Generation,
    /// Byte range to return. The end may exceed the object size; the
    /// response is truncated at end-of-object.
    pub range: Range<u64>,
}

/// Parameters of an object creation.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Name to create the object under.
    pub name: ObjectName,
    /// Full object contents.
    pub contents: Vec<u8>,
    /// MIME type recorded on the object.
    pub content_type: Option<String>,
    /// Custom key/value attributes recorded on the object.
    pub metadata: HashMap<String, String>,
    /// Generation precondition. `Some(Generation::NONE)` means the object
    /// must not exist; `None` means unconditional (last writer wins).
    pub if_generation_match: Option<Generation>,
}

impl CreateRequest {
    /// An unconditional create with no extra metadata.
    pub fn new(name: ObjectName, contents: Vec<u8>) -> Self {
        Self {
            name,
            contents,
            content_type: None,
            metadata: HashMap::new(),
            if_generation_match: None,
        }
    }

    /// Adds a generation precondition.
    pub fn if_generation(mut self, generation: Generation) -> Self {
        self.if_generation_match = Some(generation);
        self
    }
}

/// Capability interface over the remote object store.
///
/// Implementations must be cheap to share (`Arc<dyn ObjectStore>`): every
/// open file handle holds one.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches metadata for a single object.
    ///
    /// Returns `StoreError::NotFound` when no object has this name.
    async fn stat_object(&self, name: &ObjectName) -> StoreResult<ObjectMetadata>;

    /// Lists one page of objects under a prefix.
    async fn list_objects(&self, req: &ListRequest) -> StoreResult<Listing>;

    /// Reads a byte range of a specific generation.
    ///
    /// The returned buffer is shorter than the requested range when the
    /// range extends past end-of-object; it is empty when the start offset
    /// is at or past the end.
    async fn read_object(&self, req: &ReadRequest) -> StoreResult<Vec<u8>>;

    /// Creates (or replaces) an object, optionally conditional on the
    /// current generation of the name.
    ///
    /// Returns `PreconditionFailed` when the condition does not hold, with
    /// the special case that `if_generation_match = 0` against an existing
    /// object may also surface as `AlreadyExists`.
    async fn create_object(&self, req: CreateRequest) -> StoreResult<ObjectMetadata>;

    /// Server-side copy of a specific source generation to a new name,
    /// optionally conditional on the destination's current generation.
    async fn copy_object(
        &self,
        src: &ObjectName,
        src_generation: Generation,
        dst: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata>;

    /// Concatenates existing source objects into a destination object.
    async fn compose_objects(
        &self,
        dst: &ObjectName,
        sources: &[ObjectName],
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata>;

    /// Deletes an object, optionally conditional on its current generation.
    async fn delete_object(
        &self,
        name: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<()>;
}
