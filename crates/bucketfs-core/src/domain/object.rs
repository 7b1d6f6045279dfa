//! Object metadata and generation numbers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::name::ObjectName;

/// Custom-metadata key under which symlink targets are stored.
pub const SYMLINK_TARGET_KEY: &str = "bucketfs_symlink_target";

/// Content generation of an object.
///
/// Each name in the bucket carries a monotonically increasing generation
/// that changes whenever the object's content is replaced. Generation
/// comparison is the sole atomicity primitive the system relies on:
/// conditional writes (`if_generation_match`) either commit against the
/// expected generation or fail with a precondition error.
///
/// Generation 0 is reserved: as a precondition it means "the object must
/// not exist"; on a local-file inode it means "never uploaded".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Generation(pub i64);

impl Generation {
    /// The "must not exist" precondition / "never uploaded" marker.
    pub const NONE: Generation = Generation(0);

    pub fn get(&self) -> i64 {
        self.0
    }

    /// True for any real (uploaded) generation.
    pub fn exists(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata generation, incremented on any metadata-only change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Metageneration(pub i64);

impl Metageneration {
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Metageneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata describing one object version in the bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// The object's key.
    pub name: ObjectName,
    /// Content generation.
    pub generation: Generation,
    /// Metadata generation within this content generation.
    pub metageneration: Metageneration,
    /// Content size in bytes.
    pub size: u64,
    /// MIME content type, when the store reports one.
    pub content_type: Option<String>,
    /// Last update time of this generation.
    pub updated: DateTime<Utc>,
    /// CRC32C of the content, when the store reports one.
    pub crc32c: Option<u32>,
    /// MD5 of the content, when the store reports one.
    pub md5: Option<[u8; 16]>,
    /// Small user-supplied key/value attributes.
    pub custom: HashMap<String, String>,
}

impl ObjectMetadata {
    /// Minimal metadata for tests and synthesized entries.
    pub fn new(name: ObjectName, generation: Generation, size: u64) -> Self {
        Self {
            name,
            generation,
            metageneration: Metageneration(1),
            size,
            content_type: None,
            updated: Utc::now(),
            crc32c: None,
            md5: None,
            custom: HashMap::new(),
        }
    }

    /// The symlink target stored in custom metadata, if any.
    pub fn symlink_target(&self) -> Option<&str> {
        self.custom.get(SYMLINK_TARGET_KEY).map(String::as_str)
    }

    /// True if this object represents a symlink.
    pub fn is_symlink(&self) -> bool {
        self.custom.contains_key(SYMLINK_TARGET_KEY)
    }
}
