//! Object name newtype and path helpers.
//!
//! Object stores expose a flat namespace of byte-string keys in which `/`
//! is, by convention, the pathname separator. `ObjectName` wraps a validated
//! key and provides the path arithmetic the inode layer needs: joining a
//! child component onto a directory prefix, recognising directory markers
//! (names with a trailing separator), and splitting off base names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::errors::StoreError;

/// The pathname separator within object names.
pub const SEPARATOR: char = '/';

/// Byte appended to a file's visible name when a directory with the exact
/// same name exists next to it. `\n` cannot appear in a directory object
/// name, so the suffixed name can never collide with a real entry.
pub const CONFLICT_SUFFIX: char = '\n';

/// A validated object name (key) within the bucket.
///
/// Invariants: non-empty, valid UTF-8, does not begin with `/`, and contains
/// no empty path component (`//`). A trailing `/` is allowed and denotes an
/// explicit directory marker object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectName(String);

impl ObjectName {
    /// Creates a validated object name.
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StoreError::Invalid("object name is empty".to_string()));
        }
        if name.starts_with(SEPARATOR) {
            return Err(StoreError::Invalid(format!(
                "object name starts with separator: {name:?}"
            )));
        }
        if name.contains("//") {
            return Err(StoreError::Invalid(format!(
                "object name contains empty component: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Returns the raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this name is an explicit directory marker (trailing `/`).
    pub fn is_dir_marker(&self) -> bool {
        self.0.ends_with(SEPARATOR)
    }

    /// The last path component, without any trailing separator.
    ///
    /// For `a/b/c` this is `c`; for the marker `a/b/` it is `b`.
    pub fn base_name(&self) -> &str {
        let trimmed = self.0.trim_end_matches(SEPARATOR);
        match trimmed.rfind(SEPARATOR) {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        }
    }

    /// Joins a child component onto this name treated as a directory prefix.
    ///
    /// `a/b/` + `c` = `a/b/c`. Calling this on a non-marker name inserts the
    /// separator first.
    pub fn child(&self, component: &str) -> Result<Self, StoreError> {
        if component.is_empty() || component.contains(SEPARATOR) {
            return Err(StoreError::Invalid(format!(
                "invalid path component: {component:?}"
            )));
        }
        if self.is_dir_marker() {
            Self::new(format!("{}{}", self.0, component))
        } else {
            Self::new(format!("{}{}{}", self.0, SEPARATOR, component))
        }
    }

    /// Returns the explicit-directory-marker form of this name (`a/b` → `a/b/`).
    pub fn as_dir_marker(&self) -> Self {
        if self.is_dir_marker() {
            self.clone()
        } else {
            Self(format!("{}{}", self.0, SEPARATOR))
        }
    }

    /// Returns the non-marker form of this name (`a/b/` → `a/b`).
    pub fn without_marker(&self) -> Self {
        Self(self.0.trim_end_matches(SEPARATOR).to_string())
    }

    /// The prefix under which this directory's children live.
    ///
    /// Identical to [`ObjectName::as_dir_marker`] but reads better at call
    /// sites that build list requests.
    pub fn as_prefix(&self) -> String {
        self.as_dir_marker().0
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ObjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
