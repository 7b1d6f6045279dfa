//! Type cache: per-directory child-name → kind map with TTL.
//!
//! Populated by listings and lookups, consulted before the stat cache during
//! name resolution so that a name the directory already knows to be absent
//! (or knows to be a file) never costs a stat of the sibling spelling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Kind of a directory child as the directory last observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// A regular file object.
    File,
    /// An explicit or implicit directory.
    Dir,
    /// A symlink object.
    Symlink,
    /// Known not to exist.
    NonExistent,
}

#[derive(Debug)]
struct TypeEntry {
    kind: ChildKind,
    expires_at: Instant,
}

/// Child-kind cache for a single directory inode.
///
/// Each directory inode owns one `TypeCache`; the table lock is therefore
/// per-directory, never global.
#[derive(Debug)]
pub struct TypeCache {
    entries: Mutex<HashMap<String, TypeEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl TypeCache {
    /// Creates an empty cache with the given freshness and size bound.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Records the observed kind of a child.
    ///
    /// When the directory is at its bound, the insert drops expired entries
    /// first and is skipped entirely if the bound still cannot be met; a
    /// full cache degrades to extra stats, never to wrong answers.
    pub fn insert(&self, name: &str, kind: ChildKind) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if entries.len() >= self.max_entries && !entries.contains_key(name) {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                return;
            }
        }
        entries.insert(
            name.to_string(),
            TypeEntry {
                kind,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Returns the fresh kind for `name`, if known.
    pub fn get(&self, name: &str) -> Option<ChildKind> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(name)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.kind)
    }

    /// Forgets what is known about `name`.
    pub fn invalidate(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of entries, counting expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True if no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = TypeCache::new(Duration::from_secs(60), 64);
        cache.insert("photo.jpg", ChildKind::File);
        cache.insert("albums", ChildKind::Dir);
        cache.insert("gone", ChildKind::NonExistent);

        assert_eq!(cache.get("photo.jpg"), Some(ChildKind::File));
        assert_eq!(cache.get("albums"), Some(ChildKind::Dir));
        assert_eq!(cache.get("gone"), Some(ChildKind::NonExistent));
        assert_eq!(cache.get("unknown"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = TypeCache::new(Duration::from_secs(60), 64);
        cache.insert("a", ChildKind::File);
        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_size_bound_skips_insert_when_full() {
        let cache = TypeCache::new(Duration::from_secs(60), 2);
        cache.insert("a", ChildKind::File);
        cache.insert("b", ChildKind::File);
        cache.insert("c", ChildKind::File);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("c"), None);
        // Updating an existing entry is always allowed.
        cache.insert("a", ChildKind::Dir);
        assert_eq!(cache.get("a"), Some(ChildKind::Dir));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = TypeCache::new(Duration::from_secs(10), 64);
        cache.insert("a", ChildKind::File);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("a"), Some(ChildKind::File));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_make_room() {
        let cache = TypeCache::new(Duration::from_secs(5), 2);
        cache.insert("a", ChildKind::File);
        cache.insert("b", ChildKind::File);

        tokio::time::advance(Duration::from_secs(6)).await;

        cache.insert("c", ChildKind::Dir);
        assert_eq!(cache.get("c"), Some(ChildKind::Dir));
    }
}
