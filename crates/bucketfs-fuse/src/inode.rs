//! Inode table: number allocation and bidirectional (parent, name) lookup.
//!
//! Uses DashMap for lock-free concurrent access from parallel operations.
//! The `(parent, name)` index is what makes repeated lookups idempotent: as
//! long as an inode is referenced, resolving the same name under the same
//! parent returns the same inode number.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::inode_entry::{Inode, InodeNumber, Variant};

/// Table of live inodes.
pub struct InodeTable {
    by_ino: DashMap<u64, Arc<Inode>>,
    /// (parent inode, visible child name) -> inode number.
    by_name: DashMap<(u64, String), u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Creates a table whose first allocated number is 2 (1 is the root).
    pub fn new() -> Self {
        Self {
            by_ino: DashMap::new(),
            by_name: DashMap::new(),
            next_ino: AtomicU64::new(InodeNumber::ROOT.get() + 1),
        }
    }

    /// Allocates a fresh inode number.
    pub fn allocate(&self) -> InodeNumber {
        InodeNumber::new(self.next_ino.fetch_add(1, Ordering::SeqCst))
    }

    /// Inserts an inode, indexing it under its (parent, name).
    pub fn insert(&self, inode: Inode) -> Arc<Inode> {
        let ino = inode.ino().get();
        let key = (inode.parent().get(), inode.name().to_string());
        let inode = Arc::new(inode);
        self.by_ino.insert(ino, Arc::clone(&inode));
        // The root is not a child of anything.
        if ino != InodeNumber::ROOT.get() {
            self.by_name.insert(key, ino);
        }
        inode
    }

    /// Retrieves an inode by number.
    pub fn get(&self, ino: u64) -> Option<Arc<Inode>> {
        self.by_ino.get(&ino).map(|r| Arc::clone(&r))
    }

    /// Retrieves a child inode by (parent, visible name).
    pub fn lookup_child(&self, parent: InodeNumber, name: &str) -> Option<Arc<Inode>> {
        let ino = *self.by_name.get(&(parent.get(), name.to_string()))?;
        self.get(ino)
    }

    /// Removes an inode and its name-index entry.
    pub fn remove(&self, ino: u64) -> Option<Arc<Inode>> {
        let (_, inode) = self.by_ino.remove(&ino)?;
        let key = (inode.parent().get(), inode.name().to_string());
        // Only remove the index entry if it still points at this inode; a
        // rename may have reused the name for a different one.
        if self.by_name.get(&key).map(|r| *r) == Some(ino) {
            self.by_name.remove(&key);
        }
        Some(inode)
    }

    /// Drops the name-index entry for (parent, name) without touching the
    /// inode itself. Used by unlink/rename, where the kernel still holds
    /// references to the now-unreachable inode.
    pub fn unlink_name(&self, parent: InodeNumber, name: &str) {
        self.by_name.remove(&(parent.get(), name.to_string()));
    }

    /// Number of live inodes.
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }

    /// Applies `forget` semantics: drops `nlookup` kernel references and
    /// removes the inode once nothing references it.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == InodeNumber::ROOT.get() {
            return;
        }
        let Some(inode) = self.get(ino) else {
            return;
        };
        inode.decrement_lookup_by(nlookup);
        if inode.is_destroyable() {
            self.remove(ino);
        }
    }

    /// Removes the inode if it has become unreferenced (called after a
    /// handle release).
    pub fn reap_if_unreferenced(&self, ino: u64) {
        if ino == InodeNumber::ROOT.get() {
            return;
        }
        if let Some(inode) = self.get(ino) {
            if inode.is_destroyable() {
                self.remove(ino);
            }
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience for building directory inodes in tests and setup code.
pub fn root_inode(type_ttl: std::time::Duration, max_entries: usize, only_dir: &str) -> Inode {
    use crate::inode_entry::DirState;
    let prefix = if only_dir.is_empty() {
        String::new()
    } else if only_dir.ends_with('/') {
        only_dir.to_string()
    } else {
        format!("{only_dir}/")
    };
    Inode::new(
        InodeNumber::ROOT,
        InodeNumber::ROOT,
        String::new(),
        Variant::Dir(DirState::new(prefix, false, type_ttl, max_entries)),
    )
}
