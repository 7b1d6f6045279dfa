//! Open-handle tables for files and directories.
//!
//! Handles reference inodes by number plus the inode's atomic handle
//! counter, never by strong pointer from inode to handle, so the
//! inode/handle reference cycle is broken by construction. Per-handle state
//! (reader strategy, writer scratch, directory listing snapshot) lives
//! behind tokio mutexes: operations on one handle serialize, operations on
//! distinct handles run in parallel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::FsError;
use crate::inode_entry::InodeNumber;
use crate::reader::FileReader;
use crate::writer::FileWriter;

/// One entry of a directory listing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: fuser::FileType,
}

/// Restartable listing state of an open directory handle.
#[derive(Debug, Default)]
pub struct DirStream {
    /// Entries emitted so far, in stable lexicographic order. Offsets
    /// handed to the kernel index into this snapshot.
    pub entries: Vec<DirEntry>,
    /// Continuation token for the next page, if the listing is unfinished.
    pub next_token: Option<String>,
    /// True once the underlying listing has been fully consumed.
    pub exhausted: bool,
    /// True once local (not yet uploaded) children have been merged.
    pub local_merged: bool,
}

/// An open directory.
pub struct DirHandle {
    pub ino: InodeNumber,
    pub stream: Mutex<DirStream>,
}

/// An open file.
///
/// A content-cache reference, when the handle has one, lives inside the
/// reader's cache context and is released when the reader is dropped.
pub struct FileHandle {
    pub ino: InodeNumber,
    pub write_allowed: bool,
    /// Reader strategy state; `None` until the first read.
    pub reader: Mutex<Option<FileReader>>,
    /// Writer scratch state; `None` for read-only handles.
    pub writer: Mutex<Option<FileWriter>>,
}

/// An open handle of either kind.
pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

impl Handle {
    pub fn ino(&self) -> InodeNumber {
        match self {
            Handle::File(h) => h.ino,
            Handle::Dir(h) => h.ino,
        }
    }

    pub fn as_file(&self) -> Result<&FileHandle, FsError> {
        match self {
            Handle::File(h) => Ok(h),
            Handle::Dir(_) => Err(FsError::IsADirectory("handle".to_string())),
        }
    }

    pub fn as_dir(&self) -> Result<&DirHandle, FsError> {
        match self {
            Handle::Dir(h) => Ok(h),
            Handle::File(_) => Err(FsError::NotADirectory("handle".to_string())),
        }
    }
}

/// Table of open handles, keyed by the numbers handed to the kernel.
pub struct HandleTable {
    handles: DashMap<u64, Arc<Handle>>,
    next_fh: AtomicU64,
    capacity: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Registers a handle, returning its number.
    pub fn insert(&self, handle: Handle) -> Result<u64, FsError> {
        if self.handles.len() >= self.capacity {
            return Err(FsError::TooManyOpen);
        }
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, Arc::new(handle));
        Ok(fh)
    }

    pub fn get(&self, fh: u64) -> Result<Arc<Handle>, FsError> {
        self.handles
            .get(&fh)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| FsError::Invalid(format!("unknown handle {fh}")))
    }

    /// Removes and returns a handle.
    pub fn remove(&self, fh: u64) -> Option<Arc<Handle>> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    /// Numbers of all currently open file handles.
    pub fn file_handle_numbers(&self) -> Vec<u64> {
        self.handles
            .iter()
            .filter(|r| matches!(r.value().as_ref(), Handle::File(_)))
            .map(|r| *r.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
