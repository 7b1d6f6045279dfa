//! Inode representation for the projected filesystem.
//!
//! Inodes are a tagged variant over directory, file and symlink state, with
//! per-variant payloads instead of inheritance. Reference counting follows
//! the FUSE kernel contract: `lookup_count` tracks kernel references via
//! `lookup`/`forget`, `open_handles` tracks open file and directory
//! handles, and an inode may be dropped from the table only when both are
//! zero.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use bucketfs_cache::TypeCache;
use bucketfs_core::config::MountConfig;
use bucketfs_core::domain::{Generation, Metageneration, ObjectMetadata, ObjectName};

/// A newtype wrapper for FUSE inode numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// Root inode number (always 1 per FUSE convention).
    pub const ROOT: InodeNumber = InodeNumber(1);

    pub fn new(val: u64) -> Self {
        InodeNumber(val)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for InodeNumber {
    fn from(val: u64) -> Self {
        InodeNumber(val)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Synchronization state of a file inode against the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Attributes mirror a bucket generation; no local modifications.
    Clean,
    /// Local writes exist that have not been flushed.
    Dirty,
    /// An upload of the local writes is in progress.
    Flushing,
    /// A flush or read lost the generation race; every subsequent
    /// operation on this inode reports a stale handle.
    Clobbered,
}

/// Mutable state of a file inode.
#[derive(Debug, Clone)]
pub struct FileState {
    /// Backing object key.
    pub object_name: ObjectName,
    /// Generation this inode was last synchronized against. `NONE` for a
    /// local file that has never been uploaded.
    pub generation: Generation,
    pub metageneration: Metageneration,
    pub size: u64,
    pub mtime: SystemTime,
    pub sync: SyncState,
    /// True for files created through the mount and not yet uploaded.
    pub local: bool,
}

impl FileState {
    /// State mirroring bucket metadata.
    pub fn from_metadata(metadata: &ObjectMetadata) -> Self {
        Self {
            object_name: metadata.name.clone(),
            generation: metadata.generation,
            metageneration: metadata.metageneration,
            size: metadata.size,
            mtime: metadata.updated.into(),
            sync: SyncState::Clean,
            local: false,
        }
    }

    /// State for a freshly created, never-uploaded file.
    pub fn new_local(object_name: ObjectName) -> Self {
        Self {
            object_name,
            generation: Generation::NONE,
            metageneration: Metageneration(0),
            size: 0,
            mtime: SystemTime::now(),
            sync: SyncState::Dirty,
            local: true,
        }
    }

    /// Applies the metadata of a successfully committed generation.
    pub fn committed(&mut self, metadata: &ObjectMetadata) {
        self.generation = metadata.generation;
        self.metageneration = metadata.metageneration;
        self.size = metadata.size;
        self.mtime = metadata.updated.into();
        self.sync = SyncState::Clean;
        self.local = false;
    }
}

/// State of a directory inode.
#[derive(Debug)]
pub struct DirState {
    /// Object-name prefix under which children live ("" for the root).
    pub prefix: String,
    /// True when no explicit `.../` marker object backs this directory.
    pub implicit: bool,
    /// Child-kind cache for name resolution under this directory.
    pub type_cache: TypeCache,
    /// Files created locally under this directory and not yet uploaded;
    /// merged into listings so they are visible immediately.
    pub local_children: Mutex<HashMap<String, InodeNumber>>,
}

impl DirState {
    pub fn new(prefix: String, implicit: bool, type_ttl: Duration, max_entries: usize) -> Self {
        Self {
            prefix,
            implicit,
            type_cache: TypeCache::new(type_ttl, max_entries),
            local_children: Mutex::new(HashMap::new()),
        }
    }
}

/// State of a symlink inode.
#[derive(Debug, Clone)]
pub struct SymlinkState {
    pub object_name: ObjectName,
    pub generation: Generation,
    pub target: String,
    pub mtime: SystemTime,
}

/// Per-variant payload of an inode.
#[derive(Debug)]
pub enum Variant {
    Dir(DirState),
    File(Mutex<FileState>),
    Symlink(Mutex<SymlinkState>),
}

/// In-memory representation of one inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    parent: InodeNumber,
    /// Entry name within the parent. May carry the conflict suffix when a
    /// sibling directory shares the bare name.
    name: String,
    lookup_count: AtomicU64,
    open_handles: AtomicU64,
    variant: Variant,
}

impl Inode {
    pub fn new(ino: InodeNumber, parent: InodeNumber, name: String, variant: Variant) -> Self {
        Self {
            ino,
            parent,
            name,
            lookup_count: AtomicU64::new(0),
            open_handles: AtomicU64::new(0),
            variant,
        }
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn parent(&self) -> InodeNumber {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    /// Directory state, or `None` for non-directories.
    pub fn as_dir(&self) -> Option<&DirState> {
        match &self.variant {
            Variant::Dir(state) => Some(state),
            _ => None,
        }
    }

    /// File state, or `None` for non-files.
    pub fn as_file(&self) -> Option<&Mutex<FileState>> {
        match &self.variant {
            Variant::File(state) => Some(state),
            _ => None,
        }
    }

    /// Symlink state, or `None` for non-symlinks.
    pub fn as_symlink(&self) -> Option<&Mutex<SymlinkState>> {
        match &self.variant {
            Variant::Symlink(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.variant, Variant::Dir(_))
    }

    /// FUSE file type of this inode.
    pub fn file_type(&self) -> fuser::FileType {
        match &self.variant {
            Variant::Dir(_) => fuser::FileType::Directory,
            Variant::File(_) => fuser::FileType::RegularFile,
            Variant::Symlink(_) => fuser::FileType::Symlink,
        }
    }

    /// Synthesizes FUSE attributes from the variant state and the mount's
    /// permission configuration.
    pub fn to_file_attr(&self, mount: &MountConfig) -> fuser::FileAttr {
        let uid = mount.uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = mount.gid.unwrap_or_else(|| unsafe { libc::getgid() });

        let (size, mtime, kind, perm, nlink) = match &self.variant {
            Variant::Dir(_) => (
                0,
                SystemTime::UNIX_EPOCH,
                fuser::FileType::Directory,
                mount.dir_mode,
                2,
            ),
            Variant::File(state) => {
                let state = state.lock().unwrap();
                (
                    state.size,
                    state.mtime,
                    fuser::FileType::RegularFile,
                    mount.file_mode,
                    1,
                )
            }
            Variant::Symlink(state) => {
                let state = state.lock().unwrap();
                (
                    state.target.len() as u64,
                    state.mtime,
                    fuser::FileType::Symlink,
                    0o777,
                    1,
                )
            }
        };

        fuser::FileAttr {
            ino: self.ino.get(),
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// Records a kernel reference (one per successful lookup).
    pub fn increment_lookup(&self) {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops `count` kernel references and returns the new count.
    pub fn decrement_lookup_by(&self, count: u64) -> u64 {
        let prev = self.lookup_count.load(Ordering::SeqCst);
        let take = count.min(prev);
        self.lookup_count.fetch_sub(take, Ordering::SeqCst) - take
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::SeqCst)
    }

    /// Records an open handle.
    pub fn increment_open_handles(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops an open handle and returns the new count.
    pub fn decrement_open_handles(&self) -> u64 {
        self.open_handles.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn open_handles(&self) -> u64 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// True when neither the kernel nor any handle references this inode.
    pub fn is_destroyable(&self) -> bool {
        self.lookup_count() == 0 && self.open_handles() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_inode(ino: u64, name: &str) -> Inode {
        let metadata = ObjectMetadata::new(
            ObjectName::new(name).unwrap(),
            Generation(4),
            128,
        );
        Inode::new(
            InodeNumber::new(ino),
            InodeNumber::ROOT,
            name.to_string(),
            Variant::File(Mutex::new(FileState::from_metadata(&metadata))),
        )
    }

    #[test]
    fn test_reference_counting_gates_destruction() {
        let inode = file_inode(5, "a");
        assert!(inode.is_destroyable());

        inode.increment_lookup();
        inode.increment_open_handles();
        assert!(!inode.is_destroyable());

        assert_eq!(inode.decrement_lookup_by(1), 0);
        assert!(!inode.is_destroyable());

        assert_eq!(inode.decrement_open_handles(), 0);
        assert!(inode.is_destroyable());
    }

    #[test]
    fn test_forget_never_underflows() {
        let inode = file_inode(5, "a");
        inode.increment_lookup();
        assert_eq!(inode.decrement_lookup_by(100), 0);
        assert_eq!(inode.lookup_count(), 0);
    }

    #[test]
    fn test_file_attr_uses_mount_modes() {
        let mount = MountConfig {
            file_mode: 0o640,
            uid: Some(1000),
            gid: Some(1000),
            ..MountConfig::default()
        };
        let inode = file_inode(9, "a");
        let attr = inode.to_file_attr(&mount);
        assert_eq!(attr.ino, 9);
        assert_eq!(attr.size, 128);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
    }

    #[test]
    fn test_local_file_state() {
        let state = FileState::new_local(ObjectName::new("newfile").unwrap());
        assert_eq!(state.generation, Generation::NONE);
        assert!(state.local);
        assert_eq!(state.sync, SyncState::Dirty);
    }

    #[test]
    fn test_committed_clears_local_and_bumps_generation() {
        let mut state = FileState::new_local(ObjectName::new("newfile").unwrap());
        let metadata = ObjectMetadata::new(
            ObjectName::new("newfile").unwrap(),
            Generation(7),
            10,
        );
        state.committed(&metadata);
        assert_eq!(state.generation, Generation(7));
        assert_eq!(state.sync, SyncState::Clean);
        assert!(!state.local);
        assert_eq!(state.size, 10);
    }
}
