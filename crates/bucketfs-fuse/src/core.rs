//! The operation dispatcher core.
//!
//! `FsCore` owns the inode table, the handle table, the bucket capability
//! and the caches, and implements every filesystem operation as an async
//! method returning `Result<_, FsError>`. The `fuser::Filesystem`
//! implementation in [`crate::filesystem`] is a thin synchronous bridge
//! over this type; integration tests drive it directly.
//!
//! Locking follows the per-entity rule: inode state sits behind the
//! inode's own mutex, handle state behind the handle's mutexes, cache
//! tables behind their own locks. No lock is held across a bucket call
//! except the handle mutex serializing that one handle's I/O.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bucketfs_cache::{ChildKind, DownloadJob, DownloadMode, FileCacheManager};
use bucketfs_core::config::Config;
use bucketfs_core::domain::{
    name::CONFLICT_SUFFIX, object::SYMLINK_TARGET_KEY, Generation, ObjectMetadata, ObjectName,
    StoreError,
};
use bucketfs_core::ports::object_store::{CreateRequest, ListRequest, ObjectStore, ReadRequest};
use bucketfs_store::{Bucket, RequestLimiter, RetryPolicy};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FsError;
use crate::handle::{DirEntry, DirHandle, DirStream, FileHandle, Handle, HandleTable};
use crate::inode::{root_inode, InodeTable};
use crate::inode_entry::{DirState, FileState, Inode, SymlinkState, SyncState, Variant};
use crate::reader::{CacheContext, FileReader, ReaderConfig};
use crate::writer::FileWriter;

/// Maximum filename length in bytes (POSIX NAME_MAX).
const NAME_MAX: usize = 255;

/// Listing page size used by readdir and probes.
const LIST_PAGE_SIZE: usize = 1000;

/// Upper bound on simultaneously open handles.
const MAX_OPEN_HANDLES: usize = 1 << 16;

/// Result of a name resolution: the inode plus its current attributes.
pub struct Resolved {
    pub inode: Arc<Inode>,
    pub attr: fuser::FileAttr,
}

/// The dispatcher core shared by all operations.
pub struct FsCore {
    config: Config,
    bucket: Arc<Bucket>,
    /// The bucket, as the trait object handed to readers and writers.
    store: Arc<dyn ObjectStore>,
    inodes: InodeTable,
    handles: HandleTable,
    file_cache: Option<Arc<FileCacheManager>>,
    reader_config: ReaderConfig,
    /// Cancelled at unmount; download jobs and waits observe it.
    shutdown: CancellationToken,
}

impl FsCore {
    /// Builds the core over an inner store implementation (the HTTP client
    /// in production, the fake in tests).
    pub fn new(config: Config, inner: Arc<dyn ObjectStore>) -> Result<Self, FsError> {
        let limiter = Arc::new(RequestLimiter::new(
            config.store.op_rate_limit,
            config.store.egress_bandwidth_limit,
        ));
        let retry = RetryPolicy::new(
            Duration::from_secs(config.store.max_retry_sleep),
            config.store.max_retry_attempts,
        );
        let stat_cache = Arc::new(bucketfs_cache::StatCache::new(
            config.metadata_cache.stat_cache_capacity,
            Duration::from_secs(config.metadata_cache.stat_cache_ttl),
        ));
        let bucket = Arc::new(Bucket::new(
            inner,
            limiter,
            retry,
            stat_cache,
            Duration::from_secs(config.store.request_timeout),
        ));
        let store: Arc<dyn ObjectStore> = Arc::clone(&bucket) as Arc<dyn ObjectStore>;

        let file_cache = if config.file_cache.max_size_mb > 0 {
            Some(Arc::new(FileCacheManager::new(
                config.file_cache.dir.clone(),
                config.file_cache.max_size_mb * (1 << 20),
                config.file_cache.download_chunk_size_mb.max(1) * (1 << 20),
            )?))
        } else {
            None
        };

        let reader_config = ReaderConfig {
            sequential_window: config.read.sequential_read_size_mb.max(1) * (1 << 20),
            prefetch_block: config.file_cache.download_chunk_size_mb.max(1) * (1 << 20),
            prefetch_workers: if config.file_cache.enable_parallel_downloads
                && config.file_cache.max_size_mb == 0
            {
                config.file_cache.parallel_downloads_per_file
            } else {
                0
            },
        };

        let inodes = InodeTable::new();
        inodes.insert(root_inode(
            Duration::from_secs(config.metadata_cache.type_cache_ttl),
            config.metadata_cache.type_cache_max_entries_per_dir,
            &config.mount.only_dir,
        ));

        Ok(Self {
            config,
            bucket,
            store,
            inodes,
            handles: HandleTable::new(MAX_OPEN_HANDLES),
            file_cache,
            reader_config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// The content-cache manager, when a cache budget is configured.
    pub fn file_cache(&self) -> Option<&Arc<FileCacheManager>> {
        self.file_cache.as_ref()
    }

    /// Signals unmount: wakes waiters and stops background downloads.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn type_ttl(&self) -> Duration {
        Duration::from_secs(self.config.metadata_cache.type_cache_ttl)
    }

    fn type_cache_bound(&self) -> usize {
        self.config.metadata_cache.type_cache_max_entries_per_dir
    }

    fn get_inode(&self, ino: u64) -> Result<Arc<Inode>, FsError> {
        self.inodes
            .get(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    fn get_dir(&self, ino: u64) -> Result<Arc<Inode>, FsError> {
        let inode = self.get_inode(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {ino}")));
        }
        Ok(inode)
    }

    fn validate_name(name: &str) -> Result<(), FsError> {
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsError::Invalid(format!("bad entry name {name:?}")));
        }
        Ok(())
    }

    // ======================================================================
    // Name resolution
    // ======================================================================

    /// Looks up `name` under the directory inode `parent`.
    ///
    /// Consultation order: local-file registry, type cache, stat of the
    /// file spelling, stat of the directory-marker spelling, and (with
    /// implicit directories enabled) a list probe. A name carrying the
    /// conflict suffix resolves the file side directly.
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<Resolved, FsError> {
        Self::validate_name(name)?;
        let parent_inode = self.get_dir(parent)?;
        let dir = parent_inode.as_dir().expect("directory checked");

        // Locally created files are visible before their first upload.
        let local_ino = dir.local_children.lock().unwrap().get(name).copied();
        if let Some(ino) = local_ino {
            if let Some(inode) = self.inodes.get(ino.get()) {
                inode.increment_lookup();
                let attr = inode.to_file_attr(&self.config.mount);
                return Ok(Resolved { inode, attr });
            }
        }

        let (base, wants_conflict_file) = match name.strip_suffix(CONFLICT_SUFFIX) {
            Some(base) => (base, true),
            None => (name, false),
        };
        let file_name = self.child_object_name(dir, base)?;
        let marker_name = file_name.as_dir_marker();

        // The suffixed spelling bypasses the directory side entirely.
        if wants_conflict_file {
            let metadata = self.stat_optional(&file_name).await?;
            let Some(metadata) = metadata else {
                return Err(FsError::NotFound(name.to_string()));
            };
            return self.install_file_inode(&parent_inode, name, &metadata);
        }

        // Type-cache hint narrows the stats we need.
        let hint = dir.type_cache.get(base);
        let (file_meta, dir_exists, implicit) = match hint {
            Some(ChildKind::NonExistent) => {
                return Err(FsError::NotFound(name.to_string()));
            }
            Some(ChildKind::File) | Some(ChildKind::Symlink) => {
                match self.stat_optional(&file_name).await? {
                    Some(metadata) => (Some(metadata), false, false),
                    None => {
                        // The hint and the stat disagree: drop the hint and
                        // resolve from scratch.
                        dir.type_cache.invalidate(base);
                        self.bucket.invalidate_stat(&file_name);
                        self.resolve_uncached(&file_name, &marker_name).await?
                    }
                }
            }
            Some(ChildKind::Dir) => match self.stat_optional(&marker_name).await? {
                Some(_) => (None, true, false),
                None => {
                    if self.config.mount.implicit_directories
                        && self.probe_implicit(&marker_name).await?
                    {
                        (None, true, true)
                    } else {
                        dir.type_cache.invalidate(base);
                        self.bucket.invalidate_stat(&marker_name);
                        self.resolve_uncached(&file_name, &marker_name).await?
                    }
                }
            },
            None => self.resolve_uncached(&file_name, &marker_name).await?,
        };

        match (file_meta, dir_exists) {
            (Some(_), true) => {
                // Conflict: the directory owns the bare name; the file is
                // reachable with the suffix.
                dir.type_cache.insert(base, ChildKind::Dir);
                debug!(name = base, "file/directory name conflict, directory wins");
                self.install_dir_inode(&parent_inode, base, &marker_name, implicit)
            }
            (Some(metadata), false) => {
                let kind = if metadata.is_symlink() {
                    ChildKind::Symlink
                } else {
                    ChildKind::File
                };
                dir.type_cache.insert(base, kind);
                self.install_file_inode(&parent_inode, base, &metadata)
            }
            (None, true) => {
                dir.type_cache.insert(base, ChildKind::Dir);
                self.install_dir_inode(&parent_inode, base, &marker_name, implicit)
            }
            (None, false) => {
                dir.type_cache.insert(base, ChildKind::NonExistent);
                Err(FsError::NotFound(name.to_string()))
            }
        }
    }

    /// Full resolution with no usable hint: stat both spellings, then the
    /// implicit-directory probe.
    async fn resolve_uncached(
        &self,
        file_name: &ObjectName,
        marker_name: &ObjectName,
    ) -> Result<(Option<ObjectMetadata>, bool, bool), FsError> {
        let file_meta = self.stat_optional(file_name).await?;
        let dir_exists = self.stat_optional(marker_name).await?.is_some();
        if file_meta.is_none()
            && !dir_exists
            && self.config.mount.implicit_directories
            && self.probe_implicit(marker_name).await?
        {
            return Ok((None, true, true));
        }
        Ok((file_meta, dir_exists, false))
    }

    /// Stat that treats not-found as `None`.
    async fn stat_optional(&self, name: &ObjectName) -> Result<Option<ObjectMetadata>, FsError> {
        match self.bucket.stat_object(name).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True when any object lives under the would-be directory's prefix.
    async fn probe_implicit(&self, marker_name: &ObjectName) -> Result<bool, FsError> {
        let req = ListRequest::directory(marker_name.as_str(), 1);
        let listing = self.bucket.list_objects(&req).await?;
        Ok(!listing.objects.is_empty() || !listing.prefixes.is_empty())
    }

    fn child_object_name(&self, dir: &DirState, base: &str) -> Result<ObjectName, FsError> {
        ObjectName::new(format!("{}{}", dir.prefix, base))
            .map_err(|e| FsError::Invalid(e.to_string()))
    }

    /// Creates or refreshes the inode for a resolved file or symlink.
    fn install_file_inode(
        &self,
        parent: &Arc<Inode>,
        visible_name: &str,
        metadata: &ObjectMetadata,
    ) -> Result<Resolved, FsError> {
        if let Some(existing) = self.inodes.lookup_child(parent.ino(), visible_name) {
            match (&existing.variant(), metadata.is_symlink()) {
                (Variant::File(state), false) => {
                    // Refresh only clean inodes; local edits and clobber
                    // records must not be stomped by a background stat.
                    let mut state = state.lock().unwrap();
                    if state.sync == SyncState::Clean {
                        *state = FileState::from_metadata(metadata);
                    }
                    drop(state);
                    existing.increment_lookup();
                    let attr = existing.to_file_attr(&self.config.mount);
                    return Ok(Resolved {
                        inode: existing,
                        attr,
                    });
                }
                (Variant::Symlink(state), true) => {
                    let mut state = state.lock().unwrap();
                    state.generation = metadata.generation;
                    state.target = metadata.symlink_target().unwrap_or_default().to_string();
                    drop(state);
                    existing.increment_lookup();
                    let attr = existing.to_file_attr(&self.config.mount);
                    return Ok(Resolved {
                        inode: existing,
                        attr,
                    });
                }
                _ => {
                    // The entry changed kind out-of-band; retire the old
                    // inode's name binding.
                    self.inodes.unlink_name(parent.ino(), visible_name);
                }
            }
        }

        let ino = self.inodes.allocate();
        let variant = if metadata.is_symlink() {
            Variant::Symlink(std::sync::Mutex::new(SymlinkState {
                object_name: metadata.name.clone(),
                generation: metadata.generation,
                target: metadata.symlink_target().unwrap_or_default().to_string(),
                mtime: metadata.updated.into(),
            }))
        } else {
            Variant::File(std::sync::Mutex::new(FileState::from_metadata(metadata)))
        };
        let inode = self.inodes.insert(Inode::new(
            ino,
            parent.ino(),
            visible_name.to_string(),
            variant,
        ));
        inode.increment_lookup();
        let attr = inode.to_file_attr(&self.config.mount);
        Ok(Resolved { inode, attr })
    }

    /// Creates or reuses the inode for a resolved directory.
    fn install_dir_inode(
        &self,
        parent: &Arc<Inode>,
        visible_name: &str,
        marker_name: &ObjectName,
        implicit: bool,
    ) -> Result<Resolved, FsError> {
        if let Some(existing) = self.inodes.lookup_child(parent.ino(), visible_name) {
            if existing.is_dir() {
                existing.increment_lookup();
                let attr = existing.to_file_attr(&self.config.mount);
                return Ok(Resolved {
                    inode: existing,
                    attr,
                });
            }
            self.inodes.unlink_name(parent.ino(), visible_name);
        }

        let ino = self.inodes.allocate();
        let inode = self.inodes.insert(Inode::new(
            ino,
            parent.ino(),
            visible_name.to_string(),
            Variant::Dir(DirState::new(
                marker_name.as_str().to_string(),
                implicit,
                self.type_ttl(),
                self.type_cache_bound(),
            )),
        ));
        inode.increment_lookup();
        let attr = inode.to_file_attr(&self.config.mount);
        Ok(Resolved { inode, attr })
    }

    // ======================================================================
    // Attributes
    // ======================================================================

    /// Returns current attributes, refreshing clean file inodes from the
    /// (TTL-bounded) stat cache.
    pub async fn getattr(&self, ino: u64) -> Result<fuser::FileAttr, FsError> {
        let inode = self.get_inode(ino)?;
        if let Some(state) = inode.as_file() {
            let (object_name, refreshable) = {
                let state = state.lock().unwrap();
                (
                    state.object_name.clone(),
                    state.sync == SyncState::Clean && !state.local,
                )
            };
            if refreshable {
                match self.stat_optional(&object_name).await? {
                    Some(metadata) => {
                        let mut state = state.lock().unwrap();
                        if state.sync == SyncState::Clean {
                            *state = FileState::from_metadata(&metadata);
                        }
                    }
                    None => {
                        // Deleted out-of-band; keep serving the last known
                        // attributes until the kernel forgets the inode.
                        debug!(name = %object_name, "backing object gone, serving stale attributes");
                    }
                }
            }
        }
        Ok(inode.to_file_attr(&self.config.mount))
    }

    /// Applies attribute changes. Size changes go through the write path;
    /// ownership and mode changes are not supported on object storage and
    /// are silently ignored, matching the synthesized-permissions model.
    pub async fn setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        mtime: Option<SystemTime>,
        fh: Option<u64>,
    ) -> Result<fuser::FileAttr, FsError> {
        let inode = self.get_inode(ino)?;

        if let Some(new_size) = size {
            self.truncate(&inode, new_size, fh).await?;
        }
        if let Some(mtime) = mtime {
            if let Some(state) = inode.as_file() {
                state.lock().unwrap().mtime = mtime;
            }
        }
        Ok(inode.to_file_attr(&self.config.mount))
    }

    async fn truncate(
        &self,
        inode: &Arc<Inode>,
        new_size: u64,
        fh: Option<u64>,
    ) -> Result<(), FsError> {
        let state = inode
            .as_file()
            .ok_or_else(|| FsError::IsADirectory(inode.name().to_string()))?;
        if state.lock().unwrap().sync == SyncState::Clobbered {
            return Err(FsError::StaleHandle(inode.name().to_string()));
        }

        // Prefer an open write handle's scratch store.
        if let Some(fh) = fh {
            if let Ok(handle) = self.handles.get(fh) {
                if let Ok(file_handle) = handle.as_file() {
                    let mut writer = file_handle.writer.lock().await;
                    if let Some(writer) = writer.as_mut() {
                        writer.truncate(new_size)?;
                        let mut state = state.lock().unwrap();
                        state.size = new_size;
                        state.sync = SyncState::Dirty;
                        state.mtime = SystemTime::now();
                        return Ok(());
                    }
                }
            }
        }

        // No write handle: commit a truncated generation directly.
        let (object_name, generation, local) = {
            let state = state.lock().unwrap();
            (state.object_name.clone(), state.generation, state.local)
        };
        if local {
            // Never uploaded and no scratch to adjust through this path.
            let mut state = state.lock().unwrap();
            state.size = new_size;
            return Ok(());
        }

        let mut contents = if new_size > 0 {
            self.store
                .read_object(&ReadRequest {
                    name: object_name.clone(),
                    generation,
                    range: 0..new_size,
                })
                .await
                .map_err(FsError::from)?
        } else {
            Vec::new()
        };
        contents.resize(new_size as usize, 0);

        let metadata = self
            .store
            .create_object(CreateRequest::new(object_name, contents).if_generation(generation))
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed { name, .. } => {
                    state.lock().unwrap().sync = SyncState::Clobbered;
                    FsError::StaleHandle(name)
                }
                other => other.into(),
            })?;
        state.lock().unwrap().committed(&metadata);
        Ok(())
    }

    /// Drops kernel references (forget / batch-forget).
    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    // ======================================================================
    // Directories
    // ======================================================================

    /// Opens a directory handle.
    pub fn opendir(&self, ino: u64) -> Result<u64, FsError> {
        let inode = self.get_dir(ino)?;
        inode.increment_open_handles();
        let fh = self.handles.insert(Handle::Dir(DirHandle {
            ino: inode.ino(),
            stream: Mutex::new(DirStream::default()),
        }));
        match fh {
            Ok(fh) => Ok(fh),
            Err(e) => {
                inode.decrement_open_handles();
                Err(e)
            }
        }
    }

    /// Returns the directory entries at `offset` and beyond, fetching more
    /// pages as needed. The returned slice order is stable across calls on
    /// the same handle.
    pub async fn readdir(
        &self,
        fh: u64,
        offset: usize,
        max_entries: usize,
    ) -> Result<Vec<(usize, DirEntry)>, FsError> {
        let handle = self.handles.get(fh)?;
        let dir_handle = handle.as_dir()?;
        let inode = self.get_dir(dir_handle.ino.get())?;
        let dir = inode.as_dir().expect("directory checked");

        let mut stream = dir_handle.stream.lock().await;
        while !stream.exhausted && stream.entries.len() < offset + max_entries {
            self.fill_next_page(dir, &mut stream).await?;
        }

        Ok(stream
            .entries
            .iter()
            .enumerate()
            .skip(offset)
            .take(max_entries)
            .map(|(i, e)| (i, e.clone()))
            .collect())
    }

    /// Fetches one listing page into the stream, merging objects and
    /// prefixes in lexicographic order and resolving name conflicts.
    async fn fill_next_page(&self, dir: &DirState, stream: &mut DirStream) -> Result<(), FsError> {
        let req = ListRequest::directory(dir.prefix.clone(), LIST_PAGE_SIZE)
            .with_token(stream.next_token.clone());
        let listing = self.bucket.list_objects(&req).await?;

        // Objects and prefixes each arrive sorted; merge them so the
        // combined snapshot stays sorted.
        let mut objects = listing.objects.into_iter().peekable();
        let mut prefixes = listing.prefixes.into_iter().peekable();

        loop {
            let take_object = match (objects.peek(), prefixes.peek()) {
                (Some(o), Some(p)) => o.name.as_str() < p.as_str(),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            if take_object {
                let metadata = objects.next().expect("peeked");
                // The directory's own marker is not a child.
                if metadata.name.as_str() == dir.prefix {
                    continue;
                }
                if metadata.name.is_dir_marker() {
                    // A nested marker like `a/b/` also surfaces through the
                    // prefixes side; skip the object spelling.
                    continue;
                }
                let base = metadata.name.base_name().to_string();
                let kind = if metadata.is_symlink() {
                    dir.type_cache.insert(&base, ChildKind::Symlink);
                    fuser::FileType::Symlink
                } else {
                    dir.type_cache.insert(&base, ChildKind::File);
                    fuser::FileType::RegularFile
                };
                // Listings carry full metadata; warm the stat cache so the
                // getattr that typically follows is free.
                self.bucket.stat_cache().insert(metadata.clone());
                stream.entries.push(DirEntry { name: base, kind });
            } else {
                let prefix = prefixes.next().expect("peeked");
                let base = prefix
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or("")
                    .to_string();
                if base.is_empty() {
                    continue;
                }
                // An object `x` sorts immediately before the prefix `x/`;
                // when both exist the directory takes the bare name and the
                // file moves to the suffixed spelling, keeping the snapshot
                // sorted ("x" < "x\n").
                let conflict = stream
                    .entries
                    .last()
                    .is_some_and(|e| e.kind != fuser::FileType::Directory && e.name == base);
                dir.type_cache.insert(&base, ChildKind::Dir);
                let entry = DirEntry {
                    name: base,
                    kind: fuser::FileType::Directory,
                };
                if conflict {
                    let file_entry = stream.entries.last_mut().expect("conflict checked");
                    file_entry.name.push(CONFLICT_SUFFIX);
                    let at = stream.entries.len() - 1;
                    stream.entries.insert(at, entry);
                } else {
                    stream.entries.push(entry);
                }
            }
        }

        stream.next_token = listing.next_token;
        if stream.next_token.is_none() {
            stream.exhausted = true;
            self.merge_local_children(dir, stream);
        }
        Ok(())
    }

    /// Appends locally created, not-yet-uploaded files that the remote
    /// listing cannot know about.
    fn merge_local_children(&self, dir: &DirState, stream: &mut DirStream) {
        let local = dir.local_children.lock().unwrap();
        if local.is_empty() || stream.local_merged {
            return;
        }
        let mut names: Vec<&String> = local.keys().collect();
        names.sort();
        for name in names {
            if stream.entries.iter().any(|e| &e.name == name) {
                continue;
            }
            stream.entries.push(DirEntry {
                name: name.clone(),
                kind: fuser::FileType::RegularFile,
            });
        }
        stream.local_merged = true;
    }

    /// Releases a directory handle.
    pub fn releasedir(&self, fh: u64) -> Result<(), FsError> {
        if let Some(handle) = self.handles.remove(fh) {
            let ino = handle.ino().get();
            if let Some(inode) = self.inodes.get(ino) {
                inode.decrement_open_handles();
            }
            self.inodes.reap_if_unreferenced(ino);
        }
        Ok(())
    }

    /// Creates an explicit directory.
    pub async fn mkdir(&self, parent: u64, name: &str) -> Result<Resolved, FsError> {
        Self::validate_name(name)?;
        let parent_inode = self.get_dir(parent)?;
        let dir = parent_inode.as_dir().expect("directory checked");
        let marker = self.child_object_name(dir, name)?.as_dir_marker();

        self.bucket
            .create_object(
                CreateRequest::new(marker.clone(), Vec::new()).if_generation(Generation::NONE),
            )
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed { name, .. } | StoreError::AlreadyExists(name) => {
                    FsError::Exists(name)
                }
                other => other.into(),
            })?;

        dir.type_cache.insert(name, ChildKind::Dir);
        self.install_dir_inode(&parent_inode, name, &marker, false)
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<(), FsError> {
        Self::validate_name(name)?;
        let parent_inode = self.get_dir(parent)?;
        let parent_dir = parent_inode.as_dir().expect("directory checked");
        let marker = self.child_object_name(parent_dir, name)?.as_dir_marker();

        // Emptiness: any object or prefix under the directory's prefix,
        // other than its own marker, blocks removal.
        let listing = self
            .bucket
            .list_objects(&ListRequest::directory(marker.as_str(), 2))
            .await?;
        let occupied = listing
            .objects
            .iter()
            .any(|o| o.name.as_str() != marker.as_str())
            || !listing.prefixes.is_empty();
        if occupied {
            return Err(FsError::NotEmpty(name.to_string()));
        }
        if let Some(child) = self.inodes.lookup_child(parent_inode.ino(), name) {
            if let Some(dir) = child.as_dir() {
                if !dir.local_children.lock().unwrap().is_empty() {
                    return Err(FsError::NotEmpty(name.to_string()));
                }
            }
        }

        match self.bucket.delete_object(&marker, None).await {
            Ok(()) => {}
            // An implicit directory has no marker to delete.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        parent_dir.type_cache.invalidate(name);
        self.inodes.unlink_name(parent_inode.ino(), name);
        Ok(())
    }

    // ======================================================================
    // File creation and removal
    // ======================================================================

    /// Creates a new local file and opens a write handle to it.
    ///
    /// The file exists only in this mount until the first flush commits it
    /// with a must-not-exist precondition.
    pub async fn create_file(&self, parent: u64, name: &str) -> Result<(Resolved, u64), FsError> {
        Self::validate_name(name)?;
        if name.contains(CONFLICT_SUFFIX) {
            return Err(FsError::Invalid(format!("bad entry name {name:?}")));
        }
        let parent_inode = self.get_dir(parent)?;
        let dir = parent_inode.as_dir().expect("directory checked");
        let object_name = self.child_object_name(dir, name)?;

        let ino = self.inodes.allocate();
        let inode = self.inodes.insert(Inode::new(
            ino,
            parent_inode.ino(),
            name.to_string(),
            Variant::File(std::sync::Mutex::new(FileState::new_local(
                object_name.clone(),
            ))),
        ));
        inode.increment_lookup();
        dir.local_children
            .lock()
            .unwrap()
            .insert(name.to_string(), ino);
        dir.type_cache.insert(name, ChildKind::File);
        // A prior failed lookup may have left a negative entry behind.
        self.bucket.invalidate_stat(&object_name);

        let streaming = self
            .config
            .write
            .enable_streaming_writes
            .then(|| (self.config.write.write_buffer_size_mb.max(1) << 20) as usize);
        let writer = FileWriter::new_empty(
            &self.config.write.scratch_dir,
            object_name,
            streaming,
        )?;

        inode.increment_open_handles();
        let fh = self.handles.insert(Handle::File(FileHandle {
            ino,
            write_allowed: true,
            reader: Mutex::new(None),
            writer: Mutex::new(Some(writer)),
        }))?;

        let attr = inode.to_file_attr(&self.config.mount);
        Ok((Resolved { inode, attr }, fh))
    }

    /// Creates an empty file object immediately (mknod path: no handle is
    /// opened, so there is no scratch store to defer the upload into).
    pub async fn mknod(&self, parent: u64, name: &str) -> Result<Resolved, FsError> {
        Self::validate_name(name)?;
        if name.contains(CONFLICT_SUFFIX) {
            return Err(FsError::Invalid(format!("bad entry name {name:?}")));
        }
        let parent_inode = self.get_dir(parent)?;
        let dir = parent_inode.as_dir().expect("directory checked");
        let object_name = self.child_object_name(dir, name)?;

        let metadata = self
            .bucket
            .create_object(
                CreateRequest::new(object_name, Vec::new()).if_generation(Generation::NONE),
            )
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed { name, .. } | StoreError::AlreadyExists(name) => {
                    FsError::Exists(name)
                }
                other => other.into(),
            })?;

        dir.type_cache.insert(name, ChildKind::File);
        self.install_file_inode(&parent_inode, name, &metadata)
    }

    /// Creates a symlink object.
    pub async fn symlink(&self, parent: u64, name: &str, target: &str) -> Result<Resolved, FsError> {
        Self::validate_name(name)?;
        let parent_inode = self.get_dir(parent)?;
        let dir = parent_inode.as_dir().expect("directory checked");
        let object_name = self.child_object_name(dir, name)?;

        let mut request =
            CreateRequest::new(object_name, Vec::new()).if_generation(Generation::NONE);
        request
            .metadata
            .insert(SYMLINK_TARGET_KEY.to_string(), target.to_string());

        let metadata = self.bucket.create_object(request).await.map_err(|e| match e {
            StoreError::PreconditionFailed { name, .. } | StoreError::AlreadyExists(name) => {
                FsError::Exists(name)
            }
            other => other.into(),
        })?;

        dir.type_cache.insert(name, ChildKind::Symlink);
        self.install_file_inode(&parent_inode, name, &metadata)
    }

    /// Reads a symlink's target.
    pub fn readlink(&self, ino: u64) -> Result<String, FsError> {
        let inode = self.get_inode(ino)?;
        let state = inode
            .as_symlink()
            .ok_or_else(|| FsError::Invalid(format!("inode {ino} is not a symlink")))?;
        let target = state.lock().unwrap().target.clone();
        Ok(target)
    }

    /// Removes a file or symlink.
    pub async fn unlink(&self, parent: u64, name: &str) -> Result<(), FsError> {
        Self::validate_name(name)?;
        let parent_inode = self.get_dir(parent)?;
        let dir = parent_inode.as_dir().expect("directory checked");

        // A local file that was never uploaded has nothing in the bucket.
        let local = dir.local_children.lock().unwrap().remove(name);
        if let Some(ino) = local {
            dir.type_cache.invalidate(name);
            self.inodes.unlink_name(parent_inode.ino(), name);
            self.inodes.reap_if_unreferenced(ino.get());
            return Ok(());
        }

        let base = name.strip_suffix(CONFLICT_SUFFIX).unwrap_or(name);
        let object_name = self.child_object_name(dir, base)?;

        match self.bucket.delete_object(&object_name, None).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Err(FsError::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        }

        dir.type_cache.invalidate(base);
        if let Some(cache) = &self.file_cache {
            cache.invalidate(&object_name);
        }
        self.inodes.unlink_name(parent_inode.ino(), name);
        Ok(())
    }

    // ======================================================================
    // Rename
    // ======================================================================

    /// Renames a file or directory.
    ///
    /// Files move by copy-with-precondition then delete-with-precondition;
    /// directories move entry-by-entry, bounded by `rename_dir_limit`, and
    /// are not atomic.
    pub async fn rename(
        &self,
        src_parent: u64,
        src_name: &str,
        dst_parent: u64,
        dst_name: &str,
    ) -> Result<(), FsError> {
        Self::validate_name(src_name)?;
        Self::validate_name(dst_name)?;
        let src_parent_inode = self.get_dir(src_parent)?;
        let dst_parent_inode = self.get_dir(dst_parent)?;
        let src_dir = src_parent_inode.as_dir().expect("directory checked");
        let dst_dir = dst_parent_inode.as_dir().expect("directory checked");

        let resolved = self.lookup(src_parent, src_name).await?;
        // The lookup reference belongs to this operation, not the kernel.
        resolved.inode.decrement_lookup_by(1);

        if resolved.inode.is_dir() {
            let src_prefix = self
                .child_object_name(src_dir, src_name.trim_end_matches(CONFLICT_SUFFIX))?
                .as_dir_marker();
            let dst_prefix = self.child_object_name(dst_dir, dst_name)?.as_dir_marker();
            self.rename_dir(&src_prefix, &dst_prefix).await?;
        } else {
            let base = src_name.strip_suffix(CONFLICT_SUFFIX).unwrap_or(src_name);
            let src_obj = self.child_object_name(src_dir, base)?;
            let dst_obj = self.child_object_name(dst_dir, dst_name)?;
            let generation = self.bucket.stat_object(&src_obj).await?.generation;

            self.bucket
                .copy_object(&src_obj, generation, &dst_obj, None)
                .await?;
            self.bucket
                .delete_object(&src_obj, Some(generation))
                .await?;
            if let Some(cache) = &self.file_cache {
                cache.invalidate(&src_obj);
                cache.invalidate(&dst_obj);
            }
        }

        src_dir.type_cache.invalidate(src_name);
        dst_dir.type_cache.invalidate(dst_name);
        self.inodes.unlink_name(src_parent_inode.ino(), src_name);
        self.inodes.unlink_name(dst_parent_inode.ino(), dst_name);
        Ok(())
    }

    async fn rename_dir(
        &self,
        src_prefix: &ObjectName,
        dst_prefix: &ObjectName,
    ) -> Result<(), FsError> {
        // Enumerate everything below the source before touching anything,
        // so an over-budget rename has no observable effect.
        let mut names: Vec<ObjectMetadata> = Vec::new();
        let mut req = ListRequest {
            prefix: src_prefix.as_str().to_string(),
            delimiter: None,
            continuation_token: None,
            max_results: LIST_PAGE_SIZE,
        };
        loop {
            let listing = self.bucket.list_objects(&req).await?;
            names.extend(listing.objects);
            match listing.next_token {
                Some(token) => req.continuation_token = Some(token),
                None => break,
            }
        }

        let entry_count = names
            .iter()
            .filter(|m| m.name.as_str() != src_prefix.as_str())
            .count();
        if entry_count > self.config.mount.rename_dir_limit {
            info!(
                src = %src_prefix,
                entries = entry_count,
                limit = self.config.mount.rename_dir_limit,
                "directory rename over budget, refusing"
            );
            return Err(FsError::Invalid(format!(
                "directory {src_prefix} has {entry_count} entries, rename limit is {}",
                self.config.mount.rename_dir_limit
            )));
        }

        for metadata in names {
            let suffix = &metadata.name.as_str()[src_prefix.as_str().len()..];
            let dst_name = ObjectName::new(format!("{}{}", dst_prefix.as_str(), suffix))
                .map_err(|e| FsError::Invalid(e.to_string()))?;
            self.bucket
                .copy_object(&metadata.name, metadata.generation, &dst_name, None)
                .await?;
            self.bucket
                .delete_object(&metadata.name, Some(metadata.generation))
                .await?;
        }
        // An implicit source directory has no marker; make sure the
        // destination exists explicitly so it survives emptiness.
        match self
            .bucket
            .create_object(
                CreateRequest::new(dst_prefix.clone(), Vec::new())
                    .if_generation(Generation::NONE),
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::PreconditionFailed { .. }) | Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // ======================================================================
    // File I/O
    // ======================================================================

    /// Opens a file handle; `write` selects the write path, which
    /// materializes the current content into a scratch store.
    pub async fn open_file(&self, ino: u64, write: bool) -> Result<u64, FsError> {
        let inode = self.get_inode(ino)?;
        let state = inode
            .as_file()
            .ok_or_else(|| FsError::IsADirectory(format!("inode {ino}")))?;

        let snapshot = state.lock().unwrap().clone();
        if snapshot.sync == SyncState::Clobbered {
            return Err(FsError::StaleHandle(snapshot.object_name.as_str().to_string()));
        }

        let writer = if write && !snapshot.local {
            let metadata = self.bucket.stat_object(&snapshot.object_name).await?;
            let writer = FileWriter::materialize(
                &self.store,
                &metadata,
                &self.config.write.scratch_dir,
            )
            .await?;
            // The scratch is based on what we just downloaded, which may be
            // newer than the inode's view; adopt it.
            state.lock().unwrap().committed(&metadata);
            Some(writer)
        } else if write {
            // A local file opened for writing again shares no scratch with
            // the creating handle; it starts from the (empty) local state.
            Some(FileWriter::new_empty(
                &self.config.write.scratch_dir,
                snapshot.object_name.clone(),
                None,
            )?)
        } else {
            None
        };

        inode.increment_open_handles();
        let fh = self.handles.insert(Handle::File(FileHandle {
            ino: inode.ino(),
            write_allowed: write,
            reader: Mutex::new(None),
            writer: Mutex::new(writer),
        }));
        match fh {
            Ok(fh) => Ok(fh),
            Err(e) => {
                inode.decrement_open_handles();
                Err(e)
            }
        }
    }

    /// Reads from an open file handle.
    pub async fn read_file(&self, fh: u64, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        let handle = self.handles.get(fh)?;
        let file_handle = handle.as_file()?;
        let inode = self.get_inode(file_handle.ino.get())?;
        let state = inode.as_file().ok_or(FsError::Invalid("not a file".into()))?;

        {
            let state = state.lock().unwrap();
            if state.sync == SyncState::Clobbered {
                return Err(FsError::StaleHandle(state.object_name.as_str().to_string()));
            }
        }

        // Same-handle read-your-writes: a dirty scratch wins.
        {
            let mut writer = file_handle.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                return writer.read_at(offset, len);
            }
        }

        let mut reader = file_handle.reader.lock().await;
        if reader.is_none() {
            *reader = Some(self.build_reader(&inode, offset).await?);
        }
        let result = reader
            .as_mut()
            .expect("reader installed above")
            .read(offset, len)
            .await;

        if let Err(FsError::StaleHandle(_)) = &result {
            state.lock().unwrap().sync = SyncState::Clobbered;
        }
        result
    }

    /// Builds the per-handle reader, deciding content-cache admission.
    async fn build_reader(&self, inode: &Arc<Inode>, first_offset: u64) -> Result<FileReader, FsError> {
        let snapshot = inode
            .as_file()
            .expect("file inode")
            .lock()
            .unwrap()
            .clone();

        let cache = match &self.file_cache {
            Some(manager)
                if snapshot.generation.exists()
                    && (first_offset == 0 || self.config.file_cache.cache_file_for_range_read) =>
            {
                // Admission wants checksum-bearing metadata for the pinned
                // generation. A fresh stat is best; an expired cache entry
                // of the same generation is still fine (the generation key
                // is what matters, not freshness); otherwise synthesize
                // from the inode's snapshot.
                let metadata = self
                    .bucket
                    .stat_object(&snapshot.object_name)
                    .await
                    .ok()
                    .filter(|m| m.generation == snapshot.generation)
                    .or_else(|| {
                        self.bucket
                            .stat_cache()
                            .get_allow_expired(&snapshot.object_name)
                            .flatten()
                            .filter(|m| m.generation == snapshot.generation)
                    })
                    .unwrap_or_else(|| {
                        let mut m = ObjectMetadata::new(
                            snapshot.object_name.clone(),
                            snapshot.generation,
                            snapshot.size,
                        );
                        m.updated = snapshot.mtime.into();
                        m
                    });
                match manager.lookup_or_admit(&metadata) {
                    Ok(entry) => {
                        entry.acquire();
                        let mode = if self.config.file_cache.enable_parallel_downloads {
                            DownloadMode::Parallel {
                                workers: self.config.file_cache.parallel_downloads_per_file,
                            }
                        } else {
                            DownloadMode::Sequential
                        };
                        let job = DownloadJob::spawn(
                            Arc::clone(&entry),
                            Arc::clone(&self.store),
                            metadata,
                            mode,
                            self.config.file_cache.enable_crc,
                            self.shutdown.child_token(),
                        );
                        Some(CacheContext {
                            manager: Arc::clone(manager),
                            entry,
                            job,
                        })
                    }
                    Err(e) => {
                        // Admission refusal falls back to direct reads.
                        info!(name = %snapshot.object_name, error = %e, "file cache admission refused");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(FileReader::new(
            Arc::clone(&self.store),
            snapshot.object_name,
            snapshot.generation,
            snapshot.size,
            self.reader_config.clone(),
            cache,
        ))
    }

    /// Writes through an open handle's scratch store.
    pub async fn write_file(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let handle = self.handles.get(fh)?;
        let file_handle = handle.as_file()?;
        if !file_handle.write_allowed {
            return Err(FsError::Permission("handle is read-only".to_string()));
        }
        let inode = self.get_inode(file_handle.ino.get())?;
        let state = inode.as_file().ok_or(FsError::Invalid("not a file".into()))?;

        {
            let state = state.lock().unwrap();
            if state.sync == SyncState::Clobbered {
                return Err(FsError::StaleHandle(state.object_name.as_str().to_string()));
            }
        }

        let mut writer = file_handle.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| FsError::Invalid("write on handle without write state".into()))?;
        let written = writer.write_at(&self.store, offset, data).await?;

        let mut state = state.lock().unwrap();
        state.size = state.size.max(offset + written as u64);
        state.mtime = SystemTime::now();
        state.sync = SyncState::Dirty;
        Ok(written)
    }

    /// Flushes pending writes (fsync / close). Commits the scratch store
    /// as a new generation conditional on the handle's base generation.
    pub async fn flush_file(&self, fh: u64) -> Result<(), FsError> {
        let handle = self.handles.get(fh)?;
        let file_handle = handle.as_file()?;
        let inode = self.get_inode(file_handle.ino.get())?;
        let state = inode.as_file().ok_or(FsError::Invalid("not a file".into()))?;

        let mut writer = file_handle.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Ok(());
        };
        if !writer.is_dirty() {
            return Ok(());
        }

        {
            let mut s = state.lock().unwrap();
            if s.sync == SyncState::Clobbered {
                return Err(FsError::StaleHandle(s.object_name.as_str().to_string()));
            }
            s.sync = SyncState::Flushing;
        }

        match writer.flush(&self.store).await {
            Ok(metadata) => {
                state.lock().unwrap().committed(&metadata);
                // The committed generation supersedes any cached content.
                if let Some(cache) = &self.file_cache {
                    cache.invalidate(&metadata.name);
                }
                // A first successful upload turns a local file into a
                // listed one.
                if let Some(parent) = self.inodes.get(inode.parent().get()) {
                    if let Some(dir) = parent.as_dir() {
                        dir.local_children.lock().unwrap().remove(inode.name());
                        dir.type_cache.insert(inode.name(), ChildKind::File);
                    }
                }
                debug!(name = %metadata.name, generation = %metadata.generation, "flush committed");
                Ok(())
            }
            Err(FsError::StaleHandle(name)) => {
                state.lock().unwrap().sync = SyncState::Clobbered;
                warn!(name = %name, "flush lost the generation race, inode clobbered");
                Err(FsError::StaleHandle(name))
            }
            Err(e) => {
                state.lock().unwrap().sync = SyncState::Dirty;
                Err(e)
            }
        }
    }

    /// Releases a file handle, flushing dirty state first.
    pub async fn release_file(&self, fh: u64) -> Result<(), FsError> {
        let Some(handle) = self.handles.remove(fh) else {
            return Ok(());
        };
        let file_handle = handle.as_file()?;
        let ino = file_handle.ino.get();

        let mut flush_result = Ok(());
        {
            let mut writer_slot = file_handle.writer.lock().await;
            let dirty = writer_slot.as_ref().is_some_and(|w| w.is_dirty());
            if dirty {
                let writer = writer_slot.as_mut().expect("dirty writer present");
                flush_result = self.flush_writer_on_release(writer, ino).await;
                if flush_result.is_err() && self.config.write.retain_scratch_on_clobber {
                    if let Some(writer) = writer_slot.take() {
                        writer.retain_scratch();
                    }
                }
            }
        }

        // Dropping the reader returns its content-cache reference (if any)
        // to the manager.
        {
            let mut reader = file_handle.reader.lock().await;
            if let Some(reader) = reader.take() {
                drop(reader);
            }
        }

        if let Some(inode) = self.inodes.get(ino) {
            inode.decrement_open_handles();
        }
        self.inodes.reap_if_unreferenced(ino);
        flush_result
    }

    async fn flush_writer_on_release(
        &self,
        writer: &mut FileWriter,
        ino: u64,
    ) -> Result<(), FsError> {
        let inode = self.get_inode(ino)?;
        let state = inode.as_file().ok_or(FsError::Invalid("not a file".into()))?;
        match writer.flush(&self.store).await {
            Ok(metadata) => {
                state.lock().unwrap().committed(&metadata);
                if let Some(cache) = &self.file_cache {
                    cache.invalidate(&metadata.name);
                }
                if let Some(parent) = self.inodes.get(inode.parent().get()) {
                    if let Some(dir) = parent.as_dir() {
                        dir.local_children.lock().unwrap().remove(inode.name());
                        dir.type_cache.insert(inode.name(), ChildKind::File);
                    }
                }
                Ok(())
            }
            Err(FsError::StaleHandle(name)) => {
                state.lock().unwrap().sync = SyncState::Clobbered;
                warn!(name = %name, "release-time flush clobbered");
                Err(FsError::StaleHandle(name))
            }
            Err(e) => Err(e),
        }
    }

    // ======================================================================
    // Filesystem-wide
    // ======================================================================

    /// Filesystem statistics synthesized from the cache budget.
    pub fn statfs(&self) -> (u64, u64, u64) {
        const BLOCK_SIZE: u64 = 4096;
        let total_bytes = self.config.file_cache.max_size_mb << 20;
        let used = self
            .file_cache
            .as_ref()
            .map(|c| c.total_size())
            .unwrap_or(0);
        let total_blocks = (total_bytes / BLOCK_SIZE).max(1);
        let free_blocks = total_blocks.saturating_sub(used / BLOCK_SIZE);
        (total_blocks, free_blocks, self.inodes.len() as u64)
    }

    /// Flushes every dirty open file handle (syncfs).
    pub async fn sync_fs(&self) -> Result<(), FsError> {
        let mut first_error = None;
        for fh in self.handles.file_handle_numbers() {
            if let Err(e) = self.flush_file(fh).await {
                warn!(fh, error = %e, "syncfs: flush failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ======================================================================
    // Extended attributes
    // ======================================================================

    /// Read-only xattrs exposing the backing object's generation numbers.
    pub fn getxattr(&self, ino: u64, name: &str) -> Result<Vec<u8>, FsError> {
        let inode = self.get_inode(ino)?;
        let state = inode
            .as_file()
            .ok_or_else(|| FsError::XattrNotFound(name.to_string()))?;
        let state = state.lock().unwrap();
        match name {
            xattr::GENERATION => Ok(state.generation.get().to_string().into_bytes()),
            xattr::METAGENERATION => Ok(state.metageneration.get().to_string().into_bytes()),
            _ => Err(FsError::XattrNotFound(name.to_string())),
        }
    }

    /// Null-separated xattr name list for a file inode.
    pub fn listxattr(&self, ino: u64) -> Result<Vec<u8>, FsError> {
        let inode = self.get_inode(ino)?;
        if inode.as_file().is_none() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for name in [xattr::GENERATION, xattr::METAGENERATION] {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    /// The exposed xattrs are synthesized and read-only.
    pub fn setxattr(&self, _ino: u64, _name: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// The exposed xattrs are synthesized and read-only.
    pub fn removexattr(&self, _ino: u64, _name: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    /// Fallocate: extending the scratch store is supported; punching holes
    /// is not.
    pub async fn fallocate(
        &self,
        fh: u64,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), FsError> {
        if mode != 0 {
            return Err(FsError::NotSupported);
        }
        let handle = self.handles.get(fh)?;
        let file_handle = handle.as_file()?;
        if !file_handle.write_allowed {
            return Err(FsError::Permission("handle is read-only".to_string()));
        }
        let inode = self.get_inode(file_handle.ino.get())?;
        let state = inode.as_file().ok_or(FsError::Invalid("not a file".into()))?;

        let mut writer = file_handle.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| FsError::Invalid("fallocate on handle without write state".into()))?;
        let new_end = offset + length;
        if new_end > writer.size() {
            writer.truncate(new_end)?;
            let mut state = state.lock().unwrap();
            state.size = state.size.max(new_end);
            state.sync = SyncState::Dirty;
        }
        Ok(())
    }
}

/// Names of the synthesized extended attributes.
pub mod xattr {
    /// Content generation of the backing object.
    pub const GENERATION: &str = "user.bucketfs.generation";
    /// Metadata generation of the backing object.
    pub const METAGENERATION: &str = "user.bucketfs.metageneration";
}

// The integration surface of this type is exercised end-to-end by the
// scenario tests in `tests/`, driven against the in-memory fake store.
