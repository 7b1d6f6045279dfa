//! FUSE filesystem implementation.
//!
//! `BucketFs` implements the `fuser::Filesystem` trait as a thin
//! synchronous bridge over [`FsCore`]: each callback converts its
//! arguments, runs the matching async core operation on the tokio runtime
//! handle, and maps the result onto the reply (or the nearest errno).
//! Everything stateful lives in the core; this layer owns nothing but the
//! runtime handle.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::core::FsCore;
use crate::inode_entry::InodeNumber;

/// TTL for FUSE attribute caching (1 second).
///
/// Controls how long the kernel caches attributes before re-querying. A
/// short TTL keeps out-of-band bucket changes visible promptly; the stat
/// cache behind the core absorbs the extra traffic.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// FUSE open flag telling the kernel to keep cached data across opens.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// Write flags in an open call (any of these selects the write path).
const WRITE_FLAGS: i32 = libc::O_WRONLY | libc::O_RDWR;

/// Placeholder dirent inode for entries the kernel has not looked up yet.
/// Plain readdir replies do not bind dirent inos to real inodes.
const UNKNOWN_INO: u64 = u64::MAX - 1;

/// FUSE front-end over the dispatcher core.
pub struct BucketFs {
    core: Arc<FsCore>,
    /// Handle to the tokio runtime running the async core.
    rt: Handle,
}

impl BucketFs {
    pub fn new(core: Arc<FsCore>, rt: Handle) -> Self {
        Self { core, rt }
    }

    pub fn core(&self) -> &Arc<FsCore> {
        &self.core
    }

    fn name_str(name: &OsStr) -> Option<&str> {
        name.to_str()
    }
}

/// Converts a setattr time argument to a concrete timestamp.
fn resolve_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

impl Filesystem for BucketFs {
    #[tracing::instrument(level = "info", skip(self, _req, _config))]
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        tracing::info!(
            bucket = %self.core.config().store.bucket,
            "bucketfs filesystem initialized"
        );
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn destroy(&mut self) {
        tracing::info!("bucketfs filesystem shutting down");
        self.core.shutdown();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.rt.block_on(self.core.lookup(parent, name)) {
            Ok(resolved) => reply.entry(&ATTR_TTL, &resolved.attr, 0),
            Err(e) => {
                debug!(parent, name, error = %e, "lookup failed");
                reply.error(e.into());
            }
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.core.forget(ino, nlookup);
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.rt.block_on(self.core.getattr(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, size))]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mtime = resolve_time(mtime);
        match self.rt.block_on(self.core.setattr(ino, size, mtime, fh)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.core.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.rt.block_on(self.core.mkdir(parent, name)) {
            Ok(resolved) => reply.entry(&ATTR_TTL, &resolved.attr, 0),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & libc::S_IFMT != libc::S_IFREG {
            reply.error(libc::ENOSYS);
            return;
        }
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.rt.block_on(self.core.mknod(parent, name)) {
            Ok(resolved) => reply.entry(&ATTR_TTL, &resolved.attr, 0),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.rt.block_on(self.core.create_file(parent, name)) {
            Ok((resolved, fh)) => reply.created(&ATTR_TTL, &resolved.attr, 0, fh, 0),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply, target), fields(parent, name = ?link_name))]
    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(target)) = (Self::name_str(link_name), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.rt.block_on(self.core.symlink(parent, name, target)) {
            Ok(resolved) => reply.entry(&ATTR_TTL, &resolved.attr, 0),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.rt.block_on(self.core.unlink(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name))]
    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.rt.block_on(self.core.rmdir(parent, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(parent, name = ?name, newname = ?newname))]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (Self::name_str(name), Self::name_str(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self
            .rt
            .block_on(self.core.rename(parent, name, newparent, newname))
        {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(parent, name, newname, error = %e, "rename failed");
                reply.error(e.into());
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, flags))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write = flags & WRITE_FLAGS != 0;
        match self.rt.block_on(self.core.open_file(ino, write)) {
            Ok(fh) => {
                // Reads are pinned to one generation per handle, so data the
                // kernel cached from a previous open of the same generation
                // stays valid.
                reply.opened(fh, FOPEN_KEEP_CACHE);
            }
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh, offset, size))]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .rt
            .block_on(self.core.read_file(fh, offset as u64, size))
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, data, reply), fields(ino, fh, offset, size = data.len()))]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .rt
            .block_on(self.core.write_file(fh, offset as u64, data))
        {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh))]
    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.rt.block_on(self.core.flush_file(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh))]
    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.rt.block_on(self.core.flush_file(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.rt.block_on(self.core.release_file(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                // The data loss (if any) already happened at flush time;
                // release itself must not wedge the kernel.
                warn!(fh, error = %e, "release-time flush failed");
                reply.ok();
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.core.opendir(ino) {
            Ok(fh) => {
                let flags = if self.core.config().mount.kernel_list_cache_ttl > 0 {
                    FOPEN_KEEP_CACHE
                } else {
                    0
                };
                reply.opened(fh, flags);
            }
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh, offset))]
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        // Offsets 1 and 2 are the synthetic "." and ".." entries; snapshot
        // entries start at offset 3.
        let mut next_offset = offset;
        if next_offset == 0 {
            if reply.add(ino, 1, FileType::Directory, OsStr::new(".")) {
                reply.ok();
                return;
            }
            next_offset = 1;
        }
        if next_offset == 1 {
            let parent = self
                .core
                .inodes()
                .get(ino)
                .map(|i| i.parent().get())
                .unwrap_or(InodeNumber::ROOT.get());
            if reply.add(parent, 2, FileType::Directory, OsStr::new("..")) {
                reply.ok();
                return;
            }
            next_offset = 2;
        }

        let mut index = (next_offset - 2) as usize;
        loop {
            let batch = match self.rt.block_on(self.core.readdir(fh, index, 64)) {
                Ok(batch) => batch,
                Err(e) => {
                    reply.error(e.into());
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            for (i, entry) in batch {
                let child_ino = self
                    .core
                    .inodes()
                    .lookup_child(InodeNumber::new(ino), &entry.name)
                    .map(|inode| inode.ino().get())
                    .unwrap_or(UNKNOWN_INO);
                if reply.add(child_ino, (i + 3) as i64, entry.kind, OsStr::new(&entry.name)) {
                    reply.ok();
                    return;
                }
                index = i + 1;
            }
        }
        reply.ok();
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh))]
    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.core.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply))]
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        const BLOCK_SIZE: u32 = 4096;
        const NAME_MAX: u32 = 255;
        let (total_blocks, free_blocks, files) = self.core.statfs();
        reply.statfs(
            total_blocks,
            free_blocks,
            free_blocks,
            files,
            u64::MAX / 2,
            BLOCK_SIZE,
            NAME_MAX,
            BLOCK_SIZE,
        );
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, name = ?name))]
    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = Self::name_str(name) else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.core.getxattr(ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if (value.len() as u32) <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino))]
    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.core.listxattr(ino) {
            Ok(names) => {
                if size == 0 {
                    reply.size(names.len() as u32);
                } else if (names.len() as u32) <= size {
                    reply.data(&names);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy();
        match self.core.setxattr(ino, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        match self.core.removexattr(ino, &name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip(self, _req, reply), fields(ino, fh, offset, length))]
    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        if offset < 0 || length < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .rt
            .block_on(self.core.fallocate(fh, offset as u64, length as u64, mode))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, _req, reply))]
    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permissions are synthesized; the kernel's own mode checks apply.
        reply.ok();
    }
}
