//! Per-handle write state: scratch store and conditional commit.
//!
//! Opening a file for writing materializes its current content into a
//! scratch file (empty for newly created files). Writes mutate the scratch
//! directly, so reads on the same handle observe them immediately. Flush
//! uploads the scratch as a new object generation conditional on the
//! generation the handle was based on; a failed precondition means another
//! writer committed first and the handle is clobbered.
//!
//! With streaming writes enabled, full buffers are uploaded eagerly as
//! temporary part objects and the close composes them into the target under
//! the same generation condition. Streaming accepts only appends at the
//! flushed frontier; anything else is rejected so a mid-stream precondition
//! failure can never leave a half-committed overwrite.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bucketfs_core::domain::{Generation, ObjectMetadata, ObjectName, StoreError};
use bucketfs_core::ports::object_store::{CreateRequest, ObjectStore, ReadRequest};
use rand::Rng;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::FsError;

/// Download window used when materializing an object into scratch.
const MATERIALIZE_CHUNK: u64 = 8 << 20;

/// State of the optional streaming-upload mode.
#[derive(Debug)]
struct StreamingState {
    /// Bytes accumulated since the last part upload.
    buffer: Vec<u8>,
    /// Buffer size that triggers a part upload.
    buffer_cap: usize,
    /// Already-uploaded part objects, in order.
    parts: Vec<ObjectName>,
    /// Next append offset; streaming accepts writes only here.
    frontier: u64,
    /// Random tag separating this handle's parts from any other writer's.
    session: u64,
}

/// Write state of one open-for-write handle.
pub struct FileWriter {
    object_name: ObjectName,
    /// Generation the scratch content is based on; the flush precondition.
    base_generation: Generation,
    scratch: NamedTempFile,
    size: u64,
    dirty: bool,
    streaming: Option<StreamingState>,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("object_name", &self.object_name)
            .field("base_generation", &self.base_generation)
            .field("size", &self.size)
            .field("dirty", &self.dirty)
            .field("streaming", &self.streaming.is_some())
            .finish()
    }
}

impl FileWriter {
    /// Creates an empty scratch store for a newly created file.
    pub fn new_empty(
        scratch_dir: &Path,
        object_name: ObjectName,
        streaming_buffer: Option<usize>,
    ) -> Result<Self, FsError> {
        std::fs::create_dir_all(scratch_dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(".bucketfs-scratch-")
            .tempfile_in(scratch_dir)?;
        Ok(Self {
            object_name,
            base_generation: Generation::NONE,
            scratch,
            size: 0,
            dirty: true,
            streaming: streaming_buffer.map(|cap| StreamingState {
                buffer: Vec::new(),
                buffer_cap: cap.max(1),
                parts: Vec::new(),
                frontier: 0,
                session: rand::thread_rng().gen(),
            }),
        })
    }

    /// Materializes the object's current content into a scratch store.
    ///
    /// The download is pinned to the metadata's generation, which becomes
    /// the flush precondition.
    pub async fn materialize(
        store: &Arc<dyn ObjectStore>,
        metadata: &ObjectMetadata,
        scratch_dir: &Path,
    ) -> Result<Self, FsError> {
        std::fs::create_dir_all(scratch_dir)?;
        let mut scratch = tempfile::Builder::new()
            .prefix(".bucketfs-scratch-")
            .tempfile_in(scratch_dir)?;

        let mut offset = 0u64;
        while offset < metadata.size {
            let end = (offset + MATERIALIZE_CHUNK).min(metadata.size);
            let data = store
                .read_object(&ReadRequest {
                    name: metadata.name.clone(),
                    generation: metadata.generation,
                    range: offset..end,
                })
                .await
                .map_err(|e| match e {
                    StoreError::PreconditionFailed { name, .. } => FsError::StaleHandle(name),
                    other => FsError::from(other),
                })?;
            if data.is_empty() {
                break;
            }
            scratch.as_file_mut().write_all(&data)?;
            offset += data.len() as u64;
        }

        debug!(
            name = %metadata.name,
            generation = %metadata.generation,
            bytes = offset,
            "materialized object into scratch store"
        );
        Ok(Self {
            object_name: metadata.name.clone(),
            base_generation: metadata.generation,
            scratch,
            size: offset,
            dirty: false,
            streaming: None,
        })
    }

    pub fn base_generation(&self) -> Generation {
        self.base_generation
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes `data` at `offset` in the scratch store.
    ///
    /// In streaming mode only appends at the flushed frontier are legal.
    pub async fn write_at(
        &mut self,
        store: &Arc<dyn ObjectStore>,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, FsError> {
        if let Some(streaming) = &mut self.streaming {
            let buffered_frontier = streaming.frontier + streaming.buffer.len() as u64;
            if offset != buffered_frontier {
                return Err(FsError::Invalid(format!(
                    "streaming writes accept only appends at {buffered_frontier}, got {offset}"
                )));
            }
            streaming.buffer.extend_from_slice(data);
        }

        let file = self.scratch.as_file_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.size = self.size.max(offset + data.len() as u64);
        self.dirty = true;

        if self
            .streaming
            .as_ref()
            .is_some_and(|s| s.buffer.len() >= s.buffer_cap)
        {
            self.upload_part(store).await?;
        }
        Ok(data.len() as u32)
    }

    /// Reads back from the scratch store (same-handle read-your-writes).
    pub fn read_at(&mut self, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let end = (offset + len as u64).min(self.size);
        let file = self.scratch.as_file_mut();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; (end - offset) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Truncates (or extends, zero-filled) the scratch store.
    pub fn truncate(&mut self, new_size: u64) -> Result<(), FsError> {
        if self.streaming.is_some() {
            return Err(FsError::Invalid(
                "truncate is not supported in streaming-write mode".to_string(),
            ));
        }
        self.scratch.as_file_mut().set_len(new_size)?;
        self.size = new_size;
        self.dirty = true;
        Ok(())
    }

    fn part_name(&self, index: usize, session: u64) -> Result<ObjectName, FsError> {
        ObjectName::new(format!(
            "{}.bucketfs_part.{session:016x}.{index:06}",
            self.object_name.as_str()
        ))
        .map_err(|e| FsError::Invalid(e.to_string()))
    }

    /// Uploads the streaming buffer as the next part object.
    async fn upload_part(&mut self, store: &Arc<dyn ObjectStore>) -> Result<(), FsError> {
        let streaming = self.streaming.as_mut().expect("streaming mode");
        if streaming.buffer.is_empty() {
            return Ok(());
        }
        let index = streaming.parts.len();
        let session = streaming.session;
        let contents = std::mem::take(&mut streaming.buffer);
        let len = contents.len() as u64;
        let part = self.part_name(index, session)?;

        let streaming = self.streaming.as_mut().expect("streaming mode");
        streaming.frontier += len;
        streaming.parts.push(part.clone());
        debug!(part = %part, bytes = len, "uploading streaming part");
        store
            .create_object(CreateRequest::new(part, contents))
            .await
            .map_err(FsError::from)?;
        Ok(())
    }

    /// Commits the scratch content as a new generation of the object.
    ///
    /// Uses `if_generation_match = base_generation` (0 for never-uploaded
    /// files, meaning "must not exist"). On success the caller updates the
    /// inode from the returned metadata; on a precondition failure the
    /// caller transitions the inode to clobbered.
    pub async fn flush(&mut self, store: &Arc<dyn ObjectStore>) -> Result<ObjectMetadata, FsError> {
        if self.streaming.as_ref().is_some_and(|s| !s.parts.is_empty()) {
            return self.flush_streaming(store).await;
        }

        let file = self.scratch.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut contents)?;
        contents.truncate(self.size as usize);

        let request = CreateRequest::new(self.object_name.clone(), contents)
            .if_generation(self.base_generation);
        let metadata = store.create_object(request).await.map_err(|e| match e {
            StoreError::PreconditionFailed { name, .. } | StoreError::AlreadyExists(name) => {
                FsError::StaleHandle(name)
            }
            other => FsError::from(other),
        })?;

        debug!(
            name = %metadata.name,
            generation = %metadata.generation,
            size = metadata.size,
            "flushed scratch store as new generation"
        );
        self.base_generation = metadata.generation;
        self.dirty = false;
        Ok(metadata)
    }

    /// Streaming finalization: last partial buffer becomes the final part,
    /// then the parts compose into the target conditionally.
    async fn flush_streaming(
        &mut self,
        store: &Arc<dyn ObjectStore>,
    ) -> Result<ObjectMetadata, FsError> {
        self.upload_part(store).await?;
        let streaming = self.streaming.as_ref().expect("streaming mode");
        let parts = streaming.parts.clone();

        let result = store
            .compose_objects(
                &self.object_name,
                &parts,
                Some(self.base_generation),
            )
            .await;

        // Parts are garbage either way once compose has resolved.
        for part in &parts {
            if let Err(e) = store.delete_object(part, None).await {
                warn!(part = %part, error = %e, "failed to delete streaming part");
            }
        }

        let metadata = result.map_err(|e| match e {
            StoreError::PreconditionFailed { name, .. } => FsError::StaleHandle(name),
            other => FsError::from(other),
        })?;

        let streaming = self.streaming.as_mut().expect("streaming mode");
        streaming.parts.clear();
        self.base_generation = metadata.generation;
        self.dirty = false;
        Ok(metadata)
    }

    /// Persists the scratch file to a stable path instead of deleting it,
    /// for operator recovery after a clobber.
    pub fn retain_scratch(self) -> Option<PathBuf> {
        match self.scratch.keep() {
            Ok((_file, path)) => {
                warn!(path = %path.display(), "scratch store retained for recovery");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "failed to retain scratch store");
                None
            }
        }
    }

    #[cfg(test)]
    fn scratch_file(&mut self) -> &mut std::fs::File {
        self.scratch.as_file_mut()
    }
}

#[cfg(test)]
mod tests {
    use bucketfs_core::ports::object_store::ObjectStore;
    use bucketfs_store::FakeObjectStore;
    use tempfile::tempdir;

    use super::*;

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(FakeObjectStore::new())
    }

    fn name(s: &str) -> ObjectName {
        ObjectName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_new_file_flush_requires_absence() {
        let fake = Arc::new(FakeObjectStore::new());
        let store: Arc<dyn ObjectStore> = fake.clone();
        let dir = tempdir().unwrap();

        let mut writer = FileWriter::new_empty(dir.path(), name("fresh"), None).unwrap();
        writer.write_at(&store, 0, b"hello").await.unwrap();
        assert_eq!(writer.size(), 5);

        let metadata = writer.flush(&store).await.unwrap();
        assert!(metadata.generation.exists());
        assert_eq!(fake.content_of("fresh").unwrap(), b"hello");

        // A competing creation of the same name would have clobbered us.
        let mut loser = FileWriter::new_empty(dir.path(), name("fresh"), None).unwrap();
        loser.write_at(&store, 0, b"other").await.unwrap();
        let result = loser.flush(&store).await;
        assert!(matches!(result, Err(FsError::StaleHandle(_))));
    }

    #[tokio::test]
    async fn test_materialize_then_modify_then_flush() {
        let fake = Arc::new(FakeObjectStore::new());
        let store: Arc<dyn ObjectStore> = fake.clone();
        let dir = tempdir().unwrap();
        let metadata = fake.put("doc", b"hello world");

        let mut writer = FileWriter::materialize(&store, &metadata, dir.path())
            .await
            .unwrap();
        assert_eq!(writer.size(), 11);
        assert!(!writer.is_dirty());

        writer.write_at(&store, 6, b"there").await.unwrap();
        assert!(writer.is_dirty());
        assert_eq!(writer.read_at(0, 64).unwrap(), b"hello there");

        let committed = writer.flush(&store).await.unwrap();
        assert!(committed.generation > metadata.generation);
        assert_eq!(fake.content_of("doc").unwrap(), b"hello there");
    }

    #[tokio::test]
    async fn test_flush_detects_clobber() {
        let fake = Arc::new(FakeObjectStore::new());
        let store: Arc<dyn ObjectStore> = fake.clone();
        let dir = tempdir().unwrap();
        let metadata = fake.put("doc", b"base");

        let mut writer = FileWriter::materialize(&store, &metadata, dir.path())
            .await
            .unwrap();
        writer.write_at(&store, 0, b"mine").await.unwrap();

        // Another client replaces the object before our flush.
        fake.put("doc", b"theirs");

        let result = writer.flush(&store).await;
        assert!(matches!(result, Err(FsError::StaleHandle(_))));
        assert_eq!(fake.content_of("doc").unwrap(), b"theirs");
    }

    #[tokio::test]
    async fn test_truncate_and_extend() {
        let fake = Arc::new(FakeObjectStore::new());
        let store: Arc<dyn ObjectStore> = fake.clone();
        let dir = tempdir().unwrap();
        let metadata = fake.put("doc", b"abcdef");

        let mut writer = FileWriter::materialize(&store, &metadata, dir.path())
            .await
            .unwrap();
        writer.truncate(3).unwrap();
        assert_eq!(writer.read_at(0, 10).unwrap(), b"abc");

        writer.truncate(5).unwrap();
        let extended = writer.read_at(0, 10).unwrap();
        assert_eq!(extended, b"abc\0\0");
    }

    #[tokio::test]
    async fn test_streaming_appends_and_composes() {
        let fake = Arc::new(FakeObjectStore::new());
        let store: Arc<dyn ObjectStore> = fake.clone();
        let dir = tempdir().unwrap();

        // 8-byte buffer: three 5-byte writes force part uploads.
        let mut writer = FileWriter::new_empty(dir.path(), name("log"), Some(8)).unwrap();
        writer.write_at(&store, 0, b"aaaaa").await.unwrap();
        writer.write_at(&store, 5, b"bbbbb").await.unwrap();
        writer.write_at(&store, 10, b"ccccc").await.unwrap();

        let metadata = writer.flush(&store).await.unwrap();
        assert_eq!(metadata.size, 15);
        assert_eq!(fake.content_of("log").unwrap(), b"aaaaabbbbbccccc");
    }

    #[tokio::test]
    async fn test_streaming_rejects_non_append_writes() {
        let dir = tempdir().unwrap();
        let store = store();

        let mut writer = FileWriter::new_empty(dir.path(), name("log"), Some(1024)).unwrap();
        writer.write_at(&store, 0, b"abc").await.unwrap();

        let result = writer.write_at(&store, 1, b"x").await;
        assert!(matches!(result, Err(FsError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_retain_scratch_survives_drop() {
        let dir = tempdir().unwrap();
        let store = store();
        let mut writer = FileWriter::new_empty(dir.path(), name("doc"), None).unwrap();
        writer.write_at(&store, 0, b"precious").await.unwrap();
        writer.scratch_file().flush().unwrap();

        let path = writer.retain_scratch().unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");
        std::fs::remove_file(path).unwrap();
    }
}
