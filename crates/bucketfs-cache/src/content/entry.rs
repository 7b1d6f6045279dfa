//! A single content-cache entry: one object generation on disk.
//!
//! Layout under the cache directory, following the hash-path scheme used
//! for all cached content: `content/{first 2 hash chars}/{rest}/data` for
//! the body and `.../index` for the JSON sidecar recording chunk presence
//! and total size. The data file is created at full length up front so
//! chunks can be written at their final offsets in any order.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use bucketfs_core::domain::{Generation, ObjectName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;

/// Identity of a cache entry: a specific generation of a specific object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: ObjectName,
    pub generation: Generation,
}

impl CacheKey {
    pub fn new(name: ObjectName, generation: Generation) -> Self {
        Self { name, generation }
    }

    /// Hash-derived relative directory for this key.
    fn relative_dir(&self) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_str().as_bytes());
        hasher.update(b"#");
        hasher.update(self.generation.get().to_le_bytes());
        let hash = format!("{:x}", hasher.finalize());
        let (prefix, rest) = hash.split_at(2);
        PathBuf::from(prefix).join(rest)
    }
}

/// Download state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Not yet requested.
    Absent,
    /// A worker is downloading it.
    InFlight,
    /// On disk and readable.
    Present,
    /// The download failed; readers of this range fail.
    Failed,
}

/// Persisted sidecar: chunk presence and total size.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    size: u64,
    chunk_size: u64,
    present: Vec<u32>,
}

#[derive(Debug)]
struct EntryState {
    chunks: Vec<ChunkState>,
}

/// One cached object generation.
///
/// Shared as `Arc<CacheEntry>` between the manager's table, the download
/// job and every reader handle. `ref_count` counts handles only; the
/// manager evicts entries whose count is zero.
pub struct CacheEntry {
    key: CacheKey,
    dir: PathBuf,
    data_path: PathBuf,
    index_path: PathBuf,
    size: u64,
    chunk_size: u64,
    state: Mutex<EntryState>,
    /// Bumped on every chunk transition; waiters watch for changes.
    change_tx: watch::Sender<u64>,
    change_rx: watch::Receiver<u64>,
    ref_count: AtomicUsize,
    last_used: Mutex<Instant>,
    /// Set when a newer generation superseded this entry.
    doomed: AtomicBool,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl CacheEntry {
    /// Creates the on-disk entry: a full-length (sparse) data file and an
    /// empty index.
    pub fn create(
        cache_dir: &Path,
        key: CacheKey,
        size: u64,
        chunk_size: u64,
    ) -> Result<Self, CacheError> {
        let dir = cache_dir.join(key.relative_dir());
        fs::create_dir_all(&dir)?;
        let data_path = dir.join("data");
        let index_path = dir.join("index");

        let file = File::create(&data_path)?;
        file.set_len(size)?;

        let chunk_count = Self::chunk_count_for(size, chunk_size);
        let (change_tx, change_rx) = watch::channel(0u64);
        let entry = Self {
            key,
            dir,
            data_path,
            index_path,
            size,
            chunk_size,
            state: Mutex::new(EntryState {
                chunks: vec![ChunkState::Absent; chunk_count as usize],
            }),
            change_tx,
            change_rx,
            ref_count: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
            doomed: AtomicBool::new(false),
        };
        entry.persist_index()?;
        Ok(entry)
    }

    fn chunk_count_for(size: u64, chunk_size: u64) -> u32 {
        if size == 0 {
            0
        } else {
            size.div_ceil(chunk_size) as u32
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        Self::chunk_count_for(self.size, self.chunk_size)
    }

    /// The chunk indexes whose byte ranges intersect `range`.
    pub fn chunks_in(&self, range: &Range<u64>) -> Range<u32> {
        if range.start >= range.end || self.size == 0 {
            return 0..0;
        }
        let end = range.end.min(self.size);
        if range.start >= end {
            return 0..0;
        }
        let first = (range.start / self.chunk_size) as u32;
        let last = ((end - 1) / self.chunk_size) as u32;
        first..last + 1
    }

    /// Claims an absent chunk for download. Returns false if it is already
    /// claimed, present, or failed.
    pub fn try_claim(&self, chunk: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.chunks.get_mut(chunk as usize) {
            Some(slot @ ChunkState::Absent) => {
                *slot = ChunkState::InFlight;
                true
            }
            _ => false,
        }
    }

    /// Writes a downloaded chunk's bytes and marks it present.
    ///
    /// `data` must cover the whole chunk (shorter only for the final chunk).
    pub fn complete_chunk(&self, chunk: u32, data: &[u8]) -> Result<(), CacheError> {
        let offset = chunk as u64 * self.chunk_size;
        let mut file = OpenOptions::new().write(true).open(&self.data_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.chunks.get_mut(chunk as usize) {
                *slot = ChunkState::Present;
            }
        }
        self.persist_index()?;
        self.notify_change();
        Ok(())
    }

    /// Marks a chunk's download as failed and wakes waiters so they can
    /// observe the failure.
    pub fn fail_chunk(&self, chunk: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.chunks.get_mut(chunk as usize) {
            *slot = ChunkState::Failed;
        }
        drop(state);
        self.notify_change();
    }

    /// Returns a failed chunk back to absent so a later read can retry it.
    pub fn reset_chunk(&self, chunk: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot @ ChunkState::Failed) = state.chunks.get_mut(chunk as usize) {
            *slot = ChunkState::Absent;
        }
        drop(state);
        self.notify_change();
    }

    /// Current state of one chunk.
    pub fn chunk_state(&self, chunk: u32) -> ChunkState {
        let state = self.state.lock().unwrap();
        state
            .chunks
            .get(chunk as usize)
            .copied()
            .unwrap_or(ChunkState::Present)
    }

    /// The lowest-index absent chunk at or after `from`, if any.
    pub fn next_absent_chunk(&self, from: u32) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.chunks[from.min(state.chunks.len() as u32) as usize..]
            .iter()
            .position(|c| *c == ChunkState::Absent)
            .map(|i| from + i as u32)
    }

    /// True when every chunk intersecting `range` is present.
    pub fn range_present(&self, range: &Range<u64>) -> bool {
        let chunks = self.chunks_in(range);
        let state = self.state.lock().unwrap();
        chunks
            .clone()
            .all(|c| state.chunks[c as usize] == ChunkState::Present)
    }

    /// True when the whole object is present.
    pub fn fully_present(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.chunks.iter().all(|c| *c == ChunkState::Present)
    }

    /// Waits until every chunk of `range` is present.
    ///
    /// Fails as soon as any intersecting chunk is failed; other readers
    /// waiting on unrelated ranges are unaffected.
    pub async fn wait_for_range(&self, range: Range<u64>) -> Result<(), CacheError> {
        let mut rx = self.change_rx.clone();
        loop {
            if self.doomed.load(Ordering::SeqCst) {
                return Err(CacheError::Invalidated(self.key.name.as_str().to_string()));
            }
            let chunks = self.chunks_in(&range);
            let failed = {
                let state = self.state.lock().unwrap();
                chunks
                    .clone()
                    .find(|c| state.chunks[*c as usize] == ChunkState::Failed)
            };
            if let Some(chunk) = failed {
                return Err(CacheError::ChunkFailed {
                    name: self.key.name.as_str().to_string(),
                    chunk,
                });
            }
            if self.range_present(&range) {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::Invalidated(self.key.name.as_str().to_string()));
            }
        }
    }

    /// Reads up to `len` bytes at `offset` from the data file.
    ///
    /// The caller must have established presence of the range first (via
    /// [`CacheEntry::wait_for_range`] or [`CacheEntry::range_present`]).
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, CacheError> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let end = (offset + len as u64).min(self.size);
        let range = offset..end;
        if !self.range_present(&range) {
            return Err(CacheError::NotPresent {
                name: self.key.name.as_str().to_string(),
                start: range.start,
                end: range.end,
            });
        }

        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; (end - offset) as usize];
        file.read_exact(&mut buf)?;
        self.touch();
        Ok(buf)
    }

    /// Validates the fully-present content against an expected CRC32C.
    pub fn validate_crc(&self, expected: u32) -> Result<(), CacheError> {
        let mut file = File::open(&self.data_path)?;
        let mut crc = 0u32;
        let mut buf = vec![0u8; 1 << 16];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
        }
        if crc != expected {
            return Err(CacheError::CrcMismatch {
                name: self.key.name.as_str().to_string(),
                expected,
                computed: crc,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reference counting and LRU bookkeeping
    // ------------------------------------------------------------------

    /// Registers a handle holding this entry.
    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Drops a handle's reference, returning the new count.
    pub fn release(&self) -> usize {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Number of handles currently holding this entry.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Marks the entry superseded; waiters fail and the manager deletes it
    /// once the last reference drops.
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
        self.notify_change();
    }

    /// True when a newer generation superseded this entry.
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    /// Records use for LRU ordering.
    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// Last use instant, for the manager's eviction scan.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    /// Deletes the entry's files from disk.
    pub fn remove_files(&self) -> Result<(), CacheError> {
        debug!(name = %self.key.name, generation = %self.key.generation, "removing cache entry files");
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    fn notify_change(&self) {
        self.change_tx.send_modify(|v| *v += 1);
    }

    fn persist_index(&self) -> Result<(), CacheError> {
        let present = {
            let state = self.state.lock().unwrap();
            state
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == ChunkState::Present)
                .map(|(i, _)| i as u32)
                .collect()
        };
        let index = IndexFile {
            size: self.size,
            chunk_size: self.chunk_size,
            present,
        };
        let json =
            serde_json::to_vec(&index).map_err(|e| CacheError::Index(e.to_string()))?;
        fs::write(&self.index_path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn make_entry(dir: &Path, size: u64, chunk_size: u64) -> CacheEntry {
        let key = CacheKey::new(ObjectName::new("photos/cat.jpg").unwrap(), Generation(3));
        CacheEntry::create(dir, key, size, chunk_size).unwrap()
    }

    #[test]
    fn test_chunk_count_and_ranges() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 100, 32);

        assert_eq!(entry.chunk_count(), 4);
        assert_eq!(entry.chunks_in(&(0..1)), 0..1);
        assert_eq!(entry.chunks_in(&(31..33)), 0..2);
        assert_eq!(entry.chunks_in(&(96..100)), 3..4);
        // Ranges past end-of-object are clamped.
        assert_eq!(entry.chunks_in(&(96..1000)), 3..4);
        assert_eq!(entry.chunks_in(&(200..300)), 0..0);
    }

    #[test]
    fn test_claim_and_complete_chunk() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 64, 32);

        assert!(entry.try_claim(0));
        assert!(!entry.try_claim(0), "in-flight chunk cannot be reclaimed");
        assert_eq!(entry.chunk_state(0), ChunkState::InFlight);

        entry.complete_chunk(0, &[7u8; 32]).unwrap();
        assert_eq!(entry.chunk_state(0), ChunkState::Present);
        assert!(entry.range_present(&(0..32)));
        assert!(!entry.range_present(&(0..33)));

        let data = entry.read(0, 32).unwrap();
        assert_eq!(data, vec![7u8; 32]);
    }

    #[test]
    fn test_read_absent_range_is_an_error() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 64, 32);
        assert!(matches!(
            entry.read(0, 10),
            Err(CacheError::NotPresent { .. })
        ));
    }

    #[test]
    fn test_read_clamps_at_end_of_object() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 40, 32);
        entry.try_claim(0);
        entry.complete_chunk(0, &[1u8; 32]).unwrap();
        entry.try_claim(1);
        entry.complete_chunk(1, &[2u8; 8]).unwrap();

        let data = entry.read(32, 100).unwrap();
        assert_eq!(data, vec![2u8; 8]);
        assert!(entry.read(40, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_range_resumes_on_completion() {
        let dir = tempdir().unwrap();
        let entry = std::sync::Arc::new(make_entry(dir.path(), 64, 32));

        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.wait_for_range(0..64).await })
        };

        entry.try_claim(0);
        entry.complete_chunk(0, &[0u8; 32]).unwrap();
        entry.try_claim(1);
        entry.complete_chunk(1, &[0u8; 32]).unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_range_fails_on_failed_chunk() {
        let dir = tempdir().unwrap();
        let entry = std::sync::Arc::new(make_entry(dir.path(), 64, 32));

        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.wait_for_range(0..64).await })
        };

        entry.try_claim(0);
        entry.complete_chunk(0, &[0u8; 32]).unwrap();
        entry.try_claim(1);
        entry.fail_chunk(1);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CacheError::ChunkFailed { chunk: 1, .. })));
    }

    #[test]
    fn test_crc_validation() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 4, 32);
        entry.try_claim(0);
        entry.complete_chunk(0, b"taco").unwrap();

        let expected = crc32c::crc32c(b"taco");
        entry.validate_crc(expected).unwrap();
        assert!(matches!(
            entry.validate_crc(expected ^ 1),
            Err(CacheError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_ref_counting() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 64, 32);
        assert_eq!(entry.ref_count(), 0);
        entry.acquire();
        entry.acquire();
        assert_eq!(entry.ref_count(), 2);
        assert_eq!(entry.release(), 1);
        assert_eq!(entry.release(), 0);
    }

    #[test]
    fn test_index_sidecar_written() {
        let dir = tempdir().unwrap();
        let entry = make_entry(dir.path(), 64, 32);
        entry.try_claim(1);
        entry.complete_chunk(1, &[0u8; 32]).unwrap();

        let raw = fs::read_to_string(&entry.index_path).unwrap();
        let index: IndexFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(index.size, 64);
        assert_eq!(index.chunk_size, 32);
        assert_eq!(index.present, vec![1]);
    }
}
