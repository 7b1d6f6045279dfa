//! Per-handle read strategies.
//!
//! A reader picks its strategy on the first read and may change it as the
//! observed access pattern evolves:
//!
//! - **Sequential**: one windowed range read ahead of the position, served
//!   from an in-memory buffer. Falls back to random when the next offset
//!   deviates from the expected position.
//! - **Random**: an exact-range request per read.
//! - **Cached**: reads through a content-cache entry, waiting on the
//!   download job for presence.
//! - **Prefetch**: a worker pool downloads successive blocks ahead of the
//!   position into in-memory buffers; reads consume blocks in order.
//!
//! Every store read carries the handle's pinned generation. A failed
//! generation precondition surfaces as a stale handle; the dispatcher
//! transitions the inode to clobbered.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bucketfs_cache::{CacheEntry, DownloadJob, FileCacheManager};
use bucketfs_core::domain::{Generation, ObjectName, StoreError};
use bucketfs_core::ports::object_store::{ObjectStore, ReadRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::FsError;

/// Observed access pattern over the last few reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPattern {
    Sequential,
    Random,
}

/// Ring buffer of recent (offset, length) pairs with seek counting.
///
/// A read is a "seek" when it does not start within `slack` bytes of where
/// the previous read ended. Two or more seeks within the window classify
/// the pattern as random.
#[derive(Debug)]
pub struct PatternDetector {
    window: VecDeque<(u64, u32)>,
    capacity: usize,
    slack: u64,
    expected_next: Option<u64>,
    seeks: usize,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self {
            window: VecDeque::new(),
            capacity: 8,
            slack: 1 << 20,
            expected_next: None,
            seeks: 0,
        }
    }

    /// Records a read and returns the current classification.
    pub fn record(&mut self, offset: u64, len: u32) -> ReadPattern {
        let is_seek = match self.expected_next {
            // The first read only counts as a seek when it starts mid-file.
            None => offset > self.slack,
            Some(expected) => offset.abs_diff(expected) > self.slack,
        };
        if is_seek {
            self.seeks += 1;
        }
        self.expected_next = Some(offset + len as u64);

        self.window.push_back((offset, len));
        if self.window.len() > self.capacity {
            self.window.pop_front();
            // Decay old seeks so a long sequential run recovers.
            if self.seeks > 0 && !is_seek {
                self.seeks -= 1;
            }
        }
        self.pattern()
    }

    pub fn pattern(&self) -> ReadPattern {
        if self.seeks >= 2 {
            ReadPattern::Random
        } else {
            ReadPattern::Sequential
        }
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Tuning knobs handed to every reader.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Read-ahead window of the sequential strategy, in bytes.
    pub sequential_window: u64,
    /// Block size of the prefetch strategy, in bytes.
    pub prefetch_block: u64,
    /// Worker count of the prefetch strategy; 0 disables it.
    pub prefetch_workers: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            sequential_window: 8 << 20,
            prefetch_block: 8 << 20,
            prefetch_workers: 0,
        }
    }
}

/// Cache resources a reader uses when the file is admitted to the content
/// cache. The entry reference taken at admission is returned to the
/// manager when the reader (and with it this context) is dropped.
pub struct CacheContext {
    pub manager: Arc<FileCacheManager>,
    pub entry: Arc<CacheEntry>,
    pub job: Arc<DownloadJob>,
}

impl Drop for CacheContext {
    fn drop(&mut self) {
        self.manager.release(&self.entry);
    }
}

enum Strategy {
    /// Nothing read yet.
    Uninitialized,
    Sequential {
        buffer: Vec<u8>,
        buffer_offset: u64,
    },
    Random,
    Cached,
    Prefetch(PrefetchState),
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Uninitialized => "Uninitialized",
            Strategy::Sequential { .. } => "Sequential",
            Strategy::Random => "Random",
            Strategy::Cached => "Cached",
            Strategy::Prefetch(_) => "Prefetch",
        };
        write!(f, "{name}")
    }
}

struct PrefetchState {
    rx: mpsc::Receiver<(u64, Vec<u8>)>,
    /// Received blocks not yet consumed, by start offset.
    blocks: BTreeMap<u64, Vec<u8>>,
    cancel: CancellationToken,
}

impl Drop for PrefetchState {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-handle reader over one pinned object generation.
pub struct FileReader {
    store: Arc<dyn ObjectStore>,
    name: ObjectName,
    generation: Generation,
    size: u64,
    config: ReaderConfig,
    detector: PatternDetector,
    strategy: Strategy,
    cache: Option<CacheContext>,
}

impl FileReader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        name: ObjectName,
        generation: Generation,
        size: u64,
        config: ReaderConfig,
        cache: Option<CacheContext>,
    ) -> Self {
        Self {
            store,
            name,
            generation,
            size,
            config,
            detector: PatternDetector::new(),
            strategy: Strategy::Uninitialized,
            cache,
        }
    }

    /// The generation every read is pinned to.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Reads up to `len` bytes at `offset`, choosing and upgrading the
    /// strategy from the observed pattern.
    pub async fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        if offset >= self.size || len == 0 {
            return Ok(Vec::new());
        }
        let len = len.min((self.size - offset) as u32);
        let pattern = self.detector.record(offset, len);

        if matches!(self.strategy, Strategy::Uninitialized) {
            self.strategy = self.initial_strategy(offset, pattern);
            debug!(name = %self.name, strategy = ?self.strategy, "reader strategy selected");
        }

        // A streaming strategy that observes a random pattern steps down to
        // exact-range reads.
        if pattern == ReadPattern::Random
            && matches!(
                self.strategy,
                Strategy::Sequential { .. } | Strategy::Prefetch(_)
            )
        {
            debug!(name = %self.name, from = ?self.strategy, "reader downgrading to random");
            self.strategy = Strategy::Random;
        }

        if matches!(self.strategy, Strategy::Cached) {
            self.read_cached(offset, len).await
        } else if matches!(self.strategy, Strategy::Random) {
            self.read_direct(offset..offset + len as u64).await
        } else if matches!(self.strategy, Strategy::Sequential { .. }) {
            self.read_sequential(offset, len).await
        } else {
            self.read_prefetch(offset, len).await
        }
    }

    fn initial_strategy(&self, offset: u64, pattern: ReadPattern) -> Strategy {
        if self.cache.is_some() {
            return Strategy::Cached;
        }
        if pattern == ReadPattern::Random {
            return Strategy::Random;
        }
        if self.config.prefetch_workers > 0 {
            return Strategy::Prefetch(self.start_prefetch(offset));
        }
        Strategy::Sequential {
            buffer: Vec::new(),
            buffer_offset: 0,
        }
    }

    /// One exact-range request.
    async fn read_direct(&self, range: Range<u64>) -> Result<Vec<u8>, FsError> {
        let req = ReadRequest {
            name: self.name.clone(),
            generation: self.generation,
            range,
        };
        self.store.read_object(&req).await.map_err(map_read_error)
    }

    async fn read_sequential(&mut self, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        let window = self.config.sequential_window;
        let size = self.size;

        // Serve from the buffer when the requested start is inside it.
        if let Strategy::Sequential {
            buffer,
            buffer_offset,
        } = &self.strategy
        {
            let buf_end = *buffer_offset + buffer.len() as u64;
            if offset >= *buffer_offset && offset < buf_end {
                let start = (offset - buffer_offset) as usize;
                let end = (start + len as usize).min(buffer.len());
                trace!(offset, served = end - start, "sequential read from buffer");
                return Ok(buffer[start..end].to_vec());
            }
        }

        // Buffer miss: fetch the next window starting at the read offset.
        let fetch_end = (offset + window).min(size);
        let data = self.read_direct(offset..fetch_end).await?;
        let served_len = (len as usize).min(data.len());
        let served = data[..served_len].to_vec();
        self.strategy = Strategy::Sequential {
            buffer: data,
            buffer_offset: offset,
        };
        Ok(served)
    }

    async fn read_cached(&mut self, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        let cache = self.cache.as_ref().expect("cached strategy without context");
        let range = offset..offset + len as u64;
        match cache.job.ensure_range(range).await {
            Ok(()) => {}
            Err(e) => {
                if cache.entry.is_doomed() {
                    // The pinned generation vanished under us.
                    return Err(FsError::StaleHandle(self.name.as_str().to_string()));
                }
                // Chunk failure: fall back to a direct read of this range
                // rather than failing the handle outright.
                debug!(name = %self.name, error = %e, "cache read failed, falling back to direct read");
                return self.read_direct(offset..offset + len as u64).await;
            }
        }
        cache
            .entry
            .read(offset, len as usize)
            .map_err(|e| FsError::Io(e.to_string()))
    }

    fn start_prefetch(&self, from: u64) -> PrefetchState {
        let block = self.config.prefetch_block.max(1);
        let workers = self.config.prefetch_workers.max(1);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(workers * 2);
        // Workers race on a shared block counter starting at the block
        // containing the first read.
        let counter = Arc::new(AtomicU64::new(from / block));

        for _ in 0..workers {
            let store = Arc::clone(&self.store);
            let name = self.name.clone();
            let generation = self.generation;
            let size = self.size;
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    let start = index * block;
                    if start >= size || cancel.is_cancelled() {
                        return;
                    }
                    let end = (start + block).min(size);
                    let req = ReadRequest {
                        name: name.clone(),
                        generation,
                        range: start..end,
                    };
                    let result = tokio::select! {
                        r = store.read_object(&req) => r,
                        _ = cancel.cancelled() => return,
                    };
                    match result {
                        Ok(data) => {
                            if tx.send((start, data)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            // Dropping the sender side reports the failure
                            // to the consumer as a closed channel.
                            return;
                        }
                    }
                }
            });
        }
        PrefetchState {
            rx,
            blocks: BTreeMap::new(),
            cancel,
        }
    }

    async fn read_prefetch(&mut self, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        let block = self.config.prefetch_block.max(1);
        let block_start = (offset / block) * block;

        let Strategy::Prefetch(state) = &mut self.strategy else {
            unreachable!("caller checked the strategy");
        };

        // Drop fully consumed blocks.
        let consumed: Vec<u64> = state
            .blocks
            .range(..block_start)
            .filter(|(start, data)| *start + data.len() as u64 <= block_start)
            .map(|(start, _)| *start)
            .collect();
        for start in consumed {
            state.blocks.remove(&start);
        }

        // A block behind the pipeline's window was already discarded; the
        // workers only move forward, so fetch it directly.
        let behind_pipeline = state
            .blocks
            .keys()
            .next()
            .is_some_and(|&first| block_start < first);
        if behind_pipeline {
            return self.read_direct(offset..offset + len as u64).await;
        }

        // Pull from the workers until the needed block arrives.
        while !state.blocks.contains_key(&block_start) {
            match state.rx.recv().await {
                Some((start, data)) => {
                    trace!(start, len = data.len(), "prefetched block received");
                    state.blocks.insert(start, data);
                }
                None => {
                    // Workers died or never covered this block (e.g. a
                    // backwards seek): direct read keeps the handle alive.
                    debug!(name = %self.name, offset, "prefetch miss, reading directly");
                    return self.read_direct(offset..offset + len as u64).await;
                }
            }
        }

        let data = &state.blocks[&block_start];
        let start = (offset - block_start) as usize;
        if start >= data.len() {
            return Ok(Vec::new());
        }
        // Serve at most to the block boundary; the kernel re-issues for
        // the remainder.
        let end = (start + len as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

/// Maps store read failures onto handle errors: a failed generation
/// precondition is a stale handle, everything else keeps its kind.
fn map_read_error(err: StoreError) -> FsError {
    match err {
        StoreError::PreconditionFailed { name, .. } | StoreError::NotFound(name) => {
            FsError::StaleHandle(name)
        }
        other => other.into(),
    }
}
