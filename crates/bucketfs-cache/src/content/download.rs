//! Download manager for content-cache entries.
//!
//! A `DownloadJob` fills one cache entry's chunks from the object store.
//! Two modes:
//!
//! - **Sequential**: one background worker walks the file front-to-back.
//! - **Parallel**: a pool of workers drains a demand queue fed by readers,
//!   then prefetches forward.
//!
//! Reads never depend on the background workers being alive: `ensure_range`
//! claims and downloads any still-absent chunk of its range inline, so the
//! workers only ever add prefetch, and a chunk is downloaded exactly once
//! (claims are atomic on the entry).
//!
//! Every range read is pinned to the entry's generation; if the store
//! reports the generation gone, the whole entry is doomed so readers fail
//! over to a fresh stat instead of mixing generations.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bucketfs_core::domain::{ObjectMetadata, StoreError};
use bucketfs_core::ports::object_store::{ObjectStore, ReadRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::content::entry::{CacheEntry, ChunkState};
use crate::error::CacheError;

/// How the job schedules chunk downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// One worker, strict front-to-back order.
    Sequential,
    /// `workers` concurrent workers, demand-first then forward prefetch.
    Parallel { workers: usize },
}

/// Fills a cache entry from the object store.
pub struct DownloadJob {
    entry: Arc<CacheEntry>,
    store: Arc<dyn ObjectStore>,
    metadata: ObjectMetadata,
    mode: DownloadMode,
    validate_crc: bool,
    validated: AtomicBool,
    demand: Mutex<VecDeque<u32>>,
    cancel: CancellationToken,
}

impl DownloadJob {
    /// Creates the job and spawns its background workers.
    ///
    /// Must be called within a tokio runtime context.
    pub fn spawn(
        entry: Arc<CacheEntry>,
        store: Arc<dyn ObjectStore>,
        metadata: ObjectMetadata,
        mode: DownloadMode,
        validate_crc: bool,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let job = Arc::new(Self {
            entry,
            store,
            metadata,
            mode,
            validate_crc,
            validated: AtomicBool::new(false),
            demand: Mutex::new(VecDeque::new()),
            cancel,
        });

        let workers = match mode {
            DownloadMode::Sequential => 1,
            DownloadMode::Parallel { workers } => workers.max(1),
        };
        for worker in 0..workers {
            let job = Arc::clone(&job);
            tokio::spawn(async move {
                job.worker_loop(worker).await;
            });
        }
        job
    }

    /// The entry this job is filling.
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Makes `range` present, downloading inline whatever the workers have
    /// not reached yet, then waits for all intersecting chunks.
    pub async fn ensure_range(&self, range: Range<u64>) -> Result<(), CacheError> {
        let chunks = self.entry.chunks_in(&range);

        {
            let mut demand = self.demand.lock().unwrap();
            for chunk in chunks.clone() {
                demand.push_back(chunk);
            }
        }

        for chunk in chunks {
            // Give previously failed chunks another chance on an explicit
            // read; transient store errors should not poison the entry.
            if self.entry.chunk_state(chunk) == ChunkState::Failed {
                self.entry.reset_chunk(chunk);
            }
            if self.entry.try_claim(chunk) {
                self.download_chunk(chunk).await;
            }
        }

        tokio::select! {
            result = self.entry.wait_for_range(range) => result,
            _ = self.cancel.cancelled() => Err(CacheError::Cancelled),
        }
    }

    async fn worker_loop(&self, worker: usize) {
        debug!(
            name = %self.metadata.name,
            worker,
            mode = ?self.mode,
            "download worker started"
        );
        loop {
            if self.cancel.is_cancelled() || self.entry.is_doomed() {
                return;
            }
            let Some(chunk) = self.next_chunk() else {
                debug!(name = %self.metadata.name, worker, "download worker done");
                return;
            };
            tokio::select! {
                _ = self.download_chunk(chunk) => {}
                _ = self.cancel.cancelled() => {
                    // Leave the chunk retryable rather than permanently failed.
                    self.entry.fail_chunk(chunk);
                    self.entry.reset_chunk(chunk);
                    return;
                }
            }
        }
    }

    /// Picks and claims the next chunk for a worker, or `None` when every
    /// chunk is already claimed, present or failed.
    fn next_chunk(&self) -> Option<u32> {
        if matches!(self.mode, DownloadMode::Parallel { .. }) {
            loop {
                let demanded = self.demand.lock().unwrap().pop_front();
                match demanded {
                    Some(chunk) => {
                        if self.entry.try_claim(chunk) {
                            return Some(chunk);
                        }
                    }
                    None => break,
                }
            }
        }
        let mut from = 0;
        loop {
            let chunk = self.entry.next_absent_chunk(from)?;
            if self.entry.try_claim(chunk) {
                return Some(chunk);
            }
            from = chunk + 1;
        }
    }

    /// Downloads one claimed chunk and records the outcome on the entry.
    async fn download_chunk(&self, chunk: u32) {
        let start = chunk as u64 * self.entry.chunk_size();
        let end = (start + self.entry.chunk_size()).min(self.entry.size());
        let req = ReadRequest {
            name: self.metadata.name.clone(),
            generation: self.metadata.generation,
            range: start..end,
        };

        match self.store.read_object(&req).await {
            Ok(data) if data.len() as u64 == end - start => {
                if let Err(e) = self.entry.complete_chunk(chunk, &data) {
                    warn!(name = %self.metadata.name, chunk, error = %e, "failed to persist chunk");
                    self.entry.fail_chunk(chunk);
                    return;
                }
                self.maybe_validate();
            }
            Ok(data) => {
                warn!(
                    name = %self.metadata.name,
                    chunk,
                    expected = end - start,
                    got = data.len(),
                    "short read from store, failing chunk"
                );
                self.entry.fail_chunk(chunk);
            }
            Err(StoreError::PreconditionFailed { .. }) | Err(StoreError::NotFound(_)) => {
                // The pinned generation is gone: the whole entry is stale.
                debug!(
                    name = %self.metadata.name,
                    generation = %self.metadata.generation,
                    "generation replaced during download, dooming cache entry"
                );
                self.entry.fail_chunk(chunk);
                self.entry.doom();
            }
            Err(e) => {
                warn!(name = %self.metadata.name, chunk, error = %e, "chunk download failed");
                self.entry.fail_chunk(chunk);
            }
        }
    }

    /// Validates the whole entry against the object CRC32C once it is
    /// fully present. Runs at most once.
    fn maybe_validate(&self) {
        if !self.validate_crc || !self.entry.fully_present() {
            return;
        }
        let Some(expected) = self.metadata.crc32c else {
            return;
        };
        if self.validated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.entry.validate_crc(expected) {
            warn!(name = %self.metadata.name, error = %e, "cached content failed crc validation");
            self.entry.doom();
        }
    }
}
