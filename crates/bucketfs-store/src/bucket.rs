//! The bucket capability: the one interface the filesystem talks to.
//!
//! `Bucket` wraps an inner [`ObjectStore`] and enforces that every outbound
//! request is paced by the process-wide [`RequestLimiter`], retried under
//! the [`RetryPolicy`], and bounded by a per-request deadline covering all
//! attempts. `stat_object` is additionally fronted by the [`StatCache`],
//! and every mutation keeps that cache coherent: created and copied
//! metadata is inserted, deletes leave a negative entry, and a failed
//! precondition drops whatever stale entry misled the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bucketfs_cache::StatCache;
use bucketfs_core::domain::{Generation, ObjectMetadata, ObjectName, StoreError};
use bucketfs_core::ports::object_store::{
    CreateRequest, ListRequest, Listing, ObjectStore, ReadRequest, StoreResult,
};
use tokio::time::Instant;
use tracing::debug;

use crate::rate_limit::RequestLimiter;
use crate::retry::RetryPolicy;

/// Rate-limited, retried, stat-cached view of the object store.
pub struct Bucket {
    inner: Arc<dyn ObjectStore>,
    limiter: Arc<RequestLimiter>,
    retry: RetryPolicy,
    stat_cache: Arc<StatCache>,
    request_timeout: Duration,
}

impl Bucket {
    pub fn new(
        inner: Arc<dyn ObjectStore>,
        limiter: Arc<RequestLimiter>,
        retry: RetryPolicy,
        stat_cache: Arc<StatCache>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            limiter,
            retry,
            stat_cache,
            request_timeout,
        }
    }

    /// The stat cache this bucket keeps coherent.
    pub fn stat_cache(&self) -> &Arc<StatCache> {
        &self.stat_cache
    }

    /// Drops any cached stat for `name`.
    pub fn invalidate_stat(&self, name: &ObjectName) {
        self.stat_cache.invalidate(name);
    }

    /// Runs one paced, attempt-timed, retried request.
    ///
    /// The operations token is charged per attempt: a retry is another
    /// outbound request. The deadline spans all attempts.
    async fn call<T, F, Fut>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let deadline = Instant::now() + self.request_timeout;
        self.retry
            .run(Some(deadline), || {
                let attempt = op();
                async {
                    self.limiter.acquire_op().await;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(StoreError::Timeout(self.request_timeout));
                    }
                    match tokio::time::timeout(remaining, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Timeout(self.request_timeout)),
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl ObjectStore for Bucket {
    async fn stat_object(&self, name: &ObjectName) -> StoreResult<ObjectMetadata> {
        if let Some(cached) = self.stat_cache.get(name) {
            debug!(name = %name, hit = cached.is_some(), "stat served from cache");
            return cached.ok_or_else(|| StoreError::NotFound(name.as_str().to_string()));
        }

        match self.call(|| self.inner.stat_object(name)).await {
            Ok(metadata) => {
                self.stat_cache.insert(metadata.clone());
                Ok(metadata)
            }
            Err(e) if e.is_not_found() => {
                self.stat_cache.insert_negative(name.clone());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_objects(&self, req: &ListRequest) -> StoreResult<Listing> {
        self.call(|| self.inner.list_objects(req)).await
    }

    async fn read_object(&self, req: &ReadRequest) -> StoreResult<Vec<u8>> {
        let data = self.call(|| self.inner.read_object(req)).await;
        match data {
            Ok(data) => {
                // Egress tokens are charged as the body is consumed.
                self.limiter.acquire_egress(data.len() as u64).await;
                Ok(data)
            }
            Err(e @ StoreError::PreconditionFailed { .. }) => {
                // The cached metadata led us to a dead generation.
                self.stat_cache.invalidate(&req.name);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_object(&self, req: CreateRequest) -> StoreResult<ObjectMetadata> {
        let name = req.name.clone();
        let result = self.call(|| self.inner.create_object(req.clone())).await;
        match &result {
            Ok(metadata) => self.stat_cache.insert(metadata.clone()),
            Err(StoreError::PreconditionFailed { .. }) | Err(StoreError::AlreadyExists(_)) => {
                self.stat_cache.invalidate(&name);
            }
            Err(_) => {}
        }
        result
    }

    async fn copy_object(
        &self,
        src: &ObjectName,
        src_generation: Generation,
        dst: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata> {
        let result = self
            .call(|| {
                self.inner
                    .copy_object(src, src_generation, dst, if_generation_match)
            })
            .await;
        match &result {
            Ok(metadata) => self.stat_cache.insert(metadata.clone()),
            Err(StoreError::PreconditionFailed { .. }) => {
                self.stat_cache.invalidate(src);
                self.stat_cache.invalidate(dst);
            }
            Err(_) => {}
        }
        result
    }

    async fn compose_objects(
        &self,
        dst: &ObjectName,
        sources: &[ObjectName],
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata> {
        let result = self
            .call(|| self.inner.compose_objects(dst, sources, if_generation_match))
            .await;
        match &result {
            Ok(metadata) => self.stat_cache.insert(metadata.clone()),
            Err(StoreError::PreconditionFailed { .. }) => self.stat_cache.invalidate(dst),
            Err(_) => {}
        }
        result
    }

    async fn delete_object(
        &self,
        name: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<()> {
        let result = self
            .call(|| self.inner.delete_object(name, if_generation_match))
            .await;
        match &result {
            Ok(()) => self.stat_cache.insert_negative(name.clone()),
            Err(StoreError::PreconditionFailed { .. }) => self.stat_cache.invalidate(name),
            Err(_) => {}
        }
        result
    }
}
