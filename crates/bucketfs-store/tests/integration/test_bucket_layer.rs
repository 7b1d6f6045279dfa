//! Bucket capability tests: pacing, retrying and stat caching composed
//! over the HTTP adapter.

use std::sync::Arc;
use std::time::Duration;

use bucketfs_cache::StatCache;
use bucketfs_core::domain::ObjectName;
use bucketfs_core::ports::object_store::ObjectStore;
use bucketfs_store::{Bucket, RequestLimiter, RetryPolicy};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{object_resource, setup_store};

fn name(s: &str) -> ObjectName {
    ObjectName::new(s).unwrap()
}

#[tokio::test]
async fn test_bucket_retries_transient_http_failures() {
    let (server, store) = setup_store().await;

    // Two 503s, then success.
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/test-bucket/o/wobbly"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/test-bucket/o/wobbly"))
        .respond_with(ResponseTemplate::new(200).set_body_json(object_resource("wobbly", 1, 8)))
        .mount(&server)
        .await;

    let bucket = Bucket::new(
        Arc::new(store),
        Arc::new(RequestLimiter::unlimited()),
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_sleep: Duration::from_millis(50),
            max_attempts: 5,
        },
        Arc::new(StatCache::new(64, Duration::from_secs(60))),
        Duration::from_secs(10),
    );

    let metadata = bucket.stat_object(&name("wobbly")).await.unwrap();
    assert_eq!(metadata.size, 8);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_bucket_caches_stats_across_calls() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .and(path("/storage/v1/b/test-bucket/o/cached"))
        .respond_with(ResponseTemplate::new(200).set_body_json(object_resource("cached", 2, 16)))
        .expect(1)
        .mount(&server)
        .await;

    let bucket = Bucket::new(
        Arc::new(store),
        Arc::new(RequestLimiter::unlimited()),
        RetryPolicy::default(),
        Arc::new(StatCache::new(64, Duration::from_secs(60))),
        Duration::from_secs(10),
    );

    for _ in 0..5 {
        let metadata = bucket.stat_object(&name("cached")).await.unwrap();
        assert_eq!(metadata.size, 16);
    }
    // The mock's expect(1) verifies on drop that only one request arrived.
}
