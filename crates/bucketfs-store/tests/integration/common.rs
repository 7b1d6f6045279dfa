//! Shared test helpers for store integration tests.
//!
//! Provides wiremock-based mock server setup for the storage JSON API.
//! Each helper mounts the necessary mock endpoints and returns a configured
//! client pointing at the mock server.

use bucketfs_store::auth::AuthMode;
use bucketfs_store::HttpObjectStore;
use wiremock::MockServer;

/// Starts a mock server and an anonymous client for bucket `test-bucket`.
pub async fn setup_store() -> (MockServer, HttpObjectStore) {
    let server = MockServer::start().await;
    let store = HttpObjectStore::new(server.uri(), "test-bucket", AuthMode::Anonymous);
    (server, store)
}

/// JSON body of an object resource for mock responses.
pub fn object_resource(name: &str, generation: i64, size: u64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "generation": generation.to_string(),
        "metageneration": "1",
        "size": size.to_string(),
        "contentType": "application/octet-stream",
        "updated": "2026-01-15T10:00:00Z"
    })
}
