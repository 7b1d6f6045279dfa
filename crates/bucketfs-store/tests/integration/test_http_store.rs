//! HTTP adapter tests against a mock storage API.

use bucketfs_core::domain::{Generation, ObjectName, StoreError};
use bucketfs_core::ports::object_store::{CreateRequest, ListRequest, ObjectStore, ReadRequest};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{object_resource, setup_store};

fn name(s: &str) -> ObjectName {
    ObjectName::new(s).unwrap()
}

#[tokio::test]
async fn test_stat_object_parses_resource() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .and(path("/storage/v1/b/test-bucket/o/photos%2Fcat.jpg"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(object_resource("photos/cat.jpg", 41, 2048)),
        )
        .mount(&server)
        .await;

    let metadata = store.stat_object(&name("photos/cat.jpg")).await.unwrap();
    assert_eq!(metadata.generation, Generation(41));
    assert_eq!(metadata.size, 2048);
}

#[tokio::test]
async fn test_stat_missing_object_is_not_found() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "error": {"message": "No such object"}
        })))
        .mount(&server)
        .await;

    let result = store.stat_object(&name("nope")).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_list_objects_with_delimiter() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .and(path("/storage/v1/b/test-bucket/o"))
        .and(query_param("prefix", "a/"))
        .and(query_param("delimiter", "/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [object_resource("a/x", 7, 3)],
            "prefixes": ["a/sub/"],
            "nextPageToken": "token-1"
        })))
        .mount(&server)
        .await;

    let listing = store
        .list_objects(&ListRequest::directory("a/", 100))
        .await
        .unwrap();
    assert_eq!(listing.objects.len(), 1);
    assert_eq!(listing.objects[0].name.as_str(), "a/x");
    assert_eq!(listing.prefixes, vec!["a/sub/".to_string()]);
    assert_eq!(listing.next_token.as_deref(), Some("token-1"));
}

#[tokio::test]
async fn test_read_range_sends_range_header_and_generation() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .and(path("/storage/v1/b/test-bucket/o/blob"))
        .and(query_param("alt", "media"))
        .and(query_param("generation", "9"))
        .and(header("Range", "bytes=4-7"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"data".to_vec()))
        .mount(&server)
        .await;

    let data = store
        .read_object(&ReadRequest {
            name: name("blob"),
            generation: Generation(9),
            range: 4..8,
        })
        .await
        .unwrap();
    assert_eq!(data, b"data");
}

#[tokio::test]
async fn test_read_of_replaced_generation_maps_to_precondition_failed() {
    let (server, store) = setup_store().await;

    // The store answers 404 for a generation that no longer exists.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = store
        .read_object(&ReadRequest {
            name: name("blob"),
            generation: Generation(3),
            range: 0..10,
        })
        .await;
    assert!(matches!(result, Err(StoreError::PreconditionFailed { .. })));
}

#[tokio::test]
async fn test_create_object_carries_precondition() {
    let (server, store) = setup_store().await;

    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/test-bucket/o"))
        .and(query_param("uploadType", "media"))
        .and(query_param("name", "fresh"))
        .and(query_param("ifGenerationMatch", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(object_resource("fresh", 1, 4)))
        .mount(&server)
        .await;

    let metadata = store
        .create_object(
            CreateRequest::new(name("fresh"), b"body".to_vec())
                .if_generation(Generation::NONE),
        )
        .await
        .unwrap();
    assert_eq!(metadata.generation, Generation(1));
}

#[tokio::test]
async fn test_create_conflict_maps_to_precondition_failed() {
    let (server, store) = setup_store().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
            "error": {"message": "conditionNotMet"}
        })))
        .mount(&server)
        .await;

    let result = store
        .create_object(
            CreateRequest::new(name("taken"), b"x".to_vec()).if_generation(Generation::NONE),
        )
        .await;
    assert!(matches!(result, Err(StoreError::PreconditionFailed { .. })));
}

#[tokio::test]
async fn test_delete_with_precondition() {
    let (server, store) = setup_store().await;

    Mock::given(method("DELETE"))
        .and(path("/storage/v1/b/test-bucket/o/victim"))
        .and(query_param("ifGenerationMatch", "5"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    store
        .delete_object(&name("victim"), Some(Generation(5)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_server_errors_are_classified_retryable() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let result = store.stat_object(&name("x")).await;
    match result {
        Err(e) => assert!(e.is_retryable(), "503 should be retryable, got {e}"),
        Ok(_) => panic!("expected error"),
    }
}

#[tokio::test]
async fn test_permission_errors_are_not_retryable() {
    let (server, store) = setup_store().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": {"message": "forbidden"}
        })))
        .mount(&server)
        .await;

    let result = store.stat_object(&name("x")).await;
    match result {
        Err(e @ StoreError::Permission(_)) => assert!(!e.is_retryable()),
        other => panic!("expected permission error, got {other:?}"),
    }
}
