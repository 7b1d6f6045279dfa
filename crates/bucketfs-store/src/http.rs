//! HTTP adapter for a JSON-API object store.
//!
//! Implements [`ObjectStore`] against the storage JSON API: object metadata
//! and listings under `/storage/v1/b/{bucket}/o`, media reads with `Range`
//! headers, uploads under `/upload/storage/v1`, and the generation
//! preconditions carried as `ifGenerationMatch` query parameters.
//!
//! This adapter does no pacing and no retrying of its own; it converts
//! wire-level failures into the [`StoreError`] taxonomy and leaves policy
//! to the [`Bucket`](crate::bucket::Bucket) wrapper.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use bucketfs_core::domain::{Generation, Metageneration, ObjectMetadata, ObjectName, StoreError};
use bucketfs_core::ports::object_store::{
    CreateRequest, ListRequest, Listing, ObjectStore, ReadRequest, StoreResult,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::auth::AuthMode;

// ============================================================================
// Wire types
// ============================================================================

/// Object resource as returned by the JSON API.
///
/// Integer fields arrive as decimal strings; checksums arrive base64-encoded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    generation: String,
    metageneration: String,
    size: String,
    content_type: Option<String>,
    updated: Option<String>,
    crc32c: Option<String>,
    md5_hash: Option<String>,
    metadata: Option<HashMap<String, String>>,
}

/// One page of an object listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Option<Vec<ObjectResource>>,
    prefixes: Option<Vec<String>>,
    next_page_token: Option<String>,
}

/// Error envelope returned by the JSON API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl ObjectResource {
    fn into_metadata(self) -> StoreResult<ObjectMetadata> {
        let name = ObjectName::new(self.name)?;
        let generation: i64 = self
            .generation
            .parse()
            .map_err(|_| StoreError::Invalid(format!("bad generation: {}", self.generation)))?;
        let metageneration: i64 = self.metageneration.parse().map_err(|_| {
            StoreError::Invalid(format!("bad metageneration: {}", self.metageneration))
        })?;
        let size: u64 = self
            .size
            .parse()
            .map_err(|_| StoreError::Invalid(format!("bad size: {}", self.size)))?;
        let updated = self
            .updated
            .as_deref()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);

        let engine = base64::engine::general_purpose::STANDARD;
        let crc32c = self.crc32c.as_deref().and_then(|s| {
            let bytes = engine.decode(s).ok()?;
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(u32::from_be_bytes(arr))
        });
        let md5 = self.md5_hash.as_deref().and_then(|s| {
            let bytes = engine.decode(s).ok()?;
            bytes.try_into().ok()
        });

        Ok(ObjectMetadata {
            name,
            generation: Generation(generation),
            metageneration: Metageneration(metageneration),
            size,
            content_type: self.content_type,
            updated,
            crc32c,
            md5,
            custom: self.metadata.unwrap_or_default(),
        })
    }
}

// ============================================================================
// HttpObjectStore
// ============================================================================

/// JSON-API object-store client.
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    bucket: String,
    auth: AuthMode,
}

impl HttpObjectStore {
    /// Creates a client for `bucket` at the given endpoint.
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>, auth: AuthMode) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            auth,
        }
    }

    /// Bucket this client addresses.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// URL for an object's metadata/media resource, with the object name as
    /// a single percent-encoded path segment.
    fn object_url(&self, name: &ObjectName) -> StoreResult<Url> {
        let base = format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket);
        let mut url = Url::parse(&base)
            .map_err(|e| StoreError::Invalid(format!("bad endpoint url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid("endpoint cannot be a base".into()))?
            .push(name.as_str());
        Ok(url)
    }

    fn list_url(&self) -> StoreResult<Url> {
        Url::parse(&format!(
            "{}/storage/v1/b/{}/o",
            self.base_url, self.bucket
        ))
        .map_err(|e| StoreError::Invalid(format!("bad endpoint url: {e}")))
    }

    fn upload_url(&self) -> StoreResult<Url> {
        Url::parse(&format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base_url, self.bucket
        ))
        .map_err(|e| StoreError::Invalid(format!("bad endpoint url: {e}")))
    }

    async fn authed(&self, method: Method, url: Url) -> StoreResult<RequestBuilder> {
        let mut builder = self.client.request(method, url);
        let token = self
            .auth
            .bearer_token(&self.client)
            .await
            .map_err(|e| StoreError::Permission(e.to_string()))?;
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    /// Sends a request, mapping transport failures into the taxonomy.
    async fn send(builder: RequestBuilder) -> StoreResult<Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::Timeout(std::time::Duration::from_secs(0))
            } else {
                StoreError::Network(e.to_string())
            }
        })
    }

    /// Converts a non-success response into the matching error kind.
    async fn error_for(response: Response, name: &str) -> StoreError {
        let status = response.status();
        let message = response
            .json::<ErrorResponse>()
            .await
            .ok()
            .and_then(|e| e.error.message)
            .unwrap_or_else(|| status.to_string());

        match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(name.to_string()),
            StatusCode::PRECONDITION_FAILED => StoreError::PreconditionFailed {
                name: name.to_string(),
                expected: -1,
            },
            StatusCode::CONFLICT => StoreError::AlreadyExists(name.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Permission(message),
            StatusCode::TOO_MANY_REQUESTS => StoreError::RateLimited(message),
            s if s.is_server_error() => StoreError::Server {
                status: s.as_u16(),
                message,
            },
            _ => StoreError::Invalid(format!("{status}: {message}")),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn stat_object(&self, name: &ObjectName) -> StoreResult<ObjectMetadata> {
        debug!(name = %name, "stat object");
        let url = self.object_url(name)?;
        let response = Self::send(self.authed(Method::GET, url).await?).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, name.as_str()).await);
        }
        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|e| StoreError::Invalid(format!("malformed object resource: {e}")))?;
        resource.into_metadata()
    }

    async fn list_objects(&self, req: &ListRequest) -> StoreResult<Listing> {
        debug!(prefix = %req.prefix, "list objects");
        let mut url = self.list_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", &req.prefix);
            query.append_pair("maxResults", &req.max_results.to_string());
            if let Some(delimiter) = req.delimiter {
                query.append_pair("delimiter", &delimiter.to_string());
            }
            if let Some(token) = &req.continuation_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = Self::send(self.authed(Method::GET, url).await?).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, &req.prefix).await);
        }
        let page: ListResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Invalid(format!("malformed listing: {e}")))?;

        let mut objects = Vec::new();
        for item in page.items.unwrap_or_default() {
            objects.push(item.into_metadata()?);
        }
        Ok(Listing {
            objects,
            prefixes: page.prefixes.unwrap_or_default(),
            next_token: page.next_page_token,
        })
    }

    async fn read_object(&self, req: &ReadRequest) -> StoreResult<Vec<u8>> {
        debug!(
            name = %req.name,
            generation = %req.generation,
            start = req.range.start,
            end = req.range.end,
            "read object range"
        );
        if req.range.start >= req.range.end {
            return Ok(Vec::new());
        }

        let mut url = self.object_url(&req.name)?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("generation", &req.generation.get().to_string());

        let range_header = format!("bytes={}-{}", req.range.start, req.range.end - 1);
        let builder = self
            .authed(Method::GET, url)
            .await?
            .header(reqwest::header::RANGE, range_header);

        let response = Self::send(builder).await?;
        let status = response.status();
        // A request entirely past end-of-object is an empty read.
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let error = Self::error_for(response, req.name.as_str()).await;
            // Reading a pinned generation that has been replaced comes back
            // as 404 on the generation; surface the precondition failure.
            return Err(match error {
                StoreError::NotFound(name) if req.generation.exists() => {
                    StoreError::PreconditionFailed {
                        name,
                        expected: req.generation.get(),
                    }
                }
                other => other,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn create_object(&self, req: CreateRequest) -> StoreResult<ObjectMetadata> {
        debug!(name = %req.name, size = req.contents.len(), "create object");
        let mut url = self.upload_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "media");
            query.append_pair("name", req.name.as_str());
            if let Some(generation) = req.if_generation_match {
                query.append_pair("ifGenerationMatch", &generation.get().to_string());
            }
        }

        let mut builder = self.authed(Method::POST, url).await?.body(req.contents);
        if let Some(content_type) = &req.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.clone());
        }

        let response = Self::send(builder).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, req.name.as_str()).await);
        }
        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|e| StoreError::Invalid(format!("malformed object resource: {e}")))?;
        let mut metadata = resource.into_metadata()?;

        // Media uploads cannot carry custom metadata; patch it on afterward.
        if !req.metadata.is_empty() {
            let url = self.object_url(&req.name)?;
            let body = serde_json::json!({ "metadata": req.metadata });
            let response =
                Self::send(self.authed(Method::PATCH, url).await?.json(&body)).await?;
            if !response.status().is_success() {
                return Err(Self::error_for(response, req.name.as_str()).await);
            }
            let resource: ObjectResource = response
                .json()
                .await
                .map_err(|e| StoreError::Invalid(format!("malformed object resource: {e}")))?;
            metadata = resource.into_metadata()?;
        }
        Ok(metadata)
    }

    async fn copy_object(
        &self,
        src: &ObjectName,
        src_generation: Generation,
        dst: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata> {
        debug!(src = %src, dst = %dst, "copy object");
        let base = format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket);
        let mut url = Url::parse(&base)
            .map_err(|e| StoreError::Invalid(format!("bad endpoint url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid("endpoint cannot be a base".into()))?
            .push(src.as_str())
            .push("copyTo")
            .push("b")
            .push(&self.bucket)
            .push("o")
            .push(dst.as_str());
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sourceGeneration", &src_generation.get().to_string());
            if let Some(generation) = if_generation_match {
                query.append_pair("ifGenerationMatch", &generation.get().to_string());
            }
        }

        let response = Self::send(self.authed(Method::POST, url).await?).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, src.as_str()).await);
        }
        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|e| StoreError::Invalid(format!("malformed object resource: {e}")))?;
        resource.into_metadata()
    }

    async fn compose_objects(
        &self,
        dst: &ObjectName,
        sources: &[ObjectName],
        if_generation_match: Option<Generation>,
    ) -> StoreResult<ObjectMetadata> {
        debug!(dst = %dst, sources = sources.len(), "compose objects");
        let mut url = self.object_url(dst)?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Invalid("endpoint cannot be a base".into()))?
            .push("compose");
        if let Some(generation) = if_generation_match {
            url.query_pairs_mut()
                .append_pair("ifGenerationMatch", &generation.get().to_string());
        }

        let body = serde_json::json!({
            "sourceObjects": sources
                .iter()
                .map(|s| serde_json::json!({ "name": s.as_str() }))
                .collect::<Vec<_>>(),
        });
        let response = Self::send(self.authed(Method::POST, url).await?.json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, dst.as_str()).await);
        }
        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|e| StoreError::Invalid(format!("malformed object resource: {e}")))?;
        resource.into_metadata()
    }

    async fn delete_object(
        &self,
        name: &ObjectName,
        if_generation_match: Option<Generation>,
    ) -> StoreResult<()> {
        debug!(name = %name, "delete object");
        let mut url = self.object_url(name)?;
        if let Some(generation) = if_generation_match {
            url.query_pairs_mut()
                .append_pair("ifGenerationMatch", &generation.get().to_string());
        }

        let response = Self::send(self.authed(Method::DELETE, url).await?).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, name.as_str()).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_resource_parsing() {
        let json = r#"{
            "name": "photos/cat.jpg",
            "generation": "1700000000000001",
            "metageneration": "2",
            "size": "1024",
            "contentType": "image/jpeg",
            "updated": "2025-11-14T12:00:00Z",
            "crc32c": "AAAAAQ==",
            "metadata": {"owner": "alice"}
        }"#;
        let resource: ObjectResource = serde_json::from_str(json).unwrap();
        let metadata = resource.into_metadata().unwrap();

        assert_eq!(metadata.name.as_str(), "photos/cat.jpg");
        assert_eq!(metadata.generation.get(), 1700000000000001);
        assert_eq!(metadata.metageneration.get(), 2);
        assert_eq!(metadata.size, 1024);
        assert_eq!(metadata.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(metadata.crc32c, Some(1));
        assert_eq!(metadata.custom.get("owner").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_object_url_encodes_name_as_single_segment() {
        let store = HttpObjectStore::new(
            "http://localhost:9000",
            "test-bucket",
            AuthMode::Anonymous,
        );
        let name = ObjectName::new("a/b c.txt").unwrap();
        let url = store.object_url(&name).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/storage/v1/b/test-bucket/o/a%2Fb%20c.txt"
        );
    }

    #[test]
    fn test_malformed_generation_rejected() {
        let json = r#"{
            "name": "x",
            "generation": "not-a-number",
            "metageneration": "1",
            "size": "0"
        }"#;
        let resource: ObjectResource = serde_json::from_str(json).unwrap();
        assert!(matches!(
            resource.into_metadata(),
            Err(StoreError::Invalid(_))
        ));
    }
}
