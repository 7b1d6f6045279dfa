//! Integration tests for the object-store access layer.

mod common;
mod test_bucket_layer;
mod test_http_store;
