//! Object-store access layer for bucketfs.
//!
//! The centrepiece is [`Bucket`], the capability the rest of the system
//! talks to. It wraps an inner [`ObjectStore`] implementation (the HTTP
//! client in production, the in-memory fake in tests) and guarantees that
//! every outbound request is paced by the process-wide [`RequestLimiter`],
//! wrapped in the [`RetryPolicy`], bounded by the per-request deadline, and
//! fronted by the stat cache.

pub mod auth;
pub mod bucket;
pub mod fake;
pub mod http;
pub mod rate_limit;
pub mod retry;

pub use bucket::Bucket;
pub use fake::FakeObjectStore;
pub use http::HttpObjectStore;
pub use rate_limit::{RequestLimiter, TokenBucket};
pub use retry::RetryPolicy;
