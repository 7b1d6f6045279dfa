//! Rate limiting for object-store traffic.
//!
//! Two independent token buckets pace all outbound traffic:
//!
//! - the **operations** bucket charges one token per store call;
//! - the **egress** bucket charges one token per response-body byte.
//!
//! [`TokenBucket`] implements the classic algorithm: tokens refill at a
//! constant rate up to a burst capacity, and callers sleep until their
//! charge is covered. A limit of zero or below means unlimited and the
//! bucket is simply absent.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Internal mutable state for the token bucket, protected by a Mutex.
#[derive(Debug)]
struct TokenBucketInner {
    /// Current number of available tokens (fractional for smooth refill).
    tokens: f64,
    /// Timestamp of the last refill calculation.
    last_refill: Instant,
}

/// Token bucket pacing one resource.
///
/// Thread safety is provided by an internal `Mutex<TokenBucketInner>`; the
/// lock is never held across an await. Waiting is done by computing the
/// shortfall's refill time and sleeping outside the lock.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold (burst size).
    capacity: f64,
    /// Rate at which tokens are added (tokens per second).
    refill_rate: f64,
    inner: Mutex<TokenBucketInner>,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    pub fn new(refill_rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            refill_rate,
            inner: Mutex::new(TokenBucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Burst capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, inner: &mut TokenBucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            inner.tokens = (inner.tokens + elapsed * self.refill_rate).min(self.capacity);
            inner.last_refill = now;
        }
    }

    /// Attempts to take `amount` tokens without waiting.
    pub fn try_acquire(&self, amount: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.refill(&mut inner);
        if inner.tokens >= amount {
            inner.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Seconds until `amount` tokens will be available.
    fn time_until_available(&self, amount: f64) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        self.refill(&mut inner);
        if inner.tokens >= amount {
            0.0
        } else if self.refill_rate > 0.0 {
            (amount - inner.tokens) / self.refill_rate
        } else {
            f64::MAX
        }
    }

    /// Takes `amount` tokens, sleeping until the bucket can cover them.
    ///
    /// Charges larger than the capacity are drawn in capacity-sized
    /// instalments so a single huge response cannot deadlock the caller.
    pub async fn acquire(&self, amount: f64) {
        let mut remaining = amount;
        while remaining > 0.0 {
            let take = remaining.min(self.capacity);
            loop {
                if self.try_acquire(take) {
                    break;
                }
                let wait = self.time_until_available(take).max(0.001);
                debug!(wait_ms = (wait * 1000.0) as u64, "rate limiter waiting for tokens");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
            remaining -= take;
        }
    }
}

/// Process-wide pacing for store operations and egress bandwidth.
///
/// Burst capacity is one second's worth of the configured rate for both
/// buckets, which keeps the overshoot over any observation window within a
/// few percent of `rate × window` while still letting short bursts through.
#[derive(Debug, Default)]
pub struct RequestLimiter {
    ops: Option<TokenBucket>,
    egress: Option<TokenBucket>,
}

impl RequestLimiter {
    /// Creates a limiter from configured rates; a rate of zero or below
    /// disables that bucket.
    pub fn new(op_rate: f64, egress_rate: f64) -> Self {
        let ops = (op_rate > 0.0).then(|| TokenBucket::new(op_rate, op_rate));
        let egress = (egress_rate > 0.0).then(|| TokenBucket::new(egress_rate, egress_rate));
        Self { ops, egress }
    }

    /// An unlimited limiter.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Charges one operation, sleeping if the ops bucket is empty.
    pub async fn acquire_op(&self) {
        if let Some(bucket) = &self.ops {
            bucket.acquire(1.0).await;
        }
    }

    /// Charges `bytes` of egress, sleeping if the bytes bucket is empty.
    pub async fn acquire_egress(&self, bytes: u64) {
        if let Some(bucket) = &self.egress {
            bucket.acquire(bytes as f64).await;
        }
    }

    /// True when neither bucket is configured.
    pub fn is_unlimited(&self) -> bool {
        self.ops.is_none() && self.egress.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(5.0, 5.0);
        for _ in 0..5 {
            assert!(bucket.try_acquire(1.0));
        }
        assert!(!bucket.try_acquire(1.0));
    }

    #[test]
    fn test_no_refill_when_rate_zero() {
        let bucket = TokenBucket::new(0.0, 2.0);
        assert!(bucket.try_acquire(2.0));
        assert!(!bucket.try_acquire(0.5));
        assert_eq!(bucket.time_until_available(1.0), f64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let bucket = TokenBucket::new(10.0, 10.0);
        assert!(bucket.try_acquire(10.0));
        assert!(!bucket.try_acquire(1.0));

        tokio::time::advance(Duration::from_millis(500)).await;
        // 0.5 s at 10 tokens/s refills 5 tokens.
        assert!(bucket.try_acquire(5.0));
        assert!(!bucket.try_acquire(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(10.0, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_acquire(10.0));
        assert!(!bucket.try_acquire(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(100.0, 1.0);
        bucket.acquire(1.0).await;

        let start = Instant::now();
        bucket.acquire(1.0).await;
        // 1 token at 100/s needs ~10 ms of (virtual) time.
        assert!(Instant::now() - start >= Duration::from_millis(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_charge_drains_in_instalments() {
        let bucket = TokenBucket::new(1000.0, 100.0);
        let start = Instant::now();
        // 350 tokens at 1000/s with 100 burst: ~250 ms of waiting.
        bucket.acquire(350.0).await;
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_matches_configured_rate() {
        // 20 ops at 5 ops/s with burst 5: the 5-token burst is free, the
        // remaining 15 drain at 5/s, so total wall time is at least 3 s.
        let limiter = RequestLimiter::new(5.0, -1.0);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire_op().await;
        }
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_unlimited_limiter_never_blocks() {
        let limiter = RequestLimiter::new(-1.0, 0.0);
        assert!(limiter.is_unlimited());
        for _ in 0..10_000 {
            limiter.acquire_op().await;
        }
        limiter.acquire_egress(u64::MAX / 2).await;
    }
}
