//! Stat cache: bounded LRU of object metadata with TTL.
//!
//! Keyed by object name. A `Some(metadata)` value is a positive entry; a
//! `None` value is a negative entry, remembering that a stat returned 404 so
//! repeated lookups of absent names cost nothing. Entries expire by wall
//! clock; expired entries are normally treated as misses but can still be
//! served through [`StatCache::get_allow_expired`], which listings use when
//! a slightly stale size is preferable to an extra round trip.
//!
//! Replacement is least-recently-used over both reads and writes. The LRU
//! order is kept with a lazy queue: every touch appends a `(name, tick)`
//! pair, and eviction pops stale pairs until it finds one whose tick still
//! matches the entry. This keeps touches O(1) without a linked list.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use bucketfs_core::domain::{ObjectMetadata, ObjectName};
use tokio::time::Instant;
use tracing::debug;

/// A cached stat result: metadata, or remembered absence.
type StatValue = Option<ObjectMetadata>;

#[derive(Debug)]
struct StatEntry {
    value: StatValue,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct StatCacheInner {
    entries: HashMap<ObjectName, StatEntry>,
    /// Lazy LRU queue of (name, tick-at-touch). Pairs whose tick no longer
    /// matches the entry's `last_used` are skipped during eviction.
    use_queue: VecDeque<(ObjectName, u64)>,
    tick: u64,
}

/// Bounded, TTL-expiring LRU cache of object metadata.
///
/// Thread-safe; shared as `Arc<StatCache>` across the bucket wrapper and
/// the inode layer.
#[derive(Debug)]
pub struct StatCache {
    inner: Mutex<StatCacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl StatCache {
    /// Creates a cache holding at most `capacity` entries, each fresh for `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(StatCacheInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Records a positive entry.
    pub fn insert(&self, metadata: ObjectMetadata) {
        let name = metadata.name.clone();
        self.insert_value(name, Some(metadata));
    }

    /// Records a negative entry: the name is known to be absent.
    pub fn insert_negative(&self, name: ObjectName) {
        self.insert_value(name, None);
    }

    fn insert_value(&self, name: ObjectName, value: StatValue) {
        let mut inner = self.inner.lock().unwrap();
        let expires_at = Instant::now() + self.ttl;
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            name.clone(),
            StatEntry {
                value,
                expires_at,
                last_used: tick,
            },
        );
        inner.use_queue.push_back((name, tick));
        Self::evict_over_capacity(&mut inner, self.capacity);
    }

    /// Looks up a fresh entry.
    ///
    /// `None` is a miss. `Some(None)` is a fresh negative entry — the caller
    /// should report not-found without touching the store. `Some(Some(m))`
    /// is a fresh positive entry.
    pub fn get(&self, name: &ObjectName) -> Option<StatValue> {
        self.get_impl(name, false)
    }

    /// Like [`StatCache::get`] but also serves expired entries.
    ///
    /// Used only by listing, which already has authoritative names in hand
    /// and opts into may-be-stale metadata.
    pub fn get_allow_expired(&self, name: &ObjectName) -> Option<StatValue> {
        self.get_impl(name, true)
    }

    fn get_impl(&self, name: &ObjectName, allow_expired: bool) -> Option<StatValue> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.tick += 1;
        let tick = inner.tick;

        let entry = inner.entries.get_mut(name)?;
        if !allow_expired && entry.expires_at <= now {
            return None;
        }
        entry.last_used = tick;
        let value = entry.value.clone();
        inner.use_queue.push_back((name.clone(), tick));
        Some(value)
    }

    /// Drops the entry for `name`, if any.
    pub fn invalidate(&self, name: &ObjectName) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(name).is_some() {
            debug!(name = %name, "stat cache entry invalidated");
        }
    }

    /// Current number of entries (including expired, not yet evicted ones).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_over_capacity(inner: &mut StatCacheInner, capacity: usize) {
        while inner.entries.len() > capacity {
            let Some((name, tick)) = inner.use_queue.pop_front() else {
                // Queue exhausted; nothing more to evict.
                return;
            };
            let is_current = inner
                .entries
                .get(&name)
                .is_some_and(|e| e.last_used == tick);
            if is_current {
                inner.entries.remove(&name);
                debug!(name = %name, "stat cache entry evicted (LRU)");
            }
        }
    }
}
