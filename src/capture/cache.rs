//! Correlation cache from connection key to captured ClientHello.
//!
//! # Policy
//! - Bounded by `max_entries` when set. Inserting a new key into a full
//!   cache evicts one existing entry; which one is unspecified.
//! - Entries expire `ttl` after insertion when set. Expiry is lazy: a `get`
//!   that finds an expired entry removes it and reports a miss.
//! - Otherwise entries live until `remove`, which the interceptor calls
//!   when the connection closes.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::capture::identity::ConnectionKey;
use crate::capture::record::Record;
use crate::observability::metrics;

/// Value stored for a record that declared a body above the configured maximum.
pub const EXCEEDS_MAXIMUM_SIZE: &str = "EXCEEDS_MAXIMUM_SIZE";

/// What the cache holds for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedHello {
    /// Base64 (standard alphabet, padded) of the full record.
    Encoded(String),
    /// The record was too large to capture.
    ExceedsMaximumSize,
}

impl CachedHello {
    pub fn from_record(record: &Record) -> Self {
        Self::Encoded(record.to_base64())
    }

    /// The value surfaced to consumers: the encoding or the sentinel.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Encoded(encoded) => encoded,
            Self::ExceedsMaximumSize => EXCEEDS_MAXIMUM_SIZE,
        }
    }
}

impl fmt::Display for CachedHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounding and expiry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Maximum number of entries; `None` grows without bound.
    pub max_entries: Option<usize>,
    /// Entry lifetime; `None` keeps entries until removed.
    pub ttl: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_entries: Some(1000),
            ttl: Some(Duration::from_secs(3600)),
        }
    }
}

impl CachePolicy {
    /// No bound and no expiry; close-triggered removal is the only cleanup.
    pub fn unbounded() -> Self {
        Self {
            max_entries: None,
            ttl: None,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedHello,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe, cheaply cloneable handle to one cache instance.
///
/// Clones share the same map; separate `new` calls give isolated caches.
#[derive(Debug, Clone)]
pub struct HelloCache {
    inner: Arc<DashMap<ConnectionKey, CacheEntry>>,
    // Serializes the len-check/evict/insert sequence so the bound holds.
    insert_lock: Arc<Mutex<()>>,
    policy: CachePolicy,
}

impl Default for HelloCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl HelloCache {
    /// Create an empty cache with the given policy.
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            insert_lock: Arc::new(Mutex::new(())),
            policy,
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Insert or overwrite the entry for `key`.
    pub fn put(&self, key: ConnectionKey, value: CachedHello) {
        let expires_at = self.policy.ttl.map(|ttl| Instant::now() + ttl);
        let entry = CacheEntry { value, expires_at };

        let _guard = self
            .insert_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(max) = self.policy.max_entries {
            if !self.inner.contains_key(&key) {
                while self.inner.len() >= max {
                    if !self.evict_one() {
                        break;
                    }
                }
            }
        }

        self.inner.insert(key, entry);
        metrics::record_cache_size(self.inner.len());
    }

    /// Look up the entry for `key`, dropping it if it has expired.
    pub fn get(&self, key: &ConnectionKey) -> Option<CachedHello> {
        let now = Instant::now();
        {
            let entry = self.inner.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }

        // The shard read guard must be gone before removing.
        if self
            .inner
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            tracing::trace!(key = %key, "Expired ClientHello dropped");
            metrics::record_cache_size(self.inner.len());
        }
        None
    }

    /// Delete the entry for `key`. Absent keys are ignored.
    pub fn remove(&self, key: &ConnectionKey) {
        if self.inner.remove(key).is_some() {
            metrics::record_cache_size(self.inner.len());
        }
    }

    /// Number of entries, including expired ones not yet observed.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn evict_one(&self) -> bool {
        let victim = self.inner.iter().next().map(|entry| entry.key().clone());
        match victim {
            Some(key) => {
                self.inner.remove(&key);
                metrics::record_cache_eviction();
                tracing::debug!(key = %key, "Cache full, evicted ClientHello");
                true
            }
            None => false,
        }
    }
}
