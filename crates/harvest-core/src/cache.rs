//! Bounded TTL + LRU cache for upstream responses.
//!
//! Collapses duplicate upstream requests for the same fingerprint within a
//! short window so they do not consume rate budget. Reads take a shared
//! lock and record recency through a per-entry atomic stamp; writes are
//! serialised behind the exclusive lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::SharedClock;
use crate::error::AppError;

/// Configuration for [`BoundedDataCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries. Zero disables the cache.
    pub capacity: usize,
    /// Default time-to-live applied by [`BoundedDataCache::put`].
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            ttl: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Read configuration from environment variables.
    ///
    /// - `HARVEST_CACHE_CAPACITY` (optional, defaults to 512)
    /// - `HARVEST_CACHE_TTL_SECS` (optional, defaults to 60)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            capacity: crate::config::env_parse("HARVEST_CACHE_CAPACITY", defaults.capacity)?,
            ttl: Duration::from_secs(crate::config::env_parse(
                "HARVEST_CACHE_TTL_SECS",
                defaults.ttl.as_secs(),
            )?),
        })
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    ttl: TimeDelta,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.inserted_at < self.ttl
    }
}

#[derive(Debug)]
struct CacheInner<V> {
    map: HashMap<String, CacheEntry<V>>,
}

/// Thread-safe TTL + LRU cache keyed by request fingerprint.
#[derive(Clone)]
pub struct BoundedDataCache<V> {
    config: CacheConfig,
    clock: SharedClock,
    inner: Arc<RwLock<CacheInner<V>>>,
    access_seq: Arc<AtomicU64>,
}

impl<V: Clone + Send + Sync> BoundedDataCache<V> {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Arc::new(RwLock::new(CacheInner {
                map: HashMap::new(),
            })),
            access_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, CacheInner<V>> {
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache lock");
            poisoned.into_inner()
        })
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, CacheInner<V>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache lock");
            poisoned.into_inner()
        })
    }

    fn next_stamp(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the cached value if its age is below its TTL, else a miss.
    ///
    /// A hit marks the entry as most recently used. An expired entry is
    /// removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        {
            let inner = self.read_inner();
            match inner.map.get(key) {
                None => return None,
                Some(entry) if entry.is_fresh(now) => {
                    entry.last_access.store(self.next_stamp(), Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
            }
        }

        let mut inner = self.write_inner();
        if inner.map.get(key).is_some_and(|e| !e.is_fresh(now)) {
            inner.map.remove(key);
            tracing::trace!(key = %key, "Evicted expired cache entry");
        }
        None
    }

    /// Presence check for a fresh entry that does not touch recency.
    pub fn contains_fresh(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.read_inner()
            .map
            .get(key)
            .is_some_and(|entry| entry.is_fresh(now))
    }

    /// Insert or overwrite with the default TTL.
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.put_with_ttl(key, value, self.config.ttl);
    }

    /// Insert or overwrite with an explicit TTL, evicting the least recently
    /// used entries while over capacity.
    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if self.config.capacity == 0 {
            return;
        }

        let now = self.clock.now();
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let entry = CacheEntry {
            value,
            inserted_at: now,
            ttl,
            last_access: AtomicU64::new(self.next_stamp()),
        };

        let mut inner = self.write_inner();
        inner.map.insert(key.into(), entry);

        if inner.map.len() > self.config.capacity {
            inner.map.retain(|_, e| e.is_fresh(now));
        }

        while inner.map.len() > self.config.capacity {
            let victim = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    inner.map.remove(&k);
                    tracing::trace!(key = %k, "Evicted least recently used cache entry");
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.write_inner().map.remove(key).map(|e| e.value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.write_inner();
        let before = inner.map.len();
        inner.map.retain(|_, e| e.is_fresh(now));
        before - inner.map.len()
    }

    pub fn clear(&self) {
        self.write_inner().map.clear();
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.read_inner().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
