//! In-process `KvStore` backend.
//!
//! A single byte-budgeted tier keyed by string, generalized from the
//! reference gateway's `TieredBlobCache` (`cache/tiered.rs`): a
//! `DashMap` plus an `AtomicU64` byte counter, oldest-first eviction
//! when the budget is exceeded, and a background sweep for TTL'd
//! entries. The original's blob/chunk split collapses into one store
//! here because both `CACHE_KV` and `VERSION_KV` fit the same
//! get/put/list/ttl shape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{KvEntry, KvStore};
use crate::error::ProxyError;

struct StoredEntry {
    value: Bytes,
    metadata: Option<serde_json::Value>,
    cached_at: Instant,
    expires_at: Option<Instant>,
}

pub struct MemoryKvStore {
    entries: DashMap<String, StoredEntry>,
    total_bytes: AtomicU64,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryKvStore {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_until_fits(&self, incoming: u64) {
        let current = self.total_bytes.load(Ordering::Relaxed);
        if current + incoming <= self.max_bytes {
            return;
        }
        let to_free = (current + incoming).saturating_sub(self.max_bytes);

        let mut candidates: Vec<(String, Instant, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.cached_at, e.value.len() as u64))
            .collect();
        candidates.sort_by_key(|(_, cached_at, _)| *cached_at);

        let mut freed = 0u64;
        for (key, _, size) in candidates {
            if freed >= to_free {
                break;
            }
            if self.entries.remove(&key).is_some() {
                freed += size;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        debug!(freed, to_free, "memory kv store evicted entries to fit budget");
    }

    /// Removes every entry whose TTL has elapsed. Returns the count removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| e.expires_at.is_some_and(|exp| now >= exp))
            .map(|e| (e.key().clone(), e.value.len() as u64))
            .collect();

        let mut freed = 0u64;
        for (key, size) in &expired {
            if self.entries.remove(key).is_some() {
                freed += size;
            }
        }
        self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        expired.len()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(2 * 1024 * 1024 * 1024)
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<Bytes>, ProxyError>> {
        let result = self.get_sync(key).map(|e| e.value);
        async move { Ok(result) }.boxed()
    }

    fn get_with_metadata(&self, key: &str) -> BoxFuture<'static, Result<Option<KvEntry>, ProxyError>> {
        let result = self.get_sync(key);
        async move { Ok(result) }.boxed()
    }

    fn put_with_metadata_and_ttl(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, Result<(), ProxyError>> {
        let size = value.len() as u64;
        if size > self.max_bytes {
            return async move {
                Err(ProxyError::Internal {
                    reason: format!("value of {size} bytes exceeds store budget"),
                })
            }
            .boxed();
        }
        self.evict_until_fits(size);

        if let Some((_, old)) = self.entries.remove(key) {
            self.total_bytes.fetch_sub(old.value.len() as u64, Ordering::Relaxed);
        }

        let now = Instant::now();
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                metadata,
                cached_at: now,
                expires_at: ttl.map(|d| now + d),
            },
        );
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        async move { Ok(()) }.boxed()
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<(), ProxyError>> {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.total_bytes.fetch_sub(entry.value.len() as u64, Ordering::Relaxed);
        }
        async move { Ok(()) }.boxed()
    }

    fn list_with_prefix(
        &self,
        prefix: &str,
    ) -> BoxFuture<'static, Result<Vec<(String, Option<serde_json::Value>)>, ProxyError>> {
        let now = Instant::now();
        let matches: Vec<(String, Option<serde_json::Value>)> = self
            .entries
            .iter()
            .filter(|e| e.key().contains(prefix) && !e.expires_at.is_some_and(|exp| now >= exp))
            .map(|e| (e.key().clone(), e.metadata.clone()))
            .collect();
        async move { Ok(matches) }.boxed()
    }
}

impl MemoryKvStore {
    fn get_sync(&self, key: &str) -> Option<KvEntry> {
        let live = self.entries.get(key).and_then(|entry| {
            if entry.expires_at.is_none_or(|exp| Instant::now() < exp) {
                Some(KvEntry {
                    value: entry.value.clone(),
                    metadata: entry.metadata.clone(),
                })
            } else {
                None
            }
        });

        match live {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                if let Some((_, stale)) = self.entries.remove(key) {
                    self.total_bytes.fetch_sub(stale.value.len() as u64, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

/// Spawns a background sweep of expired entries, mirroring the reference
/// gateway's `spawn_tiered_cleanup_task`.
pub fn spawn_memory_kv_cleanup_task(store: Arc<MemoryKvStore>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let expired = store.cleanup_expired();
            if expired > 0 {
                debug!(expired, total_bytes = store.total_bytes(), "memory kv store cleanup");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_value() {
        let store = MemoryKvStore::new(1024 * 1024);
        store.put("k", Bytes::from_static(b"hello")).await.unwrap();
        let got = store.get("k").await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn evicts_oldest_when_over_budget() {
        let store = MemoryKvStore::new(10);
        store.put("a", Bytes::from_static(b"0123456789")).await.unwrap();
        store.put("b", Bytes::from_static(b"0123456789")).await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let store = MemoryKvStore::new(1024);
        store
            .put_with_metadata_and_ttl("k", Bytes::from_static(b"v"), None, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_with_prefix_matches_substring() {
        let store = MemoryKvStore::new(1024);
        store.put("video:a/b.mp4:derivative=mobile", Bytes::from_static(b"v")).await.unwrap();
        store.put("video:c/d.mp4:derivative=mobile", Bytes::from_static(b"v")).await.unwrap();
        let matches = store.list_with_prefix(":a/b.mp4:").await.unwrap();
        assert_eq!(matches.len(), 1);
    }
}
