//! Chunk Lock Manager (component F).
//!
//! A process-local bounded-LRU map enforcing mutual exclusion per
//! `ChunkKey`, generalized from the custodial-key cache's bounded
//! TTL'd `DashMap` (`custodial_keys/cache.rs`'s `SigningKeyCache`)
//! but adapted from key-value caching to lock-acquire/release
//! semantics: instead of caching a value with a TTL, each entry here
//! *is* a lock, released either by its holder or by the sweeper/
//! capacity-eviction path, at which point every waiter is woken to
//! race for the now-vacant slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tracing::debug;

struct LockEntry {
    acquired_at: Instant,
    notify: Arc<Notify>,
}

pub struct ChunkLockManager {
    locks: DashMap<String, LockEntry>,
    capacity: usize,
    ttl: Duration,
    evictions: AtomicU64,
}

/// RAII handle returned by `acquire`. Releasing happens on drop; callers
/// needing an explicit release point can call `release()` early.
pub struct LockGuard {
    manager: Arc<ChunkLockManager>,
    key: String,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) {
        self.manager.release(&self.key);
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release(&self.key);
        }
    }
}

impl ChunkLockManager {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            capacity,
            ttl,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Awaits any live lock on `key`, then installs a new one and
    /// returns a guard. At most one guard is ever outstanding per key.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> LockGuard {
        loop {
            if let Some(notify) = self.locks.get(key).map(|e| e.notify.clone()) {
                // Bounded wait: `notify_waiters` only wakes tasks already
                // registered, so a release landing between the check above
                // and this await would otherwise hang the waiter until the
                // next unrelated notification. The sweeper also guarantees
                // forward progress within one TTL window regardless.
                let _ = tokio::time::timeout(Duration::from_millis(50), notify.notified()).await;
                continue;
            }

            self.make_room(key);
            match self.locks.entry(key.to_string()) {
                Entry::Vacant(v) => {
                    v.insert(LockEntry { acquired_at: Instant::now(), notify: Arc::new(Notify::new()) });
                    return LockGuard { manager: Arc::clone(self), key: key.to_string(), released: false };
                }
                Entry::Occupied(entry) => {
                    let notify = entry.get().notify.clone();
                    drop(entry);
                    notify.notified().await;
                }
            }
        }
    }

    fn make_room(&self, incoming_key: &str) {
        if self.locks.len() < self.capacity || self.locks.contains_key(incoming_key) {
            return;
        }
        if let Some(oldest_key) = self
            .locks
            .iter()
            .min_by_key(|e| e.acquired_at)
            .map(|e| e.key().clone())
        {
            self.force_release(&oldest_key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = oldest_key, "chunk lock evicted to make room");
        }
    }

    fn release(&self, key: &str) {
        if let Some((_, entry)) = self.locks.remove(key) {
            entry.notify.notify_waiters();
        }
    }

    fn force_release(&self, key: &str) {
        self.release(key);
    }

    /// Removes and releases every lock older than the configured TTL.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .locks
            .iter()
            .filter(|e| now.duration_since(e.acquired_at) >= self.ttl)
            .map(|e| e.key().clone())
            .collect();
        for key in &stale {
            self.force_release(key);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept stale chunk locks");
        }
        stale.len()
    }
}

/// Runs `ChunkLockManager::sweep` on a fixed interval until the process
/// exits.
pub fn spawn_chunklock_sweeper(manager: Arc<ChunkLockManager>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            manager.sweep();
        }
    });
}
