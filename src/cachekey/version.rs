//! Per-key version counter (the `VERSION_KV` namespace).
//!
//! Stored as a decimal integer string keyed by the CacheKey itself.
//! Reads default to 1 when absent; misses bump the counter so the next
//! upstream transform request carries a fresh `version` query param to
//! defeat upstream CDN caching. Increments race under concurrency --
//! accepted as best-effort per the design notes, not serialized across
//! processes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::ProxyError;
use crate::kv::KvStore;

const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_FACTOR: u32 = 2;
const RETRY_CAP: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;

pub struct VersionStore {
    kv: Arc<dyn KvStore>,
}

impl VersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Reads the current version for `key`, defaulting to 1 if absent.
    /// Does not modify the stored value -- a cache hit must never bump
    /// the version.
    pub async fn current(&self, key: &str) -> u64 {
        match self.kv.get(key).await {
            Ok(Some(bytes)) => parse_version(&bytes).unwrap_or(1),
            _ => 1,
        }
    }

    /// Atomically (best-effort) computes `next = current + 1` and
    /// persists it, retrying on transient KV errors with exponential
    /// backoff. Fire-and-forget callers should `tokio::spawn` this
    /// rather than awaiting it on the request's critical path.
    pub async fn bump(&self, key: &str) -> u64 {
        let current = self.current(key).await;
        let next = current + 1;

        let mut delay = RETRY_BASE;
        for attempt in 0..MAX_ATTEMPTS {
            match self.kv.put(key, Bytes::from(next.to_string())).await {
                Ok(()) => return next,
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    tracing::warn!(key, attempt, "version write hit a transient condition, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * RETRY_FACTOR).min(RETRY_CAP);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "version write failed, keeping stale version");
                    break;
                }
            }
        }
        next
    }
}

fn parse_version(bytes: &Bytes) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}
