//! KV Cache Engine (component D) -- backend abstraction.
//!
//! `KvStore` is the two-namespace KV binding the pipeline is written
//! against (`CACHE_KV` and `VERSION_KV` in the data model, §6). The
//! trait is object-safe so the pipeline holds `Arc<dyn KvStore>` and a
//! real deployment can swap in an object-store-backed implementation
//! without touching pipeline code. `MemoryKvStore` is the in-process
//! default, generalized from the reference gateway's two-tier
//! `TieredBlobCache` (`cache/tiered.rs`) into a single byte-budgeted
//! store keyed by string.

mod engine;
mod memory;
pub mod metadata;

pub use engine::{CacheEngine, CacheEngineConfig, CacheGetResult, ListEntry};
pub use memory::{spawn_memory_kv_cleanup_task, MemoryKvStore};
pub use metadata::{ChunkManifest, TransformationMetadata};

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::ProxyError;

/// A stored value plus its opaque metadata, mirroring a KV binding's
/// per-key metadata slot.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Bytes,
    pub metadata: Option<serde_json::Value>,
}

/// Two-namespace KV binding. Every method is async but the trait stays
/// object-safe (no `async fn` in trait) by boxing the returned future,
/// the same pattern the `object_store`/`tower` ecosystem uses to avoid
/// an `async_trait` dependency.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<Bytes>, ProxyError>>;

    fn get_with_metadata(&self, key: &str) -> BoxFuture<'static, Result<Option<KvEntry>, ProxyError>>;

    fn put(&self, key: &str, value: Bytes) -> BoxFuture<'static, Result<(), ProxyError>> {
        self.put_with_metadata_and_ttl(key, value, None, None)
    }

    fn put_with_metadata_and_ttl(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, Result<(), ProxyError>>;

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<(), ProxyError>>;

    /// Returns `(key, metadata)` pairs for every stored key containing
    /// `prefix` as a substring (the data model's `list(sourcePath)`
    /// scan is a substring match on `:{normalized_path}:`, not a strict
    /// prefix -- callers pass whatever substring they need).
    fn list_with_prefix(
        &self,
        prefix: &str,
    ) -> BoxFuture<'static, Result<Vec<(String, Option<serde_json::Value>)>, ProxyError>>;
}
