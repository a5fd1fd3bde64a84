//! `CacheEngine`: wires `KvStore`, `VersionStore`, and the chunk lock
//! manager into the store/get/list surface the pipeline calls,
//! dispatching between single-entry and chunked storage the way the
//! reference gateway's `TieredBlobCache` dispatches between its hot and
//! cold tiers (`cache/tiered.rs`), generalized here to a byte-size
//! threshold instead of an access-frequency one.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http_body_util::{BodyExt, Full};

use crate::cachekey::{chunk_key, VersionStore};
use crate::chunklock::ChunkLockManager;
use crate::error::ProxyError;
use crate::kv::metadata::{within_tolerance, ChunkManifest, TransformationMetadata, METADATA_ERROR_BYTES};
use crate::kv::KvStore;
use crate::options::TransformOptions;
use crate::range::{parse_range, unsatisfiable_content_range, ByteRange};
use crate::streaming::{full_chunked_stream, per_chunk_write_timeout, ranged_chunked_stream, ResponseBody, StreamingChunkProcessor};

pub struct CacheEngineConfig {
    pub single_entry_max_bytes: u64,
    pub safety_ceiling_bytes: u64,
    pub standard_chunk_size_bytes: u64,
    pub upload_concurrency: usize,
    pub default_max_age_secs: u64,
    pub store_indefinitely: bool,
    pub enable_cache_tags: bool,
    pub strict_range_416: bool,
}

pub struct CacheEngine {
    kv: Arc<dyn KvStore>,
    version: Arc<VersionStore>,
    chunk_locks: Arc<ChunkLockManager>,
    config: CacheEngineConfig,
}

/// What a successful `get` resolves to once the caller's `Range` header
/// (if any) and this entry's chunking have been reconciled.
pub enum CacheGetResult {
    Full { body: ResponseBody, content_length: u64 },
    Partial { body: ResponseBody, range: ByteRange },
    /// The requested range could not be satisfied; serving the full
    /// body with `X-Range-Recovery` is this system's default policy
    /// (see design notes, open question 1). Set only when
    /// `strict_range_416` is off.
    RangeRecovery { body: ResponseBody, content_length: u64 },
    /// `strict_range_416` is on and the range was unsatisfiable -- the
    /// caller should answer 416 with this `Content-Range` value.
    Unsatisfiable { content_range: String },
}

pub struct ListEntry {
    pub key: String,
    pub metadata: TransformationMetadata,
    pub current_version: u64,
}

impl CacheEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        version: Arc<VersionStore>,
        chunk_locks: Arc<ChunkLockManager>,
        config: CacheEngineConfig,
    ) -> Self {
        Self { kv, version, chunk_locks, config }
    }

    /// Stores a fully-buffered transform result (no partial/206
    /// upstream response is ever cached). Dispatches to the single- or
    /// chunked-entry path based on `declared_size` -- an unknown size
    /// is treated conservatively as chunked so the store path never
    /// buffers an unbounded body in memory.
    pub async fn store<S>(
        &self,
        key: &str,
        source_path: &str,
        content_type: String,
        body: S,
        declared_size: Option<u64>,
        was_partial_upstream_response: bool,
        options: &TransformOptions,
        ttl_override_secs: Option<u64>,
    ) -> Result<bool, ProxyError>
    where
        S: Stream<Item = Result<Bytes, ProxyError>> + Unpin + Send + 'static,
    {
        if was_partial_upstream_response {
            tracing::warn!(key, "refusing to cache a partial (206/Content-Range) upstream response");
            return Ok(false);
        }
        if let Some(size) = declared_size {
            if size > self.config.safety_ceiling_bytes {
                return Err(ProxyError::OversizedAsset { size_bytes: size, ceiling_bytes: self.config.safety_ceiling_bytes });
            }
        }
        if key.len() > crate::kv::metadata::KEY_ERROR_BYTES {
            return Err(ProxyError::Internal { reason: format!("cache key of {} bytes exceeds the {}-byte guard", key.len(), crate::kv::metadata::KEY_ERROR_BYTES) });
        } else if key.len() > crate::kv::metadata::KEY_WARN_BYTES {
            tracing::warn!(key, len = key.len(), "cache key is unusually long");
        }

        let use_chunking = declared_size.map(|s| s > self.config.single_entry_max_bytes).unwrap_or(true);
        if use_chunking {
            self.store_chunked(key, source_path, content_type, body, options, ttl_override_secs).await
        } else {
            self.store_single(key, source_path, content_type, body, options, ttl_override_secs).await
        }
    }

    async fn store_single<S>(
        &self,
        key: &str,
        source_path: &str,
        content_type: String,
        mut body: S,
        options: &TransformOptions,
        ttl_override_secs: Option<u64>,
    ) -> Result<bool, ProxyError>
    where
        S: Stream<Item = Result<Bytes, ProxyError>> + Unpin,
    {
        let mut buf = BytesMut::new();
        while let Some(next) = body.next().await {
            let chunk = next?;
            if buf.len() as u64 + chunk.len() as u64 > self.config.safety_ceiling_bytes {
                return Err(ProxyError::OversizedAsset {
                    size_bytes: buf.len() as u64 + chunk.len() as u64,
                    ceiling_bytes: self.config.safety_ceiling_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        let payload = buf.freeze();
        let total_size = payload.len() as u64;

        let metadata = self.build_metadata(source_path, &content_type, total_size, false, total_size, options, ttl_override_secs);
        let metadata_json = self.serialize_metadata(key, &metadata)?;

        self.kv
            .put_with_metadata_and_ttl(key, payload, Some(metadata_json), self.ttl(ttl_override_secs))
            .await?;
        Ok(true)
    }

    async fn store_chunked<S>(
        &self,
        key: &str,
        source_path: &str,
        content_type: String,
        body: S,
        options: &TransformOptions,
        ttl_override_secs: Option<u64>,
    ) -> Result<bool, ProxyError>
    where
        S: Stream<Item = Result<Bytes, ProxyError>> + Unpin + Send + 'static,
    {
        let processor = StreamingChunkProcessor::new(self.config.standard_chunk_size_bytes as usize);
        let base_key = key.to_string();
        let kv = Arc::clone(&self.kv);
        let chunk_locks = Arc::clone(&self.chunk_locks);
        let safety_ceiling = self.config.safety_ceiling_bytes;
        let written = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let outcome = processor
            .process(body, self.config.upload_concurrency, {
                let base_key = base_key.clone();
                let written = Arc::clone(&written);
                move |chunk, index| {
                    let kv = Arc::clone(&kv);
                    let chunk_locks = Arc::clone(&chunk_locks);
                    let base_key = base_key.clone();
                    let written = Arc::clone(&written);
                    async move {
                        let chunk_k = chunk_key(&base_key, index);
                        let _guard = chunk_locks.acquire(&chunk_k).await;
                        let size = chunk.len() as u64;
                        let total_so_far = written.fetch_add(size, std::sync::atomic::Ordering::SeqCst) + size;
                        if total_so_far > safety_ceiling {
                            return Err(ProxyError::OversizedAsset { size_bytes: total_so_far, ceiling_bytes: safety_ceiling });
                        }
                        tokio::time::timeout(per_chunk_write_timeout(size), kv.put(&chunk_k, chunk))
                            .await
                            .map_err(|_| ProxyError::Timeout {
                                budget_ms: per_chunk_write_timeout(size).as_millis() as u64,
                                elapsed_ms: per_chunk_write_timeout(size).as_millis() as u64,
                            })?
                    }
                }
            })
            .await?;

        let manifest = ChunkManifest {
            total_size: outcome.total_size,
            chunk_count: outcome.chunk_count,
            actual_chunk_sizes: outcome.actual_chunk_sizes,
            standard_chunk_size: self.config.standard_chunk_size_bytes,
            original_content_type: content_type.clone(),
        };
        manifest.validate().map_err(|reason| ProxyError::IntegrityViolation { key: key.to_string(), reason })?;

        let metadata = self.build_metadata(source_path, &content_type, manifest.total_size, true, manifest.total_size, options, ttl_override_secs);
        let metadata_json = self.serialize_metadata(key, &metadata)?;
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).map_err(|e| ProxyError::Internal { reason: e.to_string() })?);

        self.kv
            .put_with_metadata_and_ttl(key, manifest_bytes, Some(metadata_json), self.ttl(ttl_override_secs))
            .await?;
        Ok(true)
    }

    /// Looks up `key`, reconciling a raw `Range` header (if present)
    /// with the stored entry. Returns `Ok(None)` on a miss -- callers
    /// are responsible for invoking the transform pipeline and storing
    /// the result; this also fires a best-effort, non-blocking version
    /// bump so the next upstream fetch defeats any CDN cache of the
    /// prior (now-evicted) version.
    pub async fn get(&self, key: &str, range_header: Option<&str>) -> Result<Option<(CacheGetResult, TransformationMetadata)>, ProxyError> {
        let Some(entry) = self.kv.get_with_metadata(key).await? else {
            self.bump_version_in_background(key);
            return Ok(None);
        };

        let metadata: TransformationMetadata = match entry.metadata.as_ref().map(|m| serde_json::from_value(m.clone())) {
            Some(Ok(metadata)) => metadata,
            _ => {
                tracing::error!(key, "cache hit missing or carrying unparseable metadata, treating as miss");
                self.kv.delete(key).await?;
                self.bump_version_in_background(key);
                return Ok(None);
            }
        };

        if metadata.is_chunked {
            self.get_chunked(key, entry.value, &metadata, range_header).await
        } else {
            self.get_single(key, entry.value, &metadata, range_header).await
        }
    }

    async fn get_single(
        &self,
        key: &str,
        value: Bytes,
        metadata: &TransformationMetadata,
        range_header: Option<&str>,
    ) -> Result<Option<(CacheGetResult, TransformationMetadata)>, ProxyError> {
        if !within_tolerance(value.len() as u64, metadata.actual_total_video_size) {
            tracing::error!(
                key,
                actual = value.len(),
                expected = metadata.actual_total_video_size,
                "stored entry size does not match its own metadata, treating as miss"
            );
            self.kv.delete(key).await?;
            self.bump_version_in_background(key);
            return Ok(None);
        }
        let total = value.len() as u64;

        let Some(header) = range_header else {
            return Ok(Some((CacheGetResult::Full { body: bytes_body(value), content_length: total }, metadata.clone())));
        };

        match parse_range(header, total) {
            Some(range) => {
                let slice = value.slice(range.start as usize..=range.end as usize);
                Ok(Some((CacheGetResult::Partial { body: bytes_body(slice), range }, metadata.clone())))
            }
            None => self.unsatisfiable_result(total, value, metadata),
        }
    }

    async fn get_chunked(
        &self,
        key: &str,
        manifest_bytes: Bytes,
        metadata: &TransformationMetadata,
        range_header: Option<&str>,
    ) -> Result<Option<(CacheGetResult, TransformationMetadata)>, ProxyError> {
        let manifest: ChunkManifest = match serde_json::from_slice(&manifest_bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(key, error = %e, "chunk manifest failed to parse, treating as miss");
                self.kv.delete(key).await?;
                self.bump_version_in_background(key);
                return Ok(None);
            }
        };
        if let Err(reason) = manifest.validate() {
            tracing::error!(key, reason, "chunk manifest failed validation, treating as miss");
            self.kv.delete(key).await?;
            self.bump_version_in_background(key);
            return Ok(None);
        }

        let Some(header) = range_header else {
            let body = full_chunked_stream(Arc::clone(&self.kv), key.to_string(), manifest.actual_chunk_sizes.clone());
            return Ok(Some((CacheGetResult::Full { body, content_length: manifest.total_size }, metadata.clone())));
        };

        match parse_range(header, manifest.total_size) {
            Some(range) => {
                let body = ranged_chunked_stream(Arc::clone(&self.kv), key.to_string(), manifest.actual_chunk_sizes.clone(), range);
                Ok(Some((CacheGetResult::Partial { body, range }, metadata.clone())))
            }
            None if self.config.strict_range_416 => {
                Ok(Some((CacheGetResult::Unsatisfiable { content_range: unsatisfiable_content_range(manifest.total_size) }, metadata.clone())))
            }
            None => {
                let body = full_chunked_stream(Arc::clone(&self.kv), key.to_string(), manifest.actual_chunk_sizes.clone());
                Ok(Some((CacheGetResult::RangeRecovery { body, content_length: manifest.total_size }, metadata.clone())))
            }
        }
    }

    fn unsatisfiable_result(
        &self,
        total: u64,
        value: Bytes,
        metadata: &TransformationMetadata,
    ) -> Result<Option<(CacheGetResult, TransformationMetadata)>, ProxyError> {
        if self.config.strict_range_416 {
            Ok(Some((CacheGetResult::Unsatisfiable { content_range: unsatisfiable_content_range(total) }, metadata.clone())))
        } else {
            Ok(Some((CacheGetResult::RangeRecovery { body: bytes_body(value), content_length: total }, metadata.clone())))
        }
    }

    /// Substring scan over every stored key mentioning `source_path`,
    /// augmented with each key's live version counter (which may have
    /// advanced past `metadata.cache_version` if the entry was since
    /// evicted and re-missed).
    pub async fn list(&self, source_path: &str) -> Result<Vec<ListEntry>, ProxyError> {
        let needle = format!(":{}:", source_path.trim_start_matches('/'));
        let matches = self.kv.list_with_prefix(&needle).await?;
        let mut entries = Vec::with_capacity(matches.len());
        for (key, metadata_json) in matches {
            let Some(metadata_json) = metadata_json else { continue };
            let Ok(metadata) = serde_json::from_value::<TransformationMetadata>(metadata_json) else { continue };
            let current_version = self.version.current(&key).await;
            entries.push(ListEntry { key, metadata, current_version });
        }
        Ok(entries)
    }

    fn bump_version_in_background(&self, key: &str) {
        let version = Arc::clone(&self.version);
        let key = key.to_string();
        tokio::spawn(async move {
            version.bump(&key).await;
        });
    }

    /// KV-side expiration. `None` in indefinite mode -- no `expirationTtl`
    /// is ever passed to the store in that mode, regardless of
    /// `ttl_override_secs`. A per-call override (from an origin's
    /// `ttl_ok` default) takes precedence over `default_max_age_secs`.
    fn ttl(&self, ttl_override_secs: Option<u64>) -> Option<Duration> {
        if self.config.store_indefinitely {
            None
        } else {
            let secs = ttl_override_secs.unwrap_or(self.config.default_max_age_secs);
            Some(Duration::from_secs(secs))
        }
    }

    fn build_metadata(
        &self,
        source_path: &str,
        content_type: &str,
        content_length: u64,
        is_chunked: bool,
        actual_total_video_size: u64,
        options: &TransformOptions,
        ttl_override_secs: Option<u64>,
    ) -> TransformationMetadata {
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        let cache_tags = if self.config.enable_cache_tags {
            let mut tags = vec![format!("source:{}", source_path.trim_start_matches('/'))];
            if let Some(derivative) = &options.derivative {
                tags.push(format!("derivative:{derivative}"));
            }
            tags
        } else {
            Vec::new()
        };
        let max_age_secs = ttl_override_secs.unwrap_or(self.config.default_max_age_secs);
        TransformationMetadata {
            content_type: content_type.to_string(),
            content_length,
            created_at: now_ms,
            // Always recorded, even in indefinite-store mode -- only the
            // KV write's own `expirationTtl` is conditionally absent.
            expires_at: Some(now_ms + max_age_secs * 1000),
            cache_tags,
            cache_version: options.version,
            is_chunked,
            actual_total_video_size,
            store_indefinitely: self.config.store_indefinitely,
            mode: options.mode,
            quality: options.quality,
            compression: options.compression,
            derivative: options.derivative.clone(),
            custom_data: options.custom_data.clone(),
        }
    }

    fn serialize_metadata(&self, key: &str, metadata: &TransformationMetadata) -> Result<serde_json::Value, ProxyError> {
        let value = serde_json::to_value(metadata).map_err(|e| ProxyError::Internal { reason: e.to_string() })?;
        let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        if size > METADATA_ERROR_BYTES {
            return Err(ProxyError::Internal { reason: format!("metadata of {size} bytes for key {key} exceeds the {METADATA_ERROR_BYTES}-byte guard") });
        } else if size > crate::kv::metadata::METADATA_WARN_BYTES {
            tracing::warn!(key, size, "transformation metadata is unusually large");
        }
        Ok(value)
    }
}

fn bytes_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}
