//! Streaming Chunk I/O (component E).
//!
//! Write side: `StreamingChunkProcessor` folds an inbound byte stream
//! into fixed-size chunks and hands each one to a caller-supplied sink
//! under a bounded concurrency budget, mirroring how the reference
//! gateway's `TieredBlobCache` callers stream a DHT entry into fixed
//! blocks rather than materializing the whole payload in memory first.
//!
//! Read side: `full_chunked_stream` / `ranged_chunked_stream` rebuild a
//! hyper response body from stored chunks, each fetch individually
//! timed out and sub-segmented to bound per-write latency, grounded in
//! the same module's range-aware blob streaming (`routes/blob.rs`).

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, StreamBody};
use hyper::body::Frame;

use crate::error::ProxyError;
use crate::kv::metadata::within_tolerance;
use crate::kv::KvStore;
use crate::range::ByteRange;

/// A per-connection response body. `UnsyncBoxBody` rather than the
/// `Sync`-bounded `BoxBody`: the chunked streams below are built with
/// `async-stream`, whose generated generator state is `Send` but not
/// `Sync`, and a hyper response body is only ever driven by the single
/// task that owns the connection.
pub type ResponseBody = UnsyncBoxBody<Bytes, ProxyError>;

/// 1 MiB sub-segments when streaming a stored chunk back out, bounding
/// how much of a single chunk can be buffered ahead of the client at
/// once.
const READ_SEGMENT_BYTES: usize = 1024 * 1024;

/// Per-chunk fetch timeout: `min(5000 + ceil(sizeMB) * 1000, 30000)` ms.
pub fn per_chunk_timeout(size_bytes: u64) -> Duration {
    let size_mb = (size_bytes as f64 / (1024.0 * 1024.0)).ceil();
    let ms = (5000.0 + size_mb * 1000.0).min(30000.0);
    Duration::from_millis(ms as u64)
}

/// Per-write timeout budget for a single upload chunk, used by callers
/// wrapping their KV `put` in `tokio::time::timeout`. Same shape as
/// [`per_chunk_timeout`] -- write and read share one latency floor.
pub fn per_chunk_write_timeout(size_bytes: u64) -> Duration {
    per_chunk_timeout(size_bytes)
}

/// Per-sub-segment write timeout on the read side: `max(2000, size/128)`
/// ms for a range request (~128 KiB/s floor), `max(3000, size/64)` ms for
/// a full-body request (~64 KiB/s floor) -- distinct from and tighter
/// than [`per_chunk_timeout`], which bounds the KV fetch rather than the
/// write to the client.
pub fn per_segment_write_timeout(segment_size_bytes: u64, is_range: bool) -> Duration {
    let ms = if is_range { (segment_size_bytes / 128).max(2000) } else { (segment_size_bytes / 64).max(3000) };
    Duration::from_millis(ms)
}

pub struct ChunkingOutcome {
    pub chunk_count: u64,
    pub actual_chunk_sizes: Vec<u64>,
    pub total_size: u64,
}

/// Folds `body_stream` into `target_chunk_size`-sized `Bytes` chunks,
/// invoking `on_chunk_ready(chunk, index)` for each one (including a
/// final, possibly undersized, chunk). At most `upload_concurrency`
/// invocations of `on_chunk_ready` run at once; all must succeed before
/// `process` returns `Ok`, since the caller needs every chunk committed
/// before it can write a manifest referencing them.
pub struct StreamingChunkProcessor {
    target_chunk_size: usize,
}

impl StreamingChunkProcessor {
    pub fn new(target_chunk_size: usize) -> Self {
        Self { target_chunk_size }
    }

    pub async fn process<S, F, Fut>(
        &self,
        mut body_stream: S,
        upload_concurrency: usize,
        on_chunk_ready: F,
    ) -> Result<ChunkingOutcome, ProxyError>
    where
        S: Stream<Item = Result<Bytes, ProxyError>> + Unpin,
        F: Fn(Bytes, u64) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ProxyError>> + Send + 'static,
    {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(upload_concurrency.max(1)));
        let mut buf = BytesMut::with_capacity(self.target_chunk_size);
        let mut index = 0u64;
        let mut actual_sizes = Vec::new();
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ProxyError>>> = FuturesUnordered::new();

        macro_rules! spawn_chunk {
            ($chunk:expr, $idx:expr) => {{
                let permit = Arc::clone(&semaphore);
                let cb = on_chunk_ready.clone();
                let chunk = $chunk;
                let idx = $idx;
                tasks.push(tokio::spawn(async move {
                    let _permit = permit
                        .acquire_owned()
                        .await
                        .map_err(|_| ProxyError::Internal { reason: "chunk upload semaphore closed".to_string() })?;
                    cb(chunk, idx).await
                }));
            }};
        }

        while let Some(next) = body_stream.next().await {
            let mut data = next?;
            while !data.is_empty() {
                let remaining = self.target_chunk_size - buf.len();
                let take = remaining.min(data.len());
                buf.extend_from_slice(&data[..take]);
                data = data.split_off(take);
                if buf.len() == self.target_chunk_size {
                    let chunk = buf.split().freeze();
                    actual_sizes.push(chunk.len() as u64);
                    spawn_chunk!(chunk, index);
                    index += 1;
                }
            }
        }
        if !buf.is_empty() {
            let chunk = buf.split().freeze();
            actual_sizes.push(chunk.len() as u64);
            spawn_chunk!(chunk, index);
            index += 1;
        }

        while let Some(joined) = tasks.next().await {
            joined.map_err(|e| ProxyError::Internal { reason: e.to_string() })??;
        }

        let total_size = actual_sizes.iter().sum();
        Ok(ChunkingOutcome { chunk_count: index, actual_chunk_sizes: actual_sizes, total_size })
    }
}

/// Streams every chunk of a chunked entry in order, starting at chunk 0.
pub fn full_chunked_stream(
    kv: Arc<dyn KvStore>,
    base_key: String,
    chunk_sizes: Vec<u64>,
) -> ResponseBody {
    chunked_stream(kv, base_key, chunk_sizes, None)
}

/// Streams only the chunks overlapping `range`, trimming the first and
/// last chunk to the requested byte bounds. Prefetches the next chunk
/// while the current one is still being emitted to keep the KV fetch
/// off the client's critical path.
pub fn ranged_chunked_stream(
    kv: Arc<dyn KvStore>,
    base_key: String,
    chunk_sizes: Vec<u64>,
    range: ByteRange,
) -> ResponseBody {
    chunked_stream(kv, base_key, chunk_sizes, Some(range))
}

/// Drives the chunk fetch/verify/emit loop as a background producer,
/// pushing frames through a bounded channel whose consumer is the hyper
/// body the client reads from. The channel's bounded capacity is this
/// model's backpressure sentinel (`send` awaits until the connection
/// task has drained a slot); a `send` that fails because the receiver
/// was dropped is this model's write-fails-mid-pipe sentinel for a
/// disconnected client, replacing an ad-hoc `desiredSize`/error-substring
/// check with a typed producer/consumer pair.
fn chunked_stream(
    kv: Arc<dyn KvStore>,
    base_key: String,
    chunk_sizes: Vec<u64>,
    range: Option<ByteRange>,
) -> ResponseBody {
    let standard_chunk_size = chunk_sizes.first().copied().unwrap_or(0);
    let (first_chunk, last_chunk) = match range {
        Some(r) if standard_chunk_size > 0 => (
            (r.start / standard_chunk_size) as usize,
            (r.end / standard_chunk_size) as usize,
        ),
        _ => (0, chunk_sizes.len().saturating_sub(1)),
    };
    let last_chunk = last_chunk.min(chunk_sizes.len().saturating_sub(1));
    let is_range = range.is_some();

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>, ProxyError>>(2);

    tokio::spawn(async move {
        let mut bytes_sent: u64 = 0;
        let mut prefetch: Option<tokio::task::JoinHandle<(String, u64, Result<Option<Bytes>, ProxyError>)>> = None;

        for i in first_chunk..=last_chunk {
            let expected = chunk_sizes[i];
            let key = crate::cachekey::chunk_key(&base_key, i as u64);

            let chunk_result = if let Some(handle) = prefetch.take() {
                match handle.await {
                    Ok((_, _, result)) => result,
                    Err(e) => Err(ProxyError::Internal { reason: e.to_string() }),
                }
            } else {
                fetch_chunk(&kv, &key, expected).await
            };

            // Kick off the next chunk's prefetch regardless of this
            // chunk's outcome -- a skipped chunk still needs its
            // successor fetched ahead of time.
            if i < last_chunk {
                let next_i = i + 1;
                let next_key = crate::cachekey::chunk_key(&base_key, next_i as u64);
                let next_expected = chunk_sizes[next_i];
                let kv = Arc::clone(&kv);
                prefetch = Some(tokio::spawn(async move {
                    let result = fetch_chunk(&kv, &next_key, next_expected).await;
                    (next_key, next_i as u64, result)
                }));
            }

            let chunk = match chunk_result {
                Ok(Some(bytes)) if within_tolerance(bytes.len() as u64, expected) => bytes,
                Ok(Some(bytes)) => {
                    if bytes_sent > 0 {
                        tracing::warn!(key = %key, "chunk size drifted beyond tolerance mid-stream, skipping and continuing");
                        continue;
                    }
                    let _ = tx
                        .send(Err(ProxyError::IntegrityViolation {
                            key,
                            reason: format!("chunk size {} outside tolerance of expected {}", bytes.len(), expected),
                        }))
                        .await;
                    return;
                }
                _ => {
                    if bytes_sent > 0 {
                        tracing::warn!(key = %key, "chunk fetch failed mid-stream, skipping and continuing");
                        continue;
                    }
                    let _ = tx
                        .send(Err(ProxyError::IntegrityViolation { key: key.clone(), reason: "chunk missing or fetch timed out".to_string() }))
                        .await;
                    return;
                }
            };

            let (lo, hi) = slice_bounds(i, chunk.len() as u64, standard_chunk_size, range);
            let slice = chunk.slice(lo as usize..hi as usize);
            for segment in slice.chunks(READ_SEGMENT_BYTES) {
                let segment = Bytes::copy_from_slice(segment);
                let write_timeout = per_segment_write_timeout(segment.len() as u64, is_range);
                match tokio::time::timeout(write_timeout, tx.send(Ok(Frame::data(segment.clone())))).await {
                    Ok(Ok(())) => bytes_sent += segment.len() as u64,
                    Ok(Err(_)) => {
                        tracing::debug!(error = %ProxyError::ClientDisconnect, key = %base_key, "receiver gone, stopping without further writes");
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(key = %base_key, budget_ms = write_timeout.as_millis() as u64, "write timed out mid-stream, aborting");
                        return;
                    }
                }
            }
        }
    });

    let s = async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    };
    StreamBody::new(s).boxed_unsync()
}

async fn fetch_chunk(kv: &Arc<dyn KvStore>, key: &str, expected_size: u64) -> Result<Option<Bytes>, ProxyError> {
    match tokio::time::timeout(per_chunk_timeout(expected_size), kv.get(key)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout {
            budget_ms: per_chunk_timeout(expected_size).as_millis() as u64,
            elapsed_ms: per_chunk_timeout(expected_size).as_millis() as u64,
        }),
    }
}

/// Computes the `[lo, hi)` slice of chunk `index` (of length
/// `chunk_len`) that overlaps `range`, in chunk-local coordinates.
fn slice_bounds(index: usize, chunk_len: u64, standard_chunk_size: u64, range: Option<ByteRange>) -> (u64, u64) {
    let Some(range) = range else {
        return (0, chunk_len);
    };
    let chunk_start_global = index as u64 * standard_chunk_size;
    let chunk_end_global = chunk_start_global + chunk_len;
    let lo = range.start.max(chunk_start_global) - chunk_start_global;
    let hi = (range.end + 1).min(chunk_end_global) - chunk_start_global;
    (lo, hi)
}
