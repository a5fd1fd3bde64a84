//! Request Pipeline (component I).
//!
//! `ServiceContext` bundles every other component into the one object
//! the HTTP layer needs per request; `handle_video_request` is the
//! orchestration entry point, mirroring how the reference gateway's
//! `AppState` + `handle_request` split keeps wiring in one place and
//! routing logic in another (`server/http.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

use crate::cachekey::{generate_kv_key, VersionStore};
use crate::chunklock::ChunkLockManager;
use crate::coalesce::{transform_key, RequestCoalescer};
use crate::config::{Args, ConfigDocument};
use crate::error::ProxyError;
use crate::kv::{CacheEngine, CacheEngineConfig, MemoryKvStore, TransformationMetadata};
use crate::options::{normalize, parse_compression, parse_quality, RequestHints, TransformOptions};
use crate::origin::{Origin, OriginMatch, OriginResolver, SourceResolution, SourceType};
use crate::streaming::ResponseBody;
use crate::upstream::{OriginClient, TransformClient};

const CDN_TRANSFORMED_PREFIX: &str = "/cdn-cgi/media/";

/// The coalesced result of running a transform once for a given
/// transform key. Deliberately small and `Clone` -- the actual bytes
/// are read back from the cache engine by every joiner independently
/// (store-then-serve), never broadcast directly.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub is_chunked: bool,
    pub total_size: u64,
    pub content_type: String,
}

pub struct ServiceContext {
    pub args: Args,
    pub document: ConfigDocument,
    pub resolver: OriginResolver,
    pub engine: Arc<CacheEngine>,
    pub version: Arc<VersionStore>,
    pub chunk_locks: Arc<ChunkLockManager>,
    pub memory_kv: Arc<MemoryKvStore>,
    pub coalescer: RequestCoalescer<TransformOutcome>,
    pub transform_client: TransformClient,
    pub origin_client: OriginClient,
    pub started_at: Instant,
}

impl ServiceContext {
    pub fn new(args: Args, document: ConfigDocument) -> Self {
        let kv = Arc::new(MemoryKvStore::new(args.kv_max_bytes));
        let version = Arc::new(VersionStore::new(Arc::clone(&kv) as Arc<dyn crate::kv::KvStore>));
        let chunk_locks = Arc::new(ChunkLockManager::new(args.chunk_lock_capacity, Duration::from_secs(args.chunk_lock_ttl_secs)));
        let resolver = OriginResolver::new(&document.origins);
        let engine = Arc::new(CacheEngine::new(
            Arc::clone(&kv) as Arc<dyn crate::kv::KvStore>,
            Arc::clone(&version),
            Arc::clone(&chunk_locks),
            CacheEngineConfig {
                single_entry_max_bytes: args.single_entry_max_bytes,
                safety_ceiling_bytes: args.safety_ceiling_bytes,
                standard_chunk_size_bytes: args.standard_chunk_size_bytes,
                upload_concurrency: args.upload_concurrency,
                default_max_age_secs: document.cache.default_max_age_secs,
                store_indefinitely: document.cache.store_indefinitely || args.store_indefinitely,
                enable_cache_tags: document.cache.enable_cache_tags && args.enable_cache_tags,
                strict_range_416: args.strict_range_416,
            },
        ));
        let coalescer = RequestCoalescer::new(args.coalesce_max_inflight);
        let transform_client = TransformClient::new(args.transform_service_url.clone());
        let origin_client = OriginClient::new();

        Self { args, document, resolver, engine, version, chunk_locks, memory_kv: kv, coalescer, transform_client, origin_client, started_at: Instant::now() }
    }
}

pub async fn handle_video_request(ctx: Arc<ServiceContext>, req: Request<Incoming>) -> Response<ResponseBody> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let params = parse_query(&query);
    let range_header = req.headers().get(hyper::header::RANGE).and_then(|v| v.to_str().ok()).map(str::to_string);

    if path == "/healthz" || path == "/health" {
        return crate::server::health_response(ctx.started_at);
    }
    if path == "/version" {
        return crate::server::version_response();
    }
    if path.starts_with(CDN_TRANSFORMED_PREFIX) {
        return cdn_passthrough(&ctx, &path, &query).await;
    }

    match route(&ctx, &path, &params, &req, range_header.as_deref()).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(path, error = %e, "request pipeline error");
            error_response(&e)
        }
    }
}

async fn route(
    ctx: &Arc<ServiceContext>,
    path: &str,
    params: &HashMap<String, String>,
    req: &Request<Incoming>,
    range_header: Option<&str>,
) -> Result<Response<ResponseBody>, ProxyError> {
    let debug = params.contains_key("debug");

    let m = ctx.resolver.match_origin_with_captures(path).ok_or(ProxyError::NoMatchingOrigin)?;
    let origin = ctx.resolver.origin(m.origin_idx).ok_or(ProxyError::NoMatchingOrigin)?;
    let origin_name = origin.name.clone();
    let (origin_quality, origin_compression, origin_ttl_ok) = origin_defaults(origin);
    let resolution = ctx.resolver.resolve_path_to_source(&m, None, None).ok_or(ProxyError::NoValidSource)?;

    let hints = RequestHints {
        client_hint_width: req.headers().get("width").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok()),
        user_agent: req.headers().get(hyper::header::USER_AGENT).and_then(|v| v.to_str().ok()),
    };
    let mut options = normalize(params, &ctx.document.derivatives, ctx.document.valid_options.as_ref(), origin_quality, origin_compression, hints);

    let key = generate_kv_key(&resolution.resolved_path, &options);
    options.version = ctx.version.current(&key).await;

    let cache_bypassed = !ctx.document.cache.kv_cache_enabled
        || ctx.document.cache.bypass_query_parameters.iter().any(|p| params.contains_key(p));

    if cache_bypassed {
        return bypass_transform_stream(ctx, &origin_name, &resolution, &options).await;
    }

    if !debug {
        if let Some((result, metadata)) = ctx.engine.get(&key, range_header).await? {
            return Ok(build_hit_response(result, &metadata, &origin_name, &resolution, &key, ctx.args.enable_cache_tags));
        }
    }

    // The miss path may have bumped the version concurrently; re-read
    // before attaching it to the upstream transform request.
    options.version = ctx.version.current(&key).await;

    if let Some(source_url) = resolution.source_url.clone() {
        let precheck = ctx
            .origin_client
            .precheck_size(&source_url, resolution.auth.as_deref(), Duration::from_millis(ctx.args.head_precheck_timeout_ms))
            .await;
        if let Ok(Some(size)) = precheck {
            if size > ctx.args.oversized_ceiling_bytes {
                return bypass_direct_stream(ctx, &source_url, resolution.auth.as_deref(), &origin_name).await;
            }
        }
    }

    let tkey = transform_key(&origin_name, &resolution.resolved_path, &options);
    let ctx_producer = Arc::clone(ctx);
    let origin_matches = ctx.resolver.find_all_matching_origins(path);
    let options_producer = options.clone();
    let key_producer = key.clone();

    let outcome = ctx
        .coalescer
        .run_or_join(&tkey, move || async move {
            produce_and_store(&ctx_producer, &origin_matches, &options_producer, &key_producer, origin_ttl_ok).await
        })
        .await?;
    let _ = outcome;

    match ctx.engine.get(&key, range_header).await? {
        Some((result, metadata)) => Ok(build_hit_response(result, &metadata, &origin_name, &resolution, &key, ctx.args.enable_cache_tags)),
        None => Err(ProxyError::Internal { reason: "stored entry missing immediately after write".to_string() }),
    }
}

/// Tries every source of every matching origin, in priority order,
/// falling through to the next matching origin on exhaustion --
/// the multi-origin retry chain (§4.I step 10).
async fn produce_and_store(
    ctx: &Arc<ServiceContext>,
    origin_matches: &[OriginMatch],
    options: &TransformOptions,
    key: &str,
    ttl_override_secs: Option<u64>,
) -> Result<TransformOutcome, ProxyError> {
    let mut last_err = ProxyError::NoValidSource;

    for om in origin_matches {
        let Some(origin) = ctx.resolver.origin(om.origin_idx) else { continue };
        let mut types: Vec<SourceType> = origin.sources.iter().map(|s| s.source_type).collect();
        types.sort_by_key(|t| origin.sources.iter().find(|s| s.source_type == *t).map(|s| s.priority).unwrap_or(i32::MAX));
        types.dedup();

        for source_type in types {
            let Some(resolution) = ctx.resolver.resolve_path_to_source(om, Some(source_type), None) else { continue };
            let Some(source_url) = &resolution.source_url else { continue };

            match ctx.transform_client.fetch_transformed(source_url, options).await {
                Ok(resp) => {
                    let content_type = resp.content_type.clone();
                    let declared_size = resp.content_length;
                    let was_partial = resp.is_partial;
                    let stored = ctx
                        .engine
                        .store(key, &resolution.resolved_path, content_type.clone(), resp.body, declared_size, was_partial, options, ttl_override_secs)
                        .await?;
                    if !stored {
                        last_err = ProxyError::UpstreamTransformError { reason: "upstream returned a partial response, refusing to cache".to_string() };
                        continue;
                    }
                    return Ok(TransformOutcome { is_chunked: declared_size.unwrap_or(0) > ctx.args.single_entry_max_bytes, total_size: declared_size.unwrap_or(0), content_type });
                }
                Err(e) => {
                    tracing::warn!(origin = %origin.name, source = ?source_type, error = %e, "transform attempt failed, trying next source");
                    last_err = e;
                    continue;
                }
            }
        }
    }

    Err(last_err)
}

async fn cdn_passthrough(ctx: &Arc<ServiceContext>, path: &str, query: &str) -> Response<ResponseBody> {
    let url = if query.is_empty() {
        format!("{}{}", ctx.args.transform_service_url.trim_end_matches('/'), path)
    } else {
        format!("{}{}?{}", ctx.args.transform_service_url.trim_end_matches('/'), path, query)
    };
    match ctx.origin_client.fetch(&url, None).await {
        Ok(resp) => {
            let status = if resp.is_partial { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
            let body = stream_to_body(resp.body);
            Response::builder()
                .status(status)
                .header(hyper::header::CONTENT_TYPE, resp.content_type)
                .header("x-handler", "threshold")
                .body(body)
                .unwrap_or_else(|_| error_response(&ProxyError::Internal { reason: "failed to build passthrough response".to_string() }))
        }
        Err(e) => error_response(&e),
    }
}

async fn bypass_direct_stream(
    ctx: &Arc<ServiceContext>,
    source_url: &str,
    auth: Option<&str>,
    origin_name: &str,
) -> Result<Response<ResponseBody>, ProxyError> {
    let resp = ctx.origin_client.fetch(source_url, auth).await?;
    let content_type = resp.content_type.clone();
    let body = stream_to_body(resp.body);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header("x-handler", "threshold")
        .header("x-origin", origin_name.to_string())
        .header("x-video-exceeds-256mib", "true")
        .header("x-video-size-bypass", "true")
        .header("x-direct-stream", "true")
        .header("x-bypass-cache-api", "true")
        .body(body)
        .map_err(|e| ProxyError::Internal { reason: e.to_string() })?)
}

/// Cache-policy bypass path (`kvCacheEnabled=false`, or a request query
/// parameter named in `bypassQueryParameters`): transforms and streams
/// straight through, never touching `ctx.engine.get`/`store` or the
/// coalescer.
async fn bypass_transform_stream(
    ctx: &Arc<ServiceContext>,
    origin_name: &str,
    resolution: &SourceResolution,
    options: &TransformOptions,
) -> Result<Response<ResponseBody>, ProxyError> {
    let source_url = resolution.source_url.as_deref().ok_or(ProxyError::NoValidSource)?;
    let resp = ctx.transform_client.fetch_transformed(source_url, options).await?;
    let status = if resp.is_partial { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
    let content_type = resp.content_type.clone();
    let body = stream_to_body(resp.body);
    Ok(Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header("x-handler", "threshold")
        .header("x-origin", origin_name.to_string())
        .header("x-cache-status", "BYPASS")
        .body(body)
        .map_err(|e| ProxyError::Internal { reason: e.to_string() })?)
}

fn build_hit_response(
    result: crate::kv::CacheGetResult,
    metadata: &TransformationMetadata,
    origin_name: &str,
    resolution: &SourceResolution,
    key: &str,
    enable_cache_tags: bool,
) -> Response<ResponseBody> {
    use crate::kv::CacheGetResult;

    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    let age_secs = now_ms.saturating_sub(metadata.created_at) / 1000;
    let ttl_secs = metadata.expires_at.map(|exp| exp.saturating_sub(now_ms) / 1000).unwrap_or(0);
    let storage = if metadata.is_chunked { "chunked" } else { "single" };

    let mut builder = Response::builder()
        .header(hyper::header::CONTENT_TYPE, content_type_for(metadata))
        .header(hyper::header::ACCEPT_RANGES, "bytes")
        .header(hyper::header::CACHE_CONTROL, format!("public, max-age={ttl_secs}"))
        .header("x-handler", "threshold")
        .header("x-origin", origin_name.to_string())
        .header("x-source-type", format!("{:?}", resolution.origin_type).to_lowercase())
        .header("x-cache-status", "HIT")
        .header("x-cache-source", "KV")
        .header("x-kv-cache-key", key.to_string())
        .header("x-kv-cache-age", age_secs.to_string())
        .header("x-kv-cache-ttl", ttl_secs.to_string())
        .header("x-cache-version", metadata.cache_version.to_string())
        .header("x-video-chunked", metadata.is_chunked.to_string())
        .header("x-video-storage", storage)
        .header("x-video-total-size", metadata.actual_total_video_size.to_string());

    if enable_cache_tags && !metadata.cache_tags.is_empty() {
        builder = builder.header("cache-tag", metadata.cache_tags.join(","));
    }
    if let Some(derivative) = &metadata.derivative {
        builder = builder.header("x-video-derivative", derivative.clone());
    }

    let (status, body, content_length, content_range) = match result {
        CacheGetResult::Full { body, content_length } => (StatusCode::OK, body, Some(content_length), None),
        CacheGetResult::Partial { body, range } => (StatusCode::PARTIAL_CONTENT, body, Some(range.len()), Some(range.content_range_header())),
        CacheGetResult::RangeRecovery { body, content_length } => {
            builder = builder.header("x-range-recovery", "true");
            (StatusCode::OK, body, Some(content_length), None)
        }
        CacheGetResult::Unsatisfiable { content_range } => {
            return builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(hyper::header::CONTENT_RANGE, content_range)
                .body(empty_body())
                .unwrap_or_else(|_| error_response(&ProxyError::Internal { reason: "failed to build 416 response".to_string() }));
        }
    };

    if let Some(len) = content_length {
        builder = builder.header(hyper::header::CONTENT_LENGTH, len.to_string());
    }
    if let Some(range) = content_range {
        builder = builder.header(hyper::header::CONTENT_RANGE, range);
    }

    builder
        .status(status)
        .body(body)
        .unwrap_or_else(|_| error_response(&ProxyError::Internal { reason: "failed to build hit response".to_string() }))
}

fn content_type_for(metadata: &TransformationMetadata) -> String {
    if matches!(metadata.mode, crate::options::Mode::Audio) {
        "audio/mp4".to_string()
    } else {
        metadata.content_type.clone()
    }
}

fn origin_defaults(origin: &Origin) -> (Option<crate::options::Quality>, Option<crate::options::Compression>, Option<u64>) {
    let Some(defaults) = &origin.defaults else { return (None, None, None) };
    (
        defaults.quality.as_deref().and_then(parse_quality),
        defaults.video_compression.as_deref().and_then(parse_compression),
        defaults.ttl_ok,
    )
}

fn error_response(err: &ProxyError) -> Response<ResponseBody> {
    let (status, code) = err.status_and_code();
    Response::builder()
        .status(status)
        .header("x-error", code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(text_body(code))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn text_body(s: &str) -> ResponseBody {
    Full::new(Bytes::copy_from_slice(s.as_bytes())).map_err(|never| match never {}).boxed_unsync()
}

fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn stream_to_body(stream: Box<dyn futures::Stream<Item = Result<Bytes, ProxyError>> + Send + Unpin>) -> ResponseBody {
    use futures::StreamExt;
    let frames = stream.map(|r| r.map(hyper::body::Frame::data));
    http_body_util::StreamBody::new(frames).boxed_unsync()
}

/// Minimal `application/x-www-form-urlencoded` query-string parser --
/// no `url`/`form_urlencoded` crate in the dependency set, and a GET
/// query string is simple enough not to need one.
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, '=');
        let key = percent_decode(parts.next().unwrap_or(""));
        let value = percent_decode(parts.next().unwrap_or(""));
        if !key.is_empty() {
            out.insert(key, value);
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_query_string() {
        let params = parse_query("width=480&derivative=mobile");
        assert_eq!(params.get("width").map(String::as_str), Some("480"));
        assert_eq!(params.get("derivative").map(String::as_str), Some("mobile"));
    }

    #[test]
    fn percent_decodes_values() {
        let params = parse_query("filename=my%20video.mp4");
        assert_eq!(params.get("filename").map(String::as_str), Some("my video.mp4"));
    }

    #[test]
    fn empty_query_yields_empty_map() {
        assert!(parse_query("").is_empty());
    }
}
