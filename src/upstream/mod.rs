//! Outbound HTTP clients: the media transform service and raw
//! Remote/Fallback origin fetches, both over `reqwest` the way the
//! reference gateway's NATS/HTTP client wrappers centralize timeouts
//! and auth-header handling in one place rather than scattering them
//! across call sites.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;

use crate::error::ProxyError;
use crate::options::TransformOptions;

/// A streamed upstream response: enough to drive the cache-engine store
/// path without buffering the whole body ourselves.
pub struct UpstreamResponse {
    pub status: reqwest::StatusCode,
    pub content_type: String,
    pub content_length: Option<u64>,
    /// `true` when the upstream answered with `206`/`Content-Range` --
    /// such responses are never stored, only passed through.
    pub is_partial: bool,
    pub body: Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send + Unpin>,
}

#[derive(Clone)]
pub struct TransformClient {
    http: Client,
    base_url: String,
}

impl TransformClient {
    pub fn new(base_url: String) -> Self {
        Self { http: Client::new(), base_url }
    }

    /// `GET {base_url}/cdn-cgi/media/{encoded-options}/{source_url}`.
    pub async fn fetch_transformed(&self, source_url: &str, options: &TransformOptions) -> Result<UpstreamResponse, ProxyError> {
        let url = format!(
            "{}/cdn-cgi/media/{}/{}",
            self.base_url.trim_end_matches('/'),
            encode_options(options),
            source_url.trim_start_matches('/'),
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamTransformError { reason: e.to_string() })?;
        to_upstream_response(response)
    }
}

#[derive(Clone)]
pub struct OriginClient {
    http: Client,
}

impl OriginClient {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }

    /// `GET` with optional bearer auth, streamed straight through
    /// (used for the size-bypass path and direct fallback fetches).
    pub async fn fetch(&self, url: &str, auth: Option<&str>) -> Result<UpstreamResponse, ProxyError> {
        let mut req = self.http.get(url);
        if let Some(token) = auth {
            req = req.bearer_auth(token);
        }
        let response = req.send().await.map_err(|e| ProxyError::UpstreamTransformError { reason: e.to_string() })?;
        to_upstream_response(response)
    }

    /// HEAD-style size pre-check with a fixed timeout; a HEAD that the
    /// origin rejects falls back to a `Range: bytes=0-0` GET, some
    /// object stores only answer sized GETs.
    pub async fn precheck_size(&self, url: &str, auth: Option<&str>, timeout: Duration) -> Result<Option<u64>, ProxyError> {
        let attempt = async {
            let mut req = self.http.head(url);
            if let Some(token) = auth {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await.ok()?;
            content_length_of(&resp)
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Some(len)) => Ok(Some(len)),
            Ok(None) => Ok(None),
            Err(_) => Err(ProxyError::Timeout { budget_ms: timeout.as_millis() as u64, elapsed_ms: timeout.as_millis() as u64 }),
        }
    }
}

impl Default for OriginClient {
    fn default() -> Self {
        Self::new()
    }
}

fn content_length_of(resp: &reqwest::Response) -> Option<u64> {
    resp.headers().get(reqwest::header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

fn to_upstream_response(response: reqwest::Response) -> Result<UpstreamResponse, ProxyError> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let content_length = content_length_of(&response);
    let is_partial = status == reqwest::StatusCode::PARTIAL_CONTENT || response.headers().contains_key(reqwest::header::CONTENT_RANGE);

    if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(ProxyError::UpstreamTransformError { reason: format!("upstream responded {status}") });
    }

    let body = response.bytes_stream().map(|r| r.map_err(|e| ProxyError::UpstreamTransformError { reason: e.to_string() }));
    Ok(UpstreamResponse { status, content_type, content_length, is_partial, body: Box::new(Box::pin(body)) })
}

/// Encodes a `TransformOptions` as the transform service's
/// comma-separated `key=value` option segment (e.g. `width=480,height=360`).
fn encode_options(options: &TransformOptions) -> String {
    let mut parts = Vec::new();
    if let Some(w) = options.width {
        parts.push(format!("width={w}"));
    }
    if let Some(h) = options.height {
        parts.push(format!("height={h}"));
    }
    if let Some(f) = &options.format {
        parts.push(format!("format={f}"));
    }
    if let Some(q) = options.quality {
        parts.push(format!("quality={q:?}").to_lowercase());
    }
    if let Some(c) = options.compression {
        parts.push(format!("compression={c:?}").to_lowercase());
    }
    if let Some(fit) = options.fit {
        parts.push(format!("fit={fit:?}").to_lowercase());
    }
    if let Some(t) = &options.time {
        parts.push(format!("time={t}"));
    }
    if let Some(d) = &options.duration {
        parts.push(format!("duration={d}"));
    }
    if parts.is_empty() {
        parts.push(format!("version={}", options.version));
    } else {
        parts.push(format!("v={}", options.version));
    }
    parts.join(",")
}
