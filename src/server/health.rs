//! Liveness and version probes -- the Kubernetes-style `/healthz` and
//! `/version` endpoints a deployed service needs regardless of what the
//! request pipeline itself is scoped to serve (grounded in the
//! reference gateway's `routes/health.rs`, trimmed to this service's
//! own concerns: there is no conductor/worker-fleet status to report,
//! just whether the process is up and what build it's running).

use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::streaming::ResponseBody;

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    commit: &'static str,
    commit_full: &'static str,
    build_time: &'static str,
    service: &'static str,
}

pub fn health_response(started_at: Instant) -> Response<ResponseBody> {
    let body = HealthResponse { healthy: true, uptime_secs: started_at.elapsed().as_secs() };
    json_response(&body)
}

pub fn version_response() -> Response<ResponseBody> {
    let body = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "threshold",
    };
    json_response(&body)
}

fn json_response<T: Serialize>(value: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed_unsync())
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()).map_err(|never| match never {}).boxed_unsync()))
}
