//! Structured error types for the request pipeline.
//!
//! Every request-path operation returns `Result<T, ProxyError>`. `anyhow`
//! is reserved for process-startup boundaries (config/KV backend wiring in
//! `main.rs`), matching how the reference gateway scopes the two error
//! styles.

use hyper::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no matching origin for path")]
    NoMatchingOrigin,

    #[error("origin matched but no valid source available")]
    NoValidSource,

    #[error("cache entry not found for key {key}")]
    NotFound { key: String },

    #[error("integrity check failed for key {key}: {reason}")]
    IntegrityViolation { key: String, reason: String },

    #[error("transient KV condition: {reason}")]
    Transient { reason: String },

    #[error("operation timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { budget_ms: u64, elapsed_ms: u64 },

    #[error("client disconnected mid-stream")]
    ClientDisconnect,

    #[error("source exceeds transform ceiling ({size_bytes} bytes > {ceiling_bytes} bytes)")]
    OversizedAsset { size_bytes: u64, ceiling_bytes: u64 },

    #[error("upstream transform service failed: {reason}")]
    UpstreamTransformError { reason: String },

    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ProxyError {
    /// Maps a variant to the (status, `X-Error` code) pair the pipeline's
    /// catch-all assembles into a response. Never includes the inner
    /// reason text in the code itself -- that stays server-side in logs.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::NoMatchingOrigin => (StatusCode::NOT_FOUND, "NoMatchingOrigin"),
            ProxyError::NoValidSource => (StatusCode::INTERNAL_SERVER_ERROR, "NoValidSource"),
            ProxyError::NotFound { .. } => (StatusCode::NOT_FOUND, "NotFound"),
            ProxyError::IntegrityViolation { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "IntegrityViolation")
            }
            ProxyError::Transient { .. } => (StatusCode::SERVICE_UNAVAILABLE, "Transient"),
            ProxyError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "Timeout"),
            ProxyError::ClientDisconnect => (StatusCode::BAD_REQUEST, "ClientDisconnect"),
            ProxyError::OversizedAsset { .. } => (StatusCode::OK, "OversizedAsset"),
            ProxyError::UpstreamTransformError { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "OriginsTransformationError")
            }
            ProxyError::ConfigError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ProxyError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::Transient { .. })
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Internal { reason: e.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_matching_origin_maps_to_404() {
        let (status, code) = ProxyError::NoMatchingOrigin.status_and_code();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NoMatchingOrigin");
    }

    #[test]
    fn transient_is_retryable() {
        assert!(ProxyError::Transient { reason: "429".into() }.is_transient());
        assert!(!ProxyError::NotFound { key: "k".into() }.is_transient());
    }
}
