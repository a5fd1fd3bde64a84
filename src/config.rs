//! Process configuration.
//!
//! CLI arguments and environment variables via `clap`, plus the startup-only
//! document (origins, derivatives, cache policy) loaded once from
//! `--config`. There is no hot-reload path here -- the admin upload endpoint
//! that would provide one is out of scope for this service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::options::{TransformOptions, ValidOptionSet};
use crate::origin::OriginSpec;

#[derive(Parser, Debug, Clone)]
#[command(name = "threshold")]
#[command(about = "Edge video transformation cache proxy")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path to the origins/derivatives/cache-policy document (JSON)
    #[arg(long, env = "CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Base URL of the upstream media transformation service, e.g.
    /// "https://media.example.com"
    #[arg(long, env = "TRANSFORM_SERVICE_URL", default_value = "http://127.0.0.1:9000")]
    pub transform_service_url: String,

    /// Maximum payload stored as a single KV entry before chunking kicks in
    #[arg(long, env = "SINGLE_ENTRY_MAX_BYTES", default_value_t = 20 * 1024 * 1024)]
    pub single_entry_max_bytes: u64,

    /// Hard ceiling above which a payload is refused from the cache entirely
    #[arg(long, env = "CACHE_SAFETY_CEILING_BYTES", default_value_t = 128 * 1024 * 1024)]
    pub safety_ceiling_bytes: u64,

    /// Size of each chunk in the chunked storage path
    #[arg(long, env = "STANDARD_CHUNK_SIZE_BYTES", default_value_t = 5 * 1024 * 1024)]
    pub standard_chunk_size_bytes: u64,

    /// Source size above which the pipeline bypasses transform+cache entirely
    #[arg(long, env = "OVERSIZED_CEILING_BYTES", default_value_t = 256 * 1024 * 1024)]
    pub oversized_ceiling_bytes: u64,

    /// Byte budget for the in-process memory KV store
    #[arg(long, env = "KV_MAX_BYTES", default_value_t = 2u64 * 1024 * 1024 * 1024)]
    pub kv_max_bytes: u64,

    /// Chunk lock table capacity (bounded LRU)
    #[arg(long, env = "CHUNK_LOCK_CAPACITY", default_value_t = 500)]
    pub chunk_lock_capacity: usize,

    /// Chunk lock TTL in seconds
    #[arg(long, env = "CHUNK_LOCK_TTL_SECS", default_value_t = 30)]
    pub chunk_lock_ttl_secs: u64,

    /// Chunk lock stale-sweep interval in seconds
    #[arg(long, env = "CHUNK_LOCK_SWEEP_SECS", default_value_t = 5)]
    pub chunk_lock_sweep_secs: u64,

    /// Maximum concurrently-coalesced in-flight transforms
    #[arg(long, env = "COALESCE_MAX_INFLIGHT", default_value_t = 1000)]
    pub coalesce_max_inflight: usize,

    /// Maximum concurrent chunk writes per stored transformation
    #[arg(long, env = "UPLOAD_CONCURRENCY", default_value_t = 5)]
    pub upload_concurrency: usize,

    /// HEAD size pre-check timeout in milliseconds
    #[arg(long, env = "HEAD_PRECHECK_TIMEOUT_MS", default_value_t = 5000)]
    pub head_precheck_timeout_ms: u64,

    /// Default max-age (seconds) applied when an origin/derivative doesn't
    /// specify a TTL
    #[arg(long, env = "DEFAULT_MAX_AGE_SECS", default_value_t = 86400)]
    pub default_max_age_secs: u64,

    /// Store cache entries indefinitely (no expirationTtl passed to the KV
    /// write; `expiresAt` still recorded for Cache-Control accounting)
    #[arg(long, env = "STORE_INDEFINITELY", default_value_t = false)]
    pub store_indefinitely: bool,

    /// Emit `Cache-Tag` headers on hits
    #[arg(long, env = "ENABLE_CACHE_TAGS", default_value_t = true)]
    pub enable_cache_tags: bool,

    /// Pin the unsatisfiable-range policy to strict 416 instead of the
    /// graceful 200 + X-Range-Recovery fallback (see design notes, open
    /// question 1)
    #[arg(long, env = "STRICT_RANGE_416", default_value_t = false)]
    pub strict_range_416: bool,

    /// Development mode: relaxes nothing security-relevant (there is no
    /// auth layer in scope here) but enables verbose startup logging
    #[arg(long, env = "DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.single_entry_max_bytes == 0 {
            return Err("SINGLE_ENTRY_MAX_BYTES must be > 0".to_string());
        }
        if self.single_entry_max_bytes > self.safety_ceiling_bytes {
            return Err(
                "SINGLE_ENTRY_MAX_BYTES must be <= CACHE_SAFETY_CEILING_BYTES".to_string(),
            );
        }
        if self.standard_chunk_size_bytes == 0 {
            return Err("STANDARD_CHUNK_SIZE_BYTES must be > 0".to_string());
        }
        if self.oversized_ceiling_bytes == 0 {
            return Err("OVERSIZED_CEILING_BYTES must be > 0".to_string());
        }
        if self.upload_concurrency == 0 {
            return Err("UPLOAD_CONCURRENCY must be > 0".to_string());
        }
        Ok(())
    }

    /// Loads the origins/derivatives/cache-policy document, or an empty one
    /// if `--config` wasn't given (useful for `threshold-worker`, which
    /// doesn't need origins at all).
    pub fn load_document(&self) -> Result<ConfigDocument, ProxyError> {
        match &self.config_path {
            None => Ok(ConfigDocument::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ProxyError::ConfigError {
                    reason: format!("reading {}: {e}", path.display()),
                })?;
                serde_json::from_str(&raw).map_err(|e| ProxyError::ConfigError {
                    reason: format!("parsing {}: {e}", path.display()),
                })
            }
        }
    }
}

/// The startup-only configuration document: origins, derivatives, the
/// closed set of accepted option values, global defaults, and cache policy
/// knobs. Consumed once; refreshing it is the out-of-scope admin endpoint's
/// job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigDocument {
    #[serde(default)]
    pub origins: Vec<OriginSpec>,

    #[serde(default)]
    pub derivatives: HashMap<String, TransformOptions>,

    /// Closed set of accepted values per option name (e.g. `"quality" ->
    /// ["low", "medium", "high", "auto"]`). An option name absent from
    /// this map is unconstrained; `None` disables validation entirely.
    #[serde(default)]
    pub valid_options: Option<ValidOptionSet>,

    #[serde(default)]
    pub defaults: Option<TransformOptions>,

    #[serde(default)]
    pub cache: CachePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default = "default_true")]
    pub kv_cache_enabled: bool,
    #[serde(default = "default_true")]
    pub enable_cache_tags: bool,
    #[serde(default = "default_max_age")]
    pub default_max_age_secs: u64,
    #[serde(default)]
    pub store_indefinitely: bool,
    #[serde(default)]
    pub bypass_query_parameters: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            kv_cache_enabled: true,
            enable_cache_tags: true,
            default_max_age_secs: default_max_age(),
            store_indefinitely: false,
            bypass_query_parameters: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_age() -> u64 {
    86400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_single_entry_larger_than_ceiling() {
        let mut args = Args::parse_from(["threshold"]);
        args.single_entry_max_bytes = 1024;
        args.safety_ceiling_bytes = 512;
        assert!(args.validate().is_err());
    }

    #[test]
    fn default_args_are_valid() {
        let args = Args::parse_from(["threshold"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn empty_document_when_no_config_path() {
        let args = Args::parse_from(["threshold"]);
        let doc = args.load_document().unwrap();
        assert!(doc.origins.is_empty());
        assert!(doc.cache.kv_cache_enabled);
    }
}
