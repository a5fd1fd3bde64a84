//! Cache Key + Versioning (component C).
//!
//! `generate_kv_key` computes the stable KV key for a `(path, options)`
//! pair (§3's `CacheKey` format); `VersionStore` maintains the
//! monotonically increasing per-key version counter used to bust
//! downstream/upstream CDN caches on every cache miss.

mod version;

pub use version::VersionStore;

use crate::options::{Mode, TransformOptions};

/// Returned when key computation panics; logged and substituted so the
/// pipeline always has a key to work with.
pub const FALLBACK_KEY: &str = "video:error:fallback-key";

/// Derives a stable cache key from a normalized path and the canonical
/// `TransformOptions`. Equal (normalized) options always yield a
/// byte-equal key. Format: `{mode}:{normalized_path}:{params}` where
/// `params` is `derivative={name}` when a derivative is set, otherwise
/// an ordered, mode-dependent list of short-form parameters.
pub fn generate_kv_key(path: &str, options: &TransformOptions) -> String {
    match std::panic::catch_unwind(|| build_key(path, options)) {
        Ok(key) => key,
        Err(_) => {
            tracing::error!(path, "generate_kv_key panicked, using fallback key");
            FALLBACK_KEY.to_string()
        }
    }
}

fn build_key(path: &str, options: &TransformOptions) -> String {
    let normalized_path = path.trim_start_matches('/');
    let params = if let Some(derivative) = &options.derivative {
        format!("derivative={derivative}")
    } else {
        param_list(options)
    };
    let raw = if params.is_empty() {
        format!("{}:{}", mode_tag(options.mode), normalized_path)
    } else {
        format!("{}:{}:{}", mode_tag(options.mode), normalized_path, params)
    };
    sanitize(&raw)
}

fn mode_tag(mode: Mode) -> &'static str {
    match mode {
        Mode::Video => "video",
        Mode::Frame => "frame",
        Mode::Spritesheet => "spritesheet",
        Mode::Audio => "audio",
    }
}

fn param_list(options: &TransformOptions) -> String {
    let mut parts = Vec::new();
    if let Some(w) = options.width {
        parts.push(format!("w={w}"));
    }
    if let Some(h) = options.height {
        parts.push(format!("h={h}"));
    }
    if let Some(t) = &options.time {
        parts.push(format!("t={t}"));
    }
    if let Some(f) = &options.format {
        parts.push(format!("f={f}"));
    }
    if let Some(q) = options.quality {
        parts.push(format!("q={q:?}").to_lowercase());
    }
    if let Some(c) = options.compression {
        parts.push(format!("c={c:?}").to_lowercase());
    }
    if matches!(options.mode, Mode::Spritesheet) {
        if let Some(cols) = options.columns {
            parts.push(format!("cols={cols}"));
        }
        if let Some(rows) = options.rows {
            parts.push(format!("rows={rows}"));
        }
        if let Some(interval) = &options.interval {
            parts.push(format!("interval={interval}"));
        }
    }
    parts.join(":")
}

/// Characters outside `[\w:/=.*-]` are replaced with `-`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | ':' | '/' | '=' | '.' | '*' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Derives the key of chunk `index` of a chunked entry stored under
/// `base_key`.
pub fn chunk_key(base_key: &str, index: u64) -> String {
    format!("{base_key}_chunk_{index}")
}
