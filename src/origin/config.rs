//! Raw, serde-facing origin configuration -- the shape loaded from
//! `--config`, before regex compilation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    R2,
    Remote,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Base URL for Remote/Fallback sources. Ignored for R2.
    #[serde(default)]
    pub url: Option<String>,
    /// Opaque auth reference (bearer token env var name, presigned-url
    /// signer id, etc). Interpretation is left to the upstream client.
    #[serde(default)]
    pub auth: Option<String>,
    /// Lower is tried first.
    pub priority: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginDefaults {
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub video_compression: Option<String>,
    #[serde(default)]
    pub ttl_ok: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginSpec {
    pub name: String,
    /// Regex over the request path. Named capture groups are honored
    /// directly; `capture_groups` additionally names numbered groups for
    /// engines/configs that only support positional captures.
    pub matcher: String,
    #[serde(default)]
    pub capture_groups: Option<Vec<String>>,
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub defaults: Option<OriginDefaults>,
    #[serde(default)]
    pub auth: Option<String>,
}
