//! Option Normalizer (component B).
//!
//! Builds a canonical `TransformOptions` from query parameters, a
//! derivative preset, and origin-level defaults, with closed-set
//! validation and vendor-parameter translation. Loosely grounded in the
//! reference gateway's convention-based rule resolution
//! (`cache/rules.rs`'s `DnaRules::get_rule` fallback-to-convention
//! pattern) but adapted to transform parameters instead of zome-call
//! cache policy.

mod normalize;
mod translate;

pub use normalize::{normalize, OptionSource, RequestHints};
pub(crate) use normalize::{parse_compression, parse_quality};
pub use translate::{autoselect_derivative, translate_vendor_params};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Video,
    Frame,
    Spritesheet,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Low,
    Medium,
    High,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    Contain,
    Cover,
    ScaleDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preload {
    None,
    Metadata,
    Auto,
}

/// Canonical input to cache-key computation and the upstream transform
/// call. Every field is optional except `mode` (which defaults to
/// `Video`) so a derivative's partial record and a request's explicit
/// overlay can both be represented by the same type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformOptions {
    #[serde(default)]
    pub mode: Mode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub quality: Option<Quality>,
    pub compression: Option<Compression>,
    pub fit: Option<Fit>,
    pub time: Option<String>,
    pub duration: Option<String>,
    pub columns: Option<u32>,
    pub rows: Option<u32>,
    pub interval: Option<String>,
    pub audio: Option<bool>,
    #[serde(rename = "loop")]
    pub loop_: Option<bool>,
    pub autoplay: Option<bool>,
    pub muted: Option<bool>,
    pub preload: Option<Preload>,
    pub derivative: Option<String>,
    pub filename: Option<String>,
    #[serde(default = "default_version")]
    pub version: u64,
    /// Open-ended opaque data, never surfaced beyond pass-through per the
    /// design notes' "dynamic typing + open customData" guidance.
    #[serde(default)]
    pub custom_data: serde_json::Value,
    /// Provenance of the dimension/derivative fields, not part of the
    /// cache key itself.
    #[serde(skip)]
    pub source: OptionSource,
}

fn default_version() -> u64 {
    1
}

pub type ValidOptionSet = HashMap<String, Vec<String>>;
