use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::translate::{autoselect_derivative, translate_vendor_params};
use super::{Compression, Fit, Mode, Preload, Quality, TransformOptions, ValidOptionSet};

/// Provenance of the dimension/derivative fields in a normalized
/// `TransformOptions`. Recorded for diagnostics; never part of the cache
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OptionSource {
    #[default]
    Params,
    Derivative,
    Imquery,
    ImqueryDerivative,
    ResponsiveWidth,
    ResponsiveHint,
}

/// Request-derived inputs to normalization: query parameters and the
/// subset of headers relevant to responsive-dimension heuristics.
#[derive(Debug, Clone, Default)]
pub struct RequestHints<'a> {
    pub client_hint_width: Option<u32>,
    pub user_agent: Option<&'a str>,
}

/// Builds a canonical `TransformOptions` from query params, a known
/// derivative table, and origin-level quality/compression defaults
/// (applied only when the field is still unset after explicit/derivative
/// overlay).
pub fn normalize(
    params: &HashMap<String, String>,
    derivatives: &HashMap<String, TransformOptions>,
    valid_options: Option<&ValidOptionSet>,
    origin_quality_default: Option<Quality>,
    origin_compression_default: Option<Compression>,
    hints: RequestHints,
) -> TransformOptions {
    let mut opts = TransformOptions::default();

    // 1. Derivative overlay (explicit ?derivative= wins over vendor-translated ones).
    let mut derivative_name = params.get("derivative").cloned();
    let mut source = OptionSource::Params;

    if derivative_name.is_none() {
        if let Some(translated) = translate_vendor_params(params) {
            if let Some(explicit_width) = translated.width {
                if let Some(name) = autoselect_derivative(derivatives, explicit_width) {
                    derivative_name = Some(name);
                    source = OptionSource::ImqueryDerivative;
                } else {
                    opts.width = Some(explicit_width);
                    source = OptionSource::Imquery;
                }
            }
            if let Some(h) = translated.height {
                opts.height = opts.height.or(Some(h));
            }
        }
    }

    if let Some(name) = &derivative_name {
        if let Some(preset) = derivatives.get(name) {
            overlay(&mut opts, preset);
            opts.derivative = Some(name.clone());
            if matches!(source, OptionSource::Params) {
                source = OptionSource::Derivative;
            }
        }
    }

    // 2. Explicit per-param overlay; these always override derivative values.
    // Enum-valued params are additionally checked against the closed
    // `validOptions` set from the configuration document, when present --
    // a value outside that set is ignored rather than rejecting the
    // whole request.
    if let Some(v) = params.get("mode").filter(|v| allowed(valid_options, "mode", v)).and_then(|v| parse_mode(v)) {
        opts.mode = v;
    }
    if let Some(v) = params.get("width").and_then(|v| v.parse::<u32>().ok()) {
        opts.width = Some(v);
        source = OptionSource::Params;
    }
    if let Some(v) = params.get("height").and_then(|v| v.parse::<u32>().ok()) {
        opts.height = Some(v);
        source = OptionSource::Params;
    }
    if let Some(v) = params.get("format") {
        opts.format = Some(v.clone());
    }
    if let Some(v) = params.get("quality").filter(|v| allowed(valid_options, "quality", v)).and_then(|v| parse_quality(v)) {
        opts.quality = Some(v);
    }
    if let Some(v) = params.get("compression").filter(|v| allowed(valid_options, "compression", v)).and_then(|v| parse_compression(v)) {
        opts.compression = Some(v);
    }
    if let Some(v) = params.get("fit").filter(|v| allowed(valid_options, "fit", v)).and_then(|v| parse_fit(v)) {
        opts.fit = Some(v);
    }
    if let Some(v) = params.get("time") {
        opts.time = Some(v.clone());
    }
    if let Some(v) = params.get("duration") {
        opts.duration = Some(v.clone());
    }
    if let Some(v) = params.get("columns").and_then(|v| v.parse::<u32>().ok()) {
        opts.columns = Some(v);
    }
    if let Some(v) = params.get("rows").and_then(|v| v.parse::<u32>().ok()) {
        opts.rows = Some(v);
    }
    if let Some(v) = params.get("interval") {
        opts.interval = Some(v.clone());
    }
    if let Some(v) = params.get("audio").and_then(|v| parse_bool(v)) {
        opts.audio = Some(v);
    }
    if let Some(v) = params.get("loop").and_then(|v| parse_bool(v)) {
        opts.loop_ = Some(v);
    }
    if let Some(v) = params.get("autoplay").and_then(|v| parse_bool(v)) {
        opts.autoplay = Some(v);
    }
    if let Some(v) = params.get("muted").and_then(|v| parse_bool(v)) {
        opts.muted = Some(v);
    }
    if let Some(v) = params.get("preload").filter(|v| allowed(valid_options, "preload", v)).and_then(|v| parse_preload(v)) {
        opts.preload = Some(v);
    }
    if let Some(v) = params.get("filename") {
        opts.filename = Some(v.clone());
    }

    // 3. Origin-level defaults, only if still unset.
    if opts.quality.is_none() {
        opts.quality = origin_quality_default;
    }
    if opts.compression.is_none() {
        opts.compression = origin_compression_default;
    }

    // 4. Responsive heuristics -- never override explicit or derivative
    // dimensions, only fill in when both are entirely absent.
    if opts.width.is_none() && opts.height.is_none() && opts.derivative.is_none() {
        if let Some(w) = hints.client_hint_width {
            opts.width = Some(w);
            source = OptionSource::ResponsiveHint;
        } else if let Some(w) = estimate_device_class_width(hints.user_agent) {
            opts.width = Some(w);
            source = OptionSource::ResponsiveWidth;
        }
    }

    opts.source = source;
    opts
}

/// Seeds `target`'s unset fields from `preset` (derivative values act as
/// defaults, never overrides).
fn overlay(target: &mut TransformOptions, preset: &TransformOptions) {
    target.mode = preset.mode;
    target.width = target.width.or(preset.width);
    target.height = target.height.or(preset.height);
    target.format = target.format.clone().or_else(|| preset.format.clone());
    target.quality = target.quality.or(preset.quality);
    target.compression = target.compression.or(preset.compression);
    target.fit = target.fit.or(preset.fit);
    target.time = target.time.clone().or_else(|| preset.time.clone());
    target.duration = target.duration.clone().or_else(|| preset.duration.clone());
    target.columns = target.columns.or(preset.columns);
    target.rows = target.rows.or(preset.rows);
    target.interval = target.interval.clone().or_else(|| preset.interval.clone());
    target.audio = target.audio.or(preset.audio);
    target.loop_ = target.loop_.or(preset.loop_);
    target.autoplay = target.autoplay.or(preset.autoplay);
    target.muted = target.muted.or(preset.muted);
    target.preload = target.preload.or(preset.preload);
}

fn parse_mode(v: &str) -> Option<Mode> {
    match v {
        "video" => Some(Mode::Video),
        "frame" => Some(Mode::Frame),
        "spritesheet" => Some(Mode::Spritesheet),
        "audio" => Some(Mode::Audio),
        _ => None,
    }
}

pub(crate) fn parse_quality(v: &str) -> Option<Quality> {
    match v {
        "low" => Some(Quality::Low),
        "medium" => Some(Quality::Medium),
        "high" => Some(Quality::High),
        "auto" => Some(Quality::Auto),
        _ => None,
    }
}

pub(crate) fn parse_compression(v: &str) -> Option<Compression> {
    match v {
        "low" => Some(Compression::Low),
        "medium" => Some(Compression::Medium),
        "high" => Some(Compression::High),
        "auto" => Some(Compression::Auto),
        _ => None,
    }
}

fn parse_fit(v: &str) -> Option<Fit> {
    match v {
        "contain" => Some(Fit::Contain),
        "cover" => Some(Fit::Cover),
        "scale-down" => Some(Fit::ScaleDown),
        _ => None,
    }
}

fn parse_preload(v: &str) -> Option<Preload> {
    match v {
        "none" => Some(Preload::None),
        "metadata" => Some(Preload::Metadata),
        "auto" => Some(Preload::Auto),
        _ => None,
    }
}

/// `true` when `value` is acceptable for `field` under `valid_options` --
/// unconstrained (no entry for `field`, or no document-level restriction
/// at all) always passes.
fn allowed(valid_options: Option<&ValidOptionSet>, field: &str, value: &str) -> bool {
    match valid_options.and_then(|m| m.get(field)) {
        Some(values) => values.iter().any(|v| v == value),
        None => true,
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Coarse device-class estimate from the user-agent, used only when no
/// client-hint width and no dimensions/derivative are present at all.
fn estimate_device_class_width(user_agent: Option<&str>) -> Option<u32> {
    let ua = user_agent?.to_lowercase();
    if ua.contains("mobile") {
        Some(480)
    } else if ua.contains("tablet") || ua.contains("ipad") {
        Some(1024)
    } else {
        Some(1920)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derivatives() -> HashMap<String, TransformOptions> {
        let mut m = HashMap::new();
        m.insert(
            "mobile".to_string(),
            TransformOptions { width: Some(480), height: Some(360), quality: Some(Quality::Medium), ..Default::default() },
        );
        m
    }

    #[test]
    fn derivative_seeds_defaults_explicit_overrides() {
        let mut params = HashMap::new();
        params.insert("derivative".to_string(), "mobile".to_string());
        params.insert("width".to_string(), "720".to_string());
        let opts = normalize(&params, &derivatives(), None, None, None, RequestHints::default());
        assert_eq!(opts.width, Some(720));
        assert_eq!(opts.height, Some(360));
        assert_eq!(opts.derivative, Some("mobile".to_string()));
    }

    #[test]
    fn unknown_param_is_ignored() {
        let mut params = HashMap::new();
        params.insert("bogus".to_string(), "whatever".to_string());
        let opts = normalize(&params, &derivatives(), None, None, None, RequestHints::default());
        assert!(opts.width.is_none());
    }

    #[test]
    fn responsive_does_not_override_explicit_dimensions() {
        let mut params = HashMap::new();
        params.insert("width".to_string(), "100".to_string());
        let hints = RequestHints { client_hint_width: Some(999), user_agent: None };
        let opts = normalize(&params, &derivatives(), None, None, None, hints);
        assert_eq!(opts.width, Some(100));
    }

    #[test]
    fn responsive_fills_in_when_nothing_else_present() {
        let params = HashMap::new();
        let hints = RequestHints { client_hint_width: Some(640), user_agent: None };
        let opts = normalize(&params, &derivatives(), None, None, None, hints);
        assert_eq!(opts.width, Some(640));
        assert_eq!(opts.source, OptionSource::ResponsiveHint);
    }

    #[test]
    fn valid_options_rejects_out_of_set_value_silently() {
        let mut params = HashMap::new();
        params.insert("quality".to_string(), "ultra".to_string());
        let mut valid = ValidOptionSet::new();
        valid.insert("quality".to_string(), vec!["low".to_string(), "medium".to_string(), "high".to_string(), "auto".to_string()]);
        let opts = normalize(&params, &derivatives(), Some(&valid), None, None, RequestHints::default());
        assert!(opts.quality.is_none());

        let mut params_ok = HashMap::new();
        params_ok.insert("quality".to_string(), "high".to_string());
        let opts_ok = normalize(&params_ok, &derivatives(), Some(&valid), None, None, RequestHints::default());
        assert_eq!(opts_ok.quality, Some(Quality::High));
    }

    #[test]
    fn origin_defaults_apply_only_when_unset() {
        let mut params = HashMap::new();
        params.insert("quality".to_string(), "high".to_string());
        let opts = normalize(&params, &derivatives(), None, Some(Quality::Low), None, RequestHints::default());
        assert_eq!(opts.quality, Some(Quality::High));

        let opts2 = normalize(&HashMap::new(), &derivatives(), None, Some(Quality::Low), None, RequestHints::default());
        assert_eq!(opts2.quality, Some(Quality::Low));
    }
}
