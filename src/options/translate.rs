//! Vendor-parameter translation and derivative autoselect.
//!
//! Some clients speak an older `imwidth`/`imheight`/`imref` query
//! convention instead of the canonical `width`/`height`/`derivative`
//! params. This module translates those into canonical dimensions and,
//! when only a width is known, resolves the closest known derivative.

use std::collections::HashMap;

use super::TransformOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatedParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Recognizes `imwidth` / `imheight` / `imref` and maps them onto
/// canonical dimensions. Returns `None` when none of those keys are
/// present at all, so callers can tell "vendor params absent" apart from
/// "vendor params present but unparseable".
pub fn translate_vendor_params(params: &HashMap<String, String>) -> Option<TranslatedParams> {
    let has_any = params.contains_key("imwidth")
        || params.contains_key("imheight")
        || params.contains_key("imref");
    if !has_any {
        return None;
    }

    let width = params.get("imwidth").and_then(|v| v.parse::<u32>().ok());
    let height = params.get("imheight").and_then(|v| v.parse::<u32>().ok());

    // imref carries a comma-separated key=value list (e.g. "w=500,ar=16:9");
    // only the width sub-key affects normalization here.
    let imref_width = params.get("imref").and_then(|v| {
        v.split(',').find_map(|kv| {
            let (k, val) = kv.split_once('=')?;
            if k == "w" {
                val.parse::<u32>().ok()
            } else {
                None
            }
        })
    });

    Some(TranslatedParams {
        width: width.or(imref_width),
        height,
    })
}

/// Resolves a requested width to the closest known derivative: the
/// largest derivative width that does not exceed the request (a
/// breakpoint match), falling back to a percentage-distance match
/// against the nearest derivative when the request is smaller than all
/// of them. Deterministic for equal inputs via a name tie-break.
pub fn autoselect_derivative(
    derivatives: &HashMap<String, TransformOptions>,
    requested_width: u32,
) -> Option<String> {
    let mut candidates: Vec<(&str, u32)> = derivatives
        .iter()
        .filter_map(|(name, opts)| opts.width.map(|w| (name.as_str(), w)))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|(name, _)| name.to_string());

    if let Some(&(name, _)) = candidates
        .iter()
        .filter(|(_, w)| *w <= requested_width)
        .max_by_key(|(_, w)| *w)
    {
        return Some(name.to_string());
    }

    candidates
        .into_iter()
        .min_by(|(name_a, w_a), (name_b, w_b)| {
            percent_distance(*w_a, requested_width)
                .partial_cmp(&percent_distance(*w_b, requested_width))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| name_a.cmp(name_b))
        })
        .map(|(name, _)| name.to_string())
}

fn percent_distance(candidate_width: u32, requested_width: u32) -> f64 {
    let c = candidate_width as f64;
    let r = requested_width as f64;
    ((c - r).abs() / r.max(1.0)) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derivatives() -> HashMap<String, TransformOptions> {
        let mut m = HashMap::new();
        m.insert(
            "mobile".to_string(),
            TransformOptions { width: Some(480), ..Default::default() },
        );
        m.insert(
            "tablet".to_string(),
            TransformOptions { width: Some(1024), ..Default::default() },
        );
        m.insert(
            "desktop".to_string(),
            TransformOptions { width: Some(1920), ..Default::default() },
        );
        m
    }

    #[test]
    fn translates_imwidth_and_imheight() {
        let mut params = HashMap::new();
        params.insert("imwidth".to_string(), "500".to_string());
        params.insert("imheight".to_string(), "281".to_string());
        let t = translate_vendor_params(&params).unwrap();
        assert_eq!(t.width, Some(500));
        assert_eq!(t.height, Some(281));
    }

    #[test]
    fn translates_imref_width_subkey() {
        let mut params = HashMap::new();
        params.insert("imref".to_string(), "w=640,ar=16:9".to_string());
        let t = translate_vendor_params(&params).unwrap();
        assert_eq!(t.width, Some(640));
    }

    #[test]
    fn no_vendor_params_returns_none() {
        assert!(translate_vendor_params(&HashMap::new()).is_none());
    }

    #[test]
    fn breakpoint_match_picks_closest_at_or_below() {
        let name = autoselect_derivative(&derivatives(), 500).unwrap();
        assert_eq!(name, "mobile");
    }

    #[test]
    fn exact_match_picks_that_derivative() {
        let name = autoselect_derivative(&derivatives(), 1024).unwrap();
        assert_eq!(name, "tablet");
    }

    #[test]
    fn below_smallest_falls_back_to_percentage_distance() {
        let name = autoselect_derivative(&derivatives(), 100).unwrap();
        assert_eq!(name, "mobile");
    }

    #[test]
    fn deterministic_for_equal_inputs() {
        assert_eq!(
            autoselect_derivative(&derivatives(), 500),
            autoselect_derivative(&derivatives(), 500)
        );
    }

    #[test]
    fn empty_derivatives_returns_none() {
        assert!(autoselect_derivative(&HashMap::new(), 500).is_none());
    }
}
