use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

use super::config::{OriginDefaults, OriginSpec, SourceSpec, SourceType};

/// A compiled source: the regex-matcher work is done once at load time so
/// the hot path never recompiles anything.
#[derive(Debug, Clone)]
pub struct Source {
    pub source_type: SourceType,
    pub url: Option<String>,
    pub auth: Option<String>,
    pub priority: i32,
}

impl From<&SourceSpec> for Source {
    fn from(spec: &SourceSpec) -> Self {
        Self {
            source_type: spec.source_type,
            url: spec.url.clone(),
            auth: spec.auth.clone(),
            priority: spec.priority,
        }
    }
}

/// A compiled origin. Held in the resolver's arena; referenced elsewhere
/// by index rather than pointer, per the arena+index design note (avoids
/// the Origin<->Source cyclic back-reference in the source format).
#[derive(Debug, Clone)]
pub struct Origin {
    pub name: String,
    pub matcher: Regex,
    pub capture_groups: Option<Vec<String>>,
    pub sources: Vec<Source>,
    pub defaults: Option<OriginDefaults>,
    pub auth: Option<String>,
}

/// Result of `match_origin_with_captures`.
#[derive(Debug, Clone)]
pub struct OriginMatch {
    pub origin_idx: usize,
    pub captures: HashMap<String, String>,
    pub original_path: String,
}

/// Result of resolving a matched origin down to one concrete source.
#[derive(Debug, Clone)]
pub struct SourceResolution {
    pub origin_type: SourceType,
    pub resolved_path: String,
    pub source_url: Option<String>,
    pub auth: Option<String>,
}

/// Filter suppressing specific sources during a retry attempt (used by the
/// pipeline's fallback-fetch chain, §4.I step 10).
#[derive(Debug, Clone, Default)]
pub struct SourceExclusion {
    pub origin_name: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_priority: Option<i32>,
}

impl SourceExclusion {
    fn excludes(&self, origin_name: &str, source: &Source) -> bool {
        if let Some(ref name) = self.origin_name {
            if name != origin_name {
                return false;
            }
        }
        if let Some(t) = self.source_type {
            if t != source.source_type {
                return false;
            }
        }
        if let Some(p) = self.source_priority {
            if p != source.priority {
                return false;
            }
        }
        true
    }
}

pub struct OriginResolver {
    origins: Vec<Origin>,
}

impl OriginResolver {
    /// Compiles every origin's matcher. A regex compile failure is logged
    /// and the origin is dropped from the arena rather than aborting
    /// startup -- matching the source's "skip, don't abort" policy.
    pub fn new(specs: &[OriginSpec]) -> Self {
        let mut origins = Vec::with_capacity(specs.len());
        for spec in specs {
            match Regex::new(&spec.matcher) {
                Ok(matcher) => origins.push(Origin {
                    name: spec.name.clone(),
                    matcher,
                    capture_groups: spec.capture_groups.clone(),
                    sources: spec.sources.iter().map(Source::from).collect(),
                    defaults: spec.defaults.clone(),
                    auth: spec.auth.clone(),
                }),
                Err(e) => {
                    warn!(origin = %spec.name, error = %e, "origin matcher failed to compile, skipping");
                }
            }
        }
        Self { origins }
    }

    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    pub fn origin(&self, idx: usize) -> Option<&Origin> {
        self.origins.get(idx)
    }

    /// First origin (in declaration order) whose matcher matches `path`.
    pub fn match_origin_with_captures(&self, path: &str) -> Option<OriginMatch> {
        for (idx, origin) in self.origins.iter().enumerate() {
            if let Some(caps) = origin.matcher.captures(path) {
                let mut captures = HashMap::new();
                for (i, name_opt) in origin.matcher.capture_names().enumerate().skip(1) {
                    if let Some(m) = caps.get(i) {
                        captures.insert(i.to_string(), m.as_str().to_string());
                        if let Some(name) = name_opt {
                            captures.insert(name.to_string(), m.as_str().to_string());
                        } else if let Some(groups) = &origin.capture_groups {
                            if let Some(group_name) = groups.get(i - 1) {
                                captures.insert(group_name.clone(), m.as_str().to_string());
                            }
                        }
                    }
                }
                return Some(OriginMatch {
                    origin_idx: idx,
                    captures,
                    original_path: path.to_string(),
                });
            }
        }
        None
    }

    /// All origins matching `path`, in declaration order -- used by the
    /// multi-origin retry chain.
    pub fn find_all_matching_origins(&self, path: &str) -> Vec<OriginMatch> {
        let mut out = Vec::new();
        for (idx, origin) in self.origins.iter().enumerate() {
            if let Some(caps) = origin.matcher.captures(path) {
                let mut captures = HashMap::new();
                for (i, name_opt) in origin.matcher.capture_names().enumerate().skip(1) {
                    if let Some(m) = caps.get(i) {
                        captures.insert(i.to_string(), m.as_str().to_string());
                        if let Some(name) = name_opt {
                            captures.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                }
                out.push(OriginMatch {
                    origin_idx: idx,
                    captures,
                    original_path: path.to_string(),
                });
            }
        }
        out
    }

    /// Resolves a matched origin down to a concrete source: sorts sources
    /// by priority, optionally prefers a given type, substitutes capture
    /// placeholders, and composes the source URL.
    pub fn resolve_path_to_source(
        &self,
        m: &OriginMatch,
        prefer_type: Option<SourceType>,
        exclude: Option<&SourceExclusion>,
    ) -> Option<SourceResolution> {
        let origin = self.origins.get(m.origin_idx)?;
        if origin.sources.is_empty() {
            return None;
        }

        let mut candidates: Vec<&Source> = origin
            .sources
            .iter()
            .filter(|s| exclude.map(|ex| !ex.excludes(&origin.name, s)).unwrap_or(true))
            .collect();
        candidates.sort_by_key(|s| s.priority);

        let chosen = if let Some(t) = prefer_type {
            candidates
                .iter()
                .find(|s| s.source_type == t)
                .or_else(|| candidates.first())
        } else {
            candidates.first()
        }?;

        let resolved_path = substitute_captures(&m.original_path, &m.captures);
        let source_url = chosen.url.as_ref().map(|base| join_url(base, &resolved_path));

        Some(SourceResolution {
            origin_type: chosen.source_type,
            resolved_path,
            source_url,
            auth: chosen.auth.clone(),
        })
    }
}

/// Replaces `{name}` placeholders in `path` with captured values. The
/// source path itself already contains the literal path, so in practice
/// this is a no-op unless the origin's source template embeds captures --
/// kept general so configs can route `/videos/{id}/master.mp4` style
/// origins to differently-shaped backend paths.
fn substitute_captures(path: &str, captures: &HashMap<String, String>) -> String {
    let mut out = path.to_string();
    for (k, v) in captures {
        out = out.replace(&format!("{{{k}}}"), v);
    }
    out
}

/// Joins a base URL and a path with exactly one `/` between them.
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::config::SourceSpec;

    fn spec(name: &str, matcher: &str, sources: Vec<SourceSpec>) -> OriginSpec {
        OriginSpec {
            name: name.to_string(),
            matcher: matcher.to_string(),
            capture_groups: None,
            sources,
            defaults: None,
            auth: None,
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let specs = vec![
            spec(
                "videos",
                r"^/videos/.*$",
                vec![SourceSpec { source_type: SourceType::Remote, url: Some("https://a.example".into()), auth: None, priority: 0 }],
            ),
            spec(
                "catch-all",
                r"^/.*$",
                vec![SourceSpec { source_type: SourceType::Remote, url: Some("https://b.example".into()), auth: None, priority: 0 }],
            ),
        ];
        let resolver = OriginResolver::new(&specs);
        let m = resolver.match_origin_with_captures("/videos/sample.mp4").unwrap();
        assert_eq!(resolver.origin(m.origin_idx).unwrap().name, "videos");
    }

    #[test]
    fn invalid_matcher_is_skipped_not_fatal() {
        let specs = vec![
            spec("broken", "(unterminated", vec![]),
            spec("ok", r"^/ok$", vec![SourceSpec { source_type: SourceType::R2, url: None, auth: None, priority: 0 }]),
        ];
        let resolver = OriginResolver::new(&specs);
        assert_eq!(resolver.origins().len(), 1);
        assert_eq!(resolver.origins()[0].name, "ok");
    }

    #[test]
    fn empty_sources_is_unmatchable_for_resolution() {
        let specs = vec![spec("empty", r"^/e$", vec![])];
        let resolver = OriginResolver::new(&specs);
        let m = resolver.match_origin_with_captures("/e").unwrap();
        assert!(resolver.resolve_path_to_source(&m, None, None).is_none());
    }

    #[test]
    fn sources_sorted_by_priority_ascending() {
        let specs = vec![spec(
            "multi",
            r"^/m$",
            vec![
                SourceSpec { source_type: SourceType::Fallback, url: Some("https://fallback.example".into()), auth: None, priority: 10 },
                SourceSpec { source_type: SourceType::Remote, url: Some("https://primary.example".into()), auth: None, priority: 0 },
            ],
        )];
        let resolver = OriginResolver::new(&specs);
        let m = resolver.match_origin_with_captures("/m").unwrap();
        let resolution = resolver.resolve_path_to_source(&m, None, None).unwrap();
        assert_eq!(resolution.origin_type, SourceType::Remote);
    }

    #[test]
    fn prefer_type_overrides_priority_order() {
        let specs = vec![spec(
            "multi",
            r"^/m$",
            vec![
                SourceSpec { source_type: SourceType::Remote, url: Some("https://primary.example".into()), auth: None, priority: 0 },
                SourceSpec { source_type: SourceType::Fallback, url: Some("https://fallback.example".into()), auth: None, priority: 10 },
            ],
        )];
        let resolver = OriginResolver::new(&specs);
        let m = resolver.match_origin_with_captures("/m").unwrap();
        let resolution = resolver
            .resolve_path_to_source(&m, Some(SourceType::Fallback), None)
            .unwrap();
        assert_eq!(resolution.origin_type, SourceType::Fallback);
    }

    #[test]
    fn join_url_inserts_exactly_one_slash() {
        assert_eq!(join_url("https://example.com/", "/videos/a.mp4"), "https://example.com/videos/a.mp4");
        assert_eq!(join_url("https://example.com", "videos/a.mp4"), "https://example.com/videos/a.mp4");
    }

    #[test]
    fn exclusion_filter_suppresses_matching_source() {
        let specs = vec![spec(
            "multi",
            r"^/m$",
            vec![
                SourceSpec { source_type: SourceType::Remote, url: Some("https://primary.example".into()), auth: None, priority: 0 },
                SourceSpec { source_type: SourceType::Fallback, url: Some("https://fallback.example".into()), auth: None, priority: 10 },
            ],
        )];
        let resolver = OriginResolver::new(&specs);
        let m = resolver.match_origin_with_captures("/m").unwrap();
        let exclusion = SourceExclusion {
            origin_name: Some("multi".into()),
            source_type: Some(SourceType::Remote),
            source_priority: None,
        };
        let resolution = resolver.resolve_path_to_source(&m, None, Some(&exclusion)).unwrap();
        assert_eq!(resolution.origin_type, SourceType::Fallback);
    }

    #[test]
    fn find_all_matching_origins_returns_every_match() {
        let specs = vec![
            spec("videos", r"^/videos/.*$", vec![SourceSpec { source_type: SourceType::R2, url: None, auth: None, priority: 0 }]),
            spec("catch-all", r"^/.*$", vec![SourceSpec { source_type: SourceType::R2, url: None, auth: None, priority: 0 }]),
        ];
        let resolver = OriginResolver::new(&specs);
        let matches = resolver.find_all_matching_origins("/videos/sample.mp4");
        assert_eq!(matches.len(), 2);
    }
}
