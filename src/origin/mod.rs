//! Origin Resolver (component A).
//!
//! Matches request paths against an ordered list of configured origins,
//! each carrying a regex matcher and a priority-ordered list of sources.
//! Mirrors the reference gateway's tiered-fallback resolver
//! (`cache/resolution.rs`) but keys on path regex rather than content
//! type, and keeps the origin arena flat (`Vec<Origin>` + index) to avoid
//! the cyclic Origin<->Source back-reference the source format implies.

mod config;
mod resolver;

pub use config::{OriginSpec, SourceSpec, SourceType};
pub use resolver::{Origin, OriginMatch, OriginResolver, SourceResolution};
