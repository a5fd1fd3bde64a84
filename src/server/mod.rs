//! HTTP server wiring: the hyper accept loop (`http`) and the
//! liveness/version probes ops tooling expects alongside it (`health`).

mod health;
mod http;

pub use health::{health_response, version_response};
pub use http::{run, AppState};
