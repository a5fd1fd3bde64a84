//! Logging infrastructure.
//!
//! `tracing` + `tracing-subscriber`, initialized once from `main.rs`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `log_level` is the default
/// verbosity for this crate's own spans; `RUST_LOG` always wins if set.
pub fn init(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("threshold={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
