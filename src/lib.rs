//! threshold - edge video transformation cache proxy.
//!
//! Resolves a request path to an origin source, normalizes transform
//! options, and serves a transformed result from a chunked KV cache,
//! falling back to an upstream media transformation service on a miss.
//! Concurrent requests for the same transform are coalesced; range
//! requests are served directly from the cache's chunk layout.

pub mod cachekey;
pub mod chunklock;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod kv;
pub mod logging;
pub mod options;
pub mod origin;
pub mod pipeline;
pub mod range;
pub mod server;
pub mod streaming;
pub mod upstream;

pub use config::Args;
pub use error::{ProxyError, Result};
pub use server::{run, AppState};
