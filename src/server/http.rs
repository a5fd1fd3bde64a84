//! HTTP server implementation.
//!
//! Raw hyper http1 over `TokioIo`, one task per accepted connection --
//! the same accept-loop shape as the reference gateway's HTTP server,
//! with the routing body replaced by the video-proxy request pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::chunklock::spawn_chunklock_sweeper;
use crate::kv::spawn_memory_kv_cleanup_task;
use crate::pipeline::{handle_video_request, ServiceContext};
use crate::streaming::ResponseBody;

/// Shared application state: one `ServiceContext` per process, handed
/// to every connection task as an `Arc`.
pub struct AppState {
    pub ctx: Arc<ServiceContext>,
}

impl AppState {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }
}

/// Starts the HTTP server: binds the listener, kicks off the
/// chunk-lock sweeper and memory-KV cleanup background tasks, then
/// loops accepting connections until the process is killed.
pub async fn run(state: Arc<AppState>) -> Result<(), crate::error::ProxyError> {
    let listener = TcpListener::bind(state.ctx.args.listen).await?;
    info!(addr = %state.ctx.args.listen, "threshold listening");

    if state.ctx.args.dev_mode {
        warn!("dev mode enabled: verbose startup logging only, there is no auth layer to relax");
    }

    spawn_chunklock_sweeper(Arc::clone(&state.ctx.chunk_locks), std::time::Duration::from_secs(state.ctx.args.chunk_lock_sweep_secs));
    info!("chunk lock sweeper started");

    spawn_memory_kv_cleanup_task(Arc::clone(&state.ctx.memory_kv), std::time::Duration::from_secs(60));
    info!("memory KV cleanup task started");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!(%addr, error = %err, "error serving connection");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "error accepting connection");
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    _addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<hyper::Response<ResponseBody>, hyper::Error> {
    Ok(handle_video_request(Arc::clone(&state.ctx), req).await)
}
