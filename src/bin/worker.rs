//! threshold-worker - standalone maintenance loop for the chunk lock
//! table and the in-process memory KV store.
//!
//! The in-memory KV backend is process-local, so this binary only
//! demonstrates the sweeper/cleanup loop against its own store rather
//! than sharing state with a running `threshold` process -- a real
//! deployment backed by a shared external KV would run this loop
//! against that shared store instead (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use threshold::chunklock::{spawn_chunklock_sweeper, ChunkLockManager};
use threshold::kv::{spawn_memory_kv_cleanup_task, MemoryKvStore};
use threshold::Args;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    threshold::logging::init(&args.log_level);

    if let Err(e) = args.validate() {
        error!(error = %e, "configuration error");
        std::process::exit(1);
    }

    info!(
        chunk_lock_capacity = args.chunk_lock_capacity,
        chunk_lock_sweep_secs = args.chunk_lock_sweep_secs,
        kv_max_bytes = args.kv_max_bytes,
        "threshold-worker starting"
    );

    let chunk_locks = Arc::new(ChunkLockManager::new(args.chunk_lock_capacity, Duration::from_secs(args.chunk_lock_ttl_secs)));
    let memory_kv = Arc::new(MemoryKvStore::new(args.kv_max_bytes));

    spawn_chunklock_sweeper(Arc::clone(&chunk_locks), Duration::from_secs(args.chunk_lock_sweep_secs));
    spawn_memory_kv_cleanup_task(Arc::clone(&memory_kv), Duration::from_secs(60));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    info!("threshold-worker shutting down");
}
