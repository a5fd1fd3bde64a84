//! threshold - edge video transformation cache proxy.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use threshold::server::AppState;
use threshold::{pipeline::ServiceContext, server, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    threshold::logging::init(&args.log_level);

    if let Err(e) = args.validate() {
        error!(error = %e, "configuration error");
        std::process::exit(1);
    }

    let document = args.load_document().unwrap_or_else(|e| {
        error!(error = %e, "failed to load config document, falling back to an empty one");
        Default::default()
    });

    info!(
        listen = %args.listen,
        transform_service_url = %args.transform_service_url,
        origins = document.origins.len(),
        derivatives = document.derivatives.len(),
        "threshold starting"
    );

    let ctx = ServiceContext::new(args, document);
    let state = Arc::new(AppState::new(ctx));

    server::run(state).await?;
    Ok(())
}
