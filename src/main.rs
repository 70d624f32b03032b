//! media-broker server binary
//!
//! Usage: `media-broker [config.json]`. Without an argument the built-in defaults are
//! used. Log verbosity follows `RUST_LOG` (default `info`).

use media_broker::{Config, FetchBroker, run_with_shutdown};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "media-broker exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> media_broker::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            Config::from_file(&path)?
        }
        None => Config::default(),
    };

    let broker = FetchBroker::new(config).await?;
    run_with_shutdown(Arc::new(broker)).await
}
