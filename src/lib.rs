//! # media-broker
//!
//! Network-facing media fetch broker. A request names one or more media URLs and an
//! output format; the broker projects the transfer size with the external fetch tool,
//! rejects requests that are over budget before any fetch starts, runs one fetch for
//! the whole batch, bundles multiple results into a single archive, and streams the
//! deliverable back. Artifacts are deleted as soon as the response is dropped, and a
//! periodic sweep evicts anything left behind.
//!
//! A separate background loop keeps a dynamic DNS record pointed at the host's public
//! address, backing off exponentially while the update endpoint fails.
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_broker::{Config, FetchBroker};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = FetchBroker::new(Config::default()).await?;
//!
//!     let mut events = broker.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let deliverable = broker
//!         .submit(["https://example.com/watch?v=abc"], Some("audio"))
//!         .await?;
//!     println!("ready: {}", deliverable.path.display());
//!
//!     // Dropping the lease deletes every artifact of the request
//!     drop(deliverable);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// HTTP API module
pub mod api;
/// Multi-artifact archiving
pub mod bundler;
/// Request orchestration and admission control
pub mod broker;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Transfer size projection
pub mod estimator;
/// External fetch tool invocation
pub mod fetcher;
/// Dynamic DNS heartbeat
pub mod heartbeat;
/// Artifact deletion, ownership, and eviction
pub mod lifecycle;
/// External command execution
pub mod process;
/// Core types and events
pub mod types;
/// Filesystem helpers
pub mod utils;

// Re-export commonly used types
pub use broker::{Deliverable, FetchBroker, ToolPaths};
pub use config::Config;
pub use error::{ApiError, Error, ErrorDetail, Result, ToHttpStatus, ValidationError};
pub use heartbeat::{DdnsClient, DynamicDns, HeartbeatUpdater, RetryState};
pub use lifecycle::{ArtifactLease, ArtifactLifecycle, ArtifactRegistry};
pub use process::{CommandOutcome, CommandOutput, CommandRunner, ProcessRunner};
pub use types::{Event, FetchRequest, MediaFormat, RequestId, SizeEstimate};

use std::sync::Arc;

/// Run the broker's background tasks and API server until a termination signal.
///
/// Starts the eviction sweep, the heartbeat (if enabled), and the HTTP server, then
/// waits for a termination signal and stops all of them. Returns early with the
/// server's error if the server cannot start.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use media_broker::{Config, FetchBroker, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = FetchBroker::new(Config::default()).await?;
///     run_with_shutdown(Arc::new(broker)).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(broker: Arc<FetchBroker>) -> Result<()> {
    let background = broker.start_background_tasks()?;
    let mut server = tokio::spawn(api::start_api_server(Arc::clone(&broker)));

    let early_exit = tokio::select! {
        _ = wait_for_signal() => None,
        joined = &mut server => Some(joined),
    };

    broker.shutdown();

    let server_result = match early_exit {
        Some(joined) => joined,
        None => server.await,
    };

    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    server_result.map_err(|e| Error::ApiServerError(e.to_string()))?
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
