#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drift
//!
//! GitOps reconciliation engine. The `drift` binary wires the workspace
//! crates to a directory of manifests and a persisted live state.

pub use drift_core;
pub use drift_events;
pub use drift_reconciler;

pub mod cli;
pub mod commands;
pub mod directory;
pub mod live_state;

use tracing::{error, info};

/// Wait for shutdown signal (Ctrl+C).
pub async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
