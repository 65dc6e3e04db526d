//! # drift - command line entry point
//!
//! Loads `drift.toml`, then runs one of:
//!
//! 1. **check-config** - validate configuration and source manifests
//! 2. **plan** - preview the actions a sync would take
//! 3. **run** - reconcile once, or keep reconciling until Ctrl+C
//! 4. **promote** - write a new image tag into the source
//!
//! ## Shutdown
//!
//! Ctrl+C stops every worker at its next action boundary; live state is
//! saved before exit.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drift::cli::Cli;
use drift::commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    execute_command(Cli::parse()).await
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
