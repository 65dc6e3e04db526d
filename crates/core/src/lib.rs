//! Core types, errors, and configuration shared by the drift crates.
//!
//! - [`Error`] / [`Result`]: typed, recoverable errors for I/O and parsing
//! - [`ResultExt`]: logging combinators so callers never need `unwrap`
//! - [`config`]: the `drift.toml` schema and loader

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{
    ApplicationConfig, CollectorSettings, ConflictPolicy, DriftConfig, FetchSettings,
    ImageConfig, MonitorSettings, PromotionSettings, ReconcilerSettings, RevisionSelectorConfig,
};
pub use error::Error;
pub use result::{Result, ResultExt};
