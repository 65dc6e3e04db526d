//! Error types for the reconciler crate.
//!
//! Each pipeline stage owns its error type so callers can tell a source
//! problem from an environment problem without string matching. [`Error`]
//! wraps them for operations that span several stages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ExpectedRevision, ResourceKey, RevisionToken};

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to produce a desired-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("revision '{selector}' not found in '{repository}'")]
    NotFound {
        repository: String,
        selector: String,
    },

    #[error("access to '{repository}' denied: {reason}")]
    AuthDenied { repository: String, reason: String },

    #[error("network failure reaching '{repository}': {reason}")]
    Network { repository: String, reason: String },

    #[error("invalid manifest '{path}': {reason}")]
    InvalidManifest { path: String, reason: String },
}

impl FetchError {
    /// Transient failures are retried with backoff; everything else fails fast.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Failure to produce a live-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectorError {
    #[error("execution environment unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("permission denied listing live state: {reason}")]
    PermissionDenied { reason: String },
}

/// The sync plan could not be ordered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle between {}", format_keys(.members))]
    DependencyCycle { members: Vec<ResourceKey> },
}

/// A guarded write found the live resource at a different revision.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{key} changed concurrently: expected {expected}, found {}", format_found(.found))]
pub struct ConflictError {
    pub key: ResourceKey,
    pub expected: ExpectedRevision,
    pub found: Option<RevisionToken>,
}

/// Why a single sync action failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ActionError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("{key} rejected by the environment: {reason}")]
    Rejected { key: ResourceKey, reason: String },

    #[error("permission denied for {key}: {reason}")]
    Forbidden { key: ResourceKey, reason: String },

    #[error("environment unreachable while writing {key}: {reason}")]
    Unreachable { key: ResourceKey, reason: String },

    #[error("{key} timed out after {after_ms}ms")]
    Timeout { key: ResourceKey, after_ms: u64 },
}

/// Failure to commit a new desired-state revision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("branch '{branch}' moved: expected parent {expected}, head is {actual}")]
    Conflict {
        branch: String,
        expected: String,
        actual: String,
    },

    #[error("branch '{branch}' not found")]
    BranchNotFound { branch: String },

    #[error("commit to '{repository}' denied: {reason}")]
    AuthDenied { repository: String, reason: String },

    #[error("network failure committing to '{repository}': {reason}")]
    Network { repository: String, reason: String },

    #[error("manifest rewrite failed for '{path}': {reason}")]
    Rewrite { path: String, reason: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("promotion interrupted by shutdown")]
    Cancelled,
}

/// Errors raised by operations spanning several pipeline stages.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Collect(#[from] CollectorError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid monitor transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown application '{application}'")]
    UnknownApplication { application: String },

    #[error("event error: {reason}")]
    Event { reason: String },
}

impl Error {
    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an event error.
    pub fn event(reason: impl Into<String>) -> Self {
        Self::Event {
            reason: reason.into(),
        }
    }
}

impl From<drift_events::Error> for Error {
    fn from(err: drift_events::Error) -> Self {
        Self::event(err.to_string())
    }
}

fn format_found(found: &Option<RevisionToken>) -> String {
    found
        .as_ref()
        .map_or_else(|| "absent".to_string(), ToString::to_string)
}

fn format_keys(keys: &[ResourceKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
