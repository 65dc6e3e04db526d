//! Configuration for drift, loaded from `drift.toml`.
//!
//! Every field has a serde default so a minimal file only needs to declare
//! its `[[applications]]`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// What to do when a live resource was changed by someone other than drift
/// since drift last applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave the resource alone and report it as needing operator attention.
    #[default]
    Flag,
    /// Overwrite the external change with the declared state.
    Override,
}

/// Which revision of a source an application tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionSelectorConfig {
    Branch(String),
    Tag(String),
    Commit(String),
}

impl Default for RevisionSelectorConfig {
    fn default() -> Self {
        Self::Branch(default_branch())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    #[serde(default)]
    pub fetch: FetchSettings,

    #[serde(default)]
    pub collector: CollectorSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub promotion: PromotionSettings,

    /// Applications under management.
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,

    /// Images whose build artifacts are promoted into desired state.
    #[serde(default)]
    pub images: Vec<ImageConfig>,
}

/// Sync behaviour of a reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    /// Field manager name written on every applied resource.
    #[serde(default = "default_manager")]
    pub manager: String,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Allow removal of managed resources that left desired state.
    #[serde(default)]
    pub prune: bool,

    /// React to live drift immediately instead of waiting for the next tick.
    #[serde(default)]
    pub self_heal: bool,

    /// Let prunes run even when a create or update in the same cycle failed.
    #[serde(default)]
    pub interleave_prunes: bool,

    /// Stop executing the plan at the first failed action.
    #[serde(default)]
    pub abort_on_failure: bool,

    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            manager: default_manager(),
            conflict_policy: ConflictPolicy::default(),
            prune: false,
            self_heal: false,
            interleave_prunes: false,
            abort_on_failure: false,
            action_timeout_ms: default_action_timeout_ms(),
        }
    }
}

impl ReconcilerSettings {
    #[must_use]
    pub const fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Retry behaviour of the state fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_fetch_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_fetch_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Number of parsed desired-state snapshots kept in memory.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_fetch_attempts(),
            base_backoff_ms: default_fetch_base_backoff_ms(),
            max_backoff_ms: default_fetch_max_backoff_ms(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Snapshot behaviour of the live-state collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// How many times to re-list when the environment moved mid-snapshot.
    #[serde(default = "default_max_relists")]
    pub max_relists: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_relists: default_max_relists(),
        }
    }
}

/// Scheduling of the drift monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_retry_base_backoff_ms")]
    pub retry_base_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    /// Cycle reports kept per application.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            retry_base_backoff_ms: default_retry_base_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl MonitorSettings {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Retry and alerting behaviour of the image promotion coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionSettings {
    #[serde(default = "default_promotion_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_promotion_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// How long publishing may keep failing before an alert is raised.
    #[serde(default = "default_alert_after_ms")]
    pub alert_after_ms: u64,
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_promotion_base_backoff_ms(),
            max_backoff_ms: default_promotion_max_backoff_ms(),
            alert_after_ms: default_alert_after_ms(),
        }
    }
}

impl PromotionSettings {
    #[must_use]
    pub const fn alert_after(&self) -> Duration {
        Duration::from_millis(self.alert_after_ms)
    }
}

/// One independently reconciled application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub id: String,

    /// Identity of the version-controlled source holding its manifests.
    pub repository: String,

    #[serde(default)]
    pub revision: RevisionSelectorConfig,

    /// Namespaces the collector lists; empty means cluster-wide.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// An image tracked for promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Registry location without tag, e.g. `registry.example.com/web`.
    pub image: String,

    /// Applications whose manifests reference the image.
    pub applications: Vec<String>,
}

impl DriftConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML or fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.reconciler.manager.trim().is_empty() {
            return Err(Error::invalid_config("reconciler.manager must not be empty"));
        }
        if self.reconciler.action_timeout_ms == 0 {
            return Err(Error::invalid_config(
                "reconciler.action_timeout_ms must be greater than 0",
            ));
        }
        if self.fetch.max_attempts == 0 {
            return Err(Error::invalid_config("fetch.max_attempts must be at least 1"));
        }
        if self.fetch.base_backoff_ms > self.fetch.max_backoff_ms {
            return Err(Error::invalid_config(
                "fetch.base_backoff_ms must not exceed fetch.max_backoff_ms",
            ));
        }
        if self.monitor.interval_ms == 0 {
            return Err(Error::invalid_config("monitor.interval_ms must be greater than 0"));
        }
        if self.monitor.retry_base_backoff_ms > self.monitor.retry_max_backoff_ms {
            return Err(Error::invalid_config(
                "monitor.retry_base_backoff_ms must not exceed monitor.retry_max_backoff_ms",
            ));
        }
        if self.monitor.history_limit == 0 {
            return Err(Error::invalid_config("monitor.history_limit must be at least 1"));
        }
        if self.promotion.base_backoff_ms > self.promotion.max_backoff_ms {
            return Err(Error::invalid_config(
                "promotion.base_backoff_ms must not exceed promotion.max_backoff_ms",
            ));
        }

        let mut seen = HashSet::new();
        for app in &self.applications {
            if app.id.trim().is_empty() {
                return Err(Error::invalid_config("application id must not be empty"));
            }
            if app.repository.trim().is_empty() {
                return Err(Error::invalid_config(format!(
                    "application '{}' has no repository",
                    app.id
                )));
            }
            if !seen.insert(app.id.as_str()) {
                return Err(Error::invalid_config(format!(
                    "duplicate application id '{}'",
                    app.id
                )));
            }
        }

        for image in &self.images {
            let last_segment = image.image.rsplit('/').next().unwrap_or_default();
            if image.image.trim().is_empty() || last_segment.contains(':') {
                return Err(Error::invalid_config(format!(
                    "image '{}' must be a registry location without a tag",
                    image.image
                )));
            }
            for app_id in &image.applications {
                let app = self
                    .application(app_id)
                    .ok_or_else(|| {
                        Error::invalid_config(format!(
                            "image '{}' references unknown application '{app_id}'",
                            image.image
                        ))
                    })?;
                if !matches!(app.revision, RevisionSelectorConfig::Branch(_)) {
                    return Err(Error::invalid_config(format!(
                        "image '{}' promotes into application '{app_id}' which does not track a branch",
                        image.image
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up an application by id.
    #[must_use]
    pub fn application(&self, id: &str) -> Option<&ApplicationConfig> {
        self.applications.iter().find(|app| app.id == id)
    }
}

fn default_manager() -> String {
    "drift".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

const fn default_action_timeout_ms() -> u64 {
    30_000
}

const fn default_fetch_attempts() -> u32 {
    4
}

const fn default_fetch_base_backoff_ms() -> u64 {
    200
}

const fn default_fetch_max_backoff_ms() -> u64 {
    5_000
}

const fn default_cache_capacity() -> u64 {
    64
}

const fn default_max_relists() -> u32 {
    3
}

const fn default_interval_ms() -> u64 {
    180_000
}

const fn default_retry_base_backoff_ms() -> u64 {
    5_000
}

const fn default_retry_max_backoff_ms() -> u64 {
    180_000
}

const fn default_history_limit() -> usize {
    50
}

const fn default_promotion_base_backoff_ms() -> u64 {
    1_000
}

const fn default_promotion_max_backoff_ms() -> u64 {
    60_000
}

const fn default_alert_after_ms() -> u64 {
    600_000
}
