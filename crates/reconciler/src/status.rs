//! Per-application status: monitor phase, recent cycle history and
//! operator-visible alerts.

use std::collections::{HashMap, VecDeque};

use drift_events::{Alert, AlertKind, ApplicationId, CycleStatus, CycleSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::cycle::CycleReport;
use crate::error::{Error, Result};
use crate::types::ResourceKey;

/// Where an application is in its reconcile lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MonitorPhase {
    #[default]
    Idle,
    Reconciling,
    Synced,
    PartiallySynced,
    Failed,
}

impl MonitorPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reconciling => "reconciling",
            Self::Synced => "synced",
            Self::PartiallySynced => "partially_synced",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::PartiallySynced | Self::Failed)
    }

    /// Valid moves: a cycle starts from idle or a finished cycle, ends in
    /// one of the three outcomes, and finished cycles settle back to idle.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Idle, Self::Reconciling) => true,
            (Self::Reconciling, next) => next.is_terminal(),
            (current, Self::Idle | Self::Reconciling) => current.is_terminal(),
            _ => false,
        }
    }
}

impl From<CycleStatus> for MonitorPhase {
    fn from(status: CycleStatus) -> Self {
        match status {
            CycleStatus::Synced => Self::Synced,
            CycleStatus::PartiallySynced => Self::PartiallySynced,
            CycleStatus::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub application: ApplicationId,
    pub phase: MonitorPhase,
    pub last_report: Option<CycleReport>,
    /// Most recent cycles, oldest first.
    pub history: VecDeque<CycleSummary>,
    /// Cycles in a row that ended short of a clean sync.
    pub consecutive_failures: u32,
    pub last_synced_revision: Option<String>,
    pub attention: Vec<ResourceKey>,
}

impl ApplicationStatus {
    fn new(application: ApplicationId) -> Self {
        Self {
            application,
            phase: MonitorPhase::Idle,
            last_report: None,
            history: VecDeque::new(),
            consecutive_failures: 0,
            last_synced_revision: None,
            attention: Vec::new(),
        }
    }
}

/// Shared status registry.
pub struct StatusStore {
    apps: RwLock<HashMap<ApplicationId, ApplicationStatus>>,
    alerts: RwLock<HashMap<(AlertKind, String), Alert>>,
    history_limit: usize,
}

impl StatusStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Move `application` to `next`, registering it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] for moves the lifecycle forbids.
    pub async fn transition(&self, application: &ApplicationId, next: MonitorPhase) -> Result<()> {
        let mut apps = self.apps.write().await;
        let status = apps
            .entry(application.clone())
            .or_insert_with(|| ApplicationStatus::new(application.clone()));
        if !status.phase.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: status.phase.to_string(),
                to: next.to_string(),
            });
        }
        debug!(application = %application, from = %status.phase, to = %next, "Phase transition");
        status.phase = next;
        Ok(())
    }

    /// Record a finished cycle.
    pub async fn record(&self, report: &CycleReport) {
        let mut apps = self.apps.write().await;
        let status = apps
            .entry(report.application.clone())
            .or_insert_with(|| ApplicationStatus::new(report.application.clone()));

        status.history.push_back(report.summary());
        while status.history.len() > self.history_limit {
            status.history.pop_front();
        }
        if report.needs_retry() {
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        } else {
            status.consecutive_failures = 0;
        }
        if report.status == CycleStatus::Synced {
            status.last_synced_revision.clone_from(&report.revision);
        }
        status.attention.clone_from(&report.attention);
        status.last_report = Some(report.clone());
    }

    pub async fn status(&self, application: &ApplicationId) -> Option<ApplicationStatus> {
        self.apps.read().await.get(application).cloned()
    }

    pub async fn phase(&self, application: &ApplicationId) -> Option<MonitorPhase> {
        self.apps.read().await.get(application).map(|s| s.phase)
    }

    pub async fn consecutive_failures(&self, application: &ApplicationId) -> u32 {
        self.apps
            .read()
            .await
            .get(application)
            .map_or(0, |s| s.consecutive_failures)
    }

    pub async fn attention(&self, application: &ApplicationId) -> Vec<ResourceKey> {
        self.apps
            .read()
            .await
            .get(application)
            .map(|s| s.attention.clone())
            .unwrap_or_default()
    }

    /// Statuses of every known application, by id.
    pub async fn all(&self) -> Vec<ApplicationStatus> {
        let mut all: Vec<ApplicationStatus> = self.apps.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.application.cmp(&b.application));
        all
    }

    /// Raise an alert. Returns false if the same alert is already active.
    pub async fn raise_alert(&self, alert: Alert) -> bool {
        let mut alerts = self.alerts.write().await;
        let key = (alert.kind, alert.subject.clone());
        if alerts.contains_key(&key) {
            return false;
        }
        alerts.insert(key, alert);
        true
    }

    /// Clear an alert. Returns false if it was not active.
    pub async fn clear_alert(&self, kind: AlertKind, subject: &str) -> bool {
        self.alerts
            .write()
            .await
            .remove(&(kind, subject.to_string()))
            .is_some()
    }

    /// Active alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.read().await.values().cloned().collect();
        alerts.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then_with(|| a.subject.cmp(&b.subject)));
        alerts
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn report(app: &str, status: CycleStatus) -> CycleReport {
        CycleReport {
            status,
            ..CycleReport::empty(ApplicationId::new(app), Some("r1".into()), Utc::now())
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use MonitorPhase::*;
        assert!(Idle.can_transition_to(Reconciling));
        assert!(Reconciling.can_transition_to(Synced));
        assert!(Reconciling.can_transition_to(Failed));
        assert!(Synced.can_transition_to(Idle));
        assert!(PartiallySynced.can_transition_to(Reconciling));
        assert!(!Idle.can_transition_to(Synced));
        assert!(!Reconciling.can_transition_to(Idle));
        assert!(!Reconciling.can_transition_to(Reconciling));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = StatusStore::new(5);
        let app = ApplicationId::new("web");
        assert!(store.transition(&app, MonitorPhase::Reconciling).await.is_ok());
        let err = store.transition(&app, MonitorPhase::Idle).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.phase(&app).await, Some(MonitorPhase::Reconciling));
    }

    #[tokio::test]
    async fn history_is_bounded_and_failures_counted() {
        let store = StatusStore::new(2);
        let app = ApplicationId::new("web");
        store.record(&report("web", CycleStatus::Failed)).await;
        store.record(&report("web", CycleStatus::Failed)).await;
        assert_eq!(store.consecutive_failures(&app).await, 2);

        store.record(&report("web", CycleStatus::Synced)).await;
        let status = store.status(&app).await.unwrap();
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_synced_revision.as_deref(), Some("r1"));
        assert_eq!(status.history.back().map(|s| s.status), Some(CycleStatus::Synced));
    }

    #[tokio::test]
    async fn alerts_are_deduplicated() {
        let store = StatusStore::new(2);
        let alert = Alert::new(AlertKind::PromotionStalled, None, "reg/web:v2", "stuck");
        assert!(store.raise_alert(alert.clone()).await);
        assert!(!store.raise_alert(alert).await);
        assert_eq!(store.alerts().await.len(), 1);

        assert!(store.clear_alert(AlertKind::PromotionStalled, "reg/web:v2").await);
        assert!(!store.clear_alert(AlertKind::PromotionStalled, "reg/web:v2").await);
        assert!(store.alerts().await.is_empty());
    }
}
