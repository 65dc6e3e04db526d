//! Reports produced by reconciliation cycles.

use chrono::{DateTime, Utc};
use drift_events::{ApplicationId, CycleStatus, CycleSummary};
use serde::{Deserialize, Serialize};

use crate::diff::{DeltaCounts, DeltaStatus, ResourceDelta};
use crate::executor::{ActionOutcome, ActionStatus, SyncResult};
use crate::planner::SyncPlan;
use crate::types::ResourceKey;

/// Per-resource line of a cycle report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub key: ResourceKey,
    pub delta: DeltaStatus,
    pub changed_paths: Vec<String>,
    /// What happened to the planned action, if one was planned.
    pub outcome: Option<ActionStatus>,
}

/// Everything one reconciliation cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub application: ApplicationId,
    /// Desired-state revision, absent when fetching failed.
    pub revision: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub counts: DeltaCounts,
    pub resources: Vec<ResourceReport>,
    pub outcomes: Vec<ActionOutcome>,
    pub attention: Vec<ResourceKey>,
    pub withheld_prunes: Vec<ResourceKey>,
    pub status: CycleStatus,
    /// Why the cycle ended before executing, if it did.
    pub error: Option<String>,
}

impl CycleReport {
    /// A report with nothing planned or executed.
    pub fn empty(application: ApplicationId, revision: Option<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            application,
            revision,
            started_at,
            duration_ms: 0,
            counts: DeltaCounts::default(),
            resources: Vec::new(),
            outcomes: Vec::new(),
            attention: Vec::new(),
            withheld_prunes: Vec::new(),
            status: CycleStatus::Synced,
            error: None,
        }
    }

    /// A cycle that stopped before touching the environment.
    pub fn aborted(
        application: ApplicationId,
        revision: Option<String>,
        started_at: DateTime<Utc>,
        error: impl ToString,
    ) -> Self {
        Self {
            status: CycleStatus::Failed,
            error: Some(error.to_string()),
            ..Self::empty(application, revision, started_at)
        }
    }

    /// Assemble the report of an executed plan.
    pub fn executed(
        started_at: DateTime<Utc>,
        deltas: &[ResourceDelta],
        plan: SyncPlan,
        result: SyncResult,
    ) -> Self {
        let resources = deltas
            .iter()
            .map(|delta| ResourceReport {
                key: delta.key.clone(),
                delta: delta.status,
                changed_paths: delta.changed_paths.clone(),
                outcome: result
                    .outcomes
                    .iter()
                    .find(|o| o.key == delta.key)
                    .map(|o| o.status.clone()),
            })
            .collect();
        let status = result.status(plan.attention.len());

        Self {
            application: plan.application,
            revision: Some(plan.revision),
            started_at,
            duration_ms: 0,
            counts: DeltaCounts::from_deltas(deltas),
            resources,
            outcomes: result.outcomes,
            attention: plan.attention,
            withheld_prunes: plan.withheld_prunes,
            status,
            error: None,
        }
    }

    fn count(&self, predicate: impl Fn(&ActionStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Applied))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Skipped(_)))
    }

    /// A cycle short of a clean sync is retried with backoff.
    pub fn needs_retry(&self) -> bool {
        self.status != CycleStatus::Synced || !self.attention.is_empty()
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            application: self.application.clone(),
            revision: self.revision.clone(),
            status: self.status,
            planned: self.outcomes.len(),
            applied: self.applied(),
            skipped: self.skipped(),
            failed: self.failed(),
            attention: self.attention.len(),
            duration_ms: self.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_report_is_failed_and_retried() {
        let report = CycleReport::aborted(ApplicationId::new("web"), None, Utc::now(), "boom");
        assert_eq!(report.status, CycleStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("boom"));
        assert!(report.needs_retry());
    }

    #[test]
    fn attention_alone_needs_retry() {
        let report = CycleReport {
            attention: vec![ResourceKey::namespaced("ConfigMap", "prod", "cfg")],
            ..CycleReport::empty(ApplicationId::new("web"), Some("r1".into()), Utc::now())
        };
        assert!(report.needs_retry());
        assert_eq!(report.summary().attention, 1);
    }
}
