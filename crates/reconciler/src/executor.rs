//! Sync executor: applies a plan to the execution environment.
//!
//! Actions run strictly in plan order, one at a time. Every write carries
//! the revision the plan observed, so a concurrent external change turns
//! into a per-action conflict instead of being overwritten. A failed action
//! never stops the rest of the plan unless abort-on-failure is configured.

use std::sync::Arc;
use std::time::{Duration, Instant};

use drift_events::CycleStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::diff::ComparatorRegistry;
use crate::environment::{EnvError, ExecutionEnvironment, WriteRequest};
use crate::error::{ActionError, ConflictError};
use crate::planner::{ActionKind, SyncAction, SyncPlan};
use crate::stop::StopSignal;
use crate::types::{
    ExpectedRevision, LiveResource, ResourceKey, RevisionToken, APPLICATION_LABEL,
    LAST_APPLIED_ANNOTATION, MANAGED_BY_LABEL,
};

/// Why an action was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Shutdown was requested before the action started.
    Cancelled,
    /// An earlier action failed and abort-on-failure is set.
    AbortedAfterFailure,
    /// Prune withheld because a create or update failed.
    ApplyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Applied,
    Skipped(SkipReason),
    Failed(ActionError),
}

/// Result of one planned action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    pub key: ResourceKey,
    pub status: ActionStatus,
    /// Revision assigned by a successful create or update.
    pub new_revision: Option<RevisionToken>,
    pub duration_ms: u64,
}

impl ActionOutcome {
    fn skipped(action: &SyncAction, reason: SkipReason) -> Self {
        Self {
            kind: action.kind,
            key: action.key.clone(),
            status: ActionStatus::Skipped(reason),
            new_revision: None,
            duration_ms: 0,
        }
    }
}

/// Outcomes of a whole plan, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub outcomes: Vec<ActionOutcome>,
}

impl SyncResult {
    pub fn applied(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Applied))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Skipped(_)))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed(ActionError::Conflict(_))))
    }

    /// Overall status given how many resources were left for attention.
    pub fn status(&self, attention: usize) -> CycleStatus {
        let incomplete = self.failed().saturating_add(self.skipped());
        if incomplete == 0 {
            if attention == 0 {
                CycleStatus::Synced
            } else {
                CycleStatus::PartiallySynced
            }
        } else if self.applied() == 0 {
            CycleStatus::Failed
        } else {
            CycleStatus::PartiallySynced
        }
    }

    fn count(&self, predicate: impl Fn(&ActionStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub manager: String,
    pub action_timeout: Duration,
    pub abort_on_failure: bool,
}

/// Applies sync plans.
pub struct SyncExecutor {
    env: Arc<dyn ExecutionEnvironment>,
    comparators: Arc<ComparatorRegistry>,
    options: ExecutorOptions,
}

impl SyncExecutor {
    pub fn new(
        env: Arc<dyn ExecutionEnvironment>,
        comparators: Arc<ComparatorRegistry>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            env,
            comparators,
            options,
        }
    }

    /// Execute `plan`, checking `stop` between actions.
    pub async fn execute(&self, plan: &SyncPlan, stop: &StopSignal) -> SyncResult {
        let mut outcomes = Vec::with_capacity(plan.len());
        let mut apply_failed = false;
        let mut aborted = false;

        for action in &plan.actions {
            if stop.is_stopped() {
                outcomes.push(ActionOutcome::skipped(action, SkipReason::Cancelled));
                continue;
            }
            if aborted {
                outcomes.push(ActionOutcome::skipped(action, SkipReason::AbortedAfterFailure));
                continue;
            }
            if action.kind.is_prune() && plan.gate_prunes && apply_failed {
                outcomes.push(ActionOutcome::skipped(action, SkipReason::ApplyFailed));
                continue;
            }

            let started = Instant::now();
            let result = self.execute_action(plan, action).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let outcome = match result {
                Ok(new_revision) => {
                    info!(
                        application = %plan.application,
                        action = action.kind.as_str(),
                        key = %action.key,
                        duration_ms,
                        "Action applied"
                    );
                    ActionOutcome {
                        kind: action.kind,
                        key: action.key.clone(),
                        status: ActionStatus::Applied,
                        new_revision,
                        duration_ms,
                    }
                }
                Err(err) => {
                    warn!(
                        application = %plan.application,
                        action = action.kind.as_str(),
                        key = %action.key,
                        error = %err,
                        "Action failed"
                    );
                    if !action.kind.is_prune() {
                        apply_failed = true;
                    }
                    aborted = self.options.abort_on_failure;
                    ActionOutcome {
                        kind: action.kind,
                        key: action.key.clone(),
                        status: ActionStatus::Failed(err),
                        new_revision: None,
                        duration_ms,
                    }
                }
            };
            outcomes.push(outcome);
        }

        SyncResult { outcomes }
    }

    async fn execute_action(
        &self,
        plan: &SyncPlan,
        action: &SyncAction,
    ) -> Result<Option<RevisionToken>, ActionError> {
        let timeout = self.options.action_timeout;
        tokio::time::timeout(timeout, self.perform(plan, action))
            .await
            .map_err(|_| ActionError::Timeout {
                key: action.key.clone(),
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    async fn perform(
        &self,
        plan: &SyncPlan,
        action: &SyncAction,
    ) -> Result<Option<RevisionToken>, ActionError> {
        let key = &action.key;
        let current = self
            .env
            .get(key)
            .await
            .map_err(|e| action_error(key, &action.guard, e))?;
        verify_guard(key, &action.guard, current.as_ref())?;
        debug!(key = %key, action = action.kind.as_str(), "Guard verified");

        match (&action.kind, &action.guard) {
            (ActionKind::Create, _) => self
                .env
                .create(self.write_request(plan, action)?)
                .await
                .map(Some),
            (ActionKind::Update, ExpectedRevision::At(expected)) => self
                .env
                .update(self.write_request(plan, action)?, expected)
                .await
                .map(Some),
            (ActionKind::Prune, ExpectedRevision::At(expected)) => self
                .env
                .delete(key, expected, &self.options.manager)
                .await
                .map(|()| None),
            (ActionKind::Update | ActionKind::Prune, ExpectedRevision::Absent) => {
                return Err(ActionError::Rejected {
                    key: key.clone(),
                    reason: format!("{} requires an observed revision", action.kind.as_str()),
                });
            }
        }
        .map_err(|e| action_error(key, &action.guard, e))
    }

    /// Declared content stamped with drift's markers.
    fn write_request(&self, plan: &SyncPlan, action: &SyncAction) -> Result<WriteRequest, ActionError> {
        let spec = action.spec.as_ref().ok_or_else(|| ActionError::Rejected {
            key: action.key.clone(),
            reason: "no declared content".into(),
        })?;
        let fingerprint = self.comparators.fingerprint(&spec.key, &spec.content);
        let mut content = spec.content.clone();
        set_metadata_entry(&mut content, "labels", MANAGED_BY_LABEL, &self.options.manager);
        set_metadata_entry(&mut content, "labels", APPLICATION_LABEL, plan.application.as_str());
        set_metadata_entry(&mut content, "annotations", LAST_APPLIED_ANNOTATION, &fingerprint);

        Ok(WriteRequest {
            key: action.key.clone(),
            content,
            manager: self.options.manager.clone(),
        })
    }
}

fn verify_guard(
    key: &ResourceKey,
    guard: &ExpectedRevision,
    current: Option<&LiveResource>,
) -> Result<(), ConflictError> {
    let holds = match (guard, current) {
        (ExpectedRevision::Absent, None) => true,
        (ExpectedRevision::At(expected), Some(live)) => live.revision == *expected,
        _ => false,
    };
    if holds {
        Ok(())
    } else {
        Err(ConflictError {
            key: key.clone(),
            expected: guard.clone(),
            found: current.map(|live| live.revision.clone()),
        })
    }
}

fn action_error(key: &ResourceKey, guard: &ExpectedRevision, err: EnvError) -> ActionError {
    let conflict = |found| {
        ActionError::Conflict(ConflictError {
            key: key.clone(),
            expected: guard.clone(),
            found,
        })
    };
    match err {
        EnvError::AlreadyExists { found, .. } | EnvError::RevisionMismatch { found, .. } => {
            conflict(Some(found))
        }
        EnvError::NotFound { .. } => conflict(None),
        EnvError::Forbidden { reason } => ActionError::Forbidden {
            key: key.clone(),
            reason,
        },
        EnvError::Rejected { reason } => ActionError::Rejected {
            key: key.clone(),
            reason,
        },
        EnvError::Unreachable { reason } => ActionError::Unreachable {
            key: key.clone(),
            reason,
        },
    }
}

fn set_metadata_entry(content: &mut Value, section: &str, name: &str, value: &str) {
    let Value::Object(root) = content else {
        return;
    };
    let metadata = root.entry("metadata").or_insert_with(|| json!({}));
    let Value::Object(metadata) = metadata else {
        return;
    };
    let entries = metadata.entry(section).or_insert_with(|| json!({}));
    if let Value::Object(entries) = entries {
        entries.insert(name.to_string(), Value::String(value.to_string()));
    }
}
