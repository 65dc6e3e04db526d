//! Execution environments: where live resources run.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::types::{LiveResource, ResourceKey, RevisionToken, APPLICATION_LABEL};

/// Which part of the environment a list call covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    /// Everything, namespaced and cluster-scoped.
    All,
    /// Cluster-scoped resources only.
    ClusterScoped,
    /// Resources in one namespace.
    Namespace(String),
}

impl ListScope {
    fn covers(&self, key: &ResourceKey) -> bool {
        match self {
            Self::All => true,
            Self::ClusterScoped => key.namespace.is_none(),
            Self::Namespace(ns) => key.namespace.as_deref() == Some(ns.as_str()),
        }
    }
}

/// Label equality selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    #[must_use]
    pub fn with(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(label.into(), value.into());
        self
    }

    pub fn matches(&self, content: &Value) -> bool {
        let labels = content.get("metadata").and_then(|m| m.get("labels"));
        self.match_labels.iter().all(|(label, expected)| {
            labels
                .and_then(|l| l.get(label))
                .and_then(Value::as_str)
                == Some(expected.as_str())
        })
    }
}

/// Result of one list call.
#[derive(Debug, Clone)]
pub struct LiveListing {
    /// Environment-wide logical time the listing was taken at.
    pub logical_time: u64,
    pub items: Vec<LiveResource>,
}

/// A write to perform on behalf of `manager`.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub key: ResourceKey,
    pub content: Value,
    pub manager: String,
}

/// Kind of a live change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification that a live resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveChange {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    /// Writer that made the change.
    pub actor: String,
    /// Value of the application label before or after the change.
    pub application: Option<String>,
}

/// Errors reported by an execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("{key} not found")]
    NotFound { key: ResourceKey },

    #[error("{key} already exists at revision {found}")]
    AlreadyExists { key: ResourceKey, found: RevisionToken },

    #[error("{key} is at revision {found}, expected {expected}")]
    RevisionMismatch {
        key: ResourceKey,
        expected: RevisionToken,
        found: RevisionToken,
    },

    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("rejected: {reason}")]
    Rejected { reason: String },

    #[error("unreachable: {reason}")]
    Unreachable { reason: String },
}

/// Target environment holding live resources.
///
/// Every successful write assigns a fresh [`RevisionToken`]; guarded writes
/// fail with [`EnvError::RevisionMismatch`] when the caller's token is stale.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    async fn list(&self, scope: &ListScope, selector: &LabelSelector) -> Result<LiveListing, EnvError>;

    async fn get(&self, key: &ResourceKey) -> Result<Option<LiveResource>, EnvError>;

    async fn create(&self, request: WriteRequest) -> Result<RevisionToken, EnvError>;

    async fn update(&self, request: WriteRequest, expected: &RevisionToken) -> Result<RevisionToken, EnvError>;

    async fn delete(&self, key: &ResourceKey, expected: &RevisionToken, manager: &str) -> Result<(), EnvError>;

    /// Subscribe to change notifications, if the environment supports them.
    fn watch(&self) -> Option<broadcast::Receiver<LiveChange>> {
        None
    }
}

#[derive(Debug, Clone)]
struct StoredResource {
    content: Value,
    revision: u64,
    last_modified_by: String,
}

#[derive(Debug, Default)]
struct EnvState {
    clock: u64,
    resources: BTreeMap<ResourceKey, StoredResource>,
}

#[derive(Debug, Default)]
struct EnvFaults {
    unreachable: bool,
    forbidden: bool,
    latency: Option<Duration>,
    rejected: BTreeMap<ResourceKey, String>,
    /// Simulated writes from other actors landing right after a list call.
    writes_after_list: u32,
}

/// In-memory execution environment with a logical clock and fault injection.
pub struct InMemoryEnvironment {
    state: RwLock<EnvState>,
    faults: Mutex<EnvFaults>,
    changes: broadcast::Sender<LiveChange>,
}

impl Default for InMemoryEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnvironment {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(EnvState::default()),
            faults: Mutex::new(EnvFaults::default()),
            changes,
        }
    }

    /// Create or replace a resource as `actor`, bypassing revision guards.
    pub async fn put(&self, key: ResourceKey, content: Value, actor: &str) -> RevisionToken {
        let mut state = self.state.write().await;
        let kind = if state.resources.contains_key(&key) {
            ChangeKind::Updated
        } else {
            ChangeKind::Created
        };
        let token = Self::store(&mut state, key.clone(), content, actor);
        drop(state);
        self.notify(&key, kind, actor).await;
        token
    }

    /// Modify a resource in place as `actor`, as an operator would by hand.
    pub async fn edit<F>(&self, key: &ResourceKey, actor: &str, edit: F) -> Option<RevisionToken>
    where
        F: FnOnce(&mut Value) + Send,
    {
        let mut state = self.state.write().await;
        let mut content = state.resources.get(key)?.content.clone();
        edit(&mut content);
        let token = Self::store(&mut state, key.clone(), content, actor);
        drop(state);
        self.notify(key, ChangeKind::Updated, actor).await;
        Some(token)
    }

    /// Remove a resource as `actor`, bypassing revision guards.
    pub async fn remove(&self, key: &ResourceKey, actor: &str) -> bool {
        let application = self.application_of(key).await;
        let mut state = self.state.write().await;
        let removed = state.resources.remove(key).is_some();
        if removed {
            state.clock = state.clock.saturating_add(1);
        }
        drop(state);
        if removed {
            let _ = self.changes.send(LiveChange {
                key: key.clone(),
                kind: ChangeKind::Deleted,
                actor: actor.to_string(),
                application,
            });
        }
        removed
    }

    pub async fn content(&self, key: &ResourceKey) -> Option<Value> {
        self.state
            .read()
            .await
            .resources
            .get(key)
            .map(|r| r.content.clone())
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.state.read().await.resources.keys().cloned().collect()
    }

    pub async fn logical_time(&self) -> u64 {
        self.state.read().await.clock
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().await.unreachable = unreachable;
    }

    pub async fn set_forbidden(&self, forbidden: bool) {
        self.faults.lock().await.forbidden = forbidden;
    }

    /// Delay every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().await.latency = latency;
    }

    /// Reject writes to `key` with `reason`.
    pub async fn reject_writes(&self, key: ResourceKey, reason: impl Into<String>) {
        self.faults.lock().await.rejected.insert(key, reason.into());
    }

    /// Advance the clock right after each of the next `count` list calls.
    pub async fn concurrent_writes_after_list(&self, count: u32) {
        self.faults.lock().await.writes_after_list = count;
    }

    fn store(state: &mut EnvState, key: ResourceKey, content: Value, actor: &str) -> RevisionToken {
        state.clock = state.clock.saturating_add(1);
        let revision = state.clock;
        state.resources.insert(
            key,
            StoredResource {
                content,
                revision,
                last_modified_by: actor.to_string(),
            },
        );
        RevisionToken::new(revision.to_string())
    }

    async fn application_of(&self, key: &ResourceKey) -> Option<String> {
        self.state.read().await.resources.get(key).and_then(|r| {
            r.content
                .get("metadata")
                .and_then(|m| m.get("labels"))
                .and_then(|l| l.get(APPLICATION_LABEL))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }

    async fn notify(&self, key: &ResourceKey, kind: ChangeKind, actor: &str) {
        let application = self.application_of(key).await;
        // No receivers is fine.
        let _ = self.changes.send(LiveChange {
            key: key.clone(),
            kind,
            actor: actor.to_string(),
            application,
        });
    }

    async fn precheck(&self, write_key: Option<&ResourceKey>) -> Result<(), EnvError> {
        let latency = {
            let faults = self.faults.lock().await;
            if faults.unreachable {
                return Err(EnvError::Unreachable {
                    reason: "connection refused".into(),
                });
            }
            if faults.forbidden {
                return Err(EnvError::Forbidden {
                    reason: "service account lacks access".into(),
                });
            }
            if let Some(reason) = write_key.and_then(|k| faults.rejected.get(k)) {
                return Err(EnvError::Rejected {
                    reason: reason.clone(),
                });
            }
            faults.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn to_live(key: &ResourceKey, stored: &StoredResource) -> LiveResource {
        LiveResource {
            key: key.clone(),
            content: stored.content.clone(),
            revision: RevisionToken::new(stored.revision.to_string()),
            last_modified_by: Some(stored.last_modified_by.clone()),
        }
    }

    fn check_revision(
        key: &ResourceKey,
        stored: &StoredResource,
        expected: &RevisionToken,
    ) -> Result<(), EnvError> {
        if stored.revision.to_string() == expected.as_str() {
            Ok(())
        } else {
            Err(EnvError::RevisionMismatch {
                key: key.clone(),
                expected: expected.clone(),
                found: RevisionToken::new(stored.revision.to_string()),
            })
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for InMemoryEnvironment {
    async fn list(&self, scope: &ListScope, selector: &LabelSelector) -> Result<LiveListing, EnvError> {
        self.precheck(None).await?;
        let mut state = self.state.write().await;
        let listing = LiveListing {
            logical_time: state.clock,
            items: state
                .resources
                .iter()
                .filter(|(key, stored)| scope.covers(key) && selector.matches(&stored.content))
                .map(|(key, stored)| Self::to_live(key, stored))
                .collect(),
        };

        let mut faults = self.faults.lock().await;
        if faults.writes_after_list > 0 {
            faults.writes_after_list = faults.writes_after_list.saturating_sub(1);
            state.clock = state.clock.saturating_add(1);
        }
        Ok(listing)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<LiveResource>, EnvError> {
        self.precheck(None).await?;
        let state = self.state.read().await;
        Ok(state.resources.get(key).map(|stored| Self::to_live(key, stored)))
    }

    async fn create(&self, request: WriteRequest) -> Result<RevisionToken, EnvError> {
        self.precheck(Some(&request.key)).await?;
        let mut state = self.state.write().await;
        if let Some(existing) = state.resources.get(&request.key) {
            return Err(EnvError::AlreadyExists {
                key: request.key,
                found: RevisionToken::new(existing.revision.to_string()),
            });
        }
        let token = Self::store(&mut state, request.key.clone(), request.content, &request.manager);
        drop(state);
        self.notify(&request.key, ChangeKind::Created, &request.manager).await;
        Ok(token)
    }

    async fn update(&self, request: WriteRequest, expected: &RevisionToken) -> Result<RevisionToken, EnvError> {
        self.precheck(Some(&request.key)).await?;
        let mut state = self.state.write().await;
        let stored = state
            .resources
            .get(&request.key)
            .ok_or_else(|| EnvError::NotFound {
                key: request.key.clone(),
            })?;
        Self::check_revision(&request.key, stored, expected)?;
        let token = Self::store(&mut state, request.key.clone(), request.content, &request.manager);
        drop(state);
        self.notify(&request.key, ChangeKind::Updated, &request.manager).await;
        Ok(token)
    }

    async fn delete(&self, key: &ResourceKey, expected: &RevisionToken, manager: &str) -> Result<(), EnvError> {
        self.precheck(Some(key)).await?;
        {
            let state = self.state.read().await;
            let stored = state
                .resources
                .get(key)
                .ok_or_else(|| EnvError::NotFound { key: key.clone() })?;
            Self::check_revision(key, stored, expected)?;
        }
        self.remove(key, manager).await;
        Ok(())
    }

    fn watch(&self) -> Option<broadcast::Receiver<LiveChange>> {
        Some(self.changes.subscribe())
    }
}
