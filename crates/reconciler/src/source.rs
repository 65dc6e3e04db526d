//! Version-controlled desired-state sources.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::error::{FetchError, PublishError};
use crate::types::RevisionSelector;

/// Files of a source at one immutable revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub repository: String,
    pub revision: String,
    /// File path to content, in path order.
    pub files: BTreeMap<String, String>,
}

/// A new revision to publish on top of `parent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub branch: String,
    /// Revision the change was computed against.
    pub parent: String,
    /// Files to create or replace; untouched files carry over from `parent`.
    pub files: BTreeMap<String, String>,
    pub message: String,
    pub author: String,
}

/// A version-controlled store of desired state.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Stable identity, used in cache keys and change notifications.
    fn identity(&self) -> &str;

    /// Read all files at the revision `selector` resolves to.
    async fn fetch(&self, selector: &RevisionSelector) -> Result<SourceSnapshot, FetchError>;

    /// Publish a revision. Fails with [`PublishError::Conflict`] when the
    /// branch head is no longer `request.parent`.
    async fn commit(&self, request: CommitRequest) -> Result<String, PublishError>;
}

#[derive(Debug, Clone)]
struct StoredCommit {
    files: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct SourceState {
    commits: HashMap<String, StoredCommit>,
    branches: HashMap<String, String>,
    tags: HashMap<String, String>,
    sequence: u64,
}

#[derive(Debug, Default)]
struct SourceFaults {
    fetch_network_failures: u32,
    commit_conflicts: u32,
    commit_network_failures: u32,
    auth_denied: bool,
}

/// In-memory source with git-like branches, tags and commits.
///
/// Supports fault injection so retry and conflict paths can be exercised.
pub struct InMemorySource {
    identity: String,
    state: RwLock<SourceState>,
    faults: Mutex<SourceFaults>,
    fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: RwLock::new(SourceState::default()),
            faults: Mutex::new(SourceFaults::default()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Replace the full file set of `branch` with a new commit.
    pub async fn push<I, P, C>(&self, branch: &str, files: I) -> String
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let files: BTreeMap<String, String> = files
            .into_iter()
            .map(|(path, content)| (path.into(), content.into()))
            .collect();
        let mut state = self.state.write().await;
        let parent = state.branches.get(branch).cloned().unwrap_or_default();
        let revision = Self::record_commit(&mut state, &parent, files);
        state.branches.insert(branch.to_string(), revision.clone());
        revision
    }

    /// Point `tag` at `revision`.
    pub async fn tag(&self, tag: &str, revision: &str) {
        self.state
            .write()
            .await
            .tags
            .insert(tag.to_string(), revision.to_string());
    }

    pub async fn head(&self, branch: &str) -> Option<String> {
        self.state.read().await.branches.get(branch).cloned()
    }

    pub async fn file_at_head(&self, branch: &str, path: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .branches
            .get(branch)
            .and_then(|rev| state.commits.get(rev))
            .and_then(|commit| commit.files.get(path).cloned())
    }

    /// Number of commits ever recorded.
    pub async fn commit_count(&self) -> usize {
        self.state.read().await.commits.len()
    }

    /// Number of fetch calls served, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fail the next `count` fetches with a network error.
    pub async fn fail_fetches(&self, count: u32) {
        self.faults.lock().await.fetch_network_failures = count;
    }

    /// Reject the next `count` commits as if another writer moved the branch.
    pub async fn conflict_commits(&self, count: u32) {
        self.faults.lock().await.commit_conflicts = count;
    }

    /// Fail the next `count` commits with a network error.
    pub async fn fail_commits(&self, count: u32) {
        self.faults.lock().await.commit_network_failures = count;
    }

    pub async fn deny_access(&self, denied: bool) {
        self.faults.lock().await.auth_denied = denied;
    }

    fn record_commit(
        state: &mut SourceState,
        parent: &str,
        files: BTreeMap<String, String>,
    ) -> String {
        state.sequence = state.sequence.saturating_add(1);
        let mut hasher = Sha256::new();
        hasher.update(parent.as_bytes());
        hasher.update(state.sequence.to_be_bytes());
        for (path, content) in &files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(content.as_bytes());
        }
        let revision: String = hasher
            .finalize()
            .iter()
            .take(20)
            .map(|b| format!("{b:02x}"))
            .collect();
        state.commits.insert(revision.clone(), StoredCommit { files });
        revision
    }

    fn resolve(state: &SourceState, selector: &RevisionSelector) -> Option<String> {
        match selector {
            RevisionSelector::Branch(name) => state.branches.get(name).cloned(),
            RevisionSelector::Tag(name) => state.tags.get(name).cloned(),
            RevisionSelector::Commit(id) => {
                state.commits.contains_key(id).then(|| id.clone())
            }
        }
    }
}

#[async_trait]
impl SourceRepository for InMemorySource {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch(&self, selector: &RevisionSelector) -> Result<SourceSnapshot, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock().await;
            if faults.auth_denied {
                return Err(FetchError::AuthDenied {
                    repository: self.identity.clone(),
                    reason: "credentials rejected".into(),
                });
            }
            if faults.fetch_network_failures > 0 {
                faults.fetch_network_failures = faults.fetch_network_failures.saturating_sub(1);
                return Err(FetchError::Network {
                    repository: self.identity.clone(),
                    reason: "connection reset".into(),
                });
            }
        }

        let state = self.state.read().await;
        let revision = Self::resolve(&state, selector).ok_or_else(|| FetchError::NotFound {
            repository: self.identity.clone(),
            selector: selector.to_string(),
        })?;
        let files = state
            .commits
            .get(&revision)
            .map(|commit| commit.files.clone())
            .unwrap_or_default();

        Ok(SourceSnapshot {
            repository: self.identity.clone(),
            revision,
            files,
        })
    }

    async fn commit(&self, request: CommitRequest) -> Result<String, PublishError> {
        {
            let mut faults = self.faults.lock().await;
            if faults.auth_denied {
                return Err(PublishError::AuthDenied {
                    repository: self.identity.clone(),
                    reason: "credentials rejected".into(),
                });
            }
            if faults.commit_network_failures > 0 {
                faults.commit_network_failures = faults.commit_network_failures.saturating_sub(1);
                return Err(PublishError::Network {
                    repository: self.identity.clone(),
                    reason: "connection reset".into(),
                });
            }
            if faults.commit_conflicts > 0 {
                faults.commit_conflicts = faults.commit_conflicts.saturating_sub(1);
                return Err(PublishError::Conflict {
                    branch: request.branch.clone(),
                    expected: request.parent.clone(),
                    actual: "concurrent-writer".into(),
                });
            }
        }

        let mut state = self.state.write().await;
        let head = state
            .branches
            .get(&request.branch)
            .cloned()
            .ok_or_else(|| PublishError::BranchNotFound {
                branch: request.branch.clone(),
            })?;
        if head != request.parent {
            return Err(PublishError::Conflict {
                branch: request.branch,
                expected: request.parent,
                actual: head,
            });
        }

        let mut files = state
            .commits
            .get(&head)
            .map(|commit| commit.files.clone())
            .unwrap_or_default();
        files.extend(request.files);

        let revision = Self::record_commit(&mut state, &head, files);
        state.branches.insert(request.branch, revision.clone());
        tracing::debug!(
            repository = %self.identity,
            revision = %revision,
            author = %request.author,
            message = %request.message,
            "Commit recorded"
        );
        Ok(revision)
    }
}
