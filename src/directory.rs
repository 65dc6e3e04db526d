//! Desired-state source backed by a local directory of manifests.
//!
//! The directory has no history: every branch selector reads the working
//! tree, and its revision is a SHA-256 over the manifest file set. Commits
//! are accepted only against the current revision.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use drift_reconciler::manifest::is_manifest_path;
use drift_reconciler::{
    CommitRequest, FetchError, PublishError, RevisionSelector, SourceRepository, SourceSnapshot,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub struct DirectorySource {
    identity: String,
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(identity: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn snapshot(&self) -> Result<SourceSnapshot, FetchError> {
        let root = self.root.clone();
        let repository = self.identity.clone();
        let files = tokio::task::spawn_blocking(move || read_tree(&root, &repository))
            .await
            .map_err(|e| FetchError::Network {
                repository: self.identity.clone(),
                reason: format!("reader task failed: {e}"),
            })??;

        Ok(SourceSnapshot {
            repository: self.identity.clone(),
            revision: tree_revision(&files),
            files,
        })
    }
}

#[async_trait]
impl SourceRepository for DirectorySource {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch(&self, selector: &RevisionSelector) -> Result<SourceSnapshot, FetchError> {
        let snapshot = self.snapshot().await?;
        let found = match selector {
            RevisionSelector::Branch(_) => true,
            RevisionSelector::Commit(revision) => *revision == snapshot.revision,
            RevisionSelector::Tag(_) => false,
        };
        if !found {
            return Err(FetchError::NotFound {
                repository: self.identity.clone(),
                selector: selector.to_string(),
            });
        }
        debug!(root = %self.root.display(), revision = %snapshot.revision, files = snapshot.files.len(), "Read source directory");
        Ok(snapshot)
    }

    async fn commit(&self, request: CommitRequest) -> Result<String, PublishError> {
        let current = self.snapshot().await?;
        if current.revision != request.parent {
            return Err(PublishError::Conflict {
                branch: request.branch,
                expected: request.parent,
                actual: current.revision,
            });
        }

        for (path, content) in &request.files {
            let target = self.resolve(path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| write_failed(path, &e))?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| write_failed(path, &e))?;
        }

        let revision = self.snapshot().await?.revision;
        info!(
            root = %self.root.display(),
            revision = %revision,
            files = request.files.len(),
            message = %request.message,
            "Wrote manifests"
        );
        Ok(revision)
    }
}

impl DirectorySource {
    fn resolve(&self, relative: &str) -> Result<PathBuf, PublishError> {
        let path = Path::new(relative);
        if path.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(PublishError::Rewrite {
                path: relative.to_string(),
                reason: "path leaves the source directory".into(),
            });
        }
        Ok(self.root.join(path))
    }
}

fn write_failed(path: &str, err: &std::io::Error) -> PublishError {
    PublishError::Rewrite {
        path: path.to_string(),
        reason: err.to_string(),
    }
}

/// Read every manifest under `root`, keyed by slash-separated relative path.
fn read_tree(root: &Path, repository: &str) -> Result<BTreeMap<String, String>, FetchError> {
    if !root.is_dir() {
        return Err(FetchError::NotFound {
            repository: repository.to_string(),
            selector: root.display().to_string(),
        });
    }

    let pattern = Path::new(&glob::Pattern::escape(&root.to_string_lossy()))
        .join("**")
        .join("*");
    let entries = glob::glob(&pattern.to_string_lossy()).map_err(|e| FetchError::InvalidManifest {
        path: root.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut files = BTreeMap::new();
    for entry in entries {
        // Unreadable entries fail the fetch; a missing manifest would be pruned.
        let entry = entry.map_err(|e| FetchError::InvalidManifest {
            path: e.path().display().to_string(),
            reason: e.error().to_string(),
        })?;
        if !entry.is_file() {
            continue;
        }
        let Ok(relative) = entry.strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !is_manifest_path(&relative) || relative.starts_with('.') {
            continue;
        }
        let content = std::fs::read_to_string(&entry).map_err(|e| FetchError::InvalidManifest {
            path: relative.clone(),
            reason: e.to_string(),
        })?;
        files.insert(relative, content);
    }
    Ok(files)
}

fn tree_revision(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(content.as_bytes());
        hasher.update([0]);
    }
    hasher
        .finalize()
        .iter()
        .take(20)
        .map(|b| format!("{b:02x}"))
        .collect()
}
