//! State fetcher: resolves a revision selector into parsed desired state.

use std::sync::Arc;

use drift_core::FetchSettings;
use moka::future::Cache;
use tracing::{debug, warn};

use crate::backoff::calculate_backoff;
use crate::error::FetchError;
use crate::manifest::{is_manifest_path, parse_documents};
use crate::source::{SourceRepository, SourceSnapshot};
use crate::types::{DesiredState, ResourceSpec, RevisionSelector};

/// Fetches and parses desired state, retrying transient failures.
///
/// Parsed snapshots are cached by `(source identity, revision)`: a revision
/// is immutable, so the same revision always yields the same state.
pub struct StateFetcher {
    source: Arc<dyn SourceRepository>,
    cache: Cache<(String, String), Arc<DesiredState>>,
    settings: FetchSettings,
}

impl StateFetcher {
    pub fn new(source: Arc<dyn SourceRepository>, settings: FetchSettings) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(settings.cache_capacity)
                .build(),
            source,
            settings,
        }
    }

    pub fn source(&self) -> &Arc<dyn SourceRepository> {
        &self.source
    }

    /// Fetch desired state for `selector`.
    ///
    /// # Errors
    ///
    /// Network failures are retried up to `max_attempts` with exponential
    /// backoff; auth, not-found and manifest errors fail immediately.
    pub async fn fetch(&self, selector: &RevisionSelector) -> Result<Arc<DesiredState>, FetchError> {
        let snapshot = self.fetch_with_retry(selector).await?;
        let cache_key = (snapshot.repository.clone(), snapshot.revision.clone());

        if let Some(cached) = self.cache.get(&cache_key).await {
            debug!(repository = %cache_key.0, revision = %cache_key.1, "Desired state cache hit");
            return Ok(cached);
        }

        let desired = Arc::new(parse_snapshot(&snapshot)?);
        self.cache.insert(cache_key, Arc::clone(&desired)).await;
        debug!(
            repository = %desired.repository,
            revision = %desired.revision,
            resources = desired.len(),
            "Desired state parsed"
        );
        Ok(desired)
    }

    async fn fetch_with_retry(&self, selector: &RevisionSelector) -> Result<SourceSnapshot, FetchError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.source.fetch(selector).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) if err.is_transient() && attempt.saturating_add(1) < max_attempts => {
                    let delay = calculate_backoff(
                        attempt,
                        self.settings.base_backoff_ms,
                        self.settings.max_backoff_ms,
                    );
                    warn!(
                        repository = %self.source.identity(),
                        selector = %selector,
                        attempt = attempt.saturating_add(1),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Parse every manifest file of a snapshot, in path order.
///
/// # Errors
///
/// Fails on malformed YAML, documents without a kind or name, and
/// duplicate resource keys.
pub fn parse_snapshot(snapshot: &SourceSnapshot) -> Result<DesiredState, FetchError> {
    let mut desired = DesiredState::new(&snapshot.repository, &snapshot.revision);

    for (path, text) in snapshot.files.iter().filter(|(p, _)| is_manifest_path(p)) {
        let invalid = |reason: String| FetchError::InvalidManifest {
            path: path.clone(),
            reason,
        };
        for document in parse_documents(text).map_err(invalid)? {
            let spec = ResourceSpec::from_document(document).map_err(invalid)?;
            desired
                .insert(spec)
                .map_err(|key| invalid(format!("duplicate resource {key}")))?;
        }
    }

    Ok(desired)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::InMemorySource;
    use crate::types::ResourceKey;

    const MANIFESTS: &str = "\
kind: Namespace
metadata:
  name: prod
---
kind: Deployment
metadata:
  name: web
  namespace: prod
spec:
  replicas: 2
";

    fn settings() -> FetchSettings {
        FetchSettings {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            cache_capacity: 8,
        }
    }

    fn main_branch() -> RevisionSelector {
        RevisionSelector::Branch("main".into())
    }

    #[tokio::test]
    async fn fetch_parses_manifests_and_ignores_other_files() {
        let source = Arc::new(InMemorySource::new("deploy"));
        let revision = source
            .push("main", [("app.yaml", MANIFESTS), ("README.md", "# docs")])
            .await;
        let fetcher = StateFetcher::new(source, settings());

        let desired = fetcher.fetch(&main_branch()).await.unwrap();
        assert_eq!(desired.revision, revision);
        assert_eq!(desired.len(), 2);
        assert!(desired.contains(&ResourceKey::namespaced("Deployment", "prod", "web")));
    }

    #[tokio::test]
    async fn same_revision_returns_identical_state() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        let fetcher = StateFetcher::new(source, settings());

        let first = fetcher.fetch(&main_branch()).await.unwrap();
        let second = fetcher.fetch(&main_branch()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        source.fail_fetches(2).await;
        let fetcher = StateFetcher::new(Arc::clone(&source) as Arc<dyn SourceRepository>, settings());

        assert!(fetcher.fetch(&main_branch()).await.is_ok());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        source.fail_fetches(10).await;
        let fetcher = StateFetcher::new(Arc::clone(&source) as Arc<dyn SourceRepository>, settings());

        let err = fetcher.fetch(&main_branch()).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        source.deny_access(true).await;
        let fetcher = StateFetcher::new(Arc::clone(&source) as Arc<dyn SourceRepository>, settings());

        let err = fetcher.fetch(&main_branch()).await.unwrap_err();
        assert!(matches!(err, FetchError::AuthDenied { .. }));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn invalid_manifest_names_the_file() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source
            .push("main", [("broken.yaml", "kind: Service\nmetadata: {}\n")])
            .await;
        let fetcher = StateFetcher::new(source, settings());

        let err = fetcher.fetch(&main_branch()).await.unwrap_err();
        assert!(
            matches!(err, FetchError::InvalidManifest { ref path, .. } if path == "broken.yaml")
        );
    }

    #[tokio::test]
    async fn duplicate_resources_across_files_are_rejected() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source
            .push("main", [("a.yaml", MANIFESTS), ("b.yaml", MANIFESTS)])
            .await;
        let fetcher = StateFetcher::new(source, settings());

        let err = fetcher.fetch(&main_branch()).await.unwrap_err();
        assert!(err.to_string().contains("duplicate resource"));
    }
}
