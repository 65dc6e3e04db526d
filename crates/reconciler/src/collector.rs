//! Live-state collector: snapshots the managed resources of an application.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::environment::{EnvError, ExecutionEnvironment, LabelSelector, ListScope};
use crate::error::CollectorError;
use crate::types::{Application, LiveResource, ResourceKey, APPLICATION_LABEL, MANAGED_BY_LABEL};

/// A point-in-time view of an application's managed live resources.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    /// Logical time of the latest listing in the snapshot.
    pub logical_time: u64,
    /// Every listing agreed on `logical_time`.
    pub consistent: bool,
    /// Resources in key order.
    pub resources: Vec<LiveResource>,
}

impl LiveSnapshot {
    pub fn get(&self, key: &ResourceKey) -> Option<&LiveResource> {
        self.resources
            .binary_search_by(|r| r.key.cmp(key))
            .ok()
            .and_then(|i| self.resources.get(i))
    }
}

/// Lists live resources carrying the management marker of one application.
pub struct LiveStateCollector {
    env: Arc<dyn ExecutionEnvironment>,
    manager: String,
    max_relists: u32,
}

impl LiveStateCollector {
    pub fn new(env: Arc<dyn ExecutionEnvironment>, manager: impl Into<String>, max_relists: u32) -> Self {
        Self {
            env,
            manager: manager.into(),
            max_relists,
        }
    }

    /// Label selector matching resources drift manages for `app`.
    pub fn selector_for(&self, app: &Application) -> LabelSelector {
        LabelSelector::default()
            .with(MANAGED_BY_LABEL, self.manager.clone())
            .with(APPLICATION_LABEL, app.id.as_str())
    }

    /// Collect a snapshot for `app`.
    ///
    /// An application scoped to several namespaces needs several list calls;
    /// when they disagree on logical time the whole set is listed again, up
    /// to `max_relists` extra times. If the environment never settles, the
    /// last listing is returned with `consistent` unset.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] when the environment refuses or fails a
    /// list call.
    pub async fn collect(&self, app: &Application) -> Result<LiveSnapshot, CollectorError> {
        let scopes = scopes_for(app);
        let selector = self.selector_for(app);
        let attempts = self.max_relists.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let mut times = Vec::with_capacity(scopes.len());
            let mut resources = BTreeMap::new();
            for scope in &scopes {
                let listing = self
                    .env
                    .list(scope, &selector)
                    .await
                    .map_err(collector_error)?;
                times.push(listing.logical_time);
                resources.extend(listing.items.into_iter().map(|r| (r.key.clone(), r)));
            }

            let first = times.first().copied().unwrap_or_default();
            let consistent = times.iter().all(|t| *t == first);
            if consistent || attempt >= attempts {
                let logical_time = times.iter().copied().max().unwrap_or_default();
                if consistent {
                    debug!(
                        application = %app.id,
                        logical_time,
                        resources = resources.len(),
                        attempt,
                        "Live state collected"
                    );
                } else {
                    warn!(
                        application = %app.id,
                        logical_time,
                        resources = resources.len(),
                        attempts,
                        "Live state kept changing, using best-effort snapshot"
                    );
                }
                return Ok(LiveSnapshot {
                    logical_time,
                    consistent,
                    resources: resources.into_values().collect(),
                });
            }

            warn!(
                application = %app.id,
                attempt,
                "Live state changed during listing, relisting"
            );
        }
    }
}

fn scopes_for(app: &Application) -> Vec<ListScope> {
    if app.namespaces.is_empty() {
        return vec![ListScope::All];
    }
    std::iter::once(ListScope::ClusterScoped)
        .chain(app.namespaces.iter().cloned().map(ListScope::Namespace))
        .collect()
}

fn collector_error(err: EnvError) -> CollectorError {
    match err {
        EnvError::Forbidden { reason } => CollectorError::PermissionDenied { reason },
        other => CollectorError::Unreachable {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::environment::InMemoryEnvironment;
    use crate::types::RevisionSelector;
    use serde_json::json;

    fn app() -> Application {
        Application::new("web", "deploy", RevisionSelector::Branch("main".into()))
    }

    fn managed(app: &str) -> serde_json::Value {
        json!({"metadata": {"labels": {MANAGED_BY_LABEL: "drift", APPLICATION_LABEL: app}}})
    }

    async fn seeded() -> Arc<InMemoryEnvironment> {
        let env = Arc::new(InMemoryEnvironment::new());
        env.put(ResourceKey::namespaced("Service", "prod", "web"), managed("web"), "drift")
            .await;
        env.put(ResourceKey::namespaced("ConfigMap", "prod", "web"), managed("web"), "drift")
            .await;
        env.put(ResourceKey::namespaced("ConfigMap", "prod", "api"), managed("api"), "drift")
            .await;
        env.put(ResourceKey::namespaced("ConfigMap", "prod", "manual"), json!({}), "kubectl")
            .await;
        env.put(ResourceKey::namespaced("ConfigMap", "dev", "web"), managed("web"), "drift")
            .await;
        env
    }

    #[tokio::test]
    async fn collects_only_resources_of_the_application() {
        let env = seeded().await;
        let collector = LiveStateCollector::new(env, "drift", 2);

        let snapshot = collector.collect(&app()).await.unwrap();
        let keys: Vec<String> = snapshot.resources.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["ConfigMap/dev/web", "ConfigMap/prod/web", "Service/prod/web"]
        );
        assert!(snapshot
            .get(&ResourceKey::namespaced("Service", "prod", "web"))
            .is_some());
    }

    #[tokio::test]
    async fn namespace_scope_limits_listing() {
        let env = seeded().await;
        let collector = LiveStateCollector::new(env, "drift", 2);

        let snapshot = collector
            .collect(&app().with_namespaces(["prod"]))
            .await
            .unwrap();
        assert_eq!(snapshot.resources.len(), 2);
    }

    #[tokio::test]
    async fn relists_when_environment_moves() {
        let env = seeded().await;
        env.concurrent_writes_after_list(1).await;
        let collector = LiveStateCollector::new(Arc::clone(&env) as Arc<dyn ExecutionEnvironment>, "drift", 2);

        let snapshot = collector
            .collect(&app().with_namespaces(["prod", "dev"]))
            .await
            .unwrap();
        assert_eq!(snapshot.resources.len(), 3);
        assert!(snapshot.consistent);
        assert_eq!(snapshot.logical_time, env.logical_time().await);
    }

    #[tokio::test]
    async fn busy_environment_yields_best_effort_snapshot() {
        let env = seeded().await;
        env.concurrent_writes_after_list(100).await;
        let collector = LiveStateCollector::new(env, "drift", 2);

        let snapshot = collector
            .collect(&app().with_namespaces(["prod", "dev"]))
            .await
            .unwrap();
        assert!(!snapshot.consistent);
        assert_eq!(snapshot.resources.len(), 3);
    }

    #[tokio::test]
    async fn permission_errors_are_distinguished() {
        let env = seeded().await;
        env.set_forbidden(true).await;
        let collector = LiveStateCollector::new(env, "drift", 2);

        let err = collector.collect(&app()).await.unwrap_err();
        assert!(matches!(err, CollectorError::PermissionDenied { .. }));
    }
}
