//! Reconciler: runs fetch, collect, diff, plan and execute for one
//! application at a time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use drift_core::{CollectorSettings, DriftConfig, FetchSettings, ReconcilerSettings};
use drift_events::{Alert, AlertKind, ApplicationId, DriftEvent, EventBus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::collector::LiveStateCollector;
use crate::cycle::CycleReport;
use crate::diff::{ComparatorRegistry, ContentComparator, DiffEngine, ResourceDelta};
use crate::environment::ExecutionEnvironment;
use crate::error::{Error, Result};
use crate::executor::{ExecutorOptions, SyncExecutor};
use crate::fetcher::StateFetcher;
use crate::planner::{PlanOptions, SyncPlan, SyncPlanner};
use crate::source::SourceRepository;
use crate::status::{MonitorPhase, StatusStore};
use crate::stop::StopSignal;
use crate::types::{Application, ResourceKey};

/// Dry-run result: what a cycle would do right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPreview {
    pub application: ApplicationId,
    pub revision: String,
    pub deltas: Vec<ResourceDelta>,
    pub plan: SyncPlan,
}

/// Reconciles applications against one source and one environment.
pub struct Reconciler {
    fetcher: StateFetcher,
    collector: LiveStateCollector,
    diff: DiffEngine,
    planner: SyncPlanner,
    executor: SyncExecutor,
    env: Arc<dyn ExecutionEnvironment>,
    status: Arc<StatusStore>,
    bus: Option<Arc<EventBus>>,
    settings: ReconcilerSettings,
    locks: Mutex<HashMap<ApplicationId, Arc<Mutex<()>>>>,
}

impl Reconciler {
    /// Compute the plan for `app` without executing it.
    ///
    /// # Errors
    ///
    /// Fetch, collection and planning errors are returned as-is.
    pub async fn preview(&self, app: &Application) -> Result<PlanPreview> {
        let desired = self.fetcher.fetch(&app.revision).await?;
        let live = self.collector.collect(app).await?;
        let deltas = self.diff.diff(&app.id, &desired, &live.resources);
        let plan = self.planner.plan(&app.id, &desired.revision, &deltas)?;
        Ok(PlanPreview {
            application: app.id.clone(),
            revision: desired.revision.clone(),
            deltas,
            plan,
        })
    }

    /// Run one reconciliation cycle for `app`.
    ///
    /// Cycles for the same application never overlap: a second call waits
    /// for the first to finish. `stop` is checked between actions, so a
    /// shutdown never interrupts a write halfway.
    pub async fn reconcile(&self, app: &Application, stop: &StopSignal) -> CycleReport {
        let lock = self.app_lock(&app.id).await;
        let _guard = lock.lock().await;

        let started = Instant::now();
        let started_at = Utc::now();
        self.set_phase(&app.id, MonitorPhase::Reconciling).await;
        info!(application = %app.id, selector = %app.revision, "Starting reconciliation");

        let previous_attention = self.status.attention(&app.id).await;
        let mut report = match self.run_cycle(app, stop, started_at).await {
            Ok(report) => report,
            Err((revision, err)) => {
                error!(application = %app.id, error = %err, "Reconciliation cycle aborted");
                CycleReport::aborted(app.id.clone(), revision, started_at, err)
            }
        };
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.status.record(&report).await;
        self.set_phase(&app.id, MonitorPhase::from(report.status)).await;
        self.set_phase(&app.id, MonitorPhase::Idle).await;
        self.sync_attention_alerts(&app.id, &previous_attention, &report.attention)
            .await;
        self.publish(DriftEvent::cycle_completed(report.summary())).await;

        log_cycle_complete(&report);
        report
    }

    async fn run_cycle(
        &self,
        app: &Application,
        stop: &StopSignal,
        started_at: chrono::DateTime<Utc>,
    ) -> std::result::Result<CycleReport, (Option<String>, Error)> {
        let desired = self
            .fetcher
            .fetch(&app.revision)
            .await
            .map_err(|e| (None, Error::from(e)))?;
        let revision = Some(desired.revision.clone());

        let live = self
            .collector
            .collect(app)
            .await
            .map_err(|e| (revision.clone(), Error::from(e)))?;

        let deltas = self.diff.diff(&app.id, &desired, &live.resources);
        let plan = self
            .planner
            .plan(&app.id, &desired.revision, &deltas)
            .map_err(|e| (revision.clone(), Error::from(e)))?;
        debug!(
            application = %app.id,
            revision = %desired.revision,
            live = live.resources.len(),
            actions = plan.len(),
            "Executing sync plan"
        );

        let result = self.executor.execute(&plan, stop).await;
        Ok(CycleReport::executed(started_at, &deltas, plan, result))
    }

    async fn app_lock(&self, application: &ApplicationId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(application.clone()).or_default())
    }

    async fn set_phase(&self, application: &ApplicationId, phase: MonitorPhase) {
        if let Err(err) = self.status.transition(application, phase).await {
            warn!(application = %application, error = %err, "Unexpected phase transition");
        }
    }

    async fn sync_attention_alerts(
        &self,
        application: &ApplicationId,
        previous: &[ResourceKey],
        current: &[ResourceKey],
    ) {
        let previous: BTreeSet<&ResourceKey> = previous.iter().collect();
        let current: BTreeSet<&ResourceKey> = current.iter().collect();

        for key in current.difference(&previous) {
            let alert = Alert::new(
                AlertKind::ConflictRequiresAttention,
                Some(application.clone()),
                key.to_string(),
                "modified outside drift; left untouched",
            );
            if self.status.raise_alert(alert.clone()).await {
                warn!(application = %application, key = %key, "Resource requires attention");
                self.publish(DriftEvent::alert_raised(alert)).await;
            }
        }
        for key in previous.difference(&current) {
            let subject = key.to_string();
            if self
                .status
                .clear_alert(AlertKind::ConflictRequiresAttention, &subject)
                .await
            {
                info!(application = %application, key = %key, "Conflict resolved");
                self.publish(DriftEvent::alert_cleared(
                    AlertKind::ConflictRequiresAttention,
                    subject,
                ))
                .await;
            }
        }
    }

    async fn publish(&self, event: DriftEvent) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(event).await {
                warn!(error = %err, "Failed to publish event");
            }
        }
    }

    /// Get the execution environment.
    pub fn environment(&self) -> &Arc<dyn ExecutionEnvironment> {
        &self.env
    }

    /// Get the desired-state source.
    pub fn source(&self) -> &Arc<dyn SourceRepository> {
        self.fetcher.source()
    }

    /// Get the status store.
    pub fn status_store(&self) -> &Arc<StatusStore> {
        &self.status
    }

    /// Get the event bus, if one is attached.
    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.bus.as_ref()
    }

    /// Get the sync settings.
    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }
}

fn log_cycle_complete(report: &CycleReport) {
    if report.counts.converged() && report.outcomes.is_empty() && report.error.is_none() {
        info!(
            application = %report.application,
            revision = ?report.revision,
            in_sync = report.counts.in_sync,
            duration_ms = report.duration_ms,
            "Application in sync"
        );
    } else {
        info!(
            application = %report.application,
            revision = ?report.revision,
            status = %report.status,
            in_sync = report.counts.in_sync,
            create = report.counts.create,
            update = report.counts.update,
            prune = report.counts.prune,
            conflict = report.counts.conflict,
            applied = report.applied(),
            failed = report.failed(),
            skipped = report.skipped(),
            withheld = report.withheld_prunes.len(),
            duration_ms = report.duration_ms,
            "Reconciliation complete"
        );
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    source: Option<Arc<dyn SourceRepository>>,
    env: Option<Arc<dyn ExecutionEnvironment>>,
    bus: Option<Arc<EventBus>>,
    status: Option<Arc<StatusStore>>,
    comparators: ComparatorRegistry,
    settings: ReconcilerSettings,
    fetch: FetchSettings,
    collector: CollectorSettings,
    history_limit: usize,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            source: None,
            env: None,
            bus: None,
            status: None,
            comparators: ComparatorRegistry::new(),
            settings: ReconcilerSettings::default(),
            fetch: FetchSettings::default(),
            collector: CollectorSettings::default(),
            history_limit: drift_core::MonitorSettings::default().history_limit,
        }
    }

    /// Take every setting from a loaded configuration.
    #[must_use]
    pub fn with_config(mut self, config: &DriftConfig) -> Self {
        self.settings = config.reconciler.clone();
        self.fetch = config.fetch.clone();
        self.collector = config.collector.clone();
        self.history_limit = config.monitor.history_limit;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SourceRepository>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, env: Arc<dyn ExecutionEnvironment>) -> Self {
        self.env = Some(env);
        self
    }

    /// Publish cycle and alert events on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share a status store with other components.
    #[must_use]
    pub fn with_status_store(mut self, status: Arc<StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_fetch_settings(mut self, fetch: FetchSettings) -> Self {
        self.fetch = fetch;
        self
    }

    /// Register a content comparator for one resource kind.
    #[must_use]
    pub fn with_comparator(mut self, kind: impl Into<String>, comparator: Arc<dyn ContentComparator>) -> Self {
        self.comparators = self.comparators.with_comparator(kind, comparator);
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Fails when the source or environment is missing, or the manager
    /// name is empty.
    pub fn build(self) -> Result<Reconciler> {
        let source = self
            .source
            .ok_or_else(|| Error::invalid_config("a desired-state source is required"))?;
        let env = self
            .env
            .ok_or_else(|| Error::invalid_config("an execution environment is required"))?;
        if self.settings.manager.trim().is_empty() {
            return Err(Error::invalid_config("manager name must not be empty"));
        }

        let comparators = Arc::new(self.comparators);
        let settings = self.settings;
        let status = self
            .status
            .unwrap_or_else(|| Arc::new(StatusStore::new(self.history_limit)));

        Ok(Reconciler {
            fetcher: StateFetcher::new(source, self.fetch),
            collector: LiveStateCollector::new(
                Arc::clone(&env),
                settings.manager.clone(),
                self.collector.max_relists,
            ),
            diff: DiffEngine::new(
                Arc::clone(&comparators),
                settings.manager.clone(),
                settings.conflict_policy,
            ),
            planner: SyncPlanner::new(PlanOptions {
                prune: settings.prune,
                interleave_prunes: settings.interleave_prunes,
            }),
            executor: SyncExecutor::new(
                Arc::clone(&env),
                comparators,
                ExecutorOptions {
                    manager: settings.manager.clone(),
                    action_timeout: settings.action_timeout(),
                    abort_on_failure: settings.abort_on_failure,
                },
            ),
            env,
            status,
            bus: self.bus,
            settings,
            locks: Mutex::new(HashMap::new()),
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::environment::{
        EnvError, InMemoryEnvironment, LabelSelector, ListScope, LiveListing, WriteRequest,
    };
    use crate::executor::{ActionStatus, SkipReason};
    use crate::source::InMemorySource;
    use crate::stop::{stop_channel, Stopper};
    use crate::types::{LiveResource, ResourceKey, RevisionSelector, RevisionToken};
    use async_trait::async_trait;
    use drift_events::{CycleStatus, EventStore, InMemoryEventStore};
    use std::time::Duration;

    const MANIFESTS: &str = "\
kind: Namespace
metadata:
  name: prod
---
kind: ConfigMap
metadata:
  name: web
  namespace: prod
data:
  level: info
";

    fn app() -> Application {
        Application::new("web", "deploy", RevisionSelector::Branch("main".into()))
    }

    async fn setup() -> (Reconciler, Arc<InMemorySource>, Arc<InMemoryEnvironment>) {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        let env = Arc::new(InMemoryEnvironment::new());
        let reconciler = ReconcilerBuilder::new()
            .with_source(Arc::clone(&source) as Arc<dyn SourceRepository>)
            .with_environment(Arc::clone(&env) as Arc<dyn ExecutionEnvironment>)
            .build()
            .unwrap();
        (reconciler, source, env)
    }

    #[test]
    fn builder_requires_source_and_environment() {
        let result = ReconcilerBuilder::new().build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn first_cycle_creates_everything_then_converges() {
        let (reconciler, _, env) = setup().await;

        let first = reconciler.reconcile(&app(), &StopSignal::never()).await;
        assert_eq!(first.status, CycleStatus::Synced);
        assert_eq!(first.applied(), 2);
        assert_eq!(env.keys().await.len(), 2);

        let second = reconciler.reconcile(&app(), &StopSignal::never()).await;
        assert_eq!(second.status, CycleStatus::Synced);
        assert!(second.outcomes.is_empty());
        assert_eq!(second.counts.in_sync, 2);
    }

    #[tokio::test]
    async fn preview_does_not_mutate() {
        let (reconciler, _, env) = setup().await;
        let preview = reconciler.preview(&app()).await.unwrap();
        assert_eq!(preview.plan.len(), 2);
        assert!(env.keys().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_aborts_before_mutation() {
        let (reconciler, source, env) = setup().await;
        source.deny_access(true).await;

        let report = reconciler.reconcile(&app(), &StopSignal::never()).await;
        assert_eq!(report.status, CycleStatus::Failed);
        assert!(report.revision.is_none());
        assert!(report.error.is_some());
        assert!(env.keys().await.is_empty());
    }

    #[tokio::test]
    async fn phase_settles_to_idle_and_history_is_kept() {
        let (reconciler, _, _) = setup().await;
        reconciler.reconcile(&app(), &StopSignal::never()).await;

        let status = reconciler.status_store().status(&app().id).await.unwrap();
        assert_eq!(status.phase, MonitorPhase::Idle);
        assert_eq!(status.history.len(), 1);
    }

    #[tokio::test]
    async fn cycle_completion_is_published() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        let bus = Arc::new(EventBus::new(Arc::new(InMemoryEventStore::new())));
        let reconciler = ReconcilerBuilder::new()
            .with_source(source)
            .with_environment(Arc::new(InMemoryEnvironment::new()))
            .with_bus(Arc::clone(&bus))
            .build()
            .unwrap();

        reconciler.reconcile(&app(), &StopSignal::never()).await;
        let events = bus.store().read_by_type("cycle_completed").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn busy_environment_still_converges() {
        let (reconciler, _, env) = setup().await;
        env.concurrent_writes_after_list(1_000).await;
        let scoped = app().with_namespaces(["prod"]);

        let report = reconciler.reconcile(&scoped, &StopSignal::never()).await;

        assert_eq!(report.status, CycleStatus::Synced);
        assert!(report.error.is_none());
        assert_eq!(env.keys().await.len(), 2);
    }

    #[tokio::test]
    async fn overlapping_cycles_for_one_application_run_one_after_the_other() {
        let (reconciler, _, env) = setup().await;
        env.set_latency(Some(Duration::from_millis(5))).await;

        let (app_a, app_b) = (app(), app());
        let (never_a, never_b) = (StopSignal::never(), StopSignal::never());
        let (first, second) = tokio::join!(
            reconciler.reconcile(&app_a, &never_a),
            reconciler.reconcile(&app_b, &never_b)
        );

        assert_eq!(first.status, CycleStatus::Synced);
        assert_eq!(first.applied(), 2);
        assert_eq!(second.status, CycleStatus::Synced);
        assert!(second.outcomes.is_empty());
        assert_eq!(second.counts.in_sync, 2);
        assert_eq!(env.keys().await.len(), 2);
    }

    async fn two_application_setup() -> (Reconciler, Arc<InMemoryEnvironment>) {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        source
            .push(
                "api",
                [(
                    "api.yaml",
                    "kind: ConfigMap\nmetadata:\n  name: api\n  namespace: prod\n",
                )],
            )
            .await;
        let env = Arc::new(InMemoryEnvironment::new());
        env.set_latency(Some(Duration::from_millis(100))).await;
        let reconciler = ReconcilerBuilder::new()
            .with_source(source as Arc<dyn SourceRepository>)
            .with_environment(Arc::clone(&env) as Arc<dyn ExecutionEnvironment>)
            .build()
            .unwrap();
        (reconciler, env)
    }

    #[tokio::test(start_paused = true)]
    async fn independent_applications_reconcile_concurrently() {
        let api = Application::new("api", "deploy", RevisionSelector::Branch("api".into()));

        let (alone, _) = two_application_setup().await;
        let started = tokio::time::Instant::now();
        alone.reconcile(&app(), &StopSignal::never()).await;
        let web_alone = started.elapsed();

        let (reconciler, env) = two_application_setup().await;
        let started = tokio::time::Instant::now();
        let web_app = app();
        let (never_a, never_b) = (StopSignal::never(), StopSignal::never());
        let (web, api) = tokio::join!(
            reconciler.reconcile(&web_app, &never_a),
            reconciler.reconcile(&api, &never_b)
        );
        let together = started.elapsed();

        assert_eq!(web.status, CycleStatus::Synced);
        assert_eq!(api.status, CycleStatus::Synced);
        assert_eq!(env.keys().await.len(), 3);
        // Run back to back, the api cycle would add three more 100ms calls.
        assert!(
            together < web_alone + Duration::from_millis(100),
            "{together:?} vs {web_alone:?}"
        );
    }

    /// Fires `stopper` once the first create has landed.
    struct StopAfterFirstCreate {
        inner: InMemoryEnvironment,
        stopper: Stopper,
    }

    #[async_trait]
    impl ExecutionEnvironment for StopAfterFirstCreate {
        async fn list(&self, scope: &ListScope, selector: &LabelSelector) -> std::result::Result<LiveListing, EnvError> {
            self.inner.list(scope, selector).await
        }

        async fn get(&self, key: &ResourceKey) -> std::result::Result<Option<LiveResource>, EnvError> {
            self.inner.get(key).await
        }

        async fn create(&self, request: WriteRequest) -> std::result::Result<RevisionToken, EnvError> {
            let created = self.inner.create(request).await;
            self.stopper.stop();
            created
        }

        async fn update(&self, request: WriteRequest, expected: &RevisionToken) -> std::result::Result<RevisionToken, EnvError> {
            self.inner.update(request, expected).await
        }

        async fn delete(&self, key: &ResourceKey, expected: &RevisionToken, manager: &str) -> std::result::Result<(), EnvError> {
            self.inner.delete(key, expected, manager).await
        }
    }

    #[tokio::test]
    async fn stop_between_actions_keeps_applied_work_and_skips_the_rest() {
        let source = Arc::new(InMemorySource::new("deploy"));
        source.push("main", [("app.yaml", MANIFESTS)]).await;
        let (stopper, signal) = stop_channel();
        let env = Arc::new(StopAfterFirstCreate {
            inner: InMemoryEnvironment::new(),
            stopper,
        });
        let reconciler = ReconcilerBuilder::new()
            .with_source(source as Arc<dyn SourceRepository>)
            .with_environment(Arc::clone(&env) as Arc<dyn ExecutionEnvironment>)
            .build()
            .unwrap();

        let report = reconciler.reconcile(&app(), &signal).await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].status, ActionStatus::Applied);
        assert_eq!(report.outcomes[1].status, ActionStatus::Skipped(SkipReason::Cancelled));
        assert_eq!(report.status, CycleStatus::PartiallySynced);
        assert_eq!(env.inner.keys().await.len(), 1);
    }
}
