//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use drift_core::{DriftConfig, ResultExt};
use drift_events::{
    BuildArtifact, CycleStatus, DriftEvent, EventBus, EventPattern, InMemoryEventStore,
    TracingEventStore,
};
use drift_reconciler::fetcher::parse_snapshot;
use drift_reconciler::{
    stop_channel, Application, DriftMonitor, ExecutionEnvironment, InMemoryEnvironment,
    PlanPreview, PromotionCoordinator, PromotionOutcome, Reconciler, ReconcilerBuilder,
    SourceRepository, StatusStore, StopSignal, Stopper,
};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::directory::DirectorySource;
use crate::live_state;

/// Execute a CLI command.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = DriftConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let source = Arc::new(DirectorySource::new(source_identity(&config)?, &cli.source));

    match cli.command {
        Commands::CheckConfig => cmd_check_config(&config, &source).await,
        Commands::Plan { app, json } => cmd_plan(&config, source, &cli.state, app.as_deref(), json).await,
        Commands::Run { once: true } => cmd_run_once(&config, source, &cli.state).await,
        Commands::Run { once: false } => cmd_run(&config, source, &cli.state).await,
        Commands::Promote { image, tag } => cmd_promote(&config, source, image, tag).await,
    }
}

/// One process serves one desired-state source.
fn source_identity(config: &DriftConfig) -> Result<String> {
    let repositories: BTreeSet<&str> = config
        .applications
        .iter()
        .map(|app| app.repository.as_str())
        .collect();
    match repositories.len() {
        0 => Ok("local".to_string()),
        1 => Ok(repositories.into_iter().next().map(str::to_string).unwrap_or_default()),
        _ => bail!(
            "applications reference several repositories ({}); run one drift per repository",
            repositories.into_iter().collect::<Vec<_>>().join(", ")
        ),
    }
}

fn applications(config: &DriftConfig) -> Vec<Application> {
    config.applications.iter().map(Application::from).collect()
}

fn event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::new(Arc::new(TracingEventStore::new(
        InMemoryEventStore::new(),
    ))))
}

fn build_reconciler(
    config: &DriftConfig,
    source: Arc<DirectorySource>,
    env: Arc<InMemoryEnvironment>,
    bus: Arc<EventBus>,
) -> Result<Reconciler> {
    ReconcilerBuilder::new()
        .with_config(config)
        .with_source(source as Arc<dyn SourceRepository>)
        .with_environment(env as Arc<dyn ExecutionEnvironment>)
        .with_bus(bus)
        .build()
        .context("Failed to build reconciler")
}

async fn cmd_check_config(config: &DriftConfig, source: &DirectorySource) -> Result<()> {
    let mut resources = 0;
    for app in applications(config) {
        let snapshot = source
            .fetch(&app.revision)
            .await
            .with_context(|| format!("Failed to read source for '{}'", app.id))?;
        let desired = parse_snapshot(&snapshot)
            .with_context(|| format!("Invalid manifests for '{}'", app.id))?;
        resources += desired.len();
    }

    println!(
        "Configuration OK: {} application(s), {} image(s), {} resource(s) in {}",
        config.applications.len(),
        config.images.len(),
        resources,
        source.root().display()
    );
    Ok(())
}

async fn cmd_plan(
    config: &DriftConfig,
    source: Arc<DirectorySource>,
    state: &Path,
    only: Option<&str>,
    json: bool,
) -> Result<()> {
    let env = Arc::new(live_state::load(state).await?);
    let reconciler = build_reconciler(config, source, env, event_bus())?;

    let apps: Vec<Application> = applications(config)
        .into_iter()
        .filter(|app| only.map_or(true, |id| app.id.as_str() == id))
        .collect();
    if apps.is_empty() {
        bail!("no application matches {}", only.unwrap_or("the configuration"));
    }

    let mut previews = Vec::with_capacity(apps.len());
    for app in &apps {
        let preview = reconciler
            .preview(app)
            .await
            .with_context(|| format!("Failed to plan '{}'", app.id))?;
        previews.push(preview);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&previews)?);
    } else {
        previews.iter().for_each(print_preview);
    }
    Ok(())
}

fn print_preview(preview: &PlanPreview) {
    println!("{} @ {}", preview.application, preview.revision);
    if preview.plan.is_empty() && preview.plan.attention.is_empty() {
        println!("  in sync");
    }
    for action in &preview.plan.actions {
        println!("  {:<7} {}", action.kind.as_str(), action.key);
    }
    for key in &preview.plan.attention {
        println!("  {:<7} {} (changed outside drift)", "skip", key);
    }
    for key in &preview.plan.withheld_prunes {
        println!("  {:<7} {} (pruning disabled)", "orphan", key);
    }
}

async fn cmd_run_once(config: &DriftConfig, source: Arc<DirectorySource>, state: &Path) -> Result<()> {
    let env = Arc::new(live_state::load(state).await?);
    let reconciler = build_reconciler(config, source, Arc::clone(&env), event_bus())?;

    let mut failed = 0usize;
    for app in applications(config) {
        let report = reconciler.reconcile(&app, &StopSignal::never()).await;
        println!(
            "{}: {} ({} applied, {} failed, {} skipped, {} need attention)",
            report.application,
            report.status,
            report.applied(),
            report.failed(),
            report.skipped(),
            report.attention.len()
        );
        if let Some(err) = &report.error {
            println!("  error: {err}");
        }
        if report.status == CycleStatus::Failed {
            failed += 1;
        }
    }

    live_state::save(&env, state).await?;
    if failed > 0 {
        bail!("{failed} application(s) failed to sync");
    }
    Ok(())
}

async fn cmd_run(config: &DriftConfig, source: Arc<DirectorySource>, state: &Path) -> Result<()> {
    let env = Arc::new(live_state::load(state).await?);
    let bus = event_bus();
    let status = Arc::new(StatusStore::new(config.monitor.history_limit));
    let reconciler = ReconcilerBuilder::new()
        .with_config(config)
        .with_source(Arc::clone(&source) as Arc<dyn SourceRepository>)
        .with_environment(Arc::clone(&env) as Arc<dyn ExecutionEnvironment>)
        .with_bus(Arc::clone(&bus))
        .with_status_store(Arc::clone(&status))
        .build()
        .context("Failed to build reconciler")?;

    let monitor = DriftMonitor::new(Arc::new(reconciler), applications(config), config.monitor.clone());
    let coordinator = PromotionCoordinator::new(
        source as Arc<dyn SourceRepository>,
        Arc::clone(&bus),
        status,
        config.promotion.clone(),
    )
    .with_config(config);
    let stopper = monitor.stopper();

    info!(applications = config.applications.len(), "drift is running. Press Ctrl+C to stop.");
    let (monitored, promoted, ()) = tokio::join!(
        monitor.run(),
        coordinator.run(stopper.signal()),
        async {
            tokio::join!(
                persist_after_cycles(&bus, &env, state, stopper.signal()),
                stop_on_shutdown(&stopper)
            );
        }
    );

    live_state::save(&env, state).await?;
    monitored.context("Drift monitor failed")?;
    promoted.context("Promotion coordinator failed")?;
    info!("drift stopped");
    Ok(())
}

async fn persist_after_cycles(bus: &EventBus, env: &InMemoryEnvironment, state: &Path, mut stop: StopSignal) {
    let (subscriber, mut cycles) = bus
        .subscribe_with_pattern(EventPattern::ByType("cycle_completed".into()))
        .await;
    loop {
        tokio::select! {
            () = stop.stopped() => break,
            received = cycles.recv() => match received {
                Ok(DriftEvent::CycleCompleted { .. }) | Err(drift_events::Error::Lagged { .. }) => {
                    live_state::save(env, state).await.or_default_logged(());
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }
    bus.unsubscribe(&subscriber).await;
}

async fn cmd_promote(
    config: &DriftConfig,
    source: Arc<DirectorySource>,
    image: String,
    tag: String,
) -> Result<()> {
    let coordinator = PromotionCoordinator::new(
        source as Arc<dyn SourceRepository>,
        event_bus(),
        Arc::new(StatusStore::new(config.monitor.history_limit)),
        config.promotion.clone(),
    )
    .with_config(config);
    if coordinator.targets(&image).is_empty() {
        bail!("image '{image}' is not tracked by any application following a branch");
    }

    let (stopper, signal) = stop_channel();
    let artifact = BuildArtifact::new(image, tag);
    let promoted = tokio::select! {
        promoted = coordinator.promote(&artifact, &signal) => promoted,
        () = stop_on_shutdown(&stopper) => {
            bail!("promotion of {artifact} interrupted");
        }
    };
    let outcomes = promoted.with_context(|| format!("Failed to promote {artifact}"))?;

    for outcome in outcomes {
        match outcome {
            PromotionOutcome::Published { branch, revision } => {
                println!("{branch}: published {artifact} as {revision}");
            }
            PromotionOutcome::AlreadyCurrent { branch, revision } => {
                println!("{branch}: already at {artifact} ({revision})");
            }
        }
    }
    Ok(())
}

/// Stop on Ctrl+C, or return once something else stopped `stopper`.
async fn stop_on_shutdown(stopper: &Stopper) {
    let mut stopped = stopper.signal();
    tokio::select! {
        () = stopped.stopped() => {}
        () = crate::wait_for_shutdown() => stopper.stop(),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(raw: &str) -> DriftConfig {
        DriftConfig::from_toml_str(raw).unwrap()
    }

    #[test]
    fn one_repository_per_process() {
        let single = config(
            r#"
            [[applications]]
            id = "web"
            repository = "deploy"

            [[applications]]
            id = "api"
            repository = "deploy"
            "#,
        );
        assert_eq!(source_identity(&single).unwrap(), "deploy");

        let mixed = config(
            r#"
            [[applications]]
            id = "web"
            repository = "deploy"

            [[applications]]
            id = "api"
            repository = "platform"
            "#,
        );
        assert!(source_identity(&mixed).is_err());
        assert_eq!(source_identity(&DriftConfig::default()).unwrap(), "local");
    }

    #[tokio::test]
    async fn run_once_then_plan_shows_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = dir.path().join("manifests");
        std::fs::create_dir_all(&manifests).unwrap();
        std::fs::write(
            manifests.join("web.yaml"),
            "kind: ConfigMap\nmetadata:\n  name: web\n  namespace: prod\ndata:\n  level: info\n",
        )
        .unwrap();
        let state = dir.path().join("live.json");
        let config = config(
            r#"
            [[applications]]
            id = "web"
            repository = "deploy"
            "#,
        );
        let source = Arc::new(DirectorySource::new("deploy", &manifests));

        cmd_run_once(&config, Arc::clone(&source), &state).await.unwrap();

        let env = Arc::new(live_state::load(&state).await.unwrap());
        assert_eq!(env.keys().await.len(), 1);
        let reconciler = build_reconciler(&config, source, env, event_bus()).unwrap();
        let preview = reconciler
            .preview(&applications(&config)[0])
            .await
            .unwrap();
        assert!(preview.plan.is_empty());
    }
}
