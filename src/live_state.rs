//! Live state persisted to a JSON file between runs.
//!
//! The binary reconciles against an [`InMemoryEnvironment`] seeded from this
//! file and writes it back after every cycle, so successive `drift`
//! invocations see each other's work.

use std::path::Path;

use anyhow::{Context, Result};
use drift_reconciler::{
    ExecutionEnvironment, InMemoryEnvironment, LabelSelector, ListScope, LiveResource,
};
use tracing::debug;

const UNKNOWN_WRITER: &str = "unknown";

/// Load the environment stored at `path`; a missing file is an empty one.
pub async fn load(path: &Path) -> Result<InMemoryEnvironment> {
    let env = InMemoryEnvironment::new();
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No live state yet");
            return Ok(env);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let resources: Vec<LiveResource> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse live state in {}", path.display()))?;
    for resource in resources {
        let writer = resource.last_modified_by.as_deref().unwrap_or(UNKNOWN_WRITER);
        env.put(resource.key.clone(), resource.content, writer).await;
    }
    debug!(path = %path.display(), resources = env.keys().await.len(), "Loaded live state");
    Ok(env)
}

/// Write every resource of `env` to `path`.
pub async fn save(env: &InMemoryEnvironment, path: &Path) -> Result<()> {
    let listing = env
        .list(&ListScope::All, &LabelSelector::default())
        .await
        .context("Failed to list live state")?;
    let raw = serde_json::to_string_pretty(&listing.items).context("Failed to encode live state")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, raw)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), resources = listing.items.len(), "Saved live state");
    Ok(())
}
