//! Diff engine: classifies every resource as in sync, to create, update,
//! prune, or in conflict.
//!
//! Content is compared after normalization, which strips fields the
//! environment fills in on its own and drift's own bookkeeping markers.
//! Normalization is pluggable per resource kind through
//! [`ComparatorRegistry`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use drift_core::ConflictPolicy;
use drift_events::ApplicationId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{
    DesiredState, LiveResource, ResourceKey, ResourceSpec, APPLICATION_LABEL,
    LAST_APPLIED_ANNOTATION, MANAGED_BY_LABEL,
};

/// Metadata fields assigned by the environment.
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

/// Strategy for reducing resource content to its comparable form.
pub trait ContentComparator: Send + Sync {
    fn normalize(&self, content: &Value) -> Value;
}

/// Strips `status`, server-assigned metadata and drift's markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComparator;

impl ContentComparator for DefaultComparator {
    fn normalize(&self, content: &Value) -> Value {
        let mut normalized = content.clone();
        if let Value::Object(root) = &mut normalized {
            root.remove("status");
            if let Some(Value::Object(metadata)) = root.get_mut("metadata") {
                for field in SERVER_METADATA {
                    metadata.remove(*field);
                }
                strip_entries(metadata, "labels", &[MANAGED_BY_LABEL, APPLICATION_LABEL]);
                strip_entries(metadata, "annotations", &[LAST_APPLIED_ANNOTATION]);
            }
        }
        normalized
    }
}

/// Default normalization plus removal of extra dotted paths, for kinds
/// where the environment defaults or mutates fields.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFieldsComparator {
    paths: Vec<Vec<String>>,
}

impl IgnoreFieldsComparator {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|p| p.as_ref().split('.').map(str::to_string).collect())
                .collect(),
        }
    }
}

impl ContentComparator for IgnoreFieldsComparator {
    fn normalize(&self, content: &Value) -> Value {
        let mut normalized = DefaultComparator.normalize(content);
        for path in &self.paths {
            remove_path(&mut normalized, path);
        }
        normalized
    }
}

/// Comparators keyed by resource kind, with a default fallback.
#[derive(Clone)]
pub struct ComparatorRegistry {
    default: Arc<dyn ContentComparator>,
    by_kind: HashMap<String, Arc<dyn ContentComparator>>,
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self {
            default: Arc::new(DefaultComparator),
            by_kind: HashMap::new(),
        }
    }
}

impl ComparatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_comparator(mut self, kind: impl Into<String>, comparator: Arc<dyn ContentComparator>) -> Self {
        self.by_kind.insert(kind.into(), comparator);
        self
    }

    pub fn for_kind(&self, kind: &str) -> &dyn ContentComparator {
        self.by_kind
            .get(kind)
            .map_or(self.default.as_ref(), |comparator| comparator.as_ref())
    }

    pub fn normalize(&self, key: &ResourceKey, content: &Value) -> Value {
        self.for_kind(&key.kind).normalize(content)
    }

    /// Hex SHA-256 of the normalized content.
    pub fn fingerprint(&self, key: &ResourceKey, content: &Value) -> String {
        fingerprint_normalized(&self.normalize(key, content))
    }
}

/// Hex SHA-256 of already-normalized content.
///
/// Object keys serialize in sorted order, so equal values hash equally.
pub fn fingerprint_normalized(normalized: &Value) -> String {
    let bytes = serde_json::to_vec(normalized).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Classification of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeltaStatus {
    InSync,
    NeedsCreate,
    NeedsUpdate,
    NeedsPrune,
    /// Changed externally since drift last applied it; left for an operator.
    Conflict,
}

impl DeltaStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InSync => "in_sync",
            Self::NeedsCreate => "needs_create",
            Self::NeedsUpdate => "needs_update",
            Self::NeedsPrune => "needs_prune",
            Self::Conflict => "conflict",
        }
    }
}

/// Diff outcome for one resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub key: ResourceKey,
    pub status: DeltaStatus,
    pub desired: Option<ResourceSpec>,
    pub live: Option<LiveResource>,
    /// Dotted paths whose normalized values differ.
    pub changed_paths: Vec<String>,
}

/// Per-status counts of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaCounts {
    pub in_sync: usize,
    pub create: usize,
    pub update: usize,
    pub prune: usize,
    pub conflict: usize,
}

impl DeltaCounts {
    pub fn from_deltas(deltas: &[ResourceDelta]) -> Self {
        deltas.iter().fold(Self::default(), |mut counts, delta| {
            let slot = match delta.status {
                DeltaStatus::InSync => &mut counts.in_sync,
                DeltaStatus::NeedsCreate => &mut counts.create,
                DeltaStatus::NeedsUpdate => &mut counts.update,
                DeltaStatus::NeedsPrune => &mut counts.prune,
                DeltaStatus::Conflict => &mut counts.conflict,
            };
            *slot = slot.saturating_add(1);
            counts
        })
    }

    /// True when desired and live state already agree.
    pub const fn converged(&self) -> bool {
        self.create == 0 && self.update == 0 && self.prune == 0 && self.conflict == 0
    }
}

/// Pure comparison of desired and live state.
pub struct DiffEngine {
    comparators: Arc<ComparatorRegistry>,
    manager: String,
    policy: ConflictPolicy,
}

impl DiffEngine {
    pub fn new(comparators: Arc<ComparatorRegistry>, manager: impl Into<String>, policy: ConflictPolicy) -> Self {
        Self {
            comparators,
            manager: manager.into(),
            policy,
        }
    }

    /// Classify the union of desired and live keys, in key order.
    ///
    /// Live resources without drift's marker for `application` are outside
    /// management and produce no delta.
    pub fn diff(
        &self,
        application: &ApplicationId,
        desired: &DesiredState,
        live: &[LiveResource],
    ) -> Vec<ResourceDelta> {
        let live: BTreeMap<&ResourceKey, &LiveResource> = live
            .iter()
            .filter(|resource| {
                let managed = resource.is_managed_by(&self.manager, application);
                if !managed {
                    debug!(key = %resource.key, "Ignoring unmanaged live resource");
                }
                managed
            })
            .map(|resource| (&resource.key, resource))
            .collect();

        let keys: BTreeSet<&ResourceKey> = desired
            .iter()
            .map(|spec| &spec.key)
            .chain(live.keys().copied())
            .collect();

        keys.into_iter()
            .map(|key| self.classify(key, desired.get(key), live.get(key).copied()))
            .collect()
    }

    fn classify(
        &self,
        key: &ResourceKey,
        desired: Option<&ResourceSpec>,
        live: Option<&LiveResource>,
    ) -> ResourceDelta {
        let (status, changed_paths) = match (desired, live) {
            (Some(_), None) => (DeltaStatus::NeedsCreate, Vec::new()),
            (None, Some(_)) | (None, None) => (DeltaStatus::NeedsPrune, Vec::new()),
            (Some(spec), Some(current)) => {
                let want = self.comparators.normalize(key, &spec.content);
                let have = self.comparators.normalize(key, &current.content);
                if want == have {
                    (DeltaStatus::InSync, Vec::new())
                } else {
                    let mut paths = Vec::new();
                    changed_paths(&want, &have, String::new(), &mut paths);
                    let status = if self.policy == ConflictPolicy::Flag
                        && self.changed_externally(key, current, &have)
                    {
                        DeltaStatus::Conflict
                    } else {
                        DeltaStatus::NeedsUpdate
                    };
                    (status, paths)
                }
            }
        };

        ResourceDelta {
            key: key.clone(),
            status,
            desired: desired.cloned(),
            live: live.cloned(),
            changed_paths,
        }
    }

    /// Another writer touched the resource and its content no longer matches
    /// what drift last applied.
    fn changed_externally(&self, key: &ResourceKey, live: &LiveResource, normalized_live: &Value) -> bool {
        let other_writer = live
            .last_modified_by
            .as_deref()
            .is_some_and(|writer| writer != self.manager);
        if !other_writer {
            return false;
        }
        let drifted = live
            .last_applied()
            .map_or(true, |recorded| recorded != fingerprint_normalized(normalized_live));
        if drifted {
            debug!(key = %key, writer = ?live.last_modified_by, "External modification detected");
        }
        drifted
    }
}

fn strip_entries(metadata: &mut Map<String, Value>, section: &str, names: &[&str]) {
    let now_empty = match metadata.get_mut(section) {
        Some(Value::Object(entries)) => {
            for name in names {
                entries.remove(*name);
            }
            entries.is_empty()
        }
        _ => false,
    };
    if now_empty {
        metadata.remove(section);
    }
}

fn remove_path(value: &mut Value, path: &[String]) {
    match path {
        [] => {}
        [last] => {
            if let Value::Object(map) = value {
                map.remove(last);
            }
        }
        [head, rest @ ..] => {
            if let Some(child) = value.get_mut(head.as_str()) {
                remove_path(child, rest);
            }
        }
    }
}

fn changed_paths(want: &Value, have: &Value, prefix: String, out: &mut Vec<String>) {
    match (want, have) {
        (Value::Object(a), Value::Object(b)) => {
            let fields: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for field in fields {
                let path = if prefix.is_empty() {
                    field.clone()
                } else {
                    format!("{prefix}.{field}")
                };
                match (a.get(field), b.get(field)) {
                    (Some(x), Some(y)) => changed_paths(x, y, path, out),
                    _ => out.push(path),
                }
            }
        }
        _ if want != have => out.push(if prefix.is_empty() { ".".into() } else { prefix }),
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::RevisionToken;
    use serde_json::json;

    fn web_key() -> ResourceKey {
        ResourceKey::namespaced("Deployment", "prod", "web")
    }

    fn spec(replicas: u32) -> ResourceSpec {
        ResourceSpec::from_document(json!({
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" },
            "spec": { "replicas": replicas, "image": "reg/web:v1" }
        }))
        .unwrap()
    }

    /// Live copy of `spec` as drift would have applied it.
    fn applied(spec: &ResourceSpec, registry: &ComparatorRegistry, writer: &str) -> LiveResource {
        let mut content = spec.content.clone();
        content["metadata"]["labels"] = json!({ MANAGED_BY_LABEL: "drift", APPLICATION_LABEL: "web" });
        content["metadata"]["annotations"] =
            json!({ LAST_APPLIED_ANNOTATION: registry.fingerprint(&spec.key, &spec.content) });
        content["metadata"]["uid"] = json!("0b1c");
        content["status"] = json!({ "readyReplicas": 1 });
        LiveResource {
            key: spec.key.clone(),
            content,
            revision: RevisionToken::new("4"),
            last_modified_by: Some(writer.to_string()),
        }
    }

    fn engine(policy: ConflictPolicy) -> DiffEngine {
        DiffEngine::new(Arc::new(ComparatorRegistry::new()), "drift", policy)
    }

    fn desired_of(specs: &[ResourceSpec]) -> DesiredState {
        let mut desired = DesiredState::new("deploy", "r1");
        for spec in specs {
            desired.insert(spec.clone()).unwrap();
        }
        desired
    }

    fn app() -> ApplicationId {
        ApplicationId::new("web")
    }

    #[test]
    fn identical_desired_and_live_are_in_sync() {
        let registry = ComparatorRegistry::new();
        let desired = spec(2);
        let live = applied(&desired, &registry, "drift");

        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[desired]), &[live]);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].status, DeltaStatus::InSync);
    }

    #[test]
    fn missing_live_resource_needs_create() {
        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[spec(2)]), &[]);
        assert_eq!(deltas[0].status, DeltaStatus::NeedsCreate);
    }

    #[test]
    fn managed_orphan_needs_prune_and_unmanaged_is_ignored() {
        let registry = ComparatorRegistry::new();
        let orphan = applied(&spec(2), &registry, "drift");
        let mut foreign = orphan.clone();
        foreign.key = ResourceKey::namespaced("Deployment", "prod", "foreign");
        foreign.content["metadata"]["labels"] = json!({});

        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[]), &[orphan, foreign]);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].key, web_key());
        assert_eq!(deltas[0].status, DeltaStatus::NeedsPrune);
    }

    #[test]
    fn own_change_needs_update_with_paths() {
        let registry = ComparatorRegistry::new();
        let live = applied(&spec(2), &registry, "drift");

        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[spec(3)]), &[live]);
        assert_eq!(deltas[0].status, DeltaStatus::NeedsUpdate);
        assert_eq!(deltas[0].changed_paths, vec!["spec.replicas"]);
    }

    #[test]
    fn external_edit_is_a_conflict_under_flag_policy() {
        let registry = ComparatorRegistry::new();
        let desired = spec(2);
        let mut live = applied(&desired, &registry, "kubectl");
        live.content["spec"]["replicas"] = json!(5);

        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[desired.clone()]), &[live.clone()]);
        assert_eq!(deltas[0].status, DeltaStatus::Conflict);

        let deltas = engine(ConflictPolicy::Override).diff(&app(), &desired_of(&[desired]), &[live]);
        assert_eq!(deltas[0].status, DeltaStatus::NeedsUpdate);
    }

    #[test]
    fn external_edit_matching_desired_is_in_sync() {
        let registry = ComparatorRegistry::new();
        let mut live = applied(&spec(2), &registry, "kubectl");
        live.content["spec"]["replicas"] = json!(3);

        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[spec(3)]), &[live]);
        assert_eq!(deltas[0].status, DeltaStatus::InSync);
    }

    #[test]
    fn desired_change_over_untouched_external_write_is_an_update() {
        // Another writer re-applied identical content: fingerprint still matches.
        let registry = ComparatorRegistry::new();
        let live = applied(&spec(2), &registry, "kubectl");

        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[spec(3)]), &[live]);
        assert_eq!(deltas[0].status, DeltaStatus::NeedsUpdate);
    }

    #[test]
    fn ignore_fields_comparator_masks_defaulted_fields() {
        let registry = ComparatorRegistry::new().with_comparator(
            "Deployment",
            Arc::new(IgnoreFieldsComparator::new(["spec.replicas"])),
        );
        let live = applied(&spec(2), &registry, "drift");
        let engine = DiffEngine::new(Arc::new(registry), "drift", ConflictPolicy::Flag);

        let deltas = engine.diff(&app(), &desired_of(&[spec(7)]), &[live]);
        assert_eq!(deltas[0].status, DeltaStatus::InSync);
    }

    #[test]
    fn fingerprint_ignores_markers_and_key_order() {
        let registry = ComparatorRegistry::new();
        let key = web_key();
        let a = json!({"metadata": {"name": "web"}, "spec": {"a": 1, "b": 2}});
        let b = json!({"spec": {"b": 2, "a": 1}, "metadata": {"name": "web", "labels": {MANAGED_BY_LABEL: "drift"}}});
        assert_eq!(registry.fingerprint(&key, &a), registry.fingerprint(&key, &b));
    }

    #[test]
    fn counts_summarize_deltas() {
        let registry = ComparatorRegistry::new();
        let live = applied(&spec(2), &registry, "drift");
        let mut other = spec(1);
        other.key = ResourceKey::namespaced("Deployment", "prod", "api");
        let deltas = engine(ConflictPolicy::Flag).diff(&app(), &desired_of(&[spec(2), other]), &[live]);

        let counts = DeltaCounts::from_deltas(&deltas);
        assert_eq!(counts.in_sync, 1);
        assert_eq!(counts.create, 1);
        assert!(!counts.converged());
    }
}
