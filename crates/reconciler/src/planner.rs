//! Sync planner: turns deltas into an ordered, guarded action list.
//!
//! Creates and updates run in dependency order: explicit `depends-on`
//! annotations plus implicit namespace containment, with a fixed kind
//! ranking and then resource key breaking ties. Prunes run in reverse
//! dependency order after all creates and updates.

use std::collections::{BTreeSet, HashMap};

use drift_events::ApplicationId;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diff::{DeltaStatus, ResourceDelta};
use crate::error::PlanError;
use crate::types::{ExpectedRevision, ResourceKey, ResourceSpec};

/// Kinds that other resources commonly rely on, applied first.
const KIND_ORDER: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "PersistentVolumeClaim",
    "ClusterRole",
    "Role",
    "ClusterRoleBinding",
    "RoleBinding",
    "Service",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "Ingress",
];

/// Position of `kind` in the apply ranking; unknown kinds go last.
pub fn kind_rank(kind: &str) -> usize {
    KIND_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(KIND_ORDER.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Prune,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Prune => "prune",
        }
    }

    pub const fn is_prune(self) -> bool {
        matches!(self, Self::Prune)
    }
}

/// One guarded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAction {
    pub kind: ActionKind,
    pub key: ResourceKey,
    /// Live revision the action was planned against.
    pub guard: ExpectedRevision,
    /// Declared content for creates and updates.
    pub spec: Option<ResourceSpec>,
}

/// Ordered actions for one application and revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub application: ApplicationId,
    pub revision: String,
    pub actions: Vec<SyncAction>,
    /// Conflicting resources left untouched.
    pub attention: Vec<ResourceKey>,
    /// Orphans kept because pruning is disabled.
    pub withheld_prunes: Vec<ResourceKey>,
    /// Skip prunes once any create or update failed.
    pub gate_prunes: bool,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub prune: bool,
    pub interleave_prunes: bool,
}

pub struct SyncPlanner {
    options: PlanOptions,
}

impl SyncPlanner {
    pub const fn new(options: PlanOptions) -> Self {
        Self { options }
    }

    /// Build the plan. Same deltas always give the same plan.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyCycle`] when creates and updates
    /// depend on each other in a loop; no partial plan is produced.
    pub fn plan(
        &self,
        application: &ApplicationId,
        revision: &str,
        deltas: &[ResourceDelta],
    ) -> Result<SyncPlan, PlanError> {
        let applies: Vec<&ResourceDelta> = deltas
            .iter()
            .filter(|d| matches!(d.status, DeltaStatus::NeedsCreate | DeltaStatus::NeedsUpdate))
            .collect();
        let prunes: Vec<&ResourceDelta> = deltas
            .iter()
            .filter(|d| d.status == DeltaStatus::NeedsPrune)
            .collect();
        let attention: Vec<ResourceKey> = deltas
            .iter()
            .filter(|d| d.status == DeltaStatus::Conflict)
            .map(|d| d.key.clone())
            .collect();

        let mut actions = order_applies(&applies)?
            .into_iter()
            .filter_map(apply_action)
            .collect::<Vec<_>>();

        let withheld_prunes = if self.options.prune {
            actions.extend(order_prunes(&prunes).into_iter().filter_map(prune_action));
            Vec::new()
        } else {
            prunes.iter().map(|d| d.key.clone()).collect()
        };

        debug!(
            application = %application,
            revision,
            actions = actions.len(),
            attention = attention.len(),
            withheld = withheld_prunes.len(),
            "Sync plan built"
        );

        Ok(SyncPlan {
            application: application.clone(),
            revision: revision.to_string(),
            actions,
            attention,
            withheld_prunes,
            gate_prunes: !self.options.interleave_prunes,
        })
    }
}

fn apply_action(delta: &ResourceDelta) -> Option<SyncAction> {
    let spec = delta.desired.clone()?;
    let (kind, guard) = match &delta.live {
        None => (ActionKind::Create, ExpectedRevision::Absent),
        Some(live) => (ActionKind::Update, ExpectedRevision::At(live.revision.clone())),
    };
    Some(SyncAction {
        kind,
        key: delta.key.clone(),
        guard,
        spec: Some(spec),
    })
}

fn prune_action(delta: &ResourceDelta) -> Option<SyncAction> {
    let live = delta.live.as_ref()?;
    Some(SyncAction {
        kind: ActionKind::Prune,
        key: delta.key.clone(),
        guard: ExpectedRevision::At(live.revision.clone()),
        spec: None,
    })
}

fn order_applies<'a>(applies: &[&'a ResourceDelta]) -> Result<Vec<&'a ResourceDelta>, PlanError> {
    topological_order(applies, |delta| {
        delta
            .desired
            .as_ref()
            .map(|spec| spec.depends_on.clone())
            .unwrap_or_default()
    })
}

fn order_prunes<'a>(prunes: &[&'a ResourceDelta]) -> Vec<&'a ResourceDelta> {
    let dependencies_of = |delta: &ResourceDelta| {
        delta
            .live
            .as_ref()
            .map(|live| live.depends_on())
            .unwrap_or_default()
    };
    match topological_order(prunes, dependencies_of) {
        Ok(mut order) => {
            order.reverse();
            order
        }
        Err(err) => {
            // Live annotations can be edited by hand; fall back to reverse
            // kind ranking rather than refusing to clean up.
            debug!(error = %err, "Prune dependencies are cyclic, using kind order");
            let mut order = prunes.to_vec();
            order.sort_by(|a, b| {
                (kind_rank(&b.key.kind), &b.key).cmp(&(kind_rank(&a.key.kind), &a.key))
            });
            order
        }
    }
}

/// Kahn's algorithm over the dependency graph, picking the lowest
/// `(kind rank, key)` among ready nodes at each step.
fn topological_order<'a, F>(
    deltas: &[&'a ResourceDelta],
    dependencies_of: F,
) -> Result<Vec<&'a ResourceDelta>, PlanError>
where
    F: Fn(&ResourceDelta) -> Vec<ResourceKey>,
{
    let mut graph: DiGraph<&'a ResourceDelta, ()> = DiGraph::new();
    let index: HashMap<&ResourceKey, NodeIndex> = deltas
        .iter()
        .map(|delta| (&delta.key, graph.add_node(*delta)))
        .collect();

    for delta in deltas {
        let Some(&dependent) = index.get(&delta.key) else {
            continue;
        };
        let explicit = dependencies_of(delta);
        let implicit = delta.key.containing_namespace();
        for dependency in explicit.iter().chain(implicit.iter()) {
            if let Some(&required) = index.get(dependency) {
                graph.update_edge(required, dependent, ());
            }
        }
    }

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let rank = |n: NodeIndex| {
        let key = &graph[n].key;
        (kind_rank(&key.kind), key.clone(), n)
    };
    let mut ready: BTreeSet<(usize, ResourceKey, NodeIndex)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(n, _)| rank(*n))
        .collect();

    let mut order = Vec::with_capacity(deltas.len());
    while let Some((_, _, node)) = ready.pop_first() {
        order.push(graph[node]);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert(rank(next));
                }
            }
        }
    }

    if order.len() == deltas.len() {
        return Ok(order);
    }

    let mut members: Vec<ResourceKey> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n)))
        .flatten()
        .map(|n| graph[n].key.clone())
        .collect();
    members.sort();
    Err(PlanError::DependencyCycle { members })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{LiveResource, RevisionToken, DEPENDS_ON_ANNOTATION};
    use serde_json::json;

    fn spec(kind: &str, namespace: Option<&str>, name: &str, depends_on: Option<&str>) -> ResourceSpec {
        let mut metadata = json!({ "name": name });
        if let Some(ns) = namespace {
            metadata["namespace"] = json!(ns);
        }
        if let Some(deps) = depends_on {
            metadata["annotations"] = json!({ DEPENDS_ON_ANNOTATION: deps });
        }
        ResourceSpec::from_document(json!({ "kind": kind, "metadata": metadata })).unwrap()
    }

    fn create(spec: ResourceSpec) -> ResourceDelta {
        ResourceDelta {
            key: spec.key.clone(),
            status: DeltaStatus::NeedsCreate,
            desired: Some(spec),
            live: None,
            changed_paths: Vec::new(),
        }
    }

    fn prune(spec: ResourceSpec, revision: &str) -> ResourceDelta {
        ResourceDelta {
            key: spec.key.clone(),
            status: DeltaStatus::NeedsPrune,
            desired: None,
            live: Some(LiveResource {
                key: spec.key.clone(),
                content: spec.content,
                revision: RevisionToken::new(revision),
                last_modified_by: Some("drift".into()),
            }),
            changed_paths: Vec::new(),
        }
    }

    fn keys(plan: &SyncPlan) -> Vec<String> {
        plan.actions.iter().map(|a| a.key.to_string()).collect()
    }

    fn app() -> ApplicationId {
        ApplicationId::new("web")
    }

    fn planner(prune: bool) -> SyncPlanner {
        SyncPlanner::new(PlanOptions {
            prune,
            interleave_prunes: false,
        })
    }

    #[test]
    fn namespace_precedes_contained_resources_regardless_of_input_order() {
        let deltas = vec![
            create(spec("Deployment", Some("prod"), "web", None)),
            create(spec("Service", Some("prod"), "web", None)),
            create(spec("Namespace", None, "prod", None)),
        ];
        let plan = planner(false).plan(&app(), "r1", &deltas).unwrap();
        assert_eq!(
            keys(&plan),
            vec!["Namespace/prod", "Service/prod/web", "Deployment/prod/web"]
        );
        assert!(plan.actions.iter().all(|a| a.guard == ExpectedRevision::Absent));
    }

    #[test]
    fn explicit_dependency_overrides_kind_rank() {
        let deltas = vec![
            create(spec("ConfigMap", Some("prod"), "cfg", Some("Job/prod/migrate"))),
            create(spec("Job", Some("prod"), "migrate", None)),
        ];
        let plan = planner(false).plan(&app(), "r1", &deltas).unwrap();
        assert_eq!(keys(&plan), vec!["Job/prod/migrate", "ConfigMap/prod/cfg"]);
    }

    #[test]
    fn dependency_cycle_fails_without_partial_plan() {
        let deltas = vec![
            create(spec("ConfigMap", Some("prod"), "a", Some("ConfigMap/prod/b"))),
            create(spec("ConfigMap", Some("prod"), "b", Some("ConfigMap/prod/a"))),
            create(spec("Service", Some("prod"), "c", None)),
        ];
        let err = planner(false).plan(&app(), "r1", &deltas).unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyCycle {
                members: vec![
                    ResourceKey::namespaced("ConfigMap", "prod", "a"),
                    ResourceKey::namespaced("ConfigMap", "prod", "b"),
                ],
            }
        );
    }

    #[test]
    fn prunes_follow_applies_in_reverse_dependency_order() {
        let deltas = vec![
            prune(spec("Namespace", None, "old", None), "1"),
            prune(spec("Deployment", Some("old"), "web", None), "2"),
            create(spec("ConfigMap", Some("prod"), "cfg", None)),
        ];
        let plan = planner(true).plan(&app(), "r1", &deltas).unwrap();
        assert_eq!(
            keys(&plan),
            vec!["ConfigMap/prod/cfg", "Deployment/old/web", "Namespace/old"]
        );
        assert_eq!(plan.actions[1].guard, ExpectedRevision::At(RevisionToken::new("2")));
        assert!(plan.gate_prunes);
    }

    #[test]
    fn disabled_prune_withholds_orphans() {
        let deltas = vec![prune(spec("ConfigMap", Some("prod"), "old", None), "3")];
        let plan = planner(false).plan(&app(), "r1", &deltas).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.withheld_prunes, vec![ResourceKey::namespaced("ConfigMap", "prod", "old")]);
    }

    #[test]
    fn conflicts_are_reported_not_planned() {
        let mut delta = create(spec("ConfigMap", Some("prod"), "cfg", None));
        delta.status = DeltaStatus::Conflict;
        let plan = planner(true).plan(&app(), "r1", &[delta]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.attention.len(), 1);
    }

    #[test]
    fn unknown_kinds_rank_last() {
        assert!(kind_rank("Namespace") < kind_rank("Deployment"));
        assert_eq!(kind_rank("Widget"), KIND_ORDER.len());
    }
}
