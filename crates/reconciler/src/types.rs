//! Core types for the reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use drift_core::RevisionSelectorConfig;
use drift_events::ApplicationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label naming the tool that owns a live resource.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label naming the application a live resource belongs to.
pub const APPLICATION_LABEL: &str = "drift.dev/application";
/// Annotation holding the fingerprint of the content drift last applied.
pub const LAST_APPLIED_ANNOTATION: &str = "drift.dev/last-applied";
/// Annotation listing explicit dependencies as comma-separated resource keys.
pub const DEPENDS_ON_ANNOTATION: &str = "drift.dev/depends-on";

/// Kind of the resource that implicitly contains namespaced resources.
pub const NAMESPACE_KIND: &str = "Namespace";

/// Identity of a resource: `(kind, namespace, name)`.
///
/// Ordering is lexicographic on the triple, which makes it the tie-breaker
/// wherever the reconciler needs a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    /// Key of a namespaced resource.
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped resource.
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of the namespace containing this resource, if it is namespaced.
    pub fn containing_namespace(&self) -> Option<Self> {
        self.namespace
            .as_ref()
            .map(|ns| Self::cluster(NAMESPACE_KIND, ns.clone()))
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == NAMESPACE_KIND && self.namespace.is_none()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    /// Parses `Kind/name` or `Kind/namespace/name`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("malformed resource key '{raw}'"));
        }
        match parts.as_slice() {
            [kind, name] => Ok(Self::cluster(*kind, *name)),
            [kind, namespace, name] => Ok(Self::namespaced(*kind, *namespace, *name)),
            _ => Err(format!("malformed resource key '{raw}'")),
        }
    }
}

/// Opaque version marker assigned by the execution environment on every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition attached to a guarded write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedRevision {
    /// The resource must not exist yet.
    Absent,
    /// The resource must still be at this revision.
    At(RevisionToken),
}

impl fmt::Display for ExpectedRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::At(token) => write!(f, "revision {token}"),
        }
    }
}

/// Which revision of a source to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevisionSelector {
    Branch(String),
    Tag(String),
    Commit(String),
}

impl RevisionSelector {
    /// Branch name when the selector tracks a moving branch.
    pub fn branch(&self) -> Option<&str> {
        match self {
            Self::Branch(name) => Some(name),
            Self::Tag(_) | Self::Commit(_) => None,
        }
    }
}

impl fmt::Display for RevisionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch(name) => write!(f, "branch:{name}"),
            Self::Tag(name) => write!(f, "tag:{name}"),
            Self::Commit(id) => write!(f, "commit:{id}"),
        }
    }
}

impl From<&RevisionSelectorConfig> for RevisionSelector {
    fn from(config: &RevisionSelectorConfig) -> Self {
        match config {
            RevisionSelectorConfig::Branch(name) => Self::Branch(name.clone()),
            RevisionSelectorConfig::Tag(name) => Self::Tag(name.clone()),
            RevisionSelectorConfig::Commit(id) => Self::Commit(id.clone()),
        }
    }
}

/// A resource as declared in desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub key: ResourceKey,
    /// Full declared document.
    pub content: Value,
    /// Explicit dependencies from the depends-on annotation.
    pub depends_on: Vec<ResourceKey>,
}

impl ResourceSpec {
    /// Build a spec from a parsed manifest document.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when `kind` or `metadata.name`
    /// is missing, or a depends-on entry is malformed.
    pub fn from_document(content: Value) -> std::result::Result<Self, String> {
        let kind = content
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "document has no kind".to_string())?;
        let metadata = content
            .get("metadata")
            .ok_or_else(|| format!("{kind} has no metadata"))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| format!("{kind} has no metadata.name"))?;
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty());

        let key = match namespace {
            Some(ns) => ResourceKey::namespaced(kind, ns, name),
            None => ResourceKey::cluster(kind, name),
        };
        let depends_on = parse_depends_on(&content)?;

        Ok(Self {
            key,
            content,
            depends_on,
        })
    }
}

/// A resource as observed in the execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveResource {
    pub key: ResourceKey,
    pub content: Value,
    pub revision: RevisionToken,
    /// Actor that performed the most recent write, when the environment tracks it.
    pub last_modified_by: Option<String>,
}

impl LiveResource {
    pub fn label(&self, name: &str) -> Option<&str> {
        metadata_entry(&self.content, "labels", name)
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        metadata_entry(&self.content, "annotations", name)
    }

    /// Whether the resource carries drift's management marker for `application`.
    pub fn is_managed_by(&self, manager: &str, application: &ApplicationId) -> bool {
        self.label(MANAGED_BY_LABEL) == Some(manager)
            && self.label(APPLICATION_LABEL) == Some(application.as_str())
    }

    /// Fingerprint recorded by the last apply, if any.
    pub fn last_applied(&self) -> Option<&str> {
        self.annotation(LAST_APPLIED_ANNOTATION)
    }

    /// Dependencies recorded on the live object.
    ///
    /// Malformed entries are ignored: they only influence prune ordering.
    pub fn depends_on(&self) -> Vec<ResourceKey> {
        self.annotation(DEPENDS_ON_ANNOTATION)
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.trim().is_empty())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parsed desired state of one application at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub repository: String,
    pub revision: String,
    resources: BTreeMap<ResourceKey, ResourceSpec>,
}

impl DesiredState {
    pub fn new(repository: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            revision: revision.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Add a resource.
    ///
    /// # Errors
    ///
    /// Returns the key back if a resource with the same key is already present.
    pub fn insert(&mut self, spec: ResourceSpec) -> std::result::Result<(), ResourceKey> {
        if self.resources.contains_key(&spec.key) {
            return Err(spec.key);
        }
        self.resources.insert(spec.key.clone(), spec);
        Ok(())
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceSpec> {
        self.resources.get(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    /// Resources in key order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.values()
    }

    pub fn keys(&self) -> BTreeSet<ResourceKey> {
        self.resources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// An independently reconciled unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub repository: String,
    pub revision: RevisionSelector,
    /// Namespaces to collect; empty means cluster-wide.
    pub namespaces: Vec<String>,
}

impl Application {
    pub fn new(
        id: impl Into<String>,
        repository: impl Into<String>,
        revision: RevisionSelector,
    ) -> Self {
        Self {
            id: ApplicationId::new(id),
            repository: repository.into(),
            revision,
            namespaces: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_namespaces(mut self, namespaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&drift_core::ApplicationConfig> for Application {
    fn from(config: &drift_core::ApplicationConfig) -> Self {
        Self {
            id: ApplicationId::new(config.id.clone()),
            repository: config.repository.clone(),
            revision: RevisionSelector::from(&config.revision),
            namespaces: config.namespaces.clone(),
        }
    }
}

fn metadata_entry<'a>(content: &'a Value, section: &str, name: &str) -> Option<&'a str> {
    content
        .get("metadata")
        .and_then(|m| m.get(section))
        .and_then(|s| s.get(name))
        .and_then(Value::as_str)
}

fn parse_depends_on(content: &Value) -> std::result::Result<Vec<ResourceKey>, String> {
    metadata_entry(content, "annotations", DEPENDS_ON_ANNOTATION)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ResourceKey::from_str)
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .transpose()
        .map(Option::unwrap_or_default)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_keys_order_by_kind_then_namespace_then_name() {
        let mut keys = vec![
            ResourceKey::namespaced("Service", "prod", "web"),
            ResourceKey::namespaced("Deployment", "prod", "web"),
            ResourceKey::cluster("Namespace", "prod"),
            ResourceKey::namespaced("Deployment", "dev", "web"),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "Deployment/dev/web",
                "Deployment/prod/web",
                "Namespace/prod",
                "Service/prod/web",
            ]
        );
    }

    #[test]
    fn resource_key_parses_both_forms() {
        assert_eq!(
            "Namespace/prod".parse::<ResourceKey>(),
            Ok(ResourceKey::cluster("Namespace", "prod"))
        );
        assert_eq!(
            "ConfigMap/prod/cfg".parse::<ResourceKey>(),
            Ok(ResourceKey::namespaced("ConfigMap", "prod", "cfg"))
        );
        assert!("ConfigMap".parse::<ResourceKey>().is_err());
        assert!("a//b".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn spec_from_document_reads_key_and_dependencies() {
        let doc = json!({
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "annotations": { DEPENDS_ON_ANNOTATION: "ConfigMap/prod/cfg, Secret/prod/creds" }
            },
            "spec": { "replicas": 2 }
        });
        let spec = ResourceSpec::from_document(doc).unwrap();
        assert_eq!(spec.key, ResourceKey::namespaced("Deployment", "prod", "web"));
        assert_eq!(
            spec.depends_on,
            vec![
                ResourceKey::namespaced("ConfigMap", "prod", "cfg"),
                ResourceKey::namespaced("Secret", "prod", "creds"),
            ]
        );
    }

    #[test]
    fn spec_from_document_requires_name() {
        let err = ResourceSpec::from_document(json!({ "kind": "Service", "metadata": {} }));
        assert!(err.is_err());
    }

    #[test]
    fn desired_state_rejects_duplicate_keys() {
        let spec = ResourceSpec::from_document(json!({
            "kind": "Namespace",
            "metadata": { "name": "prod" }
        }))
        .unwrap();
        let mut desired = DesiredState::new("deploy", "r1");
        assert!(desired.insert(spec.clone()).is_ok());
        assert_eq!(desired.insert(spec.clone()), Err(spec.key));
        assert_eq!(desired.len(), 1);
    }

    #[test]
    fn live_resource_management_marker() {
        let live = LiveResource {
            key: ResourceKey::namespaced("Deployment", "prod", "web"),
            content: json!({
                "kind": "Deployment",
                "metadata": {
                    "name": "web",
                    "namespace": "prod",
                    "labels": { MANAGED_BY_LABEL: "drift", APPLICATION_LABEL: "web" }
                }
            }),
            revision: RevisionToken::new("3"),
            last_modified_by: Some("drift".into()),
        };
        assert!(live.is_managed_by("drift", &ApplicationId::new("web")));
        assert!(!live.is_managed_by("drift", &ApplicationId::new("api")));
        assert!(!live.is_managed_by("other", &ApplicationId::new("web")));
    }

    #[test]
    fn namespace_containment() {
        let key = ResourceKey::namespaced("Deployment", "prod", "web");
        let ns = key.containing_namespace().unwrap();
        assert!(ns.is_namespace());
        assert_eq!(ns, ResourceKey::cluster("Namespace", "prod"));
        assert!(ns.containing_namespace().is_none());
    }
}
