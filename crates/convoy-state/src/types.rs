//! Domain types for the Convoy object store.
//!
//! A [`Resource`] is a generic envelope: identity and bookkeeping fields are
//! typed, while `spec` (desired state, written by clients) and `status`
//! (observed state, written by the owning controller) are free-form JSON
//! that each controller decodes into its own types.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateResult;

// ── Keys ──────────────────────────────────────────────────────────

/// Identity of a resource, and the unit of reconciliation work.
///
/// Deliberately carries no payload: whoever processes a key must re-read
/// the current object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Prefix shared by every table key of `kind`.
    pub fn kind_prefix(kind: &str) -> String {
        format!("{kind}/")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Weak back-reference from a child to the workload that owns it.
///
/// Owners are looked up by key; the `uid` guards against a same-named
/// replacement owner adopting the previous owner's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            match_labels: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

// ── Resource ──────────────────────────────────────────────────────

/// A stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    /// Starts at 1, bumped only when `spec` changes.
    #[serde(default)]
    pub generation: u64,
    /// Bumped on every change; used for optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Unix millis at which deletion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<u64>,
    /// Unix millis at which the store accepted the create.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
}

impl Resource {
    /// Build a resource to be passed to `create`. Store-managed fields are
    /// left at their defaults and filled in on write.
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: String::new(),
            generation: 0,
            resource_version: 0,
            labels: BTreeMap::new(),
            owner: None,
            finalizers: Vec::new(),
            deletion_timestamp: None,
            created_at: 0,
            spec,
            status: Value::Null,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Record `owner` as this resource's controller.
    pub fn with_owner(mut self, owner: &Resource) -> Self {
        self.owner = Some(OwnerReference {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
        });
        self
    }

    pub fn with_finalizer(mut self, finalizer: impl Into<String>) -> Self {
        self.finalizers.push(finalizer.into());
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.namespace, &self.name)
    }

    /// Key of the owning workload. Owners always live in the same namespace.
    pub fn owner_key(&self) -> Option<ResourceKey> {
        self.owner
            .as_ref()
            .map(|o| ResourceKey::new(&o.kind, &self.namespace, &o.name))
    }

    /// Whether `owner` is the exact object (not a same-named successor)
    /// this resource points at.
    pub fn is_owned_by(&self, owner: &Resource) -> bool {
        self.owner.as_ref().is_some_and(|o| {
            o.kind == owner.kind && o.name == owner.name && o.uid == owner.uid
        })
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Decode `spec` into a controller-specific type.
    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.spec.clone())
    }

    /// Decode `status`, falling back to the default for a fresh object or a
    /// status written by an older controller.
    pub fn status_as<T: DeserializeOwned + Default>(&self) -> T {
        if self.status.is_null() {
            return T::default();
        }
        serde_json::from_value(self.status.clone()).unwrap_or_default()
    }

    /// Build the composite key for the resources table.
    pub fn table_key(&self) -> String {
        self.key().to_string()
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// A single observation of a metric for a tracked resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub resource: ResourceKey,
    pub metric: String,
    pub value: f64,
    /// Unix millis.
    pub timestamp: u64,
}

impl MetricSample {
    /// Build the composite key for the samples table. The zero-padded
    /// timestamp keeps samples of one series in time order; `seq` keeps
    /// samples recorded in the same millisecond apart.
    pub fn table_key(&self, seq: u64) -> String {
        format!(
            "{}:{}:{:020}:{:020}",
            self.resource, self.metric, self.timestamp, seq
        )
    }

    pub fn series_prefix(resource: &ResourceKey, metric: &str) -> String {
        format!("{resource}:{metric}:")
    }
}

/// Where the autoscaler reads metric samples from.
pub trait MetricSource: Send + Sync {
    /// Samples of `metric` for `resource` recorded within the trailing
    /// `window`, oldest first.
    fn query(
        &self,
        resource: &ResourceKey,
        metric: &str,
        window: Duration,
    ) -> StateResult<Vec<MetricSample>>;

    /// Drop samples of `metric` for `resource` older than the trailing
    /// `retain` window. Returns the number removed.
    fn prune(&self, resource: &ResourceKey, metric: &str, retain: Duration) -> StateResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_display_is_kind_namespace_name() {
        let key = ResourceKey::new("Deployment", "default", "api");
        assert_eq!(key.to_string(), "Deployment/default/api");
    }

    #[test]
    fn selector_matches_subset() {
        let sel = LabelSelector::from_pairs([("app", "web")]);
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "front".to_string());
        assert!(sel.matches(&labels));

        labels.insert("app".to_string(), "db".to_string());
        assert!(!sel.matches(&labels));
        assert!(LabelSelector::everything().matches(&labels));
    }

    #[test]
    fn owner_key_uses_child_namespace() {
        let mut owner = Resource::new("StatefulSet", "prod", "db", json!({}));
        owner.uid = "abc".to_string();
        let child = Resource::new("Replica", "prod", "db-0", json!({})).with_owner(&owner);

        assert_eq!(
            child.owner_key(),
            Some(ResourceKey::new("StatefulSet", "prod", "db"))
        );
        assert!(child.is_owned_by(&owner));

        let mut successor = owner.clone();
        successor.uid = "def".to_string();
        assert!(!child.is_owned_by(&successor));
    }

    #[test]
    fn status_as_defaults_on_null() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        struct S {
            ready: bool,
        }
        let r = Resource::new("Replica", "default", "x", json!({}));
        assert_eq!(r.status_as::<S>(), S::default());
    }

    #[test]
    fn sample_keys_sort_by_time() {
        let key = ResourceKey::new("Deployment", "default", "api");
        let a = MetricSample {
            resource: key.clone(),
            metric: "cpu".to_string(),
            value: 1.0,
            timestamp: 9_000,
        };
        let b = MetricSample {
            timestamp: 10_000,
            ..a.clone()
        };
        assert!(a.table_key(7) < b.table_key(3));
        assert!(a.table_key(1) < a.table_key(2));
        assert!(a.table_key(0).starts_with(&MetricSample::series_prefix(&key, "cpu")));
    }
}
