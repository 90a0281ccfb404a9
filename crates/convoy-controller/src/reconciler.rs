//! Reconciler registry and the lifecycle shared by workload kinds.
//!
//! A reconciler is pure planning: it reads the cache and returns the
//! actions that move the store toward the resource's spec. It never writes,
//! sleeps or retries; the controller runtime executes the plan and the work
//! queue owns every retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use convoy_informer::CacheReader;
use convoy_state::{Resource, ResourceKey};

use crate::action::Action;
use crate::autoscaler::AutoscalerReconciler;
use crate::children::{CONTROLLER_REVISION, FINALIZER, REPLICA, delete_all};
use crate::conditions::{READY, conditions_of, set_condition, with_conditions};
use crate::deployment::DeploymentReconciler;
use crate::error::{ReconcileError, ReconcileResult};
use crate::statefulset::StatefulSetReconciler;

/// What a reconciler may look at.
pub struct ReconcileContext<'a> {
    pub cache: &'a CacheReader,
    /// Unix millis, used for condition transition times.
    pub now: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub actions: Vec<Action>,
    /// Revisit the key after this long even without a change.
    pub requeue_after: Option<Duration>,
}

impl ReconcilePlan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            requeue_after: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One variant per reconciled kind.
pub enum WorkloadReconciler {
    Deployment(DeploymentReconciler),
    StatefulSet(StatefulSetReconciler),
    HorizontalAutoscaler(AutoscalerReconciler),
}

impl WorkloadReconciler {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deployment(_) => DeploymentReconciler::KIND,
            Self::StatefulSet(_) => StatefulSetReconciler::KIND,
            Self::HorizontalAutoscaler(_) => AutoscalerReconciler::KIND,
        }
    }

    pub fn reconcile(
        &self,
        key: &ResourceKey,
        ctx: &ReconcileContext<'_>,
    ) -> ReconcileResult<ReconcilePlan> {
        match self {
            Self::Deployment(r) => r.reconcile(key, ctx),
            Self::StatefulSet(r) => r.reconcile(key, ctx),
            Self::HorizontalAutoscaler(r) => r.reconcile(key, ctx),
        }
    }
}

/// Reconcilers keyed by the kind they own.
#[derive(Default)]
pub struct Registry {
    reconcilers: BTreeMap<&'static str, WorkloadReconciler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, reconciler: WorkloadReconciler) -> Self {
        self.reconcilers.insert(reconciler.kind(), reconciler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&WorkloadReconciler> {
        self.reconcilers.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.reconcilers.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.reconcilers.keys().copied()
    }
}

// ── Shared workload lifecycle ─────────────────────────────────────

/// Result of the steps every owning workload runs before its own logic.
pub(crate) enum Lifecycle {
    /// Nothing blocks the normal path.
    Proceed(Arc<Resource>),
    /// The plan for this pass is already decided.
    Done(ReconcilePlan),
}

/// Orphan cleanup, finalizer bookkeeping and the deletion path.
///
/// `teardown` picks which replicas to delete next; it may hold some back to
/// keep an ordering.
pub(crate) fn workload_lifecycle(
    key: &ResourceKey,
    ctx: &ReconcileContext<'_>,
    teardown: impl Fn(&[Arc<Resource>]) -> Vec<Action>,
) -> Lifecycle {
    let replicas = ctx.cache.children_of(key, REPLICA);
    let revisions = ctx.cache.children_of(key, CONTROLLER_REVISION);

    let Some(resource) = ctx.cache.get(key) else {
        return Lifecycle::Done(ReconcilePlan::new(cleanup(&replicas, &revisions, &teardown)));
    };

    if resource.is_deleting() {
        if !replicas.is_empty() || !revisions.is_empty() {
            return Lifecycle::Done(ReconcilePlan::new(cleanup(&replicas, &revisions, &teardown)));
        }
        if resource.has_finalizer(FINALIZER) {
            let remaining = resource
                .finalizers
                .iter()
                .filter(|f| *f != FINALIZER)
                .cloned()
                .collect();
            return Lifecycle::Done(ReconcilePlan::new(vec![Action::update_finalizers(
                &resource, remaining,
            )]));
        }
        return Lifecycle::Done(ReconcilePlan::default());
    }

    if !resource.has_finalizer(FINALIZER) {
        let mut finalizers = resource.finalizers.clone();
        finalizers.push(FINALIZER.to_string());
        return Lifecycle::Done(ReconcilePlan::new(vec![Action::update_finalizers(
            &resource, finalizers,
        )]));
    }

    Lifecycle::Proceed(resource)
}

/// Replicas go first; revisions only once no replica is left.
fn cleanup(
    replicas: &[Arc<Resource>],
    revisions: &[Arc<Resource>],
    teardown: &impl Fn(&[Arc<Resource>]) -> Vec<Action>,
) -> Vec<Action> {
    if replicas.is_empty() {
        delete_all(revisions)
    } else {
        teardown(replicas)
    }
}

/// A status update if `status` differs from what is stored.
pub(crate) fn status_update(resource: &Resource, status: Value) -> Option<Action> {
    (resource.status != status).then(|| Action::update_status(resource, status))
}

pub(crate) fn to_status<T: Serialize>(status: &T) -> ReconcileResult<Value> {
    serde_json::to_value(status).map_err(|e| ReconcileError::Validation(e.to_string()))
}

/// Terminal plan for a spec that cannot be acted on: `Ready=False` with
/// reason `InvalidSpec`, the generation recorded, and nothing else touched.
/// Re-validating the same generation yields an empty plan.
pub(crate) fn invalid_spec(resource: &Resource, message: &str, now: u64) -> ReconcilePlan {
    let mut conditions = conditions_of(&resource.status);
    set_condition(&mut conditions, READY, false, "InvalidSpec", message, now);
    let mut status = with_conditions(&resource.status, &conditions);
    if let Value::Object(fields) = &mut status {
        fields.insert(
            "observed_generation".to_string(),
            Value::from(resource.generation),
        );
    }
    ReconcilePlan::new(status_update(resource, status).into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_spec_is_stable_for_a_generation() {
        let mut resource = Resource::new("Deployment", "default", "web", json!({}));
        resource.generation = 3;
        let plan = invalid_spec(&resource, "replicas: invalid type", 100);
        assert_eq!(plan.actions.len(), 1);

        let Action::Update {
            target: crate::action::UpdateTarget::Status(status),
            ..
        } = &plan.actions[0]
        else {
            panic!("expected status update");
        };
        assert_eq!(status["observed_generation"], 3);
        assert_eq!(status["conditions"][0]["reason"], "InvalidSpec");

        resource.status = status.clone();
        assert!(invalid_spec(&resource, "replicas: invalid type", 200).is_empty());
    }

    #[test]
    fn identical_status_is_not_written() {
        let mut resource = Resource::new("Deployment", "default", "web", json!({}));
        resource.status = json!({"replicas": 1});
        assert!(status_update(&resource, json!({"replicas": 1})).is_none());
        assert!(status_update(&resource, json!({"replicas": 2})).is_some());
    }
}
