//! Deployment controller — interchangeable replicas rolled with surge and
//! unavailability budgets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use convoy_ordering::{Member, OrderingPhase, RollingUpdateStrategy, Step, plan_rolling};
use convoy_state::{Resource, ResourceKey};

use crate::action::Action;
use crate::children::{
    CONTROLLER_REVISION, DEPLOYMENT, REPLICA, RevisionSpec, delete_all, member_of, new_replica,
    split_owned, sync_revisions, template_for, template_labels,
};
use crate::conditions::{Condition, PROGRESSING, READY, set_condition};
use crate::error::ReconcileResult;
use crate::reconciler::{
    Lifecycle, ReconcileContext, ReconcilePlan, invalid_spec, status_update, to_status,
    workload_lifecycle,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Labels every member must carry; the template must agree.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub template: Value,
    #[serde(default)]
    pub strategy: RollingUpdateStrategy,
    #[serde(default = "default_history_limit")]
    pub revision_history_limit: usize,
    /// Hold the rollout where it is. Scaling still applies.
    #[serde(default)]
    pub paused: bool,
}

fn default_replicas() -> u32 {
    1
}

fn default_history_limit() -> usize {
    10
}

impl DeploymentSpec {
    pub fn validate(&self) -> Result<(), String> {
        if !self.template.is_object() {
            return Err("template must be an object".into());
        }
        self.strategy.validate().map_err(|e| e.to_string())?;
        let labels = template_labels(&self.template);
        for (k, v) in &self.selector {
            if labels.get(k) != Some(v) {
                return Err(format!("selector {k}={v} does not match template labels"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentStatus {
    pub observed_generation: u64,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub updated_replicas: u32,
    pub update_revision: String,
    pub revision: u64,
    pub phase: Option<OrderingPhase>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Default)]
pub struct DeploymentReconciler;

impl DeploymentReconciler {
    pub const KIND: &'static str = DEPLOYMENT;

    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(
        &self,
        key: &ResourceKey,
        ctx: &ReconcileContext<'_>,
    ) -> ReconcileResult<ReconcilePlan> {
        let resource = match workload_lifecycle(key, ctx, delete_all) {
            Lifecycle::Proceed(resource) => resource,
            Lifecycle::Done(plan) => return Ok(plan),
        };

        let spec: DeploymentSpec = match resource.spec_as() {
            Ok(spec) => spec,
            Err(e) => return Ok(invalid_spec(&resource, &e.to_string(), ctx.now)),
        };
        if let Err(message) = spec.validate() {
            return Ok(invalid_spec(&resource, &message, ctx.now));
        }

        let replicas = split_owned(&resource, ctx.cache.children_of(key, REPLICA));
        let revisions = split_owned(&resource, ctx.cache.children_of(key, CONTROLLER_REVISION));
        let mut actions = delete_all(&replicas.stale);
        actions.extend(delete_all(&revisions.stale));

        let members: Vec<Member> = replicas.owned.iter().map(|r| member_of(r)).collect();
        let referenced: HashSet<String> = members.iter().map(|m| m.revision.clone()).collect();

        let paused_on = if spec.paused {
            majority_revision(&members)
                .and_then(|hash| template_for(&revisions.owned, &hash).map(|t| (hash, t)))
        } else {
            None
        };

        let (update_hash, update_revision, template) = match paused_on {
            Some((hash, template)) => {
                let revision = revisions
                    .owned
                    .iter()
                    .find_map(|r| {
                        let spec: RevisionSpec = r.spec_as().ok()?;
                        (spec.hash == hash).then_some(spec.revision)
                    })
                    .unwrap_or_default();
                (hash, revision, template)
            }
            None => {
                let sync = sync_revisions(
                    &resource,
                    &spec.template,
                    &revisions.owned,
                    &referenced,
                    spec.revision_history_limit,
                )?;
                actions.extend(sync.actions);
                (sync.update_hash, sync.update_revision, spec.template.clone())
            }
        };

        let plan = plan_rolling(spec.replicas, &members, &update_hash, &spec.strategy);
        let by_name: HashMap<&str, &Arc<Resource>> =
            replicas.owned.iter().map(|r| (r.name.as_str(), r)).collect();
        for step in &plan.steps {
            match step {
                Step::Create { ordinal } => {
                    actions.push(Action::Create(new_replica(
                        &resource,
                        *ordinal,
                        &update_hash,
                        &template,
                    )?));
                }
                Step::Delete { name } => {
                    if let Some(replica) = by_name.get(name.as_str()) {
                        actions.push(Action::delete(replica));
                    }
                }
            }
        }

        let mut status: DeploymentStatus = resource.status_as();
        status.observed_generation = resource.generation;
        status.replicas = plan.intent.current;
        status.ready_replicas = plan.intent.ready;
        status.updated_replicas = plan.updated;
        status.update_revision = update_hash;
        status.revision = update_revision;
        status.phase = Some(plan.phase);

        let ready_message = format!("{}/{} replicas ready", plan.intent.ready, spec.replicas);
        if plan.is_stable() {
            set_condition(&mut status.conditions, READY, true, "AllReplicasReady", ready_message, ctx.now);
        } else {
            set_condition(&mut status.conditions, READY, false, "ReplicasNotReady", ready_message, ctx.now);
        }
        if spec.paused {
            set_condition(&mut status.conditions, PROGRESSING, false, "Paused", "rollout paused", ctx.now);
        } else if plan.is_stable() {
            set_condition(&mut status.conditions, PROGRESSING, false, "Complete", "", ctx.now);
        } else {
            let reason = phase_reason(plan.phase);
            let message = format!("{}/{} replicas updated", plan.updated, spec.replicas);
            set_condition(&mut status.conditions, PROGRESSING, true, reason, message, ctx.now);
        }

        debug!(
            %key,
            phase = ?plan.phase,
            desired = spec.replicas,
            current = plan.intent.current,
            ready = plan.intent.ready,
            actions = actions.len(),
            "planned deployment"
        );
        actions.extend(status_update(&resource, to_status(&status)?));
        Ok(ReconcilePlan::new(actions))
    }
}

pub(crate) fn phase_reason(phase: OrderingPhase) -> &'static str {
    match phase {
        OrderingPhase::ScalingUp => "ScalingUp",
        OrderingPhase::ScalingDown => "ScalingDown",
        OrderingPhase::RollingUpdate => "RollingUpdate",
        OrderingPhase::Stable => "Stable",
    }
}

/// Revision most live members run. Ties go to the lexically smallest hash
/// so the choice is stable between passes.
fn majority_revision(members: &[Member]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for m in members.iter().filter(|m| !m.terminating) {
        *counts.entry(m.revision.as_str()).or_default() += 1;
    }
    let best = counts.values().copied().max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == best)
        .map(|(hash, _)| hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use convoy_informer::{Cache, Informer};
    use convoy_state::{ObjectStore, SharedStore, StateStore};

    use crate::children::{FINALIZER, ReplicaStatus};
    use crate::conditions::{find_condition, is_true};
    use crate::executor::Executor;
    use crate::metrics::ControllerMetrics;
    use convoy_leader::LeaderGate;
    use convoy_state::SystemClock;

    struct Harness {
        store: SharedStore,
        cache: Cache,
        executor: Executor,
    }

    impl Harness {
        fn new() -> Self {
            let store: SharedStore = Arc::new(StateStore::open_in_memory().unwrap());
            let gate = LeaderGate::always_leading(Arc::new(SystemClock));
            let executor = Executor::new(store.clone(), gate, Arc::new(ControllerMetrics::new()));
            Self {
                store,
                cache: Cache::new(),
                executor,
            }
        }

        fn refresh(&self) {
            for kind in [DEPLOYMENT, REPLICA, CONTROLLER_REVISION] {
                Informer::new(kind, self.store.clone(), self.cache.clone())
                    .relist()
                    .unwrap();
            }
        }

        fn plan(&self, key: &ResourceKey) -> ReconcilePlan {
            self.refresh();
            let reader = self.cache.reader();
            let ctx = ReconcileContext {
                cache: &reader,
                now: 1_000,
            };
            DeploymentReconciler::new().reconcile(key, &ctx).unwrap()
        }

        fn step(&self, key: &ResourceKey) -> ReconcilePlan {
            let plan = self.plan(key);
            self.executor.execute(plan.actions.clone()).unwrap();
            plan
        }

        fn replicas(&self) -> Vec<Resource> {
            self.store
                .list(REPLICA, Some("default"), &Default::default())
                .unwrap()
        }

        /// Play the node agent: mark every live replica Ready.
        fn mark_ready(&self) {
            for r in self.replicas() {
                if !r.is_deleting() && !r.status_as::<ReplicaStatus>().ready {
                    self.store
                        .update_status(&r.key(), json!({"ready": true}), r.resource_version)
                        .unwrap();
                }
            }
        }

        fn converge(&self, key: &ResourceKey) {
            for _ in 0..50 {
                let plan = self.step(key);
                self.mark_ready();
                if plan.is_empty() {
                    return;
                }
            }
            panic!("deployment did not converge");
        }

        fn deployment(&self, key: &ResourceKey) -> Resource {
            self.store.get(key).unwrap().unwrap()
        }
    }

    fn create_deployment(store: &SharedStore, spec: Value) -> ResourceKey {
        let created = store
            .create(&Resource::new(DEPLOYMENT, "default", "web", spec))
            .unwrap();
        created.key()
    }

    #[test]
    fn first_pass_only_adds_finalizer() {
        let h = Harness::new();
        let key = create_deployment(&h.store, json!({"replicas": 2, "template": {"image": "web:1"}}));
        let plan = h.step(&key);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].verb(), "update_finalizers");
        assert!(h.deployment(&key).has_finalizer(FINALIZER));
    }

    #[test]
    fn converges_and_is_idempotent() {
        let h = Harness::new();
        let key = create_deployment(&h.store, json!({"replicas": 3, "template": {"image": "web:1"}}));
        h.converge(&key);

        let replicas = h.replicas();
        assert_eq!(replicas.len(), 3);
        let status: DeploymentStatus = h.deployment(&key).status_as();
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(status.phase, Some(OrderingPhase::Stable));
        assert!(is_true(&status.conditions, READY));

        assert!(h.plan(&key).is_empty());
        assert!(h.plan(&key).is_empty());
    }

    #[test]
    fn scale_up_waits_for_readiness() {
        let h = Harness::new();
        let key = create_deployment(&h.store, json!({"replicas": 2, "template": {"image": "web:1"}}));
        h.converge(&key);

        let d = h.deployment(&key);
        let mut spec = d.spec.clone();
        spec["replicas"] = json!(5);
        h.store.update_spec(&key, spec, d.resource_version).unwrap();

        let mut creates = 0;
        for _ in 0..50 {
            let plan = h.step(&key);
            let batch = plan.actions.iter().filter(|a| a.verb() == "create").count();
            assert!(batch <= 1, "surge of one allows a single pending replica");
            creates += batch;
            // Nothing new while the last replica is still unready.
            if batch == 1 {
                let again = h.plan(&key);
                assert_eq!(again.actions.iter().filter(|a| a.verb() == "create").count(), 0);
            }
            h.mark_ready();
            if plan.is_empty() {
                break;
            }
        }
        assert_eq!(creates, 3);
        assert_eq!(h.replicas().len(), 5);
    }

    #[test]
    fn rolling_update_replaces_every_replica() {
        let h = Harness::new();
        let key = create_deployment(&h.store, json!({"replicas": 3, "template": {"image": "web:1"}}));
        h.converge(&key);
        let old: DeploymentStatus = h.deployment(&key).status_as();

        let d = h.deployment(&key);
        let mut spec = d.spec.clone();
        spec["template"] = json!({"image": "web:2"});
        h.store.update_spec(&key, spec, d.resource_version).unwrap();
        h.converge(&key);

        let status: DeploymentStatus = h.deployment(&key).status_as();
        assert_ne!(status.update_revision, old.update_revision);
        assert_eq!(status.revision, 2);
        assert_eq!(status.updated_replicas, 3);
        for r in h.replicas() {
            assert_eq!(member_of(&r).revision, status.update_revision);
        }
    }

    #[test]
    fn paused_deployment_holds_rollout_but_scales() {
        let h = Harness::new();
        let key = create_deployment(&h.store, json!({"replicas": 2, "template": {"image": "web:1"}}));
        h.converge(&key);
        let before: DeploymentStatus = h.deployment(&key).status_as();

        let d = h.deployment(&key);
        let spec = json!({"replicas": 3, "paused": true, "template": {"image": "web:2"}});
        h.store.update_spec(&key, spec, d.resource_version).unwrap();
        h.converge(&key);

        let status: DeploymentStatus = h.deployment(&key).status_as();
        assert_eq!(status.update_revision, before.update_revision);
        assert_eq!(h.replicas().len(), 3);
        let progressing = find_condition(&status.conditions, PROGRESSING).unwrap();
        assert_eq!(progressing.reason, "Paused");
    }

    #[test]
    fn invalid_strategy_is_terminal() {
        let h = Harness::new();
        let key = create_deployment(
            &h.store,
            json!({"replicas": 2, "template": {}, "strategy": {"max_surge": 0, "max_unavailable": 0}}),
        );
        h.step(&key);
        let plan = h.step(&key);
        assert_eq!(plan.actions.len(), 1);
        assert!(plan.actions[0].is_status_update());
        assert!(h.plan(&key).is_empty());
        assert!(h.replicas().is_empty());

        let status: DeploymentStatus = h.deployment(&key).status_as();
        let ready = find_condition(&status.conditions, READY).unwrap();
        assert_eq!(ready.reason, "InvalidSpec");
    }

    #[test]
    fn deletion_removes_children_then_finalizer() {
        let h = Harness::new();
        let key = create_deployment(&h.store, json!({"replicas": 2, "template": {"image": "web:1"}}));
        h.converge(&key);

        let d = h.deployment(&key);
        h.store.delete(&key, Some(d.resource_version)).unwrap();
        for _ in 0..10 {
            h.step(&key);
            if h.store.get(&key).unwrap().is_none() {
                break;
            }
        }
        assert!(h.store.get(&key).unwrap().is_none());
        assert!(h.replicas().is_empty());
        assert!(
            h.store
                .list(CONTROLLER_REVISION, None, &Default::default())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn majority_prefers_most_common_revision() {
        let member = |name: &str, rev: &str| Member {
            name: name.into(),
            ordinal: 0,
            revision: rev.into(),
            ready: true,
            terminating: false,
            created_at: 0,
        };
        let members = vec![member("a", "bbb"), member("b", "aaa"), member("c", "bbb")];
        assert_eq!(majority_revision(&members).as_deref(), Some("bbb"));
        assert_eq!(majority_revision(&[]), None);
    }
}
