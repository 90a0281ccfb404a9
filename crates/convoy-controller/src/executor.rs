//! Action executor — applies a reconcile plan to the store.
//!
//! Status updates always run last, so status only ever reflects writes that
//! already succeeded. The leader gate is checked before every single write:
//! a deposed instance stops between two actions, not after the plan.

use std::sync::Arc;

use tracing::{debug, warn};

use convoy_leader::LeaderGate;
use convoy_state::SharedStore;

use crate::action::{Action, UpdateTarget};
use crate::error::{ReconcileError, ReconcileResult};
use crate::metrics::ControllerMetrics;

pub struct Executor {
    store: SharedStore,
    gate: LeaderGate,
    metrics: Arc<ControllerMetrics>,
}

impl Executor {
    pub fn new(store: SharedStore, gate: LeaderGate, metrics: Arc<ControllerMetrics>) -> Self {
        Self {
            store,
            gate,
            metrics,
        }
    }

    pub fn gate(&self) -> &LeaderGate {
        &self.gate
    }

    /// Apply `actions` in order, status updates last. Stops at the first
    /// failure; returns how many actions were applied.
    pub fn execute(&self, actions: Vec<Action>) -> ReconcileResult<usize> {
        let (status, mut ordered): (Vec<Action>, Vec<Action>) =
            actions.into_iter().partition(Action::is_status_update);
        ordered.extend(status);

        let mut applied = 0;
        for action in &ordered {
            if !self.gate.is_leading() {
                warn!(key = %action.key(), verb = action.verb(), "not leading, refusing write");
                return Err(ReconcileError::NotLeader);
            }
            self.apply(action)?;
            self.metrics.record_action(action.verb());
            applied += 1;
        }
        Ok(applied)
    }

    fn apply(&self, action: &Action) -> ReconcileResult<()> {
        debug!(key = %action.key(), verb = action.verb(), "applying action");
        match action {
            Action::Create(resource) => {
                self.store.create(resource)?;
            }
            Action::Update {
                key,
                target,
                expected_version,
            } => match target {
                UpdateTarget::Spec(spec) => {
                    self.store.update_spec(key, spec.clone(), *expected_version)?;
                }
                UpdateTarget::Status(status) => {
                    self.store
                        .update_status(key, status.clone(), *expected_version)?;
                }
                UpdateTarget::Finalizers(finalizers) => {
                    self.store
                        .update_finalizers(key, finalizers.clone(), *expected_version)?;
                }
            },
            Action::Delete {
                key,
                expected_version,
            } => match self.store.delete(key, Some(*expected_version)) {
                Ok(_) => {}
                // Already gone is what we wanted.
                Err(e) if e.is_not_found() => {
                    debug!(%key, "delete target already gone");
                }
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use convoy_leader::{LeaderElector, LeaseConfig};
    use convoy_state::{
        ManualClock, ObjectStore, Resource, ResourceKey, StateStore, StoreOptions, SystemClock,
    };

    fn store() -> SharedStore {
        Arc::new(StateStore::open_in_memory().unwrap())
    }

    fn executor(store: &SharedStore) -> (Executor, Arc<ControllerMetrics>) {
        let metrics = Arc::new(ControllerMetrics::new());
        let gate = LeaderGate::always_leading(Arc::new(SystemClock));
        (Executor::new(store.clone(), gate, metrics.clone()), metrics)
    }

    #[test]
    fn status_updates_run_last() {
        let store = store();
        let (exec, metrics) = executor(&store);
        let owner = store
            .create(&Resource::new("Deployment", "default", "web", json!({})))
            .unwrap();

        let actions = vec![
            Action::update_status(&owner, json!({"replicas": 1})),
            Action::Create(Resource::new("Replica", "default", "web-0", json!({}))),
        ];
        assert_eq!(exec.execute(actions).unwrap(), 2);

        // The create bumped the global version before the status write; the
        // owner's own version was untouched, so the status write succeeded.
        let owner = store.get(&owner.key()).unwrap().unwrap();
        assert_eq!(owner.status, json!({"replicas": 1}));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.actions.get("create"), Some(&1));
        assert_eq!(snapshot.actions.get("update_status"), Some(&1));
    }

    #[test]
    fn stale_version_is_a_conflict() {
        let store = store();
        let (exec, _) = executor(&store);
        let web = store
            .create(&Resource::new("Deployment", "default", "web", json!({"replicas": 1})))
            .unwrap();
        store
            .update_spec(&web.key(), json!({"replicas": 2}), web.resource_version)
            .unwrap();

        let err = exec
            .execute(vec![Action::update_status(&web, json!({}))])
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }

    #[test]
    fn duplicate_create_is_a_conflict() {
        let store = store();
        let (exec, _) = executor(&store);
        let replica = Resource::new("Replica", "default", "web-0", json!({}));
        store.create(&replica).unwrap();
        let err = exec.execute(vec![Action::Create(replica)]).unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }

    #[test]
    fn deleting_a_missing_object_succeeds() {
        let store = store();
        let (exec, _) = executor(&store);
        let action = Action::Delete {
            key: ResourceKey::new("Replica", "default", "gone"),
            expected_version: 4,
        };
        assert_eq!(exec.execute(vec![action]).unwrap(), 1);
    }

    #[test]
    fn quota_surfaces_as_quota_error() {
        let store: SharedStore = Arc::new(
            StateStore::open_in_memory_with(StoreOptions {
                namespace_quota: Some(1),
                ..Default::default()
            })
            .unwrap(),
        );
        let (exec, _) = executor(&store);
        let err = exec
            .execute(vec![
                Action::Create(Resource::new("Replica", "default", "a", json!({}))),
                Action::Create(Resource::new("Replica", "default", "b", json!({}))),
            ])
            .unwrap_err();
        assert!(matches!(err, ReconcileError::QuotaExceeded { limit: 1, .. }));
        assert!(store.get(&ResourceKey::new("Replica", "default", "a")).unwrap().is_some());
    }

    #[test]
    fn closed_gate_blocks_every_write() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store: SharedStore = Arc::new(
            StateStore::open_in_memory_with(StoreOptions {
                clock: clock.clone(),
                ..Default::default()
            })
            .unwrap(),
        );
        let elector = LeaderElector::new(
            store.clone(),
            clock.clone(),
            "a",
            "controller",
            LeaseConfig::default(),
        );
        assert!(elector.try_acquire_or_renew().unwrap());
        let exec = Executor::new(store.clone(), elector.gate(), Arc::new(ControllerMetrics::new()));

        let create = |name: &str| Action::Create(Resource::new("Replica", "default", name, json!({})));
        assert_eq!(exec.execute(vec![create("a")]).unwrap(), 1);

        // No renewal within the renew deadline: the gate closes on its own.
        clock.advance(LeaseConfig::default().renew_deadline + Duration::from_millis(1));
        assert_eq!(
            exec.execute(vec![create("b")]).unwrap_err(),
            ReconcileError::NotLeader
        );
        assert!(store.get(&ResourceKey::new("Replica", "default", "b")).unwrap().is_none());
    }
}
