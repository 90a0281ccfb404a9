//! Controller runtime — informers, the work queue and a reconcile worker
//! pool, wired together.
//!
//! ```text
//! Informer ──notification──► forwarder ──key──► WorkQueue ──get──► worker
//!                                                   ▲                 │
//!                                                   └──retry/requeue──┤
//!                                                                     ▼
//!                                            Registry ─plan─► Executor ─► store
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use convoy_informer::{Cache, CacheReader, Informer, Notification};
use convoy_leader::LeaderGate;
use convoy_queue::{RetryClass, WorkQueue};
use convoy_state::{MetricSource, Resource, ResourceKey, SharedClock, SharedStore};

use crate::action::Action;
use crate::autoscaler::AutoscalerReconciler;
use crate::children::{CONTROLLER_REVISION, DEPLOYMENT, HORIZONTAL_AUTOSCALER, REPLICA, STATEFUL_SET};
use crate::conditions::{
    ConditionStatus, DEGRADED, QUOTA_EXCEEDED, conditions_of, find_condition, is_true,
    set_condition, with_conditions,
};
use crate::config::ControllerConfig;
use crate::deployment::DeploymentReconciler;
use crate::error::{ReconcileError, ReconcileResult};
use crate::executor::Executor;
use crate::metrics::ControllerMetrics;
use crate::reconciler::{ReconcileContext, Registry, WorkloadReconciler};
use crate::statefulset::StatefulSetReconciler;

/// Every kind the controllers read.
pub const WATCHED_KINDS: [&str; 5] = [
    DEPLOYMENT,
    STATEFUL_SET,
    HORIZONTAL_AUTOSCALER,
    REPLICA,
    CONTROLLER_REVISION,
];

/// Reason of the `Degraded` condition set for keys stuck in backoff.
const BACKOFF_EXCEEDED: &str = "BackoffExceeded";

const SYNC_POLL: Duration = Duration::from_millis(20);

pub struct Controller {
    cache: Cache,
    informers: Vec<Arc<Informer>>,
    registry: Registry,
    queue: WorkQueue<ResourceKey>,
    executor: Executor,
    metrics: Arc<ControllerMetrics>,
    clock: SharedClock,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: SharedStore,
        metric_source: Arc<dyn MetricSource>,
        clock: SharedClock,
        gate: LeaderGate,
        config: ControllerConfig,
    ) -> Self {
        let cache = Cache::new();
        let informers = WATCHED_KINDS
            .iter()
            .map(|kind| {
                Arc::new(
                    Informer::new(*kind, store.clone(), cache.clone())
                        .with_resync_period(config.resync_period),
                )
            })
            .collect();

        let registry = Registry::new()
            .register(WorkloadReconciler::Deployment(DeploymentReconciler::new()))
            .register(WorkloadReconciler::StatefulSet(StatefulSetReconciler::new()))
            .register(WorkloadReconciler::HorizontalAutoscaler(
                AutoscalerReconciler::new(metric_source, clock.clone(), config.autoscale.sync_period),
            ));

        let metrics = Arc::new(ControllerMetrics::new());
        let executor = Executor::new(store, gate, metrics.clone());

        Self {
            cache,
            informers,
            registry,
            queue: WorkQueue::with_backoff(config.backoff.policy()),
            executor,
            metrics,
            clock,
            config,
        }
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    pub fn cache(&self) -> CacheReader {
        self.cache.reader()
    }

    pub fn queue(&self) -> &WorkQueue<ResourceKey> {
        &self.queue
    }

    pub fn has_synced(&self) -> bool {
        self.informers.iter().all(|i| i.has_synced())
    }

    /// One reconcile pass for `key`: plan against the cache, then execute.
    /// Returns the requested requeue delay.
    pub fn reconcile(&self, key: &ResourceKey) -> ReconcileResult<Option<Duration>> {
        let Some(reconciler) = self.registry.get(&key.kind) else {
            warn!(%key, "no reconciler registered for kind");
            return Ok(None);
        };
        let reader = self.cache.reader();
        let ctx = ReconcileContext {
            cache: &reader,
            now: self.clock.now_millis(),
        };
        let plan = reconciler.reconcile(key, &ctx)?;
        if !plan.is_empty() {
            let applied = self.executor.execute(plan.actions)?;
            debug!(%key, applied, "reconciled");
        }
        Ok(plan.requeue_after)
    }

    /// Route a reconcile outcome to the queue. Returns `false` when the
    /// worker must stop.
    fn handle_result(&self, key: &ResourceKey, result: ReconcileResult<Option<Duration>>) -> bool {
        let err = match result {
            Ok(requeue_after) => {
                self.queue.forget(key);
                if let Some(after) = requeue_after {
                    self.queue.add_after(key.clone(), after);
                }
                self.clear_failure_conditions(key);
                return true;
            }
            Err(err) => err,
        };
        self.metrics.record_error(err.class());

        match &err {
            ReconcileError::Conflict(_) | ReconcileError::NotFound(_) => {
                debug!(%key, error = %err, "re-reconciling from fresh state");
                self.queue.add(key.clone());
            }
            ReconcileError::Transient(_) => {
                let delay = self.queue.add_rate_limited(key.clone(), RetryClass::Standard);
                warn!(%key, error = %err, ?delay, "reconcile failed, retrying");
                self.report_degraded(key, &err);
            }
            ReconcileError::QuotaExceeded { .. } => {
                let delay = self.queue.add_rate_limited(key.clone(), RetryClass::Quota);
                warn!(%key, error = %err, ?delay, "quota exceeded, backing off");
                self.set_runtime_condition(key, QUOTA_EXCEEDED, true, "QuotaExceeded", &err.to_string());
                self.report_degraded(key, &err);
            }
            ReconcileError::Validation(_) => {
                warn!(%key, error = %err, "invalid object, not retrying");
                self.queue.forget(key);
            }
            ReconcileError::NotLeader => {
                error!(%key, "leadership lost, stopping reconciliation");
                self.queue.shut_down();
                return false;
            }
        }
        true
    }

    fn report_degraded(&self, key: &ResourceKey, err: &ReconcileError) {
        let Some(failing) = self.queue.failing_for(key) else {
            return;
        };
        if failing >= self.config.degraded_after {
            let message = format!("reconcile failing with {} errors", err.class());
            self.set_runtime_condition(key, DEGRADED, true, BACKOFF_EXCEEDED, &message);
        }
    }

    fn clear_failure_conditions(&self, key: &ResourceKey) {
        let Some(resource) = self.cache.reader().get(key) else {
            return;
        };
        let conditions = conditions_of(&resource.status);
        if is_true(&conditions, QUOTA_EXCEEDED) {
            self.set_runtime_condition(key, QUOTA_EXCEEDED, false, "QuotaAvailable", "");
        }
        if find_condition(&conditions, DEGRADED)
            .is_some_and(|c| c.reason == BACKOFF_EXCEEDED && c.status == ConditionStatus::True)
        {
            self.set_runtime_condition(key, DEGRADED, false, "Recovered", "");
        }
    }

    /// Write a runtime-owned condition onto `key`, reading the object fresh
    /// from the store. Failures are logged; the next outcome retries.
    fn set_runtime_condition(&self, key: &ResourceKey, type_: &str, status: bool, reason: &str, message: &str) {
        let result = self.store_condition(key, type_, status, reason, message);
        if let Err(e) = result {
            debug!(%key, condition = type_, error = %e, "could not record condition");
        }
    }

    fn store_condition(
        &self,
        key: &ResourceKey,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
    ) -> ReconcileResult<()> {
        let Some(resource) = self.cache.reader().get(key) else {
            return Ok(());
        };
        let mut conditions = conditions_of(&resource.status);
        let before = conditions.clone();
        set_condition(&mut conditions, type_, status, reason, message, self.clock.now_millis());
        if conditions == before {
            return Ok(());
        }
        let status = with_conditions(&resource.status, &conditions);
        self.executor
            .execute(vec![Action::update_status(&resource, status)])?;
        Ok(())
    }

    fn enqueue_for(&self, resource: &Resource) {
        if self.registry.contains(&resource.kind) {
            self.queue.add(resource.key());
        }
        if let Some(owner) = resource.owner_key()
            && self.registry.contains(&owner.kind)
        {
            self.queue.add(owner);
        }
        self.metrics.set_queue_depth(self.queue.len());
    }

    async fn forward(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                notification = notifications.recv() => match notification {
                    Some(n) => self.enqueue_for(&n.resource),
                    None => return,
                },
                _ = stop.changed() => return,
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "reconcile worker started");
        while let Some(key) = self.queue.get().await {
            self.metrics.record_reconcile();
            let result = self.reconcile(&key);
            let keep_going = self.handle_result(&key, result);
            self.queue.done(&key);
            self.metrics.set_queue_depth(self.queue.len());
            if !keep_going {
                break;
            }
            tokio::task::yield_now().await;
        }
        debug!(worker = id, "reconcile worker stopped");
    }

    /// Run informers and workers until `shutdown` fires or leadership is
    /// lost. On shutdown, in-flight reconciles get `drain_timeout` to finish;
    /// queued keys are dropped and picked up again by the next relist.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        for informer in &self.informers {
            let notifications = informer.subscribe();
            background.push(tokio::spawn(
                self.clone().forward(notifications, stop_rx.clone()),
            ));
            let informer = informer.clone();
            let stop = stop_rx.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = informer.run(stop).await {
                    error!(kind = informer.kind(), error = %e, "informer stopped");
                }
            }));
        }

        info!(kinds = ?WATCHED_KINDS, "waiting for caches to sync");
        while !self.has_synced() {
            tokio::select! {
                _ = tokio::time::sleep(SYNC_POLL) => {}
                _ = shutdown.changed() => {
                    let _ = stop_tx.send(true);
                    for handle in background {
                        let _ = handle.await;
                    }
                    return Ok(());
                }
            }
        }

        // Children whose owner vanished while we were not watching.
        for owner in self.cache.reader().orphaned_owners() {
            if self.registry.contains(&owner.kind) {
                self.queue.add(owner);
            }
        }

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|id| tokio::spawn(self.clone().worker(id)))
            .collect();
        info!(workers = self.config.workers, "controller started");

        let drain = async {
            for handle in workers {
                let _ = handle.await;
            }
        };
        tokio::pin!(drain);

        tokio::select! {
            _ = shutdown.changed() => {
                info!(in_flight = self.queue.in_flight(), "shutting down, draining in-flight reconciles");
                self.queue.shut_down();
                if tokio::time::timeout(self.config.drain_timeout, &mut drain).await.is_err() {
                    warn!(timeout = ?self.config.drain_timeout, "drain timed out");
                }
            }
            _ = &mut drain => {
                warn!("all reconcile workers stopped");
            }
        }

        let _ = stop_tx.send(true);
        for handle in background {
            let _ = handle.await;
        }
        info!("controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use convoy_state::{ObjectStore, StateStore, SystemClock};

    fn controller() -> (Arc<StateStore>, Controller) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let clock: SharedClock = Arc::new(SystemClock);
        let controller = Controller::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            LeaderGate::always_leading(clock),
            ControllerConfig::default(),
        );
        (store, controller)
    }

    #[tokio::test]
    async fn child_events_enqueue_their_owner() {
        let (store, controller) = controller();
        let owner = store
            .create(&Resource::new(DEPLOYMENT, "default", "web", json!({})))
            .unwrap();
        let replica = Resource::new(REPLICA, "default", "web-0", json!({})).with_owner(&owner);
        controller.enqueue_for(&replica);
        controller.enqueue_for(&owner);
        // Coalesced into a single key.
        assert_eq!(controller.queue().len(), 1);
        assert_eq!(controller.queue().get().await, Some(owner.key()));

        let unowned = Resource::new(REPLICA, "default", "stray", json!({}));
        controller.enqueue_for(&unowned);
        assert_eq!(controller.queue().len(), 0);
    }

    #[tokio::test]
    async fn conflicts_requeue_without_backoff() {
        let (_, controller) = controller();
        let key = ResourceKey::new(DEPLOYMENT, "default", "web");
        assert!(controller.handle_result(&key, Err(ReconcileError::Conflict("stale".into()))));
        assert_eq!(controller.queue().len(), 1);
        assert_eq!(controller.queue().num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn transient_errors_back_off_and_success_forgets() {
        let (_, controller) = controller();
        let key = ResourceKey::new(DEPLOYMENT, "default", "web");
        controller.handle_result(&key, Err(ReconcileError::Transient("io".into())));
        controller.handle_result(&key, Err(ReconcileError::Transient("io".into())));
        assert_eq!(controller.queue().num_requeues(&key), 2);
        assert_eq!(controller.queue().len(), 0);
        assert_eq!(controller.queue().delayed_len(), 1);

        controller.handle_result(&key, Ok(None));
        assert_eq!(controller.queue().num_requeues(&key), 0);
        let snapshot = controller.metrics().snapshot();
        assert_eq!(snapshot.errors.get("transient"), Some(&2));
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let (_, controller) = controller();
        let key = ResourceKey::new(DEPLOYMENT, "default", "web");
        controller.handle_result(&key, Err(ReconcileError::Validation("bad".into())));
        assert!(controller.queue().is_empty());
        assert_eq!(controller.queue().delayed_len(), 0);
    }

    #[tokio::test]
    async fn not_leader_stops_the_queue() {
        let (_, controller) = controller();
        let key = ResourceKey::new(DEPLOYMENT, "default", "web");
        assert!(!controller.handle_result(&key, Err(ReconcileError::NotLeader)));
        assert!(controller.queue().is_shutting_down());
    }

    #[tokio::test]
    async fn run_returns_on_shutdown() {
        let (_, controller) = controller();
        let controller = Arc::new(controller);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.clone().run(rx));
        while !controller.has_synced() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
