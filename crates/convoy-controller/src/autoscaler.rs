//! HorizontalAutoscaler controller.
//!
//! Evaluates its target at most once per sync period (or at once after a
//! spec change) and writes the decision into the target's `spec.replicas`.
//! Status updates and target writes do not trigger extra evaluations, so
//! the scale-up rate limit holds per period.
//!
//! Metric reads and sample pruning run outside the engine lock, so
//! autoscalers for different targets reconcile in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use convoy_autoscale::{
    AutoscalePolicy, Autoscaler, MetricTarget, ScaleDecision, ScaleLimit, ScaleReason,
    ScalingBehavior, collect_samples,
};
use convoy_state::{MetricSource, ResourceKey, SharedClock};

use crate::action::Action;
use crate::children::{DEPLOYMENT, HORIZONTAL_AUTOSCALER, STATEFUL_SET};
use crate::conditions::{
    Condition, DEGRADED, SCALING_ACTIVE, SCALING_LIMITED, find_condition, set_condition,
};
use crate::error::ReconcileResult;
use crate::reconciler::{ReconcileContext, ReconcilePlan, invalid_spec, status_update, to_status};

/// Reason used for the `Degraded` condition this controller owns.
const METRICS_UNAVAILABLE: &str = "MetricsUnavailable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTargetRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    pub target: ScaleTargetRef,
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metrics: Vec<MetricTarget>,
    #[serde(default)]
    pub behavior: ScalingBehavior,
}

fn default_min_replicas() -> u32 {
    1
}

impl AutoscalerSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.target.kind != DEPLOYMENT && self.target.kind != STATEFUL_SET {
            return Err(format!("cannot scale kind {}", self.target.kind));
        }
        if self.min_replicas == 0 {
            return Err("min_replicas must be at least 1".into());
        }
        if self.max_replicas < self.min_replicas {
            return Err("max_replicas must not be below min_replicas".into());
        }
        if self.metrics.is_empty() {
            return Err("at least one metric is required".into());
        }
        if let Some(m) = self.metrics.iter().find(|m| m.target_value <= 0.0) {
            return Err(format!("metric {} needs a positive target_value", m.name));
        }
        Ok(())
    }

    pub fn policy(&self) -> AutoscalePolicy {
        AutoscalePolicy {
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            metrics: self.metrics.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerStatus {
    pub observed_generation: u64,
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub current_metrics: Vec<MetricValue>,
    /// Unix millis of the last change to the target's replica count.
    pub last_scale_time: Option<u64>,
    pub conditions: Vec<Condition>,
}

struct Evaluation {
    at: u64,
    generation: u64,
    target: ResourceKey,
}

struct State {
    engine: Autoscaler,
    evaluations: HashMap<ResourceKey, Evaluation>,
}

pub struct AutoscalerReconciler {
    source: Arc<dyn MetricSource>,
    state: Mutex<State>,
    sync_period: Duration,
}

impl AutoscalerReconciler {
    pub const KIND: &'static str = HORIZONTAL_AUTOSCALER;

    pub fn new(source: Arc<dyn MetricSource>, clock: SharedClock, sync_period: Duration) -> Self {
        Self {
            source: source.clone(),
            state: Mutex::new(State {
                engine: Autoscaler::new(source, clock),
                evaluations: HashMap::new(),
            }),
            sync_period,
        }
    }

    pub fn reconcile(
        &self,
        key: &ResourceKey,
        ctx: &ReconcileContext<'_>,
    ) -> ReconcileResult<ReconcilePlan> {
        let mut state = self.lock();

        let Some(resource) = ctx.cache.get(key) else {
            if let Some(last) = state.evaluations.remove(key) {
                debug!(%key, target = %last.target, "autoscaler removed, dropping history");
                state.engine.forget(&last.target);
            }
            return Ok(ReconcilePlan::default());
        };
        if resource.is_deleting() {
            return Ok(ReconcilePlan::default());
        }

        let spec: AutoscalerSpec = match resource.spec_as() {
            Ok(spec) => spec,
            Err(e) => return Ok(invalid_spec(&resource, &e.to_string(), ctx.now)),
        };
        if let Err(message) = spec.validate() {
            return Ok(invalid_spec(&resource, &message, ctx.now));
        }
        let target_key = ResourceKey::new(&spec.target.kind, &resource.namespace, &spec.target.name);
        let period_ms = self.sync_period.as_millis() as u64;

        if let Some(last) = state.evaluations.get(key)
            && last.generation == resource.generation
            && last.target == target_key
        {
            let due = last.at.saturating_add(period_ms);
            if ctx.now < due {
                return Ok(ReconcilePlan {
                    actions: Vec::new(),
                    requeue_after: Some(Duration::from_millis(due - ctx.now)),
                });
            }
        }
        if let Some(previous) = state.evaluations.get(key).map(|e| e.target.clone())
            && previous != target_key
        {
            state.engine.forget(&previous);
        }
        state.evaluations.insert(
            key.clone(),
            Evaluation {
                at: ctx.now,
                generation: resource.generation,
                target: target_key.clone(),
            },
        );

        drop(state);

        let mut status: AutoscalerStatus = resource.status_as();
        status.observed_generation = resource.generation;
        let mut actions = Vec::new();

        match ctx.cache.get(&target_key) {
            None => {
                set_condition(
                    &mut status.conditions,
                    SCALING_ACTIVE,
                    false,
                    "TargetNotFound",
                    format!("{target_key} does not exist"),
                    ctx.now,
                );
            }
            Some(target) => {
                let current = target
                    .spec
                    .get("replicas")
                    .and_then(Value::as_u64)
                    .map_or(1, |r| r as u32);
                let policy = spec.policy();
                let samples = collect_samples(self.source.as_ref(), &target_key, &policy)?;
                let decision = self
                    .lock()
                    .engine
                    .decide(&target_key, current, &policy, &samples);
                self.prune_expired(&target_key, &policy);

                if decision.desired != current && !target.is_deleting() {
                    let mut target_spec = target.spec.clone();
                    if let Value::Object(fields) = &mut target_spec {
                        fields.insert("replicas".to_string(), Value::from(decision.desired));
                        actions.push(Action::update_spec(&target, target_spec));
                        status.last_scale_time = Some(ctx.now);
                        info!(
                            %key,
                            target = %target_key,
                            from = current,
                            to = decision.desired,
                            reason = ?decision.reason,
                            "rescaling target"
                        );
                    }
                }

                status.current_replicas = current;
                status.desired_replicas = decision.desired;
                status.current_metrics = decision
                    .metric_values
                    .iter()
                    .map(|(name, value)| MetricValue {
                        name: name.clone(),
                        value: *value,
                    })
                    .collect();
                apply_decision_conditions(&mut status.conditions, &decision, ctx.now);
            }
        }

        actions.extend(status_update(&resource, to_status(&status)?));
        Ok(ReconcilePlan {
            actions,
            requeue_after: Some(self.sync_period),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Samples older than the metric window are never read again.
    fn prune_expired(&self, target: &ResourceKey, policy: &AutoscalePolicy) {
        let retain = policy.behavior.metric_window();
        for metric in &policy.metrics {
            if let Err(e) = self.source.prune(target, &metric.name, retain) {
                warn!(%target, metric = %metric.name, error = %e, "failed to prune metric samples");
            }
        }
    }
}

fn apply_decision_conditions(conditions: &mut Vec<Condition>, decision: &ScaleDecision, now: u64) {
    if decision.is_degraded() {
        set_condition(
            conditions,
            SCALING_ACTIVE,
            false,
            METRICS_UNAVAILABLE,
            "no metric samples in window",
            now,
        );
        set_condition(
            conditions,
            DEGRADED,
            true,
            METRICS_UNAVAILABLE,
            format!("holding at {} replicas", decision.desired),
            now,
        );
    } else {
        let message = if decision.missing_metrics.is_empty() {
            String::new()
        } else {
            format!("missing metrics: {}", decision.missing_metrics.join(", "))
        };
        set_condition(conditions, SCALING_ACTIVE, true, "ValidMetricFound", message, now);
        // Degraded may also be set by the runtime for backoff; only clear ours.
        if find_condition(conditions, DEGRADED).is_some_and(|c| c.reason == METRICS_UNAVAILABLE) {
            set_condition(conditions, DEGRADED, false, "MetricsAvailable", "", now);
        }
    }

    let (limited, reason) = match decision.limit {
        Some(ScaleLimit::TooManyReplicas) => (true, "TooManyReplicas"),
        Some(ScaleLimit::TooFewReplicas) => (true, "TooFewReplicas"),
        Some(ScaleLimit::ScaleUpRate) => (true, "ScaleUpLimit"),
        None if decision.reason == ScaleReason::StabilizedDown => (false, "ScaleDownStabilized"),
        None => (false, "DesiredWithinRange"),
    };
    set_condition(conditions, SCALING_LIMITED, limited, reason, "", now);
}
