//! Autoscaler — turns metric samples into a desired replica count.
//!
//! [`compute_desired_replicas`] is the stateless core: one recommendation
//! from the samples at hand. [`Autoscaler`] keeps a short history of those
//! recommendations per scale target and smooths them through the
//! stabilization windows before anything reaches the target's spec.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use convoy_state::{MetricSample, MetricSource, ResourceKey, SharedClock, StateResult};

use crate::policy::AutoscalePolicy;
use crate::window::SampleRing;

/// Recommendations kept per target; far more than one stabilization window
/// holds at any sensible evaluation period.
const HISTORY_CAPACITY: usize = 256;

/// Why the desired count is what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
    /// Metrics agree with the current count.
    Steady,
    ScaleUp,
    ScaleDown,
    /// Metrics ask for fewer replicas but the scale-down window still
    /// holds a higher recommendation.
    StabilizedDown,
    /// No metric had samples; the previous desired count is kept.
    MetricsUnavailable,
}

/// A bound that cut the recommendation short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleLimit {
    TooFewReplicas,
    TooManyReplicas,
    ScaleUpRate,
}

/// The unsmoothed recommendation for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    /// Clamped to the policy's replica bounds.
    pub replicas: u32,
    pub unclamped: u32,
    /// Metrics that had no samples in the window.
    pub missing: Vec<String>,
    /// Mean value per metric that had samples.
    pub values: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecision {
    pub desired: u32,
    pub recommended: u32,
    pub reason: ScaleReason,
    pub limit: Option<ScaleLimit>,
    pub missing_metrics: Vec<String>,
    pub metric_values: Vec<(String, f64)>,
}

impl ScaleDecision {
    pub fn is_degraded(&self) -> bool {
        self.reason == ScaleReason::MetricsUnavailable
    }
}

/// Recommend a replica count for `current` replicas from `samples`.
///
/// Returns `None` when none of the policy's metrics has a sample. When only
/// some do, the recommendation never goes below `current`.
pub fn compute_desired_replicas(
    current: u32,
    samples: &[MetricSample],
    policy: &AutoscalePolicy,
) -> Option<Recommendation> {
    let base = f64::from(current.max(1));
    let tolerance = policy.behavior.tolerance;
    let mut proposal: Option<u32> = None;
    let mut missing = Vec::new();
    let mut values = Vec::new();

    for target in &policy.metrics {
        let observed: Vec<f64> = samples
            .iter()
            .filter(|s| s.metric == target.name)
            .map(|s| s.value)
            .collect();
        if observed.is_empty() || target.target_value <= 0.0 {
            missing.push(target.name.clone());
            continue;
        }
        let value = observed.iter().sum::<f64>() / observed.len() as f64;
        values.push((target.name.clone(), value));

        let ratio = value / target.target_value;
        let from_metric = if (ratio - 1.0).abs() <= tolerance {
            current
        } else {
            (base * ratio).ceil() as u32
        };
        proposal = Some(proposal.map_or(from_metric, |p| p.max(from_metric)));
    }

    let mut unclamped = proposal?;
    if !missing.is_empty() && unclamped < current {
        unclamped = current;
    }
    Some(Recommendation {
        replicas: policy.clamp(unclamped),
        unclamped,
        missing,
        values,
    })
}

/// Read every policy metric of `target` over the policy's metric window.
pub fn collect_samples(
    source: &dyn MetricSource,
    target: &ResourceKey,
    policy: &AutoscalePolicy,
) -> StateResult<Vec<MetricSample>> {
    let window = policy.behavior.metric_window();
    let mut samples = Vec::new();
    for metric in &policy.metrics {
        samples.extend(source.query(target, &metric.name, window)?);
    }
    Ok(samples)
}

struct ScaleState {
    history: SampleRing<u32>,
    last_desired: Option<u32>,
}

impl ScaleState {
    fn new() -> Self {
        Self {
            history: SampleRing::new(HISTORY_CAPACITY),
            last_desired: None,
        }
    }
}

/// Stateful decision engine shared by every autoscaler object.
pub struct Autoscaler {
    source: Arc<dyn MetricSource>,
    clock: SharedClock,
    /// Per-target recommendation history.
    states: HashMap<ResourceKey, ScaleState>,
}

impl Autoscaler {
    pub fn new(source: Arc<dyn MetricSource>, clock: SharedClock) -> Self {
        Self {
            source,
            clock,
            states: HashMap::new(),
        }
    }

    /// Evaluate `target`, currently at `current` replicas.
    pub fn evaluate(
        &mut self,
        target: &ResourceKey,
        current: u32,
        policy: &AutoscalePolicy,
    ) -> StateResult<ScaleDecision> {
        let samples = collect_samples(self.source.as_ref(), target, policy)?;
        Ok(self.decide(target, current, policy, &samples))
    }

    /// Fold already collected `samples` into the target's history and
    /// decide. Does no I/O.
    pub fn decide(
        &mut self,
        target: &ResourceKey,
        current: u32,
        policy: &AutoscalePolicy,
        samples: &[MetricSample],
    ) -> ScaleDecision {
        let behavior = &policy.behavior;
        let now = self.clock.now_millis();

        let state = self
            .states
            .entry(target.clone())
            .or_insert_with(ScaleState::new);

        let Some(rec) = compute_desired_replicas(current, samples, policy) else {
            let desired = state.last_desired.unwrap_or(current);
            warn!(%target, desired, "no metric samples in window, holding replica count");
            return ScaleDecision {
                desired,
                recommended: desired,
                reason: ScaleReason::MetricsUnavailable,
                limit: None,
                missing_metrics: policy.metrics.iter().map(|m| m.name.clone()).collect(),
                metric_values: Vec::new(),
            };
        };

        let down_window = behavior.scale_down_window().as_millis() as u64;
        let up_window = behavior.scale_up_window().as_millis() as u64;
        state.history.push(now, rec.replicas);
        state
            .history
            .retain_since(now.saturating_sub(down_window.max(up_window)));

        let up = state
            .history
            .since(now.saturating_sub(up_window))
            .min()
            .unwrap_or(rec.replicas);
        let down = state
            .history
            .since(now.saturating_sub(down_window))
            .max()
            .unwrap_or(rec.replicas);

        let mut desired = current;
        let mut reason = ScaleReason::Steady;
        if desired < up {
            desired = up;
            reason = ScaleReason::ScaleUp;
        }
        if desired > down {
            desired = down;
            reason = ScaleReason::ScaleDown;
        }
        if reason == ScaleReason::Steady && rec.replicas < current {
            reason = ScaleReason::StabilizedDown;
        }

        let mut limit = if rec.unclamped > policy.max_replicas {
            Some(ScaleLimit::TooManyReplicas)
        } else if rec.unclamped < policy.min_replicas {
            Some(ScaleLimit::TooFewReplicas)
        } else {
            None
        };
        let cap = behavior.scale_up_limit(current);
        if desired > cap {
            desired = cap;
            limit = Some(ScaleLimit::ScaleUpRate);
        }
        desired = policy.clamp(desired);

        debug!(
            %target,
            current,
            recommended = rec.replicas,
            desired,
            ?reason,
            "autoscale evaluation"
        );
        state.last_desired = Some(desired);

        ScaleDecision {
            desired,
            recommended: rec.replicas,
            reason,
            limit,
            missing_metrics: rec.missing,
            metric_values: rec.values,
        }
    }

    /// Drop the history for a target that is no longer autoscaled.
    pub fn forget(&mut self, target: &ResourceKey) {
        self.states.remove(target);
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use convoy_state::{Clock, ManualClock, StateStore, StoreOptions};

    use crate::policy::{MetricTarget, ScalingBehavior};

    const START: u64 = 1_000_000_000;

    fn policy(min: u32, max: u32, metrics: &[(&str, f64)]) -> AutoscalePolicy {
        AutoscalePolicy {
            min_replicas: min,
            max_replicas: max,
            metrics: metrics
                .iter()
                .map(|(name, target)| MetricTarget {
                    name: name.to_string(),
                    target_value: *target,
                })
                .collect(),
            behavior: ScalingBehavior::default(),
        }
    }

    fn target() -> ResourceKey {
        ResourceKey::new("Deployment", "default", "api")
    }

    fn sample(metric: &str, value: f64) -> MetricSample {
        MetricSample {
            resource: target(),
            metric: metric.to_string(),
            value,
            timestamp: START,
        }
    }

    struct Harness {
        store: StateStore,
        clock: Arc<ManualClock>,
        scaler: Autoscaler,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(START));
            let store = StateStore::open_in_memory_with(StoreOptions {
                clock: clock.clone(),
                ..Default::default()
            })
            .unwrap();
            let scaler = Autoscaler::new(Arc::new(store.clone()), clock.clone());
            Self {
                store,
                clock,
                scaler,
            }
        }

        fn record(&self, metric: &str, value: f64) {
            self.store
                .put_sample(&MetricSample {
                    timestamp: self.clock.now_millis(),
                    ..sample(metric, value)
                })
                .unwrap();
        }

        fn evaluate(&mut self, current: u32, policy: &AutoscalePolicy) -> ScaleDecision {
            self.scaler.evaluate(&target(), current, policy).unwrap()
        }
    }

    // ── Stateless recommendation ───────────────────────────────────

    #[test]
    fn ratio_scales_current_count() {
        let p = policy(1, 10, &[("cpu", 50.0)]);
        let rec = compute_desired_replicas(2, &[sample("cpu", 100.0)], &p).unwrap();
        assert_eq!(rec.replicas, 4);
        assert_eq!(rec.values, vec![("cpu".to_string(), 100.0)]);
    }

    #[test]
    fn within_tolerance_keeps_current() {
        let p = policy(1, 10, &[("cpu", 50.0)]);
        let rec = compute_desired_replicas(4, &[sample("cpu", 54.0)], &p).unwrap();
        assert_eq!(rec.replicas, 4);
    }

    #[test]
    fn highest_metric_wins() {
        let p = policy(1, 20, &[("cpu", 50.0), ("rps", 100.0)]);
        let samples = [sample("cpu", 50.0), sample("rps", 300.0)];
        let rec = compute_desired_replicas(2, &samples, &p).unwrap();
        assert_eq!(rec.replicas, 6);
    }

    #[test]
    fn samples_are_averaged() {
        let p = policy(1, 20, &[("cpu", 50.0)]);
        let samples = [sample("cpu", 50.0), sample("cpu", 150.0)];
        let rec = compute_desired_replicas(2, &samples, &p).unwrap();
        assert_eq!(rec.replicas, 4);
    }

    #[test]
    fn result_is_clamped() {
        let p = policy(2, 5, &[("cpu", 10.0)]);
        let rec = compute_desired_replicas(1, &[sample("cpu", 1000.0)], &p).unwrap();
        assert_eq!(rec.replicas, 5);
        assert_eq!(rec.unclamped, 100);

        let rec = compute_desired_replicas(4, &[sample("cpu", 0.1)], &p).unwrap();
        assert_eq!(rec.replicas, 2);
    }

    #[test]
    fn partial_metrics_forbid_scale_down() {
        let p = policy(1, 10, &[("cpu", 50.0), ("rps", 100.0)]);
        let rec = compute_desired_replicas(4, &[sample("cpu", 5.0)], &p).unwrap();
        assert_eq!(rec.replicas, 4);
        assert_eq!(rec.missing, vec!["rps".to_string()]);
    }

    #[test]
    fn no_samples_is_none() {
        let p = policy(1, 10, &[("cpu", 50.0)]);
        assert!(compute_desired_replicas(3, &[], &p).is_none());
    }

    // ── Stabilized decisions ───────────────────────────────────────

    #[test]
    fn spike_then_drop_holds_through_window() {
        let mut h = Harness::new();
        let p = policy(1, 10, &[("cpu", 50.0)]);

        h.record("cpu", 100.0);
        let d = h.evaluate(2, &p);
        assert_eq!(d.desired, 4);
        assert_eq!(d.reason, ScaleReason::ScaleUp);

        // Load vanishes, but the spike is still inside the 5 minute window.
        h.clock.advance(Duration::from_secs(120));
        h.record("cpu", 10.0);
        let d = h.evaluate(4, &p);
        assert_eq!(d.recommended, 1);
        assert_eq!(d.desired, 4);
        assert_eq!(d.reason, ScaleReason::StabilizedDown);

        h.clock.advance(Duration::from_secs(200));
        h.record("cpu", 10.0);
        let d = h.evaluate(4, &p);
        assert_eq!(d.desired, 1);
        assert_eq!(d.reason, ScaleReason::ScaleDown);
    }

    #[test]
    fn scale_up_is_rate_limited() {
        let mut h = Harness::new();
        let p = policy(1, 100, &[("cpu", 10.0)]);

        h.record("cpu", 1000.0);
        let d = h.evaluate(1, &p);
        assert_eq!(d.desired, 5);
        assert_eq!(d.limit, Some(ScaleLimit::ScaleUpRate));

        let d = h.evaluate(5, &p);
        assert_eq!(d.desired, 10);
    }

    #[test]
    fn max_replicas_is_reported_as_limit() {
        let mut h = Harness::new();
        let p = policy(1, 3, &[("cpu", 10.0)]);
        h.record("cpu", 40.0);
        let d = h.evaluate(2, &p);
        assert_eq!(d.desired, 3);
        assert_eq!(d.limit, Some(ScaleLimit::TooManyReplicas));
    }

    #[test]
    fn scale_up_window_requires_sustained_load() {
        let mut h = Harness::new();
        let mut p = policy(1, 10, &[("cpu", 50.0)]);
        p.behavior.scale_up_stabilization_secs = 60;

        h.record("cpu", 50.0);
        assert_eq!(h.evaluate(2, &p).desired, 2);

        h.clock.advance(Duration::from_secs(30));
        h.record("cpu", 150.0);
        // A lower recommendation is still inside the up window.
        let d = h.evaluate(2, &p);
        assert!(d.desired < 4);
    }

    #[test]
    fn missing_metrics_hold_last_desired() {
        let mut h = Harness::new();
        let p = policy(1, 10, &[("cpu", 50.0)]);

        let d = h.evaluate(3, &p);
        assert!(d.is_degraded());
        assert_eq!(d.desired, 3);

        h.record("cpu", 100.0);
        assert_eq!(h.evaluate(3, &p).desired, 6);

        // Samples age out of the metric window.
        h.clock.advance(Duration::from_secs(120));
        let d = h.evaluate(6, &p);
        assert!(d.is_degraded());
        assert_eq!(d.desired, 6);
        assert_eq!(d.missing_metrics, vec!["cpu".to_string()]);
    }

    #[test]
    fn forget_drops_history() {
        let mut h = Harness::new();
        let p = policy(1, 10, &[("cpu", 50.0)]);
        h.record("cpu", 50.0);
        h.evaluate(2, &p);
        assert_eq!(h.scaler.tracked(), 1);
        h.scaler.forget(&target());
        assert_eq!(h.scaler.tracked(), 0);
    }
}
