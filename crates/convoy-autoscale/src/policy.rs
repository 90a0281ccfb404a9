//! Scaling policy as declared on a HorizontalAutoscaler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A metric and the per-replica value the autoscaler steers it toward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTarget {
    pub name: String,
    pub target_value: f64,
}

/// Knobs that shape how quickly recommendations move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingBehavior {
    /// Scale-down uses the highest recommendation seen in this window.
    pub scale_down_stabilization_secs: u64,
    /// Scale-up uses the lowest recommendation seen in this window.
    pub scale_up_stabilization_secs: u64,
    /// Ratios within `1 ± tolerance` recommend no change.
    pub tolerance: f64,
    /// Samples older than this are ignored when averaging a metric.
    pub metric_window_secs: u64,
    /// Scale-up may multiply the current count by at most this factor...
    pub scale_up_max_factor: f64,
    /// ...or add this many replicas, whichever is larger.
    pub scale_up_max_increment: u32,
}

impl Default for ScalingBehavior {
    fn default() -> Self {
        Self {
            scale_down_stabilization_secs: 300,
            scale_up_stabilization_secs: 0,
            tolerance: 0.1,
            metric_window_secs: 60,
            scale_up_max_factor: 2.0,
            scale_up_max_increment: 4,
        }
    }
}

impl ScalingBehavior {
    pub fn scale_down_window(&self) -> Duration {
        Duration::from_secs(self.scale_down_stabilization_secs)
    }

    pub fn scale_up_window(&self) -> Duration {
        Duration::from_secs(self.scale_up_stabilization_secs)
    }

    pub fn metric_window(&self) -> Duration {
        Duration::from_secs(self.metric_window_secs)
    }

    /// Highest count a single evaluation may scale up to from `current`.
    pub fn scale_up_limit(&self, current: u32) -> u32 {
        let by_factor = (f64::from(current) * self.scale_up_max_factor).ceil() as u32;
        by_factor.max(current.saturating_add(self.scale_up_max_increment))
    }
}

/// Everything the decision engine needs about one scale target.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoscalePolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metrics: Vec<MetricTarget>,
    pub behavior: ScalingBehavior,
}

impl AutoscalePolicy {
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas.max(self.min_replicas))
    }
}
