//! convoy-autoscale — metric-driven replica recommendations.
//!
//! Reads metric samples for a scale target through a `MetricSource`,
//! compares each metric against its target value, and recommends a replica
//! count. Stabilization windows and a scale-up rate limit keep the
//! recommendation from flapping.
//!
//! # Scaling Algorithm
//!
//! ```text
//! for each metric:
//!     value = mean of samples in the trailing metric window
//!     ratio = value / target_value
//!     if |ratio - 1| <= tolerance:  proposal = current
//!     else:                         proposal = ceil(current * ratio)
//!
//! recommended = clamp(max(proposals), min_replicas, max_replicas)
//!
//! up   = min(recommendations within scale_up_window)
//! down = max(recommendations within scale_down_window)
//! desired = current, raised to `up`, lowered to `down`
//! desired = min(desired, max(2 * current, current + 4))
//! ```
//!
//! If some metrics have no samples the recommendation may not go below the
//! current count. If none do, the previous desired count is kept and the
//! decision is flagged degraded.

pub mod policy;
pub mod scaler;
pub mod window;

pub use policy::{AutoscalePolicy, MetricTarget, ScalingBehavior};
pub use scaler::{
    Autoscaler, ScaleDecision, ScaleLimit, ScaleReason, collect_samples, compute_desired_replicas,
};
pub use window::SampleRing;
