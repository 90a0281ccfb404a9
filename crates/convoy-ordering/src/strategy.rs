//! Rolling update budgets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounds on how far a rolling update may stray from the desired count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingUpdateStrategy {
    /// Replicas allowed above `desired` while the update runs, terminating
    /// replicas included.
    pub max_surge: u32,
    /// Replicas allowed to be unavailable below `desired`.
    pub max_unavailable: u32,
}

impl Default for RollingUpdateStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    /// Both budgets are zero, so no replica could ever be replaced.
    #[error("max_surge and max_unavailable cannot both be 0")]
    NoProgressPossible,
}

impl RollingUpdateStrategy {
    pub fn new(max_surge: u32, max_unavailable: u32) -> Self {
        Self {
            max_surge,
            max_unavailable,
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.max_surge == 0 && self.max_unavailable == 0 {
            return Err(StrategyError::NoProgressPossible);
        }
        Ok(())
    }

    /// Upper bound on replicas present at once, terminating included.
    pub fn max_total(&self, desired: u32) -> u32 {
        desired + self.max_surge
    }

    /// Lower bound on Ready replicas.
    pub fn min_available(&self, desired: u32) -> u32 {
        desired.saturating_sub(self.max_unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_surges_one_without_unavailability() {
        let s = RollingUpdateStrategy::default();
        assert_eq!(s.max_total(3), 4);
        assert_eq!(s.min_available(3), 3);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let err = RollingUpdateStrategy::new(0, 0).validate().unwrap_err();
        assert_eq!(err, StrategyError::NoProgressPossible);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let s: RollingUpdateStrategy = serde_json::from_str(r#"{"max_unavailable": 2}"#).unwrap();
        assert_eq!(s, RollingUpdateStrategy::new(1, 2));
    }

    #[test]
    fn min_available_saturates() {
        assert_eq!(RollingUpdateStrategy::new(1, 5).min_available(3), 0);
    }
}
