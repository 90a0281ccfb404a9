//! Retry delay policy.

use std::time::Duration;

/// Which delay curve a failed key is retried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient store failures.
    Standard,
    /// Quota exhaustion; retried on a longer base delay.
    Quota,
}

/// Capped exponential backoff: `base * 2^failures`, never above `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub quota_base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            quota_base: Duration::from_secs(1),
            max: Duration::from_secs(1000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows `failures` previous failures.
    pub fn delay(&self, failures: u32, class: RetryClass) -> Duration {
        let base = match class {
            RetryClass::Standard => self.base,
            RetryClass::Quota => self.quota_base,
        };
        let factor = 2u32.saturating_pow(failures.min(31));
        base.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(10),
            quota_base: Duration::from_secs(1),
            max: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(0, RetryClass::Standard), Duration::from_millis(10));
        assert_eq!(policy.delay(1, RetryClass::Standard), Duration::from_millis(20));
        assert_eq!(policy.delay(3, RetryClass::Standard), Duration::from_millis(80));
        assert_eq!(policy.delay(4, RetryClass::Standard), Duration::from_millis(100));
        assert_eq!(policy.delay(200, RetryClass::Standard), Duration::from_millis(100));
    }

    #[test]
    fn quota_uses_longer_base() {
        let policy = BackoffPolicy::default();
        assert!(policy.delay(0, RetryClass::Quota) > policy.delay(0, RetryClass::Standard));
        assert_eq!(policy.delay(2, RetryClass::Quota), Duration::from_secs(4));
    }
}
