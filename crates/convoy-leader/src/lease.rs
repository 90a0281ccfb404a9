//! Lease record and timing configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const LEASE_KIND: &str = "Lease";
pub const LEASE_NAMESPACE: &str = "convoy-system";

/// Stored as the `spec` of the lease resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseRecord {
    /// `None` after a graceful release.
    pub holder_identity: Option<String>,
    pub lease_duration_ms: u64,
    pub acquire_time: u64,
    pub renew_time: u64,
    /// Number of times the lease changed hands.
    pub transitions: u32,
}

impl LeaseRecord {
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    /// Whether a candidate may take the lease at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.holder_identity.is_none()
            || now >= self.renew_time.saturating_add(self.lease_duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the holder keeps acting without a successful renewal.
    /// Must be shorter than `lease_duration`.
    pub renew_deadline: Duration,
    /// Interval between acquire or renew attempts.
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}
