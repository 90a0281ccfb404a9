//! convoy.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! single-instance controller. Durations are written as `"500ms"`, `"30s"`,
//! `"5m"` or `"1h"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use convoy_leader::LeaseConfig;
use convoy_queue::BackoffPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers.
    pub workers: usize,
    #[serde(with = "duration_str")]
    pub resync_period: Duration,
    /// A key failing for longer than this is reported `Degraded`.
    #[serde(with = "duration_str")]
    pub degraded_after: Duration,
    /// How long shutdown waits for in-flight reconciles.
    #[serde(with = "duration_str")]
    pub drain_timeout: Duration,
    /// Address for `/healthz` and `/metrics`; unset disables the endpoint.
    pub metrics_addr: Option<String>,
    pub backoff: BackoffConfig,
    pub leader: LeaderConfig,
    pub autoscale: AutoscaleConfig,
    pub store: StoreConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(600),
            degraded_after: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            metrics_addr: None,
            backoff: BackoffConfig::default(),
            leader: LeaderConfig::default(),
            autoscale: AutoscaleConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_str")]
    pub base: Duration,
    #[serde(with = "duration_str")]
    pub quota_base: Duration,
    #[serde(with = "duration_str")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            base: policy.base,
            quota_base: policy.quota_base,
            max: policy.max,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.base,
            quota_base: self.quota_base,
            max: self.max,
        }
    }
}

/// Lease-based leader election.
///
/// The lease lives in the object store, and the redb file backing it is
/// locked exclusively by the process that opens it. A second `convoyd`
/// pointed at the same data directory fails to start rather than
/// contending for the lease, so election only arbitrates between
/// electors sharing one open store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub enabled: bool,
    pub lease_name: String,
    #[serde(with = "duration_str")]
    pub lease_duration: Duration,
    #[serde(with = "duration_str")]
    pub renew_deadline: Duration,
    #[serde(with = "duration_str")]
    pub retry_period: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        let lease = LeaseConfig::default();
        Self {
            enabled: false,
            lease_name: "convoy-controller".to_string(),
            lease_duration: lease.lease_duration,
            renew_deadline: lease.renew_deadline,
            retry_period: lease.retry_period,
        }
    }
}

impl LeaderConfig {
    pub fn lease(&self) -> LeaseConfig {
        LeaseConfig {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// How often each HorizontalAutoscaler is re-evaluated.
    #[serde(with = "duration_str")]
    pub sync_period: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub namespace_quota: Option<usize>,
    pub watch_capacity: Option<usize>,
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.resync_period.is_zero() {
            return Err(ConfigError::Invalid("resync_period must be positive".into()));
        }
        if self.leader.renew_deadline >= self.leader.lease_duration {
            return Err(ConfigError::Invalid(
                "leader.renew_deadline must be shorter than leader.lease_duration".into(),
            ));
        }
        if self.leader.retry_period >= self.leader.renew_deadline {
            return Err(ConfigError::Invalid(
                "leader.retry_period must be shorter than leader.renew_deadline".into(),
            ));
        }
        if self.backoff.base > self.backoff.max || self.backoff.quota_base > self.backoff.max {
            return Err(ConfigError::Invalid(
                "backoff base delays must not exceed backoff.max".into(),
            ));
        }
        if self.autoscale.sync_period.is_zero() {
            return Err(ConfigError::Invalid(
                "autoscale.sync_period must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(ConfigError::InvalidDuration(s.to_string())),
    }
}

fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.degraded_after, Duration::from_secs(300));
        assert_eq!(config.backoff.base, Duration::from_millis(5));
        assert_eq!(config.backoff.max, Duration::from_secs(1000));
        assert!(!config.leader.enabled);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
workers = 8
resync_period = "5m"
degraded_after = "90s"
drain_timeout = "10s"
metrics_addr = "127.0.0.1:9090"

[backoff]
base = "10ms"
quota_base = "2s"
max = "10m"

[leader]
enabled = true
lease_name = "convoy-test"
lease_duration = "20s"
renew_deadline = "12s"
retry_period = "3s"

[autoscale]
sync_period = "30s"

[store]
namespace_quota = 100
"#;
        let config = ControllerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync_period, Duration::from_secs(300));
        assert_eq!(config.degraded_after, Duration::from_secs(90));
        assert_eq!(config.metrics_addr.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.backoff.policy().quota_base, Duration::from_secs(2));
        assert_eq!(config.backoff.max, Duration::from_secs(600));
        assert!(config.leader.enabled);
        assert_eq!(config.leader.lease().renew_deadline, Duration::from_secs(12));
        assert_eq!(config.autoscale.sync_period, Duration::from_secs(30));
        assert_eq!(config.store.namespace_quota, Some(100));
        assert_eq!(config.store.watch_capacity, None);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = ControllerConfig::from_toml_str("[leader]\nenabled = true\n").unwrap();
        assert!(config.leader.enabled);
        assert_eq!(config.leader.lease_name, "convoy-controller");
        assert_eq!(config.leader.lease_duration, Duration::from_secs(15));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(matches!(
            parse_duration("999999999999999999m"),
            Err(ConfigError::InvalidDuration(_))
        ));
        assert!(matches!(
            parse_duration("99999999999999999h"),
            Err(ConfigError::InvalidDuration(_))
        ));
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ControllerConfig::from_toml_str("workers = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ControllerConfig::from_toml_str("[leader]\nrenew_deadline = \"20s\"\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ControllerConfig::from_toml_str("resync_period = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ControllerConfig::from_toml_str("resync_period = \"0s\""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ControllerConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("resync_period = \"10m\""));
        assert_eq!(ControllerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoyd.toml");
        std::fs::write(&path, "workers = 8\n[leader]\nenabled = true\n").unwrap();
        let config = ControllerConfig::from_file(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert!(config.leader.enabled);

        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            ControllerConfig::from_file(&missing),
            Err(ConfigError::Io(_))
        ));
    }
}
