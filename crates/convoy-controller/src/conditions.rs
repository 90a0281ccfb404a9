//! Status conditions.
//!
//! The only externally visible signal of reconcile progress. Setting a
//! condition to the status it already has keeps its `last_transition_time`,
//! so recomputing status from an unchanged world yields an identical value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const READY: &str = "Ready";
pub const PROGRESSING: &str = "Progressing";
pub const DEGRADED: &str = "Degraded";
pub const QUOTA_EXCEEDED: &str = "QuotaExceeded";
pub const SCALING_ACTIVE: &str = "ScalingActive";
pub const SCALING_LIMITED: &str = "ScalingLimited";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Unix millis of the last status flip.
    pub last_transition_time: u64,
}

/// Insert or update the condition of `type_`.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: impl Into<ConditionStatus>,
    reason: &str,
    message: impl Into<String>,
    now: u64,
) {
    let status = status.into();
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        }),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Conditions recorded in a raw status value. Missing or malformed lists
/// read as empty.
pub fn conditions_of(status: &Value) -> Vec<Condition> {
    status
        .get("conditions")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default()
}

/// `status` with its `conditions` replaced and every other field kept.
pub fn with_conditions(status: &Value, conditions: &[Condition]) -> Value {
    let mut fields = match status {
        Value::Object(fields) => fields.clone(),
        _ => serde_json::Map::new(),
    };
    let conditions = serde_json::to_value(conditions).unwrap_or_default();
    fields.insert("conditions".to_string(), conditions);
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_only_moves_on_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, READY, false, "Starting", "", 100);
        set_condition(&mut conditions, READY, false, "StillStarting", "1/3", 200);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, 100);
        assert_eq!(conditions[0].reason, "StillStarting");

        set_condition(&mut conditions, READY, true, "AllReady", "", 300);
        assert_eq!(conditions[0].last_transition_time, 300);
        assert!(is_true(&conditions, READY));
        assert!(!is_true(&conditions, DEGRADED));
    }

    #[test]
    fn serializes_type_field() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, QUOTA_EXCEEDED, true, "QuotaExceeded", "limit 3", 1);
        let json = serde_json::to_value(&conditions).unwrap();
        assert_eq!(json[0]["type"], "QuotaExceeded");
        assert_eq!(json[0]["status"], "True");
    }

    #[test]
    fn raw_status_helpers_keep_other_fields() {
        let status = serde_json::json!({"replicas": 3});
        assert!(conditions_of(&status).is_empty());

        let mut conditions = Vec::new();
        set_condition(&mut conditions, DEGRADED, true, "BackoffExceeded", "", 9);
        let updated = with_conditions(&status, &conditions);
        assert_eq!(updated["replicas"], 3);
        assert_eq!(conditions_of(&updated), conditions);
        assert_eq!(conditions_of(&Value::Null), Vec::new());
    }
}
