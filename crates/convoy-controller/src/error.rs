//! Reconcile error taxonomy.
//!
//! Each variant maps to one retry policy in the controller runtime; the work
//! queue is the only place a failed reconcile is retried.

use convoy_state::StateError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Storage or network trouble. Retried with backoff.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Stale `resource_version`. Re-reconciled at once from fresh state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed spec. Surfaced in status and not retried until the spec
    /// changes.
    #[error("invalid spec: {0}")]
    Validation(String),

    /// The object vanished mid-reconcile.
    #[error("not found: {0}")]
    NotFound(String),

    /// Out of quota. Retried on a longer backoff and surfaced in status.
    #[error("quota exceeded in namespace {namespace} (limit {limit})")]
    QuotaExceeded { namespace: String, limit: usize },

    /// Leadership was lost; no further writes may happen.
    #[error("not the leader")]
    NotLeader,
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

impl ReconcileError {
    /// Short label for metrics and logs.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::QuotaExceeded { .. } => "quota",
            Self::NotLeader => "not_leader",
        }
    }
}

impl From<StateError> for ReconcileError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict { .. } => Self::Conflict(e.to_string()),
            // Deterministic names collide only when the cache lags the store.
            StateError::AlreadyExists(key) => Self::Conflict(format!("{key} already exists")),
            StateError::NotFound(key) => Self::NotFound(key),
            StateError::QuotaExceeded { namespace, limit } => {
                Self::QuotaExceeded { namespace, limit }
            }
            other => Self::Transient(other.to_string()),
        }
    }
}
