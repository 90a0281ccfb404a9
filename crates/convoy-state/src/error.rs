//! Error types for the Convoy object store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict on {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("quota exceeded in namespace {namespace}: limit is {limit} objects")]
    QuotaExceeded { namespace: String, limit: usize },
}

impl StateError {
    /// Stale `resource_version` on an update or delete.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    /// Storage-level failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let conflict = StateError::Conflict {
            key: "Deployment/default/api".to_string(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());

        assert!(StateError::Write("disk full".to_string()).is_transient());
        assert!(StateError::NotFound("x".to_string()).is_not_found());
        assert!(!StateError::Serialize("bad".to_string()).is_transient());
    }

    #[test]
    fn conflict_message_names_versions() {
        let err = StateError::Conflict {
            key: "Replica/default/web-0".to_string(),
            expected: 7,
            actual: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected version 7"));
        assert!(msg.contains("found 9"));
    }
}
