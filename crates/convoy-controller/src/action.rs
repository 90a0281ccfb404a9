//! Store mutations a reconciler asks the executor to perform.

use convoy_state::{Resource, ResourceKey};
use serde_json::Value;

/// Which part of an object an update replaces.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateTarget {
    Spec(Value),
    Status(Value),
    Finalizers(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(Resource),
    Update {
        key: ResourceKey,
        target: UpdateTarget,
        expected_version: u64,
    },
    Delete {
        key: ResourceKey,
        expected_version: u64,
    },
}

impl Action {
    pub fn update_status(resource: &Resource, status: Value) -> Self {
        Self::Update {
            key: resource.key(),
            target: UpdateTarget::Status(status),
            expected_version: resource.resource_version,
        }
    }

    pub fn update_spec(resource: &Resource, spec: Value) -> Self {
        Self::Update {
            key: resource.key(),
            target: UpdateTarget::Spec(spec),
            expected_version: resource.resource_version,
        }
    }

    pub fn update_finalizers(resource: &Resource, finalizers: Vec<String>) -> Self {
        Self::Update {
            key: resource.key(),
            target: UpdateTarget::Finalizers(finalizers),
            expected_version: resource.resource_version,
        }
    }

    pub fn delete(resource: &Resource) -> Self {
        Self::Delete {
            key: resource.key(),
            expected_version: resource.resource_version,
        }
    }

    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Create(r) => r.key(),
            Self::Update { key, .. } | Self::Delete { key, .. } => key.clone(),
        }
    }

    pub fn is_status_update(&self) -> bool {
        matches!(
            self,
            Self::Update {
                target: UpdateTarget::Status(_),
                ..
            }
        )
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update {
                target: UpdateTarget::Spec(_),
                ..
            } => "update_spec",
            Self::Update {
                target: UpdateTarget::Status(_),
                ..
            } => "update_status",
            Self::Update {
                target: UpdateTarget::Finalizers(_),
                ..
            } => "update_finalizers",
            Self::Delete { .. } => "delete",
        }
    }
}
