//! Child kinds managed by workload controllers and the bookkeeping shared
//! between them: member snapshots for the ordering engine and revision
//! history.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use convoy_ordering::{
    Member, RevisionDecision, RevisionRecord, revision_hash, revisions_to_prune, select_revision,
};
use convoy_state::Resource;

use crate::action::Action;
use crate::error::{ReconcileError, ReconcileResult};

pub const DEPLOYMENT: &str = "Deployment";
pub const STATEFUL_SET: &str = "StatefulSet";
pub const HORIZONTAL_AUTOSCALER: &str = "HorizontalAutoscaler";
pub const REPLICA: &str = "Replica";
pub const CONTROLLER_REVISION: &str = "ControllerRevision";

/// Held by every workload this controller manages until its children are
/// gone.
pub const FINALIZER: &str = "convoy.dev/cleanup";

/// Label carrying the revision hash a replica was created from.
pub const REVISION_LABEL: &str = "convoy.dev/revision";

/// Desired state of one member. Written by the workload controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSpec {
    pub template: Value,
    /// Hash of the revision the template came from.
    pub revision: String,
    pub ordinal: u32,
}

/// Observed state of one member. Written by the node agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaStatus {
    pub ready: bool,
}

/// An immutable template snapshot. Only `revision` moves, when a rollback
/// promotes an old snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionSpec {
    pub template: Value,
    pub hash: String,
    pub revision: u64,
}

pub fn member_name(owner: &str, ordinal: u32) -> String {
    format!("{owner}-{ordinal}")
}

pub fn revision_name(owner: &str, hash: &str) -> String {
    format!("{owner}-{hash}")
}

/// Snapshot a replica for the planners. An undecodable spec reads as an
/// empty revision, so the member counts as outdated and is replaced.
pub fn member_of(replica: &Resource) -> Member {
    let spec: ReplicaSpec = replica.spec_as().unwrap_or_default();
    let status: ReplicaStatus = replica.status_as();
    Member {
        name: replica.name.clone(),
        ordinal: spec.ordinal,
        revision: spec.revision,
        ready: status.ready,
        terminating: replica.is_deleting(),
        created_at: replica.created_at,
    }
}

/// Build a member of `owner` at `ordinal` running `template`.
pub fn new_replica(owner: &Resource, ordinal: u32, hash: &str, template: &Value) -> ReconcileResult<Resource> {
    let spec = ReplicaSpec {
        template: template.clone(),
        revision: hash.to_string(),
        ordinal,
    };
    let spec = serde_json::to_value(&spec).map_err(|e| ReconcileError::Validation(e.to_string()))?;
    Ok(
        Resource::new(REPLICA, &owner.namespace, member_name(&owner.name, ordinal), spec)
            .with_labels(template_labels(template))
            .with_label(REVISION_LABEL, hash)
            .with_owner(owner),
    )
}

/// String-valued `labels` of a template, copied onto its members.
pub fn template_labels(template: &Value) -> std::collections::BTreeMap<String, String> {
    template
        .get("labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Children split by whether they belong to this incarnation of the owner.
pub struct OwnedChildren {
    pub owned: Vec<Arc<Resource>>,
    /// Left behind by a deleted owner of the same name.
    pub stale: Vec<Arc<Resource>>,
}

pub fn split_owned(owner: &Resource, children: Vec<Arc<Resource>>) -> OwnedChildren {
    let (owned, stale) = children.into_iter().partition(|c| c.is_owned_by(owner));
    OwnedChildren { owned, stale }
}

/// Delete every child that is not already on its way out.
pub fn delete_all(children: &[Arc<Resource>]) -> Vec<Action> {
    children
        .iter()
        .filter(|c| !c.is_deleting())
        .map(|c| Action::delete(c))
        .collect()
}

fn record_of(revision: &Resource) -> Option<RevisionRecord> {
    let spec: RevisionSpec = revision.spec_as().ok()?;
    Some(RevisionRecord {
        name: revision.name.clone(),
        hash: spec.hash,
        revision: spec.revision,
    })
}

/// Template stored under the revision with `hash`, if it still exists.
pub fn template_for(revisions: &[Arc<Resource>], hash: &str) -> Option<Value> {
    revisions
        .iter()
        .filter_map(|r| r.spec_as::<RevisionSpec>().ok())
        .find(|spec| spec.hash == hash)
        .map(|spec| spec.template)
}

/// Outcome of syncing a workload's revision history with its template.
pub struct RevisionSync {
    pub update_hash: String,
    pub update_revision: u64,
    pub actions: Vec<Action>,
}

/// Make sure a revision exists for `template`, promote it if it is an older
/// one, and prune history beyond `history_limit`. Revisions still run by a
/// member in `referenced` are never pruned.
pub fn sync_revisions(
    owner: &Resource,
    template: &Value,
    revisions: &[Arc<Resource>],
    referenced: &HashSet<String>,
    history_limit: usize,
) -> ReconcileResult<RevisionSync> {
    let hash = revision_hash(template);
    let records: Vec<RevisionRecord> = revisions.iter().filter_map(|r| record_of(r)).collect();
    let decision = select_revision(&records, &hash);
    let update_revision = decision.revision(&records);
    let mut actions = Vec::new();

    match decision {
        RevisionDecision::Current { .. } => {}
        RevisionDecision::Reuse { name, revision } => {
            if let Some(existing) = revisions.iter().find(|r| r.name == name)
                && let Ok(mut spec) = existing.spec_as::<RevisionSpec>()
            {
                spec.revision = revision;
                let spec = serde_json::to_value(&spec)
                    .map_err(|e| ReconcileError::Validation(e.to_string()))?;
                actions.push(Action::update_spec(existing, spec));
            }
        }
        RevisionDecision::Create { hash, revision } => {
            let spec = RevisionSpec {
                template: template.clone(),
                hash: hash.clone(),
                revision,
            };
            let spec = serde_json::to_value(&spec)
                .map_err(|e| ReconcileError::Validation(e.to_string()))?;
            actions.push(Action::Create(
                Resource::new(
                    CONTROLLER_REVISION,
                    &owner.namespace,
                    revision_name(&owner.name, &hash),
                    spec,
                )
                .with_owner(owner),
            ));
        }
    }

    for name in revisions_to_prune(&records, referenced, &hash, history_limit) {
        if let Some(revision) = revisions.iter().find(|r| r.name == name) {
            actions.push(Action::delete(revision));
        }
    }

    Ok(RevisionSync {
        update_hash: hash,
        update_revision,
        actions,
    })
}
