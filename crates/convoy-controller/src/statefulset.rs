//! StatefulSet controller — ordinal members with strict ordering in both
//! directions.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use convoy_ordering::{Member, OrderingPhase, Step, plan_ordered};
use convoy_state::{Resource, ResourceKey};

use crate::action::Action;
use crate::children::{
    CONTROLLER_REVISION, REPLICA, STATEFUL_SET, delete_all, member_of, new_replica, split_owned,
    sync_revisions,
};
use crate::conditions::{Condition, PROGRESSING, READY, set_condition};
use crate::deployment::phase_reason;
use crate::error::ReconcileResult;
use crate::reconciler::{
    Lifecycle, ReconcileContext, ReconcilePlan, invalid_spec, status_update, to_status,
    workload_lifecycle,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatefulSetSpec {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub template: Value,
    #[serde(default = "default_history_limit")]
    pub revision_history_limit: usize,
}

fn default_replicas() -> u32 {
    1
}

fn default_history_limit() -> usize {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatefulSetStatus {
    pub observed_generation: u64,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub updated_replicas: u32,
    pub update_revision: String,
    pub revision: u64,
    pub phase: Option<OrderingPhase>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Default)]
pub struct StatefulSetReconciler;

impl StatefulSetReconciler {
    pub const KIND: &'static str = STATEFUL_SET;

    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(
        &self,
        key: &ResourceKey,
        ctx: &ReconcileContext<'_>,
    ) -> ReconcileResult<ReconcilePlan> {
        let resource = match workload_lifecycle(key, ctx, ordered_teardown) {
            Lifecycle::Proceed(resource) => resource,
            Lifecycle::Done(plan) => return Ok(plan),
        };

        let spec: StatefulSetSpec = match resource.spec_as() {
            Ok(spec) => spec,
            Err(e) => return Ok(invalid_spec(&resource, &e.to_string(), ctx.now)),
        };
        if !spec.template.is_object() {
            return Ok(invalid_spec(&resource, "template must be an object", ctx.now));
        }

        let replicas = split_owned(&resource, ctx.cache.children_of(key, REPLICA));
        let revisions = split_owned(&resource, ctx.cache.children_of(key, CONTROLLER_REVISION));
        // A predecessor's members still occupy our names; they go first.
        let mut actions = ordered_teardown(&replicas.stale);
        actions.extend(delete_all(&revisions.stale));

        let members: Vec<Member> = replicas.owned.iter().map(|r| member_of(r)).collect();
        let referenced: HashSet<String> = members.iter().map(|m| m.revision.clone()).collect();
        let sync = sync_revisions(
            &resource,
            &spec.template,
            &revisions.owned,
            &referenced,
            spec.revision_history_limit,
        )?;
        actions.extend(sync.actions);

        let plan = if replicas.stale.is_empty() {
            plan_ordered(spec.replicas, &members, &sync.update_hash)
        } else {
            // Hold position until the names are free.
            plan_ordered(members.len() as u32, &members, &sync.update_hash)
        };
        for step in &plan.steps {
            match step {
                Step::Create { ordinal } => {
                    actions.push(Action::Create(new_replica(
                        &resource,
                        *ordinal,
                        &sync.update_hash,
                        &spec.template,
                    )?));
                }
                Step::Delete { name } => {
                    if let Some(replica) = replicas.owned.iter().find(|r| &r.name == name) {
                        actions.push(Action::delete(replica));
                    }
                }
            }
        }

        let mut status: StatefulSetStatus = resource.status_as();
        status.observed_generation = resource.generation;
        status.replicas = plan.intent.current;
        status.ready_replicas = plan.intent.ready;
        status.updated_replicas = plan.updated;
        status.update_revision = sync.update_hash;
        status.revision = sync.update_revision;
        status.phase = Some(plan.phase);

        let ready_message = format!("{}/{} members ready", plan.intent.ready, spec.replicas);
        if plan.is_stable() {
            set_condition(&mut status.conditions, READY, true, "AllMembersReady", ready_message, ctx.now);
            set_condition(&mut status.conditions, PROGRESSING, false, "Complete", "", ctx.now);
        } else {
            set_condition(&mut status.conditions, READY, false, "MembersNotReady", ready_message, ctx.now);
            let message = format!("{}/{} members updated", plan.updated, spec.replicas);
            set_condition(
                &mut status.conditions,
                PROGRESSING,
                true,
                phase_reason(plan.phase),
                message,
                ctx.now,
            );
        }

        debug!(
            %key,
            phase = ?plan.phase,
            desired = spec.replicas,
            current = plan.intent.current,
            ready = plan.intent.ready,
            actions = actions.len(),
            "planned statefulset"
        );
        actions.extend(status_update(&resource, to_status(&status)?));
        Ok(ReconcilePlan::new(actions))
    }
}

/// Delete the highest ordinal, and only once nothing else is terminating.
fn ordered_teardown(replicas: &[Arc<Resource>]) -> Vec<Action> {
    let members: Vec<Member> = replicas.iter().map(|r| member_of(r)).collect();
    plan_ordered(0, &members, "")
        .steps
        .into_iter()
        .filter_map(|step| match step {
            Step::Delete { name } => replicas.iter().find(|r| r.name == name),
            Step::Create { .. } => None,
        })
        .map(|r| Action::delete(r))
        .collect()
}
