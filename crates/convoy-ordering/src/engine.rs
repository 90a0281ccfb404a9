//! Ordering engine — per-workload planning of member creates and deletes.
//!
//! Two planners share one member model:
//!
//! - [`plan_ordered`] for ordinal workloads. Member `i` is created only once
//!   every lower ordinal is Ready, members are deleted highest ordinal first,
//!   and nothing moves while any member is still terminating.
//! - [`plan_rolling`] for interchangeable replicas. New-revision replicas are
//!   added within the surge budget and old-revision replicas removed within
//!   the unavailability budget until every replica runs the update revision.
//!
//! Both return at most the steps that are safe right now; the caller applies
//! them, waits for the store to reflect the result and plans again.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::strategy::RollingUpdateStrategy;

/// Where a workload is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingPhase {
    ScalingUp,
    ScalingDown,
    RollingUpdate,
    Stable,
}

/// Replica counts for one workload. Terminating members are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaIntent {
    pub desired: u32,
    pub current: u32,
    pub ready: u32,
}

/// What the planners need to know about one live or terminating member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// Ordinal for ordered workloads, slot for rolling ones.
    pub ordinal: u32,
    /// Hash of the revision the member was created from.
    pub revision: String,
    pub ready: bool,
    /// Deletion requested but the member is still present.
    pub terminating: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Create a member at `ordinal` from the update revision.
    Create { ordinal: u32 },
    Delete { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingPlan {
    pub phase: OrderingPhase,
    pub steps: Vec<Step>,
    pub intent: ReplicaIntent,
    /// Live members already on the update revision.
    pub updated: u32,
}

impl OrderingPlan {
    pub fn is_stable(&self) -> bool {
        self.phase == OrderingPhase::Stable
    }
}

fn intent(desired: u32, members: &[Member]) -> ReplicaIntent {
    let live = members.iter().filter(|m| !m.terminating);
    let (current, ready) = live.fold((0, 0), |(c, r), m| (c + 1, r + u32::from(m.ready)));
    ReplicaIntent {
        desired,
        current,
        ready,
    }
}

fn count_updated(members: &[Member], update_revision: &str) -> u32 {
    members
        .iter()
        .filter(|m| !m.terminating && m.revision == update_revision)
        .count() as u32
}

// ── Ordered workloads ─────────────────────────────────────────────

/// Plan the next step for an ordinal workload.
///
/// At most one step is returned. A member that was deleted behind the
/// controller's back shows up as a missing ordinal and is recreated once
/// its predecessors are Ready; the rest of the sequence is left alone.
pub fn plan_ordered(desired: u32, members: &[Member], update_revision: &str) -> OrderingPlan {
    let intent = intent(desired, members);
    let updated = count_updated(members, update_revision);
    let plan = |phase, steps| OrderingPlan {
        phase,
        steps,
        intent,
        updated,
    };

    if let Some(t) = members.iter().find(|m| m.terminating) {
        debug!(member = %t.name, "waiting for member to terminate");
        let phase = if t.ordinal >= desired {
            OrderingPhase::ScalingDown
        } else if t.revision != update_revision {
            OrderingPhase::RollingUpdate
        } else {
            OrderingPhase::ScalingUp
        };
        return plan(phase, Vec::new());
    }

    let present: BTreeMap<u32, &Member> = members.iter().map(|m| (m.ordinal, m)).collect();

    if let Some(missing) = (0..desired).find(|o| !present.contains_key(o)) {
        // Every ordinal below `missing` is present by construction.
        let blocker = present.range(..missing).map(|(_, m)| *m).find(|m| !m.ready);
        let steps = match blocker {
            Some(m) => {
                debug!(member = %m.name, next = missing, "waiting for predecessor to become ready");
                Vec::new()
            }
            None => vec![Step::Create { ordinal: missing }],
        };
        return plan(OrderingPhase::ScalingUp, steps);
    }

    if let Some((_, highest)) = present.range(desired..).next_back() {
        return plan(
            OrderingPhase::ScalingDown,
            vec![Step::Delete {
                name: highest.name.clone(),
            }],
        );
    }

    let outdated = present
        .values()
        .rev()
        .find(|m| m.revision != update_revision);
    if let Some(m) = outdated {
        let all_ready = present.values().all(|m| m.ready);
        let steps = if all_ready {
            vec![Step::Delete {
                name: m.name.clone(),
            }]
        } else {
            Vec::new()
        };
        return plan(OrderingPhase::RollingUpdate, steps);
    }

    if present.values().all(|m| m.ready) {
        plan(OrderingPhase::Stable, Vec::new())
    } else {
        plan(OrderingPhase::ScalingUp, Vec::new())
    }
}

// ── Rolling workloads ─────────────────────────────────────────────

/// Plan the next batch of steps for interchangeable replicas.
///
/// Terminating replicas count against the surge budget. At most
/// `max(max_surge, 1)` update-revision replicas may be waiting for
/// readiness at once, so growth is gated on earlier replicas turning Ready.
/// Old-revision replicas go unready-first, then oldest-created first, and
/// only while Ready replicas stay at or above `desired - max_unavailable`.
/// New replicas take the lowest slot no present replica holds.
pub fn plan_rolling(
    desired: u32,
    members: &[Member],
    update_revision: &str,
    strategy: &RollingUpdateStrategy,
) -> OrderingPlan {
    let intent = intent(desired, members);
    let updated = count_updated(members, update_revision);

    let live: Vec<&Member> = members.iter().filter(|m| !m.terminating).collect();
    let (new, old): (Vec<&Member>, Vec<&Member>) =
        live.iter().copied().partition(|m| m.revision == update_revision);
    let present = members.len() as u32;
    let mut steps = Vec::new();

    // Surplus update-revision replicas: unready first, then newest.
    if new.len() as u32 > desired {
        let mut surplus = new.clone();
        surplus.sort_by(|a, b| {
            a.ready
                .cmp(&b.ready)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.ordinal.cmp(&a.ordinal))
        });
        let excess = new.len() - desired as usize;
        steps.extend(surplus.into_iter().take(excess).map(|m| Step::Delete {
            name: m.name.clone(),
        }));
    }

    if (new.len() as u32) < desired {
        let room = strategy.max_total(desired).saturating_sub(present);
        let new_unready = new.iter().filter(|m| !m.ready).count() as u32;
        let settling_room = strategy.max_surge.max(1).saturating_sub(new_unready);
        let count = (desired - new.len() as u32).min(room).min(settling_room);

        let taken: BTreeSet<u32> = members.iter().map(|m| m.ordinal).collect();
        steps.extend(
            (0..)
                .filter(|o| !taken.contains(o))
                .take(count as usize)
                .map(|ordinal| Step::Create { ordinal }),
        );
    }

    if !old.is_empty() {
        let available = live.iter().filter(|m| m.ready).count() as u32;
        let mut removable = available.saturating_sub(strategy.min_available(desired));
        let mut victims = old.clone();
        victims.sort_by(|a, b| {
            a.ready
                .cmp(&b.ready)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.ordinal.cmp(&b.ordinal))
        });
        for m in victims {
            if m.ready {
                if removable == 0 {
                    break;
                }
                removable -= 1;
            }
            steps.push(Step::Delete {
                name: m.name.clone(),
            });
        }
    }

    let old_terminating = members
        .iter()
        .any(|m| m.terminating && m.revision != update_revision);
    let phase = if !old.is_empty() || old_terminating {
        OrderingPhase::RollingUpdate
    } else if new.len() as u32 > desired || present > desired {
        OrderingPhase::ScalingDown
    } else if (new.len() as u32) < desired || new.iter().any(|m| !m.ready) {
        OrderingPhase::ScalingUp
    } else {
        OrderingPhase::Stable
    };

    OrderingPlan {
        phase,
        steps,
        intent,
        updated,
    }
}
