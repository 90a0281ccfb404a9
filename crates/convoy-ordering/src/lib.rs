//! Convoy ordering engine — decides which members to create or delete next.
//!
//! Reconcilers hand this crate a snapshot of a workload's members and get
//! back the next batch of steps. Nothing here touches the store; every
//! function is a pure computation over the snapshot, so re-planning against
//! an unchanged snapshot always yields the same steps.
//!
//! # Components
//!
//! - **`strategy`** — rolling update budgets (`max_surge`, `max_unavailable`)
//! - **`engine`** — ordered (ordinal) and rolling (surge/unavailable) planners
//! - **`revision`** — template hashing, revision selection and history pruning

pub mod engine;
pub mod revision;
pub mod strategy;

pub use engine::{
    Member, OrderingPhase, OrderingPlan, ReplicaIntent, Step, plan_ordered, plan_rolling,
};
pub use revision::{RevisionDecision, RevisionRecord, revision_hash, revisions_to_prune, select_revision};
pub use strategy::{RollingUpdateStrategy, StrategyError};
