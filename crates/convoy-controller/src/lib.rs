//! convoy-controller — workload reconcilers and the runtime that drives them.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────── Controller ───────────────┐
//! ObjectStore ──► │ Informers ─► Cache        WorkQueue     │
//!      ▲          │    │                        ▲   │       │
//!      │          │    └─notify─► forwarders ───┘   ▼       │
//!      │          │                            workers      │
//!      │          │                               │         │
//!      │          │  Registry: Deployment │ StatefulSet │ HPA
//!      │          │                               │ plan    │
//!      └──────────┼──────────── Executor ◄────────┘         │
//!                 └────────────────────┬────────────────────┘
//!                                  LeaderGate
//! ```
//!
//! Reconcilers are pure planners: given a key and a read-only cache they
//! return a [`ReconcilePlan`] of [`Action`]s. The [`Executor`] applies
//! plans with optimistic concurrency, status writes last, and refuses every
//! write once the [`LeaderGate`](convoy_leader::LeaderGate) closes.
//!
//! Errors are classified by [`ReconcileError`]; the runtime maps each class
//! to a retry policy (immediate, backed off, quota backed off, or none).

pub mod action;
pub mod autoscaler;
pub mod children;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod reconciler;
pub mod statefulset;

pub use action::{Action, UpdateTarget};
pub use autoscaler::{AutoscalerReconciler, AutoscalerSpec, AutoscalerStatus, ScaleTargetRef};
pub use conditions::{Condition, ConditionStatus};
pub use config::{ConfigError, ControllerConfig};
pub use controller::{Controller, WATCHED_KINDS};
pub use deployment::{DeploymentReconciler, DeploymentSpec, DeploymentStatus};
pub use error::{ReconcileError, ReconcileResult};
pub use executor::Executor;
pub use metrics::{ControllerMetrics, MetricsSnapshot, render_prometheus};
pub use reconciler::{ReconcileContext, ReconcilePlan, Registry, WorkloadReconciler};
pub use statefulset::{StatefulSetReconciler, StatefulSetSpec, StatefulSetStatus};
