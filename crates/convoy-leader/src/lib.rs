//! convoy-leader — one active controller per identity across replicas.
//!
//! Leadership is a lease record stored in the object store under a
//! well-known key and claimed with the store's optimistic concurrency: two
//! candidates writing from the same observed version cannot both win.
//!
//! A holder renews every `retry_period`. A candidate only takes over once
//! `renew_time + lease_duration` has passed. The holder itself stops acting
//! once `renew_deadline` has passed without a successful renewal, which is
//! shorter than `lease_duration`, so the two windows never overlap.
//! [`LeaderGate`] is the cheap, cloneable check executors consult before
//! every write.

pub mod elector;
pub mod lease;

pub use elector::{LeaderElector, LeaderGate};
pub use lease::{LEASE_KIND, LEASE_NAMESPACE, LeaseConfig, LeaseRecord};
