//! convoy-state — the object store the controllers converge against.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for versioned resources, a watch fan-out for change events, and a
//! metric sample table consumed by the autoscaler.
//!
//! # Architecture
//!
//! All resources are JSON-serialized into redb's `&[u8]` value columns under
//! the composite key `{kind}/{namespace}/{name}`. A single store-wide counter
//! hands out `resource_version`s, so versions are totally ordered across
//! kinds. Every write that changes a resource bumps the counter and is
//! published to watchers after commit.
//!
//! Updates and deletes carry the version the caller last observed. A
//! mismatch is reported as [`StateError::Conflict`] and nothing is written.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc`) and can be
//! shared across async tasks. Controllers talk to it through the
//! [`ObjectStore`] trait so tests can wrap it with fault injection.

pub mod clock;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{StateError, StateResult};
pub use store::{ObjectStore, SharedStore, StateStore, StoreOptions};
pub use types::*;
pub use watch::{EventType, StoreEvent, WatchError, WatchStream};
