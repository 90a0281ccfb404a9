//! convoy-informer — the eventually-consistent local view controllers read.
//!
//! # Architecture
//!
//! ```text
//! ObjectStore ──watch(kind)──► Informer (one dispatch loop per kind)
//!      │                          │  apply in resource_version order
//!      └──────list(kind)─────────►│  relist + diff on lag / periodic resync
//!                                 ▼
//!                              Cache ──reader()──► CacheReader (reconcilers)
//!                                 │
//!                                 └──► Notification ──mpsc──► subscribers
//! ```
//!
//! The [`Cache`] is a single shared arena indexed by [`ResourceKey`], with an
//! owner index so a workload can find its children without following
//! pointers. Only informer loops write to it, each to its own kind.
//! Reconcilers get a [`CacheReader`], which has no write methods.
//!
//! Notifications go out over unbounded channels, so a slow subscriber
//! never stalls the dispatch loop.
//!
//! [`ResourceKey`]: convoy_state::ResourceKey

pub mod cache;
pub mod informer;

pub use cache::{Cache, CacheReader, Notification, NotificationKind};
pub use informer::Informer;
