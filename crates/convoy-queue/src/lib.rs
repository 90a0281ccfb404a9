//! convoy-queue — the work queue between informers and reconcile workers.
//!
//! # Guarantees
//!
//! - A key is handed to at most one worker at a time: `get` marks it
//!   processing until `done`.
//! - Adding a key that is already queued is a no-op. Adding a key that is
//!   being processed marks it dirty; it is queued again exactly once when
//!   the worker calls `done`, so no update is lost to coalescing.
//! - Failed keys are retried through `add_rate_limited`, which delays by
//!   `base * 2^failures` up to a cap. `forget` resets the count.
//!
//! ```text
//! add ──► dirty? ──no──► processing? ──no──► queue ──get──► processing
//!                                     yes                       │
//!                                      └──── re-queued on done ◄┘
//! ```

pub mod backoff;
pub mod queue;

pub use backoff::{BackoffPolicy, RetryClass};
pub use queue::WorkQueue;
