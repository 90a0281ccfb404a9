//! Watch fan-out.
//!
//! The store publishes every committed change on a bounded broadcast
//! channel. A [`WatchStream`] filters that channel down to one kind. A
//! receiver that falls behind the channel capacity observes
//! [`WatchError::Lagged`]; callers must treat that as a broken stream and
//! relist.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::Resource;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A committed change. For `Deleted`, `resource` is the last stored state
/// with the `resource_version` of the delete itself.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub event_type: EventType,
    pub resource: Arc<Resource>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("watch fell behind by {0} events")]
    Lagged(u64),
    #[error("watch channel closed")]
    Closed,
}

/// Change events for a single kind.
pub struct WatchStream {
    kind: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl WatchStream {
    pub(crate) fn new(kind: &str, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self {
            kind: kind.to_string(),
            rx,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Wait for the next event of this stream's kind.
    pub async fn next(&mut self) -> Result<StoreEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.resource.kind == self.kind => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(WatchError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }
}
