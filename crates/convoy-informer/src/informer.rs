//! Informer — keeps the shared cache in step with the store for one kind.
//!
//! Each informer runs a single dispatch loop: subscribe to the store's watch,
//! list everything of its kind, then apply watch events in the order the
//! store published them. A lagged watch or the periodic resync tick throws
//! the stream away and starts over with a fresh relist, which diffs against
//! the cache and reports every key it still holds as `Resynced`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use convoy_state::{LabelSelector, SharedStore, StoreEvent, WatchError};

use crate::cache::{Cache, CacheReader, Notification};

const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(600);
const RELIST_RETRY: Duration = Duration::from_secs(1);

pub struct Informer {
    kind: String,
    store: SharedStore,
    cache: Cache,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
    resync_period: Duration,
    /// Store version observed just before the last relist. Watch events at
    /// or below it are already reflected in the cache.
    watermark: AtomicU64,
}

impl Informer {
    pub fn new(kind: impl Into<String>, store: SharedStore, cache: Cache) -> Self {
        Self {
            kind: kind.into(),
            store,
            cache,
            subscribers: Mutex::new(Vec::new()),
            resync_period: DEFAULT_RESYNC_PERIOD,
            watermark: AtomicU64::new(0),
        }
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn reader(&self) -> CacheReader {
        self.cache.reader()
    }

    pub fn has_synced(&self) -> bool {
        self.cache.reader().has_synced(&self.kind)
    }

    /// Register for change notifications. The receiver sees every change
    /// applied after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// List the kind from the store and reconcile the cache against it.
    /// Returns the number of listed objects.
    pub fn relist(&self) -> anyhow::Result<usize> {
        let version = self
            .store
            .current_version()
            .with_context(|| format!("reading store version for {}", self.kind))?;
        let listed = self
            .store
            .list(&self.kind, None, &LabelSelector::everything())
            .with_context(|| format!("listing {}", self.kind))?;
        let count = listed.len();

        self.watermark.store(version, Ordering::SeqCst);
        let notifications = self.cache.replace_kind(&self.kind, listed);
        debug!(kind = %self.kind, count, version, "relisted");
        for notification in notifications {
            self.notify(notification);
        }
        Ok(count)
    }

    /// Run until `shutdown` flips or the store closes its watch channel.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(kind = %self.kind, "informer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Subscribe before listing so nothing committed in between is lost.
            let mut stream = self.store.watch(&self.kind);
            if let Err(e) = self.relist() {
                warn!(kind = %self.kind, error = %e, "relist failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RELIST_RETRY) => continue,
                    _ = shutdown.changed() => break,
                }
            }

            let resync = tokio::time::sleep(self.resync_period);
            tokio::pin!(resync);

            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Ok(event) => self.dispatch(event),
                        Err(WatchError::Lagged(missed)) => {
                            warn!(kind = %self.kind, missed, "watch lagged, relisting");
                            break;
                        }
                        Err(WatchError::Closed) => {
                            info!(kind = %self.kind, "watch closed, informer stopping");
                            return Ok(());
                        }
                    },
                    _ = &mut resync => {
                        debug!(kind = %self.kind, "periodic resync");
                        break;
                    }
                    _ = shutdown.changed() => {
                        info!(kind = %self.kind, "informer shutting down");
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    fn dispatch(&self, event: StoreEvent) {
        if event.resource.resource_version <= self.watermark.load(Ordering::SeqCst) {
            return;
        }
        if let Some(notification) = self.cache.apply(event.event_type, event.resource) {
            self.notify(notification);
        }
    }

    fn notify(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        // Drop subscribers whose receiver has gone away.
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}
