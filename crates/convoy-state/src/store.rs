//! StateStore — redb-backed resource persistence for Convoy.
//!
//! Provides versioned CRUD over resources plus a watch fan-out. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Writes are serialized behind a mutex that also covers publishing the
//! change event, so watchers see events in `resource_version` order.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::watch::{EventType, StoreEvent, WatchStream};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// The typed CRUD + watch surface controllers are written against.
///
/// Every update and delete carries the `resource_version` the caller last
/// observed; a mismatch returns [`StateError::Conflict`].
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &ResourceKey) -> StateResult<Option<Resource>>;

    /// Resources of `kind`, optionally restricted to one namespace, whose
    /// labels match `selector`.
    fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>>;

    /// Store a new resource. Identity, labels, owner, finalizers and spec
    /// are taken from `resource`; every other field is assigned here.
    fn create(&self, resource: &Resource) -> StateResult<Resource>;

    /// Replace `spec`. Bumps `generation` when the value actually changes;
    /// writing an identical spec is a no-op that returns the stored object.
    fn update_spec(
        &self,
        key: &ResourceKey,
        spec: Value,
        expected_version: u64,
    ) -> StateResult<Resource>;

    /// Replace `status`. Never touches `generation`.
    fn update_status(
        &self,
        key: &ResourceKey,
        status: Value,
        expected_version: u64,
    ) -> StateResult<Resource>;

    /// Replace the finalizer list. Clearing the last finalizer of a resource
    /// that is being deleted removes it; `Ok(None)` reports that.
    fn update_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: Vec<String>,
        expected_version: u64,
    ) -> StateResult<Option<Resource>>;

    /// Request deletion. Resources without finalizers are removed at once
    /// (`Ok(None)`); otherwise a deletion timestamp is set and the still
    /// present resource is returned.
    fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<u64>,
    ) -> StateResult<Option<Resource>>;

    /// Subscribe to changes of `kind` committed after this call.
    fn watch(&self, kind: &str) -> WatchStream;

    /// The most recently issued resource version. Everything at or below it
    /// is reflected in any read that starts afterwards.
    fn current_version(&self) -> StateResult<u64>;
}

/// A store shared between informers, executors and leader election.
pub type SharedStore = Arc<dyn ObjectStore>;

/// Tunables for a store instance.
#[derive(Clone)]
pub struct StoreOptions {
    pub clock: SharedClock,
    /// Broadcast buffer; slower watchers beyond this lag and must relist.
    pub watch_capacity: usize,
    /// Maximum number of objects per namespace, across all kinds.
    pub namespace_quota: Option<usize>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            watch_capacity: DEFAULT_WATCH_CAPACITY,
            namespace_quota: None,
        }
    }
}

struct Inner {
    db: Database,
    events: broadcast::Sender<StoreEvent>,
    write_lock: Mutex<()>,
    clock: SharedClock,
    namespace_quota: Option<usize>,
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

/// What a write closure decided to do with the row it was shown.
enum Write {
    Put(Resource, EventType),
    Remove(Resource),
    Skip,
}

struct Mutation<T> {
    write: Write,
    value: T,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: &Path, options: StoreOptions) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db, options);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Self::open_in_memory_with(StoreOptions::default())
    }

    pub fn open_in_memory_with(options: StoreOptions) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db, options);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database, options: StoreOptions) -> Self {
        let (events, _) = broadcast::channel(options.watch_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                db,
                events,
                write_lock: Mutex::new(()),
                clock: options.clock,
                namespace_quota: options.namespace_quota,
            }),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(SAMPLES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Run `op` against the current row for `key` inside a single write
    /// transaction. `op` receives the stored resource (if any) and the
    /// version the write will carry.
    fn mutate<T>(
        &self,
        key: &ResourceKey,
        op: impl FnOnce(Option<Resource>, u64) -> StateResult<Mutation<T>>,
    ) -> StateResult<T> {
        let _guard = self
            .inner
            .write_lock
            .lock()
            .map_err(|_| StateError::Transaction("write lock poisoned".to_string()))?;

        let table_key = key.to_string();
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let (value, event) = {
            let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;

            let existing = match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<Resource>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let is_new = existing.is_none();
            let current = meta
                .get(VERSION_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            let next = current + 1;

            let Mutation { write, value } = op(existing, next)?;
            let event = match write {
                Write::Put(resource, event_type) => {
                    if is_new && let Some(limit) = self.inner.namespace_quota {
                        let prefix_ns = format!("/{}/", key.namespace);
                        let mut count = 0usize;
                        for entry in table.iter().map_err(map_err!(Read))? {
                            let (k, _) = entry.map_err(map_err!(Read))?;
                            let k = k.value();
                            // Keys are `{kind}/{namespace}/{name}`.
                            if let Some(idx) = k.find('/')
                                && k[idx..].starts_with(&prefix_ns)
                            {
                                count += 1;
                            }
                        }
                        if count >= limit {
                            return Err(StateError::QuotaExceeded {
                                namespace: key.namespace.clone(),
                                limit,
                            });
                        }
                    }
                    let bytes = serde_json::to_vec(&resource).map_err(map_err!(Serialize))?;
                    table
                        .insert(table_key.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    meta.insert(VERSION_KEY, next).map_err(map_err!(Write))?;
                    Some(StoreEvent {
                        event_type,
                        resource: Arc::new(resource),
                    })
                }
                Write::Remove(resource) => {
                    table
                        .remove(table_key.as_str())
                        .map_err(map_err!(Write))?;
                    meta.insert(VERSION_KEY, next).map_err(map_err!(Write))?;
                    Some(StoreEvent {
                        event_type: EventType::Deleted,
                        resource: Arc::new(resource),
                    })
                }
                Write::Skip => None,
            };
            (value, event)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        if let Some(event) = event {
            debug!(
                key = %table_key,
                version = event.resource.resource_version,
                event = ?event.event_type,
                "resource written"
            );
            // No receivers is fine: nobody is watching yet.
            let _ = self.inner.events.send(event);
        }
        Ok(value)
    }

    // ── Metric samples ─────────────────────────────────────────────

    /// Record a metric sample.
    pub fn put_sample(&self, sample: &MetricSample) -> StateResult<()> {
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let seq = meta
                .get(SAMPLE_SEQ_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            meta.insert(SAMPLE_SEQ_KEY, seq).map_err(map_err!(Write))?;

            let key = sample.table_key(seq);
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl ObjectStore for StateStore {
    fn get(&self, key: &ResourceKey) -> StateResult<Option<Resource>> {
        let table_key = key.to_string();
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        match table.get(table_key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let resource: Resource =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(resource))
            }
            None => Ok(None),
        }
    }

    fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>> {
        let prefix = match namespace {
            Some(ns) => format!("{kind}/{ns}/"),
            None => ResourceKey::kind_prefix(kind),
        };
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let resource: Resource =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if selector.matches(&resource.labels) {
                results.push(resource);
            }
        }
        Ok(results)
    }

    fn create(&self, resource: &Resource) -> StateResult<Resource> {
        let key = resource.key();
        let now = self.inner.clock.now_millis();
        self.mutate(&key, |existing, version| {
            if existing.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            let stored = Resource {
                uid: generate_uid(&key, version),
                generation: 1,
                resource_version: version,
                deletion_timestamp: None,
                created_at: now,
                status: Value::Null,
                ..resource.clone()
            };
            Ok(Mutation {
                write: Write::Put(stored.clone(), EventType::Added),
                value: stored,
            })
        })
    }

    fn update_spec(
        &self,
        key: &ResourceKey,
        spec: Value,
        expected_version: u64,
    ) -> StateResult<Resource> {
        self.mutate(key, |existing, version| {
            let mut current = check_version(key, existing, expected_version)?;
            if current.spec == spec {
                return Ok(Mutation {
                    write: Write::Skip,
                    value: current,
                });
            }
            current.spec = spec;
            current.generation += 1;
            current.resource_version = version;
            Ok(Mutation {
                write: Write::Put(current.clone(), EventType::Modified),
                value: current,
            })
        })
    }

    fn update_status(
        &self,
        key: &ResourceKey,
        status: Value,
        expected_version: u64,
    ) -> StateResult<Resource> {
        self.mutate(key, |existing, version| {
            let mut current = check_version(key, existing, expected_version)?;
            if current.status == status {
                return Ok(Mutation {
                    write: Write::Skip,
                    value: current,
                });
            }
            current.status = status;
            current.resource_version = version;
            Ok(Mutation {
                write: Write::Put(current.clone(), EventType::Modified),
                value: current,
            })
        })
    }

    fn update_finalizers(
        &self,
        key: &ResourceKey,
        finalizers: Vec<String>,
        expected_version: u64,
    ) -> StateResult<Option<Resource>> {
        self.mutate(key, |existing, version| {
            let mut current = check_version(key, existing, expected_version)?;
            current.finalizers = finalizers;
            current.resource_version = version;
            if current.is_deleting() && current.finalizers.is_empty() {
                return Ok(Mutation {
                    write: Write::Remove(current),
                    value: None,
                });
            }
            Ok(Mutation {
                write: Write::Put(current.clone(), EventType::Modified),
                value: Some(current),
            })
        })
    }

    fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<u64>,
    ) -> StateResult<Option<Resource>> {
        let now = self.inner.clock.now_millis();
        self.mutate(key, |existing, version| {
            let mut current = match expected_version {
                Some(expected) => check_version(key, existing, expected)?,
                None => existing.ok_or_else(|| StateError::NotFound(key.to_string()))?,
            };
            if current.finalizers.is_empty() {
                current.resource_version = version;
                return Ok(Mutation {
                    write: Write::Remove(current),
                    value: None,
                });
            }
            if current.is_deleting() {
                return Ok(Mutation {
                    write: Write::Skip,
                    value: Some(current),
                });
            }
            current.deletion_timestamp = Some(now);
            current.resource_version = version;
            Ok(Mutation {
                write: Write::Put(current.clone(), EventType::Modified),
                value: Some(current),
            })
        })
    }

    fn watch(&self, kind: &str) -> WatchStream {
        WatchStream::new(kind, self.inner.events.subscribe())
    }

    fn current_version(&self) -> StateResult<u64> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(VERSION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }
}

impl MetricSource for StateStore {
    fn query(
        &self,
        resource: &ResourceKey,
        metric: &str,
        window: Duration,
    ) -> StateResult<Vec<MetricSample>> {
        let now = self.inner.clock.now_millis();
        let since = now.saturating_sub(window.as_millis() as u64);
        let prefix = MetricSample::series_prefix(resource, metric);
        let start = format!("{prefix}{since:020}");

        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(start.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let sample: MetricSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            // `cpu` is a key prefix of `cpu:throttled`.
            if sample.resource != *resource || sample.metric != metric {
                continue;
            }
            if sample.timestamp <= now {
                results.push(sample);
            }
        }
        Ok(results)
    }

    fn prune(&self, resource: &ResourceKey, metric: &str, retain: Duration) -> StateResult<usize> {
        let cutoff = self
            .inner
            .clock
            .now_millis()
            .saturating_sub(retain.as_millis() as u64);
        let prefix = MetricSample::series_prefix(resource, metric);
        let end = format!("{prefix}{cutoff:020}");

        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table
                .range(prefix.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let sample: MetricSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if sample.resource == *resource
                    && sample.metric == metric
                    && sample.timestamp < cutoff
                {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            expired.len()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(%resource, metric, removed, "pruned metric samples");
        }
        Ok(removed)
    }
}

/// Reject writes based on a stale read.
fn check_version(
    key: &ResourceKey,
    existing: Option<Resource>,
    expected: u64,
) -> StateResult<Resource> {
    let current = existing.ok_or_else(|| StateError::NotFound(key.to_string()))?;
    if current.resource_version != expected {
        return Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            actual: current.resource_version,
        });
    }
    Ok(current)
}

fn generate_uid(key: &ResourceKey, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hasher.update(version.to_be_bytes());
    hex::encode(&hasher.finalize()[..8])
}
