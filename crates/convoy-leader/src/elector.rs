//! Lease-based leader election over the object store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use convoy_state::{
    Resource, ResourceKey, SharedClock, SharedStore, StateError, StateResult,
};

use crate::lease::{LEASE_KIND, LEASE_NAMESPACE, LeaseConfig, LeaseRecord};

struct GateState {
    leading: AtomicBool,
    /// Clock millis of the last successful acquire or renew.
    renewed_at: AtomicU64,
    renew_deadline_ms: u64,
    clock: SharedClock,
}

/// Answers "may I write right now?" for executors.
///
/// Closes on an explicit loss of leadership and also, without any help from
/// the election loop, once `renew_deadline` passes since the last renewal.
#[derive(Clone)]
pub struct LeaderGate {
    state: Arc<GateState>,
}

impl LeaderGate {
    fn new(clock: SharedClock, renew_deadline_ms: u64) -> Self {
        Self {
            state: Arc::new(GateState {
                leading: AtomicBool::new(false),
                renewed_at: AtomicU64::new(0),
                renew_deadline_ms,
                clock,
            }),
        }
    }

    /// A gate that is always open, for single-instance deployments.
    pub fn always_leading(clock: SharedClock) -> Self {
        let gate = Self::new(clock, u64::MAX);
        gate.state.leading.store(true, Ordering::SeqCst);
        gate
    }

    pub fn is_leading(&self) -> bool {
        if !self.state.leading.load(Ordering::SeqCst) {
            return false;
        }
        let now = self.state.clock.now_millis();
        let renewed = self.state.renewed_at.load(Ordering::SeqCst);
        now < renewed.saturating_add(self.state.renew_deadline_ms)
    }

    fn renewed(&self, at: u64) {
        self.state.renewed_at.store(at, Ordering::SeqCst);
        self.state.leading.store(true, Ordering::SeqCst);
    }

    fn revoke(&self) {
        self.state.leading.store(false, Ordering::SeqCst);
    }
}

pub struct LeaderElector {
    store: SharedStore,
    clock: SharedClock,
    identity: String,
    key: ResourceKey,
    config: LeaseConfig,
    gate: LeaderGate,
}

impl LeaderElector {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        identity: impl Into<String>,
        lease_name: &str,
        config: LeaseConfig,
    ) -> Self {
        let identity = identity.into();
        let gate = LeaderGate::new(clock.clone(), config.renew_deadline.as_millis() as u64);
        info!(identity = %identity, lease = %lease_name, "initialized leader elector");
        Self {
            store,
            clock,
            identity,
            key: ResourceKey::new(LEASE_KIND, LEASE_NAMESPACE, lease_name),
            config,
            gate,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn gate(&self) -> LeaderGate {
        self.gate.clone()
    }

    /// One acquire-or-renew attempt. `Ok(false)` means someone else holds a
    /// live lease or won a concurrent write.
    pub fn try_acquire_or_renew(&self) -> StateResult<bool> {
        let now = self.clock.now_millis();
        let duration_ms = self.config.lease_duration.as_millis() as u64;

        let acquired = match self.store.get(&self.key)? {
            None => {
                let record = LeaseRecord {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_ms: duration_ms,
                    acquire_time: now,
                    renew_time: now,
                    transitions: 0,
                };
                let lease = Resource::new(
                    LEASE_KIND,
                    LEASE_NAMESPACE,
                    &self.key.name,
                    to_value(&record)?,
                );
                match self.store.create(&lease) {
                    Ok(_) => true,
                    Err(StateError::AlreadyExists(_)) => false,
                    Err(e) => return Err(e),
                }
            }
            Some(existing) => {
                let current: LeaseRecord = existing.spec_as().unwrap_or_default();
                let ours = current.is_held_by(&self.identity);
                if !ours && !current.is_expired(now) {
                    debug!(
                        holder = ?current.holder_identity,
                        "lease held by another instance"
                    );
                    false
                } else {
                    let next = if ours {
                        LeaseRecord {
                            renew_time: now,
                            lease_duration_ms: duration_ms,
                            ..current
                        }
                    } else {
                        LeaseRecord {
                            holder_identity: Some(self.identity.clone()),
                            lease_duration_ms: duration_ms,
                            acquire_time: now,
                            renew_time: now,
                            transitions: current.transitions + 1,
                        }
                    };
                    match self.store.update_spec(
                        &self.key,
                        to_value(&next)?,
                        existing.resource_version,
                    ) {
                        Ok(_) => true,
                        Err(e) if e.is_conflict() => {
                            warn!(identity = %self.identity, "lease conflict, another instance wrote first");
                            false
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        };

        if acquired {
            self.gate.renewed(now);
        } else {
            self.gate.revoke();
        }
        Ok(acquired)
    }

    /// Give up the lease so a successor need not wait for expiry.
    pub fn release(&self) -> StateResult<()> {
        self.gate.revoke();
        let Some(existing) = self.store.get(&self.key)? else {
            return Ok(());
        };
        let current: LeaseRecord = existing.spec_as().unwrap_or_default();
        if !current.is_held_by(&self.identity) {
            debug!("lease not held by us, skipping release");
            return Ok(());
        }
        let released = LeaseRecord {
            holder_identity: None,
            ..current
        };
        match self
            .store
            .update_spec(&self.key, to_value(&released)?, existing.resource_version)
        {
            Ok(_) => {
                info!(identity = %self.identity, "released leader lease");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Campaign for the lease, then hold it until it is lost or `shutdown`
    /// fires.
    ///
    /// `on_started` runs once leadership is acquired. `on_stopped` runs when
    /// leadership ends for any reason. Returns without calling either if
    /// shutdown arrives first.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        on_started: impl FnOnce(),
        on_stopped: impl FnOnce(),
    ) {
        info!(identity = %self.identity, lease = %self.key.name, "waiting to acquire leader lease");
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            match self.try_acquire_or_renew() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "lease acquisition error"),
            }
        }

        info!(identity = %self.identity, "acquired leader lease");
        on_started();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if let Err(e) = self.release() {
                        warn!(error = %e, "failed to release leader lease");
                    }
                    on_stopped();
                    return;
                }
            }
            match self.try_acquire_or_renew() {
                Ok(true) => continue,
                Ok(false) => {
                    warn!(identity = %self.identity, "lost leader lease");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal error");
                    if !self.gate.is_leading() {
                        warn!(identity = %self.identity, "renew deadline passed, stepping down");
                        break;
                    }
                }
            }
        }

        self.gate.revoke();
        on_stopped();
    }
}

fn to_value(record: &LeaseRecord) -> StateResult<Value> {
    serde_json::to_value(record).map_err(|e| StateError::Serialize(e.to_string()))
}
