//! Controller counters and their Prometheus text rendering.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared by the workers, the executor and the HTTP endpoint.
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    reconciles: AtomicU64,
    reconcile_errors: Mutex<BTreeMap<&'static str, u64>>,
    actions: Mutex<BTreeMap<&'static str, u64>>,
    queue_depth: AtomicU64,
    leading: AtomicBool,
}

/// Point-in-time copy of [`ControllerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reconciles: u64,
    pub errors: BTreeMap<&'static str, u64>,
    pub actions: BTreeMap<&'static str, u64>,
    pub queue_depth: u64,
    pub leading: bool,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconcile(&self) {
        self.reconciles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, class: &'static str) {
        let mut errors = self.reconcile_errors.lock().unwrap_or_else(|e| e.into_inner());
        *errors.entry(class).or_default() += 1;
    }

    pub fn record_action(&self, verb: &'static str) {
        let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
        *actions.entry(verb).or_default() += 1;
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn set_leading(&self, leading: bool) {
        self.leading.store(leading, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconciles: self.reconciles.load(Ordering::Relaxed),
            errors: self
                .reconcile_errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            actions: self
                .actions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            leading: self.leading.load(Ordering::Relaxed),
        }
    }
}

/// Render a snapshot in the Prometheus text exposition format.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP convoy_reconciles_total Reconcile attempts.\n");
    out.push_str("# TYPE convoy_reconciles_total counter\n");
    out.push_str(&format!("convoy_reconciles_total {}\n", snapshot.reconciles));

    out.push_str("# HELP convoy_reconcile_errors_total Failed reconciles by error class.\n");
    out.push_str("# TYPE convoy_reconcile_errors_total counter\n");
    for (class, count) in &snapshot.errors {
        out.push_str(&format!(
            "convoy_reconcile_errors_total{{class=\"{class}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP convoy_actions_total Store mutations applied by the executor.\n");
    out.push_str("# TYPE convoy_actions_total counter\n");
    for (verb, count) in &snapshot.actions {
        out.push_str(&format!("convoy_actions_total{{verb=\"{verb}\"}} {count}\n"));
    }

    out.push_str("# HELP convoy_queue_depth Keys waiting in the work queue.\n");
    out.push_str("# TYPE convoy_queue_depth gauge\n");
    out.push_str(&format!("convoy_queue_depth {}\n", snapshot.queue_depth));

    out.push_str("# HELP convoy_leader Whether this instance holds the leader lease.\n");
    out.push_str("# TYPE convoy_leader gauge\n");
    out.push_str(&format!("convoy_leader {}\n", u8::from(snapshot.leading)));

    out
}
