//! WorkQueue — a set plus a delay heap, shared by all reconcile workers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backoff::{BackoffPolicy, RetryClass};

/// A key parked until `ready_at`.
struct Delayed<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    // Reversed so the `BinaryHeap` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Retry bookkeeping for a key that keeps failing.
struct Failure {
    count: u32,
    since: Instant,
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-queued after `done`.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    delayed: BinaryHeap<Delayed<K>>,
    /// Earliest pending deadline per delayed key.
    waiting: HashMap<K, Instant>,
    failures: HashMap<K, Failure>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn insert(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            // Re-queued by `done`.
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move every delayed key whose deadline has passed into the queue.
    fn promote_due(&mut self, now: Instant) -> bool {
        let mut promoted = false;
        while let Some(head) = self.delayed.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            // Superseded by an earlier deadline for the same key.
            if self.waiting.get(&entry.key) != Some(&entry.ready_at) {
                continue;
            }
            self.waiting.remove(&entry.key);
            promoted |= self.insert(entry.key);
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.ready_at)
    }
}

/// Deduplicating, delayed-retry queue of reconcile keys.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl<K: Clone + Eq + Hash + std::fmt::Debug> WorkQueue<K> {
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::default())
    }

    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                waiting: HashMap::new(),
                failures: HashMap::new(),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // A panicking worker must not take the whole queue down with it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `key` as needing reconciliation.
    pub fn add(&self, key: K) {
        let queued = self.lock().insert(key);
        if queued {
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. A pending earlier deadline for the
    /// same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&key)
                && *existing <= ready_at
            {
                return;
            }
            state.seq += 1;
            let seq = state.seq;
            state.waiting.insert(key.clone(), ready_at);
            state.delayed.push(Delayed { ready_at, seq, key });
        }
        // Wake a waiter so it can shorten its sleep.
        self.notify.notify_one();
    }

    /// Re-add `key` after its backoff delay and record one more failure.
    pub fn add_rate_limited(&self, key: K, class: RetryClass) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failure = state.failures.entry(key.clone()).or_insert(Failure {
                count: 0,
                since: Instant::now(),
            });
            let delay = self.backoff.delay(failure.count, class);
            failure.count += 1;
            delay
        };
        debug!(?key, ?delay, ?class, "requeue with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// How many times `key` has been retried since it last succeeded.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).map_or(0, |f| f.count)
    }

    /// How long `key` has been failing continuously, if it is.
    pub fn failing_for(&self, key: &K) -> Option<Duration> {
        self.lock()
            .failures
            .get(key)
            .map(|f| Instant::now().saturating_duration_since(f.since))
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before releasing the lock so a concurrent `add` or
            // `shut_down` cannot slip between the check and the wait.
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the baton to another idle worker.
                        self.notify.notify_one();
                    }
                    trace!(?key, "dispatched");
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. If it was added while in flight, it
    /// goes back on the queue now.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Queued and delayed keys are dropped; workers
    /// already holding a key may still call `done`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            let dropped = state.queue.len() + state.delayed.len();
            state.queue.clear();
            state.delayed.clear();
            state.waiting.clear();
            debug!(dropped, "work queue shut down");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    /// Keys parked on a delay.
    pub fn delayed_len(&self) -> usize {
        self.lock().waiting.len()
    }
}

impl<K: Clone + Eq + Hash + std::fmt::Debug> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn add_is_coalesced_while_queued() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_once_on_done() {
        let q = WorkQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();

        // Added twice while a worker holds it.
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "in-flight key must not be handed out again");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn one_worker_per_key() {
        let q = Arc::new(WorkQueue::new());
        q.add("a");
        let first = q.get().await.unwrap();
        q.add("a");

        // A second worker must not get "a" until it is done.
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        q.done(&first);
        assert_eq!(waiter.await.unwrap(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = WorkQueue::new();
        q.add_after("a", Duration::from_secs(5));
        assert_eq!(q.len(), 0);
        assert_eq!(q.delayed_len(), 1);

        let start = Instant::now();
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins() {
        let q = WorkQueue::new();
        q.add_after("a", Duration::from_secs(60));
        q.add_after("a", Duration::from_secs(1));
        q.add_after("a", Duration::from_secs(30));

        let start = Instant::now();
        assert_eq!(q.get().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(30));
        q.done(&"a");

        // The superseded entries do not fire again.
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(q.len(), 0);
        assert_eq!(q.delayed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_backoff_doubles_and_forget_resets() {
        let q = WorkQueue::with_backoff(BackoffPolicy {
            base: Duration::from_millis(100),
            quota_base: Duration::from_secs(10),
            max: Duration::from_secs(1),
        });

        assert_eq!(q.add_rate_limited("a", RetryClass::Standard), Duration::from_millis(100));
        assert_eq!(q.add_rate_limited("a", RetryClass::Standard), Duration::from_millis(200));
        assert_eq!(q.add_rate_limited("a", RetryClass::Standard), Duration::from_millis(400));
        assert_eq!(q.num_requeues(&"a"), 3);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.add_rate_limited("a", RetryClass::Quota), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_for_tracks_first_failure() {
        let q = WorkQueue::new();
        assert!(q.failing_for(&"a").is_none());
        q.add_rate_limited("a", RetryClass::Standard);
        tokio::time::advance(Duration::from_secs(90)).await;
        q.add_rate_limited("a", RetryClass::Standard);
        assert!(q.failing_for(&"a").unwrap() >= Duration::from_secs(90));
    }

    #[tokio::test]
    async fn shut_down_wakes_waiters_and_drops_pending() {
        let q = Arc::new(WorkQueue::<&str>::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;

        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("late");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shut_down_lets_in_flight_finish() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("b");
        let held = q.get().await.unwrap();
        q.add("a");

        q.shut_down();
        assert_eq!(q.in_flight(), 1);
        q.done(&held);
        assert_eq!(q.in_flight(), 0);
        assert!(q.is_empty(), "queued keys are dropped on shutdown");
    }
}
