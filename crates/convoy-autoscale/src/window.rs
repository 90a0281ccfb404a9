//! Fixed-capacity ring of timestamped values.

use std::collections::VecDeque;

/// Holds the most recent `capacity` entries, oldest first.
#[derive(Debug, Clone)]
pub struct SampleRing<T> {
    entries: VecDeque<(u64, T)>,
    capacity: usize,
}

impl<T: Copy> SampleRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a value observed at `timestamp` (unix millis), evicting the
    /// oldest entry when full.
    pub fn push(&mut self, timestamp: u64, value: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp, value));
    }

    /// Drop everything observed before `cutoff`.
    pub fn retain_since(&mut self, cutoff: u64) {
        while self.entries.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.entries.pop_front();
        }
    }

    /// Values observed at or after `cutoff`.
    pub fn since(&self, cutoff: u64) -> impl Iterator<Item = T> + '_ {
        self.entries
            .iter()
            .filter(move |(ts, _)| *ts >= cutoff)
            .map(|(_, v)| *v)
    }

    pub fn latest(&self) -> Option<T> {
        self.entries.back().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut ring = SampleRing::new(3);
        for i in 0..5u32 {
            ring.push(u64::from(i), i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.since(0).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.latest(), Some(4));
    }

    #[test]
    fn window_queries_and_pruning() {
        let mut ring = SampleRing::new(10);
        ring.push(1_000, 5u32);
        ring.push(2_000, 7);
        ring.push(3_000, 6);

        assert_eq!(ring.since(2_000).max(), Some(7));
        ring.retain_since(2_500);
        assert_eq!(ring.len(), 1);
        assert!(!ring.is_empty());
    }
}
