//! Bounded, time-windowed de-duplication of message IDs
//!
//! Suppresses re-delivery when the topology transiently has redundant
//! paths, e.g. during a re-parenting race. Bounded in both time and
//! space so it can never grow without limit.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    capacity: usize,
    seen: HashMap<Uuid, Instant>,
    order: VecDeque<Uuid>,
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        DedupCache {
            window,
            capacity,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an ID. Returns `true` the first time it is seen inside the
    /// window, `false` for a duplicate.
    pub fn observe(&mut self, id: Uuid) -> bool {
        let now = Instant::now();
        self.prune_expired(now);

        if let Some(seen_at) = self.seen.get(&id) {
            if now.duration_since(*seen_at) < self.window {
                return false;
            }
        }
        self.seen.insert(id, now);
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune_expired(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .map(|at| now.duration_since(*at) >= self.window)
                .unwrap_or(true);
            if expired {
                if let Some(id) = self.order.pop_front() {
                    self.seen.remove(&id);
                }
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_passes() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 16);
        let id = Uuid::new_v4();
        assert!(cache.observe(id));
    }

    #[test]
    fn test_duplicate_inside_window_dropped() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 16);
        let id = Uuid::new_v4();
        assert!(cache.observe(id));
        assert!(!cache.observe(id));
        assert!(!cache.observe(id));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_id_expires_after_window() {
        let mut cache = DedupCache::new(Duration::from_secs(10), 16);
        let id = Uuid::new_v4();
        assert!(cache.observe(id));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.observe(id));
    }

    #[test]
    fn test_capacity_bound_evicts_oldest() {
        let mut cache = DedupCache::new(Duration::from_secs(3600), 4);
        let ids: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache.observe(*id);
        }
        assert!(cache.len() <= 4);
        // The newest entries are still remembered
        assert!(!cache.observe(ids[5]));
        // The oldest has been evicted and passes again
        assert!(cache.observe(ids[0]));
    }
}
