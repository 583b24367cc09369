//! The concurrent stream pipeline: egress (WHIP, §4.11) and ingress (WHEP,
//! §4.12) worker sets, plus the bounded egress queue they share.

pub mod egress;
pub mod ingress;

use std::collections::VecDeque;

/// Bounded per-stream queue with the drop-oldest-on-full and latency-trim
/// discipline from spec.md §4.11 / §3 `PipelineQueue`.
pub struct EgressQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    trim_depth_threshold: usize,
    enqueues_since_trim_eligible: u64,
    pub queue_full_count: u64,
    pub latency_trim_count: u64,
}

/// Whether an enqueue evicted an item, and why — callers use this to
/// decide whether to resync the downstream pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    QueueFull,
    LatencyTrim,
}

impl<T> EgressQueue<T> {
    pub fn new(capacity: usize, trim_depth_threshold: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            trim_depth_threshold,
            enqueues_since_trim_eligible: 0,
            queue_full_count: 0,
            latency_trim_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Enqueue `item`, applying the queue-full and latency-trim eviction
    /// policies. Returns the eviction reason if one fired, so the caller
    /// can trigger a pacer resync.
    pub fn push(&mut self, item: T) -> Option<EvictionReason> {
        if self.items.len() > self.trim_depth_threshold {
            self.enqueues_since_trim_eligible += 1;
            if self.enqueues_since_trim_eligible.is_multiple_of(3) {
                self.items.pop_front();
                self.items.push_back(item);
                self.latency_trim_count += 1;
                return Some(EvictionReason::LatencyTrim);
            }
        } else {
            self.enqueues_since_trim_eligible = 0;
        }

        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.items.push_back(item);
            self.queue_full_count += 1;
            return Some(EvictionReason::QueueFull);
        }

        self.items.push_back(item);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_evicts_oldest_past_capacity() {
        let mut q = EgressQueue::new(12, 4);
        for i in 0..12 {
            assert!(q.push(i).is_none());
        }
        let reason = q.push(12);
        assert_eq!(reason, Some(EvictionReason::QueueFull));
        assert_eq!(q.len(), 12);
        assert_eq!(q.pop_front(), Some(1));
    }

    #[test]
    fn latency_trim_fires_every_third_enqueue_past_threshold() {
        let mut q = EgressQueue::new(100, 4);
        for i in 0..5 {
            assert!(q.push(i).is_none());
        }
        // depth is now 5 > threshold 4; next three enqueues: trim on the 3rd.
        assert!(q.push(5).is_none());
        assert!(q.push(6).is_none());
        let reason = q.push(7);
        assert_eq!(reason, Some(EvictionReason::LatencyTrim));
    }

    #[test]
    fn twenty_items_at_capacity_twelve_yields_bounded_survivors() {
        let mut q: EgressQueue<u32> = EgressQueue::new(12, 4);
        for i in 0..20 {
            q.push(i);
        }
        assert!(q.len() <= 12);
        assert!(q.queue_full_count > 0);
    }
}
