//! Global event queue ordered by the canonical key.
//!
//! Every item is stamped with an ingestion sequence number on `schedule`, so
//! the key `(ts, idx, seq)` is a total order and the pop order never depends
//! on heap internals.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::event::EventKey;

#[derive(Debug, Clone)]
struct Entry<T> {
    key: EventKey,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

#[derive(Debug, Clone)]
pub struct EventQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Enqueue `item` at `ts`; returns the ingestion sequence it was given.
    #[inline]
    pub fn schedule(&mut self, ts: u64, idx: Vec<i64>, item: T) -> u64 {
        let seq = self.reserve_seq();
        self.heap.push(Reverse(Entry {
            key: EventKey { ts, idx, seq },
            item,
        }));
        seq
    }

    /// Take the next sequence number without queueing anything, for items
    /// delivered directly within the current instant.
    #[inline]
    pub fn reserve_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Timestamp of the earliest pending item.
    pub fn peek_time(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.key.ts)
    }

    /// Pop the minimum item.
    pub fn next(&mut self) -> Option<(EventKey, T)> {
        self.heap.pop().map(|Reverse(e)| (e.key, e.item))
    }

    /// Pop every item with `ts < until`, in canonical order.
    pub fn drain_before(&mut self, until: u64) -> Vec<(EventKey, T)> {
        let mut out = Vec::new();
        while self.peek_time().is_some_and(|ts| ts < until) {
            if let Some(entry) = self.next() {
                out.push(entry);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_canonical_order() {
        let mut q = EventQueue::new();
        q.schedule(10, vec![2], "c");
        q.schedule(5, vec![9], "a");
        q.schedule(10, vec![1, 4], "b2");
        q.schedule(10, vec![1, 3], "b1");
        q.schedule(10, vec![2], "d");
        let order: Vec<_> = std::iter::from_fn(|| q.next()).map(|(_, v)| v).collect();
        assert_eq!(order, vec!["a", "b1", "b2", "c", "d"]);
    }

    #[test]
    fn drain_before_is_exclusive() {
        let mut q = EventQueue::new();
        for ts in [3, 1, 2, 2, 7] {
            q.schedule(ts, vec![], ts);
        }
        let drained: Vec<_> = q.drain_before(3).into_iter().map(|(k, _)| k.ts).collect();
        assert_eq!(drained, vec![1, 2, 2]);
        assert_eq!(q.peek_time(), Some(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn reserved_sequence_numbers_are_shared() {
        let mut q = EventQueue::new();
        assert_eq!(q.schedule(1, vec![], ()), 0);
        assert_eq!(q.reserve_seq(), 1);
        assert_eq!(q.schedule(1, vec![], ()), 2);
        assert_eq!(q.len(), 2);
    }
}
