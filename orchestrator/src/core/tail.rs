//! Bounded, order-preserving line buffer.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Keeps the most recent `capacity` items; the oldest are evicted first.
///
/// Pushing never blocks and never fails, so a reader draining a child's pipe
/// is never held up by slow pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
    evicted: u64,
}

impl<T: Clone> TailBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
            evicted: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
            self.evicted += 1;
        }
        self.items.push_back(item);
    }

    /// Last `n` items in emission order.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut buf = TailBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.tail(10), vec![2, 3, 4]);
        assert_eq!(buf.evicted(), 2);
    }

    #[test]
    fn tail_returns_most_recent_in_order() {
        let mut buf = TailBuffer::new(10);
        for line in ["a", "b", "c", "d"] {
            buf.push(line.to_string());
        }
        assert_eq!(buf.tail(2), vec!["c".to_string(), "d".to_string()]);
        assert_eq!(buf.last().map(String::as_str), Some("d"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut buf = TailBuffer::new(0);
        buf.push(1);
        buf.push(2);
        assert_eq!(buf.tail(5), vec![2]);
    }
}
