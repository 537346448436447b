//! Fixed-capacity ring buffer.

use std::collections::VecDeque;

/// A bounded FIFO that evicts the oldest element on overflow.
///
/// Backs the per-server console history. Not internally synchronized; the
/// owner wraps it in the lock appropriate for its access pattern.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> Ring<T> {
    /// Creates a ring holding at most `capacity` elements. A capacity of
    /// zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an element, evicting the oldest when full.
    pub fn push(&mut self, value: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    /// Returns up to the last `n` elements, oldest first, as a stable copy.
    #[must_use]
    pub fn last(&self, n: usize) -> Vec<T> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).cloned().collect()
    }

    /// Current number of buffered elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops all buffered elements.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut ring = Ring::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.last(10), vec![2, 3, 4]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn last_returns_most_recent() {
        let mut ring = Ring::new(10);
        for i in 0..4 {
            ring.push(i);
        }
        assert_eq!(ring.last(2), vec![2, 3]);
    }
}
