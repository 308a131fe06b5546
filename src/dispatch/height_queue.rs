//! C1: Bounded FIFO queue of pending block heights.
//!
//! A plain, synchronous, mutex-guarded `VecDeque`. Every operation in §4.1
//! completes without waiting, so there is no need for async
//! primitives here - only the dispatcher's fetch loop suspends, and it does
//! so on I/O, not on this queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{IndexerError, Result};

/// FIFO queue of pending heights, capacity-bounded at construction
/// (`batch_size * 3`, per §6).
pub struct HeightQueue {
    inner: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl HeightQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }

    /// Append one height. Admitting more than `free_space()` is a
    /// programmer error per §4.1 - the caller is expected to check
    /// `free_space()` first.
    pub fn put(&self, height: u64) -> Result<()> {
        self.put_many(&[height])
    }

    /// Append many heights. Fails if `heights.len() > free_space()`.
    pub fn put_many(&self, heights: &[u64]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if heights.len() > self.capacity.saturating_sub(guard.len()) {
            return Err(IndexerError::programmer(format!(
                "put_many({} heights) exceeds free space {} (capacity {})",
                heights.len(),
                self.capacity.saturating_sub(guard.len()),
                self.capacity
            )));
        }
        guard.extend(heights.iter().copied());
        Ok(())
    }

    /// Remove and return the head, if any.
    pub fn take(&self) -> Option<u64> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Remove and return up to `n` items from the head, without waiting.
    pub fn take_many(&self, n: usize) -> Vec<u64> {
        let mut guard = self.inner.lock().unwrap();
        let take = n.min(guard.len());
        guard.drain(..take).collect()
    }

    /// Return the head without removing it.
    pub fn peek(&self) -> Option<u64> {
        self.inner.lock().unwrap().front().copied()
    }

    /// Empty the queue. Does not notify any waiters (there are none by
    /// contract - every operation here is non-blocking).
    pub fn flush(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q = HeightQueue::new(10);
        q.put_many(&[1, 2, 3]).unwrap();
        assert_eq!(q.take_many(2), vec![1, 2]);
        assert_eq!(q.take(), Some(3));
        assert_eq!(q.take(), None);
    }

    #[test]
    fn take_many_never_waits_and_caps_at_size() {
        let q = HeightQueue::new(10);
        q.put_many(&[1, 2]).unwrap();
        assert_eq!(q.take_many(100), vec![1, 2]);
    }

    #[test]
    fn put_many_over_capacity_is_a_programmer_error() {
        let q = HeightQueue::new(2);
        assert!(q.put_many(&[1, 2, 3]).is_err());
        // Nothing was admitted on failure.
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn flush_empties_queue() {
        let q = HeightQueue::new(10);
        q.put_many(&[1, 2, 3]).unwrap();
        q.flush();
        assert_eq!(q.size(), 0);
        assert_eq!(q.free_space(), 10);
    }

    #[test]
    fn peek_does_not_remove() {
        let q = HeightQueue::new(10);
        q.put(5).unwrap();
        assert_eq!(q.peek(), Some(5));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn free_space_tracks_capacity_minus_size() {
        let q = HeightQueue::new(4);
        q.put_many(&[1, 2]).unwrap();
        assert_eq!(q.free_space(), 2);
    }
}
