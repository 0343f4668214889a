use std::collections::VecDeque;
use std::sync::RwLock;

/// Bounded in-memory ring with oldest-first eviction.
///
/// Backs the traffic and log stores; lifetime is the process.
pub struct RingBuffer<T> {
    entries: RwLock<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Push a new entry. Evicts the oldest if at capacity.
    pub fn push(&self, entry: T) {
        if let Ok(mut entries) = self.entries.write() {
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Newest-first view, at most `limit` entries starting at `offset`.
    pub fn recent(&self, limit: usize, offset: usize) -> Vec<T> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest-first view of entries passing `pred`.
    pub fn recent_filtered(&self, limit: usize, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .rev()
            .filter(|e| pred(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_eviction_oldest_first() {
        let ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        // Newest first; 0 and 1 were evicted.
        assert_eq!(ring.recent(10, 0), vec![4, 3, 2]);
    }

    #[test]
    fn test_offset_and_limit() {
        let ring = RingBuffer::new(10);
        for i in 0..10 {
            ring.push(i);
        }
        assert_eq!(ring.recent(3, 0), vec![9, 8, 7]);
        assert_eq!(ring.recent(3, 2), vec![7, 6, 5]);
    }

    #[test]
    fn test_clear() {
        let ring = RingBuffer::new(4);
        ring.push(1);
        ring.clear();
        assert!(ring.is_empty());
    }
}
