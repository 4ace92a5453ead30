use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use super::Semaphore;
use crate::error::Result;

/// Bounded FIFO queue built from two semaphores.
///
/// `slots` starts at capacity and gates producers; `filled` starts at zero
/// and gates consumers. A unit of `filled` is only released after its item
/// is queued, so `get` always finds an item once `filled.down` returns.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    filled: Semaphore,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be a positive integer");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            filled: Semaphore::new(0),
            capacity,
        }
    }

    /// Append `item`, waiting at most `timeout` for a free slot.
    /// On timeout the item is dropped and the queue is unchanged.
    pub async fn put(&self, item: T, timeout: Option<Duration>) -> Result<()> {
        self.slots.down(timeout).await?;
        self.items.lock().push_back(item);
        self.filled.up();
        Ok(())
    }

    /// Remove the front item, waiting at most `timeout` for one to arrive.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T> {
        self.filled.down(timeout).await?;
        let item = self
            .items
            .lock()
            .pop_front()
            .expect("filled unit without a queued item");
        self.slots.up();
        Ok(item)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Single-slot handoff: one `put`, one `get`, then discarded.
pub struct RendezvousChannel<T> {
    slot: BoundedQueue<T>,
}

impl<T> RendezvousChannel<T> {
    pub fn new() -> Self {
        Self { slot: BoundedQueue::new(1) }
    }

    pub async fn put(&self, value: T, timeout: Option<Duration>) -> Result<()> {
        self.slot.put(value, timeout).await
    }

    pub async fn get(&self, timeout: Option<Duration>) -> Result<T> {
        self.slot.get(timeout).await
    }
}

impl<T> Default for RendezvousChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            q.put(i, None).await.unwrap();
        }
        assert_eq!(q.len(), 4);
        for i in 0..4 {
            assert_eq!(q.get(None).await.unwrap(), i);
        }
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn put_times_out_when_full() {
        let q = BoundedQueue::new(1);
        q.put("a", None).await.unwrap();
        let err = q.put("b", Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(None).await.unwrap(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn get_times_out_when_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(3);
        let err = q.get(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(err.is_timeout());
        // The abandoned wait must not swallow a later item.
        q.put(7, None).await.unwrap();
        assert_eq!(q.get(Some(Duration::from_millis(10))).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_never_exceed_capacity() {
        const CAPACITY: usize = 3;
        const PER_PRODUCER: usize = 200;

        let q = Arc::new(BoundedQueue::new(CAPACITY));
        let mut producers = Vec::new();
        for p in 0..4usize {
            let q = q.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    q.put((p, i), None).await.unwrap();
                }
            }));
        }

        let mut last_seen = [None::<usize>; 4];
        for _ in 0..4 * PER_PRODUCER {
            assert!(q.len() <= CAPACITY);
            let (p, i) = q.get(None).await.unwrap();
            // Each producer's items come out in the order it put them.
            if let Some(prev) = last_seen[p] {
                assert!(i > prev);
            }
            last_seen[p] = Some(i);
        }
        for h in producers {
            h.await.unwrap();
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rendezvous_hands_over_one_value() {
        let ch = Arc::new(RendezvousChannel::new());
        let tx = ch.clone();
        tokio::spawn(async move {
            tx.put("reply", None).await.unwrap();
        });
        assert_eq!(ch.get(None).await.unwrap(), "reply");
    }
}
