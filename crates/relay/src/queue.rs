//! Per-download FIFO of chunks.
//!
//! A [`ChunkQueue`] has exactly one consumer (the download's send loop)
//! and is fed by the upload's fan-out. Closing the queue is the
//! end-of-stream signal: the consumer drains what is left and then sees
//! `None`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Error returned when an item cannot be queued. Hands the item back.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PushError<T> {
    #[error("queue closed")]
    Closed(T),

    #[error("queue full")]
    Full(T),
}

impl<T> PushError<T> {
    /// Returns the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) | Self::Full(item) => item,
        }
    }
}

/// Thread-safe FIFO whose `pop` suspends the calling task, not its thread.
///
/// Unbounded by default. A bounded queue rejects [`push`](Self::push) when
/// full and makes [`push_wait`](Self::push_wait) wait for the consumer.
pub struct ChunkQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: Option<usize>,
    readable: Notify,
    writable: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Default for ChunkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChunkQueue<T> {
    /// Creates an unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "ChunkQueue capacity must be > 0");
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Appends `item` without waiting.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if self.capacity.is_some_and(|cap| state.items.len() >= cap) {
                return Err(PushError::Full(item));
            }
            state.items.push_back(item);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Appends `item`, waiting for space if the queue is bounded and full.
    ///
    /// Fails only if the queue is (or becomes) closed.
    pub async fn push_wait(&self, mut item: T) -> Result<(), PushError<T>> {
        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            // Register before checking so a pop between the check and the
            // await is not missed.
            writable.as_mut().enable();

            match self.push(item) {
                Err(PushError::Full(rejected)) => item = rejected,
                other => return other,
            }

            writable.await;
        }
    }

    /// Appends a batch regardless of capacity. Returns how many were queued
    /// (zero if the queue is closed).
    pub fn preload<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let queued = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let before = state.items.len();
            state.items.extend(items);
            state.items.len() - before
        };
        if queued > 0 {
            self.readable.notify_one();
        }
        queued
    }

    /// Removes the head item, suspending until one is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let readable = self.readable.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    if self.capacity.is_some() {
                        self.writable.notify_waiters();
                    }
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Marks the end of the stream. Idempotent.
    ///
    /// Items already queued are still delivered; later pushes fail.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Maximum number of items, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let q = ChunkQueue::new();
        for i in 0..5 {
            q.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.pop().await, Some(i));
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(ChunkQueue::new());
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        q.push("chunk").unwrap();
        assert_eq!(consumer.await.unwrap(), Some("chunk"));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = ChunkQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.close();

        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, None);
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let q = Arc::new(ChunkQueue::<u8>::new());
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test]
    fn push_after_close_returns_item() {
        let q = ChunkQueue::new();
        q.close();
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.push(7), Err(PushError::Closed(7)));
    }

    #[test]
    fn bounded_rejects_when_full() {
        let q = ChunkQueue::bounded(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        let err = q.push(3).unwrap_err();
        assert_eq!(err, PushError::Full(3));
        assert_eq!(err.into_inner(), 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.capacity(), Some(2));
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn bounded_zero_panics() {
        let _q = ChunkQueue::<u8>::bounded(0);
    }

    #[tokio::test]
    async fn push_wait_resumes_after_pop() {
        let q = Arc::new(ChunkQueue::bounded(1));
        q.push(1).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push_wait(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(q.pop().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn close_releases_blocked_producer() {
        let q = Arc::new(ChunkQueue::bounded(1));
        q.push(1).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push_wait(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();

        assert_eq!(producer.await.unwrap(), Err(PushError::Closed(2)));
    }

    #[tokio::test]
    async fn preload_ignores_capacity() {
        let q = ChunkQueue::bounded(2);
        assert_eq!(q.preload(0..5), 5);
        assert_eq!(q.len(), 5);
        assert!(matches!(q.push(9), Err(PushError::Full(9))));
        for i in 0..5 {
            assert_eq!(q.pop().await, Some(i));
        }
        q.close();
        assert_eq!(q.preload(0..3), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_are_serialized() {
        let q = Arc::new(ChunkQueue::new());
        let mut producers = Vec::new();
        for p in 0..4u32 {
            let q = Arc::clone(&q);
            producers.push(tokio::spawn(async move {
                for i in 0..250u32 {
                    q.push((p, i)).unwrap();
                }
            }));
        }
        for h in producers {
            h.await.unwrap();
        }
        q.close();

        let mut last = [None::<u32>; 4];
        let mut total = 0;
        while let Some((p, i)) = q.pop().await {
            let prev = last[p as usize].replace(i);
            assert!(prev.is_none_or(|prev| prev + 1 == i));
            total += 1;
        }
        assert_eq!(total, 1000);
    }
}
