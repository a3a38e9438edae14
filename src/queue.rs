//! Bounded ring-buffer queue
//!
//! The one queueing primitive in the crate. Two overflow policies cover its
//! call sites: `push` overwrites the oldest entry and counts a discard
//! (per-peer downstream queues, inbound message queues), `try_push` rejects
//! when full (the gateway publication queue behind ACK/NAK/BAD signalling).

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    items: VecDeque<T>,
    discards: u64,
}

/// Bounded multi-producer queue with an async consumer
pub struct RingQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> RingQueue<T> {
    /// Create a queue holding at most `capacity` entries
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingQueue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                discards: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue, overwriting the oldest entry when full
    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock();
            if inner.items.len() == self.capacity {
                inner.items.pop_front();
                inner.discards += 1;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Enqueue only if there is room; the rejected item is handed back
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut inner = self.inner.lock();
            if inner.items.len() == self.capacity {
                return Err(item);
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Dequeue, suspending until an entry is available
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            let notified = self.notify.notified();
            // An entry may have landed between the failed pop and registration
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Clone of the oldest entry without removing it
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().items.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries lost to overwrite since creation
    pub fn discards(&self) -> u64 {
        self.inner.lock().discards
    }
}
