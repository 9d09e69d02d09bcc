//! Bounded multi-producer multi-consumer work queue
//!
//! Producers block while the queue is full; consumers poll with a timeout so
//! idle workers can count toward retirement without serializing behind each
//! other.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Semaphore;

/// FIFO queue with a fixed capacity.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// Free slots; producers acquire one per push.
    space: Semaphore,
    /// Queued items; consumers acquire one per pop.
    ready: Semaphore,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Append an item, waiting for a free slot when the queue is full.
    pub async fn push(&self, item: T) {
        // The semaphore is never closed, so acquire cannot fail.
        if let Ok(permit) = self.space.acquire().await {
            permit.forget();
            self.items.lock().push_back(item);
            self.ready.add_permits(1);
        }
    }

    /// Pop the oldest item, waiting up to `timeout`; `None` on expiry.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let permit = tokio::time::timeout(timeout, self.ready.acquire())
            .await
            .ok()?
            .ok()?;
        permit.forget();
        let item = self.items.lock().pop_front();
        self.space.add_permits(1);
        item
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
