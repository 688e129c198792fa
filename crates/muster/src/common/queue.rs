use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Bounded multi-producer multi-consumer queue.
///
/// Producers never block: a full queue rejects the push and the caller is
/// expected to back off (the task scheduler stops dequeuing gangs until the
/// placement engine drains us). Consumers wait with a deadline.
pub struct WaitQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> WaitQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Push an item; returns it back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.ready.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Pop one item, waiting until `deadline` if the queue is empty.
    pub async fn pop(&self, deadline: Instant) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.try_pop() {
                // Wake the next waiter in case more items are queued.
                self.ready.notify_one();
                return Some(item);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline.into()) => return self.try_pop(),
            }
        }
    }

    /// Pop up to `limit` items. Waits up to `timeout` for the first item,
    /// then drains whatever else is immediately available.
    pub async fn pop_batch(&self, limit: usize, timeout: Duration) -> Vec<T> {
        let mut batch = Vec::new();
        if limit == 0 {
            return batch;
        }
        let deadline = Instant::now() + timeout;
        match self.pop(deadline).await {
            Some(item) => batch.push(item),
            None => return batch,
        }
        while batch.len() < limit {
            match self.try_pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }
}
