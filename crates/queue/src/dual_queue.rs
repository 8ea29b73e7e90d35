//! Blocking FIFO with a soft capacity.
//!
//! `put` waits while the queue holds `capacity` items; `add_unlimited` always
//! succeeds while the queue is running. Once shut down, inserts are ignored and
//! `take` returns `None` immediately.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::QueueError;

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

pub struct DualCapacityBlockingQueue<T> {
    name: String,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> DualCapacityBlockingQueue<T> {
    /// A capacity of zero is treated as one.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append `item`, blocking while the queue is at capacity.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        while !state.stopped && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.stopped {
            return Err(QueueError::Stopped(self.name.clone()));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append `item` regardless of capacity. Returns false (and drops the item)
    /// when the queue is shut down.
    pub fn add_unlimited(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Remove the head, blocking while empty. `None` means shut down.
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Non-blocking `take`.
    pub fn poll(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.stopped {
            return None;
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Drop queued items, refuse further inserts and wake every waiter.
    /// Returns the number of items discarded.
    pub fn shutdown(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.stopped = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        discarded
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn fifo_order() {
        let queue = DualCapacityBlockingQueue::new("q", 4);
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        assert!(queue.add_unlimited(3));
        assert_eq!(queue.take(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.take(), Some(3));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn add_unlimited_ignores_capacity() {
        let queue = DualCapacityBlockingQueue::new("q", 1);
        queue.put(0).unwrap();
        for i in 1..10 {
            assert!(queue.add_unlimited(i));
        }
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn each_take_releases_exactly_one_producer() {
        let queue = Arc::new(DualCapacityBlockingQueue::new("q", 1));
        queue.put(0).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (1..=2)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    queue.put(i).unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0, "both producers should block");

        queue.take().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);

        queue.take().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 2);

        for p in producers {
            p.join().unwrap();
        }
    }

    #[test]
    fn add_unlimited_on_stopped_queue_is_noop() {
        let queue = DualCapacityBlockingQueue::new("q", 2);
        queue.shutdown();
        assert!(!queue.add_unlimited(1));
        assert_eq!(queue.len(), 0);
        assert!(matches!(queue.put(2), Err(QueueError::Stopped(_))));
    }

    #[test]
    fn take_on_stopped_empty_queue_returns_none_immediately() {
        let queue: DualCapacityBlockingQueue<u32> = DualCapacityBlockingQueue::new("q", 2);
        queue.shutdown();
        let started = Instant::now();
        assert_eq!(queue.take(), None);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn shutdown_wakes_blocked_consumer_and_producer() {
        let queue = Arc::new(DualCapacityBlockingQueue::new("q", 1));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(30));
        queue.shutdown();
        assert_eq!(consumer.join().unwrap(), None::<u32>);

        let full = Arc::new(DualCapacityBlockingQueue::new("full", 1));
        full.put(1).unwrap();
        let producer = {
            let full = Arc::clone(&full);
            thread::spawn(move || full.put(2))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(full.shutdown(), 1);
        assert!(producer.join().unwrap().is_err());
    }
}
