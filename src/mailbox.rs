//! Bounded hand-off between execution units.
//!
//! A `Mailbox` never grows past its capacity. When full, `post` waits up to
//! a caller-chosen bound for room and then displaces the oldest item, which
//! is returned so the caller can report it. Capacity 1 gives "latest value
//! wins" semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    Item(T),
    Empty,
    Closed,
}

struct Slots<T> {
    queue: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    capacity: usize,
    slots: Mutex<Slots<T>>,
    changed: Condvar,
}

pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                slots: Mutex::new(Slots {
                    queue: VecDeque::with_capacity(capacity.max(1)),
                    closed: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn latest() -> Self {
        Self::new(1)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Posts `item`, waiting at most `wait` for room. Returns whichever item
    /// had to be discarded to make room (the oldest queued one), or the item
    /// itself when the mailbox is closed.
    pub fn post(&self, item: T, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if slots.closed {
                return Some(item);
            }
            if slots.queue.len() < self.inner.capacity {
                slots.queue.push_back(item);
                self.inner.changed.notify_all();
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            slots = self
                .inner
                .changed
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let displaced = slots.queue.pop_front();
        slots.queue.push_back(item);
        self.inner.changed.notify_all();
        displaced
    }

    /// Waits up to `timeout` for an item. Items queued before `close` are
    /// still handed out; `Closed` is returned only once the queue is empty.
    pub fn take(&self, timeout: Duration) -> Take<T> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = slots.queue.pop_front() {
                self.inner.changed.notify_all();
                return Take::Item(item);
            }
            if slots.closed {
                return Take::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Take::Empty;
            }
            slots = self
                .inner
                .changed
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Waits up to `timeout` until every queued item has been taken.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if slots.queue.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slots = self
                .inner
                .changed
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn close(&self) {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.closed = true;
        self.inner.changed.notify_all();
    }

    /// Removes and returns everything still queued.
    pub fn drain(&self) -> Vec<T> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let items = slots.queue.drain(..).collect();
        self.inner.changed.notify_all();
        items
    }

    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_mailbox_keeps_newest() {
        let mb = Mailbox::latest();
        assert_eq!(mb.post(1, Duration::ZERO), None);
        assert_eq!(mb.post(2, Duration::ZERO), Some(1));
        assert_eq!(mb.post(3, Duration::ZERO), Some(2));
        assert_eq!(mb.take(Duration::ZERO), Take::Item(3));
        assert_eq!(mb.take(Duration::ZERO), Take::Empty);
    }

    #[test]
    fn queue_displaces_oldest_after_wait() {
        let mb = Mailbox::new(2);
        mb.post("a", Duration::ZERO);
        mb.post("b", Duration::ZERO);
        let started = Instant::now();
        assert_eq!(mb.post("c", Duration::from_millis(30)), Some("a"));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(mb.drain(), vec!["b", "c"]);
    }

    #[test]
    fn post_waits_for_consumer() {
        let mb = Mailbox::new(1);
        mb.post(1, Duration::ZERO);
        let consumer = mb.clone();
        let join = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            consumer.take(Duration::from_secs(1))
        });
        assert_eq!(mb.post(2, Duration::from_secs(2)), None);
        assert_eq!(join.join().unwrap(), Take::Item(1));
        assert_eq!(mb.take(Duration::ZERO), Take::Item(2));
    }

    #[test]
    fn close_hands_out_remaining_items_first() {
        let mb = Mailbox::new(4);
        mb.post(7, Duration::ZERO);
        mb.close();
        assert_eq!(mb.post(8, Duration::ZERO), Some(8));
        assert_eq!(mb.take(Duration::ZERO), Take::Item(7));
        assert_eq!(mb.take(Duration::from_secs(1)), Take::Closed);
    }

    #[test]
    fn take_wakes_on_post() {
        let mb = Mailbox::latest();
        let producer = mb.clone();
        let join = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.post(42, Duration::ZERO);
        });
        assert_eq!(mb.take(Duration::from_secs(2)), Take::Item(42));
        join.join().unwrap();
    }
}
