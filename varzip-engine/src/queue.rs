//! Registering MPMC queue.
//!
//! The queue tracks its producer count: consumers block while the queue is
//! empty but producers remain, and drain cleanly once the last producer has
//! signed off. [`RegisteringQueue::pop_with_hint`] prefers an element the
//! caller is ready for (a package whose part id is next for its stream),
//! falling back to the front so progress is always possible.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    n_producers: usize,
}

/// MPMC queue with producer registration.
#[derive(Debug)]
pub struct RegisteringQueue<T> {
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
}

impl<T> RegisteringQueue<T> {
    /// Create a queue expecting `n_producers` completion signals.
    pub fn new(n_producers: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                n_producers,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueue an element.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        let was_empty = inner.items.is_empty();
        inner.items.push_back(item);
        if was_empty {
            self.cv.notify_all();
        }
    }

    /// Sign off one producer; when the last one leaves, blocked consumers
    /// drain and return `None`.
    pub fn mark_completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.n_producers = inner.n_producers.saturating_sub(1);
        if inner.n_producers == 0 {
            self.cv.notify_all();
        }
    }

    /// Dequeue the front element; `None` once the queue is drained and all
    /// producers have completed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                if inner.items.is_empty() {
                    self.cv.notify_all();
                }
                return Some(item);
            }
            if inner.n_producers == 0 {
                return None;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Dequeue the first element satisfying `ready`, or the front element
    /// when none does.
    pub fn pop_with_hint(&self, ready: impl Fn(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.items.is_empty() {
                let idx = inner.items.iter().position(&ready).unwrap_or(0);
                let item = inner.items.remove(idx);
                if inner.items.is_empty() {
                    self.cv.notify_all();
                }
                return item;
            }
            if inner.n_producers == 0 {
                return None;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Current number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// True when no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_and_completion() {
        let q = RegisteringQueue::new(1);
        q.push(1);
        q.push(2);
        q.mark_completed();

        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_hint_prefers_ready() {
        let q = RegisteringQueue::new(1);
        q.push(10);
        q.push(5);
        q.push(7);

        assert_eq!(q.pop_with_hint(|&x| x < 8), Some(5));
        // Nothing matches: fall back to the front.
        assert_eq!(q.pop_with_hint(|&x| x > 100), Some(10));
        q.mark_completed();
        assert_eq!(q.pop_with_hint(|&x| x < 8), Some(7));
        assert_eq!(q.pop_with_hint(|_| true), None);
    }

    #[test]
    fn test_cross_thread_drain() {
        let q = Arc::new(RegisteringQueue::new(1));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(x) = q.pop() {
                    got.push(x);
                }
                got
            })
        };

        for i in 0..100 {
            q.push(i);
        }
        q.mark_completed();

        let got = consumer.join().unwrap();
        assert_eq!(got.len(), 100);
    }
}
