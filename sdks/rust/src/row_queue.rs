//! Thread-safe FIFO used to hand rows from the I/O thread to a consumer.
//!
//! The producer side (`put`, `close`) runs on the completion thread, the
//! consumer side (`get`) on a caller thread. Both share one mutex and one
//! condition variable.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Outcome of [`RowQueue::get`]
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued<T> {
    /// The oldest buffered item
    Item(T),
    /// Nothing arrived within the timeout; the stream may still be live
    Empty,
    /// The queue was closed and every buffered item has been taken
    Closed,
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
    rejected: u64,
}

/// Unbounded FIFO with timed, close-aware draining
#[derive(Debug)]
pub struct RowQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
}

impl<T> Default for RowQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RowQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
                rejected: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item and wake the consumer.
    ///
    /// Returns `false` (and drops the item) once the queue is closed, so a
    /// consumer that already observed `Closed` is never revived.
    pub fn put(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            inner.rejected += 1;
            let rejected = inner.rejected;
            drop(inner);
            warn!(rejected, "row queue closed, dropping late row");
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// `Empty` only means "not yet"; callers decide whether to wait again.
    pub fn get(&self, timeout: Duration) -> Dequeued<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Dequeued::Item(item);
            }
            if inner.closed {
                return Dequeued::Closed;
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return match inner.items.pop_front() {
                    Some(item) => Dequeued::Item(item),
                    None if inner.closed => Dequeued::Closed,
                    None => Dequeued::Empty,
                };
            }
        }
    }

    /// Stop accepting items and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Drop every buffered item, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let discarded = inner.items.len();
        inner.items.clear();
        discarded
    }

    /// Number of buffered items
    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Items refused because they arrived after `close`
    pub fn rejected(&self) -> u64 {
        self.inner.lock().rejected
    }
}
