//! Bounded outbound queue.
//!
//! A mutex-guarded FIFO with a capacity limit. Besides the items the lock
//! also guards the writer's *armed* flag, so deciding "a writer must be
//! started" and "the writer may go idle" are serialized with every add and
//! with [`SendQueue::close`].

use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Default capacity of a session's outbound queue.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1024;

/// Errors returned by queue insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue no longer accepts items.
    #[error("queue closed")]
    Closed,
    /// The queue is at capacity.
    #[error("queue full")]
    Full,
    /// No space freed up before the deadline.
    #[error("timed out waiting for queue space")]
    Timeout,
}

/// Outcome of a successful add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The writer was idle and is now armed; the caller must start it.
    Armed,
    /// A writer is already armed and will pick the item up.
    Queued,
}

/// Snapshot taken by [`SendQueue::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    /// False when the queue had already been closed.
    pub closed_now: bool,
    /// Items still queued.
    pub remaining: usize,
    /// Whether a writer is armed.
    pub armed: bool,
}

/// Result of [`SendQueue::try_disarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disarm {
    /// Items arrived meanwhile; the writer stays armed.
    Busy,
    /// The writer is now idle. `closed` reports whether the queue is closed.
    Idle {
        /// Queue closed flag at the moment of disarming.
        closed: bool,
    },
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
    armed: bool,
}

/// Thread-safe bounded FIFO feeding a single writer.
pub struct SendQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
}

impl<T> SendQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                closed: false,
                armed: false,
            }),
            not_full: Condvar::new(),
        }
    }

    /// Changes the capacity. Items already queued are kept.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        self.not_full.notify_all();
    }

    /// Non-blocking add.
    ///
    /// `on_arm` runs under the queue lock when this add arms the writer; the
    /// session uses it to account the writer as in-flight before a concurrent
    /// `close` can observe the queue state.
    pub fn add(&self, item: T, on_arm: impl FnOnce()) -> Result<Admission, QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.items.len() >= inner.capacity {
            return Err(QueueError::Full);
        }
        Ok(Self::push(&mut inner, item, on_arm))
    }

    /// Add that waits for free space.
    ///
    /// `timeout` of `None` waits until space frees up or the queue closes.
    pub fn add_blocking(
        &self,
        item: T,
        timeout: Option<Duration>,
        on_arm: impl FnOnce(),
    ) -> Result<Admission, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.items.len() < inner.capacity {
                return Ok(Self::push(&mut inner, item, on_arm));
            }
            match deadline {
                Some(deadline) => {
                    if self.not_full.wait_until(&mut inner, deadline).timed_out()
                        && inner.items.len() >= inner.capacity
                        && !inner.closed
                    {
                        return Err(QueueError::Timeout);
                    }
                }
                None => self.not_full.wait(&mut inner),
            }
        }
    }

    fn push(inner: &mut Inner<T>, item: T, on_arm: impl FnOnce()) -> Admission {
        inner.items.push_back(item);
        if inner.armed {
            Admission::Queued
        } else {
            inner.armed = true;
            on_arm();
            Admission::Armed
        }
    }

    /// Moves up to `max` items into `out` and reports whether the queue is
    /// closed.
    pub fn drain(&self, out: &mut VecDeque<T>, max: usize) -> bool {
        let mut inner = self.inner.lock();
        let n = inner.items.len().min(max.max(1));
        out.extend(inner.items.drain(..n));
        if n > 0 {
            self.not_full.notify_all();
        }
        inner.closed
    }

    /// Disarms the writer if, and only if, the queue is empty.
    pub fn try_disarm(&self) -> Disarm {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            inner.armed = false;
            Disarm::Idle {
                closed: inner.closed,
            }
        } else {
            Disarm::Busy
        }
    }

    /// Disarms the writer unconditionally and discards whatever is queued.
    pub fn abandon(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.armed = false;
        let dropped = inner.items.len();
        inner.items.clear();
        self.not_full.notify_all();
        dropped
    }

    /// Stops all future adds and wakes blocked senders.
    pub fn close(&self) -> CloseOutcome {
        let mut inner = self.inner.lock();
        let closed_now = !inner.closed;
        inner.closed = true;
        self.not_full.notify_all();
        CloseOutcome {
            closed_now,
            remaining: inner.items.len(),
            armed: inner.armed,
        }
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Returns true once [`close`](SendQueue::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn first_add_arms_once() {
        let q = SendQueue::new(4);
        let mut arms = 0;
        assert_eq!(q.add(1, || arms += 1), Ok(Admission::Armed));
        assert_eq!(q.add(2, || arms += 1), Ok(Admission::Queued));
        assert_eq!(arms, 1);

        let mut out = VecDeque::new();
        assert!(!q.drain(&mut out, 8));
        assert_eq!(out, [1, 2]);
        assert_eq!(q.try_disarm(), Disarm::Idle { closed: false });
        assert_eq!(q.add(3, || arms += 1), Ok(Admission::Armed));
        assert_eq!(arms, 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let q = SendQueue::new(2);
        q.add(1, || {}).unwrap();
        q.add(2, || {}).unwrap();
        assert_eq!(q.add(3, || {}), Err(QueueError::Full));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn blocking_add_times_out_after_deadline() {
        let q = SendQueue::new(1);
        q.add(1, || {}).unwrap();
        let start = Instant::now();
        let res = q.add_blocking(2, Some(Duration::from_millis(50)), || {});
        assert_eq!(res, Err(QueueError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocking_add_wakes_on_drain() {
        let q = Arc::new(SendQueue::new(1));
        q.add(1, || {}).unwrap();
        let q2 = Arc::clone(&q);
        let h = thread::spawn(move || q2.add_blocking(2, Some(Duration::from_secs(5)), || {}));
        thread::sleep(Duration::from_millis(20));
        let mut out = VecDeque::new();
        q.drain(&mut out, 1);
        assert_eq!(h.join().unwrap(), Ok(Admission::Queued));
    }

    #[test]
    fn blocking_add_fails_on_close() {
        let q = Arc::new(SendQueue::new(1));
        q.add(1, || {}).unwrap();
        let q2 = Arc::clone(&q);
        let h = thread::spawn(move || q2.add_blocking(2, None, || {}));
        thread::sleep(Duration::from_millis(20));
        let outcome = q.close();
        assert!(outcome.closed_now);
        assert_eq!(outcome.remaining, 1);
        assert!(outcome.armed);
        assert_eq!(h.join().unwrap(), Err(QueueError::Closed));
    }

    #[test]
    fn disarm_refused_while_items_remain() {
        let q = SendQueue::new(4);
        q.add(1, || {}).unwrap();
        assert_eq!(q.try_disarm(), Disarm::Busy);
        assert!(!q.is_closed());
        q.close();
        assert!(q.is_closed());
        assert!(!q.close().closed_now);
        let mut out = VecDeque::new();
        assert!(!q.is_empty());
        assert!(q.drain(&mut out, 8));
        assert!(q.is_empty());
        assert_eq!(q.try_disarm(), Disarm::Idle { closed: true });
    }
}
