//! Bounded Work Queue: a thread-safe FIFO with blocking dequeue and a
//! terminal "drained" state, used identically by the load generator, the
//! proxy acceptor, and the cache daemon's receiver thread.
//!
//! Grounded on `exfiltrate_proxy/src/tcp.rs`'s `Arc<Mutex<Vec<Sender<...>>>>`
//! client registry, generalized to a full FIFO with a bounded-wait condvar
//! and a drain sentinel — the queue's drain semantics have no equivalent in
//! that single `mpsc` channel, so this part follows the original C
//! `steque_t` + `pthread_cond_t` pairing instead.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Consumers wait in this increment so they can periodically check for
/// liveness even though the timeout itself carries no correctness meaning.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Result of a blocking `pop`.
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    Item(T),
    /// The queue was closed and is now empty; no further items will arrive.
    Drained,
}

/// A strict FIFO queue shared between one producer (an acceptor or
/// receiver thread) and a pool of worker threads.
pub struct WorkQueue<T> {
    state: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            state: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueues an item. Never blocks; bounded only by caller policy.
    pub fn submit(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        self.not_empty.notify_all();
    }

    /// Signals that no further items will be submitted. Workers still
    /// blocked in `pop` drain whatever remains, then observe `Drained`.
    /// The proxy's acceptor never calls this — it runs until the process is
    /// torn down; the load generator calls it after its fixed request count
    /// has been enqueued.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
    }

    /// Blocks until an item is available or the queue is closed and empty.
    pub fn pop(&self) -> PopResult<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return PopResult::Item(item);
            }
            if state.closed {
                return PopResult::Drained;
            }
            let (guard, _timeout) = self
                .not_empty
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap();
            state = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order_preserved() {
        let q = WorkQueue::new();
        q.submit(1);
        q.submit(2);
        q.submit(3);
        assert_eq!(q.pop(), PopResult::Item(1));
        assert_eq!(q.pop(), PopResult::Item(2));
        assert_eq!(q.pop(), PopResult::Item(3));
    }

    #[test]
    fn pop_blocks_until_submit() {
        let q = Arc::new(WorkQueue::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop());
        std::thread::sleep(Duration::from_millis(50));
        q.submit(42);
        assert_eq!(handle.join().unwrap(), PopResult::Item(42));
    }

    #[test]
    fn drains_after_close() {
        let q: WorkQueue<i32> = WorkQueue::new();
        q.submit(1);
        q.close();
        assert_eq!(q.pop(), PopResult::Item(1));
        assert_eq!(q.pop(), PopResult::Drained);
    }

    #[test]
    fn close_wakes_blocked_waiters() {
        let q = Arc::new(WorkQueue::<i32>::new());
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop());
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(handle.join().unwrap(), PopResult::Drained);
    }
}
