//! Bounded blocking FIFO with drop-oldest backpressure

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Thread-safe queue shared between one producer and one consumer.
///
/// `push` never blocks: when the queue is full the oldest entry is discarded
/// first. `pop` blocks until an item arrives or the queue is cleared/closed.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<State<T>>,
    available: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Bumped by `clear` so blocked consumers notice the discontinuity.
    generation: u64,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            name,
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                generation: 0,
            }),
            available: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: insert at the back, evicting the oldest entry when full.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("queue_dropped_total", "queue" => self.name).increment(1);
            trace!(queue = self.name, "Queue full, dropped oldest entry");
        }
        state.items.push_back(item);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        drop(state);

        self.available.notify_one();
    }

    /// Consumer: wait for the oldest item.
    ///
    /// Returns `None` if the queue is cleared or closed while waiting, or is
    /// already closed and empty.
    pub fn pop(&self) -> Option<T> {
        self.pop_tagged().map(|(item, _)| item)
    }

    /// Like `pop`, also returning the generation the item was queued in.
    pub fn pop_tagged(&self) -> Option<(T, u64)> {
        let mut state = self.state.lock();
        let generation = state.generation;
        loop {
            if let Some(item) = state.items.pop_front() {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                return Some((item, state.generation));
            }
            if state.closed || state.generation != generation {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like `pop`, but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let generation = state.generation;
        loop {
            if let Some(item) = state.items.pop_front() {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if state.closed || state.generation != generation {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Non-blocking pop for polling consumers.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Empty the queue and wake every blocked consumer.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let discarded = state.items.len();
        state.items.clear();
        state.generation = state.generation.wrapping_add(1);
        drop(state);

        self.available.notify_all();
        trace!(queue = self.name, discarded, "Queue cleared");
    }

    /// Clear and refuse to block from now on. Pushes are still accepted so a
    /// late producer never fails; `reopen` restores blocking behaviour.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.closed = true;
        state.generation = state.generation.wrapping_add(1);
        drop(state);

        self.available.notify_all();
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Changes on every `clear` or `close`.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
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

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.len();
        write!(
            f,
            "Queue[{}: Size:{}/{}, Empty:{}]",
            self.name,
            len,
            self.capacity,
            if len == 0 { "Yes" } else { "No" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn size_never_exceeds_capacity() {
        let queue = BoundedQueue::new("test", 4);
        for i in 0..20 {
            queue.push(i);
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.stats().dropped, 16);
    }

    #[test]
    fn overflow_drops_oldest() {
        let capacity = 5;
        let queue = BoundedQueue::new("test", capacity);
        for i in 1..=capacity + 1 {
            queue.push(i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, (2..=capacity + 1).collect::<Vec<_>>());
    }

    #[test]
    fn pop_returns_immediately_when_non_empty() {
        let queue = BoundedQueue::new("test", 2);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(BoundedQueue::new("test", 2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        queue.push(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn clear_unblocks_waiting_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new("test", 2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.clear();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn popped_items_carry_their_generation() {
        let queue = BoundedQueue::new("test", 4);
        queue.push(1u32);
        assert_eq!(queue.pop_tagged(), Some((1, 0)));

        queue.clear();
        queue.push(2);
        assert_eq!(queue.pop_tagged(), Some((2, 1)));
        assert_eq!(queue.generation(), 1);
    }

    #[test]
    fn close_unblocks_and_stays_non_blocking() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new("test", 2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(queue.pop(), None);

        queue.reopen();
        queue.push(3);
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn pop_timeout_expires_on_empty_queue() {
        let queue: BoundedQueue<u8> = BoundedQueue::new("test", 1);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn debug_reports_fill_level() {
        let queue = BoundedQueue::new("display", 50);
        queue.push(1);
        assert_eq!(format!("{queue:?}"), "Queue[display: Size:1/50, Empty:No]");
    }
}
