//! A bounded, single/multi-producer multi-consumer-unsafe (single logical
//! consumer) queue with a drop-oldest overflow policy.
//!
//! Used both as the Broadcaster's per-subscriber queue and as a
//! `StreamSession`'s outbound queue, which is fed by more than one producer
//! (preroll slices and live broadcast chunks) but drained by exactly one
//! writer task, keeping each subscriber's backlog bounded and dropping the
//! oldest chunk first when a slow reader falls behind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;
/// Minimum configurable queue capacity.
pub const MIN_CAPACITY: usize = 2;
/// Maximum configurable queue capacity.
pub const MAX_CAPACITY: usize = 4096;

/// Clamps a requested capacity into the supported `[MIN_CAPACITY,
/// MAX_CAPACITY]` range.
#[must_use]
pub fn clamp_capacity(requested: usize) -> usize {
    requested.clamp(MIN_CAPACITY, MAX_CAPACITY)
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A bounded queue that drops the oldest entry on overflow instead of
/// blocking the producer, so a slow consumer cannot stall the broadcast
/// source.
pub struct DropOldestQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    /// Creates a new queue with the given capacity (clamped to the
    /// supported range).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: clamp_capacity(capacity),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes an item, dropping the oldest buffered item first if the queue
    /// is at capacity. A no-op once the queue has been closed.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for and removes the oldest item. Returns `None` once the queue
    /// has been closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks the queue closed; current and future `pop()` calls drain
    /// remaining items then return `None`, and further `push()` calls are
    /// ignored.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Number of items dropped so far due to overflow.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue currently holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
