//! `Broadcaster`: fan-out of the encoder's live byte stream to every
//! currently-subscribed session, each behind its own bounded drop-oldest
//! queue so one slow subscriber cannot stall delivery to the others.
//!
//! Grounded on the teacher's `WsConnectionManager`/`ConnectionGuard` RAII
//! pattern (`api/ws_connection.rs`): subscribers are id-indexed, and the
//! returned `Subscription` unregisters itself on `Drop` so a panicking or
//! early-returning session handler can never leak a subscriber entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::queue::{DropOldestQueue, DEFAULT_CAPACITY};

/// Unique id assigned to each subscriber for its lifetime.
pub type SubscriberId = u64;

/// Maintains the set of live subscribers and fans incoming chunks out to
/// each one's bounded queue.
pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, Arc<DropOldestQueue<Bytes>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// Creates an empty broadcaster.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new subscriber with the given queue capacity and returns
    /// a `Subscription` handle. Dropping the handle unsubscribes.
    pub fn subscribe(self: &Arc<Self>, queue_capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(DropOldestQueue::new(queue_capacity));
        self.subscribers.insert(id, queue.clone());
        Subscription {
            id,
            queue,
            broadcaster: self.clone(),
        }
    }

    /// Removes a subscriber by id and closes its queue. Idempotent.
    fn unsubscribe(&self, id: SubscriberId) {
        if let Some((_, queue)) = self.subscribers.remove(&id) {
            queue.close();
        }
    }

    /// Delivers `chunk` to every current subscriber's queue. Snapshots the
    /// subscriber set, then dispatches outside any lock so the broadcast
    /// source is never blocked by a subscriber's internal state; a
    /// misbehaving subscriber's queue push cannot affect any other
    /// subscriber's delivery.
    pub fn broadcast(&self, chunk: Bytes) {
        let targets: Vec<Arc<DropOldestQueue<Bytes>>> = self
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for queue in targets {
            queue.push(chunk.clone());
        }
    }

    /// Current number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for one subscription. The subscriber's queue is reachable
/// via `queue()`; dropping the handle removes the entry from the
/// broadcaster and closes the queue, waking any pending `pop()`.
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<DropOldestQueue<Bytes>>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    /// This subscription's id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The bounded, drop-oldest queue chunks are delivered into.
    #[must_use]
    pub fn queue(&self) -> &Arc<DropOldestQueue<Bytes>> {
        &self.queue
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}
