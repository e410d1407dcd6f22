//! Event subscription
//!
//! Components publish immutable snapshots to any number of subscribers.
//! Each subscriber owns an unbounded channel; a subscriber whose receiver
//! has been dropped is pruned on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscriber registry for one event type
pub struct Subscribers<E> {
    next_id: AtomicU64,
    senders: DashMap<SubscriptionId, Sender<E>>,
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            senders: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionId, Receiver<E>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded();
        self.senders.insert(id, tx);
        (id, rx)
    }

    /// Returns false if the id was not (or no longer) subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.senders.remove(&id).is_some()
    }

    pub fn publish(&self, event: E) {
        let mut dead = Vec::new();
        for entry in self.senders.iter() {
            if entry.value().send(event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.senders.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl<E: Clone> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}
