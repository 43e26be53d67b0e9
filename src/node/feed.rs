//! Change feed
//!
//! Fans canonical-chain changes out to any number of subscribers. Each
//! subscriber has its own unbounded queue and lock, so a slow consumer
//! never holds up publishing or other consumers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use crate::crypto::Hash;

/// Direction of a canonical-chain change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainOp {
    Add,
    Remove,
}

/// One change to the canonical chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub op: ChainOp,
    pub hash: Hash,
    /// Block index the change applies to
    pub index: u64,
}

impl ChainEvent {
    pub fn add(hash: Hash, index: u64) -> Self {
        Self {
            op: ChainOp::Add,
            hash,
            index,
        }
    }

    pub fn remove(hash: Hash, index: u64) -> Self {
        Self {
            op: ChainOp::Remove,
            hash,
            index,
        }
    }

    /// True if `self` directly undoes `earlier`
    fn cancels(&self, earlier: &ChainEvent) -> bool {
        self.op == ChainOp::Add
            && earlier.op == ChainOp::Remove
            && self.hash == earlier.hash
            && self.index == earlier.index
    }
}

#[derive(Debug, Default)]
struct SubscriberQueue {
    events: Mutex<VecDeque<ChainEvent>>,
    notify: Notify,
}

impl SubscriberQueue {
    /// Append events, dropping an add that undoes the queued tail remove
    fn push_all(&self, ops: &[ChainEvent]) -> bool {
        let mut events = self.events.lock();
        for op in ops {
            match events.back() {
                Some(last) if op.cancels(last) => {
                    events.pop_back();
                }
                _ => events.push_back(*op),
            }
        }
        !events.is_empty()
    }
}

/// Fan-out of canonical-chain changes
#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. It only sees events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue::default());
        self.subscribers.lock().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    /// Append `ops`, in order, to every live subscriber's queue
    pub fn publish(&self, ops: &[ChainEvent]) {
        if ops.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                if queue.push_all(ops) {
                    queue.notify.notify_one();
                }
                true
            }
            None => false,
        });
    }

    /// Number of subscribers still alive
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Receiving end of a feed subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next event
    pub async fn get(&self) -> ChainEvent {
        loop {
            if let Some(event) = self.try_get() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next event, if one is queued
    pub fn try_get(&self) -> Option<ChainEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<ChainEvent> {
        self.queue.events.lock().drain(..).collect()
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.queue.events.lock().len()
    }
}
