//! # Subscriber Fan-Out
//!
//! Each push-channel client gets a bounded outbox. Broadcasting never blocks
//! a producer: when an outbox overflows, its buffered deltas are discarded
//! and the subscriber is handed a fresh full-status snapshot instead, which
//! subsumes everything that was dropped. Full snapshots are therefore never
//! lost.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::events::PushMessage;

/// What the push-channel pump receives from the outbox.
#[derive(Debug, PartialEq)]
pub enum OutboundItem {
    Message(PushMessage),
    /// The outbox coalesced; send a freshly built full snapshot.
    NeedFullSnapshot,
}

struct OutboxState {
    items: VecDeque<PushMessage>,
    coalesced: bool,
}

struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    fn push(&self, message: PushMessage) {
        {
            let mut state = self.state.lock();
            if message.is_full_snapshot() {
                // A full snapshot subsumes every buffered delta
                state.items.clear();
                state.coalesced = false;
            } else if state.items.len() >= self.capacity {
                state.items.clear();
                state.coalesced = true;
                self.notify.notify_one();
                return;
            }
            state.items.push_back(message);
        }
        self.notify.notify_one();
    }

    async fn next(&self) -> OutboundItem {
        loop {
            {
                let mut state = self.state.lock();
                if state.coalesced {
                    state.coalesced = false;
                    return OutboundItem::NeedFullSnapshot;
                }
                if let Some(message) = state.items.pop_front() {
                    return OutboundItem::Message(message);
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Registry of connected push-channel subscribers.
pub struct SubscriberHub {
    subscribers: Mutex<HashMap<u64, Arc<Outbox>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox {
            state: Mutex::new(OutboxState {
                items: VecDeque::new(),
                coalesced: false,
            }),
            notify: Notify::new(),
            capacity: self.capacity,
        });
        self.subscribers.lock().insert(id, outbox.clone());
        Subscription {
            id,
            outbox,
            hub: Arc::clone(self),
        }
    }

    /// Enqueue a message for every subscriber. Never blocks.
    pub fn broadcast(&self, message: &PushMessage) {
        let subscribers = self.subscribers.lock();
        for outbox in subscribers.values() {
            outbox.push(message.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }
}

/// One subscriber's handle; dropping it unregisters the outbox.
pub struct Subscription {
    id: u64,
    outbox: Arc<Outbox>,
    hub: Arc<SubscriberHub>,
}

impl Subscription {
    /// Wait for the next outbound item.
    pub async fn next(&self) -> OutboundItem {
        self.outbox.next().await
    }

    /// Deliver directly to this subscriber only.
    pub fn send(&self, message: PushMessage) {
        self.outbox.push(message);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::events::SpecificFields;

    fn delta(n: u64) -> PushMessage {
        PushMessage::specific(SpecificFields {
            processed_over_time: Some(vec![n]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let hub = Arc::new(SubscriberHub::new(16));
        let sub = hub.subscribe();
        hub.broadcast(&delta(1));
        hub.broadcast(&delta(2));
        assert_eq!(sub.next().await, OutboundItem::Message(delta(1)));
        assert_eq!(sub.next().await, OutboundItem::Message(delta(2)));
    }

    #[tokio::test]
    async fn test_overflow_coalesces_to_full_snapshot() {
        let hub = Arc::new(SubscriberHub::new(4));
        let sub = hub.subscribe();
        for n in 0..20 {
            hub.broadcast(&delta(n));
        }
        // Buffered deltas were dropped; the pump is told to send a snapshot
        assert_eq!(sub.next().await, OutboundItem::NeedFullSnapshot);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_others() {
        let hub = Arc::new(SubscriberHub::new(4));
        let slow = hub.subscribe();
        let fast = hub.subscribe();

        hub.broadcast(&delta(1));
        assert_eq!(fast.next().await, OutboundItem::Message(delta(1)));

        for n in 2..40 {
            hub.broadcast(&delta(n));
        }
        // The fast subscriber also overflowed here (same capacity), but the
        // slow one coalescing never blocked the broadcaster
        assert_eq!(slow.next().await, OutboundItem::NeedFullSnapshot);
    }

    #[tokio::test]
    async fn test_ping_fits_in_bounded_buffer() {
        let hub = Arc::new(SubscriberHub::new(2));
        let sub = hub.subscribe();
        hub.broadcast(&PushMessage::Ping);
        assert_eq!(sub.next().await, OutboundItem::Message(PushMessage::Ping));
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let hub = Arc::new(SubscriberHub::new(4));
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
