//! Subscription manager for broadcasting document snapshots.

use crate::types::{Document, Sequence};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};

/// Internal subscription state.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<StoreEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if buffer is full (subscriber will be dropped).
    fn try_send(&self, event: StoreEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Manages subscriptions and broadcasts events.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new subscription. Only events broadcast after this call are delivered.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        if let Some(sub) = subs.remove(&id) {
            // Send dropped event (best effort)
            let _ = sub.sender.try_send(StoreEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Broadcast a document snapshot to matching subscriptions.
    pub fn broadcast_state_snapshot(&self, state_id: &str, data: Document, sequence: Sequence) {
        let event = StoreEvent::StateSnapshot {
            state_id: state_id.to_string(),
            data,
            sequence,
        };

        self.broadcast(|sub| sub.config.filter.matches(state_id), event);
    }

    /// Internal broadcast helper. Drops subscribers that fail to receive.
    fn broadcast<F>(&self, filter: F, event: StoreEvent)
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if filter(sub) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    tracing::warn!(subscription = id.0, "dropping slow subscriber");
                    let _ = sub.sender.try_send(StoreEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::SubscriptionFilter;
    use serde_json::json;
    use std::time::Duration;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();

        let handle = manager.subscribe(SubscriptionConfig::default());
        assert_eq!(manager.subscription_count(), 1);

        manager.unsubscribe(handle.id);
        assert_eq!(manager.subscription_count(), 0);
        assert!(matches!(
            handle.try_recv(),
            Ok(StoreEvent::Dropped {
                reason: DropReason::Unsubscribed
            })
        ));
    }

    #[test]
    fn test_broadcast_to_matching() {
        let manager = SubscriptionManager::new();
        let handle = manager.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::states(vec!["quiz".to_string()]),
            ..Default::default()
        });

        manager.broadcast_state_snapshot("quiz", doc(json!({"round": 2})), Sequence(3));

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            StoreEvent::StateSnapshot {
                state_id,
                data,
                sequence,
            } => {
                assert_eq!(state_id, "quiz");
                assert_eq!(data, doc(json!({"round": 2})));
                assert_eq!(sequence, Sequence(3));
            }
            other => panic!("Expected StateSnapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_filters_non_matching() {
        let manager = SubscriptionManager::new();
        let handle = manager.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::states(vec!["quiz".to_string()]),
            ..Default::default()
        });

        manager.broadcast_state_snapshot("mail", doc(json!({})), Sequence(1));

        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = SubscriptionManager::new();
        let _handle = manager.subscribe(SubscriptionConfig {
            buffer_size: 2,
            filter: SubscriptionFilter::all(),
        });

        for i in 0..10 {
            manager.broadcast_state_snapshot("quiz", doc(json!({"i": i})), Sequence(i));
        }

        assert_eq!(manager.subscription_count(), 0);
    }
}
