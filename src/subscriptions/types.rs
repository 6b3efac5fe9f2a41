//! Subscription types for document change notifications.

use crate::types::{Document, Sequence};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Subscribe to specific states (None = all states).
    pub state_ids: Option<Vec<String>>,
}

impl SubscriptionFilter {
    /// Subscribe to changes of specific states.
    pub fn states(state_ids: Vec<String>) -> Self {
        Self {
            state_ids: Some(state_ids),
        }
    }

    /// Subscribe to every state.
    pub fn all() -> Self {
        Self::default()
    }

    pub(crate) fn matches(&self, state_id: &str) -> bool {
        match &self.state_ids {
            Some(ids) => ids.iter().any(|id| id == state_id),
            None => true,
        }
    }
}

/// Events emitted by subscriptions.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// Full document after a committed write.
    StateSnapshot {
        state_id: String,
        data: Document,
        /// Document version this snapshot represents.
        sequence: Sequence,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
