//! Change notifications for persisted states.
//!
//! Backends publish a snapshot of a document after each committed write.
//! Read-only replicas subscribe to the states they mirror and apply the
//! snapshots as they arrive.
//!
//! Subscriptions have bounded buffers; a subscriber that falls behind is
//! dropped and receives `StoreEvent::Dropped` (best effort).
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new();
//! let handle = manager.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::states(vec!["quiz".to_string()]),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(StoreEvent::StateSnapshot { data, .. }) => println!("now: {:?}", data),
//!         Ok(StoreEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
