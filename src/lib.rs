//! # Plugin State Sync
//!
//! Durable, mutation-tracked state for bot plugins. A plugin asks for a
//! state by name with a set of defaults, mutates the returned handle like
//! a local object, and every change is persisted in the background.
//!
//! ## Core Concepts
//!
//! - **Change tracking**: writes anywhere in a state's value tree are
//!   reported with their path and top-level property
//! - **Coalescing**: changes are batched and flushed at most once per window
//! - **Backends**: a transactional document store (production) or one
//!   JSON file per state (development), chosen explicitly in config
//! - **Replicas**: read-only handles that follow the stored document
//! - **Usage**: per-state operation counters, logged and reset periodically
//!
//! ## Example
//!
//! ```ignore
//! use statesync::{StateStore, StoreConfig};
//! use serde_json::json;
//!
//! let store = StateStore::open(StoreConfig::file("./state"))?;
//!
//! let quiz = store.init("quiz", &json!({"round": 0, "scores": {}}))?;
//! quiz.set("round", 1);
//! quiz.field("scores").unwrap().set("alice", 3)?;
//!
//! // Both writes land in `./state/quiz.json` within one flush window.
//! ```

pub mod backend;
pub mod coalescer;
pub mod error;
pub mod replica;
pub mod store;
pub mod subscriptions;
pub mod tracker;
pub mod types;
pub mod usage;

// Re-exports
pub use backend::{
    Backend, Commit, CommitKind, DocumentStore, FileBackend, FlushGroup, MemoryDocumentStore,
    Transaction, TransactionalBackend,
};
pub use coalescer::{Batch, Coalescer, FlushSink};
pub use error::{Result, StoreError};
pub use replica::Replica;
pub use store::{BackendConfig, StateStore, StoreConfig};
pub use subscriptions::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use tracker::{Change, ChangeListener, ReadOnlyHandle, StateHandle, Tracked};
pub use types::*;
pub use usage::{UsageMeter, UsageReporter};
