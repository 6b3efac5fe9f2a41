//! Persistence backends.
//!
//! - [`TransactionalBackend`]: production; writes batches to a shared
//!   [`DocumentStore`] inside one transaction, creating or merging per state.
//! - [`FileBackend`]: development; one pretty-printed JSON file per state.

mod document;
mod file;
mod memory;
mod transactional;

pub use document::{DocumentStore, Transaction};
pub use file::FileBackend;
pub use memory::{Commit, CommitKind, MemoryDocumentStore};
pub use transactional::TransactionalBackend;

use crate::error::Result;
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionId};
use crate::types::{merge_over_defaults, Document, StateName};

/// Changes for one state collected by a flush.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushGroup {
    pub name: StateName,
    /// Properties written since the last flush, latest value each.
    pub changes: Document,
    /// Whole current state, filled in for backends that rewrite everything.
    pub document: Option<Document>,
}

/// Storage a state store persists to.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Read the stored document, `None` if nothing was persisted yet.
    fn fetch(&self, name: &StateName) -> Result<Option<Document>>;

    /// Initial contents for a writable state: stored data merged over defaults.
    fn bootstrap(&self, name: &StateName, defaults: &Document) -> Result<Document> {
        Ok(merge_over_defaults(defaults, self.fetch(name)?))
    }

    /// Persist one flush. Either applies the whole batch or returns an error.
    fn persist(&self, groups: &[FlushGroup]) -> Result<()>;

    /// Whether [`FlushGroup::document`] must be filled in.
    fn needs_full_document(&self) -> bool {
        false
    }

    /// Receive a snapshot of `name` after each committed write.
    fn subscribe(&self, name: &StateName, config: SubscriptionConfig) -> SubscriptionHandle;

    fn unsubscribe(&self, id: SubscriptionId);
}
