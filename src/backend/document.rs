//! Client interface of a shared transactional document store.

use crate::error::Result;
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionId};
use crate::types::Document;

/// Operations available inside a transaction.
///
/// Reads see the committed state plus writes already staged in the same
/// transaction. Nothing is visible to other readers until commit.
pub trait Transaction {
    fn get(&mut self, name: &str) -> Result<Option<Document>>;

    /// Create a document. Fails if it already exists.
    fn create(&mut self, name: &str, fields: Document) -> Result<()>;

    /// Merge fields into an existing document, leaving other fields intact.
    /// Fails if the document does not exist.
    fn merge(&mut self, name: &str, fields: Document) -> Result<()>;
}

/// A collection of documents keyed by state name.
pub trait DocumentStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Document>>;

    /// Run `body` in a transaction and commit its writes atomically.
    ///
    /// If `body` returns an error, nothing is committed and the error is
    /// returned.
    fn run_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()>;

    /// Receive a snapshot of `name` after each committed write.
    fn subscribe(&self, name: &str, config: SubscriptionConfig) -> SubscriptionHandle;

    fn unsubscribe(&self, id: SubscriptionId);
}
