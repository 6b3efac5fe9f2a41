//! Production backend over a shared document store.

use super::document::{DocumentStore, Transaction};
use super::{Backend, FlushGroup};
use crate::error::Result;
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionId};
use crate::types::{Document, StateName, UsageOperation};
use crate::usage::UsageMeter;
use std::sync::Arc;

/// Persists each flush in one transaction on a [`DocumentStore`].
///
/// For every state in the batch the transaction checks whether the document
/// exists and then creates it with exactly the changed properties, or
/// merges them into it. The check and the write share the transaction, so
/// two flushes cannot both create the same document.
pub struct TransactionalBackend {
    store: Arc<dyn DocumentStore>,
    usage: Arc<UsageMeter>,
}

impl TransactionalBackend {
    pub fn new(store: Arc<dyn DocumentStore>, usage: Arc<UsageMeter>) -> Self {
        Self { store, usage }
    }
}

impl Backend for TransactionalBackend {
    fn kind(&self) -> &'static str {
        "transactional"
    }

    fn fetch(&self, name: &StateName) -> Result<Option<Document>> {
        self.usage.record(name.as_str(), UsageOperation::Get);
        self.store.get(name.as_str())
    }

    fn persist(&self, groups: &[FlushGroup]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }

        // Usage is counted once the transaction has committed; the body
        // may run more than once.
        let mut performed: Vec<(&str, UsageOperation)> = Vec::new();
        self.store.run_transaction(&mut |tx: &mut dyn Transaction| {
            performed.clear();
            for group in groups {
                let name = group.name.as_str();

                let exists = tx.get(name)?.is_some();
                performed.push((name, UsageOperation::Get));

                if exists {
                    tx.merge(name, group.changes.clone())?;
                    performed.push((name, UsageOperation::Update));
                    tracing::debug!(state = name, fields = group.changes.len(), "merging document");
                } else {
                    tx.create(name, group.changes.clone())?;
                    performed.push((name, UsageOperation::Set));
                    tracing::debug!(state = name, fields = group.changes.len(), "creating document");
                }
            }
            Ok(())
        })?;

        for (name, operation) in performed {
            self.usage.record(name, operation);
        }
        Ok(())
    }

    fn subscribe(&self, name: &StateName, config: SubscriptionConfig) -> SubscriptionHandle {
        self.store.subscribe(name.as_str(), config)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.store.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CommitKind, MemoryDocumentStore};
    use crate::error::StoreError;
    use serde_json::json;

    /// Aborts the first attempt of every transaction after running its body,
    /// then either retries it or gives up.
    struct ContendedStore {
        inner: MemoryDocumentStore,
        retry: bool,
    }

    impl DocumentStore for ContendedStore {
        fn get(&self, name: &str) -> Result<Option<Document>> {
            self.inner.get(name)
        }

        fn run_transaction(
            &self,
            body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
        ) -> Result<()> {
            let aborted = self.inner.run_transaction(&mut |tx: &mut dyn Transaction| {
                body(tx)?;
                Err(StoreError::Transaction("contention".into()))
            });
            if self.retry {
                self.inner.run_transaction(body)
            } else {
                aborted
            }
        }

        fn subscribe(&self, name: &str, config: SubscriptionConfig) -> SubscriptionHandle {
            self.inner.subscribe(name, config)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.inner.unsubscribe(id)
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn group(name: &str, changes: serde_json::Value) -> FlushGroup {
        FlushGroup {
            name: StateName::new(name).unwrap(),
            changes: doc(changes),
            document: None,
        }
    }

    fn backend() -> (TransactionalBackend, Arc<MemoryDocumentStore>, Arc<UsageMeter>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let usage = Arc::new(UsageMeter::new());
        let backend = TransactionalBackend::new(store.clone(), usage.clone());
        (backend, store, usage)
    }

    #[test]
    fn test_creates_new_document() {
        let (backend, store, usage) = backend();

        backend.persist(&[group("fresh", json!({"n": 1}))]).unwrap();

        let commits = store.commits_for("fresh");
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].kind, CommitKind::Create);
        assert_eq!(store.get("fresh").unwrap(), Some(doc(json!({"n": 1}))));
        assert_eq!(usage.count("fresh", UsageOperation::Get), 1);
        assert_eq!(usage.count("fresh", UsageOperation::Set), 1);
        assert_eq!(usage.count("fresh", UsageOperation::Update), 0);
    }

    #[test]
    fn test_merges_existing_document() {
        let (backend, store, usage) = backend();
        store
            .write_document("quiz", doc(json!({"round": 1, "host": "ann"})))
            .unwrap();

        backend.persist(&[group("quiz", json!({"round": 2}))]).unwrap();

        assert_eq!(
            store.get("quiz").unwrap(),
            Some(doc(json!({"round": 2, "host": "ann"})))
        );
        assert_eq!(store.commits_for("quiz")[1].kind, CommitKind::Merge);
        assert_eq!(usage.count("quiz", UsageOperation::Update), 1);
        assert_eq!(usage.count("quiz", UsageOperation::Set), 0);
    }

    #[test]
    fn test_batch_is_one_transaction() {
        let (backend, store, _) = backend();
        store.write_document("b", doc(json!({"x": 0}))).unwrap();

        backend
            .persist(&[group("a", json!({"x": 1})), group("b", json!({"x": 2}))])
            .unwrap();

        assert_eq!(store.get("a").unwrap(), Some(doc(json!({"x": 1}))));
        assert_eq!(store.get("b").unwrap(), Some(doc(json!({"x": 2}))));
    }

    #[test]
    fn test_fetch_counts_get() {
        let (backend, _, usage) = backend();
        let name = StateName::new("x").unwrap();

        assert!(backend.fetch(&name).unwrap().is_none());
        assert_eq!(usage.count("x", UsageOperation::Get), 1);
    }

    #[test]
    fn test_retried_transaction_counts_usage_once() {
        let store = Arc::new(ContendedStore {
            inner: MemoryDocumentStore::new(),
            retry: true,
        });
        let usage = Arc::new(UsageMeter::new());
        let backend = TransactionalBackend::new(store.clone(), usage.clone());

        backend.persist(&[group("busy", json!({"n": 1}))]).unwrap();

        assert_eq!(store.inner.commits_for("busy").len(), 1);
        assert_eq!(usage.count("busy", UsageOperation::Get), 1);
        assert_eq!(usage.count("busy", UsageOperation::Set), 1);
    }

    #[test]
    fn test_failed_transaction_counts_no_usage() {
        let store = Arc::new(ContendedStore {
            inner: MemoryDocumentStore::new(),
            retry: false,
        });
        let usage = Arc::new(UsageMeter::new());
        let backend = TransactionalBackend::new(store.clone(), usage.clone());

        assert!(backend.persist(&[group("busy", json!({"n": 1}))]).is_err());

        assert!(store.inner.is_empty());
        assert!(usage.drain().is_empty());
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (backend, store, _) = backend();
        backend.persist(&[]).unwrap();
        assert!(store.commits().is_empty());
    }
}
