//! In-process document store.
//!
//! Transactions are serialized under one write lock: writes are staged
//! while the body runs and applied together on success. Every committed
//! write bumps the document's sequence, is appended to the commit log, and
//! is broadcast to subscribers once the lock is released.

use super::document::{DocumentStore, Transaction};
use crate::error::{Result, StoreError};
use crate::subscriptions::{
    SubscriptionConfig, SubscriptionFilter, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
use crate::types::{Document, Sequence};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};

/// How a commit changed a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitKind {
    Create,
    Merge,
}

/// One committed document write.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub name: String,
    pub kind: CommitKind,
    /// Fields written by this commit.
    pub fields: Document,
    pub sequence: Sequence,
}

#[derive(Clone, Debug)]
struct StoredDocument {
    fields: Document,
    sequence: Sequence,
}

enum StagedWrite {
    Create(Document),
    Merge(Document),
}

struct MemoryTransaction<'a> {
    committed: &'a HashMap<String, StoredDocument>,
    staged: BTreeMap<String, Vec<StagedWrite>>,
}

impl MemoryTransaction<'_> {
    fn current(&self, name: &str) -> Option<Document> {
        let mut doc = self.committed.get(name).map(|d| d.fields.clone());
        for write in self.staged.get(name).into_iter().flatten() {
            match write {
                StagedWrite::Create(fields) => doc = Some(fields.clone()),
                StagedWrite::Merge(fields) => {
                    if let Some(doc) = doc.as_mut() {
                        doc.extend(fields.clone());
                    }
                }
            }
        }
        doc
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, name: &str) -> Result<Option<Document>> {
        Ok(self.current(name))
    }

    fn create(&mut self, name: &str, fields: Document) -> Result<()> {
        if self.current(name).is_some() {
            return Err(StoreError::Transaction(format!(
                "document {} already exists",
                name
            )));
        }
        self.staged
            .entry(name.to_string())
            .or_default()
            .push(StagedWrite::Create(fields));
        Ok(())
    }

    fn merge(&mut self, name: &str, fields: Document) -> Result<()> {
        if self.current(name).is_none() {
            return Err(StoreError::Transaction(format!(
                "document {} does not exist",
                name
            )));
        }
        self.staged
            .entry(name.to_string())
            .or_default()
            .push(StagedWrite::Merge(fields));
        Ok(())
    }
}

/// Document store held in memory.
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
    commits: Mutex<Vec<Commit>>,
    subscriptions: SubscriptionManager,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            commits: Mutex::new(Vec::new()),
            subscriptions: SubscriptionManager::new(),
        }
    }

    /// Create or merge a document outside any state store, as another
    /// writer of the shared collection would.
    pub fn write_document(&self, name: &str, fields: Document) -> Result<()> {
        self.run_transaction(&mut |tx: &mut dyn Transaction| {
            if tx.get(name)?.is_some() {
                tx.merge(name, fields.clone())
            } else {
                tx.create(name, fields.clone())
            }
        })
    }

    /// All commits so far, oldest first.
    pub fn commits(&self) -> Vec<Commit> {
        self.commits.lock().clone()
    }

    /// Commits for one document, oldest first.
    pub fn commits_for(&self, name: &str) -> Vec<Commit> {
        self.commits
            .lock()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    pub fn sequence(&self, name: &str) -> Option<Sequence> {
        self.documents.read().get(name).map(|d| d.sequence)
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, name: &str) -> Result<Option<Document>> {
        Ok(self.documents.read().get(name).map(|d| d.fields.clone()))
    }

    fn run_transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>,
    ) -> Result<()> {
        let mut documents = self.documents.write();

        let staged = {
            let mut tx = MemoryTransaction {
                committed: &*documents,
                staged: BTreeMap::new(),
            };
            body(&mut tx)?;
            tx.staged
        };

        let mut snapshots = Vec::new();
        {
            let mut commits = self.commits.lock();
            for (name, writes) in staged {
                for write in writes {
                    let (kind, fields) = match write {
                        StagedWrite::Create(fields) => (CommitKind::Create, fields),
                        StagedWrite::Merge(fields) => (CommitKind::Merge, fields),
                    };

                    let sequence = documents
                        .get(&name)
                        .map_or(Sequence(1), |d| d.sequence.next());
                    match kind {
                        CommitKind::Merge => {
                            if let Some(doc) = documents.get_mut(&name) {
                                doc.fields.extend(fields.clone());
                                doc.sequence = sequence;
                            }
                        }
                        CommitKind::Create => {
                            documents.insert(
                                name.clone(),
                                StoredDocument {
                                    fields: fields.clone(),
                                    sequence,
                                },
                            );
                        }
                    }

                    commits.push(Commit {
                        name: name.clone(),
                        kind,
                        fields,
                        sequence,
                    });
                }
                if let Some(doc) = documents.get(&name) {
                    snapshots.push((name, doc.fields.clone(), doc.sequence));
                }
            }
        }
        drop(documents);

        for (name, fields, sequence) in snapshots {
            self.subscriptions
                .broadcast_state_snapshot(&name, fields, sequence);
        }

        Ok(())
    }

    fn subscribe(&self, name: &str, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::states(vec![name.to_string()]),
            ..config
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::StoreEvent;
    use serde_json::json;
    use std::time::Duration;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_create_then_merge() {
        let store = MemoryDocumentStore::new();

        store.write_document("quiz", doc(json!({"a": 1, "b": 2}))).unwrap();
        store.write_document("quiz", doc(json!({"b": 3}))).unwrap();

        assert_eq!(
            store.get("quiz").unwrap(),
            Some(doc(json!({"a": 1, "b": 3})))
        );
        let kinds: Vec<_> = store.commits().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CommitKind::Create, CommitKind::Merge]);
        assert_eq!(store.sequence("quiz"), Some(Sequence(2)));
    }

    #[test]
    fn test_failed_transaction_commits_nothing() {
        let store = MemoryDocumentStore::new();

        let result = store.run_transaction(&mut |tx: &mut dyn Transaction| {
            tx.create("a", doc(json!({"x": 1})))?;
            Err(StoreError::Transaction("aborted".into()))
        });

        assert!(result.is_err());
        assert!(store.is_empty());
        assert!(store.commits().is_empty());
    }

    #[test]
    fn test_create_existing_fails() {
        let store = MemoryDocumentStore::new();
        store.write_document("a", doc(json!({}))).unwrap();

        let result = store.run_transaction(&mut |tx: &mut dyn Transaction| tx.create("a", doc(json!({"x": 1}))));
        assert!(matches!(result, Err(StoreError::Transaction(_))));
    }

    #[test]
    fn test_merge_missing_fails() {
        let store = MemoryDocumentStore::new();
        let result = store.run_transaction(&mut |tx: &mut dyn Transaction| tx.merge("a", doc(json!({"x": 1}))));
        assert!(result.is_err());
    }

    #[test]
    fn test_reads_see_staged_writes() {
        let store = MemoryDocumentStore::new();
        store
            .run_transaction(&mut |tx: &mut dyn Transaction| {
                assert!(tx.get("a")?.is_none());
                tx.create("a", doc(json!({"x": 1})))?;
                tx.merge("a", doc(json!({"y": 2})))?;
                assert_eq!(tx.get("a")?, Some(doc(json!({"x": 1, "y": 2}))));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get("a").unwrap(), Some(doc(json!({"x": 1, "y": 2}))));
        assert_eq!(store.sequence("a"), Some(Sequence(2)));
    }

    #[test]
    fn test_subscribers_get_snapshots() {
        let store = MemoryDocumentStore::new();
        let handle = store.subscribe("a", SubscriptionConfig::default());

        store.write_document("b", doc(json!({"ignored": true}))).unwrap();
        store.write_document("a", doc(json!({"x": 1}))).unwrap();

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            StoreEvent::StateSnapshot {
                state_id,
                data,
                sequence,
            } => {
                assert_eq!(state_id, "a");
                assert_eq!(data, doc(json!({"x": 1})));
                assert_eq!(sequence, Sequence(1));
            }
            other => panic!("Expected StateSnapshot, got {:?}", other),
        }
        assert!(handle.try_recv().is_err());
    }
}
