//! Handles over tracked value trees.

use super::node::{ChangeListener, Node};
use crate::error::{Result, StoreError};
use crate::types::{Document, StateName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Live, mutable root of one plugin state.
///
/// Every write made by navigating from this handle is reported to its
/// listener. Top-level keys can be reassigned but never removed.
#[derive(Clone)]
pub struct StateHandle {
    name: StateName,
    root: Arc<Node>,
}

impl StateHandle {
    /// Wrap a document so writes are reported to `listener`.
    pub fn new(name: StateName, document: Document, listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            name,
            root: Node::build(Value::Object(document), None, Some(listener)),
        }
    }

    pub fn name(&self) -> &StateName {
        &self.name
    }

    /// Copy of a top-level value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.root.get_key(key)
    }

    /// Deserialize a top-level value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|value| {
                serde_json::from_value(value).map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .transpose()
    }

    /// Replace a top-level value.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        // The root is always an object, so this cannot fail.
        let _ = self.root.set_key(key, value.into());
    }

    /// Serialize and replace a top-level value.
    pub fn set_as<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.root.set_key(key, serde_json::to_value(value)?)
    }

    /// Handle to a nested object or array, for writes below the top level.
    ///
    /// Returns `None` for missing keys and scalar values.
    pub fn field(&self, key: &str) -> Option<Tracked> {
        self.root.child_key(key).map(|node| Tracked { node })
    }

    pub fn keys(&self) -> Vec<String> {
        self.root.keys()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.root.contains_key(key)
    }

    /// Copy of the whole state.
    pub fn snapshot(&self) -> Document {
        match self.root.snapshot() {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    /// Deserialize the whole state.
    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.snapshot()))
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("name", &self.name)
            .field("state", &Value::Object(self.snapshot()))
            .finish()
    }
}

/// Handle to a nested object or array inside a tracked state.
///
/// A `Tracked` keeps pointing at the same value even after its slot in the
/// parent is reassigned. Writes made through it after that point change the
/// detached value only and are not reported; navigate from the root again
/// to write to the current value.
#[derive(Clone)]
pub struct Tracked {
    node: Arc<Node>,
}

impl Tracked {
    pub fn is_array(&self) -> bool {
        self.node.is_array()
    }

    /// Whether writes through this handle still reach the state root.
    pub fn is_attached(&self) -> bool {
        self.node.is_attached()
    }

    /// Number of keys (objects) or elements (arrays).
    pub fn len(&self) -> usize {
        self.node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Value {
        self.node.snapshot()
    }

    pub fn clear(&self) {
        self.node.clear()
    }

    // --- Objects ---

    pub fn get(&self, key: &str) -> Option<Value> {
        self.node.get_key(key)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.node.set_key(key, value.into())
    }

    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.node.remove_key(key)
    }

    pub fn field(&self, key: &str) -> Option<Tracked> {
        self.node.child_key(key).map(|node| Tracked { node })
    }

    pub fn keys(&self) -> Vec<String> {
        self.node.keys()
    }

    // --- Arrays ---

    pub fn at(&self, index: usize) -> Option<Value> {
        self.node.get_index(index)
    }

    pub fn element(&self, index: usize) -> Option<Tracked> {
        self.node.child_index(index).map(|node| Tracked { node })
    }

    pub fn set_index(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.node.set_index(index, value.into())
    }

    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        self.node.push(value.into())
    }

    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.node.insert(index, value.into())
    }

    pub fn remove_index(&self, index: usize) -> Result<Value> {
        self.node.remove_index(index)
    }

    pub fn pop(&self) -> Result<Option<Value>> {
        self.node.pop()
    }
}

impl fmt::Debug for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tracked({})", self.node.snapshot())
    }
}

/// Root of a read-only replica. Offers reads only; updates arrive from the
/// backend and replace top-level fields in place.
#[derive(Clone)]
pub struct ReadOnlyHandle {
    name: StateName,
    root: Arc<Node>,
}

impl ReadOnlyHandle {
    pub(crate) fn new(name: StateName, document: Document) -> Self {
        Self {
            name,
            root: Node::build(Value::Object(document), None, None),
        }
    }

    pub fn name(&self) -> &StateName {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.root.get_key(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|value| {
                serde_json::from_value(value).map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .transpose()
    }

    pub fn keys(&self) -> Vec<String> {
        self.root.keys()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.root.contains_key(key)
    }

    pub fn snapshot(&self) -> Document {
        match self.root.snapshot() {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.snapshot()))
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Overwrite top-level fields with those of `document`.
    pub(crate) fn assign(&self, document: Document) {
        for (key, value) in document {
            // Root is an object; nothing is listening.
            let _ = self.root.set_key(&key, value);
        }
    }
}

impl fmt::Debug for ReadOnlyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyHandle")
            .field("name", &self.name)
            .field("state", &Value::Object(self.snapshot()))
            .finish()
    }
}
