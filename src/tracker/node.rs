//! Tree nodes backing tracked values.
//!
//! Objects and arrays are reference-counted nodes with a weak link to the
//! node that contains them; scalars live inline in their parent. A write
//! walks the parent links up to find its path. Replacing or removing a
//! slot clears the old child's parent link, so writes through a handle to
//! the old child no longer resolve to the root and are not reported.

use crate::error::{Result, StoreError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Weak};

/// A write detected under a tracked root.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    /// Path from the root, e.g. `scores.alice[2].points`.
    pub path: String,
    /// Top-level key containing the write.
    pub property: String,
    /// Value of `property` right after the write.
    pub value: Value,
}

/// Receives every change made through a tracked root.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, change: Change);
}

/// One step of a path from the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Render segments as `a.b[2].c`.
pub fn format_path(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            Segment::Index(index) => {
                let _ = write!(out, "[{}]", index);
            }
        }
    }
    out
}

pub(crate) enum Slot {
    Leaf(Value),
    Node(Arc<Node>),
}

impl Slot {
    fn from_value(value: Value, parent: &Arc<Node>) -> Self {
        match value {
            Value::Object(_) | Value::Array(_) => {
                Slot::Node(Node::build(value, Some(Arc::downgrade(parent)), None))
            }
            scalar => Slot::Leaf(scalar),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Slot::Leaf(value) => value.clone(),
            Slot::Node(node) => node.snapshot(),
        }
    }

    fn node(&self) -> Option<Arc<Node>> {
        match self {
            Slot::Leaf(_) => None,
            Slot::Node(node) => Some(Arc::clone(node)),
        }
    }

    fn detach(self) {
        if let Slot::Node(node) = self {
            *node.parent.lock() = None;
        }
    }
}

pub(crate) enum Body {
    Object(BTreeMap<String, Slot>),
    Array(Vec<Slot>),
}

pub(crate) struct Node {
    body: RwLock<Body>,
    parent: Mutex<Option<Weak<Node>>>,
    /// Set only on a tracked root.
    listener: Option<Arc<dyn ChangeListener>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.snapshot())
    }
}

impl Node {
    /// Build a node tree from a composite value. Scalars become an empty object.
    pub(crate) fn build(
        value: Value,
        parent: Option<Weak<Node>>,
        listener: Option<Arc<dyn ChangeListener>>,
    ) -> Arc<Node> {
        let node = Arc::new(Node {
            body: RwLock::new(Body::Object(BTreeMap::new())),
            parent: Mutex::new(parent),
            listener,
        });

        let body = match value {
            Value::Array(items) => Body::Array(
                items
                    .into_iter()
                    .map(|item| Slot::from_value(item, &node))
                    .collect(),
            ),
            Value::Object(map) => Body::Object(
                map.into_iter()
                    .map(|(key, item)| (key, Slot::from_value(item, &node)))
                    .collect(),
            ),
            _ => Body::Object(BTreeMap::new()),
        };
        *node.body.write() = body;

        node
    }

    pub(crate) fn snapshot(&self) -> Value {
        match &*self.body.read() {
            Body::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, slot)| (key.clone(), slot.to_value()))
                    .collect(),
            ),
            Body::Array(items) => Value::Array(items.iter().map(Slot::to_value).collect()),
        }
    }

    pub(crate) fn is_array(&self) -> bool {
        matches!(&*self.body.read(), Body::Array(_))
    }

    /// Whether writes through this node currently reach a tracked root.
    pub(crate) fn is_attached(self: &Arc<Self>) -> bool {
        self.locate().is_some()
    }

    // --- Object reads ---

    pub(crate) fn get_key(&self, key: &str) -> Option<Value> {
        match &*self.body.read() {
            Body::Object(map) => map.get(key).map(Slot::to_value),
            Body::Array(_) => None,
        }
    }

    pub(crate) fn child_key(&self, key: &str) -> Option<Arc<Node>> {
        match &*self.body.read() {
            Body::Object(map) => map.get(key).and_then(Slot::node),
            Body::Array(_) => None,
        }
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        match &*self.body.read() {
            Body::Object(map) => map.keys().cloned().collect(),
            Body::Array(_) => Vec::new(),
        }
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        match &*self.body.read() {
            Body::Object(map) => map.contains_key(key),
            Body::Array(_) => false,
        }
    }

    // --- Array reads ---

    pub(crate) fn len(&self) -> usize {
        match &*self.body.read() {
            Body::Object(map) => map.len(),
            Body::Array(items) => items.len(),
        }
    }

    pub(crate) fn get_index(&self, index: usize) -> Option<Value> {
        match &*self.body.read() {
            Body::Array(items) => items.get(index).map(Slot::to_value),
            Body::Object(_) => None,
        }
    }

    pub(crate) fn child_index(&self, index: usize) -> Option<Arc<Node>> {
        match &*self.body.read() {
            Body::Array(items) => items.get(index).and_then(Slot::node),
            Body::Object(_) => None,
        }
    }

    // --- Object writes ---

    pub(crate) fn set_key(self: &Arc<Self>, key: &str, value: Value) -> Result<()> {
        let old = {
            let mut body = self.body.write();
            let Body::Object(map) = &mut *body else {
                return Err(not_an("object", key));
            };
            map.insert(key.to_string(), Slot::from_value(value, self))
        };
        if let Some(old) = old {
            old.detach();
        }
        self.notify(Some(Segment::Key(key.to_string())));
        Ok(())
    }

    pub(crate) fn remove_key(self: &Arc<Self>, key: &str) -> Result<Option<Value>> {
        let old = {
            let mut body = self.body.write();
            let Body::Object(map) = &mut *body else {
                return Err(not_an("object", key));
            };
            map.remove(key)
        };
        let Some(old) = old else {
            return Ok(None);
        };
        let value = old.to_value();
        old.detach();
        self.notify(Some(Segment::Key(key.to_string())));
        Ok(Some(value))
    }

    // --- Array writes ---

    pub(crate) fn set_index(self: &Arc<Self>, index: usize, value: Value) -> Result<()> {
        let old = {
            let mut body = self.body.write();
            let Body::Array(items) = &mut *body else {
                return Err(not_an("array", index));
            };
            let Some(slot) = items.get_mut(index) else {
                return Err(out_of_bounds(index, items.len()));
            };
            std::mem::replace(slot, Slot::from_value(value, self))
        };
        old.detach();
        self.notify(Some(Segment::Index(index)));
        Ok(())
    }

    pub(crate) fn insert(self: &Arc<Self>, index: usize, value: Value) -> Result<()> {
        {
            let mut body = self.body.write();
            let Body::Array(items) = &mut *body else {
                return Err(not_an("array", index));
            };
            if index > items.len() {
                return Err(out_of_bounds(index, items.len()));
            }
            items.insert(index, Slot::from_value(value, self));
        }
        self.notify(Some(Segment::Index(index)));
        Ok(())
    }

    pub(crate) fn push(self: &Arc<Self>, value: Value) -> Result<()> {
        let index = {
            let mut body = self.body.write();
            let Body::Array(items) = &mut *body else {
                return Err(StoreError::InvalidOperation(
                    "push on a value that is not an array".into(),
                ));
            };
            items.push(Slot::from_value(value, self));
            items.len() - 1
        };
        self.notify(Some(Segment::Index(index)));
        Ok(())
    }

    pub(crate) fn remove_index(self: &Arc<Self>, index: usize) -> Result<Value> {
        let old = {
            let mut body = self.body.write();
            let Body::Array(items) = &mut *body else {
                return Err(not_an("array", index));
            };
            if index >= items.len() {
                return Err(out_of_bounds(index, items.len()));
            }
            items.remove(index)
        };
        let value = old.to_value();
        old.detach();
        self.notify(Some(Segment::Index(index)));
        Ok(value)
    }

    pub(crate) fn pop(self: &Arc<Self>) -> Result<Option<Value>> {
        let len = self.len();
        if !self.is_array() {
            return Err(StoreError::InvalidOperation(
                "pop on a value that is not an array".into(),
            ));
        }
        if len == 0 {
            return Ok(None);
        }
        self.remove_index(len - 1).map(Some)
    }

    pub(crate) fn clear(self: &Arc<Self>) {
        let old = {
            let mut body = self.body.write();
            match &mut *body {
                Body::Object(map) => std::mem::take(map).into_values().collect::<Vec<_>>(),
                Body::Array(items) => std::mem::take(items),
            }
        };
        for slot in old {
            slot.detach();
        }
        self.notify(None);
    }

    // --- Change reporting ---

    /// Walk parent links to the root, collecting the path.
    ///
    /// Returns `None` if the chain ends at a node that is not a tracked root
    /// (a detached subtree, or an untracked replica root).
    fn locate(self: &Arc<Self>) -> Option<(Arc<Node>, Vec<Segment>)> {
        let mut segments = Vec::new();
        let mut current = Arc::clone(self);
        loop {
            let parent = current.parent.lock().as_ref().and_then(Weak::upgrade);
            match parent {
                Some(parent) => {
                    segments.push(parent.position_of(&current)?);
                    current = parent;
                }
                None => {
                    if current.listener.is_none() {
                        return None;
                    }
                    segments.reverse();
                    return Some((current, segments));
                }
            }
        }
    }

    fn position_of(&self, child: &Arc<Node>) -> Option<Segment> {
        let is_child = |slot: &Slot| matches!(slot, Slot::Node(node) if Arc::ptr_eq(node, child));
        match &*self.body.read() {
            Body::Object(map) => map
                .iter()
                .find(|&(_, slot)| is_child(slot))
                .map(|(key, _)| Segment::Key(key.clone())),
            Body::Array(items) => items.iter().position(is_child).map(Segment::Index),
        }
    }

    fn notify(self: &Arc<Self>, last: Option<Segment>) {
        let Some((root, mut segments)) = self.locate() else {
            return;
        };
        segments.extend(last);

        let Some(Segment::Key(property)) = segments.first().cloned() else {
            return;
        };
        let Some(listener) = root.listener.as_ref() else {
            return;
        };
        let value = root.get_key(&property).unwrap_or(Value::Null);

        listener.on_change(Change {
            path: format_path(&segments),
            property,
            value,
        });
    }
}

fn not_an(kind: &str, at: impl fmt::Display) -> StoreError {
    StoreError::InvalidOperation(format!("cannot write {} on a value that is not an {}", at, kind))
}

fn out_of_bounds(index: usize, len: usize) -> StoreError {
    StoreError::InvalidOperation(format!("index {} out of bounds (len {})", index, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_path() {
        let path = vec![
            Segment::Key("scores".into()),
            Segment::Key("alice".into()),
            Segment::Index(2),
            Segment::Key("points".into()),
        ];
        assert_eq!(format_path(&path), "scores.alice[2].points");
        assert_eq!(format_path(&[Segment::Key("n".into())]), "n");
    }

    #[test]
    fn test_build_and_snapshot() {
        let value = json!({"a": 1, "b": [1, {"c": null}], "d": {"e": "x"}});
        let node = Node::build(value.clone(), None, None);
        assert_eq!(node.snapshot(), value);
        assert!(node.child_key("b").unwrap().is_array());
        assert!(node.child_key("a").is_none());
    }

    #[test]
    fn test_untracked_root_is_not_attached() {
        let node = Node::build(json!({"a": {"b": 1}}), None, None);
        assert!(!node.child_key("a").unwrap().is_attached());
    }

    #[test]
    fn test_clear_detaches_children() {
        let node = Node::build(json!({"list": [{"x": 1}]}), None, None);
        let list = node.child_key("list").unwrap();
        let item = list.child_index(0).unwrap();

        list.clear();
        assert_eq!(list.len(), 0);
        assert!(item.parent.lock().is_none());
    }
}
