//! Core types for the state store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A persisted state: top-level property name to value.
pub type Document = serde_json::Map<String, Value>;

/// Unique name of one persisted state document or file.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateName(String);

impl StateName {
    /// Validate and wrap a state name.
    ///
    /// Names must be non-empty and usable as a file stem, since the file
    /// backend stores each state at `<dir>/<name>.json`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.chars().any(|c| c == '/' || c == '\\' || c == '\0');
        if invalid {
            return Err(StoreError::InvalidStateName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StateName {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<StateName> for String {
    fn from(name: StateName) -> Self {
        name.0
    }
}

impl AsRef<str> for StateName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateName({})", self.0)
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version of a backend document, bumped on every committed write.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// A write detected by the change tracker, waiting for the next flush.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMutation {
    pub state: StateName,
    /// Top-level key that was (directly or transitively) written.
    pub property: String,
    /// Value of the top-level key right after the write.
    pub value: Value,
}

/// Backend operations observed by the usage meter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOperation {
    /// Existence check or document read.
    Get,
    /// Document created (or fully rewritten).
    Set,
    /// Existing document merged with new properties.
    Update,
}

impl UsageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageOperation::Get => "get",
            UsageOperation::Set => "set",
            UsageOperation::Update => "update",
        }
    }
}

impl fmt::Display for UsageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge stored data over defaults: stored keys win, default-only keys stay.
pub fn merge_over_defaults(defaults: &Document, stored: Option<Document>) -> Document {
    let mut merged = defaults.clone();
    if let Some(stored) = stored {
        for (key, value) in stored {
            merged.insert(key, value);
        }
    }
    merged
}

/// Serialize caller defaults into a document, rejecting non-object shapes.
pub fn defaults_to_document<T: Serialize + ?Sized>(
    name: &StateName,
    defaults: &T,
) -> Result<Document> {
    match serde_json::to_value(defaults)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::NotAnObject(name.to_string())),
    }
}
