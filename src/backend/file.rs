//! Development backend: one JSON file per state.
//!
//! Layout: `<dir>/<name>.json`, pretty-printed with two-space indentation
//! and sorted keys. Every flush rewrites the whole state. Writes for one
//! name are serialized by an in-process lock; the directory is guarded
//! against a second writer by an advisory lock on `<dir>/.lock`.

use super::{Backend, FlushGroup};
use crate::error::{Result, StoreError};
use crate::subscriptions::{
    SubscriptionConfig, SubscriptionFilter, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
use crate::types::{merge_over_defaults, Document, Sequence, StateName, UsageOperation};
use crate::usage::UsageMeter;
use fs2::FileExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stores each state as a JSON file in one directory.
pub struct FileBackend {
    dir: PathBuf,

    /// Lock file for exclusive access to `dir`.
    _lock_file: File,

    /// Per-state write locks.
    write_locks: Mutex<HashMap<StateName, Arc<Mutex<()>>>>,

    /// Per-state write counters, used as snapshot sequences.
    sequences: Mutex<HashMap<StateName, Sequence>>,

    subscriptions: SubscriptionManager,
    usage: Arc<UsageMeter>,
}

impl FileBackend {
    /// Open (creating if needed) a state directory.
    ///
    /// Fails with [`StoreError::Locked`] if another backend holds the directory.
    pub fn open(dir: impl AsRef<Path>, usage: Arc<UsageMeter>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;

        Ok(Self {
            dir,
            _lock_file: lock_file,
            write_locks: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionManager::new(),
            usage,
        })
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(".lock"))?;

        lock_file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `name`.
    pub fn path_for(&self, name: &StateName) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn write_lock(&self, name: &StateName) -> Arc<Mutex<()>> {
        Arc::clone(
            self.write_locks
                .lock()
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn next_sequence(&self, name: &StateName) -> Sequence {
        let mut sequences = self.sequences.lock();
        let sequence = sequences.entry(name.clone()).or_default();
        *sequence = sequence.next();
        *sequence
    }

    /// Write the whole document for `name`, replacing the file atomically.
    fn write_document(&self, name: &StateName, document: &Document) -> Result<()> {
        let json = serde_json::to_string_pretty(document)?;
        let path = self.path_for(name);
        let tmp_path = self.dir.join(format!("{}.json.tmp", name));

        let lock = self.write_lock(name);
        let _guard = lock.lock();

        let mut file = File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        self.usage.record(name.as_str(), UsageOperation::Set);
        let sequence = self.next_sequence(name);
        self.subscriptions
            .broadcast_state_snapshot(name.as_str(), document.clone(), sequence);

        Ok(())
    }
}

impl Backend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn fetch(&self, name: &StateName) -> Result<Option<Document>> {
        self.usage.record(name.as_str(), UsageOperation::Get);
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            StoreError::Deserialization(format!("{}: {}", path.display(), e))
        })?;

        match value {
            Value::Object(document) => Ok(Some(document)),
            _ => Err(StoreError::Deserialization(format!(
                "{}: expected a JSON object",
                path.display()
            ))),
        }
    }

    fn bootstrap(&self, name: &StateName, defaults: &Document) -> Result<Document> {
        match self.fetch(name)? {
            Some(stored) => Ok(merge_over_defaults(defaults, Some(stored))),
            None => {
                self.write_document(name, defaults)?;
                Ok(defaults.clone())
            }
        }
    }

    fn persist(&self, groups: &[FlushGroup]) -> Result<()> {
        let mut first_error = None;

        for group in groups {
            let Some(document) = group.document.as_ref() else {
                return Err(StoreError::InvalidOperation(format!(
                    "flush of {} is missing the full document",
                    group.name
                )));
            };

            if let Err(e) = self.write_document(&group.name, document) {
                tracing::error!(state = %group.name, error = %e, "failed to write state file");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn needs_full_document(&self) -> bool {
        true
    }

    fn subscribe(&self, name: &StateName, config: SubscriptionConfig) -> SubscriptionHandle {
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
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn name(s: &str) -> StateName {
        StateName::new(s).unwrap()
    }

    fn open(dir: &TempDir) -> FileBackend {
        FileBackend::open(dir.path().join("state"), Arc::new(UsageMeter::new())).unwrap()
    }

    #[test]
    fn test_bootstrap_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);

        let defaults = doc(json!({"a": 1, "b": [1, 2]}));
        let state = backend.bootstrap(&name("x"), &defaults).unwrap();
        assert_eq!(state, defaults);

        let content = fs::read_to_string(backend.path_for(&name("x"))).unwrap();
        assert_eq!(content, "{\n  \"a\": 1,\n  \"b\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn test_bootstrap_merges_existing_file() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        fs::write(backend.path_for(&name("x")), r#"{"a": 5, "extra": true}"#).unwrap();

        let state = backend
            .bootstrap(&name("x"), &doc(json!({"a": 1, "b": 2})))
            .unwrap();

        assert_eq!(state, doc(json!({"a": 5, "b": 2, "extra": true})));
    }

    #[test]
    fn test_corrupt_file_is_load_error() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        fs::write(backend.path_for(&name("x")), "{not json").unwrap();

        let result = backend.bootstrap(&name("x"), &doc(json!({})));
        assert!(matches!(result, Err(StoreError::Deserialization(_))));

        fs::write(backend.path_for(&name("y")), "[1, 2]").unwrap();
        assert!(backend.fetch(&name("y")).is_err());
    }

    #[test]
    fn test_fetch_counts_get_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let usage = Arc::new(UsageMeter::new());
        let backend = FileBackend::open(dir.path().join("state"), usage.clone()).unwrap();

        assert!(backend.fetch(&name("absent")).unwrap().is_none());
        assert_eq!(usage.count("absent", UsageOperation::Get), 1);

        backend.bootstrap(&name("absent"), &doc(json!({"n": 0}))).unwrap();
        assert_eq!(usage.count("absent", UsageOperation::Get), 2);
        assert_eq!(usage.count("absent", UsageOperation::Set), 1);
    }

    #[test]
    fn test_persist_rewrites_whole_document() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);

        backend
            .persist(&[FlushGroup {
                name: name("x"),
                changes: doc(json!({"a": 2})),
                document: Some(doc(json!({"a": 2, "b": 3}))),
            }])
            .unwrap();

        assert_eq!(
            backend.fetch(&name("x")).unwrap(),
            Some(doc(json!({"a": 2, "b": 3})))
        );
        assert!(!dir.path().join("state").join("x.json.tmp").exists());
    }

    #[test]
    fn test_persist_requires_document() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);

        let result = backend.persist(&[FlushGroup {
            name: name("x"),
            changes: doc(json!({"a": 2})),
            document: None,
        }]);
        assert!(matches!(result, Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let _first = open(&dir);

        let second = FileBackend::open(dir.path().join("state"), Arc::new(UsageMeter::new()));
        assert!(matches!(second, Err(StoreError::Locked)));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        drop(open(&dir));
        let _again = open(&dir);
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(open(&dir));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let backend = Arc::clone(&backend);
                std::thread::spawn(move || {
                    let document = doc(json!({"writer": i, "payload": vec![i; 256]}));
                    backend.write_document(&name("shared"), &document).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stored = backend.fetch(&name("shared")).unwrap().unwrap();
        let writer = stored["writer"].as_u64().unwrap();
        assert_eq!(stored["payload"], json!(vec![writer; 256]));
    }
}
