//! Main StateStore struct tying all components together.

use crate::backend::{Backend, DocumentStore, FileBackend, FlushGroup, TransactionalBackend};
use crate::coalescer::{Batch, Coalescer, FlushSink};
use crate::error::{Result, StoreError};
use crate::replica::Replica;
use crate::subscriptions::SubscriptionConfig;
use crate::tracker::{Change, ChangeListener, StateHandle};
use crate::types::{defaults_to_document, StateName};
use crate::usage::{UsageMeter, UsageReporter};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Where states are persisted.
#[derive(Clone)]
pub enum BackendConfig {
    /// One JSON file per state in `dir` (development).
    File { dir: PathBuf },
    /// A shared transactional document store (production).
    Remote(Arc<dyn DocumentStore>),
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConfig::File { dir } => f.debug_struct("File").field("dir", dir).finish(),
            BackendConfig::Remote(_) => f.write_str("Remote"),
        }
    }
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Backend to load from and persist to.
    pub backend: BackendConfig,

    /// Coalescing window: at most one flush per window.
    /// Default: 30 seconds
    pub flush_interval: Duration,

    /// How often usage counters are logged and reset.
    /// Default: 1 hour
    pub usage_report_interval: Duration,

    /// Buffered change notifications per replica before it resyncs.
    /// Default: 1000
    pub subscription_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::File {
                dir: PathBuf::from("./state"),
            },
            flush_interval: Duration::from_secs(30),
            usage_report_interval: Duration::from_secs(60 * 60),
            subscription_buffer: 1000,
        }
    }
}

impl StoreConfig {
    /// File backend in `dir`, other settings default.
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::File { dir: dir.into() },
            ..Default::default()
        }
    }

    /// Remote document store, other settings default.
    pub fn remote(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend: BackendConfig::Remote(store),
            ..Default::default()
        }
    }
}

type Registry = Arc<RwLock<HashMap<StateName, StateHandle>>>;

/// Turns coalesced batches into backend writes.
struct Persister {
    backend: Arc<dyn Backend>,
    states: Registry,
}

impl FlushSink for Persister {
    fn flush(&self, batch: Batch) -> Result<()> {
        let full = self.backend.needs_full_document();
        let groups: Vec<FlushGroup> = {
            let states = self.states.read();
            batch
                .into_iter()
                .map(|(name, changes)| {
                    let document = if full {
                        states.get(&name).map(StateHandle::snapshot)
                    } else {
                        None
                    };
                    FlushGroup {
                        name,
                        changes,
                        document,
                    }
                })
                .collect()
        };

        self.backend.persist(&groups).map_err(|e| {
            let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
            tracing::error!(
                backend = self.backend.kind(),
                states = ?names,
                error = %e,
                "failed to persist states; changes dropped until next write"
            );
            e
        })
    }
}

/// Forwards tracked changes of one state to the coalescer.
struct StateListener {
    name: StateName,
    coalescer: Weak<Coalescer>,
}

impl ChangeListener for StateListener {
    fn on_change(&self, change: Change) {
        tracing::trace!(state = %self.name, path = %change.path, "state changed");
        match self.coalescer.upgrade() {
            Some(coalescer) => coalescer.record(self.name.clone(), change.property, change.value),
            None => tracing::warn!(
                state = %self.name,
                path = %change.path,
                "state changed after its store was dropped; not persisted"
            ),
        }
    }
}

/// Entry point for plugins: hands out synchronized state handles.
///
/// Provides:
/// - Writable handles whose changes are persisted within one flush window
/// - Read-only replicas following the stored document
/// - Usage counters logged on a fixed interval
pub struct StateStore {
    backend: Arc<dyn Backend>,
    states: Registry,
    coalescer: Arc<Coalescer>,
    usage: Arc<UsageMeter>,
    reporter: Mutex<UsageReporter>,
    subscription_buffer: usize,
    closed: AtomicBool,
}

impl StateStore {
    /// Open a store with the configured backend.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let usage = Arc::new(UsageMeter::new());

        let backend: Arc<dyn Backend> = match config.backend {
            BackendConfig::File { dir } => Arc::new(FileBackend::open(dir, Arc::clone(&usage))?),
            BackendConfig::Remote(store) => {
                Arc::new(TransactionalBackend::new(store, Arc::clone(&usage)))
            }
        };

        let states: Registry = Arc::new(RwLock::new(HashMap::new()));
        let persister = Arc::new(Persister {
            backend: Arc::clone(&backend),
            states: Arc::clone(&states),
        });
        let coalescer = Arc::new(Coalescer::start(config.flush_interval, persister)?);
        let reporter = UsageReporter::spawn(Arc::clone(&usage), config.usage_report_interval);

        tracing::debug!(
            backend = backend.kind(),
            flush_ms = config.flush_interval.as_millis() as u64,
            "state store opened"
        );

        Ok(Self {
            backend,
            states,
            coalescer,
            usage,
            reporter: Mutex::new(reporter),
            subscription_buffer: config.subscription_buffer,
            closed: AtomicBool::new(false),
        })
    }

    /// Load (or create) a state and return its live handle.
    ///
    /// Stored values override `defaults`; keys only in `defaults` are kept.
    /// Each name can be initialized once per store.
    pub fn init<T: Serialize + ?Sized>(&self, name: &str, defaults: &T) -> Result<StateHandle> {
        self.ensure_open()?;
        let name = StateName::new(name)?;
        let defaults = defaults_to_document(&name, defaults)?;

        if self.states.read().contains_key(&name) {
            return Err(StoreError::StateExists(name.to_string()));
        }

        let document = self.backend.bootstrap(&name, &defaults)?;

        let mut states = self.states.write();
        if states.contains_key(&name) {
            return Err(StoreError::StateExists(name.to_string()));
        }

        let listener = Arc::new(StateListener {
            name: name.clone(),
            coalescer: Arc::downgrade(&self.coalescer),
        });
        let handle = StateHandle::new(name.clone(), document, listener);
        states.insert(name, handle.clone());

        Ok(handle)
    }

    /// Load a state as a read-only replica that follows the stored document.
    pub fn init_readonly<T: Serialize + ?Sized>(&self, name: &str, defaults: &T) -> Result<Replica> {
        self.ensure_open()?;
        let name = StateName::new(name)?;
        let defaults = defaults_to_document(&name, defaults)?;

        Replica::start(
            Arc::clone(&self.backend),
            name,
            &defaults,
            SubscriptionConfig {
                buffer_size: self.subscription_buffer,
                ..Default::default()
            },
        )
    }

    /// Handle of an already initialized state.
    pub fn get(&self, name: &str) -> Option<StateHandle> {
        let name = StateName::new(name).ok()?;
        self.states.read().get(&name).cloned()
    }

    /// Persist all pending changes now instead of waiting for the window.
    pub fn flush(&self) -> Result<()> {
        self.coalescer.flush_now()
    }

    /// Mutations waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.coalescer.pending_len()
    }

    pub fn usage(&self) -> &Arc<UsageMeter> {
        &self.usage
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Flush pending changes and stop background threads.
    ///
    /// Handles keep working as in-memory objects afterwards, but their
    /// changes are no longer persisted.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.coalescer.shutdown();
        self.reporter.lock().stop();
        tracing::debug!(backend = self.backend.kind(), "state store closed");
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "final flush on drop failed");
        }
    }
}
