//! Write coalescing.
//!
//! Mutations are appended to a shared pending list. The first mutation
//! after an idle period arms a flush one window later; mutations arriving
//! while a flush is armed ride along with it. When the window elapses the
//! flusher thread drains the list, keeps the latest value per property and
//! hands one batch to the sink. Flushes run one at a time on that thread,
//! so batches for a state reach the backend in the order they were armed.

use crate::error::{Result, StoreError};
use crate::types::{Document, PendingMutation, StateName};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pending changes grouped by state, latest value per property.
pub type Batch = BTreeMap<StateName, Document>;

/// Destination of coalesced batches.
pub trait FlushSink: Send + Sync {
    fn flush(&self, batch: Batch) -> Result<()>;
}

enum Command {
    /// A window was armed; flush when it elapses.
    Arm(Instant),
    /// Flush now and report the result.
    FlushNow(Sender<Result<()>>),
}

struct Shared {
    pending: Mutex<Vec<PendingMutation>>,
    armed: AtomicBool,
}

impl Shared {
    /// Swap the pending list out and group it.
    fn drain(&self) -> Batch {
        let pending = std::mem::take(&mut *self.pending.lock());
        group(pending)
    }
}

/// Group mutations by state; later writes to a property replace earlier ones.
pub fn group(pending: Vec<PendingMutation>) -> Batch {
    let mut batch = Batch::new();
    for mutation in pending {
        batch
            .entry(mutation.state)
            .or_default()
            .insert(mutation.property, mutation.value);
    }
    batch
}

/// Trailing-edge debounced writer.
pub struct Coalescer {
    shared: Arc<Shared>,
    window: Duration,
    commands: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed_warned: AtomicBool,
}

impl Coalescer {
    /// Start the flusher thread. Batches go to `sink` at most once per `window`.
    pub fn start(window: Duration, sink: Arc<dyn FlushSink>) -> Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Vec::new()),
            armed: AtomicBool::new(false),
        });
        let (tx, rx) = unbounded();

        let thread = thread::Builder::new()
            .name("statesync-flush".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_flusher(shared, rx, sink)
            })?;

        Ok(Self {
            shared,
            window,
            commands: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            closed_warned: AtomicBool::new(false),
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Queue a mutation and arm a flush if none is armed.
    ///
    /// After shutdown the mutation is dropped.
    pub fn record(&self, state: StateName, property: String, value: Value) {
        let commands = self.commands.lock();
        let Some(tx) = commands.as_ref() else {
            if !self.closed_warned.swap(true, Ordering::AcqRel) {
                tracing::warn!("mutations recorded after the store was closed are not persisted");
            }
            return;
        };

        self.shared.pending.lock().push(PendingMutation {
            state,
            property,
            value,
        });

        if self.shared.armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let deadline = Instant::now() + self.window;
        if tx.send(Command::Arm(deadline)).is_ok() {
            tracing::trace!(window_ms = self.window.as_millis() as u64, "flush armed");
        } else {
            self.shared.armed.store(false, Ordering::Release);
        }
    }

    /// Number of mutations waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::Acquire)
    }

    /// Flush everything pending now, on the flusher thread, and wait for it.
    pub fn flush_now(&self) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        {
            let commands = self.commands.lock();
            let tx = commands.as_ref().ok_or(StoreError::Closed)?;
            tx.send(Command::FlushNow(reply_tx))
                .map_err(|_| StoreError::Closed)?;
        }
        reply_rx.recv().map_err(|_| StoreError::Closed)?
    }

    /// Flush what is pending, then stop the flusher thread.
    pub fn shutdown(&self) -> Result<()> {
        let result = match self.flush_now() {
            Err(StoreError::Closed) => Ok(()),
            other => other,
        };

        // Disconnecting the channel ends the flusher loop.
        self.commands.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }

        result
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "final flush failed");
        }
    }
}

fn run_flusher(shared: Arc<Shared>, commands: Receiver<Command>, sink: Arc<dyn FlushSink>) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => match commands.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(Command::Arm(at)) => {
                // A window is only armed while none is, so keep the earliest.
                deadline = Some(deadline.map_or(at, |d| d.min(at)));
            }
            Some(Command::FlushNow(reply)) => {
                deadline = None;
                let _ = reply.send(flush(&shared, sink.as_ref()));
            }
            None => {
                deadline = None;
                if let Err(e) = flush(&shared, sink.as_ref()) {
                    tracing::error!(error = %e, "flush failed; batch dropped");
                }
            }
        }
    }

    // Catch mutations recorded between the shutdown flush and disconnect.
    if let Err(e) = flush(&shared, sink.as_ref()) {
        tracing::error!(error = %e, "final flush failed; batch dropped");
    }
}

fn flush(shared: &Shared, sink: &dyn FlushSink) -> Result<()> {
    // Clear the flag before draining so a mutation racing with the drain
    // arms the next window instead of being left behind.
    shared.armed.store(false, Ordering::Release);
    let batch = shared.drain();
    if batch.is_empty() {
        return Ok(());
    }

    tracing::debug!(
        states = batch.len(),
        properties = batch.values().map(|d| d.len()).sum::<usize>(),
        "flushing"
    );
    sink.flush(batch)
}
