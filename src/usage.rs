//! Backend usage metering.
//!
//! Counts backend operations per state name under keys of the form
//! `state_<name>_<operation>`. The counters are diagnostic only: they are
//! logged and reset on a fixed interval and never persisted.

use crate::types::UsageOperation;
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// In-memory operation counters.
#[derive(Debug, Default)]
pub struct UsageMeter {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, state: &str, operation: UsageOperation) {
        let key = format!("state_{}_{}", state, operation);
        *self.counters.lock().entry(key).or_insert(0) += 1;
    }

    /// Current count for one key without resetting.
    pub fn count(&self, state: &str, operation: UsageOperation) -> u64 {
        let key = format!("state_{}_{}", state, operation);
        self.counters.lock().get(&key).copied().unwrap_or(0)
    }

    /// Take all counters, leaving the meter empty.
    pub fn drain(&self) -> BTreeMap<String, u64> {
        std::mem::take(&mut *self.counters.lock())
    }

    /// Log all counters and reset them.
    pub fn report(&self) -> BTreeMap<String, u64> {
        let counters = self.drain();
        tracing::info!(usage = ?counters, "state usage");
        counters
    }
}

/// Background thread calling [`UsageMeter::report`] on a fixed interval.
pub struct UsageReporter {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl UsageReporter {
    pub fn spawn(meter: Arc<UsageMeter>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let thread = thread::Builder::new()
            .name("statesync-usage".into())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        meter.report();
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            })
            .ok();

        if thread.is_none() {
            tracing::warn!("failed to spawn usage reporter thread; usage will not be logged");
        }

        Self {
            shutdown: Some(shutdown_tx),
            thread,
        }
    }

    /// Stop the reporter. Counters are left in place.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UsageReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
