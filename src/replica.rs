//! Read-only replicas.
//!
//! A replica subscribes to a state's change notifications, loads the
//! current document merged over its defaults, and then overwrites its
//! top-level fields in place with every newer snapshot that arrives.

use crate::backend::Backend;
use crate::error::Result;
use crate::subscriptions::{DropReason, StoreEvent, SubscriptionConfig, SubscriptionHandle};
use crate::tracker::ReadOnlyHandle;
use crate::types::{merge_over_defaults, Document, Sequence, StateName};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pause before resubscribing after a lost subscription.
const RESYNC_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Applied {
    sequence: Mutex<Sequence>,
    changed: Condvar,
}

/// A read-only view of a state kept in sync with the backend.
///
/// Dereferences to [`ReadOnlyHandle`]. Dropping the replica stops updates.
pub struct Replica {
    handle: ReadOnlyHandle,
    applied: Arc<Applied>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Replica {
    pub(crate) fn start(
        backend: Arc<dyn Backend>,
        name: StateName,
        defaults: &Document,
        config: SubscriptionConfig,
    ) -> Result<Self> {
        // Subscribe before loading so no write between the two is missed.
        let subscription = backend.subscribe(&name, config.clone());
        let stored = match backend.fetch(&name) {
            Ok(stored) => stored,
            Err(e) => {
                backend.unsubscribe(subscription.id);
                return Err(e);
            }
        };

        let handle = ReadOnlyHandle::new(name, merge_over_defaults(defaults, stored));
        let applied = Arc::new(Applied::default());
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let follower = Follower {
            backend,
            handle: handle.clone(),
            applied: Arc::clone(&applied),
            config,
        };
        let thread = thread::Builder::new()
            .name(format!("statesync-replica-{}", handle.name()))
            .spawn(move || follower.run(subscription, shutdown_rx))?;

        Ok(Self {
            handle,
            applied,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Latest document sequence applied to this replica.
    pub fn sequence(&self) -> Sequence {
        *self.applied.sequence.lock()
    }

    /// Block until a snapshot at or after `sequence` has been applied.
    /// Returns false on timeout.
    pub fn wait_for_sequence(&self, sequence: Sequence, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut applied = self.applied.sequence.lock();
        while *applied < sequence {
            if self
                .applied
                .changed
                .wait_until(&mut applied, deadline)
                .timed_out()
            {
                return *applied >= sequence;
            }
        }
        true
    }

    pub fn handle(&self) -> &ReadOnlyHandle {
        &self.handle
    }
}

impl Deref for Replica {
    type Target = ReadOnlyHandle;

    fn deref(&self) -> &ReadOnlyHandle {
        &self.handle
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Follower {
    backend: Arc<dyn Backend>,
    handle: ReadOnlyHandle,
    applied: Arc<Applied>,
    config: SubscriptionConfig,
}

impl Follower {
    fn run(self, mut subscription: SubscriptionHandle, shutdown: Receiver<()>) {
        loop {
            let event = select! {
                recv(subscription.receiver) -> event => event,
                recv(shutdown) -> _ => break,
            };

            match event {
                Ok(StoreEvent::StateSnapshot { data, sequence, .. }) => self.apply(data, sequence),
                Ok(StoreEvent::Dropped {
                    reason: DropReason::Unsubscribed,
                }) => {
                    tracing::debug!(state = %self.handle.name(), "replica unsubscribed");
                    return;
                }
                Ok(StoreEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                }) => {
                    tracing::warn!(state = %self.handle.name(), "replica fell behind; resyncing");
                    subscription = self.resync();
                }
                Err(_) => {
                    // Overflow can disconnect us before the drop notice fits in the buffer.
                    tracing::warn!(state = %self.handle.name(), "replica subscription lost; resyncing");
                    thread::sleep(RESYNC_BACKOFF);
                    subscription = self.resync();
                }
            }
        }

        self.backend.unsubscribe(subscription.id);
    }

    fn apply(&self, data: Document, sequence: Sequence) {
        let mut applied = self.applied.sequence.lock();
        if sequence <= *applied {
            tracing::trace!(state = %self.handle.name(), ?sequence, "ignoring stale snapshot");
            return;
        }
        self.handle.assign(data);
        *applied = sequence;
        self.applied.changed.notify_all();
    }

    fn resync(&self) -> SubscriptionHandle {
        let subscription = self.backend.subscribe(self.handle.name(), self.config.clone());
        match self.backend.fetch(self.handle.name()) {
            Ok(Some(document)) => self.handle.assign(document),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(state = %self.handle.name(), error = %e, "replica resync failed")
            }
        }
        subscription
    }
}
