//! Cancellation fan-out keyed by job id.
//!
//! Every pipeline subscribes for its job id; whoever receives a cancel
//! request calls [`CancellationBroadcaster::broadcast`], which hands the
//! command to each current subscriber exactly once and forgets the id.
//!
//! ```rust
//! use buildworker_core::{CancellationBroadcaster, CancellationCommand};
//!
//! let broadcaster = CancellationBroadcaster::new();
//! let mut sub = broadcaster.subscribe(42);
//! broadcaster.broadcast(CancellationCommand::new(42, "user request"));
//! assert_eq!(sub.try_recv().map(|c| c.reason), Some("user request".to_string()));
//! assert!(sub.try_recv().is_none());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Request to abort a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationCommand {
    pub job_id: u64,
    pub reason: String,
}

impl CancellationCommand {
    #[must_use]
    pub fn new(job_id: u64, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<CancellationCommand>,
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: Mutex<HashMap<u64, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Registry of cancellation subscribers, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct CancellationBroadcaster {
    registry: Arc<Registry>,
}

impl CancellationBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber for `job_id`.
    #[must_use]
    pub fn subscribe(&self, job_id: u64) -> CancellationSubscription {
        let (tx, rx) = mpsc::channel(1);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .subscribers
            .lock()
            .entry(job_id)
            .or_default()
            .push(Subscriber { id, tx });

        CancellationSubscription { job_id, id, rx }
    }

    /// Removes `subscription` from the registry. Unknown subscriptions are ignored.
    pub fn unsubscribe(&self, subscription: &CancellationSubscription) {
        let mut subscribers = self.registry.subscribers.lock();
        let Some(slot) = subscribers.get_mut(&subscription.job_id) else {
            return;
        };

        if let Some(pos) = slot.iter().position(|s| s.id == subscription.id) {
            slot.swap_remove(pos);
        }
        if slot.is_empty() {
            subscribers.remove(&subscription.job_id);
        }
    }

    /// Delivers `command` to every subscriber of its job id and closes
    /// their channels. Returns the number of subscribers reached.
    pub fn broadcast(&self, command: CancellationCommand) -> usize {
        let mut subscribers = self.registry.subscribers.lock();
        let Some(slot) = subscribers.remove(&command.job_id) else {
            return 0;
        };

        let count = slot.len();
        for subscriber in slot {
            // Fresh capacity-1 channel, never full.
            if subscriber.tx.try_send(command.clone()).is_err() {
                tracing::debug!(job_id = command.job_id, "cancellation subscriber already gone");
            }
        }
        drop(subscribers);

        tracing::info!(job_id = command.job_id, subscribers = count, reason = %command.reason, "broadcast cancellation");
        count
    }

    /// Number of live subscribers for `job_id`.
    #[must_use]
    pub fn subscriber_count(&self, job_id: u64) -> usize {
        self.registry
            .subscribers
            .lock()
            .get(&job_id)
            .map_or(0, Vec::len)
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct CancellationSubscription {
    job_id: u64,
    id: u64,
    rx: mpsc::Receiver<CancellationCommand>,
}

impl CancellationSubscription {
    #[must_use]
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Returns a pending command without waiting.
    pub fn try_recv(&mut self) -> Option<CancellationCommand> {
        self.rx.try_recv().ok()
    }

    /// Waits for a command. Returns `None` once the channel closed empty.
    pub async fn recv(&mut self) -> Option<CancellationCommand> {
        self.rx.recv().await
    }
}
