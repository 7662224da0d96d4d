//! Persistence notifications for [`crate::TtlStore`]
//!
//! Loads and flushes happen lazily or on a timer, so callers that care
//! (the CLI `purge`, tests) listen here instead of polling `stats()`.

use std::path::PathBuf;
use tokio::sync::broadcast;

/// Persistence events emitted by a [`crate::TtlStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Lazy load finished; `entries` were accepted from disk, `expired`
    /// stale ones were skipped
    Loaded { entries: usize, expired: usize },
    /// Lazy load failed; the store continues with an empty persisted map
    LoadFailed(String),
    /// Persisted map written to `path`
    Flushed { path: PathBuf, entries: usize },
    /// Write failed; the in-memory state is untouched
    FlushFailed(String),
}

/// Fan-out of [`StoreEvent`]s to every store subscriber.
///
/// Slow receivers lag and lose the oldest events once `capacity` is exceeded.
pub(crate) struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn publish(&self, event: StoreEvent) {
        // No receivers is the common case for the CLI
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }
}
