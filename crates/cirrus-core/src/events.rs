//! In-process status event bus
//!
//! Every file-status transition is published here as a `(path, status)`
//! event. The D-Bus service relays the stream to desktop integrations; the
//! xattr surface remains as a fallback when no subscriber is attached.
//! Events for a single inode are totally ordered and form a prefix of a
//! valid path through the status machine.

use tokio::sync::broadcast;

use crate::domain::{FileStatus, ItemId};

/// Default ring capacity for status subscribers.
const BUS_CAPACITY: usize = 1024;

/// A single published status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Inode the transition belongs to
    pub id: ItemId,
    /// Mount-relative path at publication time
    pub path: String,
    /// The new status
    pub status: FileStatus,
}

/// Publish/subscribe fan-out of status events
///
/// Cloning the bus is cheap; all clones share one channel. Publishing never
/// blocks and never fails: with no subscribers the event is dropped, and a
/// slow subscriber observes a lag error on its receiver, not backpressure
/// on the publisher.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    /// Creates a bus with the default capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes a transition.
    pub fn publish(&self, id: ItemId, path: impl Into<String>, status: FileStatus) {
        let event = StatusEvent {
            id,
            path: path.into(),
            status,
        };
        tracing::debug!(id = %event.id, path = %event.path, status = %event.status, "status");
        let _ = self.tx.send(event);
    }

    /// Subscribes to the event stream from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
