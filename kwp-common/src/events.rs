//! Progress events and the broadcast event bus
//!
//! The engine emits events while a batch runs; the CLI logs them and the
//! HTTP service can forward them. Nobody listening is a normal state, so
//! [`EventBus::emit_lossy`] never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted while a tagging batch runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaggingEvent {
    /// Batch accepted and validated
    BatchStarted {
        batch_id: Uuid,
        photo_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Cluster Builder finished
    ClustersBuilt {
        batch_id: Uuid,
        cluster_count: usize,
        unclustered: usize,
    },

    /// One analysis request produced a response
    RequestCompleted {
        batch_id: Uuid,
        /// Photo id or cluster id
        target: String,
        kind: String,
        attempts: u32,
        elapsed_ms: u64,
    },

    /// One analysis request gave up after retries (or was cancelled)
    RequestDegraded {
        batch_id: Uuid,
        target: String,
        kind: String,
        reason: String,
    },

    /// Merge engine produced the final tag set for one photo
    PhotoFinalized {
        batch_id: Uuid,
        photo_id: String,
        status: String,
        tag_count: usize,
    },

    /// Every photo has an outcome
    BatchCompleted {
        batch_id: Uuid,
        complete: usize,
        degraded: usize,
        empty: usize,
        error: usize,
        elapsed_ms: u64,
    },

    /// Cancellation was observed; remaining requests were not issued
    BatchCancelled { batch_id: Uuid },
}

/// Broadcast bus for [`TaggingEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaggingEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before slow receivers lag
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<TaggingEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TaggingEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
