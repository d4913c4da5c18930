use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::SessionId;

/// Capacity of the output fan-out. A subscriber more than this many chunks
/// behind starts losing output (`RecvError::Lagged`) instead of stalling
/// the PTY readers.
pub const OUTPUT_CAPACITY: usize = 1024;

const EVENT_CAPACITY: usize = 64;

/// A chunk of raw output from one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub id: SessionId,
    pub data: Bytes,
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Created { id: SessionId },
    Exited { id: SessionId },
}

/// Fan-out of session output and lifecycle events to external consumers.
///
/// Publishing never blocks: with no subscribers the event is dropped, and
/// slow subscribers lag rather than applying backpressure.
#[derive(Clone)]
pub struct Broker {
    output_tx: broadcast::Sender<OutputEvent>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Broker {
    pub fn new() -> Self {
        let (output_tx, _) = broadcast::channel(OUTPUT_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            output_tx,
            events_tx,
        }
    }

    pub fn publish_output(&self, id: SessionId, data: Bytes) {
        // Ignore error - means no receivers
        let _ = self.output_tx.send(OutputEvent { id, data });
    }

    pub fn publish_event(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputEvent> {
        self.output_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
