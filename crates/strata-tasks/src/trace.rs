//! Execution trace
//!
//! The trace records one event per node that reached a terminal state. It is
//! inert: nothing in the engine reads it back to make decisions except
//! checkpoint validation, which only checks that an event is intact.

use serde::{Deserialize, Serialize};

use crate::hash::{digest_bytes, TaskHash};
use crate::task::{ExecutionState, TaskId};

/// One terminal state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Index of the node in canonical (depth, name) order
    pub position: usize,
    /// Task name
    pub task: TaskId,
    /// Terminal state
    pub state: ExecutionState,
    /// Task hash at the time of execution
    pub task_hash: TaskHash,
    /// Exit code when the task ran or replayed
    pub exit_code: Option<i32>,
    /// Digest of the cache entry file backing this result
    pub cache_ref: Option<String>,
    /// Whether the result was carried over from a prior run
    #[serde(default)]
    pub resumed: bool,
}

impl TraceEvent {
    /// Digest of the canonical JSON encoding
    pub fn digest(&self) -> String {
        // Serializing a plain struct of strings and integers cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        digest_bytes(&bytes)
    }
}

/// Ordered trace for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    /// Empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event; the trace stays sorted by position
    pub fn record(&mut self, event: TraceEvent) {
        let at = self
            .events
            .partition_point(|e| e.position <= event.position);
        self.events.insert(at, event);
    }

    /// Events in canonical order
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the trace is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Digest over every event
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.events).unwrap_or_default();
        digest_bytes(&bytes)
    }
}
