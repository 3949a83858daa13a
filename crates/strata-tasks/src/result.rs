//! Aggregate outcome of executing a graph

use std::collections::BTreeMap;

use serde::Serialize;

use crate::task::{ExecutionState, TaskId};

/// One node's entry in the run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Task name
    pub task: TaskId,
    /// Topological depth
    pub depth: usize,
    /// Final state
    pub state: ExecutionState,
    /// Exit code, when the command ran or was replayed
    pub exit_code: Option<i32>,
    /// Captured stdout (lossy UTF-8)
    pub stdout: String,
    /// Captured stderr (lossy UTF-8)
    pub stderr: String,
    /// Why the node did not produce a result normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Result of one execution of a task graph.
///
/// The log is ordered by (depth, name), never by completion time, so two
/// executions of the same graph compare equal regardless of worker count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphResult {
    /// Final state of every node
    pub states: BTreeMap<TaskId, ExecutionState>,
    /// Artifact paths produced or replayed by each successful node
    pub artifacts: BTreeMap<TaskId, Vec<String>>,
    /// Whether every node completed or was cached
    pub success: bool,
    /// Terminal nodes in canonical order
    pub log: Vec<LogEntry>,
}

impl GraphResult {
    /// State of one node
    pub fn state(&self, task: &str) -> Option<ExecutionState> {
        self.states.get(&TaskId::new(task)).copied()
    }

    /// Log entry of one node
    pub fn entry(&self, task: &str) -> Option<&LogEntry> {
        self.log.iter().find(|e| e.task.as_str() == task)
    }

    /// Every artifact path, sorted
    pub fn artifact_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .artifacts
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        paths.sort_unstable();
        paths.dedup();
        paths
    }

    /// Number of nodes in a given state
    pub fn count(&self, state: ExecutionState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    /// Number of nodes that never reached a terminal state
    pub fn pending(&self) -> usize {
        self.count(ExecutionState::Pending)
    }
}
