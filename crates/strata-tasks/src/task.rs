//! Task identity and execution state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a task within a graph
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new task ID
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Task name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Execution state of a single node.
///
/// Exactly one state holds per node at any instant. `Cached` is
/// observationally equivalent to `Completed` for downstream tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Not started yet
    #[default]
    Pending,
    /// Dispatched to a worker
    Running,
    /// Ran to completion with exit code 0
    Completed,
    /// Ran (or replayed) with a non-zero exit code, or could not be run
    Failed,
    /// Not run because a dependency did not succeed
    Skipped,
    /// Successful result replayed from the cache
    Cached,
}

impl ExecutionState {
    /// Whether dependents may start
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Cached)
    }

    /// Whether the node reached a final state for this run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Upper-case name used in logs and hook contexts
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Cached => "CACHED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
