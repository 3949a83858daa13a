//! Task execution reporting
//!
//! Reporters observe a run; nothing they do feeds back into scheduling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::task::TaskId;

/// Events emitted during task execution
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A depth level is starting
    WaveStarted { depth: usize, task_count: usize },
    /// A task is starting execution
    Started { id: TaskId, command: String },
    /// A line of task output, emitted once the task has finished
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
    },
    /// A task finished with exit code 0
    Completed {
        id: TaskId,
        duration: Duration,
        cached: bool,
    },
    /// A task failed or replayed a cached failure
    Failed {
        id: TaskId,
        duration: Duration,
        error: String,
    },
    /// A task was not run because a dependency did not succeed
    Skipped { id: TaskId, reason: String },
    /// A task was interrupted and returned to pending
    Cancelled { id: TaskId },
    /// The run finished
    AllCompleted {
        total: usize,
        succeeded: usize,
        failed: usize,
        cached: usize,
        skipped: usize,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::WaveStarted { depth, task_count } => {
                tracing::info!("Starting depth {} ({} tasks)", depth, task_count);
            }
            TaskEvent::Started { id, command } => {
                tracing::info!("Starting {}: {}", id, command);
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if *is_stderr {
                    tracing::warn!("[{}] {}", id, line);
                } else {
                    tracing::debug!("[{}] {}", id, line);
                }
            }
            TaskEvent::Completed { id, duration, cached } => {
                if *cached {
                    tracing::info!("{} completed (cached) in {:.1}s", id, duration.as_secs_f64());
                } else {
                    tracing::info!("{} completed in {:.1}s", id, duration.as_secs_f64());
                }
            }
            TaskEvent::Failed { id, duration, error } => {
                tracing::error!("{} failed after {:.1}s: {}", id, duration.as_secs_f64(), error);
            }
            TaskEvent::Skipped { id, reason } => {
                tracing::info!("{} skipped: {}", id, reason);
            }
            TaskEvent::Cancelled { id } => {
                tracing::warn!("{} interrupted", id);
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                cached,
                skipped,
                duration,
            } => {
                tracing::info!(
                    "All tasks complete: {}/{} succeeded, {} failed, {} cached, {} skipped ({:.1}s)",
                    succeeded,
                    total,
                    failed,
                    cached,
                    skipped,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

impl<R: TaskReporter + ?Sized> TaskReporter for Arc<R> {
    fn report(&self, event: &TaskEvent) {
        (**self).report(event);
    }
}

/// Fans every event out to a set of reporters, in registration order
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    /// Registry that already logs through tracing
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
