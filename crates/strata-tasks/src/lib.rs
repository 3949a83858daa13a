//! strata tasks - deterministic incremental execution engine
//!
//! This crate hashes task graphs, runs them depth by depth on a bounded
//! worker pool, replays results from a content-addressed cache and resumes
//! interrupted runs from checkpoints.

pub mod atomic;
pub mod cache;
pub mod cancel;
pub mod checkpoint;
pub mod dag;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hash;
pub mod invalidation;
pub mod plan;
pub mod reporter;
pub mod result;
pub mod scheduler;
pub mod task;
pub mod trace;

pub use cache::{CacheEntry, CacheStats, PruneStats, TaskCache};
pub use cancel::CancelSignal;
pub use checkpoint::{ResumeBlocker, RunRecord, RunStatus, RunStore};
pub use dag::{DagError, NodeIndex, TaskGraph, TaskNode};
pub use engine::{Engine, PlanPreview, RunOutcome, RunRequest};
pub use error::EngineError;
pub use hash::{GraphHash, TaskHash};
pub use invalidation::InvalidationReason;
pub use plan::{Decision, IncrementalPlan};
pub use reporter::{CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use result::{GraphResult, LogEntry};
pub use scheduler::{SchedulerOptions, TaskScheduler};
pub use task::{ExecutionState, TaskId};
pub use trace::{Trace, TraceEvent};
