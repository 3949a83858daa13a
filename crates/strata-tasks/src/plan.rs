//! Incremental plan: what happens to each node in this run
//!
//! Resuming a checkpoint wins over a cache hit, which wins over execution.
//! Invalidation reasons ride along for display; they never change a
//! decision on their own.

use std::fmt;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::cache::{CacheError, StoredEntry, TaskCache};
use crate::checkpoint::{ResumeDecision, ResumePoint};
use crate::dag::{NodeIndex, TaskGraph};
use crate::hash::{GraphHashes, TaskHash};
use crate::invalidation::{InvalidationReason, InvalidationReport};
use crate::task::TaskId;

/// What the scheduler does with a node
#[derive(Debug, Clone)]
pub enum Decision {
    /// Run the command
    Execute,
    /// Replay a cache entry
    ReuseCache(StoredEntry),
    /// Carry the node over from the prior run's checkpoint
    Resume(ResumePoint),
}

impl Decision {
    /// Short label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::ReuseCache(_) => "replay",
            Self::Resume(_) => "resume",
        }
    }

    /// Cache entry the decision relies on
    pub fn entry(&self) -> Option<&StoredEntry> {
        match self {
            Self::Execute => None,
            Self::ReuseCache(entry) => Some(entry),
            Self::Resume(point) => Some(&point.entry),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry() {
            Some(stored) if stored.entry.exit_code != 0 => {
                write!(f, "{} (exit {})", self.label(), stored.entry.exit_code)
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// One node of the plan
#[derive(Debug, Clone)]
pub struct PlannedTask {
    /// Node index
    pub index: NodeIndex,
    /// Task name
    pub id: TaskId,
    /// Topological depth
    pub depth: usize,
    /// Current task hash
    pub task_hash: TaskHash,
    /// What the scheduler will do
    pub decision: Decision,
    /// Why the prior result no longer applies
    pub reasons: Vec<InvalidationReason>,
}

/// Decisions for every node, indexed by node
#[derive(Debug, Clone)]
pub struct IncrementalPlan {
    tasks: Vec<PlannedTask>,
    resumed_from: Option<String>,
}

impl IncrementalPlan {
    /// Planned node
    pub fn task(&self, idx: NodeIndex) -> &PlannedTask {
        &self.tasks[idx.index()]
    }

    /// Planned nodes in canonical order
    pub fn tasks_in_order<'a>(&'a self, graph: &'a TaskGraph) -> impl Iterator<Item = &'a PlannedTask> + 'a {
        graph.canonical_order().iter().map(move |idx| self.task(*idx))
    }

    /// Run whose checkpoints are resumed
    pub fn resumed_from(&self) -> Option<&str> {
        self.resumed_from.as_deref()
    }

    /// Number of nodes with the given decision label
    pub fn count(&self, label: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.decision.label() == label)
            .count()
    }
}

/// Machine-readable view of one planned node
#[derive(Debug, Clone, Serialize)]
pub struct PlanRow {
    pub task: TaskId,
    pub depth: usize,
    pub task_hash: TaskHash,
    pub decision: String,
    pub reasons: Vec<InvalidationReason>,
}

impl From<&PlannedTask> for PlanRow {
    fn from(task: &PlannedTask) -> Self {
        Self {
            task: task.id.clone(),
            depth: task.depth,
            task_hash: task.task_hash.clone(),
            decision: task.decision.to_string(),
            reasons: task.reasons.clone(),
        }
    }
}

/// Decide, per node, between resuming, replaying and executing
#[instrument(skip_all, fields(tasks = graph.len()))]
pub fn build_plan(
    graph: &TaskGraph,
    hashes: &GraphHashes,
    invalidation: &InvalidationReport,
    resume: &ResumeDecision,
    cache: &TaskCache,
) -> Result<IncrementalPlan, CacheError> {
    let mut tasks = Vec::with_capacity(graph.len());
    for idx in graph.indices() {
        let node = graph.node(idx);
        let task_hash = hashes.task_hash(idx).clone();
        let decision = match resume.point(idx) {
            Some(point) => Decision::Resume(point.clone()),
            None => match cache.get(&task_hash)? {
                Some(entry) => Decision::ReuseCache(entry),
                None => Decision::Execute,
            },
        };
        debug!(task = %node.id, decision = decision.label(), "planned");
        tasks.push(PlannedTask {
            index: idx,
            id: node.id.clone(),
            depth: node.depth,
            task_hash,
            decision,
            reasons: invalidation.reasons(idx).to_vec(),
        });
    }
    Ok(IncrementalPlan {
        tasks,
        resumed_from: resume.resumed_from().map(str::to_string),
    })
}
