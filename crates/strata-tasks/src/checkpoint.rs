//! Run records, checkpoints and resume eligibility
//!
//! Layout under the runs root:
//!
//! ```text
//! LATEST                       id of the most recently started run
//! <run id>/run.json            RunRecord
//! <run id>/snapshot.json       GraphSnapshot used by the next run
//! <run id>/checkpoints/<task>.json
//! ```
//!
//! A checkpoint embeds its trace event, the digest of that event and the
//! digest of the cache entry file it relies on. Validation recomputes both,
//! so a torn or stale checkpoint is simply ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{ExecutionMode, FailureClass};
use tracing::{debug, info, instrument, warn};

use crate::atomic::{write_atomic, write_json_atomic};
use crate::cache::{ArtifactRecord, CacheError, StoredEntry, TaskCache};
use crate::dag::{NodeIndex, TaskGraph};
use crate::hash::{digest_bytes, GraphHash, GraphHashes, TaskHash};
use crate::invalidation::{GraphSnapshot, InvalidationReport};
use crate::task::{ExecutionState, TaskId};
use crate::trace::TraceEvent;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, nothing dispatched
    New,
    /// Tasks are being executed
    Running,
    /// Every task succeeded
    Completed,
    /// At least one task failed or was skipped
    Failed,
    /// Cancelled or crashed before finishing
    Interrupted,
}

impl RunStatus {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent description of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier
    pub run_id: String,
    /// Graph hash the run executed
    pub graph_hash: GraphHash,
    /// Mode the run was started with
    pub mode: ExecutionMode,
    /// Current status
    pub status: RunStatus,
    /// Run whose checkpoints were resumed, if any
    #[serde(default)]
    pub resumed_from: Option<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// New record with a fresh run identifier
    pub fn new(graph_hash: GraphHash, mode: ExecutionMode) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            graph_hash,
            mode,
            status: RunStatus::New,
            resumed_from: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Mark the record finished
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Durable marker that one node finished successfully in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run that wrote the checkpoint
    pub run_id: String,
    /// Task name
    pub task: TaskId,
    /// Graph hash of that run
    pub graph_hash: GraphHash,
    /// Task hash the result belongs to
    pub task_hash: TaskHash,
    /// Terminal state (COMPLETED or CACHED)
    pub state: ExecutionState,
    /// Digest of the cache entry file
    pub cache_ref: String,
    /// Artifacts materialized into the output directory
    pub artifacts: Vec<ArtifactRecord>,
    /// Trace event for this node
    pub trace: TraceEvent,
    /// Digest of `trace`
    pub trace_digest: String,
}

impl Checkpoint {
    /// Build a checkpoint for a traced node backed by a cache entry
    pub fn new(run_id: &str, graph_hash: &GraphHash, trace: TraceEvent, entry: &StoredEntry) -> Self {
        let trace_digest = trace.digest();
        Self {
            run_id: run_id.to_string(),
            task: trace.task.clone(),
            graph_hash: graph_hash.clone(),
            task_hash: trace.task_hash.clone(),
            state: trace.state,
            cache_ref: entry.digest.clone(),
            artifacts: entry.entry.artifacts.clone(),
            trace,
            trace_digest,
        }
    }
}

/// Why a checkpoint cannot be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointInvalid {
    /// Written by another run or for another graph
    #[error("checkpoint belongs to a different run or graph")]
    Foreign,
    /// The embedded trace event does not match its digest
    #[error("trace entry digest mismatch")]
    TraceDigest,
    /// The trace event disagrees with the checkpoint fields
    #[error("trace entry inconsistent with checkpoint")]
    TraceInconsistent,
    /// Only successful nodes are checkpointed
    #[error("checkpoint does not record a successful node")]
    NotSuccessful,
    /// The cache entry is gone or fails verification
    #[error("cache entry missing or unverifiable")]
    MissingCacheEntry,
    /// The cache entry changed since the checkpoint was written
    #[error("cache entry digest mismatch")]
    CacheEntryMismatch,
}

/// Check that a checkpoint, its trace event and its cache entry agree
pub fn validate_checkpoint(
    checkpoint: &Checkpoint,
    run: &RunRecord,
    cache: &TaskCache,
) -> Result<StoredEntry, CheckpointInvalid> {
    if checkpoint.run_id != run.run_id || checkpoint.graph_hash != run.graph_hash {
        return Err(CheckpointInvalid::Foreign);
    }
    if checkpoint.trace.digest() != checkpoint.trace_digest {
        return Err(CheckpointInvalid::TraceDigest);
    }
    let trace = &checkpoint.trace;
    if trace.task != checkpoint.task
        || trace.task_hash != checkpoint.task_hash
        || trace.state != checkpoint.state
        || trace.cache_ref.as_deref() != Some(checkpoint.cache_ref.as_str())
    {
        return Err(CheckpointInvalid::TraceInconsistent);
    }
    if !checkpoint.state.is_success() || trace.exit_code != Some(0) {
        return Err(CheckpointInvalid::NotSuccessful);
    }

    let stored = match cache.get(&checkpoint.task_hash) {
        Ok(Some(stored)) => stored,
        _ => return Err(CheckpointInvalid::MissingCacheEntry),
    };
    if stored.digest != checkpoint.cache_ref || stored.entry.artifacts != checkpoint.artifacts {
        return Err(CheckpointInvalid::CacheEntryMismatch);
    }
    if stored.entry.exit_code != 0 {
        return Err(CheckpointInvalid::NotSuccessful);
    }
    Ok(stored)
}

/// A prior run found on disk
#[derive(Debug, Clone)]
pub struct PriorRun {
    /// Its record, with a stale `running` status read as `interrupted`
    pub record: RunRecord,
    /// Its graph snapshot, if one was written
    pub snapshot: Option<GraphSnapshot>,
}

/// Store for run records, snapshots and checkpoints
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Create a store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Runs root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    fn checkpoint_path(&self, run_id: &str, task: &TaskId) -> PathBuf {
        self.run_dir(run_id)
            .join("checkpoints")
            .join(format!("{}.json", task.as_str()))
    }

    /// Persist a new run: record (as running), snapshot and `LATEST`
    pub fn begin(&self, record: &mut RunRecord, snapshot: &GraphSnapshot) -> Result<(), CheckpointError> {
        record.status = RunStatus::Running;
        let dir = self.run_dir(&record.run_id);
        write_json_atomic(&dir.join("snapshot.json"), snapshot)?;
        write_json_atomic(&dir.join("run.json"), record)?;
        write_atomic(&self.root.join("LATEST"), record.run_id.as_bytes())?;
        info!(run_id = %record.run_id, "run started");
        Ok(())
    }

    /// Overwrite a run record
    pub fn update(&self, record: &RunRecord) -> Result<(), CheckpointError> {
        write_json_atomic(&self.run_dir(&record.run_id).join("run.json"), record)?;
        debug!(run_id = %record.run_id, status = %record.status, "run record updated");
        Ok(())
    }

    /// Identifier of the most recently started run
    pub fn latest(&self) -> Result<Option<String>, CheckpointError> {
        match fs::read_to_string(self.root.join("LATEST")) {
            Ok(id) => {
                let id = id.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a run record. A record still marked running belongs to a run
    /// that never finished and is reported as interrupted.
    pub fn load_record(&self, run_id: &str) -> Result<Option<RunRecord>, CheckpointError> {
        if !is_safe_id(run_id) {
            return Ok(None);
        }
        let path = self.run_dir(run_id).join("run.json");
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut record: RunRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(run_id, error = %e, "unreadable run record");
                return Ok(None);
            }
        };
        if matches!(record.status, RunStatus::Running | RunStatus::New) {
            record.status = RunStatus::Interrupted;
        }
        Ok(Some(record))
    }

    /// Load a run's graph snapshot
    pub fn load_snapshot(&self, run_id: &str) -> Result<Option<GraphSnapshot>, CheckpointError> {
        let path = self.run_dir(run_id).join("snapshot.json");
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the prior run: the explicit id if given, else `LATEST`
    pub fn resolve(&self, requested: Option<&str>) -> Result<Option<PriorRun>, CheckpointError> {
        let run_id = match requested {
            Some(id) => id.to_string(),
            None => match self.latest()? {
                Some(id) => id,
                None => return Ok(None),
            },
        };
        let record = match self.load_record(&run_id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let snapshot = self.load_snapshot(&run_id)?;
        Ok(Some(PriorRun { record, snapshot }))
    }

    /// Persist a checkpoint
    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        write_json_atomic(&self.checkpoint_path(&checkpoint.run_id, &checkpoint.task), checkpoint)?;
        debug!(run_id = %checkpoint.run_id, task = %checkpoint.task, "checkpoint written");
        Ok(())
    }

    /// Load every parseable checkpoint of a run, keyed by task.
    ///
    /// Files that fail to parse are torn writes and are skipped.
    pub fn load_checkpoints(&self, run_id: &str) -> Result<BTreeMap<TaskId, Checkpoint>, CheckpointError> {
        let dir = self.run_dir(run_id).join("checkpoints");
        let mut checkpoints = BTreeMap::new();
        if !dir.exists() {
            return Ok(checkpoints);
        }
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match serde_json::from_slice::<Checkpoint>(&fs::read(&path)?) {
                Ok(cp) => {
                    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
                    if stem.as_deref() == Some(cp.task.as_str()) {
                        checkpoints.insert(cp.task.clone(), cp);
                    }
                }
                Err(e) => debug!(path = %path.display(), error = %e, "ignoring torn checkpoint"),
            }
        }
        Ok(checkpoints)
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Why a run starts from scratch instead of resuming
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResumeBlocker {
    /// Clean mode ignores checkpoints
    #[error("checkpoints are ignored in clean mode")]
    Disabled,
    /// No run has been recorded yet
    #[error("no prior run to resume")]
    NoPriorRun,
    /// An explicitly requested run does not exist
    #[error("prior run '{0}' not found")]
    PriorRunNotFound(String),
    /// The graph changed since the prior run
    #[error("graph hash changed since run {run_id} ({prior} -> {current})")]
    GraphHashMismatch {
        run_id: String,
        prior: String,
        current: String,
    },
    /// The output directory was modified behind the engine's back
    #[error("workspace failed validation: {0}")]
    Workspace(String),
    /// The prior run holds no usable checkpoint
    #[error("prior run '{0}' has no valid checkpoints")]
    NothingToResume(String),
}

impl ResumeBlocker {
    /// Failure class when resume was mandatory
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::GraphHashMismatch { .. } => FailureClass::Graph,
            Self::Workspace(_) => FailureClass::Workspace,
            Self::Disabled | Self::NoPriorRun | Self::PriorRunNotFound(_) | Self::NothingToResume(_) => {
                FailureClass::Invocation
            }
        }
    }
}

/// A node carried over from a prior run
#[derive(Debug, Clone)]
pub struct ResumePoint {
    /// The validated checkpoint
    pub checkpoint: Checkpoint,
    /// The cache entry it references
    pub entry: StoredEntry,
}

/// Outcome of resume evaluation
#[derive(Debug, Clone)]
pub enum ResumeDecision {
    /// Carry the listed nodes over from `run_id`
    Resume {
        run_id: String,
        nodes: BTreeMap<NodeIndex, ResumePoint>,
    },
    /// Start from scratch
    Restart(ResumeBlocker),
}

impl ResumeDecision {
    /// Resume point for a node, if any
    pub fn point(&self, idx: NodeIndex) -> Option<&ResumePoint> {
        match self {
            Self::Resume { nodes, .. } => nodes.get(&idx),
            Self::Restart(_) => None,
        }
    }

    /// Run being resumed
    pub fn resumed_from(&self) -> Option<&str> {
        match self {
            Self::Resume { run_id, .. } => Some(run_id),
            Self::Restart(_) => None,
        }
    }
}

/// Inputs to resume evaluation
pub struct ResumeContext<'a> {
    /// Requested mode
    pub mode: ExecutionMode,
    /// Explicitly requested prior run
    pub requested: Option<&'a str>,
    /// Resolved prior run
    pub prior: Option<&'a PriorRun>,
    /// Current graph
    pub graph: &'a TaskGraph,
    /// Current hashes
    pub hashes: &'a GraphHashes,
    /// Invalidation against the prior run
    pub invalidation: &'a InvalidationReport,
    /// Cache backing the checkpoints
    pub cache: &'a TaskCache,
    /// Run store holding the checkpoints
    pub store: &'a RunStore,
    /// Output directory the artifacts were materialized into
    pub output_dir: &'a Path,
}

/// Decide which nodes, if any, can be carried over from the prior run.
///
/// A node resumes only when its checkpoint validates, its task hash is
/// unchanged, neither it nor an ancestor carries an invalidation reason, and
/// every dependency resumes too.
#[instrument(skip_all, fields(mode = %ctx.mode))]
pub fn evaluate_resume(ctx: &ResumeContext<'_>) -> Result<ResumeDecision, CheckpointError> {
    if !ctx.mode.uses_checkpoints() {
        return Ok(ResumeDecision::Restart(ResumeBlocker::Disabled));
    }
    let prior = match (ctx.prior, ctx.requested) {
        (Some(prior), _) => prior,
        (None, Some(id)) => return Ok(ResumeDecision::Restart(ResumeBlocker::PriorRunNotFound(id.to_string()))),
        (None, None) => return Ok(ResumeDecision::Restart(ResumeBlocker::NoPriorRun)),
    };
    let run_id = prior.record.run_id.clone();

    if &prior.record.graph_hash != ctx.hashes.graph_hash() {
        return Ok(ResumeDecision::Restart(ResumeBlocker::GraphHashMismatch {
            run_id,
            prior: prior.record.graph_hash.to_string(),
            current: ctx.hashes.graph_hash().to_string(),
        }));
    }

    let mut candidates = ctx.store.load_checkpoints(&run_id)?;
    let mut nodes: BTreeMap<NodeIndex, ResumePoint> = BTreeMap::new();

    for &idx in ctx.graph.canonical_order() {
        let node = ctx.graph.node(idx);
        let checkpoint = match candidates.remove(&node.id) {
            Some(cp) => cp,
            None => continue,
        };
        let entry = match validate_checkpoint(&checkpoint, &prior.record, ctx.cache) {
            Ok(entry) => entry,
            Err(reason) => {
                debug!(task = %node.id, %reason, "checkpoint rejected");
                continue;
            }
        };
        if &checkpoint.task_hash != ctx.hashes.task_hash(idx) {
            debug!(task = %node.id, "checkpoint task hash is stale");
            continue;
        }
        if ctx.invalidation.is_invalidated(idx)
            || ctx
                .graph
                .ancestors(idx)
                .into_iter()
                .any(|a| ctx.invalidation.is_invalidated(a))
        {
            debug!(task = %node.id, "checkpoint has an invalidation marker upstream");
            continue;
        }
        if !node.dependencies.iter().all(|d| nodes.contains_key(d)) {
            debug!(task = %node.id, "dependency is not resumable");
            continue;
        }

        for artifact in &checkpoint.artifacts {
            let path = ctx.output_dir.join(&artifact.path);
            let intact = fs::read(&path)
                .map(|bytes| digest_bytes(&bytes) == artifact.digest)
                .unwrap_or(false);
            if !intact {
                warn!(task = %node.id, artifact = %artifact.path, "checkpointed artifact was modified");
                return Ok(ResumeDecision::Restart(ResumeBlocker::Workspace(format!(
                    "artifact '{}' of task '{}' is missing or modified",
                    artifact.path, node.id
                ))));
            }
        }

        nodes.insert(idx, ResumePoint { checkpoint, entry });
    }

    if nodes.is_empty() {
        return Ok(ResumeDecision::Restart(ResumeBlocker::NothingToResume(run_id)));
    }

    info!(run_id = %run_id, nodes = nodes.len(), "resuming prior run");
    Ok(ResumeDecision::Resume { run_id, nodes })
}

/// Errors reading or writing run state
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// IO error
    #[error("Run store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("Run store serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cache error while validating
    #[error(transparent)]
    Cache(#[from] CacheError),
}
