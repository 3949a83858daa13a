//! Engine entry point: one run from a resolved request to a result

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use strata_core::config::{Config, IsolationMode, NetworkPolicy};
use strata_core::{load_definition, ExecutionMode, ExitCode, HookContext, HookRegistry, HookStage};
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};

use crate::cache::TaskCache;
use crate::cancel::CancelSignal;
use crate::checkpoint::{
    evaluate_resume, ResumeBlocker, ResumeContext, ResumeDecision, RunRecord, RunStatus, RunStore,
};
use crate::dag::TaskGraph;
use crate::error::EngineError;
use crate::executor::{ExecutionContext, NetworkIsolation};
use crate::hash::{hash_graph, GraphHash, GraphHashes, InputResolver};
use crate::invalidation::{compute_invalidation, GraphSnapshot, InvalidationReason, InvalidationReport};
use crate::plan::{build_plan, IncrementalPlan, PlanRow};
use crate::reporter::{TaskReporter, TracingReporter};
use crate::result::GraphResult;
use crate::scheduler::{invoke_hooks, RunScope, SchedulerOptions, TaskScheduler};
use crate::task::TaskId;
use crate::trace::Trace;

/// Fully resolved inputs of one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Directory every command runs in
    pub working_dir: PathBuf,
    /// Task definition file
    pub definition: PathBuf,
    /// Cache root
    pub cache_dir: PathBuf,
    /// Runs root
    pub runs_dir: PathBuf,
    /// Artifact output directory
    pub output_dir: PathBuf,
    /// How checkpoints are treated
    pub mode: ExecutionMode,
    /// Prior run to resume instead of `LATEST`
    pub prior_run: Option<String>,
    /// Worker pool size
    pub concurrency: usize,
    /// Run-wide network policy
    pub network: NetworkPolicy,
    /// How network denial is enforced
    pub isolation: IsolationMode,
}

impl RunRequest {
    /// Build a request from configuration, resolving paths against
    /// `working_dir`
    pub fn from_config(working_dir: &Path, config: &Config) -> Self {
        let paths = config.paths.resolve(working_dir);
        Self {
            working_dir: working_dir.to_path_buf(),
            definition: paths.definition,
            cache_dir: paths.cache_dir,
            runs_dir: paths.runs_dir,
            output_dir: paths.output_dir,
            mode: config.engine.mode,
            prior_run: None,
            concurrency: config.engine.concurrency,
            network: config.sandbox.network,
            isolation: config.sandbox.isolation,
        }
    }

    fn engine_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.cache_dir.clone(),
            self.runs_dir.clone(),
            self.output_dir.clone(),
        ]
    }
}

/// Outcome of a run that got as far as executing
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Identifier of this run
    pub run_id: String,
    /// Final status
    pub status: RunStatus,
    /// Graph hash that was executed
    pub graph_hash: GraphHash,
    /// Aggregate result
    pub result: GraphResult,
    /// Execution trace
    pub trace: Trace,
    /// Digest of the trace
    pub trace_digest: String,
    /// Invalidation reasons against the prior run
    pub invalidation: BTreeMap<TaskId, Vec<InvalidationReason>>,
    /// Run whose checkpoints were resumed
    pub resumed_from: Option<String>,
    /// Why nothing was resumed, when resume was attempted
    #[serde(skip)]
    pub resume_blocker: Option<ResumeBlocker>,
}

impl RunOutcome {
    /// Semantic exit code
    pub fn exit_code(&self) -> ExitCode {
        match self.status {
            RunStatus::Completed => ExitCode::Success,
            RunStatus::Interrupted => ExitCode::Internal,
            RunStatus::New | RunStatus::Running | RunStatus::Failed => ExitCode::Failure,
        }
    }
}

/// What a run would do, without running anything
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    /// Graph hash
    pub graph_hash: GraphHash,
    /// Task names per depth level
    pub levels: Vec<Vec<TaskId>>,
    /// Planned nodes in canonical order
    pub tasks: Vec<PlanRow>,
    /// Run whose checkpoints would be resumed
    pub resumed_from: Option<String>,
    /// Why nothing would be resumed
    pub resume_blocker: Option<String>,
    /// Tasks that existed in the prior run but are gone
    pub removed: Vec<TaskId>,
}

struct Analysis {
    graph: TaskGraph,
    hashes: GraphHashes,
    invalidation: InvalidationReport,
    resume: ResumeDecision,
    plan: IncrementalPlan,
    cache: TaskCache,
    store: RunStore,
}

/// The execution engine
pub struct Engine {
    request: RunRequest,
    reporter: Arc<dyn TaskReporter>,
    hooks: HookRegistry,
    cancel: CancelSignal,
}

impl Engine {
    /// Create an engine for a request
    pub fn new(request: RunRequest) -> Self {
        Self {
            request,
            reporter: Arc::new(TracingReporter),
            hooks: HookRegistry::new(),
            cancel: CancelSignal::new(),
        }
    }

    /// Replace the reporter
    pub fn with_reporter(mut self, reporter: Arc<dyn TaskReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Attach lifecycle hooks
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Use an external cancellation signal
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Signal that cancels this engine's runs
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// The request this engine executes
    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    /// Execute the graph.
    ///
    /// Errors are returned only when execution cannot start or results
    /// cannot be persisted; failing tasks produce an `Ok` outcome with a
    /// failed status.
    #[instrument(skip_all, fields(mode = %self.request.mode))]
    pub async fn run(&self) -> Result<RunOutcome, EngineError> {
        self.check_working_dir()?;
        self.check_engine_dirs()?;
        let analysis = self.analyze()?;

        if let ResumeDecision::Restart(blocker) = &analysis.resume {
            if self.request.mode == ExecutionMode::ResumeOnly {
                warn!(class = ?blocker.failure_class(), %blocker, "resume required but impossible");
                return Err(EngineError::Resume {
                    blocker: blocker.clone(),
                });
            }
            if let ResumeBlocker::Workspace(reason) = blocker {
                warn!(%reason, "prior run cannot be resumed, starting fresh");
            }
        }
        self.prepare_workspace()?;

        let mut record = RunRecord::new(analysis.hashes.graph_hash().clone(), self.request.mode);
        record.resumed_from = analysis.plan.resumed_from().map(str::to_string);
        let snapshot = GraphSnapshot::capture(&analysis.graph, &analysis.hashes);
        analysis.store.begin(&mut record, &snapshot)?;

        let graph_hash = analysis.hashes.graph_hash().as_str();
        invoke_hooks(
            &self.hooks,
            &HookContext::run(HookStage::BeforeRun, &record.run_id, graph_hash),
        );

        let scheduler = TaskScheduler::new(
            SchedulerOptions {
                concurrency: self.request.concurrency,
            },
            self.execution_context(),
            analysis.cache.clone(),
            analysis.store.clone(),
            self.request.output_dir.clone(),
        )
        .with_reporter(self.reporter.clone())
        .with_hooks(self.hooks.clone())
        .with_cancel(self.cancel.clone());

        let scope = RunScope {
            run_id: &record.run_id,
            graph_hash: analysis.hashes.graph_hash(),
        };
        let report = match scheduler
            .execute(&analysis.graph, &analysis.hashes, &analysis.plan, scope)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                record.finish(RunStatus::Interrupted);
                if let Err(update) = analysis.store.update(&record) {
                    warn!(error = %update, "could not record interrupted run");
                }
                return Err(e.into());
            }
        };

        let status = if report.interrupted {
            RunStatus::Interrupted
        } else if report.result.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        record.finish(status);
        analysis.store.update(&record)?;
        invoke_hooks(
            &self.hooks,
            &HookContext::run(HookStage::AfterRun, &record.run_id, graph_hash).with_state(status.as_str()),
        );
        info!(run_id = %record.run_id, %status, "run finished");

        Ok(RunOutcome {
            trace_digest: report.trace.digest(),
            run_id: record.run_id,
            status,
            graph_hash: analysis.hashes.graph_hash().clone(),
            invalidation: analysis.invalidation.to_map(&analysis.graph),
            result: report.result,
            trace: report.trace,
            resumed_from: record.resumed_from,
            resume_blocker: match analysis.resume {
                ResumeDecision::Restart(blocker) => Some(blocker),
                ResumeDecision::Resume { .. } => None,
            },
        })
    }

    /// Describe what `run` would do without executing or writing anything
    pub fn plan(&self) -> Result<PlanPreview, EngineError> {
        self.check_working_dir()?;
        let analysis = self.analyze()?;
        let graph = &analysis.graph;
        Ok(PlanPreview {
            graph_hash: analysis.hashes.graph_hash().clone(),
            levels: graph
                .levels()
                .iter()
                .map(|level| level.iter().map(|idx| graph.node(*idx).id.clone()).collect())
                .collect(),
            tasks: analysis.plan.tasks_in_order(graph).map(PlanRow::from).collect(),
            resumed_from: analysis.plan.resumed_from().map(str::to_string),
            resume_blocker: match &analysis.resume {
                ResumeDecision::Restart(blocker) => Some(blocker.to_string()),
                ResumeDecision::Resume { .. } => None,
            },
            removed: analysis.invalidation.removed().to_vec(),
        })
    }

    fn check_working_dir(&self) -> Result<(), EngineError> {
        if !self.request.working_dir.is_dir() {
            return Err(EngineError::Invocation(format!(
                "working directory {} does not exist",
                self.request.working_dir.display()
            )));
        }
        if self.request.concurrency == 0 {
            return Err(EngineError::Invocation("concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Reject engine locations taken by something other than a directory.
    /// Nothing is created here.
    fn check_engine_dirs(&self) -> Result<(), EngineError> {
        for dir in self.request.engine_dirs() {
            if dir.exists() && !dir.is_dir() {
                return Err(EngineError::Configuration(format!(
                    "{} exists and is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Create the engine directories and make sure each is writable
    fn prepare_workspace(&self) -> Result<(), EngineError> {
        for dir in self.request.engine_dirs() {
            fs::create_dir_all(&dir)
                .and_then(|_| NamedTempFile::new_in(&dir))
                .map_err(|e| EngineError::Configuration(format!("{} is not writable: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    fn analyze(&self) -> Result<Analysis, EngineError> {
        let request = &self.request;
        let definitions = load_definition(&request.definition)?;
        let graph = TaskGraph::load(&definitions)?;

        let resolver = InputResolver::new(&request.working_dir, &graph, &request.engine_dirs());
        let hashes = hash_graph(&graph, &resolver)?;

        let cache = TaskCache::new(request.cache_dir.clone());
        let store = RunStore::new(request.runs_dir.clone());
        let prior = store.resolve(request.prior_run.as_deref())?;
        let snapshot = prior.as_ref().and_then(|p| p.snapshot.as_ref());
        let invalidation = compute_invalidation(&graph, &hashes, snapshot);

        let resume = evaluate_resume(&ResumeContext {
            mode: request.mode,
            requested: request.prior_run.as_deref(),
            prior: prior.as_ref(),
            graph: &graph,
            hashes: &hashes,
            invalidation: &invalidation,
            cache: &cache,
            store: &store,
            output_dir: &request.output_dir,
        })?;
        let plan = build_plan(&graph, &hashes, &invalidation, &resume, &cache)?;

        Ok(Analysis {
            graph,
            hashes,
            invalidation,
            resume,
            plan,
            cache,
            store,
        })
    }

    fn execution_context(&self) -> ExecutionContext {
        let isolation = match self.request.network {
            NetworkPolicy::Deny => NetworkIsolation::detect(self.request.isolation),
            NetworkPolicy::Allow => NetworkIsolation::Advisory,
        };
        if self.request.network == NetworkPolicy::Deny && !isolation.is_enforced() {
            info!("network denial is advisory on this host");
        }
        ExecutionContext {
            working_dir: self.request.working_dir.clone(),
            network: self.request.network,
            isolation,
            excluded_dirs: self.request.engine_dirs(),
        }
    }
}
