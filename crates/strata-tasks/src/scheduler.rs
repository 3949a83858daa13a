//! Task scheduler: depth-staged async executor using tokio
//!
//! Each depth level is dispatched in name order onto a bounded worker pool
//! and fully resolved before the next level starts. Workers only run or
//! replay commands; every state transition, cache commit and checkpoint
//! write happens here, in the scheduling loop, one node at a time and in
//! name order. Results therefore do not depend on the worker count.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_core::config::default_concurrency;
use strata_core::{HookContext, HookRegistry, HookStage, TaskSpec};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{materialize_artifacts, CacheError, StoredEntry, TaskCache, TaskOutput};
use crate::cancel::CancelSignal;
use crate::checkpoint::{Checkpoint, CheckpointError, RunStore};
use crate::dag::{NodeIndex, TaskGraph};
use crate::executor::{run_task, ExecError, ExecOutcome, ExecutionContext};
use crate::hash::{GraphHash, GraphHashes};
use crate::plan::{Decision, IncrementalPlan};
use crate::reporter::{TaskEvent, TaskReporter, TracingReporter};
use crate::result::{GraphResult, LogEntry};
use crate::task::{ExecutionState, TaskId};
use crate::trace::{Trace, TraceEvent};

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent tasks
    pub concurrency: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

/// Identity of the run being executed
#[derive(Debug, Clone, Copy)]
pub struct RunScope<'a> {
    /// Run identifier checkpoints are written under
    pub run_id: &'a str,
    /// Graph hash recorded in checkpoints
    pub graph_hash: &'a GraphHash,
}

/// Everything one execution produced
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Aggregate result
    pub result: GraphResult,
    /// Terminal transitions in canonical order
    pub trace: Trace,
    /// Whether cancellation or a signal left nodes pending
    pub interrupted: bool,
}

/// Per-node state owned by the scheduling loop
#[derive(Debug, Default)]
struct Slot {
    state: ExecutionState,
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    artifacts: Vec<String>,
    note: Option<String>,
}

enum Work {
    Execute(TaskSpec),
    Replay {
        spec: TaskSpec,
        entry: StoredEntry,
        resumed: bool,
    },
}

enum WorkOutcome {
    Executed(Result<ExecOutcome, ExecError>),
    Replayed {
        output: TaskOutput,
        entry: StoredEntry,
        resumed: bool,
    },
}

/// Task scheduler: executes an incremental plan over a graph
pub struct TaskScheduler {
    options: SchedulerOptions,
    context: Arc<ExecutionContext>,
    cache: TaskCache,
    store: RunStore,
    output_dir: PathBuf,
    reporter: Arc<dyn TaskReporter>,
    hooks: HookRegistry,
    cancel: CancelSignal,
}

impl TaskScheduler {
    /// Create a new scheduler
    pub fn new(
        options: SchedulerOptions,
        context: ExecutionContext,
        cache: TaskCache,
        store: RunStore,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            options,
            context: Arc::new(context),
            cache,
            store,
            output_dir,
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

    /// Execute every node of the plan.
    ///
    /// Cache or checkpoint write failures abort the run; in-flight commands
    /// are cancelled.
    pub async fn execute(
        &self,
        graph: &TaskGraph,
        hashes: &GraphHashes,
        plan: &IncrementalPlan,
        scope: RunScope<'_>,
    ) -> Result<ExecutionReport, SchedulerError> {
        match self.execute_levels(graph, hashes, plan, scope).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn execute_levels(
        &self,
        graph: &TaskGraph,
        hashes: &GraphHashes,
        plan: &IncrementalPlan,
        scope: RunScope<'_>,
    ) -> Result<ExecutionReport, SchedulerError> {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut slots: Vec<Slot> = graph.indices().map(|_| Slot::default()).collect();
        let mut trace = Trace::new();

        for (depth, level) in graph.levels().iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.reporter.report(&TaskEvent::WaveStarted {
                depth,
                task_count: level.len(),
            });

            let mut handles = Vec::new();

            for &idx in level {
                let node = graph.node(idx);

                if let Some(dep) = node
                    .dependencies
                    .iter()
                    .find(|d| !slots[d.index()].state.is_success())
                {
                    let reason = format!("dependency '{}' did not succeed", graph.node(*dep).id);
                    self.skip(graph, hashes, idx, reason, &mut slots, &mut trace, scope);
                    continue;
                }

                if self.cancel.is_cancelled() {
                    break;
                }
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                if self.cancel.is_cancelled() {
                    break;
                }

                let work = match &plan.task(idx).decision {
                    Decision::Execute => Work::Execute(node.spec.clone()),
                    Decision::ReuseCache(entry) => Work::Replay {
                        spec: node.spec.clone(),
                        entry: entry.clone(),
                        resumed: false,
                    },
                    Decision::Resume(point) => Work::Replay {
                        spec: node.spec.clone(),
                        entry: point.entry.clone(),
                        resumed: true,
                    },
                };

                invoke_hooks(
                    &self.hooks,
                    &HookContext::run(HookStage::BeforeTask, scope.run_id, scope.graph_hash.as_str())
                        .with_task(node.id.as_str()),
                );
                self.reporter.report(&TaskEvent::Started {
                    id: node.id.clone(),
                    command: node.spec.run.clone(),
                });
                slots[idx.index()].state = ExecutionState::Running;

                let context = self.context.clone();
                let cache = self.cache.clone();
                let cancel = self.cancel.clone();
                let handle = tokio::spawn(async move {
                    let outcome = perform(work, &context, &cache, &cancel).await;
                    drop(permit);
                    outcome
                });
                handles.push((idx, Instant::now(), handle));
            }

            // Settle in dispatch order so every write happens in name order
            for (idx, started, handle) in handles {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => WorkOutcome::Executed(Err(ExecError::Spawn(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("worker panicked: {}", e),
                    )))),
                };
                self.settle(graph, hashes, idx, outcome, started.elapsed(), &mut slots, &mut trace, scope)?;
            }
        }

        let interrupted = slots.iter().any(|s| !s.state.is_terminal());
        if interrupted {
            info!(
                pending = slots.iter().filter(|s| !s.state.is_terminal()).count(),
                "run interrupted"
            );
        }

        let result = build_result(graph, slots);
        self.reporter.report(&TaskEvent::AllCompleted {
            total: graph.len(),
            succeeded: result.count(ExecutionState::Completed) + result.count(ExecutionState::Cached),
            failed: result.count(ExecutionState::Failed),
            cached: result.count(ExecutionState::Cached),
            skipped: result.count(ExecutionState::Skipped),
            duration: start.elapsed(),
        });

        Ok(ExecutionReport {
            result,
            trace,
            interrupted,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn skip(
        &self,
        graph: &TaskGraph,
        hashes: &GraphHashes,
        idx: NodeIndex,
        reason: String,
        slots: &mut [Slot],
        trace: &mut Trace,
        scope: RunScope<'_>,
    ) {
        let id = &graph.node(idx).id;
        debug!(task = %id, %reason, "skipping");
        let slot = &mut slots[idx.index()];
        slot.state = ExecutionState::Skipped;
        slot.note = Some(reason.clone());
        trace.record(TraceEvent {
            position: graph.position(idx),
            task: id.clone(),
            state: ExecutionState::Skipped,
            task_hash: hashes.task_hash(idx).clone(),
            exit_code: None,
            cache_ref: None,
            resumed: false,
        });
        self.reporter.report(&TaskEvent::Skipped { id: id.clone(), reason });
        self.after_task(id, slot, scope);
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        graph: &TaskGraph,
        hashes: &GraphHashes,
        idx: NodeIndex,
        outcome: WorkOutcome,
        duration: Duration,
        slots: &mut [Slot],
        trace: &mut Trace,
        scope: RunScope<'_>,
    ) -> Result<(), SchedulerError> {
        let id = &graph.node(idx).id;
        let task_hash = hashes.task_hash(idx);
        let mut event = TraceEvent {
            position: graph.position(idx),
            task: id.clone(),
            state: ExecutionState::Failed,
            task_hash: task_hash.clone(),
            exit_code: None,
            cache_ref: None,
            resumed: false,
        };

        let (output, stored) = match outcome {
            WorkOutcome::Executed(Ok(ExecOutcome::Finished(output))) => {
                let prepared = self
                    .cache
                    .prepare(task_hash, &hashes.node(idx).components.command, &output)?;
                let stored = StoredEntry {
                    entry: prepared.entry().clone(),
                    digest: prepared.digest().to_string(),
                };
                event.state = if output.succeeded() {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                };
                event.exit_code = Some(output.exit_code);
                event.cache_ref = Some(stored.digest.clone());

                // Artifacts and checkpoint first: a crash before the commit
                // leaves a checkpoint whose cache entry does not exist.
                if output.succeeded() {
                    materialize_artifacts(&output.artifacts, &self.output_dir)?;
                    let checkpoint = Checkpoint::new(scope.run_id, scope.graph_hash, event.clone(), &stored);
                    self.store.write_checkpoint(&checkpoint)?;
                }
                self.cache.commit(&prepared)?;
                (output, stored)
            }
            WorkOutcome::Replayed {
                output,
                entry,
                resumed,
            } => {
                event.state = if output.succeeded() {
                    ExecutionState::Cached
                } else {
                    ExecutionState::Failed
                };
                event.exit_code = Some(output.exit_code);
                event.cache_ref = Some(entry.digest.clone());
                event.resumed = resumed;

                if output.succeeded() {
                    materialize_artifacts(&output.artifacts, &self.output_dir)?;
                    let checkpoint = Checkpoint::new(scope.run_id, scope.graph_hash, event.clone(), &entry);
                    self.store.write_checkpoint(&checkpoint)?;
                }
                (output, entry)
            }
            WorkOutcome::Executed(Ok(ExecOutcome::Terminated | ExecOutcome::Cancelled)) => {
                let slot = &mut slots[idx.index()];
                slot.state = ExecutionState::Pending;
                slot.note = Some("interrupted".to_string());
                debug!(task = %id, "returned to pending");
                self.reporter.report(&TaskEvent::Cancelled { id: id.clone() });
                return Ok(());
            }
            WorkOutcome::Executed(Err(e)) => {
                warn!(task = %id, error = %e, "task could not be executed");
                let slot = &mut slots[idx.index()];
                slot.state = ExecutionState::Failed;
                slot.note = Some(e.to_string());
                trace.record(event);
                self.reporter.report(&TaskEvent::Failed {
                    id: id.clone(),
                    duration,
                    error: e.to_string(),
                });
                self.after_task(id, slot, scope);
                return Ok(());
            }
        };

        let slot = &mut slots[idx.index()];
        slot.state = event.state;
        slot.exit_code = Some(output.exit_code);
        slot.artifacts = output.artifact_paths();
        slot.stdout = output.stdout;
        slot.stderr = output.stderr;
        if event.resumed {
            slot.note = Some("resumed".to_string());
        }
        debug!(
            task = %id,
            state = %event.state,
            exit_code = output.exit_code,
            entry = %stored.digest,
            "task settled"
        );
        trace.record(event);

        for (bytes, is_stderr) in [(&slot.stdout, false), (&slot.stderr, true)] {
            for line in String::from_utf8_lossy(bytes).lines() {
                self.reporter.report(&TaskEvent::Output {
                    id: id.clone(),
                    line: line.to_string(),
                    is_stderr,
                });
            }
        }
        if slot.state.is_success() {
            self.reporter.report(&TaskEvent::Completed {
                id: id.clone(),
                duration,
                cached: slot.state == ExecutionState::Cached,
            });
        } else {
            self.reporter.report(&TaskEvent::Failed {
                id: id.clone(),
                duration,
                error: format!("exit code {}", output.exit_code),
            });
        }
        self.after_task(id, slot, scope);
        Ok(())
    }

    fn after_task(&self, id: &TaskId, slot: &Slot, scope: RunScope<'_>) {
        invoke_hooks(
            &self.hooks,
            &HookContext::run(HookStage::AfterTask, scope.run_id, scope.graph_hash.as_str())
                .with_task(id.as_str())
                .with_state(slot.state.as_str())
                .with_exit_code(slot.exit_code),
        );
    }
}

/// Invoke lifecycle hooks from async code.
///
/// Hooks are synchronous and shell hooks block until their command exits,
/// so on a multi-threaded runtime the call is moved off the worker with
/// `block_in_place`.
pub(crate) fn invoke_hooks(hooks: &HookRegistry, context: &HookContext) {
    if hooks.is_empty() {
        return;
    }
    let multi_thread = Handle::try_current()
        .map(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread)
        .unwrap_or(false);
    if multi_thread {
        tokio::task::block_in_place(|| hooks.invoke(context));
    } else {
        hooks.invoke(context);
    }
}

/// Run or replay one node on a worker
async fn perform(
    work: Work,
    context: &ExecutionContext,
    cache: &TaskCache,
    cancel: &CancelSignal,
) -> WorkOutcome {
    match work {
        Work::Execute(spec) => WorkOutcome::Executed(run_task(context, &spec, cancel).await),
        Work::Replay {
            spec,
            entry,
            resumed,
        } => {
            if cancel.is_cancelled() {
                return WorkOutcome::Executed(Ok(ExecOutcome::Cancelled));
            }
            if let Err(e) = context.clear_outputs(&spec) {
                return WorkOutcome::Executed(Err(e));
            }
            match cache.replay(&entry.entry, &context.working_dir) {
                Ok(output) => WorkOutcome::Replayed {
                    output,
                    entry,
                    resumed,
                },
                Err(e) => {
                    warn!(hash = entry.entry.task_hash.short(), error = %e, "replay failed, executing");
                    WorkOutcome::Executed(run_task(context, &spec, cancel).await)
                }
            }
        }
    }
}

fn build_result(graph: &TaskGraph, mut slots: Vec<Slot>) -> GraphResult {
    let mut result = GraphResult {
        success: slots.iter().all(|s| s.state.is_success()),
        ..GraphResult::default()
    };
    for &idx in graph.canonical_order() {
        let node = graph.node(idx);
        let slot = std::mem::take(&mut slots[idx.index()]);
        result.states.insert(node.id.clone(), slot.state);
        if slot.state.is_success() {
            result.artifacts.insert(node.id.clone(), slot.artifacts);
        }
        if slot.state.is_terminal() {
            result.log.push(LogEntry {
                task: node.id.clone(),
                depth: node.depth,
                state: slot.state,
                exit_code: slot.exit_code,
                stdout: String::from_utf8_lossy(&slot.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&slot.stderr).into_owned(),
                note: slot.note,
            });
        }
    }
    result
}

/// Errors that abort a run
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The cache could not be written
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A checkpoint could not be written
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ResumeBlocker, ResumeDecision};
    use crate::hash::{hash_graph, InputResolver};
    use crate::invalidation::compute_invalidation;
    use crate::plan::build_plan;
    use crate::reporter::CollectingReporter;
    use std::fs;
    use strata_core::{ShellHook, TaskDefinitions, TaskSpec};
    use tempfile::TempDir;

    struct Harness {
        temp: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            fs::create_dir_all(temp.path().join("work")).unwrap();
            Self { temp }
        }

        fn work(&self) -> PathBuf {
            self.temp.path().join("work")
        }

        async fn run_with(
            &self,
            defs: &TaskDefinitions,
            concurrency: usize,
            reporter: Arc<dyn TaskReporter>,
            cancel: CancelSignal,
            hooks: HookRegistry,
        ) -> ExecutionReport {
            let graph = TaskGraph::load(defs).unwrap();
            let hashes = hash_graph(&graph, &InputResolver::new(&self.work(), &graph, &[])).unwrap();
            let cache = TaskCache::new(self.temp.path().join("cache"));
            let store = RunStore::new(self.temp.path().join("runs"));
            let invalidation = compute_invalidation(&graph, &hashes, None);
            let resume = ResumeDecision::Restart(ResumeBlocker::Disabled);
            let plan = build_plan(&graph, &hashes, &invalidation, &resume, &cache).unwrap();

            let scheduler = TaskScheduler::new(
                SchedulerOptions { concurrency },
                ExecutionContext::new(self.work()),
                cache,
                store,
                self.temp.path().join("out"),
            )
            .with_reporter(reporter)
            .with_hooks(hooks)
            .with_cancel(cancel);
            let scope = RunScope {
                run_id: "test-run",
                graph_hash: hashes.graph_hash(),
            };
            scheduler.execute(&graph, &hashes, &plan, scope).await.unwrap()
        }

        async fn run(&self, defs: &TaskDefinitions, concurrency: usize) -> ExecutionReport {
            self.run_with(
                defs,
                concurrency,
                Arc::new(TracingReporter),
                CancelSignal::new(),
                HookRegistry::new(),
            )
                .await
        }
    }

    fn diamond() -> TaskDefinitions {
        TaskDefinitions::new()
            .with_task("a", TaskSpec::new("printf a > a.txt").with_output("a.txt"))
            .with_task(
                "b",
                TaskSpec::new("cat a.txt > b.txt; printf b >> b.txt")
                    .with_depends_on("a")
                    .with_output("b.txt"),
            )
            .with_task(
                "c",
                TaskSpec::new("cat a.txt > c.txt; printf c >> c.txt")
                    .with_depends_on("a")
                    .with_output("c.txt"),
            )
            .with_task(
                "d",
                TaskSpec::new("cat b.txt c.txt")
                    .with_depends_on("b")
                    .with_depends_on("c"),
            )
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_result() {
        let serial = Harness::new();
        let parallel = Harness::new();

        let one = serial.run(&diamond(), 1).await;
        let many = parallel.run(&diamond(), 8).await;

        assert!(one.result.success);
        assert_eq!(one.result, many.result);
        assert_eq!(one.trace.digest(), many.trace.digest());
        assert_eq!(one.result.entry("d").unwrap().stdout, "abac");
        assert_eq!(
            fs::read(serial.temp.path().join("out/b.txt")).unwrap(),
            fs::read(parallel.temp.path().join("out/b.txt")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_sibling_outputs_in_shared_dir_stay_separate() {
        let defs = TaskDefinitions::new()
            .with_task(
                "a_wide",
                TaskSpec::new("sleep 0.3; mkdir -p out/wide; printf w > out/wide/w.txt")
                    .with_output("out/wide/*"),
            )
            .with_task(
                "b_narrow",
                TaskSpec::new("mkdir -p out; printf n > out/n.txt").with_output("out/n.txt"),
            );

        let serial = Harness::new();
        let parallel = Harness::new();
        let one = serial.run(&defs, 1).await;
        let many = parallel.run(&defs, 2).await;

        assert!(one.result.success);
        assert_eq!(one.result, many.result);
        assert_eq!(
            one.result.artifacts.get(&TaskId::new("a_wide")),
            Some(&vec!["out/wide/w.txt".to_string()])
        );
        assert_eq!(
            one.result.artifacts.get(&TaskId::new("b_narrow")),
            Some(&vec!["out/n.txt".to_string()])
        );
    }

    #[tokio::test]
    async fn test_failure_skips_only_descendants() {
        let harness = Harness::new();
        let defs = TaskDefinitions::new()
            .with_task("a", TaskSpec::new("true"))
            .with_task("b", TaskSpec::new("exit 2").with_depends_on("a"))
            .with_task("c", TaskSpec::new("true").with_depends_on("a"))
            .with_task("d", TaskSpec::new("true").with_depends_on("b"));

        let report = harness.run(&defs, 2).await;
        let result = &report.result;
        assert!(!result.success);
        assert!(!report.interrupted);
        assert_eq!(result.state("a"), Some(ExecutionState::Completed));
        assert_eq!(result.state("b"), Some(ExecutionState::Failed));
        assert_eq!(result.state("c"), Some(ExecutionState::Completed));
        assert_eq!(result.state("d"), Some(ExecutionState::Skipped));
        assert_eq!(result.entry("b").unwrap().exit_code, Some(2));
        assert_eq!(
            result.entry("d").unwrap().note.as_deref(),
            Some("dependency 'b' did not succeed")
        );
    }

    #[tokio::test]
    async fn test_cached_failure_is_not_re_executed() {
        let harness = Harness::new();
        let defs = TaskDefinitions::new().with_task(
            "flaky",
            TaskSpec::new("printf x >> count.txt; echo broken >&2; exit 1"),
        );

        let first = harness.run(&defs, 1).await;
        assert_eq!(first.result.state("flaky"), Some(ExecutionState::Failed));

        let second = harness.run(&defs, 1).await;
        assert_eq!(second.result.state("flaky"), Some(ExecutionState::Failed));
        assert_eq!(second.result.entry("flaky").unwrap().stderr, "broken\n");
        assert_eq!(fs::read_to_string(harness.work().join("count.txt")).unwrap(), "x");
    }

    #[tokio::test]
    async fn test_second_run_replays_from_cache() {
        let harness = Harness::new();
        let first = harness.run(&diamond(), 4).await;
        fs::remove_file(harness.work().join("b.txt")).unwrap();

        let second = harness.run(&diamond(), 4).await;
        for task in ["a", "b", "c", "d"] {
            assert_eq!(second.result.state(task), Some(ExecutionState::Cached), "{}", task);
            assert_eq!(
                second.result.entry(task).unwrap().stdout,
                first.result.entry(task).unwrap().stdout
            );
        }
        assert_eq!(fs::read_to_string(harness.work().join("b.txt")).unwrap(), "ab");
        assert_eq!(second.result.artifacts, first.result.artifacts);
    }

    #[tokio::test]
    async fn test_events_follow_name_order_within_depth() {
        let harness = Harness::new();
        let reporter = Arc::new(CollectingReporter::default());
        harness
            .run_with(&diamond(), 4, reporter.clone(), CancelSignal::new(), HookRegistry::new())
            .await;

        let settled: Vec<String> = reporter
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Completed { id, .. } => Some(id.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(settled, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shell_hooks_run_on_multi_thread_runtime() {
        let harness = Harness::new();
        let log = harness.temp.path().join("hooks.log");
        let mut hooks = HookRegistry::new();
        hooks.register(
            ShellHook::new(
                HookStage::AfterTask,
                format!("printf '%s:%s\\n' \"$STRATA_TASK\" \"$STRATA_STATE\" >> '{}'", log.display()),
            )
            .with_cwd(harness.work()),
        );

        let report = harness
            .run_with(&diamond(), 4, Arc::new(TracingReporter), CancelSignal::new(), hooks)
            .await;

        assert!(report.result.success);
        assert_eq!(
            fs::read_to_string(&log).unwrap(),
            "a:COMPLETED\nb:COMPLETED\nc:COMPLETED\nd:COMPLETED\n"
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_nodes_pending() {
        let harness = Harness::new();
        let defs = TaskDefinitions::new()
            .with_task("slow", TaskSpec::new("sleep 30"))
            .with_task("after", TaskSpec::new("true").with_depends_on("slow"));
        let cancel = CancelSignal::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            harness.run_with(&defs, 2, Arc::new(TracingReporter), cancel, HookRegistry::new()),
        )
        .await
        .unwrap();

        assert!(report.interrupted);
        assert!(!report.result.success);
        assert_eq!(report.result.state("slow"), Some(ExecutionState::Pending));
        assert_eq!(report.result.state("after"), Some(ExecutionState::Pending));
        assert!(report.trace.is_empty());
        assert!(fs::read_dir(harness.temp.path().join("cache/entries"))
            .map(|d| d.count() == 0)
            .unwrap_or(true));
    }
}
