//! Lifecycle hooks
//!
//! Hooks observe a run at four points:
//! - before-run: after planning, before the first task is dispatched
//! - before-task: right before a task is executed or replayed
//! - after-task: once a task reaches a terminal state
//! - after-run: after the run record is finalized
//!
//! A hook only ever sees a read-only [`HookContext`]. Every call goes through
//! [`HookRegistry::invoke`], which contains errors and panics so a misbehaving
//! hook cannot disturb scheduling or results.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::HooksConfig;
use crate::error::HookError;

/// Hook lifecycle stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// Before the first task is dispatched
    BeforeRun,
    /// Before a single task
    BeforeTask,
    /// After a single task
    AfterTask,
    /// After the run finished
    AfterRun,
}

impl HookStage {
    /// Get the stage name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeRun => "before-run",
            Self::BeforeTask => "before-task",
            Self::AfterTask => "after-task",
            Self::AfterRun => "after-run",
        }
    }

    /// Parse stage from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "before-run" => Some(Self::BeforeRun),
            "before-task" => Some(Self::BeforeTask),
            "after-task" => Some(Self::AfterTask),
            "after-run" => Some(Self::AfterRun),
            _ => None,
        }
    }

    /// Get all stages in order
    pub fn all() -> &'static [HookStage] {
        &[
            Self::BeforeRun,
            Self::BeforeTask,
            Self::AfterTask,
            Self::AfterRun,
        ]
    }
}

/// Read-only view handed to hooks
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Stage being signalled
    pub stage: HookStage,
    /// Current run identifier
    pub run_id: String,
    /// Graph hash of the current run
    pub graph_hash: String,
    /// Task name for task-level stages
    pub task: Option<String>,
    /// Terminal state for after-task / after-run
    pub state: Option<String>,
    /// Exit code when the task produced one
    pub exit_code: Option<i32>,
}

impl HookContext {
    /// Context for a run-level stage
    pub fn run(stage: HookStage, run_id: impl Into<String>, graph_hash: impl Into<String>) -> Self {
        Self {
            stage,
            run_id: run_id.into(),
            graph_hash: graph_hash.into(),
            task: None,
            state: None,
            exit_code: None,
        }
    }

    /// Narrow the context to one task
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Record a state name
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Record an exit code
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Convert context to environment variables
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("STRATA_STAGE".to_string(), self.stage.as_str().to_string());
        env.insert("STRATA_RUN_ID".to_string(), self.run_id.clone());
        env.insert("STRATA_GRAPH_HASH".to_string(), self.graph_hash.clone());
        if let Some(ref v) = self.task {
            env.insert("STRATA_TASK".to_string(), v.clone());
        }
        if let Some(ref v) = self.state {
            env.insert("STRATA_STATE".to_string(), v.clone());
        }
        if let Some(code) = self.exit_code {
            env.insert("STRATA_EXIT_CODE".to_string(), code.to_string());
        }
        env
    }
}

/// Capability-scoped observer of run lifecycle events
pub trait LifecycleHook: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    /// Handle one lifecycle event
    fn on_event(&self, context: &HookContext) -> Result<(), HookError>;
}

/// Runs a shell command at one stage, with `STRATA_*` context variables set.
///
/// The command runs to completion on the calling thread.
#[derive(Debug, Clone)]
pub struct ShellHook {
    stage: HookStage,
    command: String,
    cwd: Option<PathBuf>,
}

impl ShellHook {
    /// Create a new shell hook
    pub fn new(stage: HookStage, command: impl Into<String>) -> Self {
        Self {
            stage,
            command: command.into(),
            cwd: None,
        }
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Stage this hook listens to
    pub fn stage(&self) -> HookStage {
        self.stage
    }
}

impl LifecycleHook for ShellHook {
    fn name(&self) -> &str {
        &self.command
    }

    fn on_event(&self, context: &HookContext) -> Result<(), HookError> {
        if context.stage != self.stage {
            return Ok(());
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(context.to_env());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().map_err(|e| HookError::ExecutionFailed {
            stage: self.stage.as_str().to_string(),
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(HookError::ExecutionFailed {
                stage: self.stage.as_str().to_string(),
                command: self.command.clone(),
                message: format!(
                    "exit code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Registry of lifecycle hooks
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build shell hooks from configuration
    pub fn from_config(config: &HooksConfig, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        let mut registry = Self::new();
        let stages = [
            (HookStage::BeforeRun, &config.before_run),
            (HookStage::BeforeTask, &config.before_task),
            (HookStage::AfterTask, &config.after_task),
            (HookStage::AfterRun, &config.after_run),
        ];
        for (stage, commands) in stages {
            for command in commands {
                registry.register(ShellHook::new(stage, command.clone()).with_cwd(cwd.clone()));
            }
        }
        registry
    }

    /// Register a hook
    pub fn register<H: LifecycleHook + 'static>(&mut self, hook: H) {
        self.hooks.push(Arc::new(hook));
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Call every hook in registration order.
    ///
    /// Errors and panics are logged and returned; they never propagate.
    pub fn invoke(&self, context: &HookContext) -> Vec<HookError> {
        let mut failures = Vec::new();
        for hook in &self.hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.on_event(context)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => HookError::Panicked {
                    stage: context.stage.as_str().to_string(),
                    hook: hook.name().to_string(),
                },
            };
            warn!(hook = hook.name(), stage = context.stage.as_str(), error = %error, "hook failed");
            failures.push(error);
        }
        if !self.hooks.is_empty() {
            debug!(
                stage = context.stage.as_str(),
                hooks = self.hooks.len(),
                failed = failures.len(),
                "hooks invoked"
            );
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    impl LifecycleHook for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn on_event(&self, context: &HookContext) -> Result<(), HookError> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{:?}", context.stage.as_str(), context.task));
            Ok(())
        }
    }

    struct Panicking;

    impl LifecycleHook for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_event(&self, _context: &HookContext) -> Result<(), HookError> {
            panic!("hook blew up");
        }
    }

    #[test]
    fn test_stage_parse_roundtrip() {
        for stage in HookStage::all() {
            assert_eq!(HookStage::parse(stage.as_str()), Some(*stage));
        }
        assert_eq!(HookStage::parse("pre-release"), None);
    }

    #[test]
    fn test_context_env() {
        let ctx = HookContext::run(HookStage::AfterTask, "run-1", "abc")
            .with_task("build")
            .with_state("COMPLETED")
            .with_exit_code(Some(0));
        let env = ctx.to_env();
        assert_eq!(env.get("STRATA_STAGE").unwrap(), "after-task");
        assert_eq!(env.get("STRATA_TASK").unwrap(), "build");
        assert_eq!(env.get("STRATA_EXIT_CODE").unwrap(), "0");
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let mut registry = HookRegistry::new();
        registry.register(Panicking);
        registry.hooks.push(recording.clone());

        let ctx = HookContext::run(HookStage::BeforeRun, "run-1", "abc");
        let failures = registry.invoke(&ctx);

        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], HookError::Panicked { .. }));
        // Hooks after the panicking one still run.
        assert_eq!(recording.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shell_hook_runs_only_for_its_stage() {
        let temp = TempDir::new().unwrap();
        let hook = ShellHook::new(HookStage::AfterRun, "echo \"$STRATA_RUN_ID\" > marker")
            .with_cwd(temp.path());

        let before = HookContext::run(HookStage::BeforeRun, "run-7", "abc");
        hook.on_event(&before).unwrap();
        assert!(!temp.path().join("marker").exists());

        let after = HookContext::run(HookStage::AfterRun, "run-7", "abc");
        hook.on_event(&after).unwrap();
        let marker = std::fs::read_to_string(temp.path().join("marker")).unwrap();
        assert_eq!(marker.trim(), "run-7");
    }

    #[test]
    fn test_shell_hook_failure_reported() {
        let temp = TempDir::new().unwrap();
        let config = HooksConfig {
            after_run: vec!["exit 3".to_string()],
            ..HooksConfig::default()
        };
        let registry = HookRegistry::from_config(&config, temp.path());
        assert_eq!(registry.len(), 1);

        let failures = registry.invoke(&HookContext::run(HookStage::AfterRun, "r", "g"));
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], HookError::ExecutionFailed { .. }));
    }
}
