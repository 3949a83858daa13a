//! Isolated command execution
//!
//! A task runs as `/bin/sh -c <run>` in the working directory with a cleared
//! environment: only declared variables plus a fixed `PATH` are visible.
//! Network access is denied through `unshare -rn` when the host supports it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use strata_core::config::{IsolationMode, NetworkPolicy};
use strata_core::TaskSpec;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cache::{Artifact, TaskOutput};
use crate::cancel::CancelSignal;
use crate::hash::{expand_globs, relative_path, HashError};

/// Shell used for every task command
pub const SHELL: &str = "/bin/sh";

/// `PATH` given to tasks that do not declare one
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How network denial is enforced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkIsolation {
    /// Wrap commands in `unshare -rn` (binary path)
    Unshare(PathBuf),
    /// Denial is not enforced
    Advisory,
}

impl NetworkIsolation {
    /// Pick an enforcement strategy for the configured mode.
    ///
    /// `auto` probes whether an unprivileged network namespace can be
    /// created and falls back to advisory mode otherwise.
    pub fn detect(mode: IsolationMode) -> Self {
        match mode {
            IsolationMode::None => Self::Advisory,
            IsolationMode::Unshare => match which::which("unshare") {
                Ok(path) => Self::Unshare(path),
                Err(_) => {
                    warn!("unshare not found, network denial is advisory");
                    Self::Advisory
                }
            },
            IsolationMode::Auto => match which::which("unshare") {
                Ok(path) if probe_unshare(&path) => Self::Unshare(path),
                _ => {
                    debug!("network namespaces unavailable, network denial is advisory");
                    Self::Advisory
                }
            },
        }
    }

    /// Whether denial is actually enforced
    pub fn is_enforced(&self) -> bool {
        matches!(self, Self::Unshare(_))
    }
}

fn probe_unshare(unshare: &Path) -> bool {
    std::process::Command::new(unshare)
        .args(["-rn", SHELL, "-c", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Fixed execution environment shared by every task in a run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Directory every command runs in
    pub working_dir: PathBuf,
    /// Run-wide network policy
    pub network: NetworkPolicy,
    /// How denial is enforced
    pub isolation: NetworkIsolation,
    /// Engine directories never treated as task outputs
    pub excluded_dirs: Vec<PathBuf>,
}

impl ExecutionContext {
    /// Context with network denied and no enforcement
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            network: NetworkPolicy::Deny,
            isolation: NetworkIsolation::Advisory,
            excluded_dirs: Vec::new(),
        }
    }

    fn command_for(&self, spec: &TaskSpec) -> Command {
        let deny_network = self.network == NetworkPolicy::Deny && !spec.allow_network;
        let mut cmd = match &self.isolation {
            NetworkIsolation::Unshare(unshare) if deny_network => {
                let mut cmd = Command::new(unshare);
                cmd.args(["-rn", SHELL, "-c"]).arg(&spec.run);
                cmd
            }
            _ => {
                let mut cmd = Command::new(SHELL);
                cmd.arg("-c").arg(&spec.run);
                cmd
            }
        };

        cmd.current_dir(&self.working_dir)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !spec.env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }
        cmd
    }

    fn output_files(&self, patterns: &[String]) -> Result<Vec<PathBuf>, ExecError> {
        let files = expand_globs(&self.working_dir, patterns)?;
        Ok(files
            .into_iter()
            .filter(|p| !self.excluded_dirs.iter().any(|dir| p.starts_with(dir)))
            .collect())
    }

    /// Remove existing files matching the declared outputs so a run can
    /// never pick up stale files
    pub fn clear_outputs(&self, spec: &TaskSpec) -> Result<(), ExecError> {
        for path in self.output_files(&spec.outputs)? {
            fs::remove_file(&path).map_err(|source| ExecError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Read every file matching the declared outputs, sorted by path
    pub fn collect_artifacts(&self, spec: &TaskSpec) -> Result<Vec<Artifact>, ExecError> {
        let mut artifacts = Vec::new();
        for path in self.output_files(&spec.outputs)? {
            let contents = fs::read(&path).map_err(|source| ExecError::Io {
                path: path.clone(),
                source,
            })?;
            artifacts.push(Artifact {
                path: relative_path(&self.working_dir, &path),
                contents,
            });
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(artifacts)
    }
}

/// How a command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The process exited with a code
    Finished(TaskOutput),
    /// The process was killed by a signal
    Terminated,
    /// The run was cancelled before or during execution
    Cancelled,
}

/// Run one task's command to completion or cancellation
pub async fn run_task(
    ctx: &ExecutionContext,
    spec: &TaskSpec,
    cancel: &CancelSignal,
) -> Result<ExecOutcome, ExecError> {
    if cancel.is_cancelled() {
        return Ok(ExecOutcome::Cancelled);
    }

    ctx.clear_outputs(spec)?;
    let child = ctx.command_for(spec).spawn().map_err(ExecError::Spawn)?;

    // Dropping the child kills it, so losing the race to cancellation
    // terminates the process.
    let output = tokio::select! {
        result = child.wait_with_output() => result.map_err(ExecError::Wait)?,
        _ = cancel.cancelled() => return Ok(ExecOutcome::Cancelled),
    };

    let exit_code = match output.status.code() {
        Some(code) => code,
        None => return Ok(ExecOutcome::Terminated),
    };

    Ok(ExecOutcome::Finished(TaskOutput {
        exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        artifacts: ctx.collect_artifacts(spec)?,
    }))
}

/// Errors that prevent a command from producing a result
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process could not be started
    #[error("Failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting for the process failed
    #[error("Failed to wait: {0}")]
    Wait(#[source] std::io::Error),

    /// An output file could not be handled
    #[error("Output '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output patterns could not be expanded
    #[error(transparent)]
    Pattern(#[from] HashError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn run(ctx: &ExecutionContext, spec: &TaskSpec) -> TaskOutput {
        match run_task(ctx, spec, &CancelSignal::new()).await.unwrap() {
            ExecOutcome::Finished(output) => output,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let temp = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("printf 'out\\n'; printf 'err' >&2; exit 3");

        let output = run(&ctx, &spec).await;
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err");
    }

    #[tokio::test]
    async fn test_only_declared_env_visible() {
        std::env::set_var("STRATA_EXECUTOR_LEAK", "leaked");
        let temp = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("printf '%s|%s|%s' \"$GREETING\" \"$STRATA_EXECUTOR_LEAK\" \"$PATH\"")
            .with_env("GREETING", "hi");

        let output = run(&ctx, &spec).await;
        assert_eq!(
            String::from_utf8(output.stdout).unwrap(),
            format!("hi||{}", DEFAULT_PATH)
        );
    }

    #[tokio::test]
    async fn test_runs_in_working_dir_and_collects_artifacts() {
        let temp = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("mkdir -p out && printf b > out/b.txt && printf a > out/a.txt")
            .with_output("out/*.txt");

        let output = run(&ctx, &spec).await;
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.artifact_paths(), vec!["out/a.txt", "out/b.txt"]);
        assert_eq!(output.artifacts[0].contents, b"a");
    }

    #[tokio::test]
    async fn test_stale_outputs_removed_before_run() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("result.txt"), "stale").unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("true").with_output("result.txt");

        let output = run(&ctx, &spec).await;
        assert!(output.artifacts.is_empty());
        assert!(!temp.path().join("result.txt").exists());
    }

    #[tokio::test]
    async fn test_signal_termination() {
        let temp = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("kill -9 $$");

        let outcome = run_task(&ctx, &spec, &CancelSignal::new()).await.unwrap();
        assert_eq!(outcome, ExecOutcome::Terminated);
    }

    #[tokio::test]
    async fn test_cancellation_kills_command() {
        let temp = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("sleep 30");
        let cancel = CancelSignal::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(10), run_task(&ctx, &spec, &cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_not_run() {
        let temp = TempDir::new().unwrap();
        let ctx = ExecutionContext::new(temp.path());
        let spec = TaskSpec::new("printf x > ran.txt");
        let cancel = CancelSignal::new();
        cancel.cancel();

        let outcome = run_task(&ctx, &spec, &cancel).await.unwrap();
        assert_eq!(outcome, ExecOutcome::Cancelled);
        assert!(!temp.path().join("ran.txt").exists());
    }

    #[test]
    fn test_detect_none_is_advisory() {
        assert_eq!(NetworkIsolation::detect(IsolationMode::None), NetworkIsolation::Advisory);
        assert!(!NetworkIsolation::Advisory.is_enforced());
    }
}
