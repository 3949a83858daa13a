//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::ExecutionMode;

use super::defaults::{
    DEFAULT_CACHE_DIR, DEFAULT_DEFINITION_FILE, DEFAULT_OUTPUT_DIR, DEFAULT_RUNS_DIR,
};

/// Main configuration for strata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine behavior
    pub engine: EngineConfig,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// Task isolation
    pub sandbox: SandboxConfig,

    /// Lifecycle hooks
    pub hooks: HooksConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tasks running at once within a depth level
    pub concurrency: usize,

    /// Default execution mode
    pub mode: ExecutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            mode: ExecutionMode::default(),
        }
    }
}

/// Number of workers used when nothing is configured
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Filesystem layout. Relative paths resolve against the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Task definition file
    pub definition: PathBuf,

    /// Content-addressed cache root
    pub cache_dir: PathBuf,

    /// Run records and checkpoints
    pub runs_dir: PathBuf,

    /// Where artifacts are materialized
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            definition: PathBuf::from(DEFAULT_DEFINITION_FILE),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            runs_dir: PathBuf::from(DEFAULT_RUNS_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl PathsConfig {
    /// Resolve every path against a working directory
    pub fn resolve(&self, working_dir: &std::path::Path) -> Self {
        Self {
            definition: working_dir.join(&self.definition),
            cache_dir: working_dir.join(&self.cache_dir),
            runs_dir: working_dir.join(&self.runs_dir),
            output_dir: working_dir.join(&self.output_dir),
        }
    }
}

/// Network access granted to task commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// Tasks run without network unless they opt in with `allow_network`
    #[default]
    Deny,
    /// Every task may use the network
    Allow,
}

/// How network denial is enforced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Use `unshare` when the host supports it
    #[default]
    Auto,
    /// Always wrap commands in `unshare -rn`
    Unshare,
    /// No enforcement
    None,
}

/// Sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default network policy
    pub network: NetworkPolicy,

    /// Enforcement mechanism
    pub isolation: IsolationMode,
}

/// Shell commands run at lifecycle stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HooksConfig {
    /// Commands to run before the first task is dispatched
    pub before_run: Vec<String>,

    /// Commands to run before each task
    pub before_task: Vec<String>,

    /// Commands to run after each task reaches a terminal state
    pub after_task: Vec<String>,

    /// Commands to run after the run finishes
    pub after_run: Vec<String>,
}

impl HooksConfig {
    /// Whether any hook command is configured
    pub fn is_empty(&self) -> bool {
        self.before_run.is_empty()
            && self.before_task.is_empty()
            && self.after_task.is_empty()
            && self.after_run.is_empty()
    }
}
