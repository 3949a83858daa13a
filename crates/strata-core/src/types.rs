//! Core types shared between the engine and the CLI boundary

use serde::{Deserialize, Serialize};

/// How a run treats checkpoints left behind by a previous run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Ignore checkpoints; the cache is still consulted
    Clean,
    /// Resume where possible, otherwise start fresh
    #[default]
    Incremental,
    /// Fail if the prior run cannot be resumed
    ResumeOnly,
}

impl ExecutionMode {
    /// Returns the string representation of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Incremental => "incremental",
            Self::ResumeOnly => "resume-only",
        }
    }

    /// Whether checkpoints from a prior run may be used
    pub fn uses_checkpoints(&self) -> bool {
        !matches!(self, Self::Clean)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clean" => Ok(Self::Clean),
            "incremental" => Ok(Self::Incremental),
            "resume-only" | "resume_only" => Ok(Self::ResumeOnly),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Semantic process exit code produced by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    /// Every task completed or was replayed successfully
    Success,
    /// Graph or execution failure
    Failure,
    /// Invalid invocation
    InvalidInvocation,
    /// Deterministic configuration error (e.g. unwritable output dir)
    Configuration,
    /// Internal or system error
    Internal,
}

impl ExitCode {
    /// Numeric process exit code
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::InvalidInvocation => 2,
            Self::Configuration => 3,
            Self::Internal => 4,
        }
    }
}

/// Whether work lost to a failure class can be picked up again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumability {
    /// The run must start over
    Never,
    /// Only nodes holding a valid checkpoint are kept
    PerNode,
    /// Resumable as long as checkpoints exist
    IfCheckpointed,
}

/// Failure taxonomy used to pick exit codes and resume behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Schema violation, structural error, hash mismatch
    Graph,
    /// Invalid workspace structure or unauthorized mutation
    Workspace,
    /// Node, tool or I/O error during a task
    Execution,
    /// Crash, terminate signal, power loss
    System,
    /// The caller asked for something impossible
    Invocation,
    /// Deterministic configuration problem
    Configuration,
}

impl FailureClass {
    /// Resume policy for this class
    pub fn resumability(&self) -> Resumability {
        match self {
            Self::Graph | Self::Workspace | Self::Invocation | Self::Configuration => {
                Resumability::Never
            }
            Self::Execution => Resumability::PerNode,
            Self::System => Resumability::IfCheckpointed,
        }
    }

    /// Exit code reported for this class
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Graph | Self::Execution => ExitCode::Failure,
            Self::Invocation => ExitCode::InvalidInvocation,
            Self::Workspace | Self::Configuration => ExitCode::Configuration,
            Self::System => ExitCode::Internal,
        }
    }
}
