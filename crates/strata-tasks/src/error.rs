//! Engine-level errors and their failure classes

use strata_core::{DefinitionError, ExitCode, FailureClass};

use crate::cache::CacheError;
use crate::checkpoint::{CheckpointError, ResumeBlocker};
use crate::dag::DagError;
use crate::hash::HashError;
use crate::scheduler::SchedulerError;

/// Errors that stop a run before or during execution
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The caller passed something unusable
    #[error("Invalid invocation: {0}")]
    Invocation(String),

    /// The definition file could not be read or failed validation
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// The graph is structurally invalid
    #[error(transparent)]
    Graph(#[from] DagError),

    /// Inputs could not be hashed
    #[error(transparent)]
    Hash(#[from] HashError),

    /// The workspace is not in a usable state
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// A configured location cannot be used
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resume was required but is impossible
    #[error("Cannot resume: {blocker}")]
    Resume { blocker: ResumeBlocker },

    /// Cache failure outside a task
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Run store failure
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Execution aborted because results could not be persisted
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl EngineError {
    /// Failure class of this error
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Invocation(_) => FailureClass::Invocation,
            Self::Definition(DefinitionError::NotFound(_) | DefinitionError::UnsupportedFormat(_)) => {
                FailureClass::Invocation
            }
            Self::Definition(_) | Self::Graph(_) => FailureClass::Graph,
            Self::Hash(HashError::Io { .. }) => FailureClass::Workspace,
            Self::Hash(HashError::Pattern { .. }) => FailureClass::Graph,
            Self::Hash(HashError::Unordered(_)) => FailureClass::System,
            Self::Workspace(_) => FailureClass::Workspace,
            Self::Configuration(_) => FailureClass::Configuration,
            Self::Resume { blocker } => blocker.failure_class(),
            Self::Cache(_) | Self::Checkpoint(_) | Self::Scheduler(_) => FailureClass::System,
        }
    }

    /// Process exit code for this error.
    ///
    /// A mandatory resume that cannot happen is an invocation error whatever
    /// blocked it; the blocker's own class is only reported.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Resume { .. } => ExitCode::InvalidInvocation,
            _ => self.failure_class().exit_code(),
        }
    }
}
