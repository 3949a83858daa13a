//! Exit codes for the CLI

use strata_core::{ConfigError, ExitCode, StrataError};
use strata_tasks::EngineError;

/// Map an error that escaped a command to a process exit code
pub fn for_error(error: &anyhow::Error) -> ExitCode {
    if let Some(engine) = error.downcast_ref::<EngineError>() {
        return engine.exit_code();
    }
    match error.downcast_ref::<StrataError>() {
        Some(StrataError::Config(ConfigError::Io(_))) => ExitCode::Internal,
        Some(StrataError::Config(_)) => ExitCode::Configuration,
        Some(StrataError::Definition(_)) => ExitCode::Failure,
        _ => ExitCode::Internal,
    }
}
