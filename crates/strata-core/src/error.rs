//! Error types for strata

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata core operations
#[derive(Debug, Error)]
pub enum StrataError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Task definition errors
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// Lifecycle hook errors
    #[error(transparent)]
    Hook(#[from] HookError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading or validating a task definition file
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Definition file does not exist
    #[error("Task definition not found at {0}")]
    NotFound(PathBuf),

    /// File extension is not one of the supported formats
    #[error("Unsupported task definition format: {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),

    /// Syntax or schema error reported by the decoder
    #[error("Failed to parse task definition: {0}")]
    Parse(String),

    /// The same task name appears twice
    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    /// A field failed validation
    #[error("Invalid task '{task}': {field} - {message}")]
    InvalidTask {
        task: String,
        field: String,
        message: String,
    },

    /// IO error
    #[error("IO error reading task definition: {0}")]
    Io(#[from] std::io::Error),
}

/// Hook-related errors
#[derive(Debug, Error)]
pub enum HookError {
    /// Hook command failed to run or returned non-zero
    #[error("Hook '{command}' failed at stage {stage}: {message}")]
    ExecutionFailed {
        stage: String,
        command: String,
        message: String,
    },

    /// Hook panicked inside the recoverable boundary
    #[error("Hook '{hook}' panicked at stage {stage}")]
    Panicked { stage: String, hook: String },
}

impl StrataError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_task_message() {
        let err = DefinitionError::InvalidTask {
            task: "build".to_string(),
            field: "run".to_string(),
            message: "must not be empty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid task 'build': run - must not be empty"
        );
    }

    #[test]
    fn test_transparent_wrapping() {
        let err: StrataError = DefinitionError::DuplicateTask("lint".to_string()).into();
        assert_eq!(err.to_string(), "Duplicate task name: lint");
    }
}
