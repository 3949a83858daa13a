//! strata core - foundations for the strata execution engine
//!
//! This crate provides the error taxonomy, configuration, task definition
//! parsing and lifecycle hooks shared by the engine and the CLI.

pub mod config;
pub mod definition;
pub mod error;
pub mod hooks;
pub mod types;

pub use definition::{load_definition, parse_definition, DefinitionFormat, TaskDefinitions, TaskSpec};
pub use error::{ConfigError, DefinitionError, HookError, Result, StrataError};
pub use hooks::{HookContext, HookRegistry, HookStage, LifecycleHook, ShellHook};
pub use types::{ExecutionMode, ExitCode, FailureClass, Resumability};
