//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use strata_core::config::{load_config_or_default, Config};
use strata_core::ExitCode;
use strata_tasks::EngineError;

use commands::{CacheCommand, PlanCommand, RunCommand};

/// strata - deterministic incremental task runner
#[derive(Debug, Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute the task graph
    Run(RunCommand),

    /// Show what a run would do without executing anything
    Plan(PlanCommand),

    /// Task cache management
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command and return the process exit code
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Run(ref cmd) => cmd.execute(&self),
            Commands::Plan(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
        }
    }

    /// Resolved working directory
    pub fn working_dir(&self) -> anyhow::Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        let dir = match &self.directory {
            Some(dir) => cwd.join(dir),
            None => cwd,
        };
        if !dir.is_dir() {
            return Err(EngineError::Invocation(format!(
                "working directory {} does not exist",
                dir.display()
            ))
            .into());
        }
        Ok(dir)
    }

    /// Working directory plus the project configuration found in it
    pub fn load_config(&self) -> anyhow::Result<(PathBuf, Config)> {
        let dir = self.working_dir()?;
        let (config, path) = load_config_or_default(&dir)?;
        if let Some(path) = path {
            tracing::debug!(path = %path.display(), "using configuration");
        }
        Ok((dir, config))
    }
}
