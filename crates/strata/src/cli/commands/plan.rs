//! Plan command: show levels, hashes and decisions without executing

use std::path::PathBuf;

use clap::Args;
use console::style;

use strata_core::{ExecutionMode, ExitCode};
use strata_tasks::{Engine, RunRequest};

use crate::cli::{output, Cli, OutputFormat};

/// Show what a run would do
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Execution mode to plan for
    #[arg(long)]
    pub mode: Option<ExecutionMode>,

    /// Prior run to compare against instead of the latest one
    #[arg(long)]
    pub prior: Option<String>,

    /// Task definition file
    #[arg(long)]
    pub definition: Option<PathBuf>,

    /// Cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let (working_dir, config) = cli.load_config()?;
        let mut request = RunRequest::from_config(&working_dir, &config);
        if let Some(mode) = self.mode {
            request.mode = mode;
        }
        if let Some(definition) = &self.definition {
            request.definition = working_dir.join(definition);
        }
        if let Some(cache_dir) = &self.cache_dir {
            request.cache_dir = working_dir.join(cache_dir);
        }
        request.prior_run = self.prior.clone();

        let preview = Engine::new(request).plan()?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&preview)?);
            return Ok(ExitCode::Success);
        }
        if cli.quiet {
            return Ok(ExitCode::Success);
        }

        println!("{}", output::header("Execution Plan"));
        println!("{}", output::key_value("Graph", preview.graph_hash.as_str()));
        match (&preview.resumed_from, &preview.resume_blocker) {
            (Some(prior), _) => println!("{}", output::key_value("Resume from", prior)),
            (None, Some(blocker)) => println!("{}", output::key_value("Fresh run", blocker)),
            _ => {}
        }

        let mut rows = preview.tasks.iter().peekable();
        for (depth, level) in preview.levels.iter().enumerate() {
            println!();
            println!("  {} ({} tasks)", style(format!("Depth {}", depth)).bold(), level.len());
            while let Some(row) = rows.next_if(|r| r.depth == depth) {
                let decision = match row.decision.as_str() {
                    "execute" => style(row.decision.clone()).yellow(),
                    _ => style(row.decision.clone()).green(),
                };
                println!(
                    "    {} {} {}",
                    style(&row.task).bold(),
                    style(row.task_hash.short()).dim(),
                    decision
                );
                if cli.verbose || row.decision == "execute" {
                    for reason in &row.reasons {
                        println!("      {} {}", style("↳").dim(), reason);
                    }
                }
            }
        }

        if !preview.removed.is_empty() {
            println!();
            let removed: Vec<&str> = preview.removed.iter().map(|t| t.as_str()).collect();
            output::info(&format!("Removed since last run: {}", removed.join(", ")));
        }

        Ok(ExitCode::Success)
    }
}
