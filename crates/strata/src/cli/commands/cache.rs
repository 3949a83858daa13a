//! Cache management command

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use console::style;

use strata_core::ExitCode;
use strata_tasks::{RunRequest, TaskCache};

use crate::cli::{Cli, OutputFormat};

/// Task cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    /// Cache directory (default: from configuration)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove old cache entries
    Prune(CachePruneCommand),
    /// Show cache statistics
    Status(CacheStatusCommand),
    /// Clear all cached entries
    Clean(CacheCleanCommand),
}

/// Prune old cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Maximum age in days (default: 7)
    #[arg(long, default_value = "7")]
    pub max_age_days: u64,
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Clear all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let cache = self.cache(cli)?;
        match &self.action {
            CacheAction::Prune(cmd) => cmd.execute(cli, &cache),
            CacheAction::Status(cmd) => cmd.execute(cli, &cache),
            CacheAction::Clean(cmd) => cmd.execute(cli, &cache),
        }?;
        Ok(ExitCode::Success)
    }

    fn cache(&self, cli: &Cli) -> anyhow::Result<TaskCache> {
        let (working_dir, config) = cli.load_config()?;
        let cache_dir = match &self.cache_dir {
            Some(dir) => working_dir.join(dir),
            None => RunRequest::from_config(&working_dir, &config).cache_dir,
        };
        Ok(TaskCache::new(cache_dir))
    }
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli, cache: &TaskCache) -> anyhow::Result<()> {
        let max_age = Duration::from_secs(self.max_age_days * 24 * 60 * 60);

        if !cli.quiet && cli.format == OutputFormat::Text {
            println!(
                "{} Pruning cache entries older than {} days...",
                style("→").blue(),
                self.max_age_days
            );
        }

        let stats = cache.prune(max_age)?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "total": stats.total,
                "removed": stats.removed,
                "kept": stats.kept,
                "blobs_removed": stats.blobs_removed,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "  {} Removed {} of {} entries ({} kept, {} unreferenced blobs removed)",
                style("✓").green(),
                stats.removed,
                stats.total,
                stats.kept,
                stats.blobs_removed
            );
        }

        Ok(())
    }
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli, cache: &TaskCache) -> anyhow::Result<()> {
        let stats = cache.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "entries": stats.entries,
                "blobs": stats.blobs,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "cache_dir": cache.cache_dir().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", style("Task Cache Status").bold());
            println!();
            println!("  Location: {}", style(cache.cache_dir().display()).cyan());
            println!("  Entries:  {}", stats.entries);
            println!("  Blobs:    {}", stats.blobs);
            println!("  Size:     {}", style(stats.formatted_size()).yellow());
        }

        Ok(())
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli, cache: &TaskCache) -> anyhow::Result<()> {
        let cache_dir = cache.cache_dir().to_path_buf();

        if !cache_dir.exists() {
            if !cli.quiet {
                println!("{} Cache directory does not exist.", style("✓").green());
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all cached entries at {}?",
                    cache_dir.display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        cache.clear()?;

        if !cli.quiet {
            println!(
                "{} Cache cleared at {}",
                style("✓").green(),
                style(cache_dir.display()).cyan()
            );
        }

        Ok(())
    }
}
