//! Run command: execute the task graph

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use console::style;

use strata_core::{ExecutionMode, ExitCode, HookRegistry};
use strata_tasks::{
    Engine, RunOutcome, RunRequest, RunStatus, TaskEvent, TaskReporter, TaskReporterRegistry,
};

use crate::cli::{output, Cli, OutputFormat};

/// Execute the task graph
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Execution mode
    #[arg(long)]
    pub mode: Option<ExecutionMode>,

    /// Prior run to resume instead of the latest one
    #[arg(long)]
    pub prior: Option<String>,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Task definition file
    #[arg(long)]
    pub definition: Option<PathBuf>,

    /// Cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Output directory for artifacts
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    /// Apply command-line overrides on top of the configured request
    fn request(&self, cli: &Cli) -> anyhow::Result<(RunRequest, HookRegistry)> {
        let (working_dir, config) = cli.load_config()?;
        let mut request = RunRequest::from_config(&working_dir, &config);
        if let Some(mode) = self.mode {
            request.mode = mode;
        }
        if let Some(concurrency) = self.concurrency {
            request.concurrency = concurrency;
        }
        if let Some(definition) = &self.definition {
            request.definition = working_dir.join(definition);
        }
        if let Some(cache_dir) = &self.cache_dir {
            request.cache_dir = working_dir.join(cache_dir);
        }
        if let Some(output_dir) = &self.output_dir {
            request.output_dir = working_dir.join(output_dir);
        }
        request.prior_run = self.prior.clone();

        let hooks = HookRegistry::from_config(&config.hooks, &working_dir);
        Ok((request, hooks))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let (request, hooks) = self.request(cli)?;

        let mut reporters = TaskReporterRegistry::new();
        if !cli.quiet && cli.format == OutputFormat::Text {
            reporters.register(ConsoleReporter::new(cli.verbose));
        }
        let reporter: Arc<dyn TaskReporter> = Arc::new(reporters);

        if !cli.quiet && cli.format == OutputFormat::Text {
            println!(
                "{} Running {} ({} mode)",
                style("→").blue(),
                style(request.definition.display()).cyan(),
                request.mode
            );
            println!();
        }

        let engine = Engine::new(request).with_reporter(reporter).with_hooks(hooks);

        let cancel = engine.cancel_signal();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });

        let outcome = engine.run().await?;

        if cli.format == OutputFormat::Json {
            let mut value = serde_json::to_value(&outcome)?;
            value["exit_code"] = serde_json::json!(outcome.exit_code().code());
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else if !cli.quiet {
            print_summary(&outcome, cli.verbose);
        }

        Ok(outcome.exit_code())
    }
}

fn print_summary(outcome: &RunOutcome, verbose: bool) {
    println!();
    println!("{}", output::key_value("Run", &outcome.run_id));
    println!("{}", output::key_value("Graph", &outcome.graph_hash.to_string()));
    match (&outcome.resumed_from, &outcome.resume_blocker) {
        (Some(prior), _) => println!("{}", output::key_value("Resumed from", prior)),
        (None, Some(blocker)) if verbose => {
            println!("{}", output::key_value("Fresh run", &blocker.to_string()))
        }
        _ => {}
    }

    if verbose && !outcome.invalidation.is_empty() {
        println!();
        println!("{}", output::header("Invalidated"));
        for (task, reasons) in &outcome.invalidation {
            let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
            println!("  {} {}", style(task).bold(), style(reasons.join(", ")).dim());
        }
    }

    let artifacts = outcome.result.artifact_paths();
    if verbose && !artifacts.is_empty() {
        println!();
        println!("{}", output::header("Artifacts"));
        for path in artifacts {
            println!("  {}", output::path_style().apply_to(path));
        }
    }

    println!();
    match outcome.status {
        RunStatus::Completed => output::success("Run completed"),
        RunStatus::Interrupted => output::warning(&format!(
            "Run interrupted, {} task(s) not finished. Resume with: strata run --prior {}",
            outcome.result.pending(),
            outcome.run_id
        )),
        _ => output::error("Run failed"),
    }
}

/// Console reporter with live output
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Started { id, command } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(id).bold(),
                    if self.verbose {
                        style(format!("({})", command)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if self.verbose {
                    if *is_stderr {
                        println!("    {} {}", style(format!("[{}]", id)).red().dim(), line);
                    } else {
                        println!("    {} {}", style(format!("[{}]", id)).dim(), line);
                    }
                }
            }
            TaskEvent::Completed {
                id,
                duration,
                cached,
            } => {
                if *cached {
                    println!(
                        "  {} {} {} {}",
                        style("✓").green(),
                        style(id).green(),
                        style("(cached)").cyan(),
                        style(format!("{:.1}s", duration.as_secs_f64())).dim()
                    );
                } else {
                    println!(
                        "  {} {} {}",
                        style("✓").green(),
                        style(id).green(),
                        style(format!("{:.1}s", duration.as_secs_f64())).dim()
                    );
                }
            }
            TaskEvent::Failed {
                id,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::Skipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            TaskEvent::Cancelled { id } => {
                println!("  {} {} {}", style("■").yellow(), style(id).yellow(), style("(interrupted)").dim());
            }
            TaskEvent::WaveStarted { depth, task_count } => {
                if self.verbose {
                    println!("  {} Depth {} ({} tasks)", style("─").dim(), depth, task_count);
                }
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                cached,
                skipped,
                duration,
            } => {
                println!();
                println!(
                    "  {} {}/{} succeeded, {} failed, {} cached, {} skipped ({:.1}s)",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    succeeded,
                    total,
                    failed,
                    cached,
                    skipped,
                    duration.as_secs_f64()
                );
            }
        }
    }
}
