//! Command-line interface for marginflow.
//!
//! Provides commands for running the pipeline from a YAML config,
//! generating a starter config, and inspecting past runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{DockerAdapter, LocalAdapter, ToolAdapter};
use crate::config::paths::EnginePaths;
use crate::config::PipelineConfig;
use crate::core::{EventStore, FsArtifactStore};
use crate::domain::{NodeStatus, Run, RunReport, RunState};
use crate::pipeline::Pipeline;

/// marginflow - Task-graph orchestrator for nanopore alignment pipelines
#[derive(Parser, Debug)]
#[command(name = "marginflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log filter ("info", "marginflow=debug"); overrides RUST_LOG
    #[arg(long, global = true, env = "MARGINFLOW_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline described by a config file
    Run {
        /// Pipeline config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Run tools from the host PATH instead of docker images
        #[arg(long)]
        local: bool,

        /// docker binary to use
        #[arg(long, default_value = "docker")]
        docker: String,
    },

    /// Write a commented config template
    Generate {
        /// Output file (prints to stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Engine home the run was written under (the config's `home`)
        #[arg(long)]
        home: Option<PathBuf>,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Engine home to list runs from (the config's `home`)
        #[arg(long)]
        home: Option<PathBuf>,
    },
}

impl Cli {
    /// Explicit log filter from --log-level or the run's config, if any
    pub fn log_directive(&self) -> Option<String> {
        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        // A run may carry its own level in the config
        match &self.command {
            Commands::Run { config, .. } => PipelineConfig::from_file(config)
                .ok()
                .and_then(|cfg| cfg.log_level),
            _ => None,
        }
    }

    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                local,
                docker,
            } => run_pipeline(&config, local, docker).await,
            Commands::Generate { output } => generate(output),
            Commands::Status { run_id, home } => show_status(&run_id, home.as_deref()).await,
            Commands::Runs { limit, home } => list_runs(limit, home.as_deref()).await,
        }
    }
}

/// Run the configured pipeline
async fn run_pipeline(config_path: &Path, local: bool, docker: String) -> Result<()> {
    let config = PipelineConfig::from_file(config_path)?;
    let paths = EnginePaths::resolve(config.home.as_deref())?;

    let store = FsArtifactStore::open(paths.store_dir())
        .await
        .with_context(|| format!("Failed to open artifact store in {}", paths.store_dir().display()))?;

    let tools: Arc<dyn ToolAdapter> = if local {
        Arc::new(LocalAdapter::new())
    } else {
        Arc::new(DockerAdapter::with_binary_path(docker))
    };

    let pipeline = Pipeline::new(Arc::new(store), tools, paths.work_dir())
        .with_run_log(paths.runs_dir());

    let report = pipeline
        .run_with(config, |cancel| {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling nodes that have not started");
                    cancel.cancel_all();
                }
            });
        })
        .await?;

    print_report(&report);
    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let completed = report.count_with_status(NodeStatus::Completed);
    let elapsed = report.finished_at - report.started_at;

    if report.succeeded() {
        eprintln!(
            "\n[Run {} completed: {} nodes in {}s]",
            report.run_id,
            completed,
            elapsed.num_seconds()
        );
        return;
    }

    if report.cancelled && report.failures.is_empty() {
        eprintln!(
            "\n[Run {} cancelled: {} of {} nodes completed]",
            report.run_id,
            completed,
            report.nodes.len()
        );
        return;
    }

    eprintln!(
        "\n[Run {} failed: {} of {} nodes completed]",
        report.run_id,
        completed,
        report.nodes.len()
    );
    for failure in &report.failures {
        eprintln!("  {}", failure);
    }
}

/// Write or print the config template
fn generate(output: Option<PathBuf>) -> Result<()> {
    let template = PipelineConfig::template();
    match output {
        Some(path) => {
            if path.exists() {
                anyhow::bail!("Refusing to overwrite existing file: {}", path.display());
            }
            std::fs::write(&path, template)
                .with_context(|| format!("Failed to write config template: {}", path.display()))?;
            eprintln!("Wrote config template to {}", path.display());
        }
        None => print!("{}", template),
    }
    Ok(())
}

/// Engine paths for the inspection commands; `--home` beats the environment
fn engine_paths(home: Option<&Path>) -> Result<EnginePaths> {
    match home {
        Some(home) => Ok(EnginePaths::at(home)),
        None => EnginePaths::resolve(None),
    }
}

async fn open_run(run_id_str: &str, home: Option<&Path>) -> Result<(EventStore, Run)> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let paths = engine_paths(home)?;
    let store = EventStore::open_in(&paths.runs_dir(), run_id).await?;
    let events = store.replay().await?;
    let run = Run::from_events(&events).with_context(|| format!("Run not found: {}", run_id))?;
    Ok((store, run))
}

/// Show the status of a run
async fn show_status(run_id_str: &str, home: Option<&Path>) -> Result<()> {
    let (store, run) = open_run(run_id_str, home).await?;

    println!("Run ID: {}", run.id);
    println!("State: {}", state_label(&run.state));
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let RunState::Failed { error } = &run.state {
        println!("Error: {}", error);
    }

    println!("\nNodes:");
    for (id, node) in &run.nodes {
        let duration = node
            .duration_ms
            .map(|ms| format!(" ({}ms)", ms))
            .unwrap_or_default();
        println!("  {:<6} {:<32} {:?}{}", id, node.name, node.status, duration);
        if let Some(error) = &node.error {
            println!("         {}", error);
        }
    }

    if let Some(report) = store.load_report().await? {
        for failure in report.failures.iter().filter(|f| !f.inputs.is_empty()) {
            println!("\nInputs of failed node '{}':", failure.name);
            for input in &failure.inputs {
                println!("  {}", input);
            }
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize, home: Option<&Path>) -> Result<()> {
    let paths = engine_paths(home)?;
    let runs_dir = paths.runs_dir();

    let mut runs = Vec::new();
    for run_id in EventStore::list_runs(&runs_dir).await? {
        let store = EventStore::open_in(&runs_dir, run_id).await?;
        if let Some(run) = Run::from_events(&store.replay().await?) {
            runs.push(run);
        }
    }

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    println!("{:<38} {:<26} {:<10} {:>6} {:>6}", "RUN ID", "STARTED", "STATE", "DONE", "FAILED");
    println!("{}", "-".repeat(90));

    for run in runs.into_iter().take(limit) {
        println!(
            "{:<38} {:<26} {:<10} {:>6} {:>6}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            state_label(&run.state),
            run.count(NodeStatus::Completed),
            run.count(NodeStatus::Failed)
        );
    }

    Ok(())
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed { .. } => "failed",
        RunState::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_beats_config_level() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("pipeline.yaml");
        std::fs::write(
            &config,
            "reference: ref.fa\nsample: reads.fq\noutput_sam_path: out.sam\nno_realign: true\nlog_level: debug\n",
        )
        .unwrap();
        let config = config.to_str().unwrap();

        let cli = Cli::try_parse_from(["marginflow", "run", "--config", config]).unwrap();
        assert_eq!(cli.log_directive().as_deref(), Some("debug"));

        let cli = Cli::try_parse_from(["marginflow", "--log-level", "warn", "run", "--config", config]).unwrap();
        assert_eq!(cli.log_directive().as_deref(), Some("warn"));
    }

    #[test]
    fn test_no_level_without_flag_or_config() {
        let cli = Cli::try_parse_from(["marginflow", "runs", "--limit", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Runs { limit: 3, home: None }));
        if std::env::var("MARGINFLOW_LOG").is_err() {
            assert_eq!(cli.log_directive(), None);
        }
    }

    #[test]
    fn test_home_flag_selects_runs_dir() {
        let cli = Cli::try_parse_from(["marginflow", "runs", "--home", "/data/mf"]).unwrap();
        let Commands::Runs { home, .. } = cli.command else {
            panic!("expected the runs command");
        };
        let paths = engine_paths(home.as_deref()).unwrap();
        assert_eq!(paths.runs_dir(), EnginePaths::at("/data/mf").runs_dir());

        let run_id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["marginflow", "status", &run_id, "--home", "/data/mf"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Status { home: Some(ref h), .. } if h == Path::new("/data/mf")
        ));
    }

    #[tokio::test]
    async fn test_status_reads_runs_under_home() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EnginePaths::at(dir.path());
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(&paths.runs_dir(), run_id).await.unwrap();
        store
            .append(&crate::domain::Event::run(
                run_id,
                crate::domain::EventType::RunStarted,
                "Run started".to_string(),
                NodeStatus::Running,
            ))
            .await
            .unwrap();

        let (_, run) = open_run(&run_id.to_string(), Some(dir.path())).await.unwrap();
        assert_eq!(run.id, run_id);
        assert_eq!(run.state, RunState::Running);
    }
}
