//! CLI command definitions for pkgorch.
//!
//! `simulate` drives a real orchestrator with simulated package commands,
//! `config` prints the configuration resolved from the environment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use super::simulation::{
    log_progress, simulated_catalog, OperationReport, SimulationSettings, SIMULATED_VERSION,
};
use crate::config::OrchestratorConfig;
use crate::context::{CancelReason, ExecutionContext};
use crate::orchestrator::{
    OperationIdentity, OperationType, Orchestrator, QueueItemFactory, QueueStats,
};
use crate::source::{Manifest, RepositorySource, SearchRequest};

/// Default source id for simulated operations.
const DEFAULT_SOURCE: &str = "community";

/// Package operation orchestrator.
#[derive(Parser)]
#[command(name = "pkgorch")]
#[command(about = "Run package operations through a bounded, de-duplicating orchestrator")]
#[command(version)]
#[command(
    long_about = "pkgorch admits install, upgrade, uninstall and repair operations, runs them on per-category worker queues and reports how each one ended.\n\nExample usage:\n  pkgorch simulate --install Contoso.App,Fabrikam.Tool --uninstall Old.App --cancel Fabrikam.Tool"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run simulated package operations and report their outcome.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Print the orchestrator configuration resolved from the environment.
    Config(ConfigArgs),
}

/// Report format.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Arguments for `pkgorch simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Comma-separated package ids to install.
    #[arg(long, value_delimiter = ',')]
    pub install: Vec<String>,

    /// Comma-separated package ids to upgrade.
    #[arg(long, value_delimiter = ',')]
    pub upgrade: Vec<String>,

    /// Comma-separated package ids to uninstall.
    #[arg(long, value_delimiter = ',')]
    pub uninstall: Vec<String>,

    /// Comma-separated package ids to repair.
    #[arg(long, value_delimiter = ',')]
    pub repair: Vec<String>,

    /// Source id used for every operation.
    #[arg(short, long, env = "PKGORCH_SOURCE", default_value = DEFAULT_SOURCE)]
    pub source: String,

    /// Progress steps per simulated command.
    #[arg(long, default_value = "5")]
    pub steps: u64,

    /// Delay of each step in milliseconds.
    #[arg(long, default_value = "20")]
    pub step_ms: u64,

    /// Comma-separated package ids whose commands fail.
    #[arg(long, value_delimiter = ',')]
    pub fail: Vec<String>,

    /// Comma-separated package ids to cancel after `--cancel-after-ms`.
    #[arg(long, value_delimiter = ',')]
    pub cancel: Vec<String>,

    /// Delay before cancellations are sent, in milliseconds.
    #[arg(long, default_value = "50")]
    pub cancel_after_ms: u64,

    /// Output format.
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl SimulateArgs {
    /// Requested operations in admission order.
    fn requests(&self) -> Vec<(OperationType, &str)> {
        let groups = [
            (OperationType::Install, &self.install),
            (OperationType::Upgrade, &self.upgrade),
            (OperationType::Uninstall, &self.uninstall),
            (OperationType::Repair, &self.repair),
        ];
        groups
            .into_iter()
            .flat_map(|(operation, ids)| {
                ids.iter()
                    .filter(|id| !id.trim().is_empty())
                    .map(move |id| (operation, id.as_str()))
            })
            .collect()
    }
}

/// Arguments for `pkgorch config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Output format.
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate(args) => run_simulate_command(args).await,
        Commands::Config(args) => run_config_command(args),
    }
}

// ============================================================================
// Simulate
// ============================================================================

#[derive(Debug, Serialize)]
struct SimulationOutput {
    operations: Vec<OperationReport>,
    queues: Vec<QueueStats>,
}

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    let requests = args.requests();
    if requests.is_empty() {
        anyhow::bail!(
            "Nothing to do: pass at least one of --install, --upgrade, --uninstall or --repair"
        );
    }

    let config =
        OrchestratorConfig::from_env().context("Failed to load orchestrator configuration")?;
    let orchestrator = Orchestrator::new(config).context("Invalid orchestrator configuration")?;

    let settings =
        SimulationSettings::new(args.steps, Duration::from_millis(args.step_ms), &args.fail);
    let factory = QueueItemFactory::new(Arc::new(simulated_catalog(settings)));

    let (report_tx, report_rx) = crossbeam_channel::unbounded();
    let mut reports = Vec::new();
    let mut admitted = 0usize;

    for (operation, package_id) in requests {
        let context =
            ExecutionContext::new().with_manifest(Manifest::new(package_id, SIMULATED_VERSION));
        log_progress(&context, package_id);

        let item = match operation {
            OperationType::Install => factory.for_install(package_id, &args.source, context),
            OperationType::Upgrade => factory.for_upgrade(package_id, &args.source, context),
            OperationType::Uninstall => factory.for_uninstall(package_id, &args.source, context),
            _ => factory.for_repair(package_id, &args.source, context),
        }
        .with_context(|| format!("Failed to build {} operation for {}", operation, package_id))?;
        let item = Arc::new(item);

        let tx = report_tx.clone();
        item.add_completion_handler(move |done| {
            let _ = tx.send(OperationReport::completed(done));
        });

        match orchestrator.enqueue_and_run(Arc::clone(&item)) {
            Ok(()) => admitted += 1,
            Err(e) if e.is_duplicate() => {
                warn!(package_id = %package_id, "{}", e);
                reports.push(OperationReport::rejected(&item, e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    drop(report_tx);

    let installing = orchestrator
        .installing_source()
        .search(&SearchRequest::default());
    info!(
        admitted,
        installing = installing.len(),
        "Operations admitted"
    );

    if !args.cancel.is_empty() {
        let orchestrator = orchestrator.clone();
        let ids: Vec<_> = args
            .cancel
            .iter()
            .map(|id| OperationIdentity::new(id.as_str(), args.source.as_str()))
            .collect();
        let delay = Duration::from_millis(args.cancel_after_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for id in ids {
                let found = orchestrator.cancel(&id);
                info!(package_id = %id.package_id(), found, "Cancellation requested");
            }
        });
    }

    let mut collector =
        tokio::task::spawn_blocking(move || report_rx.iter().take(admitted).collect::<Vec<_>>());

    let completed = tokio::select! {
        result = &mut collector => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling running operations");
            orchestrator.signal_termination(CancelReason::CtrlSignal);
            orchestrator.cancel_queued_items(CancelReason::CtrlSignal);
            collector.await?
        }
    };
    reports.extend(completed);

    let shutdown = orchestrator.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown(CancelReason::AppShutdown)).await?;

    let output = SimulationOutput {
        operations: reports,
        queues: orchestrator.queue_stats(),
    };
    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&output)
                .context("Failed to serialize simulation report")?;
            println!("{}", json);
        }
        OutputFormat::Text => print_simulation(&output),
    }

    Ok(())
}

fn print_simulation(output: &SimulationOutput) {
    println!(
        "{:<28} {:<15} {:<10} {:>8}  DETAIL",
        "PACKAGE", "OPERATION", "STATUS", "MS"
    );
    for report in &output.operations {
        println!(
            "{:<28} {:<15} {:<10} {:>8}  {}",
            report.package_id,
            report.operation.command_name(),
            report.status,
            report.duration_ms,
            report.detail.as_deref().unwrap_or("-")
        );
    }

    println!();
    for queue in &output.queues {
        println!(
            "queue {:<12} workers={} completed={} panicked={}",
            queue.name,
            queue.pool.num_workers,
            queue.pool.tasks_completed,
            queue.pool.tasks_panicked
        );
    }
}

// ============================================================================
// Config
// ============================================================================

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config =
        OrchestratorConfig::from_env().context("Failed to load orchestrator configuration")?;
    config.validate()?;

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize configuration")?;
            println!("{}", json);
        }
        OutputFormat::Text => {
            println!("default_concurrency: {}", config.default_concurrency);
            println!("thread_name_prefix:  {}", config.thread_name_prefix);
            println!("queues:");
            for (queue, workers) in &config.queue_limits {
                println!("  {:<12} {}", queue, workers);
            }
            println!("routes:");
            for (command, queue) in &config.routes {
                println!("  {:<12} -> {}", command, queue);
            }
        }
    }
    Ok(())
}
