mod config;
mod manifest;

use clap::{Parser, Subcommand};
use config::EnsembleConfig;
use ensemble_core::logging::{self, LogFormat};
use ensemble_discovery::{dedupe_by_name, CapabilityKind};
use ensemble_orchestrator::{Orchestrator, TaskStatus};
use ensemble_resources::OptimizationOptions;
use manifest::TaskManifest;
use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "ensemble.toml";

#[derive(Parser)]
#[command(name = "ensemble", about = "Ensemble — schedule tasks onto a pool of agents")]
struct Cli {
    /// Path to config file (defaults to ./ensemble.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task manifest and wait for every task to settle
    Run {
        /// TOML manifest with [[tasks]] entries
        manifest: PathBuf,
    },
    /// Print agents, tasks, resource utilization and discovery state
    Status,
    /// Run one resource optimization pass
    Optimize {
        /// Report what would change without applying it
        #[arg(long)]
        dry_run: bool,
    },
    /// List capabilities reported by discovery sources
    Discover {
        /// agents, skills, commands or services
        kind: CapabilityKind,
        /// Bypass the cache
        #[arg(long)]
        refresh: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EnsembleConfig> {
    match path {
        Some(path) => Ok(EnsembleConfig::load(path)?),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Ok(EnsembleConfig::load(&default)?)
            } else {
                info!("No {DEFAULT_CONFIG} found, using built-in defaults");
                Ok(EnsembleConfig::default())
            }
        }
    }
}

async fn print_status(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let status = orchestrator.get_system_status().await;
    let report = serde_json::json!({
        "system": status,
        "scheduler": orchestrator.scheduler().monitor().to_json().await,
        "resources": orchestrator.get_resource_utilization(),
        "discovery": orchestrator.get_discovery_status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(format)?;

    let config = load_config(cli.config.as_ref())?;
    let orchestrator = config.build()?;
    if !config.sources.is_empty() {
        orchestrator.sync_discovered_agents(false).await;
    }

    match cli.command {
        Commands::Run { manifest } => {
            let manifest = TaskManifest::load(&manifest)?;
            let handles = orchestrator.start_background_tasks();

            let submitted = manifest.submit(&orchestrator).await?;
            info!(tasks = submitted.len(), "Manifest submitted");

            // Every dispatch, retry and dependent has settled once idle.
            orchestrator.wait_idle().await;
            let mut failed = 0usize;
            for (name, id) in &submitted {
                let Some(task) = orchestrator.task(*id).await else {
                    continue;
                };
                match task.status {
                    TaskStatus::Completed => {
                        let agents = task.assigned_agents.join(", ");
                        println!(
                            "  ✓ {name}: completed by [{agents}] in {}ms",
                            task.duration_ms().unwrap_or(0)
                        );
                    }
                    TaskStatus::Failed => {
                        failed += 1;
                        println!(
                            "  ✗ {name}: failed after {} attempt(s): {}",
                            task.attempts,
                            task.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                    TaskStatus::Pending | TaskStatus::InProgress => {
                        failed += 1;
                        println!("  - {name}: blocked on a failed dependency");
                    }
                }
            }
            print_status(&orchestrator).await?;

            for handle in handles {
                handle.abort();
            }
            if failed > 0 {
                anyhow::bail!("{failed} task(s) failed");
            }
        }
        Commands::Status => {
            print_status(&orchestrator).await?;
        }
        Commands::Optimize { dry_run } => {
            let result = orchestrator.optimize_resources(&OptimizationOptions {
                dry_run,
                ..Default::default()
            });
            if !result.success {
                warn!(
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Optimization failed"
                );
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Discover { kind, refresh } => {
            let items = dedupe_by_name(orchestrator.discovery().get_data(kind, refresh).await);
            if items.is_empty() {
                println!("No {kind} discovered.");
                println!("Configure sources in {DEFAULT_CONFIG} under [[sources]]");
            } else {
                println!("Discovered {kind}:");
                for item in &items {
                    println!("  {} — {} ({})", item.name, item.description, item.origin);
                }
                println!("\nTotal: {} item(s)", items.len());
            }
        }
    }

    Ok(())
}
