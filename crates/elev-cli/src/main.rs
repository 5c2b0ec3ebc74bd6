use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use elev_core::EntityKind;
use elev_sync::{SyncConfig, SyncOrchestrator};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "elev")]
#[command(about = "Elevation catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scheduler tick, or force a subtree refresh.
    Sync {
        /// Refresh the whole catalog regardless of intervals.
        #[arg(long, conflicts_with_all = ["kind", "id"])]
        full: bool,
        /// Root of a forced subtree refresh.
        #[arg(long, requires = "id")]
        kind: Option<EntityKind>,
        #[arg(long, requires = "kind")]
        id: Option<i64>,
        /// Print the tick plan without running it.
        #[arg(long)]
        dry_run: bool,
    },
    Migrate,
    /// Serve the JSON API without the scheduler.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: SocketAddr,
    },
    /// Serve the JSON API and run the cron scheduler until interrupted.
    Run {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: SocketAddr,
    },
    /// List stored policies and their validation problems.
    Policies,
    /// Re-queue parse claims that outlived the job timeout.
    Sweep,
    ImportArtifact {
        #[arg(long)]
        elevation: i64,
        file: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

async fn orchestrator() -> Result<Arc<SyncOrchestrator>> {
    let config = SyncConfig::from_env();
    let orchestrator = SyncOrchestrator::from_config(config)
        .await
        .context("starting sync orchestrator")?;
    Ok(Arc::new(orchestrator))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        full: false,
        kind: None,
        id: None,
        dry_run: false,
    }) {
        Commands::Sync {
            full,
            kind,
            id,
            dry_run,
        } => {
            let orchestrator = orchestrator().await?;
            if dry_run {
                return print_json(&orchestrator.preview().await?);
            }
            let summary = match (full, kind.zip(id)) {
                (true, _) => orchestrator.force_sync(None).await?,
                (false, Some(root)) => orchestrator.force_sync(Some(root)).await?,
                (false, None) => match orchestrator.run_tick().await? {
                    Some(summary) => summary,
                    None => bail!("another tick is still running"),
                },
            };
            println!(
                "sync complete: run_id={} status={} items={} created={} updated={} parsed={} failed_jobs={}",
                summary.run_id,
                summary.status(),
                summary.work_items,
                summary.entities.created,
                summary.entities.updated,
                summary.artifacts_parsed,
                summary.jobs_failed
            );
            for err in &summary.errors {
                eprintln!("  error: {err}");
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            elev_storage::db::open(&config.database_url).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Serve { addr } => {
            elev_web::serve(orchestrator().await?, addr).await?;
        }
        Commands::Run { addr } => {
            let orchestrator = orchestrator().await?;
            let scheduler = Arc::clone(&orchestrator).start_scheduler().await?;
            if scheduler.is_none() {
                warn!("scheduler disabled; set ELEV_SCHEDULER_ENABLED=true to run ticks");
            }
            tokio::select! {
                served = elev_web::serve(Arc::clone(&orchestrator), addr) => served?,
                _ = tokio::signal::ctrl_c() => info!("interrupt received; shutting down"),
            }
            orchestrator.cancel();
            if let Some(mut scheduler) = scheduler {
                scheduler.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Policies => {
            let orchestrator = orchestrator().await?;
            for row in orchestrator.repo().policy_rows().await? {
                let status = match row.validate() {
                    Ok(_) => "ok".to_string(),
                    Err(err) => format!("skipped: {err}"),
                };
                println!(
                    "{:<10} every {:>6}s stale after {:>6}s priority {:>3} depends_on {:<10} cascade {:<5} {}",
                    row.target,
                    row.interval_secs,
                    row.staleness_threshold_secs,
                    row.priority,
                    row.depends_on.as_deref().unwrap_or("-"),
                    row.cascade,
                    status
                );
            }
        }
        Commands::Sweep => {
            let swept = orchestrator().await?.sweep().await?;
            println!("re-queued {} expired parse claims {:?}", swept.len(), swept);
        }
        Commands::ImportArtifact { elevation, file } => {
            let outcome = orchestrator()
                .await?
                .import_artifact(elevation, &file)
                .await?;
            print_json(&outcome)?;
        }
    }

    Ok(())
}
