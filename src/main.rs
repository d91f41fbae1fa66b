// ABOUTME: CLI entry point for the replication topology monitor
// ABOUTME: Runs the monitoring loop, one-shot topology probes and config checks

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use postgres_topology_monitor::alert::{AlertSink, LogSink, MultiSink, WebhookSink};
use postgres_topology_monitor::probe::{NodeAddr, PostgresProbe};
use postgres_topology_monitor::render::render_tree;
use postgres_topology_monitor::{Scheduler, Settings};

#[derive(Parser)]
#[command(name = "pg-topology-monitor")]
#[command(about = "Monitor PostgreSQL replication topology and lag", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SeedArgs {
    /// Node to start discovery from (host[:port]); may be repeated
    #[arg(long = "seed")]
    seeds: Vec<NodeAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the topology continuously and raise lag alerts
    Monitor {
        #[command(flatten)]
        seeds: SeedArgs,
        /// Also deliver alerts to this webhook URL
        #[arg(long)]
        webhook: Option<String>,
    },
    /// Probe the topology a few times and print it
    Probe {
        #[command(flatten)]
        seeds: SeedArgs,
        /// Number of probe cycles; the first only discovers the seeds' replicas
        #[arg(long, default_value_t = 2)]
        cycles: u32,
        /// Print node status as JSON instead of a tree
        #[arg(long)]
        json: bool,
    },
    /// Validate the settings file and exit
    CheckConfig,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn load_settings(path: Option<&PathBuf>, seeds: Vec<NodeAddr>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if !seeds.is_empty() {
        settings.seeds = seeds;
    }
    settings.validate()?;
    if settings.seeds.is_empty() {
        anyhow::bail!("No seed nodes configured. Pass --seed host:port or set `seeds` in the config file");
    }
    Ok(settings)
}

fn build_probe(settings: &Settings) -> Result<Arc<PostgresProbe>> {
    let probe = PostgresProbe::new(
        settings.connection.template.clone(),
        settings.connection.tls,
        settings.connection.replica_port,
    )?;
    Ok(Arc::new(probe))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Monitor { seeds, webhook } => {
            let mut settings = load_settings(cli.config.as_ref(), seeds.seeds)?;
            if webhook.is_some() {
                settings.webhook_url = webhook;
            }

            let mut sink = MultiSink::new(vec![Arc::new(LogSink)]);
            if let Some(url) = &settings.webhook_url {
                sink.push(Arc::new(WebhookSink::new(url.clone())?));
                info!("Delivering alerts to webhook {}", url);
            }
            let sink: Arc<dyn AlertSink> = Arc::new(sink);

            let scheduler = Scheduler::new(settings.clone(), build_probe(&settings)?, sink)?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested; finishing current cycle");
                    let _ = shutdown_tx.send(true);
                }
            });

            scheduler
                .run(shutdown_rx)
                .await
                .context("Monitoring loop failed")?;
        }
        Commands::Probe {
            seeds,
            cycles,
            json,
        } => {
            let settings = load_settings(cli.config.as_ref(), seeds.seeds)?;
            let sink: Arc<dyn AlertSink> = Arc::new(LogSink);
            let mut scheduler = Scheduler::new(settings.clone(), build_probe(&settings)?, sink)?;

            for _ in 0..cycles.max(1) {
                scheduler.run_cycle().await?;
            }

            let snapshot = scheduler.snapshot();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot)
                        .context("Failed to serialize topology")?
                );
            } else {
                print!("{}", render_tree(&snapshot));
            }
        }
        Commands::CheckConfig => {
            let settings = match cli.config.as_ref() {
                Some(path) => Settings::load(path)?,
                None => Settings::default(),
            };
            settings.validate()?;
            build_probe(&settings)?;
            println!("Configuration OK ({} seed nodes)", settings.seeds.len());
        }
    }

    Ok(())
}
