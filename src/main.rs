//! # Harvest CLI
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest run` | Expand the graph until the request budget or the frontier runs out |
//! | `harvest status` | Summarize the current checkpoint |
//! | `harvest validate` | Drop items that no longer exist upstream |
//! | `harvest refresh` | Re-fetch metadata for the stalest items |
//! | `harvest backup list` | List archived snapshots |
//! | `harvest backup cleanup` | Apply retention to every tier |
//! | `harvest backup compress` | Compress snapshots older than the configured age |
//! | `harvest backup restore <id>` | Replace the checkpoint with a snapshot |

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use harvestgraph::backup::{BackupManager, BackupTier};
use harvestgraph::source::HttpSourceClient;
use harvestgraph::state::StateStore;
use harvestgraph::{CollectionEngine, Config};

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Incremental, budget-aware relationship graph collection",
    version
)]
struct Cli {
    /// Path to the TOML configuration. Falls back to $HARVEST_CONFIG, then ./config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one collection pass from the last checkpoint.
    Run,

    /// Print checkpoint totals and request accounting.
    Status,

    /// Check that collected items still exist upstream.
    Validate {
        /// Maximum items to check, oldest check first.
        #[arg(long, default_value_t = 500)]
        max: usize,
    },

    /// Re-fetch metadata for collected items.
    Refresh {
        /// Maximum items to refresh, stalest first.
        #[arg(long, default_value_t = 500)]
        max: usize,
    },

    /// Backup archive operations.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    List,
    Cleanup,
    Compress,
    /// Replace the current checkpoint with an archived snapshot.
    Restore { backup_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.harvest.log_level.as_str()),
    )
    .init();

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Status => status(&config).await,
        Commands::Validate { max } => {
            let mut engine = build_engine(config)?;
            let report = engine.validate_existence(max).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Refresh { max } => {
            let mut engine = build_engine(config)?;
            let report = engine.refresh_metadata(max).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Backup { action } => backup(&config, action).await,
    }
}

fn build_engine(config: Config) -> Result<CollectionEngine<HttpSourceClient>> {
    let api_key = std::env::var(&config.api.api_key_env)
        .with_context(|| format!("Environment variable {} not set", config.api.api_key_env))?;
    let client = HttpSourceClient::new(&config.api, api_key)?;
    Ok(CollectionEngine::new(client, config)?)
}

async fn run(config: Config) -> Result<()> {
    log::info!("Starting harvest v{}", env!("CARGO_PKG_VERSION"));
    log::info!("State directory: {}", config.state_dir().display());

    let mut engine = build_engine(config)?;
    let summary = engine.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let store = StateStore::open(config.state_dir())?;
    let Some(checkpoint) = store.load().await? else {
        println!("No checkpoint in {}", config.state_dir().display());
        return Ok(());
    };
    let progress = &checkpoint.progress;
    let dormant = checkpoint.graph.dormant_ids().count();

    println!("Generation:        {}", checkpoint.generation);
    println!("Items:             {} ({} dormant)", progress.total_nodes, dormant);
    println!("Edges:             {}", progress.total_edges);
    println!("Frontier entries:  {}", progress.frontier.entries.len());
    println!("Runs:              {}", progress.run_count);
    println!("Items expanded:    {}", progress.items_expanded);
    println!("Requests (last):   {}", progress.session_request_count);
    println!("Requests (total):  {}", progress.lifetime_request_count);
    if let Some(day) = progress.daily_request_date {
        println!("Requests on {}: {}", day, progress.daily_request_count);
    }
    match progress.last_run_timestamp {
        Some(ts) => println!("Last run:          {}", ts.to_rfc3339()),
        None => println!("Last run:          never"),
    }
    Ok(())
}

async fn backup(config: &Config, action: BackupAction) -> Result<()> {
    let manager = BackupManager::local(&config.backup)?;
    let now = Utc::now();

    match action {
        BackupAction::List => {
            let manifest = manager.manifest()?;
            if manifest.entries.is_empty() {
                println!("No backups in {}", config.archive_dir().display());
            }
            for entry in manifest.by_recency() {
                println!(
                    "{}  {:<9}  {}  {} items  {} edges  {} bytes{}",
                    entry.backup_id,
                    entry.tier,
                    entry.timestamp.to_rfc3339(),
                    entry.node_count,
                    entry.edge_count,
                    entry.size_bytes,
                    if entry.compressed { "  (zip)" } else { "" }
                );
            }
        }
        BackupAction::Cleanup => {
            let mut removed = 0;
            for tier in BackupTier::ALL {
                removed += manager.cleanup(tier, now)?.len();
            }
            println!("Removed {} backups", removed);
        }
        BackupAction::Compress => {
            let compressed = manager.compress_old(now)?;
            println!("Compressed {} backups", compressed);
        }
        BackupAction::Restore { backup_id } => {
            let store = StateStore::open(config.state_dir())?;
            let checkpoint = manager.restore(&backup_id, &store).await?;
            println!(
                "Restored {}: {} items, {} edges (generation {})",
                backup_id,
                checkpoint.graph.node_count(),
                checkpoint.graph.edge_count(),
                checkpoint.generation
            );
        }
    }
    Ok(())
}
