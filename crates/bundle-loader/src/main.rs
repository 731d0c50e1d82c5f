//! bundle-loader - distributed bundle ingestion worker

use anyhow::{Context, Result};
use bundle_common::logging::{init_logging, LogConfig, LogLevel};
use bundle_loader::config::check_reclaim_window;
use bundle_loader::{
    BundleLoader, BundleLocation, BundleType, LoaderConfig, LoaderWorker, LocalNdjsonSource,
    NewWorkItem,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bundle-loader")]
#[command(author, version, about = "Distributed bundle loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Database connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Run the loader loop until interrupted
    Run {
        /// Directory holding `<container>/<path>/<name>` bundles
        #[arg(short, long, env = "LOADER_BUNDLE_ROOT", default_value = "./data/bundles")]
        root: PathBuf,

        /// Bundle type to claim (overrides LOADER_BUNDLE_TYPE)
        #[arg(short, long)]
        bundle_type: Option<BundleType>,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Detect dead instances and release or recycle their work
    Reclaim {
        /// Heartbeat age in milliseconds after which an instance is dead
        #[arg(long)]
        heartbeat_timeout_ms: Option<u64>,

        /// Recycle work completed at least this many seconds ago
        #[arg(long)]
        recycle_seconds: Option<u64>,
    },

    /// Register a bundle as a work item
    RegisterItem {
        #[arg(long)]
        container: String,

        #[arg(long, default_value = "")]
        path: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        size: i64,

        #[arg(long, default_value = "NDJSON")]
        bundle_type: BundleType,

        /// RFC 3339 modification time; defaults to now
        #[arg(long)]
        last_modified: Option<DateTime<Utc>>,
    },

    /// Make sure reference dictionary entries exist
    EnsureTypes {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Print queue and instance counts as JSON
    Status,
}

fn load_config(database_url: Option<String>) -> Result<LoaderConfig> {
    let config = LoaderConfig::from_lookup(&|key: &str| match key {
        "DATABASE_URL" => database_url.clone().or_else(|| std::env::var(key).ok()),
        _ => std::env::var(key).ok(),
    })
    .context("Failed to load loader configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::default()
        .with_level(log_level)
        .with_file_prefix("bundle-loader")
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = load_config(cli.database_url)?;
    if let Command::Run {
        bundle_type: Some(bundle_type),
        ..
    } = &cli.command
    {
        config.bundle_type = *bundle_type;
    }
    config.validate()?;

    let loader = BundleLoader::connect(&config).await?;

    match cli.command {
        Command::Migrate => {
            loader.migrate().await?;
        },
        Command::Run { root, once, .. } => {
            let source = LocalNdjsonSource::new(root);
            let worker = LoaderWorker::new(loader.clone(), config);

            if once {
                let summary = worker.run_once(&source).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                worker.run(&source, shutdown_signal()).await?;
            }
        },
        Command::Reclaim {
            heartbeat_timeout_ms,
            recycle_seconds,
        } => {
            let timeout = heartbeat_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(config.heartbeat_timeout);
            let recycle = recycle_seconds.map(Duration::from_secs).or(config.recycle_after);
            check_reclaim_window("heartbeat timeout", timeout)?;
            if let Some(recycle) = recycle {
                check_reclaim_window("recycle delay", recycle)?;
            }
            let summary = loader.reclaim_stale(timeout, recycle).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::RegisterItem {
            container,
            path,
            name,
            size,
            bundle_type,
            last_modified,
        } => {
            let item = NewWorkItem {
                location: BundleLocation::new(container, path, name),
                size_bytes: size,
                bundle_type,
                last_modified: last_modified.unwrap_or_else(Utc::now),
            };
            let id = loader.register_work_item(&item).await?;
            info!(work_item_id = id, location = %item.location, "Work item registered");
            println!("{}", id);
        },
        Command::EnsureTypes { names } => {
            let ids = loader.ensure_reference_data(&names[..]).await?;
            println!("{}", serde_json::to_string_pretty(&ids)?);
        },
        Command::Status => {
            let status = loader.queue_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        },
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing the current pass"),
        _ = terminate => info!("Received terminate signal, finishing the current pass"),
    }
}
