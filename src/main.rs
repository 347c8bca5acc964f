//! pg-walrelay command line
//!
//! Streams one slot's committed transactions to stdout as JSON lines. Logs go
//! to stderr; set `RUST_LOG` to change the level.

use clap::Parser;
use pg_walrelay::{
    CancellationToken, ConnectionSupervisor, FileCheckpointStore, JsonLinesConsumer, PgConnector,
    PipelineConfig, ReplicationError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay PostgreSQL changes decoded by wal2json as JSON lines
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; environment and flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replication slot to create or reuse
    #[arg(long)]
    slot: Option<String>,

    /// PostgreSQL connection string (defaults to $DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Directory for checkpoint files
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Transactions delivered before a checkpoint is forced
    #[arg(long)]
    ack_batch_size: Option<usize>,

    /// Only stream these tables (schema.table, repeatable)
    #[arg(long = "table")]
    tables: Vec<String>,
}

fn load_config(args: Args) -> Result<PipelineConfig, ReplicationError> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?.with_env()?,
        None => PipelineConfig::from_env()?,
    };

    if let Some(slot) = args.slot {
        config.slot_name = slot;
    }
    if let Some(url) = args.database_url {
        config.database_connection_string = url;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.checkpoint_dir = dir;
    }
    if let Some(size) = args.ack_batch_size {
        config.ack_batch_size = size;
    }
    if !args.tables.is_empty() {
        config.add_tables = args.tables;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    info!("Starting pg-walrelay {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Slot {} on {}",
        config.slot_name,
        config.redacted_connection_string()
    );

    let store = match FileCheckpointStore::open(&config.checkpoint_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!("Cannot listen for ctrl-c: {}", e),
        }
    });

    let connector = PgConnector::new(config.replication_conninfo());
    let mut supervisor = ConnectionSupervisor::new(config, connector, store);

    match supervisor
        .run(JsonLinesConsumer::new(tokio::io::stdout()), cancel)
        .await
    {
        Ok(()) => {
            info!("Stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!(
                "Slot {} needs attention; last confirmed LSN {}",
                failure.slot_name, failure.last_confirmed_lsn
            );
            ExitCode::FAILURE
        }
    }
}
