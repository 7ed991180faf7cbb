//! logos-sync server binary.
//!
//! # Usage
//!
//! ```bash
//! # Persist rooms under ./data
//! logos-sync start --dir ./data
//!
//! # Throwaway storage, removed on exit
//! logos-sync start --tmp --addr 0.0.0.0:8899
//! ```
//!
//! Logging is configured through `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use logos_sync::{PersistenceConfig, ServerConfig, SyncServer};

/// Durable room log synchronization server
#[derive(Parser, Debug)]
#[command(name = "logos-sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the sync server
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Directory holding room logs
    #[arg(long, conflicts_with = "tmp", required_unless_present = "tmp")]
    dir: Option<PathBuf>,

    /// Store room logs in a temporary directory deleted on exit
    #[arg(long)]
    tmp: bool,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8899")]
    addr: String,

    /// Bounded depth of each persistence queue
    #[arg(long, default_value_t = 1000)]
    queue_depth: usize,

    /// Number of persistence workers
    #[arg(long, default_value_t = 1)]
    shards: usize,

    /// Milliseconds a worker waits so bursts of writes share one commit
    #[arg(long, default_value_t = 0)]
    coalesce_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Start(args) => start(args).await,
    }
}

async fn start(args: StartArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Held until exit so the temporary directory outlives the server.
    let mut _tmp = None;
    let dir = match args.dir {
        Some(dir) => dir,
        None => {
            let tmp = tempfile::tempdir()?;
            let path = tmp.path().to_path_buf();
            log::warn!("Using temporary storage at {}", path.display());
            _tmp = Some(tmp);
            path
        }
    };

    let config = ServerConfig {
        bind_addr: args.addr,
        persistence: PersistenceConfig {
            dir,
            queue_depth: args.queue_depth,
            shards: args.shards,
            coalesce_delay: Duration::from_millis(args.coalesce_ms),
            ..PersistenceConfig::default()
        },
        ..ServerConfig::default()
    };
    log::info!(
        "Starting logos-sync on {} with storage at {}",
        config.bind_addr,
        config.persistence.dir.display()
    );

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            Ok(())
        }
    }
}
