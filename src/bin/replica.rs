//! Replica CLI — differential directory replication.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use replica::{FileReplicator, ReplicationServer, ReplicatorClient, ReplicatorConfig};

/// Replica - block-level directory replication between two hosts
#[derive(Parser)]
#[command(name = "replica")]
#[command(version)]
#[command(about = "Differential directory replication over a block-signature protocol")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive file updates and mirror them under a target root
    Receiver {
        /// Address to listen on (host:port)
        #[arg(long)]
        address: String,

        /// Directory the mirrored tree is written into
        #[arg(long)]
        file_root: PathBuf,
    },

    /// Watch a source root and push changes to a receiver
    Sender {
        /// Receiver address (host:port)
        #[arg(long)]
        address: String,

        /// Directory to watch and replicate
        #[arg(long)]
        file_root: PathBuf,

        /// Size of the file blocks to be processed
        #[arg(long, default_value_t = 8192)]
        block_size: u64,

        /// Number of parallel file processing operations
        #[arg(long, default_value_t = 10)]
        parallelism: usize,

        /// Window for pairing rename notifications (milliseconds)
        #[arg(long, default_value_t = 500)]
        rename_window_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> replica::Result<()> {
    match cli.command {
        Commands::Receiver { address, file_root } => {
            let server = ReplicationServer::bind(&address, file_root).await?;
            info!("ready to receive file updates");
            server.serve().await
        }
        Commands::Sender {
            address,
            file_root,
            block_size,
            parallelism,
            rename_window_ms,
        } => {
            if block_size == 0 {
                return Err(replica::ReplicaError::InvalidBlockSize(block_size));
            }

            let client = ReplicatorClient::connect(&address, file_root, parallelism).await?;
            let config = ReplicatorConfig {
                block_size,
                parallelism,
                rename_window: Duration::from_millis(rename_window_ms),
                ..ReplicatorConfig::default()
            };

            let replicator = Arc::new(FileReplicator::new(client, config));

            // Initial walk runs alongside the watcher; both feed the same
            // transfer queue.
            let walker = Arc::clone(&replicator);
            tokio::spawn(async move {
                if let Err(e) = walker.sync_source().await {
                    error!(error = %e, "initial sync failed");
                }
            });

            replica::watch(replicator).await
        }
    }
}
