//! Command-line interface for transit-ingest
//!
//! # Usage Examples
//!
//! ```bash
//! # Kafka to a local JSONL file, 8 channels, health on :8001
//! transit-ingest run --brokers localhost:9092 --topic icymta --channels 8
//!
//! # Kafka over SASL_SSL to an HTTP ingestion endpoint
//! transit-ingest run --brokers broker:9093 --topic icymta \
//!   --security-protocol SASL_SSL --sasl-username ingest --sasl-password "$PW" \
//!   --sink http --sink-endpoint https://ingest.example.com/v1/rows --sink-token "$TOKEN"
//!
//! # Normalize a captured file offline
//! transit-ingest normalize --input capture.jsonl --output records.jsonl
//! ```
//!
//! Logging is configured with `RUST_LOG` (default `info`); `--log-json`
//! switches to JSON log lines.

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use transit_ingest::ingest::{run_ingest, shutdown_signal, RunArgs};
use transit_ingest::normalize::{run_normalize, NormalizeArgs};

#[derive(Parser)]
#[command(name = "transit-ingest")]
#[command(about = "Stream MTA vehicle positions from Kafka into an analytical sink")]
#[command(long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume from Kafka and deliver batches to the sink until SIGINT/SIGTERM
    Run(Box<RunArgs>),

    /// Normalize a file of captured payloads without a broker
    Normalize(NormalizeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run(args) => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutting down, draining channels");
                signal.cancel();
            });
            run_ingest(*args, shutdown).await?;
        }
        Commands::Normalize(args) => {
            run_normalize(args).await?;
        }
    }
    Ok(())
}
