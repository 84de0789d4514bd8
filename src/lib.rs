//! transit-ingest
//!
//! Streams MTA vehicle-position messages from Kafka into an analytical sink
//! through N independently flushed channels, committing Kafka offsets only
//! once the sink holds every record below them.
//!
//! # CLI Usage
//!
//! ```bash
//! # Consume from Kafka and POST batches to an ingestion endpoint
//! transit-ingest run --brokers localhost:9092 --topic icymta \
//!   --sink http --sink-endpoint https://ingest.example.com/v1/rows
//!
//! # Normalize a captured JSONL file offline
//! transit-ingest normalize --input capture.jsonl --output records.jsonl
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, ValueEnum};
use ingest_core::{EngineConfig, RetryPolicy};
use transit_types::{CoordinateRange, NormalizerConfig};

pub mod config;
pub mod ingest;
pub mod normalize;

use config::duration::parse_duration;

/// Channel and batching options
#[derive(Args, Debug, Clone)]
pub struct EngineOpts {
    /// Number of parallel channels
    #[arg(long, default_value_t = 4, env = "INGEST_CHANNELS")]
    pub channels: usize,

    /// Records per batch
    #[arg(long, default_value_t = 1000, env = "INGEST_BATCH_SIZE")]
    pub batch_size: usize,

    /// Longest a record may wait before its channel flushes (e.g. 500ms, 2s)
    #[arg(long, default_value = "2s", value_parser = parse_duration, env = "INGEST_FLUSH_INTERVAL")]
    pub flush_interval: Duration,

    /// Capacity of each channel's inbound queue
    #[arg(long, default_value_t = 1000)]
    pub channel_capacity: usize,

    /// Sealed batches a channel may queue before it stops accepting records
    #[arg(long, default_value_t = 4)]
    pub max_queued_batches: usize,

    /// How long shutdown waits for in-flight batches before dead-lettering them
    #[arg(long, default_value = "30s", value_parser = parse_duration, env = "INGEST_SHUTDOWN_GRACE")]
    pub shutdown_grace: Duration,

    /// Broker poll timeout
    #[arg(long, default_value = "500ms", value_parser = parse_duration)]
    pub poll_timeout: Duration,

    /// Consecutive broker poll failures before giving up (0 = keep reconnecting until shutdown)
    #[arg(long, default_value_t = 0)]
    pub broker_failure_limit: u32,
}

/// Sink retry options
#[derive(Args, Debug, Clone)]
pub struct RetryOpts {
    /// Delay before the first retry
    #[arg(long, default_value = "200ms", value_parser = parse_duration)]
    pub retry_base_delay: Duration,

    /// Upper bound for any retry delay
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub retry_max_delay: Duration,

    /// Sink calls per batch, including the first
    #[arg(long, default_value_t = 5, env = "INGEST_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Random jitter added to each delay, as a fraction of it (clamped to 0..=1)
    #[arg(long, default_value_t = 0.2)]
    pub retry_jitter: f64,
}

/// Field validation options
#[derive(Args, Debug, Clone)]
pub struct ValidationOpts {
    #[arg(long, default_value_t = 40.4, allow_hyphen_values = true)]
    pub latitude_min: f64,

    #[arg(long, default_value_t = 41.0, allow_hyphen_values = true)]
    pub latitude_max: f64,

    #[arg(long, default_value_t = -74.5, allow_hyphen_values = true)]
    pub longitude_min: f64,

    #[arg(long, default_value_t = -73.5, allow_hyphen_values = true)]
    pub longitude_max: f64,

    /// Do not flag coordinates outside the expected ranges
    #[arg(long)]
    pub no_range_check: bool,

    /// Source system label stored on every record
    #[arg(long, default_value = "MTA_REALTIME", env = "INGEST_SOURCE_SYSTEM")]
    pub source_system: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// POST batches to an HTTP ingestion endpoint
    Http,
    /// Append rows to a local JSON lines file
    Jsonl,
}

/// Sink options
#[derive(Args, Debug, Clone)]
pub struct SinkOpts {
    #[arg(long, value_enum, default_value = "jsonl", env = "INGEST_SINK")]
    pub sink: SinkKind,

    /// Endpoint batches are POSTed to (http sink)
    #[arg(long, env = "SINK_ENDPOINT")]
    pub sink_endpoint: Option<String>,

    /// Bearer token for the endpoint (http sink)
    #[arg(long, env = "SINK_TOKEN", hide_env_values = true)]
    pub sink_token: Option<String>,

    /// Target table name sent with every batch (http sink)
    #[arg(long, default_value = "vehicle_positions", env = "SINK_TABLE")]
    pub sink_table: String,

    /// Per-request timeout (http sink)
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub sink_timeout: Duration,

    /// Output file (jsonl sink)
    #[arg(long, default_value = "output/vehicle_positions.jsonl")]
    pub sink_path: PathBuf,
}

/// Dead-letter and rejected-record options
#[derive(Args, Debug, Clone)]
pub struct DeadLetterOpts {
    /// Directory for dead-lettered batches
    #[arg(long, default_value = "dead_letter", env = "DEAD_LETTER_DIR")]
    pub dead_letter_dir: PathBuf,

    /// Also write rejected messages to <dir>/rejected.jsonl
    #[arg(long)]
    pub rejected_dir: Option<PathBuf>,
}

/// Health endpoint and metrics emission options
#[derive(Args, Debug, Clone)]
pub struct HealthOpts {
    /// Address the /health endpoint listens on
    #[arg(long, default_value = "0.0.0.0:8001", env = "HEALTH_ADDR")]
    pub health_addr: SocketAddr,

    /// Disable the health endpoint
    #[arg(long)]
    pub no_health_server: bool,

    /// Append health snapshots to this JSON lines file
    #[arg(long)]
    pub metrics_output: Option<PathBuf>,

    /// Interval between metrics snapshots
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub metrics_interval: Duration,
}

impl EngineOpts {
    pub fn engine_config(&self, retry: &RetryOpts) -> EngineConfig {
        EngineConfig {
            channels: self.channels,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            channel_capacity: self.channel_capacity,
            max_queued_batches: self.max_queued_batches,
            shutdown_grace: self.shutdown_grace,
            poll_timeout: self.poll_timeout,
            broker_failure_limit: self.broker_failure_limit,
            retry: RetryPolicy {
                base_delay: retry.retry_base_delay,
                max_delay: retry.retry_max_delay,
                max_attempts: retry.max_attempts,
                jitter: retry.retry_jitter,
            },
        }
    }
}

impl ValidationOpts {
    pub fn normalizer_config(&self) -> anyhow::Result<NormalizerConfig> {
        let range = |name: &str, min: f64, max: f64| -> anyhow::Result<CoordinateRange> {
            if min.is_nan() || max.is_nan() || min > max {
                anyhow::bail!("{name} range is empty: min {min}, max {max}");
            }
            Ok(CoordinateRange::new(min, max))
        };

        let (latitude_range, longitude_range) = if self.no_range_check {
            (None, None)
        } else {
            (
                Some(range("latitude", self.latitude_min, self.latitude_max)?),
                Some(range("longitude", self.longitude_min, self.longitude_max)?),
            )
        };
        Ok(NormalizerConfig {
            latitude_range,
            longitude_range,
            source_system: self.source_system.clone(),
        })
    }
}

impl SinkOpts {
    pub fn http_config(&self) -> anyhow::Result<transit_sink::HttpSinkConfig> {
        let endpoint = self
            .sink_endpoint
            .clone()
            .context("--sink-endpoint is required for the http sink")?;
        Ok(transit_sink::HttpSinkConfig {
            endpoint,
            table: self.sink_table.clone(),
            token: self.sink_token.clone(),
            request_timeout: self.sink_timeout,
        })
    }
}
