//! `run` command: wires Kafka, the sink, dead-letter storage and the health
//! endpoint around the ingestion engine.

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use ingest_core::{
    bind_health, serve_health, EngineError, HealthReporter, HealthSnapshot, IngestEngine,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transit_ingest_kafka_source::{ConsumerConfig, KafkaConsumer, KafkaOpts};
use transit_sink::{
    BatchSink, FilesystemDeadLetterStore, HttpSink, JsonlFileSink, RejectedRecordLog,
};
use transit_types::Normalizer;

use crate::{DeadLetterOpts, EngineOpts, HealthOpts, RetryOpts, SinkKind, SinkOpts, ValidationOpts};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub kafka: KafkaOpts,

    #[command(flatten)]
    pub engine: EngineOpts,

    #[command(flatten)]
    pub retry: RetryOpts,

    #[command(flatten)]
    pub validation: ValidationOpts,

    #[command(flatten)]
    pub sink: SinkOpts,

    #[command(flatten)]
    pub dead_letter: DeadLetterOpts,

    #[command(flatten)]
    pub health: HealthOpts,
}

pub fn build_sink(opts: &SinkOpts) -> anyhow::Result<Arc<dyn BatchSink>> {
    match opts.sink {
        SinkKind::Http => {
            let config = opts.http_config()?;
            info!(endpoint = %config.endpoint, table = %config.table, "Using HTTP sink");
            Ok(Arc::new(HttpSink::new(config)?))
        }
        SinkKind::Jsonl => {
            info!(path = %opts.sink_path.display(), "Using JSONL file sink");
            Ok(Arc::new(JsonlFileSink::new(opts.sink_path.clone())))
        }
    }
}

/// Bind the health endpoint and serve it in the background. Returns `None`
/// when the endpoint is disabled; a bind failure is returned right away.
pub async fn start_health_server(
    opts: &HealthOpts,
    reporter: HealthReporter,
    shutdown: CancellationToken,
) -> anyhow::Result<Option<JoinHandle<Result<(), EngineError>>>> {
    if opts.no_health_server {
        return Ok(None);
    }
    let listener = bind_health(opts.health_addr)
        .await
        .context("Failed to start health endpoint")?;
    Ok(Some(tokio::spawn(serve_health(listener, reporter, shutdown))))
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run the ingestion engine until `shutdown` is cancelled and return the
/// final health snapshot.
pub async fn run_ingest(args: RunArgs, shutdown: CancellationToken) -> anyhow::Result<HealthSnapshot> {
    // Validate everything before opening any connection
    let engine_config = args.engine.engine_config(&args.retry);
    engine_config.validate()?;
    let normalizer = Normalizer::new(args.validation.normalizer_config()?);
    let sink = build_sink(&args.sink)?;

    let consumer = KafkaConsumer::new(ConsumerConfig::from(args.kafka))
        .context("Failed to create Kafka consumer")?;

    let dead_letter = FilesystemDeadLetterStore::new(&args.dead_letter.dead_letter_dir);
    info!(path = %dead_letter.file_path().display(), "Dead-lettered batches go to file");

    let mut engine = IngestEngine::new(
        engine_config,
        Arc::new(consumer),
        sink,
        Arc::new(dead_letter),
    )
    .with_normalizer(normalizer);
    if let Some(dir) = &args.dead_letter.rejected_dir {
        let log = RejectedRecordLog::new(dir);
        info!(path = %log.file_path().display(), "Rejected messages go to file");
        engine = engine.with_rejected_log(log);
    }

    let reporter = engine.health_reporter();
    let background = CancellationToken::new();

    let health_server =
        start_health_server(&args.health, reporter.clone(), background.clone()).await?;
    let emission = args.health.metrics_output.clone().map(|path| {
        info!(path = %path.display(), "Emitting metrics snapshots");
        reporter.start_emission_task(path, args.health.metrics_interval, background.clone())
    });

    let result = engine.run(shutdown).await;

    background.cancel();
    if let Some(handle) = health_server {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{e}"),
            Err(e) => error!("Health server task failed: {e}"),
        }
    }
    if let Some(handle) = emission {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Metrics emission failed: {e:#}"),
            Err(e) => error!("Metrics emission task failed: {e}"),
        }
    }

    let snapshot = result?;
    info!(
        "Final health snapshot: {}",
        serde_json::to_string(&snapshot).context("Failed to serialize health snapshot")?
    );
    Ok(snapshot)
}
