//! Ingestion engine.
//!
//! A single poll loop reads broker messages, normalizes them and fans the
//! records out to the channels. Channel workers batch and deliver on their
//! own; the poll loop only blocks when a channel's queue is full.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transit_sink::{BatchSink, DeadLetterStore, RejectedEntry, RejectedRecordLog};
use transit_types::{Normalized, Normalizer, NormalizerConfig};

use crate::broker::{BrokerConsumer, Delivery};
use crate::channel::DeliveryContext;
use crate::committer::OffsetCommitter;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::health::{HealthReporter, HealthSnapshot};
use crate::ledger::OffsetLedger;
use crate::manager::ChannelManager;
use crate::metrics::IngestMetrics;
use crate::retry::RetryController;

pub struct IngestEngine {
    config: EngineConfig,
    broker: Arc<dyn BrokerConsumer>,
    sink: Arc<dyn BatchSink>,
    dead_letter: Arc<dyn DeadLetterStore>,
    normalizer: Normalizer,
    rejected_log: Option<RejectedRecordLog>,
    metrics: IngestMetrics,
    ledger: Arc<OffsetLedger>,
}

/// Whether the poll loop should keep going after handling a message.
enum Flow {
    Continue,
    Stop,
}

impl IngestEngine {
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn BrokerConsumer>,
        sink: Arc<dyn BatchSink>,
        dead_letter: Arc<dyn DeadLetterStore>,
    ) -> Self {
        let metrics = IngestMetrics::new(config.channels);
        Self {
            config,
            broker,
            sink,
            dead_letter,
            normalizer: Normalizer::new(NormalizerConfig::default()),
            rejected_log: None,
            metrics,
            ledger: Arc::new(OffsetLedger::new()),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Also write rejected messages to `log`.
    pub fn with_rejected_log(mut self, log: RejectedRecordLog) -> Self {
        self.rejected_log = Some(log);
        self
    }

    pub fn metrics(&self) -> IngestMetrics {
        self.metrics.clone()
    }

    /// Reporter that stays valid after `run` returns.
    pub fn health_reporter(&self) -> HealthReporter {
        HealthReporter::new(self.metrics.clone(), self.ledger.clone())
    }

    /// Consume until `shutdown` is cancelled, then drain every channel, commit
    /// the final safe offsets and return the final health snapshot.
    ///
    /// Returns an error for invalid configuration, when the broker stays
    /// unreachable past the configured failure limit, or when a channel worker
    /// dies. The drain still runs in the latter two cases.
    pub async fn run(self, shutdown: CancellationToken) -> Result<HealthSnapshot> {
        self.config.validate()?;

        let committer = Arc::new(OffsetCommitter::new(
            self.ledger.clone(),
            self.broker.clone(),
            self.metrics.clone(),
        ));
        let ctx = Arc::new(DeliveryContext {
            retry: RetryController::new(
                self.sink.clone(),
                self.dead_letter.clone(),
                self.config.retry.clone(),
                self.metrics.clone(),
            ),
            ledger: self.ledger.clone(),
            committer: committer.clone(),
            metrics: self.metrics.clone(),
        });
        let manager = ChannelManager::start(&self.config, ctx);
        info!(sink = self.sink.name(), "Ingestion started");

        let result = self.poll_loop(&manager, &committer, &shutdown).await;

        self.metrics.set_stopping();
        info!("Stopping ingestion, draining channels");
        manager.shutdown().await;

        match committer.commit_ready().await {
            Ok(partitions) => info!(partitions, "Final offset commit done"),
            Err(e) => error!("Final offset commit failed: {e}"),
        }

        let snapshot = self.health_reporter().snapshot();
        let totals = &snapshot.totals;
        info!(
            records_in = totals.records_in,
            records_committed = totals.records_committed,
            records_dead_lettered = totals.records_dead_lettered,
            records_rejected = totals.records_rejected,
            batches_committed = totals.batches_committed,
            retries = totals.retries,
            "Ingestion stopped"
        );
        if !totals.is_reconciled() {
            error!(?totals, "Record counters do not reconcile after drain");
        }

        result.map(|()| snapshot)
    }

    async fn poll_loop(
        &self,
        manager: &ChannelManager,
        committer: &OffsetCommitter,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = self.config.retry.backoff();
        let mut failures: u32 = 0;

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.broker.poll(self.config.poll_timeout) => polled,
            };

            match polled {
                Ok(delivery) => {
                    if self.metrics.broker_reachable() {
                        info!(failures, "Broker connection restored");
                    }
                    failures = 0;
                    backoff.reset();

                    match delivery {
                        Some(delivery) => {
                            if let Flow::Stop = self.process(delivery, manager, shutdown).await? {
                                break;
                            }
                        }
                        None => {
                            if let Err(e) = committer.commit_ready().await {
                                debug!("Idle offset commit failed: {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.metrics.broker_error();
                    let limit = self.config.broker_failure_limit;
                    if limit > 0 && failures >= limit {
                        error!(failures, "Giving up on broker: {e}");
                        return Err(EngineError::BrokerUnavailable {
                            failures,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Broker poll failed, backing off: {e}"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn process(
        &self,
        delivery: Delivery,
        manager: &ChannelManager,
        shutdown: &CancellationToken,
    ) -> Result<Flow> {
        let Delivery { position, payload } = delivery;

        let raws = match payload {
            Ok(raws) => raws,
            Err(e) => {
                self.metrics.payload_rejected();
                self.ledger.admit(&position, 0);
                warn!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    "Rejected payload: {e}"
                );
                self.log_rejected(RejectedEntry::from_payload(&position, &e))
                    .await;
                return Ok(Flow::Continue);
            }
        };

        let mut records = Vec::with_capacity(raws.len());
        for raw in &raws {
            match self.normalizer.normalize(raw) {
                Ok(Normalized { record, quality }) => {
                    self.metrics.record_quality(&quality);
                    if !quality.is_clean() {
                        debug!(
                            record_id = %record.record_id,
                            ?quality,
                            "Record has data quality issues"
                        );
                    }
                    records.push(record);
                }
                Err(e) => {
                    self.metrics.record_rejected();
                    warn!(
                        partition = raw.position.partition,
                        offset = raw.position.offset,
                        index = raw.index,
                        "Rejected record: {e}"
                    );
                    self.log_rejected(RejectedEntry::from_record(raw, &e)).await;
                }
            }
        }

        // Admitted before routing so a fast channel cannot acknowledge an
        // offset the ledger has not seen yet.
        self.ledger.admit(&position, records.len() as u32);

        for record in records {
            if manager.route(record, shutdown).await?.is_none() {
                info!(
                    partition = position.partition,
                    offset = position.offset,
                    "Shutdown while routing, offset left uncommitted"
                );
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn log_rejected(&self, entry: RejectedEntry) {
        if let Some(log) = &self.rejected_log {
            if let Err(e) = log.append(&entry).await {
                error!("Failed to write rejected record log: {e:#}");
            }
        }
    }
}
