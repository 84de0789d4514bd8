//! Channel worker and batch flusher.
//!
//! Each channel runs as its own task and exclusively owns its buffer. Records
//! are appended in arrival order; the buffer is sealed into a `Batch` when it
//! reaches `batch_size` or when its oldest record has waited `flush_interval`,
//! whichever comes first.
//!
//! Sealed batches are delivered one at a time in sealing order, so records of
//! one vehicle reach the sink in the order they arrived. While a batch is being
//! delivered the channel keeps accepting records, up to `max_queued_batches`
//! sealed batches; beyond that it stops reading its queue, which in turn
//! blocks the poll loop.
//!
//! Draining starts when the manager cancels the channel's close token, even
//! while the channel is not reading its queue. Records still waiting in the
//! queue are sealed, and whatever is undelivered when the grace period ends
//! is dead-lettered.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transit_sink::DeadLetterReason;
use transit_types::{Batch, BatchId, FlushTrigger, Record};

use crate::committer::OffsetCommitter;
use crate::ledger::OffsetLedger;
use crate::metrics::IngestMetrics;
use crate::retry::{DeliveryOutcome, RetryController};

/// Shared by all channels.
pub(crate) struct DeliveryContext {
    pub retry: RetryController,
    pub ledger: Arc<OffsetLedger>,
    pub committer: Arc<OffsetCommitter>,
    pub metrics: IngestMetrics,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queued_batches: usize,
    pub shutdown_grace: Duration,
}

/// Records accumulated since the last seal.
#[derive(Default)]
struct ChannelBuffer {
    records: Vec<Record>,
    oldest: Option<Instant>,
}

impl ChannelBuffer {
    fn push(&mut self, record: Record) {
        if self.records.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.records.push(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn flush_deadline(&self, interval: Duration) -> Option<Instant> {
        self.oldest.map(|oldest| oldest + interval)
    }

    /// Swap the buffer for an empty one and return its records.
    fn take(&mut self) -> Vec<Record> {
        self.oldest = None;
        std::mem::take(&mut self.records)
    }
}

struct SealedBatch {
    batch: Arc<Batch>,
    sealed_at: Instant,
}

struct InFlight {
    sealed: SealedBatch,
    handle: JoinHandle<DeliveryOutcome>,
}

async fn join_in_flight(
    slot: &mut Option<InFlight>,
) -> Result<DeliveryOutcome, JoinError> {
    match slot {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

pub(crate) struct ChannelWorker {
    id: usize,
    settings: ChannelSettings,
    rx: mpsc::Receiver<Record>,
    close: CancellationToken,
    ctx: Arc<DeliveryContext>,
    buffer: ChannelBuffer,
    queue: VecDeque<SealedBatch>,
    in_flight: Option<InFlight>,
    next_sequence: u64,
}

impl ChannelWorker {
    pub fn new(
        id: usize,
        settings: ChannelSettings,
        rx: mpsc::Receiver<Record>,
        close: CancellationToken,
        ctx: Arc<DeliveryContext>,
    ) -> Self {
        Self {
            id,
            settings,
            rx,
            close,
            ctx,
            buffer: ChannelBuffer::default(),
            queue: VecDeque::new(),
            in_flight: None,
            next_sequence: 0,
        }
    }

    /// Run until the channel is closed and everything is drained, or the
    /// shutdown grace period runs out.
    pub async fn run(mut self) {
        debug!(channel = self.id, "Channel started");
        let mut closed = false;
        let mut drain_deadline: Option<Instant> = None;

        loop {
            self.start_next_delivery();

            if closed && self.in_flight.is_none() && self.queue.is_empty() {
                break;
            }

            let flush_at = if closed {
                None
            } else {
                self.buffer.flush_deadline(self.settings.flush_interval)
            };
            let accepting = !closed && self.queue.len() < self.settings.max_queued_batches;

            tokio::select! {
                biased;

                result = join_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    if let Some(in_flight) = self.in_flight.take() {
                        self.finish(in_flight.sealed, result).await;
                    }
                }

                _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                    self.abandon().await;
                    break;
                }

                _ = self.close.cancelled(), if !closed => {
                    closed = true;
                    self.begin_drain();
                    drain_deadline = Some(Instant::now() + self.settings.shutdown_grace);
                }

                _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    self.seal(FlushTrigger::Interval);
                }

                received = self.rx.recv(), if accepting => match received {
                    Some(record) => self.accept(record),
                    None => {
                        closed = true;
                        self.begin_drain();
                        drain_deadline = Some(Instant::now() + self.settings.shutdown_grace);
                    }
                },
            }
        }

        debug!(channel = self.id, "Channel stopped");
    }

    fn accept(&mut self, record: Record) {
        self.buffer.push(record);
        if self.buffer.len() >= self.settings.batch_size {
            self.seal(FlushTrigger::Size);
        }
    }

    /// Stop taking records, seal everything still in the inbound queue and
    /// the buffer.
    fn begin_drain(&mut self) {
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(record) = self.rx.try_recv() {
            self.accept(record);
            drained += 1;
        }
        if !self.buffer.is_empty() {
            self.seal(FlushTrigger::Shutdown);
        }
        info!(
            channel = self.id,
            drained,
            queued = self.queue.len() + usize::from(self.in_flight.is_some()),
            "Channel draining"
        );
    }

    fn seal(&mut self, trigger: FlushTrigger) {
        let records = self.buffer.take();
        if records.is_empty() {
            return;
        }
        let id = BatchId {
            channel: self.id,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        let batch = Batch::seal(id, records, trigger);
        self.ctx
            .metrics
            .batch_sealed(self.id, batch.len(), trigger);
        debug!(
            channel = self.id,
            batch_id = %batch.id,
            records = batch.len(),
            trigger = %trigger,
            "Sealed batch"
        );
        self.queue.push_back(SealedBatch {
            batch: Arc::new(batch),
            sealed_at: Instant::now(),
        });
    }

    fn start_next_delivery(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(sealed) = self.queue.pop_front() else {
            return;
        };
        let ctx = self.ctx.clone();
        let batch = sealed.batch.clone();
        let handle = tokio::spawn(async move { ctx.retry.deliver(&batch).await });
        self.in_flight = Some(InFlight { sealed, handle });
    }

    async fn finish(&mut self, sealed: SealedBatch, result: Result<DeliveryOutcome, JoinError>) {
        let batch = sealed.batch;
        let latency = sealed.sealed_at.elapsed();
        let ctx = &self.ctx;

        match result {
            Ok(DeliveryOutcome::Delivered { attempts }) => {
                ctx.ledger.acknowledge(batch.positions());
                ctx.metrics.batch_committed(self.id, batch.len(), latency);
                debug!(
                    channel = self.id,
                    batch_id = %batch.id,
                    records = batch.len(),
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    "Batch delivered"
                );
                if let Err(e) = ctx.committer.commit_ready().await {
                    debug!(channel = self.id, "Deferred offset commit: {e}");
                }
            }
            Ok(DeliveryOutcome::DeadLettered { reason, attempts }) => {
                ctx.ledger.fence(batch.positions());
                ctx.metrics
                    .batch_dead_lettered(self.id, batch.len(), latency);
                warn!(
                    channel = self.id,
                    batch_id = %batch.id,
                    records = batch.len(),
                    attempts,
                    "Batch dead-lettered ({reason}); its offsets will not be committed"
                );
            }
            Err(e) => {
                error!(channel = self.id, batch_id = %batch.id, "Delivery task failed: {e}");
                let reason = DeadLetterReason::Fatal(format!("delivery task failed: {e}"));
                ctx.retry.dead_letter(&batch, &reason, 0).await;
                ctx.ledger.fence(batch.positions());
                ctx.metrics
                    .batch_dead_lettered(self.id, batch.len(), latency);
            }
        }
    }

    /// Give up on everything still queued or in flight after the grace period.
    async fn abandon(&mut self) {
        let mut abandoned = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
            abandoned.push(in_flight.sealed);
        }
        abandoned.extend(self.queue.drain(..));
        self.ctx.metrics.set_retrying(self.id, false);

        for sealed in abandoned {
            let batch = sealed.batch;
            warn!(
                channel = self.id,
                batch_id = %batch.id,
                records = batch.len(),
                "Shutdown grace period elapsed, dead-lettering batch"
            );
            self.ctx
                .retry
                .dead_letter(&batch, &DeadLetterReason::ShutdownTimeout, 0)
                .await;
            self.ctx.ledger.fence(batch.positions());
            self.ctx.metrics.batch_dead_lettered(
                self.id,
                batch.len(),
                sealed.sealed_at.elapsed(),
            );
        }
    }
}
