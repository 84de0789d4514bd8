//! Retry controller.
//!
//! Wraps every sink call with bounded exponential backoff. Retryable failures
//! are retried up to `max_attempts` sink calls in total; fatal failures and
//! exhausted retries route the batch to dead-letter storage.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};
use transit_sink::{BatchSink, DeadLetterEntry, DeadLetterReason, DeadLetterStore, SinkError};
use transit_types::Batch;

use crate::metrics::IngestMetrics;

/// Backoff settings shared by sink retries and broker reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total sink calls allowed per batch, including the first
    pub max_attempts: u32,
    /// Fraction of the exponential delay added as random jitter, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            step: 0,
            last: Duration::ZERO,
        }
    }
}

/// Delay sequence for one retry loop.
///
/// Delays grow as `base * 2^n` plus jitter, never exceed `max_delay`, and
/// never decrease.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    step: u32,
    last: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.step.min(31);
        self.step = self.step.saturating_add(1);

        let exponential = self
            .policy
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_delay);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 {
            exponential.mul_f64(1.0 + rand::rng().random_range(0.0..jitter))
        } else {
            exponential
        };

        let delay = jittered.min(self.policy.max_delay).max(self.last);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.step = 0;
        self.last = Duration::ZERO;
    }
}

/// Final result of delivering one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The sink accepted the batch after `attempts` calls
    Delivered { attempts: u32 },
    /// The batch was routed to dead-letter storage
    DeadLettered {
        reason: DeadLetterReason,
        attempts: u32,
    },
}

pub struct RetryController {
    sink: Arc<dyn BatchSink>,
    dead_letter: Arc<dyn DeadLetterStore>,
    policy: RetryPolicy,
    metrics: IngestMetrics,
}

impl RetryController {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        dead_letter: Arc<dyn DeadLetterStore>,
        policy: RetryPolicy,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            sink,
            dead_letter,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `batch`, retrying retryable failures with backoff.
    ///
    /// Makes at most `max_attempts` sink calls. Never returns an error: every
    /// batch ends up either delivered or dead-lettered.
    pub async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let channel = batch.channel;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.backoff();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            match self.sink.commit(batch).await {
                Ok(()) => {
                    self.metrics.sink_succeeded();
                    if attempts > 1 {
                        info!(
                            channel,
                            batch_id = %batch.id,
                            attempts,
                            "Batch delivered after retry"
                        );
                    }
                    break DeliveryOutcome::Delivered { attempts };
                }
                Err(SinkError::Fatal(reason)) => {
                    self.metrics.sink_failed();
                    let content = serde_json::to_string(batch).unwrap_or_default();
                    error!(
                        channel,
                        batch_id = %batch.id,
                        records = batch.len(),
                        content = %content,
                        "Sink rejected batch permanently: {reason}"
                    );
                    let reason = DeadLetterReason::Fatal(reason);
                    self.dead_letter(batch, &reason, attempts).await;
                    break DeliveryOutcome::DeadLettered { reason, attempts };
                }
                Err(SinkError::Retryable(reason)) => {
                    self.metrics.sink_failed();
                    if attempts >= max_attempts {
                        error!(
                            channel,
                            batch_id = %batch.id,
                            attempts,
                            "Giving up on batch after retries: {reason}"
                        );
                        let reason = DeadLetterReason::RetriesExhausted { last_error: reason };
                        self.dead_letter(batch, &reason, attempts).await;
                        break DeliveryOutcome::DeadLettered { reason, attempts };
                    }

                    let delay = backoff.next_delay();
                    self.metrics.retry_scheduled(channel);
                    self.metrics.set_retrying(channel, true);
                    warn!(
                        channel,
                        batch_id = %batch.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable sink failure: {reason}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.metrics.set_retrying(channel, false);
        outcome
    }

    /// Append `batch` to dead-letter storage. Storage failures are logged and
    /// counted; the batch offsets stay uncommitted either way.
    pub async fn dead_letter(&self, batch: &Batch, reason: &DeadLetterReason, attempts: u32) {
        let entry = DeadLetterEntry::new(batch, reason, attempts);
        if let Err(e) = self.dead_letter.append(&entry).await {
            self.metrics.dead_letter_write_failed();
            error!(
                channel = batch.channel,
                batch_id = %batch.id,
                records = batch.len(),
                "Failed to write dead-letter entry: {e:#}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use transit_sink::MemoryDeadLetterStore;
    use transit_types::{BatchId, FlushTrigger, Record, RecordSource};

    struct ScriptedSink {
        responses: Mutex<VecDeque<Result<(), SinkError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSink {
        fn new(responses: Vec<Result<(), SinkError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl BatchSink for ScriptedSink {
        async fn commit(&self, _batch: &Batch) -> Result<(), SinkError> {
            *self.calls.lock().unwrap() += 1;
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn batch() -> Batch {
        let source = RecordSource {
            topic: "mta".to_string(),
            partition: 0,
            offset: 1,
            index: 0,
            broker_timestamp: None,
        };
        Batch::seal(
            BatchId {
                channel: 0,
                sequence: 0,
            },
            vec![Record::minimal("MTA_1", source, Utc::now())],
            FlushTrigger::Size,
        )
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts,
            jitter: 0.0,
        }
    }

    fn controller(
        sink: Arc<ScriptedSink>,
        max_attempts: u32,
    ) -> (RetryController, Arc<MemoryDeadLetterStore>, IngestMetrics) {
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let metrics = IngestMetrics::new(1);
        (
            RetryController::new(sink, dlq.clone(), policy(max_attempts), metrics.clone()),
            dlq,
            metrics,
        )
    }

    fn retryable() -> Result<(), SinkError> {
        Err(SinkError::Retryable("throttled".to_string()))
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = policy(10).backoff();
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_with_jitter_is_non_decreasing_and_capped() {
        let mut backoff = RetryPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(700),
            max_attempts: 20,
            jitter: 1.0,
        }
        .backoff();

        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(700));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_delivers() {
        let sink = Arc::new(ScriptedSink::new(vec![retryable(), retryable(), retryable()]));
        let (controller, dlq, metrics) = controller(sink.clone(), 5);

        let outcome = controller.deliver(&batch()).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 4 });
        assert_eq!(sink.calls(), 4);
        assert!(dlq.is_empty());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.channels[0].retries, 3);
        assert!(!snapshot.channels[0].retrying);
        assert_eq!(snapshot.totals.sink_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_dead_lettered() {
        let sink = Arc::new(ScriptedSink::new(vec![retryable(); 10]));
        let (controller, dlq, metrics) = controller(sink.clone(), 3);

        let outcome = controller.deliver(&batch()).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::RetriesExhausted { .. },
                attempts: 3
            }
        ));
        assert_eq!(sink.calls(), 3);
        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason_kind, "retries_exhausted");
        assert_eq!(entries[0].attempts, 3);
        assert_eq!(metrics.snapshot().channels[0].retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_skips_retries() {
        let sink = Arc::new(ScriptedSink::new(vec![Err(SinkError::Fatal(
            "schema mismatch".to_string(),
        ))]));
        let (controller, dlq, metrics) = controller(sink.clone(), 5);

        let outcome = controller.deliver(&batch()).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::Fatal("schema mismatch".to_string()),
                attempts: 1
            }
        );
        assert_eq!(sink.calls(), 1);
        assert_eq!(dlq.entries()[0].reason_kind, "fatal");
        assert_eq!(metrics.snapshot().channels[0].retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let sink = Arc::new(ScriptedSink::new(vec![retryable(), retryable()]));
        let (controller, _, _) = controller(sink, 5);

        let start = tokio::time::Instant::now();
        controller.deliver(&batch()).await;
        // 100ms then 200ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(350), "{elapsed:?}");
    }
}
