//! Ingestion metrics.
//!
//! All counters are atomics shared through an `Arc`, so the poll loop, channel
//! workers and the health endpoint update and read them without locking.
//! Reading never blocks ingestion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use transit_types::{FlushTrigger, QualityReport};

const NO_LATENCY: u64 = u64::MAX;

#[derive(Debug)]
struct ChannelCounters {
    records_in: AtomicU64,
    buffered: AtomicU64,
    in_flight: AtomicU64,
    records_committed: AtomicU64,
    records_dead_lettered: AtomicU64,
    flushes_size: AtomicU64,
    flushes_interval: AtomicU64,
    flushes_shutdown: AtomicU64,
    batches_committed: AtomicU64,
    batches_dead_lettered: AtomicU64,
    retries: AtomicU64,
    retrying: AtomicBool,
    last_flush_latency_ms: AtomicU64,
}

impl Default for ChannelCounters {
    fn default() -> Self {
        Self {
            records_in: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            records_committed: AtomicU64::new(0),
            records_dead_lettered: AtomicU64::new(0),
            flushes_size: AtomicU64::new(0),
            flushes_interval: AtomicU64::new(0),
            flushes_shutdown: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            batches_dead_lettered: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            retrying: AtomicBool::new(false),
            last_flush_latency_ms: AtomicU64::new(NO_LATENCY),
        }
    }
}

#[derive(Debug, Default)]
struct QualityCounters {
    latitude_absent: AtomicU64,
    longitude_absent: AtomicU64,
    latitude_out_of_range: AtomicU64,
    longitude_out_of_range: AtomicU64,
    timestamps_invalid: AtomicU64,
    fields_invalid: AtomicU64,
    statuses_unrecognized: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    started: Instant,
    started_at: DateTime<Utc>,
    channels: Vec<ChannelCounters>,
    records_rejected: AtomicU64,
    payloads_rejected: AtomicU64,
    sink_calls: AtomicU64,
    sink_failures: AtomicU64,
    dead_letter_write_failures: AtomicU64,
    offset_commits: AtomicU64,
    commit_failures: AtomicU64,
    broker_errors: AtomicU64,
    quality: QualityCounters,
    broker_connected: AtomicBool,
    sink_healthy: AtomicBool,
    stopping: AtomicBool,
}

/// Shared metrics handle. Cloning is cheap and all clones see the same counters.
#[derive(Debug, Clone)]
pub struct IngestMetrics {
    inner: Arc<Inner>,
}

/// Per-channel counters at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: usize,
    pub records_in: u64,
    pub records_buffered: u64,
    pub records_in_flight: u64,
    pub records_committed: u64,
    pub records_dead_lettered: u64,
    pub batches_flushed: u64,
    pub size_flushes: u64,
    pub interval_flushes: u64,
    pub shutdown_flushes: u64,
    pub batches_committed: u64,
    pub batches_dead_lettered: u64,
    pub retries: u64,
    pub retrying: bool,
    /// Time from sealing the last finished batch to its outcome
    pub last_flush_latency_ms: Option<u64>,
}

/// Process-wide totals. `records_in` always equals the sum of the other
/// record counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub records_in: u64,
    pub records_committed: u64,
    pub records_dead_lettered: u64,
    pub records_rejected: u64,
    pub records_buffered: u64,
    pub records_in_flight: u64,
    /// Undecodable payloads, also counted in `records_rejected`
    pub payloads_rejected: u64,
    pub batches_flushed: u64,
    pub batches_committed: u64,
    pub batches_dead_lettered: u64,
    pub sink_calls: u64,
    pub sink_failures: u64,
    pub retries: u64,
    pub dead_letter_write_failures: u64,
    pub offset_commits: u64,
    pub commit_failures: u64,
    pub broker_errors: u64,
}

impl Totals {
    pub fn is_reconciled(&self) -> bool {
        self.records_in
            == self.records_committed
                + self.records_dead_lettered
                + self.records_rejected
                + self.records_buffered
                + self.records_in_flight
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub latitude_absent: u64,
    pub longitude_absent: u64,
    pub latitude_out_of_range: u64,
    pub longitude_out_of_range: u64,
    pub timestamps_invalid: u64,
    pub fields_invalid: u64,
    pub statuses_unrecognized: u64,
}

/// Everything the health snapshot needs from the counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime: Duration,
    pub totals: Totals,
    pub quality: QualitySnapshot,
    pub channels: Vec<ChannelSnapshot>,
    pub broker_connected: bool,
    pub sink_healthy: bool,
    pub stopping: bool,
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn drop_by(counter: &AtomicU64, by: u64) {
    // Gauges saturate at zero
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(by))
    });
}

impl IngestMetrics {
    pub fn new(channels: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                started: Instant::now(),
                started_at: Utc::now(),
                channels: (0..channels).map(|_| ChannelCounters::default()).collect(),
                records_rejected: AtomicU64::new(0),
                payloads_rejected: AtomicU64::new(0),
                sink_calls: AtomicU64::new(0),
                sink_failures: AtomicU64::new(0),
                dead_letter_write_failures: AtomicU64::new(0),
                offset_commits: AtomicU64::new(0),
                commit_failures: AtomicU64::new(0),
                broker_errors: AtomicU64::new(0),
                quality: QualityCounters::default(),
                broker_connected: AtomicBool::new(true),
                sink_healthy: AtomicBool::new(true),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    fn channel(&self, channel: usize) -> Option<&ChannelCounters> {
        self.inner.channels.get(channel)
    }

    // Intake

    /// A record entered a channel queue.
    pub fn record_routed(&self, channel: usize) {
        if let Some(c) = self.channel(channel) {
            bump(&c.records_in, 1);
            bump(&c.buffered, 1);
        }
    }

    /// A routed record could not be handed to its channel.
    pub fn record_unrouted(&self, channel: usize) {
        if let Some(c) = self.channel(channel) {
            drop_by(&c.records_in, 1);
            drop_by(&c.buffered, 1);
        }
    }

    /// A decoded message was rejected by the normalizer.
    pub fn record_rejected(&self) {
        bump(&self.inner.records_rejected, 1);
    }

    /// A broker payload could not be decoded at all.
    pub fn payload_rejected(&self) {
        bump(&self.inner.payloads_rejected, 1);
        bump(&self.inner.records_rejected, 1);
    }

    pub fn record_quality(&self, report: &QualityReport) {
        let q = &self.inner.quality;
        if report.latitude_absent {
            bump(&q.latitude_absent, 1);
        }
        if report.longitude_absent {
            bump(&q.longitude_absent, 1);
        }
        if report.latitude_out_of_range {
            bump(&q.latitude_out_of_range, 1);
        }
        if report.longitude_out_of_range {
            bump(&q.longitude_out_of_range, 1);
        }
        bump(&q.timestamps_invalid, report.invalid_timestamps() as u64);
        bump(&q.fields_invalid, report.invalid_fields.len() as u64);
        bump(
            &q.statuses_unrecognized,
            report.unrecognized_statuses.len() as u64,
        );
    }

    // Channel lifecycle

    /// Records moved from the buffer into a sealed batch.
    pub fn batch_sealed(&self, channel: usize, records: usize, trigger: FlushTrigger) {
        if let Some(c) = self.channel(channel) {
            drop_by(&c.buffered, records as u64);
            bump(&c.in_flight, records as u64);
            let flushes = match trigger {
                FlushTrigger::Size => &c.flushes_size,
                FlushTrigger::Interval => &c.flushes_interval,
                FlushTrigger::Shutdown => &c.flushes_shutdown,
            };
            bump(flushes, 1);
        }
    }

    pub fn batch_committed(&self, channel: usize, records: usize, latency: Duration) {
        if let Some(c) = self.channel(channel) {
            drop_by(&c.in_flight, records as u64);
            bump(&c.records_committed, records as u64);
            bump(&c.batches_committed, 1);
            c.last_flush_latency_ms
                .store(latency.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn batch_dead_lettered(&self, channel: usize, records: usize, latency: Duration) {
        if let Some(c) = self.channel(channel) {
            drop_by(&c.in_flight, records as u64);
            bump(&c.records_dead_lettered, records as u64);
            bump(&c.batches_dead_lettered, 1);
            c.last_flush_latency_ms
                .store(latency.as_millis() as u64, Ordering::Relaxed);
        }
    }

    // Sink

    pub fn sink_succeeded(&self) {
        bump(&self.inner.sink_calls, 1);
        self.inner.sink_healthy.store(true, Ordering::Relaxed);
    }

    pub fn sink_failed(&self) {
        bump(&self.inner.sink_calls, 1);
        bump(&self.inner.sink_failures, 1);
        self.inner.sink_healthy.store(false, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self, channel: usize) {
        if let Some(c) = self.channel(channel) {
            bump(&c.retries, 1);
        }
    }

    pub fn set_retrying(&self, channel: usize, retrying: bool) {
        if let Some(c) = self.channel(channel) {
            c.retrying.store(retrying, Ordering::Relaxed);
        }
    }

    pub fn dead_letter_write_failed(&self) {
        bump(&self.inner.dead_letter_write_failures, 1);
    }

    // Broker

    pub fn offsets_committed(&self) {
        bump(&self.inner.offset_commits, 1);
    }

    pub fn commit_failed(&self) {
        bump(&self.inner.commit_failures, 1);
    }

    pub fn broker_error(&self) {
        bump(&self.inner.broker_errors, 1);
        self.inner.broker_connected.store(false, Ordering::Relaxed);
    }

    /// Marks the broker reachable. Returns whether it was marked unreachable before.
    pub fn broker_reachable(&self) -> bool {
        !self.inner.broker_connected.swap(true, Ordering::Relaxed)
    }

    pub fn set_stopping(&self) {
        self.inner.stopping.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let channels: Vec<ChannelSnapshot> = inner
            .channels
            .iter()
            .enumerate()
            .map(|(channel, c)| {
                let size_flushes = load(&c.flushes_size);
                let interval_flushes = load(&c.flushes_interval);
                let shutdown_flushes = load(&c.flushes_shutdown);
                let latency = load(&c.last_flush_latency_ms);
                ChannelSnapshot {
                    channel,
                    records_in: load(&c.records_in),
                    records_buffered: load(&c.buffered),
                    records_in_flight: load(&c.in_flight),
                    records_committed: load(&c.records_committed),
                    records_dead_lettered: load(&c.records_dead_lettered),
                    batches_flushed: size_flushes + interval_flushes + shutdown_flushes,
                    size_flushes,
                    interval_flushes,
                    shutdown_flushes,
                    batches_committed: load(&c.batches_committed),
                    batches_dead_lettered: load(&c.batches_dead_lettered),
                    retries: load(&c.retries),
                    retrying: c.retrying.load(Ordering::Relaxed),
                    last_flush_latency_ms: (latency != NO_LATENCY).then_some(latency),
                }
            })
            .collect();

        let records_rejected = load(&inner.records_rejected);
        let mut totals = Totals {
            records_in: records_rejected,
            records_rejected,
            payloads_rejected: load(&inner.payloads_rejected),
            sink_calls: load(&inner.sink_calls),
            sink_failures: load(&inner.sink_failures),
            dead_letter_write_failures: load(&inner.dead_letter_write_failures),
            offset_commits: load(&inner.offset_commits),
            commit_failures: load(&inner.commit_failures),
            broker_errors: load(&inner.broker_errors),
            ..Default::default()
        };
        for c in &channels {
            totals.records_in += c.records_in;
            totals.records_committed += c.records_committed;
            totals.records_dead_lettered += c.records_dead_lettered;
            totals.records_buffered += c.records_buffered;
            totals.records_in_flight += c.records_in_flight;
            totals.batches_flushed += c.batches_flushed;
            totals.batches_committed += c.batches_committed;
            totals.batches_dead_lettered += c.batches_dead_lettered;
            totals.retries += c.retries;
        }

        let q = &inner.quality;
        MetricsSnapshot {
            started_at: inner.started_at,
            uptime: inner.started.elapsed(),
            totals,
            quality: QualitySnapshot {
                latitude_absent: load(&q.latitude_absent),
                longitude_absent: load(&q.longitude_absent),
                latitude_out_of_range: load(&q.latitude_out_of_range),
                longitude_out_of_range: load(&q.longitude_out_of_range),
                timestamps_invalid: load(&q.timestamps_invalid),
                fields_invalid: load(&q.fields_invalid),
                statuses_unrecognized: load(&q.statuses_unrecognized),
            },
            channels,
            broker_connected: inner.broker_connected.load(Ordering::Relaxed),
            sink_healthy: inner.sink_healthy.load(Ordering::Relaxed),
            stopping: inner.stopping.load(Ordering::Relaxed),
        }
    }
}

/// Resident memory of this process in MB, read from `/proc/self/status`.
/// Returns 0 where that file does not exist.
pub fn process_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .map(|kb| kb / 1024)
                })
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lifecycle_reconciles() {
        let metrics = IngestMetrics::new(2);

        for _ in 0..5 {
            metrics.record_routed(0);
        }
        metrics.record_routed(1);
        metrics.record_rejected();
        metrics.payload_rejected();
        assert!(metrics.snapshot().totals.is_reconciled());

        metrics.batch_sealed(0, 3, FlushTrigger::Size);
        metrics.batch_committed(0, 3, Duration::from_millis(40));
        metrics.batch_sealed(1, 1, FlushTrigger::Interval);
        metrics.batch_dead_lettered(1, 1, Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        let totals = &snapshot.totals;
        assert_eq!(totals.records_in, 8);
        assert_eq!(totals.records_committed, 3);
        assert_eq!(totals.records_dead_lettered, 1);
        assert_eq!(totals.records_rejected, 2);
        assert_eq!(totals.payloads_rejected, 1);
        assert_eq!(totals.records_buffered, 2);
        assert_eq!(totals.records_in_flight, 0);
        assert!(totals.is_reconciled());

        assert_eq!(snapshot.channels[0].size_flushes, 1);
        assert_eq!(snapshot.channels[0].last_flush_latency_ms, Some(40));
        assert_eq!(snapshot.channels[1].interval_flushes, 1);
        assert_eq!(snapshot.channels[1].batches_dead_lettered, 1);
    }

    #[test]
    fn test_unrouted_record_is_not_counted() {
        let metrics = IngestMetrics::new(1);
        metrics.record_routed(0);
        metrics.record_unrouted(0);
        let totals = metrics.snapshot().totals;
        assert_eq!(totals.records_in, 0);
        assert_eq!(totals.records_buffered, 0);
    }

    #[test]
    fn test_quality_counters() {
        let metrics = IngestMetrics::new(1);
        metrics.record_quality(&QualityReport {
            latitude_absent: true,
            longitude_out_of_range: true,
            invalid_fields: vec!["recordedattime", "bearing"],
            unrecognized_statuses: vec!["progressrate"],
            ..Default::default()
        });

        let quality = metrics.snapshot().quality;
        assert_eq!(quality.latitude_absent, 1);
        assert_eq!(quality.longitude_absent, 0);
        assert_eq!(quality.longitude_out_of_range, 1);
        assert_eq!(quality.timestamps_invalid, 1);
        assert_eq!(quality.fields_invalid, 2);
        assert_eq!(quality.statuses_unrecognized, 1);
    }

    #[test]
    fn test_connectivity_flags() {
        let metrics = IngestMetrics::new(1);
        assert!(!metrics.broker_reachable());

        metrics.broker_error();
        assert!(!metrics.snapshot().broker_connected);
        assert!(metrics.broker_reachable());
        assert!(metrics.snapshot().broker_connected);

        metrics.sink_failed();
        assert!(!metrics.snapshot().sink_healthy);
        metrics.sink_succeeded();
        let snapshot = metrics.snapshot();
        assert!(snapshot.sink_healthy);
        assert_eq!(snapshot.totals.sink_calls, 2);
        assert_eq!(snapshot.totals.sink_failures, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = IngestMetrics::new(4);

        let handles: Vec<_> = (0..4)
            .map(|channel| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        m.record_routed(channel);
                    }
                    m.batch_sealed(channel, 250, FlushTrigger::Size);
                    m.batch_committed(channel, 250, Duration::ZERO);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let totals = metrics.snapshot().totals;
        assert_eq!(totals.records_in, 1000);
        assert_eq!(totals.records_committed, 1000);
        assert_eq!(totals.batches_flushed, 4);
        assert!(totals.is_reconciled());
    }

    #[test]
    fn test_process_memory_mb() {
        // 0 on systems without /proc
        assert!(process_memory_mb() < u64::MAX);
    }
}
