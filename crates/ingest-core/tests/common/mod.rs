//! Shared fixtures for engine tests: an in-memory broker, a scripted sink and
//! payload builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ingest_core::{channel_for, BrokerConsumer, BrokerError, Delivery, EngineConfig, RetryPolicy};
use serde_json::{json, Value};
use transit_sink::{BatchSink, SinkError};
use transit_types::{decode_json_payload, Batch, PartitionOffset, SourcePosition};

pub const TOPIC: &str = "mta-vehicle-positions";

/// Broker that serves queued deliveries and records commits.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<VecDeque<Result<Delivery, BrokerError>>>,
    commits: Mutex<Vec<Vec<PartitionOffset>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, delivery: Delivery) {
        self.queue.lock().unwrap().push_back(Ok(delivery));
    }

    pub fn push_error(&self, error: BrokerError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        self.commits.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    /// Latest committed offset for a partition of `TOPIC`.
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter(|o| o.topic == TOPIC && o.partition == partition)
            .map(|o| o.offset)
            .last()
    }
}

#[async_trait]
impl BrokerConsumer for MemoryBroker {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(Ok(delivery)) => Ok(Some(delivery)),
            Some(Err(e)) => Err(e),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        self.commits.lock().unwrap().push(offsets.to_vec());
        Ok(())
    }
}

type DelayFn = Box<dyn Fn(&Batch) -> Option<Duration> + Send + Sync>;

/// One sink call as seen by the scripted sink.
#[derive(Debug, Clone)]
pub struct SinkCall {
    pub batch: Batch,
    /// Broker commits that had happened when the call started
    pub commits_before: usize,
    pub succeeded: bool,
}

/// Sink that answers from a script and records every call.
///
/// Responses are consumed in call order; once the script runs out every call
/// succeeds.
#[derive(Default)]
pub struct ScriptedSink {
    responses: Mutex<VecDeque<Result<(), SinkError>>>,
    calls: Mutex<Vec<SinkCall>>,
    delay: Option<DelayFn>,
    hang: bool,
    broker: Option<Arc<MemoryBroker>>,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(mut self, responses: Vec<Result<(), SinkError>>) -> Self {
        self.responses = Mutex::new(responses.into());
        self
    }

    pub fn with_delay(
        mut self,
        delay: impl Fn(&Batch) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    /// Never answer.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Note the broker's commit count at the start of every call.
    pub fn observing(mut self, broker: Arc<MemoryBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<Batch> {
        self.calls()
            .into_iter()
            .filter(|c| c.succeeded)
            .map(|c| c.batch)
            .collect()
    }
}

#[async_trait]
impl BatchSink for ScriptedSink {
    async fn commit(&self, batch: &Batch) -> Result<(), SinkError> {
        let commits_before = self.broker.as_ref().map_or(0, |b| b.commit_count());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay.as_ref().and_then(|f| f(batch)) {
            tokio::time::sleep(delay).await;
        }

        let response = self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.calls.lock().unwrap().push(SinkCall {
            batch: batch.clone(),
            commits_before,
            succeeded: response.is_ok(),
        });
        response
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A vehicle-monitoring message as the feed publishes it.
pub fn vehicle_message(vehicle: &str) -> Value {
    json!({
        "VehicleRef": vehicle,
        "LineRef": "MTA NYCT_M15",
        "DirectionRef": "0",
        "RecordedAtTime": "2025-08-25T14:30:00.000-04:00",
        "VehicleLocationLatitude": "40.7527",
        "VehicleLocationLongitude": "-73.9772",
        "Bearing": "90.0",
        "ProgressRate": "normalProgress",
        "Monitored": "true"
    })
}

pub fn delivery(partition: i32, offset: i64, payload: &Value) -> Delivery {
    raw_delivery(partition, offset, payload.to_string().as_bytes())
}

pub fn raw_delivery(partition: i32, offset: i64, payload: &[u8]) -> Delivery {
    let position = SourcePosition::new(TOPIC, partition, offset);
    let payload = decode_json_payload(&position, payload, None);
    Delivery { position, payload }
}

/// `count` distinct vehicle ids that all route to `channel`.
pub fn vehicles_on_channel(channel: usize, channels: usize, count: usize) -> Vec<String> {
    (0..)
        .map(|i| format!("MTA NYCT_{i}"))
        .filter(|id| channel_for(id, channels) == channel)
        .take(count)
        .collect()
}

pub fn engine_config(channels: usize, batch_size: usize, flush_interval: Duration) -> EngineConfig {
    EngineConfig {
        channels,
        batch_size,
        flush_interval,
        poll_timeout: Duration::from_millis(100),
        shutdown_grace: Duration::from_secs(5),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
            jitter: 0.0,
        },
        ..Default::default()
    }
}

/// Wait (in test time) until `condition` holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
