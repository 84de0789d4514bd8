//! rdkafka-backed broker consumer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{BrokerConsumer, BrokerError, Delivery};
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};
use transit_types::{decode_json_payload, PartitionOffset, PayloadError, SourcePosition};

use crate::config::ConsumerConfig;

/// Kafka consumer with manual offset management.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    config: ConsumerConfig,
}

impl KafkaConsumer {
    /// Create the consumer and subscribe to the configured topics.
    pub fn new(config: ConsumerConfig) -> Result<Self, BrokerError> {
        config.validate().map_err(BrokerError::Create)?;

        let consumer: StreamConsumer = config
            .client_config()
            .create()
            .map_err(|e| BrokerError::Create(e.to_string()))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Subscribe(format!("{topics:?}: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            security_protocol = config.security_protocol.as_deref().unwrap_or("PLAINTEXT"),
            "Kafka consumer subscribed to {topics:?}"
        );

        Ok(Self { consumer, config })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

/// Decode a Kafka message into a delivery. Never fails: undecodable
/// payloads are carried as the delivery's payload error.
fn to_delivery(msg: &BorrowedMessage<'_>) -> Delivery {
    let position = SourcePosition::new(msg.topic(), msg.partition(), msg.offset());
    let broker_timestamp = msg
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    let payload = match msg.payload() {
        Some(bytes) => decode_json_payload(&position, bytes, broker_timestamp),
        None => Err(PayloadError::Empty),
    };
    Delivery { position, payload }
}

/// Offsets are already next-offset-to-consume, so they go to Kafka unchanged.
fn to_partition_list(offsets: &[PartitionOffset]) -> Result<TopicPartitionList, BrokerError> {
    let mut tpl = TopicPartitionList::new();
    for o in offsets {
        tpl.add_partition_offset(&o.topic, o.partition, Offset::Offset(o.offset))
            .map_err(|e| BrokerError::Commit(format!("Failed to add partition offset: {e}")))?;
    }
    Ok(tpl)
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(msg)) => Ok(Some(to_delivery(&msg))),
            Ok(Err(e)) => Err(BrokerError::Poll(e.to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let tpl = to_partition_list(offsets)?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::Commit(e.to_string()))?;
        debug!(partitions = offsets.len(), "Committed Kafka offsets");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_list_keeps_next_offsets() {
        let tpl = to_partition_list(&[
            PartitionOffset {
                topic: "icymta".to_string(),
                partition: 0,
                offset: 42,
            },
            PartitionOffset {
                topic: "icymta".to_string(),
                partition: 3,
                offset: 7,
            },
        ])
        .unwrap();

        assert_eq!(tpl.count(), 2);
        let p0 = tpl.find_partition("icymta", 0).unwrap();
        assert_eq!(p0.offset(), Offset::Offset(42));
        let p3 = tpl.find_partition("icymta", 3).unwrap();
        assert_eq!(p3.offset(), Offset::Offset(7));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = KafkaConsumer::new(ConsumerConfig {
            topics: vec![],
            ..Default::default()
        });
        assert!(matches!(result, Err(BrokerError::Create(_))));
    }
}
