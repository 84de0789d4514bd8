//! Sealed batches.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::raw::TopicPartition;
use crate::record::Record;

/// Identifies a batch as `<channel>-<sequence>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub channel: usize,
    pub sequence: u64,
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.channel, self.sequence)
    }
}

/// What caused a channel buffer to be sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "size"),
            FlushTrigger::Interval => write!(f, "interval"),
            FlushTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Highest broker offset of a partition contained in a batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PartitionOffset {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// An immutable group of records sealed from one channel buffer.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub channel: usize,
    /// Records in arrival order
    pub records: Vec<Record>,
    /// Max contained offset per partition, sorted by topic and partition
    pub offsets: Vec<PartitionOffset>,
    pub created_at: DateTime<Utc>,
    pub trigger: FlushTrigger,
}

impl Batch {
    /// Seal `records` into a batch. Offsets are derived from the records.
    pub fn seal(id: BatchId, records: Vec<Record>, trigger: FlushTrigger) -> Self {
        let mut max_offsets: BTreeMap<TopicPartition, i64> = BTreeMap::new();
        for record in &records {
            let entry = max_offsets
                .entry(record.source.topic_partition())
                .or_insert(record.source.offset);
            *entry = (*entry).max(record.source.offset);
        }
        let offsets = max_offsets
            .into_iter()
            .map(|(tp, offset)| PartitionOffset {
                topic: tp.topic,
                partition: tp.partition,
                offset,
            })
            .collect();

        Self {
            id,
            channel: id.channel,
            records,
            offsets,
            created_at: Utc::now(),
            trigger,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Broker position of every record, in batch order.
    ///
    /// A position appears once per record, so a payload that decoded into
    /// several records shows up several times.
    pub fn positions(&self) -> impl Iterator<Item = (TopicPartition, i64)> + '_ {
        self.records
            .iter()
            .map(|r| (r.source.topic_partition(), r.source.offset))
    }
}
