//! Raw broker messages.
//!
//! A `RawMessage` is the flat field-name to string mapping decoded from one
//! broker payload (or from one element of a payload array), together with the
//! broker metadata needed to commit its offset later. It only lives for the
//! duration of normalization.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A topic and partition pair. Offsets are tracked per `TopicPartition`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Location of a broker message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl SourcePosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A decoded broker message before validation.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Field values keyed by lowercased field name
    fields: HashMap<String, String>,
    /// Where the message came from
    pub position: SourcePosition,
    /// Index of this message inside its broker payload (payloads may carry arrays)
    pub index: u32,
    /// Broker-assigned timestamp, if the broker provided one
    pub broker_timestamp: Option<DateTime<Utc>>,
    /// When this process received the message
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Create a raw message. Field names are lowercased so lookups are case-insensitive;
    /// the upstream feed mixes `VehicleRef` and `vehicleref` spellings.
    ///
    /// When both spellings are present the first non-blank value wins.
    pub fn new<K, V, I>(position: SourcePosition, index: u32, fields: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut map: HashMap<String, String> = HashMap::new();
        for (k, v) in fields {
            let value = v.into();
            match map.entry(k.as_ref().to_ascii_lowercase()) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().trim().is_empty() && !value.trim().is_empty() {
                        slot.insert(value);
                    }
                }
            }
        }
        let fields = map;
        Self {
            fields,
            position,
            index,
            broker_timestamp: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_broker_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.broker_timestamp = timestamp;
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Look up a field by name, ignoring ASCII case.
    pub fn field(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.fields.get(name) {
            return Some(value.as_str());
        }
        self.fields
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// All fields, with lowercased names.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }
}
