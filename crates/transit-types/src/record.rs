//! Normalized vehicle-position records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Serialize, Serializer};

use crate::raw::TopicPartition;

/// An enumerated status read from the feed.
///
/// Implementations map known spellings to variants and keep anything else
/// verbatim in an `Other` variant, so no information is lost.
pub trait StatusValue: Sized {
    fn from_raw(raw: &str) -> Self;

    /// Canonical spelling of the value.
    fn as_str(&self) -> &str;

    /// Whether the raw value matched a known variant.
    fn is_recognized(&self) -> bool;
}

/// Direction of travel along a line (`DirectionRef`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
    Other(String),
}

impl StatusValue for Direction {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "0" => Direction::Outbound,
            "1" => Direction::Inbound,
            other => Direction::Other(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Direction::Outbound => "0",
            Direction::Inbound => "1",
            Direction::Other(s) => s,
        }
    }

    fn is_recognized(&self) -> bool {
        !matches!(self, Direction::Other(_))
    }
}

/// SIRI `ProgressRate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressRate {
    NoProgress,
    SlowProgress,
    NormalProgress,
    FastProgress,
    Unknown,
    Other(String),
}

impl StatusValue for ProgressRate {
    fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "noprogress" => ProgressRate::NoProgress,
            "slowprogress" => ProgressRate::SlowProgress,
            "normalprogress" => ProgressRate::NormalProgress,
            "fastprogress" => ProgressRate::FastProgress,
            "unknown" => ProgressRate::Unknown,
            _ => ProgressRate::Other(raw.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            ProgressRate::NoProgress => "noProgress",
            ProgressRate::SlowProgress => "slowProgress",
            ProgressRate::NormalProgress => "normalProgress",
            ProgressRate::FastProgress => "fastProgress",
            ProgressRate::Unknown => "unknown",
            ProgressRate::Other(s) => s,
        }
    }

    fn is_recognized(&self) -> bool {
        !matches!(self, ProgressRate::Other(_))
    }
}

/// MTA `ProgressStatus`. Combined values such as `layover,prevTrip` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressStatus {
    Layover,
    PrevTrip,
    Spooking,
    Other(String),
}

impl StatusValue for ProgressStatus {
    fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "layover" => ProgressStatus::Layover,
            "prevtrip" => ProgressStatus::PrevTrip,
            "spooking" => ProgressStatus::Spooking,
            _ => ProgressStatus::Other(raw.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            ProgressStatus::Layover => "layover",
            ProgressStatus::PrevTrip => "prevTrip",
            ProgressStatus::Spooking => "spooking",
            ProgressStatus::Other(s) => s,
        }
    }

    fn is_recognized(&self) -> bool {
        !matches!(self, ProgressStatus::Other(_))
    }
}

fn serialize_status<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: StatusValue,
{
    match value {
        Some(v) => serializer.serialize_some(v.as_str()),
        None => serializer.serialize_none(),
    }
}

/// Broker coordinates of the message a record was decoded from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSource {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Index of the record inside its broker payload
    pub index: u32,
    pub broker_timestamp: Option<DateTime<Utc>>,
}

impl RecordSource {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A normalized vehicle-position event.
///
/// Every optional field is either a typed value or `None`. Empty strings and
/// half-parsed values never reach this type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Stable identifier used by the sink for deduplication
    pub record_id: String,

    // Identifiers
    pub vehicle_id: String,
    pub line_id: Option<String>,
    pub published_line_name: Option<String>,
    #[serde(serialize_with = "serialize_status")]
    pub direction: Option<Direction>,
    pub operator_id: Option<String>,
    pub journey_pattern_id: Option<String>,
    pub dated_vehicle_journey_id: Option<String>,
    pub block_id: Option<String>,
    pub origin_id: Option<String>,
    pub destination_id: Option<String>,
    pub destination_name: Option<String>,
    pub stop_id: Option<String>,
    pub stop_name: Option<String>,
    pub visit_number: Option<i64>,
    pub situation_refs: Vec<String>,

    // Timestamps
    pub recorded_at: Option<DateTime<Utc>>,
    pub expected_arrival: Option<DateTime<Utc>>,
    pub expected_departure: Option<DateTime<Utc>>,
    pub aimed_arrival: Option<DateTime<Utc>>,
    pub origin_aimed_departure: Option<DateTime<Utc>>,
    pub source_ts: Option<DateTime<Utc>>,
    pub service_date: Option<NaiveDate>,

    // Position
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bearing: Option<f64>,

    // Status
    #[serde(serialize_with = "serialize_status")]
    pub progress_rate: Option<ProgressRate>,
    #[serde(serialize_with = "serialize_status")]
    pub progress_status: Option<ProgressStatus>,
    pub monitored: Option<bool>,
    pub arrival_proximity_text: Option<String>,

    // Metrics
    pub distance_from_stop: Option<f64>,
    pub number_of_stops_away: Option<i64>,
    pub estimated_passenger_count: Option<i64>,
    pub estimated_passenger_capacity: Option<i64>,

    // Ingestion metadata
    pub ingestion_time: DateTime<Utc>,
    pub source_system: String,
    pub source: RecordSource,
}

impl Record {
    /// A record with only the required fields set. Used by tests and tooling.
    pub fn minimal(
        vehicle_id: impl Into<String>,
        source: RecordSource,
        ingestion_time: DateTime<Utc>,
    ) -> Self {
        let record_id = format!(
            "{}:{}:{}:{}",
            source.topic, source.partition, source.offset, source.index
        );
        Self {
            record_id,
            vehicle_id: vehicle_id.into(),
            line_id: None,
            published_line_name: None,
            direction: None,
            operator_id: None,
            journey_pattern_id: None,
            dated_vehicle_journey_id: None,
            block_id: None,
            origin_id: None,
            destination_id: None,
            destination_name: None,
            stop_id: None,
            stop_name: None,
            visit_number: None,
            situation_refs: Vec::new(),
            recorded_at: None,
            expected_arrival: None,
            expected_departure: None,
            aimed_arrival: None,
            origin_aimed_departure: None,
            source_ts: None,
            service_date: None,
            latitude: None,
            longitude: None,
            bearing: None,
            progress_rate: None,
            progress_status: None,
            monitored: None,
            arrival_proximity_text: None,
            distance_from_stop: None,
            number_of_stops_away: None,
            estimated_passenger_count: None,
            estimated_passenger_capacity: None,
            ingestion_time,
            source_system: String::new(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_mapping() {
        assert_eq!(Direction::from_raw("0"), Direction::Outbound);
        assert_eq!(Direction::from_raw("1"), Direction::Inbound);
        assert_eq!(Direction::from_raw("N"), Direction::Other("N".to_string()));
        assert!(!Direction::from_raw("N").is_recognized());
    }

    #[test]
    fn test_progress_status_combined_value_is_preserved() {
        let status = ProgressStatus::from_raw("layover,prevTrip");
        assert_eq!(status, ProgressStatus::Other("layover,prevTrip".to_string()));
        assert_eq!(status.as_str(), "layover,prevTrip");
        assert_eq!(ProgressStatus::from_raw("prevTrip"), ProgressStatus::PrevTrip);
    }

    #[test]
    fn test_record_serializes_absent_as_null() {
        let source = RecordSource {
            topic: "mta".to_string(),
            partition: 1,
            offset: 10,
            index: 0,
            broker_timestamp: None,
        };
        let mut record = Record::minimal("MTA_1", source, Utc::now());
        record.progress_rate = Some(ProgressRate::Other("weird".to_string()));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record_id"], "mta:1:10:0");
        assert!(json["latitude"].is_null());
        assert!(json["direction"].is_null());
        assert_eq!(json["progress_rate"], "weird");
    }
}
