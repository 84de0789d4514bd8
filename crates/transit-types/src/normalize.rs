//! Record normalization.
//!
//! Maps a `RawMessage` into a `Record` by running the field validators.
//! Only a missing vehicle id rejects the message; every other field degrades
//! to `None`, and the degradation is reported in a `QualityReport`.

use chrono::{DateTime, Utc};

use crate::error::RecordRejected;
use crate::raw::RawMessage;
use crate::record::{Record, RecordSource, StatusValue};
use crate::validate::{
    parse_bool, parse_coordinate, parse_date, parse_integer, parse_number, parse_status,
    parse_text, parse_timestamp, CoordinateRange, Parsed,
};

/// Feed field names, compared case-insensitively.
mod field {
    pub const VEHICLE: &str = "vehicleref";
    pub const LINE: &str = "lineref";
    pub const PUBLISHED_LINE_NAME: &str = "publishedlinename";
    pub const DIRECTION: &str = "directionref";
    pub const OPERATOR: &str = "operatorref";
    pub const JOURNEY_PATTERN: &str = "journeypatternref";
    pub const DATED_VEHICLE_JOURNEY: &str = "datedvehiclejourneyref";
    pub const BLOCK: &str = "blockref";
    pub const ORIGIN: &str = "originref";
    pub const DESTINATION: &str = "destinationref";
    pub const DESTINATION_NAME: &str = "destinationname";
    pub const STOP: &str = "stoppointref";
    pub const STOP_NAME: &str = "stoppointname";
    pub const VISIT_NUMBER: &str = "visitnumber";
    pub const SITUATION_REFS: [&str; 5] = [
        "situationsimpleref1",
        "situationsimpleref2",
        "situationsimpleref3",
        "situationsimpleref4",
        "situationsimpleref5",
    ];
    pub const RECORDED_AT: &str = "recordedattime";
    pub const EXPECTED_ARRIVAL: &str = "expectedarrivaltime";
    pub const EXPECTED_DEPARTURE: &str = "expecteddeparturetime";
    pub const AIMED_ARRIVAL: &str = "aimedarrivaltime";
    pub const ORIGIN_AIMED_DEPARTURE: &str = "originaimeddeparturetime";
    pub const TS: &str = "ts";
    pub const DATE: &str = "date";
    pub const LATITUDE: &str = "vehiclelocationlatitude";
    pub const LONGITUDE: &str = "vehiclelocationlongitude";
    pub const BEARING: &str = "bearing";
    pub const PROGRESS_RATE: &str = "progressrate";
    pub const PROGRESS_STATUS: &str = "progressstatus";
    pub const MONITORED: &str = "monitored";
    pub const ARRIVAL_PROXIMITY_TEXT: &str = "arrivalproximitytext";
    pub const DISTANCE_FROM_STOP: &str = "distancefromstop";
    pub const STOPS_AWAY: &str = "numberofstopsaway";
    pub const PASSENGER_COUNT: &str = "estimatedpassengercount";
    pub const PASSENGER_CAPACITY: &str = "estimatedpassengercapacity";
    pub const UUID: &str = "uuid";
}

/// Normalizer settings.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Plausible latitude range, `None` disables the check
    pub latitude_range: Option<CoordinateRange>,
    /// Plausible longitude range, `None` disables the check
    pub longitude_range: Option<CoordinateRange>,
    /// Label stamped on every record
    pub source_system: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            latitude_range: Some(CoordinateRange::nyc_latitude()),
            longitude_range: Some(CoordinateRange::nyc_longitude()),
            source_system: "MTA_REALTIME".to_string(),
        }
    }
}

/// Data-quality observations made while normalizing one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityReport {
    pub latitude_absent: bool,
    pub longitude_absent: bool,
    pub latitude_out_of_range: bool,
    pub longitude_out_of_range: bool,
    /// Fields that held text but failed to parse
    pub invalid_fields: Vec<&'static str>,
    /// Status fields whose values were kept verbatim
    pub unrecognized_statuses: Vec<&'static str>,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        *self == QualityReport::default()
    }

    pub fn invalid_timestamps(&self) -> usize {
        self.invalid_fields
            .iter()
            .filter(|f| TIMESTAMP_FIELDS.contains(f))
            .count()
    }
}

const TIMESTAMP_FIELDS: [&str; 6] = [
    field::RECORDED_AT,
    field::EXPECTED_ARRIVAL,
    field::EXPECTED_DEPARTURE,
    field::AIMED_ARRIVAL,
    field::ORIGIN_AIMED_DEPARTURE,
    field::TS,
];

/// A normalized record plus what was noticed along the way.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: Record,
    pub quality: QualityReport,
}

/// Converts raw messages into records.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

/// Per-message helper that records invalid fields as it goes.
struct FieldReader<'a> {
    raw: &'a RawMessage,
    quality: QualityReport,
}

impl<'a> FieldReader<'a> {
    fn keep<T>(&mut self, name: &'static str, parsed: Parsed<T>) -> Option<T> {
        if parsed.is_invalid() {
            self.quality.invalid_fields.push(name);
        }
        parsed.value()
    }

    fn text(&mut self, name: &'static str) -> Option<String> {
        self.keep(name, parse_text(self.raw.field(name)))
    }

    fn number(&mut self, name: &'static str) -> Option<f64> {
        self.keep(name, parse_number(self.raw.field(name)))
    }

    fn integer(&mut self, name: &'static str) -> Option<i64> {
        self.keep(name, parse_integer(self.raw.field(name)))
    }

    fn timestamp(&mut self, name: &'static str) -> Option<DateTime<Utc>> {
        self.keep(name, parse_timestamp(self.raw.field(name)))
    }

    fn status<S: StatusValue>(&mut self, name: &'static str) -> Option<S> {
        let value = parse_status::<S>(self.raw.field(name)).value();
        if matches!(&value, Some(v) if !v.is_recognized()) {
            self.quality.unrecognized_statuses.push(name);
        }
        value
    }

    fn coordinate(
        &mut self,
        name: &'static str,
        range: Option<&CoordinateRange>,
    ) -> (Option<f64>, bool, bool) {
        let value = self.keep(name, parse_coordinate(self.raw.field(name)));
        let out_of_range = match (value, range) {
            (Some(v), Some(range)) => !range.contains(v),
            _ => false,
        };
        (value, value.is_none(), out_of_range)
    }
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize a message, stamping the current time as ingestion time.
    pub fn normalize(&self, raw: &RawMessage) -> Result<Normalized, RecordRejected> {
        self.normalize_at(raw, Utc::now())
    }

    /// Normalize a message with an explicit ingestion time.
    pub fn normalize_at(
        &self,
        raw: &RawMessage,
        ingestion_time: DateTime<Utc>,
    ) -> Result<Normalized, RecordRejected> {
        let vehicle_id = parse_text(raw.field(field::VEHICLE))
            .value()
            .ok_or_else(|| RecordRejected::MissingField {
                field: field::VEHICLE,
                position: raw.position.clone(),
            })?;

        let mut r = FieldReader {
            raw,
            quality: QualityReport::default(),
        };

        let source = RecordSource {
            topic: raw.position.topic.clone(),
            partition: raw.position.partition,
            offset: raw.position.offset,
            index: raw.index,
            broker_timestamp: raw.broker_timestamp,
        };
        // The upstream uuid survives redelivery; the broker position does too.
        let record_id = r.text(field::UUID).unwrap_or_else(|| {
            format!(
                "{}:{}:{}:{}",
                source.topic, source.partition, source.offset, source.index
            )
        });

        let (latitude, latitude_absent, latitude_out_of_range) =
            r.coordinate(field::LATITUDE, self.config.latitude_range.as_ref());
        let (longitude, longitude_absent, longitude_out_of_range) =
            r.coordinate(field::LONGITUDE, self.config.longitude_range.as_ref());
        r.quality.latitude_absent = latitude_absent;
        r.quality.longitude_absent = longitude_absent;
        r.quality.latitude_out_of_range = latitude_out_of_range;
        r.quality.longitude_out_of_range = longitude_out_of_range;

        let situation_refs = field::SITUATION_REFS
            .iter()
            .filter_map(|name| r.text(name))
            .collect();

        let monitored = r.keep(field::MONITORED, parse_bool(raw.field(field::MONITORED)));
        let service_date = r.keep(field::DATE, parse_date(raw.field(field::DATE)));

        let record = Record {
            record_id,
            vehicle_id,
            line_id: r.text(field::LINE),
            published_line_name: r.text(field::PUBLISHED_LINE_NAME),
            direction: r.status(field::DIRECTION),
            operator_id: r.text(field::OPERATOR),
            journey_pattern_id: r.text(field::JOURNEY_PATTERN),
            dated_vehicle_journey_id: r.text(field::DATED_VEHICLE_JOURNEY),
            block_id: r.text(field::BLOCK),
            origin_id: r.text(field::ORIGIN),
            destination_id: r.text(field::DESTINATION),
            destination_name: r.text(field::DESTINATION_NAME),
            stop_id: r.text(field::STOP),
            stop_name: r.text(field::STOP_NAME),
            visit_number: r.integer(field::VISIT_NUMBER),
            situation_refs,
            recorded_at: r.timestamp(field::RECORDED_AT),
            expected_arrival: r.timestamp(field::EXPECTED_ARRIVAL),
            expected_departure: r.timestamp(field::EXPECTED_DEPARTURE),
            aimed_arrival: r.timestamp(field::AIMED_ARRIVAL),
            origin_aimed_departure: r.timestamp(field::ORIGIN_AIMED_DEPARTURE),
            source_ts: r.timestamp(field::TS),
            service_date,
            latitude,
            longitude,
            bearing: r.number(field::BEARING),
            progress_rate: r.status(field::PROGRESS_RATE),
            progress_status: r.status(field::PROGRESS_STATUS),
            monitored,
            arrival_proximity_text: r.text(field::ARRIVAL_PROXIMITY_TEXT),
            distance_from_stop: r.number(field::DISTANCE_FROM_STOP),
            number_of_stops_away: r.integer(field::STOPS_AWAY),
            estimated_passenger_count: r.integer(field::PASSENGER_COUNT),
            estimated_passenger_capacity: r.integer(field::PASSENGER_CAPACITY),
            ingestion_time,
            source_system: self.config.source_system.clone(),
            source,
        };

        Ok(Normalized {
            record,
            quality: r.quality,
        })
    }
}
