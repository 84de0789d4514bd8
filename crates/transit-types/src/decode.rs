//! JSON payload decoding.
//!
//! A broker payload is either one JSON object or an array of objects. Each
//! object becomes one `RawMessage`. Scalar values are stringified so every
//! field goes through the same validators; `null` becomes an absent field and
//! nested structures are kept as their JSON text.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::PayloadError;
use crate::raw::{RawMessage, SourcePosition};

/// Decode one broker payload into raw messages.
///
/// Non-object elements of an array payload are skipped with a warning.
pub fn decode_json_payload(
    position: &SourcePosition,
    payload: &[u8],
    broker_timestamp: Option<DateTime<Utc>>,
) -> Result<Vec<RawMessage>, PayloadError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(PayloadError::Empty);
    }
    let text =
        std::str::from_utf8(payload).map_err(|e| PayloadError::InvalidUtf8(e.to_string()))?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

    let received_at = Utc::now();
    let objects: Vec<(usize, Map<String, Value>)> = match value {
        Value::Object(map) => vec![(0, map)],
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                Value::Object(map) => Some((index, map)),
                other => {
                    warn!(
                        position = %position,
                        index,
                        "Skipping {} element in payload array",
                        shape_name(&other)
                    );
                    None
                }
            })
            .collect(),
        other => return Err(PayloadError::UnexpectedShape(shape_name(&other))),
    };

    Ok(objects
        .into_iter()
        .map(|(index, map)| {
            RawMessage::new(position.clone(), index as u32, flatten(map))
                .with_broker_timestamp(broker_timestamp)
                .with_received_at(received_at)
        })
        .collect())
}

fn flatten(map: Map<String, Value>) -> impl Iterator<Item = (String, String)> {
    map.into_iter().filter_map(|(key, value)| {
        let text = match value {
            Value::Null => return None,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            nested @ (Value::Array(_) | Value::Object(_)) => nested.to_string(),
        };
        Some((key, text))
    })
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "nested array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> SourcePosition {
        SourcePosition::new("mta", 0, 5)
    }

    #[test]
    fn test_decode_single_object() {
        let payload = br#"{"VehicleRef": "MTA_1", "Bearing": 61.5, "Monitored": true, "StopPointName": null}"#;
        let messages = decode_json_payload(&position(), payload, None).unwrap();

        assert_eq!(messages.len(), 1);
        let raw = &messages[0];
        assert_eq!(raw.field("vehicleref"), Some("MTA_1"));
        assert_eq!(raw.field("bearing"), Some("61.5"));
        assert_eq!(raw.field("monitored"), Some("true"));
        assert_eq!(raw.field("stoppointname"), None);
        assert_eq!(raw.position, position());
        assert_eq!(raw.index, 0);
    }

    #[test]
    fn test_decode_array_assigns_indexes() {
        let payload = br#"[{"VehicleRef": "A"}, {"VehicleRef": "B"}, {"VehicleRef": "C"}]"#;
        let messages = decode_json_payload(&position(), payload, None).unwrap();

        let indexes: Vec<u32> = messages.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(messages[2].field("VehicleRef"), Some("C"));
        assert!(messages.iter().all(|m| m.position.offset == 5));
    }

    #[test]
    fn test_decode_empty_array_yields_nothing() {
        let messages = decode_json_payload(&position(), b"[]", None).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_decode_nested_value_kept_as_json_text() {
        let payload = br#"{"VehicleRef": "A", "Extra": {"k": [1, 2]}}"#;
        let messages = decode_json_payload(&position(), payload, None).unwrap();
        assert_eq!(messages[0].field("extra"), Some(r#"{"k":[1,2]}"#));
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert_eq!(
            decode_json_payload(&position(), b"", None).unwrap_err(),
            PayloadError::Empty
        );
        assert_eq!(
            decode_json_payload(&position(), b"  \n", None).unwrap_err(),
            PayloadError::Empty
        );
        assert!(matches!(
            decode_json_payload(&position(), b"{not json", None).unwrap_err(),
            PayloadError::InvalidJson(_)
        ));
        assert!(matches!(
            decode_json_payload(&position(), &[0xff, 0xfe, 0x7b], None).unwrap_err(),
            PayloadError::InvalidUtf8(_)
        ));
        assert_eq!(
            decode_json_payload(&position(), b"42", None).unwrap_err(),
            PayloadError::UnexpectedShape("number")
        );
    }

    #[test]
    fn test_decode_skips_non_object_array_elements() {
        let payload = br#"[{"VehicleRef": "A"}, "x", 3, {"VehicleRef": "B"}]"#;
        let messages = decode_json_payload(&position(), payload, None).unwrap();

        assert_eq!(messages.len(), 2);
        // Indexes follow the element position so record ids stay stable
        assert_eq!(messages[0].index, 0);
        assert_eq!(messages[1].index, 3);
    }

    #[test]
    fn test_decode_prefers_populated_spelling() {
        let payload = br#"{"VehicleRef": "MTA_1", "vehicleref": "", "VehicleLocationLatitude": "40.75", "vehiclelocationlatitude": ""}"#;
        let messages = decode_json_payload(&position(), payload, None).unwrap();
        assert_eq!(messages[0].field("vehicleref"), Some("MTA_1"));
        assert_eq!(messages[0].field("vehiclelocationlatitude"), Some("40.75"));

        let normalized = crate::Normalizer::new(crate::NormalizerConfig::default())
            .normalize(&messages[0])
            .unwrap();
        assert_eq!(normalized.record.vehicle_id, "MTA_1");
        assert_eq!(normalized.record.latitude, Some(40.75));
    }

    #[test]
    fn test_decode_carries_broker_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2025-08-25T18:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let messages = decode_json_payload(&position(), br#"{"VehicleRef": "A"}"#, Some(ts)).unwrap();
        assert_eq!(messages[0].broker_timestamp, Some(ts));
    }
}
