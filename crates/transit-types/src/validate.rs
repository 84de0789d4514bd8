//! Field validators.
//!
//! Every validator is total: it takes the raw string (or nothing) and returns a
//! `Parsed` value. Nothing here panics or returns an error for malformed input,
//! and an empty string never survives as a value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::StatusValue;

/// Markers the upstream feed uses for "no value".
const ABSENT_MARKERS: [&str; 3] = ["none", "null", "nan"];

/// Naive timestamp layouts accepted after RFC 3339. Interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Outcome of validating one raw field.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    /// The field held a usable value.
    Valid(T),
    /// The field was missing, blank, or an explicit null marker.
    Missing,
    /// The field held text that could not be parsed.
    Invalid,
}

impl<T> Parsed<T> {
    /// Collapse into the absent-or-present form stored on a `Record`.
    pub fn value(self) -> Option<T> {
        match self {
            Parsed::Valid(v) => Some(v),
            Parsed::Missing | Parsed::Invalid => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Parsed::Invalid)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Parsed::Valid(_))
    }
}

/// Inclusive plausible range for a coordinate.
///
/// Values outside the range are kept; the range only drives data-quality metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateRange {
    pub min: f64,
    pub max: f64,
}

impl CoordinateRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Latitude bounds of the New York City service area.
    pub fn nyc_latitude() -> Self {
        Self::new(40.4, 41.0)
    }

    /// Longitude bounds of the New York City service area.
    pub fn nyc_longitude() -> Self {
        Self::new(-74.5, -73.5)
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Trim and drop blank values and null markers.
fn clean(raw: Option<&str>) -> Option<&str> {
    let trimmed = raw?.trim();
    if trimmed.is_empty()
        || ABSENT_MARKERS
            .iter()
            .any(|marker| trimmed.eq_ignore_ascii_case(marker))
    {
        return None;
    }
    Some(trimmed)
}

/// Free text. Blank values and null markers become `Missing`.
pub fn parse_text(raw: Option<&str>) -> Parsed<String> {
    match clean(raw) {
        Some(s) => Parsed::Valid(s.to_string()),
        None => Parsed::Missing,
    }
}

/// A finite floating point number.
pub fn parse_number(raw: Option<&str>) -> Parsed<f64> {
    let Some(s) = clean(raw) else {
        return Parsed::Missing;
    };
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Parsed::Valid(v),
        _ => Parsed::Invalid,
    }
}

/// A geographic coordinate.
///
/// Same rule as `parse_number`; plausibility is checked separately with
/// `CoordinateRange::contains` because out-of-range values are still kept.
pub fn parse_coordinate(raw: Option<&str>) -> Parsed<f64> {
    parse_number(raw)
}

/// A whole number. Accepts integral decimals such as `"3.0"`.
pub fn parse_integer(raw: Option<&str>) -> Parsed<i64> {
    let Some(s) = clean(raw) else {
        return Parsed::Missing;
    };
    if let Ok(v) = s.parse::<i64>() {
        return Parsed::Valid(v);
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
            Parsed::Valid(v as i64)
        }
        _ => Parsed::Invalid,
    }
}

pub fn parse_bool(raw: Option<&str>) -> Parsed<bool> {
    let Some(s) = clean(raw) else {
        return Parsed::Missing;
    };
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Parsed::Valid(true),
        "false" | "f" | "no" | "n" | "0" => Parsed::Valid(false),
        _ => Parsed::Invalid,
    }
}

/// An instant, normalized to UTC.
///
/// Accepts RFC 3339 (`Z` or numeric offset) first, then naive date-times which
/// are taken to be UTC.
pub fn parse_timestamp(raw: Option<&str>) -> Parsed<DateTime<Utc>> {
    let Some(s) = clean(raw) else {
        return Parsed::Missing;
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Parsed::Valid(dt.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Parsed::Valid(naive.and_utc());
        }
    }
    Parsed::Invalid
}

/// A calendar date (`YYYY-MM-DD`). A full timestamp contributes its date part.
pub fn parse_date(raw: Option<&str>) -> Parsed<NaiveDate> {
    let Some(s) = clean(raw) else {
        return Parsed::Missing;
    };
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Parsed::Valid(date);
    }
    match parse_timestamp(Some(s)) {
        Parsed::Valid(dt) => Parsed::Valid(dt.date_naive()),
        _ => Parsed::Invalid,
    }
}

/// An enumerated status. Unknown values are kept verbatim, never dropped,
/// so this only returns `Valid` or `Missing`.
pub fn parse_status<S: StatusValue>(raw: Option<&str>) -> Parsed<S> {
    match clean(raw) {
        Some(s) => Parsed::Valid(S::from_raw(s)),
        None => Parsed::Missing,
    }
}
