/// Payload normalization
///
/// Maps a decoded Open-Meteo response into canonical `Observation`s:
/// timestamps to UTC with millisecond precision, temperatures to Celsius,
/// range checks that null out implausible values with a recorded reason,
/// and stamping of source tag, fetch time and run id.
///
/// A payload is rejected as a whole when an instant cannot be established
/// for one of its entries; there is no sensible default for a natural-key
/// timestamp.

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::ingest::open_meteo::{HourlyBlock, OpenMeteoResponse, describe_weather_code};
use crate::model::{Observation, RawPayload, SOURCE_CURRENT, Site, ValidationError};

pub const HUMIDITY_RANGE: RangeInclusive<f64> = 0.0..=100.0;
pub const TEMPERATURE_RANGE_C: RangeInclusive<f64> = -90.0..=60.0;
pub const PRESSURE_RANGE_HPA: RangeInclusive<f64> = 300.0..=1100.0;

/// One row's worth of values before unit handling.
#[derive(Debug, Default, Clone, Copy)]
struct RawValues {
    temperature: Option<f64>,
    humidity: Option<f64>,
    precipitation: Option<f64>,
    pressure: Option<f64>,
    weather_code: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TemperatureUnit {
    Celsius,
    Fahrenheit,
    Kelvin,
}

impl TemperatureUnit {
    fn from_label(units: &HashMap<String, String>) -> Result<Self, ValidationError> {
        let Some(label) = units.get("temperature_2m") else {
            return Ok(TemperatureUnit::Celsius);
        };
        match label.trim() {
            "°C" | "C" | "celsius" => Ok(TemperatureUnit::Celsius),
            "°F" | "F" | "fahrenheit" => Ok(TemperatureUnit::Fahrenheit),
            "K" | "kelvin" => Ok(TemperatureUnit::Kelvin),
            other => Err(ValidationError::UnsupportedUnit {
                field: "temperature_2m".to_string(),
                unit: other.to_string(),
            }),
        }
    }

    fn to_celsius(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
            TemperatureUnit::Kelvin => value - 273.15,
        }
    }
}

/// Stamps every record it produces with one run's id.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    run_id: Uuid,
}

impl Normalizer {
    pub fn new(run_id: Uuid) -> Self {
        Normalizer { run_id }
    }

    /// Turn one payload into observations. `hourly_source` tags records from
    /// the `hourly` block; the `current` block is always `SOURCE_CURRENT`.
    pub fn normalize(
        &self,
        site: &Site,
        hourly_source: &str,
        payload: &RawPayload,
    ) -> Result<Vec<Observation>, ValidationError> {
        let response = OpenMeteoResponse::deserialize(payload.document.as_ref())
            .map_err(|e| ValidationError::Schema(e.to_string()))?;

        if response.hourly.is_none() && response.current.is_none() {
            return Err(ValidationError::UnrecognizedShape);
        }

        let offset = response.utc_offset_seconds;
        let mut observations = Vec::new();

        if let Some(current) = &response.current {
            let unit = TemperatureUnit::from_label(&response.current_units)?;
            let raw_time = current
                .time
                .as_deref()
                .ok_or_else(|| ValidationError::MissingObservationTime("current".to_string()))?;
            let observation_time = parse_instant(raw_time, offset)?;
            let values = RawValues {
                temperature: current.temperature_2m,
                humidity: current.relative_humidity_2m,
                precipitation: current.precipitation,
                pressure: current.surface_pressure,
                weather_code: current.weather_code,
            };
            let record = self.build(site, SOURCE_CURRENT, observation_time, unit, values, payload);
            observations.push(record);
        }

        if let Some(hourly) = &response.hourly {
            if hourly.time.is_empty() {
                return Err(ValidationError::MissingObservationTime("hourly".to_string()));
            }
            let unit = TemperatureUnit::from_label(&response.hourly_units)?;
            let mut seen = HashSet::with_capacity(hourly.time.len());

            for (i, raw_time) in hourly.time.iter().enumerate() {
                let observation_time = parse_instant(raw_time, offset)?;
                if !seen.insert(observation_time) {
                    return Err(ValidationError::DuplicateInstant(observation_time.to_rfc3339()));
                }
                let values = RawValues {
                    temperature: HourlyBlock::value(&hourly.temperature_2m, i),
                    humidity: HourlyBlock::value(&hourly.relative_humidity_2m, i),
                    precipitation: HourlyBlock::value(&hourly.precipitation, i),
                    pressure: HourlyBlock::value(&hourly.surface_pressure, i),
                    weather_code: HourlyBlock::value(&hourly.weather_code, i),
                };
                let record =
                    self.build(site, hourly_source, observation_time, unit, values, payload);
                observations.push(record);
            }
        }

        Ok(observations)
    }

    fn build(
        &self,
        site: &Site,
        source: &str,
        observation_time: DateTime<Utc>,
        unit: TemperatureUnit,
        values: RawValues,
        payload: &RawPayload,
    ) -> Observation {
        let mut flags = Vec::new();

        let temp_c = values
            .temperature
            .map(|t| unit.to_celsius(t))
            .and_then(|t| checked("temp_c", t, &TEMPERATURE_RANGE_C, &mut flags))
            .and_then(|t| Decimal::from_f64_retain(t).map(|d| d.round_dp(2)));

        let humidity_pct = values
            .humidity
            .and_then(|h| checked("humidity_pct", h, &HUMIDITY_RANGE, &mut flags))
            .map(|h| h.round() as i16);

        let pressure_hpa = values
            .pressure
            .and_then(|p| checked("pressure_hpa", p, &PRESSURE_RANGE_HPA, &mut flags))
            .map(|p| p.round() as i32);

        Observation {
            site_id: site.site_id.clone(),
            source: source.to_string(),
            observation_time,
            fetch_time: payload.fetched_at,
            temp_c,
            humidity_pct,
            pressure_hpa,
            weather_description: describe(values.weather_code, values.precipitation),
            raw_payload: payload.document.clone(),
            ingestion_run_id: self.run_id,
            flags,
        }
    }
}

/// `Some(value)` when finite and in range; otherwise records why and
/// returns `None`.
fn checked(
    field: &str,
    value: f64,
    range: &RangeInclusive<f64>,
    flags: &mut Vec<String>,
) -> Option<f64> {
    if value.is_finite() && range.contains(&value) {
        Some(value)
    } else {
        flags.push(format!(
            "{}: {} outside {}..={}",
            field,
            value,
            range.start(),
            range.end()
        ));
        None
    }
}

fn describe(weather_code: Option<f64>, precipitation: Option<f64>) -> Option<String> {
    let condition = weather_code
        .filter(|c| c.is_finite() && *c >= 0.0)
        .and_then(|c| describe_weather_code(c as u16));

    match (condition, precipitation) {
        (Some(text), Some(mm)) => Some(format!("{}; precipitation={}mm", text, mm)),
        (Some(text), None) => Some(text.to_string()),
        (None, Some(mm)) => Some(format!("precipitation={}mm", mm)),
        (None, None) => None,
    }
}

/// Parse a source timestamp into UTC, truncated to milliseconds.
///
/// Accepts RFC 3339 strings with an explicit offset, or the API's local
/// wall-clock form (`2025-10-01T14:00`) interpreted at `utc_offset_seconds`.
pub fn parse_instant(raw: &str, utc_offset_seconds: i32) -> Result<DateTime<Utc>, ValidationError> {
    let bad = || ValidationError::BadTimestamp(raw.to_string());
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(bad());
    }

    let instant = if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        dt.with_timezone(&Utc)
    } else {
        let naive = ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
            .ok_or_else(bad)?;
        let offset = FixedOffset::east_opt(utc_offset_seconds).ok_or_else(bad)?;
        offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(bad)?
            .with_timezone(&Utc)
    };

    let millis = instant.nanosecond() / 1_000_000 * 1_000_000;
    instant.with_nanosecond(millis).ok_or_else(bad)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SOURCE_ARCHIVE, SOURCE_FORECAST};
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;

    fn site() -> Site {
        Site {
            site_id: "ush-01".to_string(),
            name: "Ushuaia".to_string(),
            latitude: -54.8,
            longitude: -68.3,
            timezone: Some("America/Argentina/Ushuaia".to_string()),
        }
    }

    fn payload(document: serde_json::Value) -> RawPayload {
        RawPayload {
            document: Arc::new(document),
            fetched_at: Utc.with_ymd_and_hms(2025, 10, 1, 18, 0, 0).unwrap(),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(Uuid::nil())
    }

    #[test]
    fn test_archive_hourly_payload_produces_one_record_per_instant() {
        let doc = json!({
            "utc_offset_seconds": -10800,
            "hourly_units": {"temperature_2m": "°C"},
            "hourly": {
                "time": ["2025-10-01T00:00", "2025-10-01T01:00", "2025-10-01T02:00"],
                "temperature_2m": [4.25, 3.9, null],
                "relative_humidity_2m": [81, 84, 86],
                "precipitation": [0.0, 0.2, 0.0],
                "surface_pressure": [1002.4, 1002.1, 1001.8],
                "weather_code": [3, 51, 3]
            }
        });
        let records = normalizer()
            .normalize(&site(), SOURCE_ARCHIVE, &payload(doc))
            .expect("valid payload");

        assert_eq!(records.len(), 3);
        let first = &records[0];
        assert_eq!(first.source, SOURCE_ARCHIVE);
        assert_eq!(first.site_id, "ush-01");
        // -03:00 local midnight is 03:00 UTC
        assert_eq!(first.observation_time, Utc.with_ymd_and_hms(2025, 10, 1, 3, 0, 0).unwrap());
        assert_eq!(first.temp_c, Some(Decimal::from_str("4.25").unwrap()));
        assert_eq!(first.humidity_pct, Some(81));
        assert_eq!(first.pressure_hpa, Some(1002));
        assert_eq!(first.weather_description.as_deref(), Some("Overcast; precipitation=0mm"));
        assert_eq!(first.fetch_time, Utc.with_ymd_and_hms(2025, 10, 1, 18, 0, 0).unwrap());
        assert_eq!(first.ingestion_run_id, Uuid::nil());
        assert!(first.flags.is_empty());

        assert_eq!(
            records[1].weather_description.as_deref(),
            Some("Light drizzle; precipitation=0.2mm")
        );
        assert_eq!(records[2].temp_c, None, "null source value stays null");
    }

    #[test]
    fn test_forecast_payload_tags_current_and_hourly_separately() {
        let doc = json!({
            "utc_offset_seconds": 0,
            "current": {
                "time": "2025-10-01T14:15",
                "temperature_2m": 21.0,
                "relative_humidity_2m": 40
            },
            "hourly": {
                "time": ["2025-10-01T14:00", "2025-10-01T15:00"],
                "temperature_2m": [20.5, 21.5]
            }
        });
        let records = normalizer()
            .normalize(&site(), SOURCE_FORECAST, &payload(doc))
            .expect("valid payload");

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].source, SOURCE_CURRENT);
        let current_time = Utc.with_ymd_and_hms(2025, 10, 1, 14, 15, 0).unwrap();
        assert_eq!(records[0].observation_time, current_time);
        assert!(records[1..].iter().all(|r| r.source == SOURCE_FORECAST));
    }

    #[test]
    fn test_kelvin_and_fahrenheit_are_converted() {
        let kelvin = json!({
            "hourly_units": {"temperature_2m": "K"},
            "hourly": {"time": ["2025-10-01T00:00"], "temperature_2m": [293.15]}
        });
        let records = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(kelvin)).unwrap();
        assert_eq!(records[0].temp_c, Some(Decimal::from_str("20.00").unwrap()));

        let fahrenheit = json!({
            "hourly_units": {"temperature_2m": "°F"},
            "hourly": {"time": ["2025-10-01T00:00"], "temperature_2m": [68.0]}
        });
        let records = normalizer()
            .normalize(&site(), SOURCE_ARCHIVE, &payload(fahrenheit))
            .unwrap();
        assert_eq!(records[0].temp_c, Some(Decimal::from_str("20.00").unwrap()));
        assert!(records[0].flags.is_empty());
    }

    #[test]
    fn test_converted_temperature_out_of_range_is_nulled_and_flagged() {
        // 212 °F is 100 °C, above the plausible range
        let boiling = json!({
            "hourly_units": {"temperature_2m": "°F"},
            "hourly": {"time": ["2025-10-01T00:00"], "temperature_2m": [212.0]}
        });
        let records = normalizer()
            .normalize(&site(), SOURCE_ARCHIVE, &payload(boiling))
            .unwrap();
        assert_eq!(records[0].temp_c, None);
        assert_eq!(records[0].flags.len(), 1);
        assert!(records[0].flags[0].starts_with("temp_c: 100 outside"), "{:?}", records[0].flags);
    }

    #[test]
    fn test_unknown_temperature_unit_is_rejected() {
        let doc = json!({
            "hourly_units": {"temperature_2m": "°R"},
            "hourly": {"time": ["2025-10-01T00:00"], "temperature_2m": [500.0]}
        });
        let result = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc));
        assert!(matches!(result, Err(ValidationError::UnsupportedUnit { .. })));
    }

    #[test]
    fn test_out_of_range_values_are_nulled_and_flagged() {
        let doc = json!({
            "hourly": {
                "time": ["2025-10-01T00:00"],
                "temperature_2m": [75.0],
                "relative_humidity_2m": [104],
                "surface_pressure": [1013.2]
            }
        });
        let records = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc)).unwrap();
        let record = &records[0];

        assert_eq!(record.humidity_pct, None);
        assert_eq!(record.temp_c, None);
        assert_eq!(record.pressure_hpa, Some(1013), "in-range values are kept");
        assert_eq!(record.flags.len(), 2);
        assert!(record.flags.iter().any(|f| f.starts_with("humidity_pct: 104")));
        assert!(record.flags.iter().any(|f| f.starts_with("temp_c: 75")));
    }

    #[test]
    fn test_negative_humidity_is_flagged() {
        let doc = json!({"hourly": {"time": ["2025-10-01T00:00"], "relative_humidity_2m": [-3]}});
        let records = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc)).unwrap();
        assert_eq!(records[0].humidity_pct, None);
        assert_eq!(records[0].flags.len(), 1);
    }

    #[test]
    fn test_missing_optional_fields_become_null() {
        let doc = json!({"hourly": {"time": ["2025-10-01T00:00"]}});
        let records = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc)).unwrap();
        let record = &records[0];
        assert_eq!(record.temp_c, None);
        assert_eq!(record.humidity_pct, None);
        assert_eq!(record.pressure_hpa, None);
        assert_eq!(record.weather_description, None);
        assert!(record.flags.is_empty());
    }

    #[test]
    fn test_missing_time_is_rejected() {
        let doc = json!({"hourly": {"temperature_2m": [12.0]}});
        let result = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc));
        assert_eq!(result, Err(ValidationError::MissingObservationTime("hourly".to_string())));

        let doc = json!({"current": {"temperature_2m": 12.0}});
        let result = normalizer().normalize(&site(), SOURCE_FORECAST, &payload(doc));
        assert_eq!(result, Err(ValidationError::MissingObservationTime("current".to_string())));
    }

    #[test]
    fn test_unrecognized_shape_is_rejected() {
        let doc = json!({"error": true, "reason": "Latitude must be in range of -90 to 90°."});
        let result = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc));
        assert_eq!(result, Err(ValidationError::UnrecognizedShape));
    }

    #[test]
    fn test_wrongly_typed_block_is_a_schema_error() {
        let doc = json!({"hourly": {"time": ["2025-10-01T00:00"], "temperature_2m": "warm"}});
        let result = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc));
        assert!(matches!(result, Err(ValidationError::Schema(_))));
    }

    #[test]
    fn test_duplicate_instants_are_rejected() {
        let doc = json!({"hourly": {"time": ["2025-10-01T00:00", "2025-10-01T00:00"]}});
        let result = normalizer().normalize(&site(), SOURCE_ARCHIVE, &payload(doc));
        assert!(matches!(result, Err(ValidationError::DuplicateInstant(_))));
    }

    #[test]
    fn test_parse_instant_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_instant("2025-10-01T12:00:00Z", 0), Ok(expected));
        assert_eq!(parse_instant("2025-10-01T09:00:00-03:00", 0), Ok(expected));
        assert_eq!(parse_instant("2025-10-01T09:00", -10800), Ok(expected));
        assert!(parse_instant("", 0).is_err());
        assert!(parse_instant("yesterday", 0).is_err());
    }

    #[test]
    fn test_parse_instant_truncates_to_milliseconds() {
        let parsed = parse_instant("2025-10-01T12:00:00.123456789Z", 0).unwrap();
        assert_eq!(parsed.nanosecond(), 123_000_000);
    }
}
