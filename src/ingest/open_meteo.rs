/// Open-Meteo API request plans and response structures
///
/// Two endpoints feed the pipeline: the historical archive API (batch mode)
/// and the forecast API (streaming mode). Both return hourly data as parallel
/// arrays keyed by a `time` array; the forecast API additionally returns a
/// `current` block describing conditions at request time.
///
/// API Documentation: https://open-meteo.com/en/docs
/// Archive: https://open-meteo.com/en/docs/historical-weather-api

use std::collections::HashMap;

use serde::Deserialize;

use crate::config::{ArchiveWindow, Config};
use crate::model::{IngestMode, SOURCE_ARCHIVE, SOURCE_FORECAST, Site};

/// Variables requested for both `hourly` and `current`.
pub const VARIABLES: &str =
    "temperature_2m,relative_humidity_2m,precipitation,surface_pressure,weather_code";

/// Timezone requested when a site does not name one.
pub const DEFAULT_TIMEZONE: &str = "GMT";

// ============================================================================
// Request plans
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Fixed historical date range.
    Archive(ArchiveWindow),
    /// Short horizon starting now.
    Forecast { days: u32 },
}

/// Everything needed to build one request per site for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPlan {
    pub api_base: String,
    pub window: Window,
}

impl RequestPlan {
    pub fn for_mode(config: &Config, mode: IngestMode) -> Self {
        let window = match mode {
            IngestMode::Batch => Window::Archive(config.archive_window),
            IngestMode::Streaming => Window::Forecast {
                days: config.forecast_days,
            },
        };
        RequestPlan {
            api_base: config.mode(mode).api_base.clone(),
            window,
        }
    }

    /// Source tag stamped on observations decoded from the `hourly` block.
    pub fn hourly_source(&self) -> &'static str {
        match self.window {
            Window::Archive(_) => SOURCE_ARCHIVE,
            Window::Forecast { .. } => SOURCE_FORECAST,
        }
    }

    /// Query parameters for one site.
    pub fn query_for(&self, site: &Site) -> Vec<(String, String)> {
        let timezone = site.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE);
        let mut query = vec![
            ("latitude".to_string(), format!("{:.4}", site.latitude)),
            ("longitude".to_string(), format!("{:.4}", site.longitude)),
            ("timezone".to_string(), timezone.to_string()),
            ("hourly".to_string(), VARIABLES.to_string()),
        ];

        match self.window {
            Window::Archive(window) => {
                query.push(("start_date".to_string(), window.start.format("%Y-%m-%d").to_string()));
                query.push(("end_date".to_string(), window.end.format("%Y-%m-%d").to_string()));
            }
            Window::Forecast { days } => {
                query.push(("current".to_string(), VARIABLES.to_string()));
                query.push(("forecast_days".to_string(), days.to_string()));
            }
        }

        query
    }
}

// ============================================================================
// Open-Meteo API Response Structures
// ============================================================================

/// Top-level response. Either block may be absent depending on the endpoint.
#[derive(Debug, Deserialize)]
pub struct OpenMeteoResponse {
    /// Offset of the requested timezone; `time` strings are local to it.
    #[serde(default)]
    pub utc_offset_seconds: i32,
    pub hourly: Option<HourlyBlock>,
    #[serde(default)]
    pub hourly_units: HashMap<String, String>,
    pub current: Option<CurrentBlock>,
    #[serde(default)]
    pub current_units: HashMap<String, String>,
}

/// Parallel arrays; index `i` of every array belongs to `time[i]`.
#[derive(Debug, Deserialize)]
pub struct HourlyBlock {
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub relative_humidity_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub precipitation: Vec<Option<f64>>,
    #[serde(default)]
    pub surface_pressure: Vec<Option<f64>>,
    #[serde(default)]
    pub weather_code: Vec<Option<f64>>,
}

impl HourlyBlock {
    /// Null-safe column access: short arrays yield `None`.
    pub fn value(column: &[Option<f64>], i: usize) -> Option<f64> {
        column.get(i).copied().flatten()
    }
}

/// Conditions at request time (forecast API only).
#[derive(Debug, Deserialize)]
pub struct CurrentBlock {
    pub time: Option<String>,
    pub temperature_2m: Option<f64>,
    pub relative_humidity_2m: Option<f64>,
    pub precipitation: Option<f64>,
    pub surface_pressure: Option<f64>,
    pub weather_code: Option<f64>,
}

// ============================================================================
// WMO weather interpretation codes
// ============================================================================

/// Text for a WMO 4677 weather code as used by Open-Meteo.
pub fn describe_weather_code(code: u16) -> Option<&'static str> {
    let text = match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        56 => "Light freezing drizzle",
        57 => "Dense freezing drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        66 => "Light freezing rain",
        67 => "Heavy freezing rain",
        71 => "Slight snow fall",
        73 => "Moderate snow fall",
        75 => "Heavy snow fall",
        77 => "Snow grains",
        80 => "Slight rain showers",
        81 => "Moderate rain showers",
        82 => "Violent rain showers",
        85 => "Slight snow showers",
        86 => "Heavy snow showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => return None,
    };
    Some(text)
}

// ============================================================================
// Tests
// ============================================================================
