/// Core data types for the weather ingestion pipeline.
///
/// This module defines the shared domain model imported by all other modules:
/// sites, canonical observations, the natural key, and the error taxonomy
/// each pipeline stage reports. It contains no I/O.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Source tags
// ---------------------------------------------------------------------------

/// Hourly reanalysis values from the Open-Meteo archive API (batch mode).
pub const SOURCE_ARCHIVE: &str = "open-meteo-archive";

/// Hourly forecast values from the Open-Meteo forecast API (streaming mode).
pub const SOURCE_FORECAST: &str = "open-meteo-forecast";

/// The `current` block of a forecast response: conditions at fetch time.
pub const SOURCE_CURRENT: &str = "open-meteo-current";

// ---------------------------------------------------------------------------
// Run mode
// ---------------------------------------------------------------------------

/// Which dataset a run ingests. Drives endpoint choice, request window,
/// pool width and write batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestMode {
    /// Historical archive window, one pass.
    Batch,
    /// Short-horizon forecast, repeated on an interval.
    Streaming,
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestMode::Batch => write!(f, "batch"),
            IngestMode::Streaming => write!(f, "streaming"),
        }
    }
}

// ---------------------------------------------------------------------------
// Site
// ---------------------------------------------------------------------------

/// A monitoring site from the registry document. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Stable identifier, unique within the registry.
    pub site_id: String,
    /// Human-readable name, used only for logs.
    #[serde(alias = "display_name")]
    pub name: String,
    /// WGS84 latitude.
    pub latitude: f64,
    /// WGS84 longitude.
    pub longitude: f64,
    /// IANA timezone passed to the API. `None` requests GMT.
    #[serde(default)]
    pub timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// Payloads and observations
// ---------------------------------------------------------------------------

/// One decoded API response for one site, stamped with the time it was
/// retrieved. The document is shared by every observation derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub document: Arc<serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

/// Identity of a logical observation. At most one stored row per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub site_id: String,
    pub source: String,
    pub observation_time: DateTime<Utc>,
}

/// Canonical, persisted observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub site_id: String,
    pub source: String,
    /// Source-reported instant, UTC, millisecond precision.
    pub observation_time: DateTime<Utc>,
    /// Pipeline-assigned retrieval time.
    pub fetch_time: DateTime<Utc>,
    pub temp_c: Option<Decimal>,
    pub humidity_pct: Option<i16>,
    pub pressure_hpa: Option<i32>,
    pub weather_description: Option<String>,
    pub raw_payload: Arc<serde_json::Value>,
    pub ingestion_run_id: Uuid,
    /// Range-check findings (`field: reason`). Logged, not persisted.
    pub flags: Vec<String>,
}

impl Observation {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            site_id: self.site_id.clone(),
            source: self.source.clone(),
            observation_time: self.observation_time,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Classified failure of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    /// Non-2xx HTTP response.
    #[error("HTTP error: {0}")]
    Status(u16),
    /// 2xx response whose body is not a JSON object.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Timeouts, connection failures and 5xx responses may succeed on a
    /// later attempt. 4xx and malformed bodies never will.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connection(_) => true,
            FetchError::Status(code) => (500..600).contains(code),
            FetchError::Malformed(_) => false,
        }
    }
}

/// Why a payload could not be turned into observations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unrecognized payload shape: no 'hourly' or 'current' block")]
    UnrecognizedShape,
    /// A block is present but its fields have the wrong types.
    #[error("payload does not match expected schema: {0}")]
    Schema(String),
    #[error("missing observation time in '{0}' block")]
    MissingObservationTime(String),
    #[error("unparseable observation time '{0}'")]
    BadTimestamp(String),
    #[error("duplicate observation instant {0} in payload")]
    DuplicateInstant(String),
    #[error("unsupported unit '{unit}' for {field}")]
    UnsupportedUnit { field: String, unit: String },
}

/// Per-write persistence failure. Never aborts sibling writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("query error: {0}")]
    Query(String),
}

/// Failure before fan-out begins. Terminates the process.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration value {name}: {reason}")]
    Config { name: String, reason: String },
    #[error("site registry {path}: {reason}")]
    Registry { path: String, reason: String },
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("HTTP client could not be built: {0}")]
    HttpClient(String),
    #[error("signal handler could not be installed: {0}")]
    Signal(String),
}
