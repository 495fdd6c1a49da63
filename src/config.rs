//! Runtime configuration.
//!
//! Built exactly once at process start and handed to each component by
//! reference. Values come from named settings (process environment, with a
//! `.env` file loaded first); `Config::from_lookup` takes any lookup function
//! so the parsing rules can be exercised without touching the environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};

use crate::ingest::fetch::RetryPolicy;
use crate::logging::LogLevel;
use crate::model::{IngestMode, SetupError};

pub const DEFAULT_ARCHIVE_API: &str = "https://archive-api.open-meteo.com/v1/archive";
pub const DEFAULT_FORECAST_API: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_TABLE: &str = "weather_observations";
pub const DEFAULT_SITES_FILE: &str = "config/sites.toml";

/// The archive API lags real time by a couple of days.
const ARCHIVE_LAG_DAYS: i64 = 2;

/// Per-mode knobs: where to fetch from, how wide to fan out, how many
/// records go into one write unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeSettings {
    pub api_base: String,
    pub workers: usize,
    pub batch_size: usize,
}

/// Inclusive date range requested from the archive API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// libpq connection string. Optional so dry runs work without a store.
    pub database_url: Option<String>,
    pub table: String,
    pub pool_size: usize,
    pub batch: ModeSettings,
    pub streaming: ModeSettings,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub streaming_interval: Option<Duration>,
    pub dry_run: bool,
    pub sites_file: PathBuf,
    pub archive_window: ArchiveWindow,
    pub forecast_days: u32,
    /// Written to the audit actor columns.
    pub actor: String,
    pub log_level: LogLevel,
    pub log_file: Option<String>,
}

impl Config {
    /// Load `.env` (if present) and read settings from the process environment.
    pub fn from_env() -> Result<Self, SetupError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SetupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_at(lookup, Utc::now().date_naive())
    }

    /// Same as `from_lookup`, with "today" injected for the default
    /// archive window.
    pub fn from_lookup_at<F>(lookup: F, today: NaiveDate) -> Result<Self, SetupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = match get("DATABASE_URL") {
            Some(url) => Some(url),
            None => compose_database_url(&get)?,
        };

        let batch = ModeSettings {
            api_base: get("API_BASE").unwrap_or_else(|| DEFAULT_ARCHIVE_API.to_string()),
            workers: positive(&get, "MAX_WORKERS", 8)?,
            batch_size: positive(&get, "BATCH_SIZE", 200)?,
        };
        let streaming = ModeSettings {
            api_base: get("API_BASE_FORECAST").unwrap_or_else(|| DEFAULT_FORECAST_API.to_string()),
            workers: positive(&get, "STREAMING_MAX_WORKERS", 4)?,
            batch_size: positive(&get, "STREAMING_BATCH_SIZE", 10)?,
        };

        let max_attempts: u32 = positive(&get, "MAX_RETRIES", 3)?;
        let base_delay_ms: u64 = parse_or(&get, "RETRY_BASE_DELAY_MS", 4_000)?;
        let max_delay_ms: u64 = parse_or(&get, "RETRY_MAX_DELAY_MS", 10_000)?;
        if max_delay_ms < base_delay_ms {
            return Err(invalid("RETRY_MAX_DELAY_MS", "must not be below RETRY_BASE_DELAY_MS"));
        }
        let retry = RetryPolicy::new(
            max_attempts,
            Duration::from_millis(base_delay_ms),
            Duration::from_millis(max_delay_ms),
        );

        let request_timeout = Duration::from_secs(positive(&get, "REQUEST_TIMEOUT", 30)?);

        let streaming_interval = match get("STREAMING_INTERVAL") {
            Some(raw) => {
                let secs: u64 = parse_value("STREAMING_INTERVAL", &raw)?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        let dry_run = match get("DRY_RUN") {
            Some(raw) => parse_bool("DRY_RUN", &raw)?,
            None => false,
        };

        let archive_window = archive_window(&get, today)?;

        let log_level = match get("LOG_LEVEL") {
            Some(raw) => raw.parse::<LogLevel>().map_err(|reason| invalid("LOG_LEVEL", reason))?,
            None => LogLevel::Info,
        };

        Ok(Config {
            database_url,
            table: get("DB_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            pool_size: positive(&get, "DB_POOL_SIZE", 8)?,
            batch,
            streaming,
            request_timeout,
            retry,
            streaming_interval,
            dry_run,
            sites_file: PathBuf::from(
                get("SITES_FILE").unwrap_or_else(|| DEFAULT_SITES_FILE.to_string()),
            ),
            archive_window,
            forecast_days: positive(&get, "FORECAST_DAYS", 1)?,
            actor: get("ETL_ACTOR").unwrap_or_else(|| "etl_job".to_string()),
            log_level,
            log_file: get("LOG_FILE"),
        })
    }

    pub fn mode(&self, mode: IngestMode) -> &ModeSettings {
        match mode {
            IngestMode::Batch => &self.batch,
            IngestMode::Streaming => &self.streaming,
        }
    }

    /// The store target, or a setup error naming the missing setting.
    pub fn require_database_url(&self) -> Result<&str, SetupError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| invalid("DATABASE_URL", "not set (nor DB_HOST/DB_NAME)"))
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn invalid(name: &str, reason: impl Display) -> SetupError {
    SetupError::Config {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, SetupError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| invalid(name, format!("'{}': {}", raw, e)))
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, SetupError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn positive<T, G>(get: &G, name: &str, default: T) -> Result<T, SetupError>
where
    T: FromStr + PartialEq + Default,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, name, default)?;
    if value == T::default() {
        return Err(invalid(name, "must be greater than zero"));
    }
    Ok(value)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, SetupError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, format!("'{}' is not a boolean", raw))),
    }
}

fn compose_database_url<G>(get: &G) -> Result<Option<String>, SetupError>
where
    G: Fn(&str) -> Option<String>,
{
    let (Some(host), Some(dbname)) = (get("DB_HOST"), get("DB_NAME")) else {
        return Ok(None);
    };
    let port: u16 = parse_or(get, "DB_PORT", 5432)?;

    let mut url = format!("host={} port={} dbname={}", host, port, dbname);
    if let Some(user) = get("DB_USER") {
        url.push_str(&format!(" user={}", user));
    }
    if let Some(password) = get("DB_PASSWORD") {
        url.push_str(&format!(" password={}", password));
    }
    Ok(Some(url))
}

fn archive_window<G>(get: &G, today: NaiveDate) -> Result<ArchiveWindow, SetupError>
where
    G: Fn(&str) -> Option<String>,
{
    let window_days: i64 = positive(get, "ARCHIVE_WINDOW_DAYS", 7)?;

    let end = match get("ARCHIVE_END_DATE") {
        Some(raw) => parse_date("ARCHIVE_END_DATE", &raw)?,
        None => today - ChronoDuration::days(ARCHIVE_LAG_DAYS),
    };
    let start = match get("ARCHIVE_START_DATE") {
        Some(raw) => parse_date("ARCHIVE_START_DATE", &raw)?,
        None => end - ChronoDuration::days(window_days - 1),
    };

    if start > end {
        return Err(invalid("ARCHIVE_START_DATE", format!("{} is after end date {}", start, end)));
    }
    Ok(ArchiveWindow { start, end })
}

fn parse_date(name: &str, raw: &str) -> Result<NaiveDate, SetupError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| invalid(name, format!("'{}': {}", raw, e)))
}
