/// Structured logging for the ingestion pipeline
///
/// Provides context-rich logging with component tags, site identifiers,
/// timestamps, and severity levels. Supports both console output and
/// file-based logging for long-running streaming jobs.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => f.pad("DEBUG"),
            LogLevel::Info => f.pad("INFO"),
            LogLevel::Warning => f.pad("WARN"),
            LogLevel::Error => f.pad("ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Fetch,
    Normalize,
    Load,
    Run,
    Audit,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Fetch => write!(f, "FETCH"),
            Component::Normalize => write!(f, "NORM"),
            Component::Load => write!(f, "LOAD"),
            Component::Run => write!(f, "RUN"),
            Component::Audit => write!(f, "AUDIT"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, connection reset, 5xx. Retried by the fetcher.
    Transient,
    /// 4xx response. Retrying cannot change the outcome.
    Client,
    /// Malformed or incomplete payload.
    Validation,
    /// Store unreachable or write rejected.
    Persistence,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "TRANSIENT"),
            FailureClass::Client => write!(f, "CLIENT"),
            FailureClass::Validation => write!(f, "VALIDATION"),
            FailureClass::Persistence => write!(f, "PERSISTENCE"),
        }
    }
}

impl FailureClass {
    fn component(self) -> Component {
        match self {
            FailureClass::Transient | FailureClass::Client => Component::Fetch,
            FailureClass::Validation => Component::Normalize,
            FailureClass::Persistence => Component::Load,
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>) {
        let logger = Logger { min_level, log_file };
        if let Ok(mut slot) = LOGGER.lock() {
            *slot = Some(logger);
        }
    }

    fn format_entry(
        level: LogLevel,
        component: Component,
        site_id: Option<&str>,
        message: &str,
    ) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC");
        let site_part = site_id.map(|s| format!(" [{}]", s)).unwrap_or_default();
        format!("{} {:<5} {}{}: {}", timestamp, level, component, site_part, message)
    }

    fn log(&self, level: LogLevel, component: Component, site_id: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let entry = Self::format_entry(level, component, site_id, message);

        match level {
            LogLevel::Error | LogLevel::Warning => eprintln!("{}", entry),
            LogLevel::Info | LogLevel::Debug => println!("{}", entry),
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>) {
    Logger::init(min_level, log_file.map(String::from));
}

fn emit(level: LogLevel, component: Component, site_id: Option<&str>, message: &str) {
    if let Ok(guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.log(level, component, site_id, message);
        }
    }
}

/// Log a general informational message
pub fn info(component: Component, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Info, component, site_id, message);
}

/// Log a warning message
pub fn warn(component: Component, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Warning, component, site_id, message);
}

/// Log an error message
pub fn error(component: Component, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Error, component, site_id, message);
}

/// Log a debug message
pub fn debug(component: Component, site_id: Option<&str>, message: &str) {
    emit(LogLevel::Debug, component, site_id, message);
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Severity a terminal site failure is logged at.
///
/// Client and persistence failures point at configuration or store problems
/// an operator must fix; transient and validation failures are usually
/// upstream noise.
pub fn severity_for(class: FailureClass) -> LogLevel {
    match class {
        FailureClass::Client | FailureClass::Persistence => LogLevel::Error,
        FailureClass::Transient | FailureClass::Validation => LogLevel::Warning,
    }
}

/// Log a terminal per-site failure with its classification.
pub fn log_site_failure(
    site_id: &str,
    operation: &str,
    class: FailureClass,
    err: &dyn std::error::Error,
) {
    let message = format!("{} failed [{}]: {}", operation, class, err);
    emit(severity_for(class), class.component(), Some(site_id), &message);
}

/// Log one retry decision made by the fetcher.
pub fn log_retry(
    site_id: &str,
    attempt: u32,
    max_attempts: u32,
    cause: &dyn std::error::Error,
    delay_ms: u128,
) {
    let message = format!(
        "attempt {}/{} failed [{}]: {}; retrying in {} ms",
        attempt,
        max_attempts,
        FailureClass::Transient,
        cause,
        delay_ms
    );
    warn(Component::Fetch, Some(site_id), &message);
}

// ---------------------------------------------------------------------------
// Run Summary Logging
// ---------------------------------------------------------------------------

/// Log the headline of a completed run at a severity matching its outcome.
pub fn log_run_totals(
    run_id: &str,
    attempted: usize,
    succeeded: usize,
    failed: usize,
    records: usize,
) {
    let message = format!(
        "run {} complete: {}/{} sites successful, {} failed, {} records written",
        run_id, succeeded, attempted, failed, records
    );

    if failed == 0 {
        info(Component::Run, None, &message);
    } else if succeeded == 0 {
        error(Component::Run, None, &message);
    } else {
        warn(Component::Run, None, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!(" error ".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_failure_severity() {
        assert_eq!(severity_for(FailureClass::Client), LogLevel::Error);
        assert_eq!(severity_for(FailureClass::Persistence), LogLevel::Error);
        assert_eq!(severity_for(FailureClass::Transient), LogLevel::Warning);
        assert_eq!(severity_for(FailureClass::Validation), LogLevel::Warning);
    }

    #[test]
    fn test_entry_carries_component_and_site() {
        let entry = Logger::format_entry(
            LogLevel::Warning,
            Component::Fetch,
            Some("ba-01"),
            "HTTP error: 503",
        );
        assert!(entry.contains("WARN"));
        assert!(entry.contains("FETCH [ba-01]: HTTP error: 503"));
    }

    #[test]
    fn test_file_logging_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("etl.log");
        let path_str = path.to_str().expect("utf-8 path");

        Logger::append_to_file(path_str, "first").expect("append");
        Logger::append_to_file(path_str, "second").expect("append");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "first\nsecond\n");
    }
}
