//! Per-site HTTP fetch with classified failures and bounded retry.
//!
//! The retry loop is an explicit state machine driven by `RetryPolicy`:
//!
//! ```text
//! Attempting(n) ──ok──────────────────────────────> payload returned
//!      │
//!      └─err─> transient && n < max ──> Backoff { next: n+1, delay } ──> Attempting(n+1)
//!          └─> otherwise ─────────────> GaveUp(n)
//! ```
//!
//! The HTTP call itself sits behind the `Transport` trait so the policy can
//! be exercised against scripted responses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::ingest::open_meteo::RequestPlan;
use crate::logging;
use crate::model::{FetchError, RawPayload, SetupError, Site};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Status and body of one completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP GET. Errors are limited to the network classes
/// (`Timeout`, `Connection`); status handling is the fetcher's job.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError>;
}

/// Production transport on the blocking reqwest client.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, SetupError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("weather_etl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SetupError::HttpClient(e.to_string()))?;
        Ok(ReqwestTransport { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .header("Accept", "application/json")
            .send()
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().map_err(classify_reqwest_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_decode() {
        FetchError::Malformed(err.to_string())
    } else {
        FetchError::Connection(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Retry state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting(u32),
    Backoff { next: u32, delay: Duration },
    GaveUp(u32),
}

/// Maximum attempts plus a capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at the policy maximum.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Next state after attempt `attempt` failed with `err`.
    pub fn on_failure(&self, attempt: u32, err: &FetchError) -> AttemptState {
        if err.is_transient() && attempt < self.max_attempts {
            AttemptState::Backoff {
                next: attempt + 1,
                delay: self.delay_after(attempt),
            }
        } else {
            AttemptState::GaveUp(attempt)
        }
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Terminal fetch failure for one site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct FetchFailure {
    pub attempts: u32,
    pub error: FetchError,
}

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

pub struct Fetcher<T: Transport> {
    transport: Arc<T>,
    policy: RetryPolicy,
    timeout: Duration,
    sleeper: Sleeper,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy, timeout: Duration) -> Self {
        Fetcher {
            transport,
            policy,
            timeout,
            sleeper: Box::new(std::thread::sleep),
        }
    }

    /// Replace the backoff sleep, e.g. to record delays instead of waiting.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Fetch one site's payload, retrying transient failures. Never panics
    /// on upstream errors; every failure comes back classified.
    pub fn fetch(&self, site: &Site, plan: &RequestPlan) -> Result<RawPayload, FetchFailure> {
        let query = plan.query_for(site);
        let mut state = AttemptState::Attempting(1);
        let mut last_error = None;

        loop {
            match state {
                AttemptState::Attempting(n) => match self.attempt(&plan.api_base, &query) {
                    Ok(payload) => {
                        if n > 1 {
                            logging::info(
                                logging::Component::Fetch,
                                Some(&site.site_id),
                                &format!("succeeded on attempt {}", n),
                            );
                        }
                        return Ok(payload);
                    }
                    Err(err) => {
                        state = self.policy.on_failure(n, &err);
                        last_error = Some(err);
                    }
                },
                AttemptState::Backoff { next, delay } => {
                    if let Some(err) = &last_error {
                        logging::log_retry(
                            &site.site_id,
                            next - 1,
                            self.policy.max_attempts,
                            err,
                            delay.as_millis(),
                        );
                    }
                    (self.sleeper)(delay);
                    state = AttemptState::Attempting(next);
                }
                AttemptState::GaveUp(attempts) => {
                    let error = last_error
                        .unwrap_or(FetchError::Connection("no attempt made".to_string()));
                    return Err(FetchFailure { attempts, error });
                }
            }
        }
    }

    fn attempt(&self, url: &str, query: &[(String, String)]) -> Result<RawPayload, FetchError> {
        let response = self.transport.get(url, query, self.timeout)?;

        if !(200..300).contains(&response.status) {
            return Err(FetchError::Status(response.status));
        }

        let document: serde_json::Value =
            serde_json::from_str(&response.body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        if !document.is_object() {
            return Err(FetchError::Malformed("top-level JSON value is not an object".to_string()));
        }

        Ok(RawPayload {
            document: Arc::new(document),
            fetched_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
