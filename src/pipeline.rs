/// Run coordination for the ingestion pipeline.
///
/// One cycle fans the site registry out over a bounded pool of worker
/// threads. Each worker claims the next unprocessed site and drives it
/// through fetch, normalize and load in order; its outcome goes onto a
/// channel that is folded into the `RunSummary` once every worker has
/// joined. Sites never share mutable state, so one site's failure is only
/// ever recorded, never propagated.
///
/// Streaming mode repeats whole cycles on an interval until a `CancelToken`
/// fires. Cancellation is only observed between cycles.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::ingest::fetch::{FetchFailure, Fetcher, ReqwestTransport, Transport};
use crate::ingest::normalize::Normalizer;
use crate::ingest::open_meteo::RequestPlan;
use crate::logging::{self, Component, FailureClass};
use crate::model::{FetchError, IngestMode, SetupError, Site, StoreError, ValidationError};
use crate::store::postgres::PgStore;
use crate::store::{BatchWrite, DryRunSink, ObservationSink};

/// Failure reasons listed individually in the run log.
const LOGGED_FAILURES: usize = 5;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_SETUP_FAILURE: u8 = 1;
pub const EXIT_TOTAL_FAILURE: u8 = 3;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    FetchingAndLoading,
    Completed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::NotStarted => write!(f, "NotStarted"),
            RunPhase::FetchingAndLoading => write!(f, "FetchingAndLoading"),
            RunPhase::Completed => write!(f, "Completed"),
        }
    }
}

/// What happened to one site in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteOutcome {
    Loaded { records: usize, flagged: usize },
    FetchFailed(FetchFailure),
    ValidationFailed(ValidationError),
    /// Some or all records could not be written. Records that did land are
    /// still counted toward the run's `records_written`.
    PersistenceFailed {
        written: usize,
        failed: usize,
        flagged: usize,
        reason: StoreError,
    },
}

impl SiteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SiteOutcome::Loaded { .. })
    }

    fn failure_reason(&self) -> Option<String> {
        match self {
            SiteOutcome::Loaded { .. } => None,
            SiteOutcome::FetchFailed(failure) => Some(format!("fetch: {}", failure)),
            SiteOutcome::ValidationFailed(err) => Some(format!("validation: {}", err)),
            SiteOutcome::PersistenceFailed { written, failed, reason, .. } => Some(format!(
                "persistence: {} of {} record(s) failed: {}",
                failed,
                written + failed,
                reason
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SiteReport {
    index: usize,
    site_id: String,
    outcome: SiteOutcome,
}

/// Aggregate result of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: IngestMode,
    pub dry_run: bool,
    pub sites_attempted: usize,
    pub sites_succeeded: usize,
    pub sites_failed: usize,
    pub records_written: usize,
    pub records_flagged: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// `(site_id, reason)` in registry order.
    pub failures: Vec<(String, String)>,
}

impl RunSummary {
    fn new(run_id: Uuid, mode: IngestMode, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        RunSummary {
            run_id,
            mode,
            dry_run,
            sites_attempted: 0,
            sites_succeeded: 0,
            sites_failed: 0,
            records_written: 0,
            records_flagged: 0,
            started_at,
            ended_at: started_at,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, report: SiteReport) {
        self.sites_attempted += 1;

        match &report.outcome {
            SiteOutcome::Loaded { records, flagged } => {
                self.records_written += records;
                self.records_flagged += flagged;
            }
            SiteOutcome::PersistenceFailed { written, flagged, .. } => {
                self.records_written += written;
                self.records_flagged += flagged;
            }
            SiteOutcome::FetchFailed(_) | SiteOutcome::ValidationFailed(_) => {}
        }

        match report.outcome.failure_reason() {
            None => self.sites_succeeded += 1,
            Some(reason) => {
                self.sites_failed += 1;
                self.failures.push((report.site_id, reason));
            }
        }
    }

    /// At least one site was attempted and none succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.sites_attempted > 0 && self.sites_succeeded == 0
    }

    /// Partial failure still exits successfully.
    pub fn exit_code(&self) -> u8 {
        if self.is_total_failure() {
            EXIT_TOTAL_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    /// Emit the summary through the structured logger.
    pub fn log(&self) {
        let label = if self.dry_run { " [DRY-RUN]" } else { "" };
        logging::info(
            Component::Run,
            None,
            &format!(
                "{} run {}{} finished in {:.1}s, {} record(s) flagged",
                self.mode,
                self.run_id,
                label,
                self.elapsed().num_milliseconds() as f64 / 1000.0,
                self.records_flagged
            ),
        );
        logging::log_run_totals(
            &self.run_id.to_string(),
            self.sites_attempted,
            self.sites_succeeded,
            self.sites_failed,
            self.records_written,
        );

        for (site_id, reason) in self.failures.iter().take(LOGGED_FAILURES) {
            logging::warn(Component::Run, Some(site_id), reason);
        }
        if self.failures.len() > LOGGED_FAILURES {
            logging::warn(
                Component::Run,
                None,
                &format!("... and {} more failed site(s)", self.failures.len() - LOGGED_FAILURES),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared stop flag for the streaming loop. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner()) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep up to `timeout`, returning early once cancelled.
    /// Returns whether the token is cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<T: Transport> {
    mode: IngestMode,
    fetcher: Fetcher<T>,
    sink: Arc<dyn ObservationSink>,
    plan: RequestPlan,
    workers: usize,
    batch_size: usize,
    dry_run: bool,
}

impl Pipeline<ReqwestTransport> {
    /// Production wiring: HTTP transport, and the PostgreSQL store unless
    /// this is a dry run. Store connection problems surface here, before
    /// any site is fetched.
    pub fn from_config(config: &Config, mode: IngestMode) -> Result<Self, SetupError> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
        let fetcher = Fetcher::new(transport, config.retry, config.request_timeout);

        let sink: Arc<dyn ObservationSink> = if config.dry_run {
            Arc::new(DryRunSink::new())
        } else {
            let url = config.require_database_url()?;
            Arc::new(PgStore::connect(
                url,
                &config.table,
                &config.actor,
                config.pool_size,
                config.request_timeout,
            )?)
        };

        Ok(Pipeline::new(config, mode, fetcher, sink))
    }
}

impl<T: Transport> Pipeline<T> {
    /// Build a pipeline for `mode`. With `config.dry_run` set, `sink` is
    /// never written to.
    pub fn new(
        config: &Config,
        mode: IngestMode,
        fetcher: Fetcher<T>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        let settings = config.mode(mode);
        let sink: Arc<dyn ObservationSink> = if config.dry_run {
            logging::info(Component::System, None, "[DRY-RUN] store writes disabled");
            Arc::new(DryRunSink::new())
        } else {
            sink
        };

        Pipeline {
            mode,
            fetcher,
            sink,
            plan: RequestPlan::for_mode(config, mode),
            workers: settings.workers,
            batch_size: settings.batch_size,
            dry_run: config.dry_run,
        }
    }

    /// Run one full NotStarted -> Completed cycle over `sites`.
    pub fn run_cycle(&self, sites: &[Site]) -> RunSummary {
        let run_id = Uuid::new_v4();
        let normalizer = Normalizer::new(run_id);
        let mut summary = RunSummary::new(run_id, self.mode, self.dry_run, Utc::now());

        let mut phase = RunPhase::NotStarted;
        self.advance(&mut phase, RunPhase::FetchingAndLoading, run_id);

        let workers = self.workers.min(sites.len()).max(1);
        logging::info(
            Component::Run,
            None,
            &format!("Fanning out {} site(s) over {} worker(s)", sites.len(), workers),
        );

        let cursor = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<SiteReport>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let cursor = &cursor;
                let normalizer = &normalizer;
                scope.spawn(move || {
                    loop {
                        let index = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(site) = sites.get(index) else {
                            break;
                        };
                        let outcome = self.process_site(site, normalizer);
                        let report = SiteReport {
                            index,
                            site_id: site.site_id.clone(),
                            outcome,
                        };
                        if tx.send(report).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut reports: Vec<SiteReport> = rx.into_iter().collect();
        reports.sort_by_key(|r| r.index);
        for report in reports {
            summary.record(report);
        }

        summary.ended_at = Utc::now();
        self.advance(&mut phase, RunPhase::Completed, run_id);
        summary
    }

    /// Repeat `run_cycle` every `interval` until `cancel` fires. Without an
    /// interval exactly one cycle runs. Returns the last completed summary.
    pub fn run_streaming<F>(
        &self,
        sites: &[Site],
        interval: Option<Duration>,
        cancel: &CancelToken,
        mut on_cycle: F,
    ) -> RunSummary
    where
        F: FnMut(&RunSummary),
    {
        let mut cycle = 1u64;
        loop {
            logging::info(Component::Run, None, &format!("Starting {} cycle {}", self.mode, cycle));
            let summary = self.run_cycle(sites);
            on_cycle(&summary);

            let Some(interval) = interval else {
                return summary;
            };
            if cancel.is_cancelled() {
                logging::info(
                    Component::Run,
                    None,
                    "Cancellation received, stopping after completed cycle",
                );
                return summary;
            }

            logging::info(
                Component::Run,
                None,
                &format!("Next cycle in {}s", interval.as_secs()),
            );
            if cancel.wait(interval) {
                logging::info(Component::Run, None, "Cancellation received during wait, stopping");
                return summary;
            }
            cycle += 1;
        }
    }

    fn advance(&self, phase: &mut RunPhase, next: RunPhase, run_id: Uuid) {
        logging::debug(Component::Run, None, &format!("run {}: {} -> {}", run_id, phase, next));
        *phase = next;
    }

    /// Fetch, normalize and load one site. Every failure is classified,
    /// logged and returned; nothing here panics on upstream data.
    fn process_site(&self, site: &Site, normalizer: &Normalizer) -> SiteOutcome {
        let payload = match self.fetcher.fetch(site, &self.plan) {
            Ok(payload) => payload,
            Err(failure) => {
                let class = match failure.error {
                    FetchError::Malformed(_) => FailureClass::Validation,
                    ref err if err.is_transient() => FailureClass::Transient,
                    _ => FailureClass::Client,
                };
                logging::log_site_failure(&site.site_id, "fetch", class, &failure);
                return SiteOutcome::FetchFailed(failure);
            }
        };

        let observations = match normalizer.normalize(site, self.plan.hourly_source(), &payload) {
            Ok(observations) => observations,
            Err(err) => {
                let class = FailureClass::Validation;
                logging::log_site_failure(&site.site_id, "normalize", class, &err);
                return SiteOutcome::ValidationFailed(err);
            }
        };

        let mut flagged = 0;
        for observation in observations.iter().filter(|o| !o.flags.is_empty()) {
            flagged += 1;
            logging::warn(
                Component::Normalize,
                Some(&site.site_id),
                &format!(
                    "{} {} flagged: {}",
                    observation.source,
                    observation.observation_time.to_rfc3339(),
                    observation.flags.join("; ")
                ),
            );
        }

        let mut write = BatchWrite::default();
        for chunk in observations.chunks(self.batch_size.max(1)) {
            write.merge(self.sink.write_batch(chunk));
        }

        match write.failures.first() {
            None => {
                logging::info(
                    Component::Load,
                    Some(&site.site_id),
                    &format!("{} record(s) written", write.written),
                );
                SiteOutcome::Loaded {
                    records: write.written,
                    flagged,
                }
            }
            Some(first) => {
                let reason = first.error.clone();
                let class = FailureClass::Persistence;
                logging::log_site_failure(&site.site_id, "load", class, &reason);
                SiteOutcome::PersistenceFailed {
                    written: write.written,
                    failed: write.failures.len(),
                    flagged,
                    reason,
                }
            }
        }
    }
}
