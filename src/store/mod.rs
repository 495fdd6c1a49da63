/// Persistence seams for the pipeline.
///
/// `ObservationSink` is the Upsert Loader contract the Run Coordinator
/// writes through; `DuplicateScan` is the read-only query the Duplicate
/// Auditor runs. Implementations:
/// - `postgres::PgStore`: the production store.
/// - `memory::MemoryStore`: in-process store with the same natural-key
///   semantics, used in tests.
/// - `DryRunSink`: accepts everything and persists nothing.

pub mod memory;
pub mod postgres;

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use crate::logging;
use crate::model::{NaturalKey, Observation, StoreError};

/// A write that failed for one record. Siblings are unaffected.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub key: NaturalKey,
    pub error: StoreError,
}

/// Outcome of writing one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWrite {
    pub written: usize,
    pub failures: Vec<RecordFailure>,
}

impl BatchWrite {
    /// Every record in `batch` failed for the same reason.
    pub fn all_failed(batch: &[Observation], error: StoreError) -> Self {
        BatchWrite {
            written: 0,
            failures: batch
                .iter()
                .map(|obs| RecordFailure {
                    key: obs.natural_key(),
                    error: error.clone(),
                })
                .collect(),
        }
    }

    pub fn merge(&mut self, other: BatchWrite) {
        self.written += other.written;
        self.failures.extend(other.failures);
    }
}

/// Conflict-aware, repeat-safe persistence of observations.
///
/// Re-submitting a record with an existing natural key must update that row
/// in place, atomically. Failures are reported per record and never raised.
pub trait ObservationSink: Send + Sync {
    fn write_batch(&self, batch: &[Observation]) -> BatchWrite;
}

/// One natural key held by more than one stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub site_id: String,
    pub source: String,
    pub observation_time: DateTime<Utc>,
    pub count: i64,
}

/// Read-only scan for natural-key collisions, ordered by count descending,
/// then site and time.
pub trait DuplicateScan {
    fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError>;
}

/// Stand-in loader for dry runs: counts what would have been written.
#[derive(Debug, Default)]
pub struct DryRunSink {
    accepted: AtomicUsize,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl ObservationSink for DryRunSink {
    fn write_batch(&self, batch: &[Observation]) -> BatchWrite {
        self.accepted.fetch_add(batch.len(), Ordering::Relaxed);
        if let Some(first) = batch.first() {
            logging::debug(
                logging::Component::Load,
                Some(&first.site_id),
                &format!("[DRY-RUN] would write {} record(s)", batch.len()),
            );
        }
        BatchWrite {
            written: batch.len(),
            failures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_write_merge() {
        let key = NaturalKey {
            site_id: "a".to_string(),
            source: "x".to_string(),
            observation_time: Utc::now(),
        };
        let mut total = BatchWrite {
            written: 3,
            failures: Vec::new(),
        };
        total.merge(BatchWrite {
            written: 2,
            failures: vec![RecordFailure {
                key,
                error: StoreError::Connection("gone".to_string()),
            }],
        });
        assert_eq!(total.written, 5);
        assert_eq!(total.failures.len(), 1);
    }

    #[test]
    fn test_dry_run_sink_counts_without_storing() {
        let sink = DryRunSink::new();
        let write = sink.write_batch(&[]);
        assert_eq!(write.written, 0);
        assert_eq!(sink.accepted(), 0);
    }
}
