//! In-process observation store.
//!
//! Mirrors the production table's contract: a surrogate id per row, a unique
//! natural key, atomic insert-or-update under one lock, creation audit
//! fields preserved on conflict, and an update timestamp that strictly
//! increases on every re-load. `insert_unchecked` bypasses the unique key so
//! the auditor can be exercised against a corrupted store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::model::{NaturalKey, Observation, StoreError};
use crate::store::{BatchWrite, DuplicateGroup, DuplicateScan, ObservationSink, RecordFailure};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: u64,
    pub observation: Observation,
    pub audit_created_by: String,
    pub audit_created_dttm: DateTime<Utc>,
    pub audit_updated_by: String,
    pub audit_updated_dttm: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    rows: Vec<StoredRow>,
    by_key: HashMap<NaturalKey, usize>,
    rejected_sites: HashSet<String>,
}

#[derive(Debug)]
pub struct MemoryStore {
    actor: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(actor: &str) -> Self {
        MemoryStore {
            actor: actor.to_string(),
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    /// Make every write for `site_id` fail with a connection error.
    pub fn reject_site(&self, site_id: &str) {
        self.lock().rejected_sites.insert(site_id.to_string());
    }

    /// Snapshot of all rows in insertion order.
    pub fn rows(&self) -> Vec<StoredRow> {
        self.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &NaturalKey) -> Option<StoredRow> {
        let inner = self.lock();
        inner.by_key.get(key).map(|&i| inner.rows[i].clone())
    }

    /// Append a row without consulting the unique key.
    pub fn insert_unchecked(&self, observation: Observation) {
        let now = Utc::now();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.rows.push(StoredRow {
            id,
            observation,
            audit_created_by: self.actor.clone(),
            audit_created_dttm: now,
            audit_updated_by: self.actor.clone(),
            audit_updated_dttm: now,
        });
    }

    /// Atomic insert-or-update on the natural key.
    pub fn upsert(&self, observation: &Observation) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.lock();

        if inner.rejected_sites.contains(&observation.site_id) {
            return Err(StoreError::Connection(format!(
                "writes for site {} are rejected",
                observation.site_id
            )));
        }

        let key = observation.natural_key();
        if let Some(&index) = inner.by_key.get(&key) {
            let row = &mut inner.rows[index];
            let floor = row.audit_updated_dttm + Duration::microseconds(1);
            row.observation = observation.clone();
            row.audit_updated_by = self.actor.clone();
            row.audit_updated_dttm = now.max(floor);
            return Ok(());
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.rows.push(StoredRow {
            id,
            observation: observation.clone(),
            audit_created_by: self.actor.clone(),
            audit_created_dttm: now,
            audit_updated_by: self.actor.clone(),
            audit_updated_dttm: now,
        });
        let index = inner.rows.len() - 1;
        inner.by_key.insert(key, index);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves no partial row behind, so a
        // poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObservationSink for MemoryStore {
    fn write_batch(&self, batch: &[Observation]) -> BatchWrite {
        let mut result = BatchWrite::default();
        for observation in batch {
            match self.upsert(observation) {
                Ok(()) => result.written += 1,
                Err(error) => result.failures.push(RecordFailure {
                    key: observation.natural_key(),
                    error,
                }),
            }
        }
        result
    }
}

impl DuplicateScan for MemoryStore {
    fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError> {
        let inner = self.lock();
        let mut counts: BTreeMap<NaturalKey, i64> = BTreeMap::new();
        for row in &inner.rows {
            *counts.entry(row.observation.natural_key()).or_default() += 1;
        }

        let mut groups: Vec<DuplicateGroup> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(key, count)| DuplicateGroup {
                site_id: key.site_id,
                source: key.source,
                observation_time: key.observation_time,
                count,
            })
            .collect();
        groups.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.site_id.cmp(&b.site_id))
                .then_with(|| a.observation_time.cmp(&b.observation_time))
        });
        Ok(groups)
    }
}
