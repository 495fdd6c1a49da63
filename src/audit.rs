//! Duplicate auditor.
//!
//! Read-only check that the natural-key invariant holds in the store: no
//! `(site_id, source, observation_time)` may appear on more than one row.
//! Runs out-of-band from ingestion and reports through a process exit code
//! so external automation can gate on it.

use std::fmt::Write;

use crate::logging::{self, Component};
use crate::model::StoreError;
use crate::store::{DuplicateGroup, DuplicateScan};

/// Groups printed in the report; the rest are only counted.
pub const REPORT_LIMIT: usize = 10;

pub const EXIT_CLEAN: u8 = 0;
pub const EXIT_SETUP_FAILURE: u8 = 1;
pub const EXIT_DUPLICATES: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditVerdict {
    Pass,
    Fail(Vec<DuplicateGroup>),
}

impl AuditVerdict {
    pub fn exit_code(&self) -> u8 {
        match self {
            AuditVerdict::Pass => EXIT_CLEAN,
            AuditVerdict::Fail(_) => EXIT_DUPLICATES,
        }
    }

    /// Rows beyond the first in every offending group.
    pub fn surplus_rows(&self) -> i64 {
        match self {
            AuditVerdict::Pass => 0,
            AuditVerdict::Fail(groups) => groups.iter().map(|g| g.count - 1).sum(),
        }
    }
}

/// Scan the store and decide. A scan error is a setup failure for the
/// caller, never a pass.
pub fn audit(store: &impl DuplicateScan) -> Result<AuditVerdict, StoreError> {
    let groups = store.duplicate_groups()?;

    if groups.is_empty() {
        logging::info(Component::Audit, None, "No duplicate natural keys found");
        Ok(AuditVerdict::Pass)
    } else {
        logging::error(
            Component::Audit,
            None,
            &format!("{} natural key(s) held by more than one row", groups.len()),
        );
        Ok(AuditVerdict::Fail(groups))
    }
}

/// Human-readable report for the terminal.
pub fn render_report(table: &str, verdict: &AuditVerdict) -> String {
    let rule = "=".repeat(78);
    let mut out = String::new();

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "DUPLICATE AUDIT: {}", table);
    let _ = writeln!(out, "{}", rule);

    match verdict {
        AuditVerdict::Pass => {
            let _ = writeln!(out, "PASS: every (site_id, source, observation_time) is unique");
        }
        AuditVerdict::Fail(groups) => {
            let _ = writeln!(
                out,
                "{:<16} {:<22} {:<26} {:>6}",
                "site_id", "source", "observation_time", "rows"
            );
            let _ = writeln!(out, "{}", "-".repeat(78));
            for group in groups.iter().take(REPORT_LIMIT) {
                let _ = writeln!(
                    out,
                    "{:<16} {:<22} {:<26} {:>6}",
                    group.site_id,
                    group.source,
                    group.observation_time.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    group.count
                );
            }
            if groups.len() > REPORT_LIMIT {
                let hidden = groups.len() - REPORT_LIMIT;
                let _ = writeln!(out, "... {} more group(s) not shown", hidden);
            }
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "FAIL: {} duplicate group(s), {} surplus row(s)",
                groups.len(),
                verdict.surplus_rows()
            );
        }
    }

    let _ = writeln!(out, "{}", rule);
    out
}
