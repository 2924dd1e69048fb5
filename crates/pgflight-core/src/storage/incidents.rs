//! Persisted storms, regressions and anomaly findings.
//!
//! The whole ledger is one JSON document rewritten atomically on every
//! change. Incident volume is small (a handful per day), so there is no
//! point in an append-only layout here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{StorageError, write_atomic};
use crate::model::{Finding, QueryRegression, QueryStorm};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
struct Ledger {
    next_storm_id: u64,
    next_regression_id: u64,
    storms: Vec<QueryStorm>,
    regressions: Vec<QueryRegression>,
    findings: Vec<Finding>,
}

/// Rows removed by one retention pass over the ledger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IncidentPurge {
    pub storms: usize,
    pub regressions: usize,
    pub findings: usize,
}

pub struct IncidentStore {
    path: Option<PathBuf>,
    fsync: bool,
    ledger: Ledger,
}

impl IncidentStore {
    pub fn open(path: &Path, fsync: bool) -> Result<Self, StorageError> {
        let ledger = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ledger::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            fsync,
            ledger,
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            fsync: false,
            ledger: Ledger::default(),
        }
    }

    pub fn set_fsync(&mut self, fsync: bool) {
        self.fsync = fsync;
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.ledger)
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        write_atomic(path, &bytes, self.fsync)
    }

    pub fn storms(&self) -> &[QueryStorm] {
        &self.ledger.storms
    }

    pub fn regressions(&self) -> &[QueryRegression] {
        &self.ledger.regressions
    }

    pub fn findings(&self) -> &[Finding] {
        &self.ledger.findings
    }

    pub fn storms_mut(&mut self) -> &mut Vec<QueryStorm> {
        &mut self.ledger.storms
    }

    pub fn regressions_mut(&mut self) -> &mut Vec<QueryRegression> {
        &mut self.ledger.regressions
    }

    /// Assigns the next storm id and stores the storm.
    pub fn insert_storm(&mut self, mut storm: QueryStorm) -> u64 {
        self.ledger.next_storm_id += 1;
        storm.id = self.ledger.next_storm_id;
        self.ledger.storms.push(storm);
        self.ledger.next_storm_id
    }

    pub fn insert_regression(&mut self, mut regression: QueryRegression) -> u64 {
        self.ledger.next_regression_id += 1;
        regression.id = self.ledger.next_regression_id;
        self.ledger.regressions.push(regression);
        self.ledger.next_regression_id
    }

    pub fn record_findings(&mut self, findings: &[Finding]) {
        self.ledger.findings.extend_from_slice(findings);
    }

    /// Closes an open storm. Returns `false` if the id is unknown or already resolved.
    pub fn resolve_storm(&mut self, id: u64, at: i64, notes: Option<String>) -> bool {
        match self
            .ledger
            .storms
            .iter_mut()
            .find(|s| s.id == id && s.is_open())
        {
            Some(storm) => {
                storm.resolved_at = Some(at);
                storm.resolution_notes = notes;
                true
            }
            None => false,
        }
    }

    pub fn resolve_regression(&mut self, id: u64, at: i64, notes: Option<String>) -> bool {
        match self
            .ledger
            .regressions
            .iter_mut()
            .find(|r| r.id == id && r.is_open())
        {
            Some(regression) => {
                regression.resolved_at = Some(at);
                regression.resolution_notes = notes;
                true
            }
            None => false,
        }
    }

    /// Drops history older than the per-class cutoffs. Open incidents age by
    /// `last_seen_at`, resolved ones by `detected_at`.
    pub fn purge(
        &mut self,
        storm_cutoff: i64,
        regression_cutoff: i64,
        finding_cutoff: i64,
    ) -> IncidentPurge {
        let storms = self.ledger.storms.len();
        self.ledger.storms.retain(|s| {
            let age_ts = if s.is_open() { s.last_seen_at } else { s.detected_at };
            age_ts >= storm_cutoff
        });
        let regressions = self.ledger.regressions.len();
        self.ledger.regressions.retain(|r| {
            let age_ts = if r.is_open() { r.last_seen_at } else { r.detected_at };
            age_ts >= regression_cutoff
        });
        let findings = self.ledger.findings.len();
        self.ledger
            .findings
            .retain(|f| f.detected_at >= finding_cutoff);

        let purged = IncidentPurge {
            storms: storms - self.ledger.storms.len(),
            regressions: regressions - self.ledger.regressions.len(),
            findings: findings - self.ledger.findings.len(),
        };
        if purged != IncidentPurge::default() {
            info!(
                storms = purged.storms,
                regressions = purged.regressions,
                findings = purged.findings,
                "incident history purged"
            );
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CorrelationSnapshot, Severity, StormClass};
    use tempfile::tempdir;

    fn storm(queryid: i64, detected_at: i64) -> QueryStorm {
        QueryStorm {
            id: 0,
            queryid,
            query: "SELECT 1".to_string(),
            recent_count: 600.0,
            baseline_count: 10.0,
            multiplier: 60.0,
            class: StormClass::Spike,
            severity: Severity::Critical,
            correlation: CorrelationSnapshot::default(),
            detected_at,
            last_seen_at: detected_at,
            clean_evaluations: 0,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    #[test]
    fn ids_and_resolution_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("incidents.json");
        {
            let mut store = IncidentStore::open(&path, false).unwrap();
            assert_eq!(store.insert_storm(storm(1, 100)), 1);
            assert_eq!(store.insert_storm(storm(2, 200)), 2);
            assert!(store.resolve_storm(1, 300, Some("deploy rolled back".to_string())));
            assert!(!store.resolve_storm(1, 400, None));
            assert!(!store.resolve_storm(99, 400, None));
            store.save().unwrap();
        }
        let mut store = IncidentStore::open(&path, false).unwrap();
        assert_eq!(store.storms().len(), 2);
        assert_eq!(store.storms()[0].resolved_at, Some(300));
        assert_eq!(store.insert_storm(storm(3, 500)), 3);
    }

    #[test]
    fn purge_keeps_open_incidents_still_being_seen() {
        let mut store = IncidentStore::in_memory();
        store.insert_storm(storm(1, 100));
        let mut seen = storm(2, 100);
        seen.last_seen_at = 5_000;
        store.insert_storm(seen);
        store.insert_storm(storm(3, 100));
        store.resolve_storm(3, 150, None);

        let purged = store.purge(1_000, 1_000, 1_000);
        assert_eq!(purged.storms, 2);
        assert_eq!(store.storms().len(), 1);
        assert_eq!(store.storms()[0].queryid, 2);
    }
}
