//! Per-run mutable state: dedup cache, watermark tracker and statistics.
//!
//! A [`BatchContext`] is created at the start of every reconciliation run and dropped at
//! the end, so nothing leaks between runs and concurrent runs never share state.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use grantloader_core::{parse_timestamp, EntityKind, RepoId, TimestampError};
use serde::Serialize;

use crate::SyncMode;

/// Natural key → repository id, for funders and persons resolved during this run.
#[derive(Debug, Default)]
pub struct DedupCache {
    funders: HashMap<String, RepoId>,
    persons: HashMap<String, RepoId>,
    skipped_persons: HashSet<String>,
}

impl DedupCache {
    pub fn funder(&self, key: &str) -> Option<&RepoId> {
        self.funders.get(key)
    }

    pub fn remember_funder(&mut self, key: impl Into<String>, id: RepoId) {
        self.funders.insert(key.into(), id);
    }

    pub fn person(&self, key: &str) -> Option<&RepoId> {
        self.persons.get(key)
    }

    pub fn remember_person(&mut self, key: impl Into<String>, id: RepoId) {
        self.persons.insert(key.into(), id);
    }

    /// Persons not found in an update-only run; they are not looked up again.
    pub fn mark_person_skipped(&mut self, key: impl Into<String>) {
        self.skipped_persons.insert(key.into());
    }

    pub fn is_person_skipped(&self, key: &str) -> bool {
        self.skipped_persons.contains(key)
    }

}

/// Latest last-updated timestamp seen in the batch, ordered by instant.
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    latest: Option<(DateTime<Utc>, String)>,
}

impl Watermark {
    pub fn observe(&mut self, raw: &str) -> Result<(), TimestampError> {
        let instant = parse_timestamp(raw)?;
        match &self.latest {
            Some((current, _)) if *current >= instant => {}
            _ => self.latest = Some((instant, raw.trim().to_string())),
        }
        Ok(())
    }

    /// The original text of the latest timestamp, suitable as the next start bound.
    pub fn value(&self) -> Option<&str> {
        self.latest.as_ref().map(|(_, raw)| raw.as_str())
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.latest.as_ref().map(|(instant, _)| *instant)
    }
}

/// What reconciliation did with one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    /// Stored entity already matched the source; nothing written.
    Unchanged,
    /// No stored match in an update-only run; nothing written.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl EntityCounts {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub records_processed: usize,
    pub grants_processed: usize,
    pub grants: EntityCounts,
    pub persons: EntityCounts,
    pub funders: EntityCounts,
    pub pi_assignments: usize,
    pub co_pi_assignments: usize,
    pub latest_update: Option<String>,
}

impl Statistics {
    pub fn record(&mut self, kind: EntityKind, outcome: Outcome) {
        match kind {
            EntityKind::Grant => self.grants.record(outcome),
            EntityKind::Person => self.persons.record(outcome),
            EntityKind::Funder => self.funders.record(outcome),
        }
    }

    pub fn total_writes(&self) -> usize {
        self.grants.writes() + self.persons.writes() + self.funders.writes()
    }

    /// Fixed-format, human-readable batch report.
    pub fn report(&self, mode: SyncMode) -> String {
        let latest = self.latest_update.as_deref().unwrap_or("(none)");
        let mut out = String::new();
        match mode {
            SyncMode::Grant | SyncMode::ExistingGrant => {
                let _ = writeln!(
                    out,
                    "{} grant records processed; the most recent update in this batch has timestamp {}",
                    self.records_processed, latest
                );
                let _ = writeln!(
                    out,
                    "{} PIs and {} Co-PIs were processed on {} grants",
                    self.pi_assignments, self.co_pi_assignments, self.grants_processed
                );
                let _ = writeln!(
                    out,
                    "{} Grants were created; {} Grants were updated",
                    self.grants.created, self.grants.updated
                );
                let _ = writeln!(
                    out,
                    "{} Persons were created; {} Persons were updated",
                    self.persons.created, self.persons.updated
                );
                let _ = writeln!(
                    out,
                    "{} Funders were created; {} Funders were updated",
                    self.funders.created, self.funders.updated
                );
            }
            SyncMode::User | SyncMode::ExistingUser => {
                let _ = writeln!(
                    out,
                    "{} user records processed; the most recent update in this batch has timestamp {}",
                    self.records_processed, latest
                );
                let _ = writeln!(
                    out,
                    "{} Persons were created; {} Persons were updated",
                    self.persons.created, self.persons.updated
                );
            }
            SyncMode::Funder => {
                let _ = writeln!(out, "{} funder records processed", self.records_processed);
                let _ = writeln!(
                    out,
                    "{} Funders were created; {} Funders were updated",
                    self.funders.created, self.funders.updated
                );
            }
        }
        out
    }
}

/// All mutable state owned by one reconciliation run.
#[derive(Debug, Default)]
pub struct BatchContext {
    pub cache: DedupCache,
    pub watermark: Watermark,
    pub stats: Statistics,
}

impl BatchContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_keeps_latest_instant_regardless_of_order() {
        let stamps = [
            "2018-03-01 12:00:00.0",
            "04/15/2018",
            "2018-04-14 23:59:59.9",
            "01/01/2018",
        ];
        let mut forward = Watermark::default();
        let mut backward = Watermark::default();
        for s in stamps {
            forward.observe(s).unwrap();
        }
        for s in stamps.iter().rev() {
            backward.observe(s).unwrap();
        }
        assert_eq!(forward.value(), Some("04/15/2018"));
        assert_eq!(backward.value(), Some("04/15/2018"));
    }

    #[test]
    fn first_timestamp_always_wins_an_empty_watermark() {
        let mut watermark = Watermark::default();
        assert_eq!(watermark.value(), None);
        watermark.observe(" 1999-12-31 00:00:00.0 ").unwrap();
        assert_eq!(watermark.value(), Some("1999-12-31 00:00:00.0"));
    }

    #[test]
    fn malformed_timestamp_leaves_watermark_untouched() {
        let mut watermark = Watermark::default();
        watermark.observe("01/01/2018").unwrap();
        assert!(watermark.observe("2018/13/45").is_err());
        assert_eq!(watermark.value(), Some("01/01/2018"));
    }

    #[test]
    fn dedup_cache_keeps_funders_and_persons_apart() {
        let mut cache = DedupCache::default();
        cache.remember_funder("300484", RepoId::new("f1"));
        cache.remember_person("jhu.edu:employeeid:1", RepoId::new("p1"));
        cache.mark_person_skipped("jhu.edu:employeeid:2");

        assert_eq!(cache.funder("300484"), Some(&RepoId::new("f1")));
        assert_eq!(cache.person("300484"), None);
        assert_eq!(cache.person("jhu.edu:employeeid:1"), Some(&RepoId::new("p1")));
        assert!(cache.is_person_skipped("jhu.edu:employeeid:2"));
        assert!(!cache.is_person_skipped("jhu.edu:employeeid:1"));
    }

    #[test]
    fn grant_report_has_fixed_layout() {
        let mut stats = Statistics {
            records_processed: 20,
            grants_processed: 10,
            pi_assignments: 5,
            co_pi_assignments: 5,
            latest_update: Some("2018-01-10 00:00:00.0".into()),
            ..Default::default()
        };
        for _ in 0..10 {
            stats.record(EntityKind::Grant, Outcome::Created);
        }
        stats.record(EntityKind::Funder, Outcome::Updated);
        stats.record(EntityKind::Funder, Outcome::Unchanged);

        let report = stats.report(SyncMode::Grant);
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(
            lines,
            vec![
                "20 grant records processed; the most recent update in this batch has timestamp 2018-01-10 00:00:00.0",
                "5 PIs and 5 Co-PIs were processed on 10 grants",
                "10 Grants were created; 0 Grants were updated",
                "0 Persons were created; 0 Persons were updated",
                "0 Funders were created; 1 Funders were updated",
            ]
        );
        assert_eq!(stats.total_writes(), 11);
    }

    #[test]
    fn user_report_without_timestamp_says_none() {
        let stats = Statistics {
            records_processed: 3,
            ..Default::default()
        };
        assert!(stats
            .report(SyncMode::ExistingUser)
            .starts_with("3 user records processed; the most recent update in this batch has timestamp (none)"));
    }
}
