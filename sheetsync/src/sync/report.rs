use crate::cache::CacheState;
use crate::index::ReconcileReport;
use crate::transform::TransformWarning;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Fetched, transformed, indexed and published.
    Synced,
    /// The source version matched the published one; only the cache
    /// timestamp was renewed.
    Unchanged,
    /// Joined a sync of the same table already in flight.
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub outcome: SyncOutcome,
    pub source_version: String,
    pub row_count: usize,
    pub warnings: Vec<TransformWarning>,
    pub index: ReconcileReport,
    pub schema_changed: bool,
    /// Source reads made, retries included.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSyncReport {
    pub group: String,
    pub outcome: SyncOutcome,
    pub source_version: String,
    pub members: Vec<String>,
    pub row_count: usize,
    pub index: ReconcileReport,
}

/// Per-item results of a batch run. One failing table or group never
/// prevents the others from running.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub tables: BTreeMap<String, Result<SyncReport, String>>,
    pub groups: BTreeMap<String, Result<GroupSyncReport, String>>,
}

impl BatchReport {
    /// `(name, error)` for every failed table, then every failed group.
    pub fn failures(&self) -> Vec<(&str, &str)> {
        let tables = self
            .tables
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e.as_str())));
        let groups = self
            .groups
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e.as_str())));
        tables.chain(groups).collect()
    }

    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub cache: CacheState,
    pub source_version: Option<String>,
    pub row_count: Option<usize>,
    pub warning_count: Option<usize>,
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub cache: CacheState,
    pub members: Vec<String>,
    pub source_version: Option<String>,
    pub row_count: Option<usize>,
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusReport {
    pub tables: Vec<TableStatus>,
    pub groups: Vec<GroupStatus>,
}
