//! Primary and grouped indexes in the key-value store.
//!
//! Each sync reconciles the stored index of one table against the freshly
//! transformed records. The stored state is read back once and verified.
//! Keys are then visited in order: each one is planned against that state
//! and its ops are applied as one atomic batch before the next key is
//! planned. An interrupted run leaves every key either fully old or fully
//! new, and a retry converges because set operations only move counters
//! when membership changes.

mod state;

pub use state::{grouping_value, IndexState};

use crate::error::Result;
use crate::keys::KeySpace;
use crate::kv::{CounterRef, KvOp, KvStore};
use crate::transform::{Record, RecordSet};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub moved: usize,
    /// Keys whose row payload changed but whose buckets did not.
    pub updated: usize,
    pub unchanged: usize,
    /// Keys left out of at least one bucket because the grouping value was
    /// null, blank or not a scalar.
    pub ungrouped: Vec<String>,
    /// The stored index was inconsistent and was rebuilt from scratch.
    pub healed: bool,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.added + self.removed + self.moved + self.updated > 0 || self.healed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Removed,
    Moved,
    Updated,
}

struct KeyDelta {
    change: Change,
    ops: Vec<KvOp>,
}

#[derive(Clone)]
pub struct IndexBuilder {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
}

impl IndexBuilder {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        IndexBuilder { store, keys }
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Bring the stored index of `table` in line with `records`.
    ///
    /// Callers serialize reconciliations per table. The diff is always
    /// computed against what the store holds right now, never against a
    /// remembered previous run.
    pub fn reconcile(
        &self,
        table: &str,
        records: &RecordSet,
        grouping_fields: &[String],
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut current = self.load_state(table, grouping_fields)?;
        let problems = current.violations();
        if !problems.is_empty() {
            log::warn!(
                "index for '{}' is inconsistent ({} problems, first: {}); rebuilding",
                table,
                problems.len(),
                problems[0]
            );
            self.drop_table(table)?;
            current = IndexState::default();
            report.healed = true;
        }

        let all_keys: BTreeSet<&String> = current.ids.iter().chain(records.keys()).collect();
        for key in all_keys {
            let desired = records.get(key.as_str());
            let delta = self.plan_key(table, key, desired, &current, grouping_fields, &mut report)?;
            match delta {
                Some(delta) => {
                    self.store.apply(&delta.ops)?;
                    match delta.change {
                        Change::Added => report.added += 1,
                        Change::Removed => report.removed += 1,
                        Change::Moved => report.moved += 1,
                        Change::Updated => report.updated += 1,
                    }
                }
                None => report.unchanged += 1,
            }
        }

        if !report.ungrouped.is_empty() {
            log::info!(
                "{}: {} keys without a grouping value: {}",
                table,
                report.ungrouped.len(),
                report.ungrouped.join(", ")
            );
        }
        log::debug!(
            "reconciled '{}': +{} -{} ~{} moved {} unchanged {}",
            table,
            report.added,
            report.removed,
            report.updated,
            report.moved,
            report.unchanged
        );
        Ok(report)
    }

    fn plan_key(
        &self,
        table: &str,
        key: &str,
        desired: Option<&Record>,
        current: &IndexState,
        grouping_fields: &[String],
        report: &mut ReconcileReport,
    ) -> Result<Option<KeyDelta>> {
        let ids_key = self.keys.ids(table);
        let state_key = self.keys.row_state(table, key);
        let row_key = self.keys.row(table, key);
        let stored_state = current.row_group_state.get(key).cloned().unwrap_or_default();
        let mut ops = Vec::new();

        let Some(record) = desired else {
            ops.push(KvOp::SetRemove {
                key: ids_key,
                member: key.to_string(),
                counter: None,
            });
            for (field, value) in &stored_state {
                ops.push(self.leave_bucket(table, field, value, key));
            }
            ops.push(KvOp::Delete { key: state_key });
            ops.push(KvOp::Delete { key: row_key });
            return Ok(Some(KeyDelta {
                change: Change::Removed,
                ops,
            }));
        };

        let is_new = !current.ids.contains(key);
        if is_new {
            ops.push(KvOp::SetAdd {
                key: ids_key,
                member: key.to_string(),
                counter: None,
            });
        }

        let mut desired_state: BTreeMap<String, String> = BTreeMap::new();
        for field in grouping_fields {
            match grouping_value(record.get(field)) {
                Some(value) => {
                    desired_state.insert(field.clone(), value);
                }
                None => {
                    if report.ungrouped.last().map(String::as_str) != Some(key) {
                        report.ungrouped.push(key.to_string());
                    }
                }
            }
        }

        // Fields dropped from the grouping configuration are retracted too.
        let fields: BTreeSet<&String> = stored_state.keys().chain(desired_state.keys()).collect();
        let mut moved = false;
        for field in fields {
            let old = stored_state.get(field);
            let new = desired_state.get(field);
            if old == new {
                continue;
            }
            moved = true;
            if let Some(old) = old {
                ops.push(self.leave_bucket(table, field, old, key));
            }
            match new {
                Some(new) => {
                    ops.push(self.join_bucket(table, field, new, key));
                    ops.push(KvOp::HashSet {
                        key: state_key.clone(),
                        field: field.clone(),
                        value: new.clone(),
                    });
                }
                None => ops.push(KvOp::HashDel {
                    key: state_key.clone(),
                    field: field.clone(),
                }),
            }
        }

        let payload = row_payload(table, record)?;
        let payload_changed = self.store.get(&row_key)?.as_deref() != Some(payload.as_str());
        if payload_changed {
            ops.push(KvOp::Put {
                key: row_key,
                value: payload,
                ttl: None,
            });
        }

        if ops.is_empty() {
            return Ok(None);
        }
        let change = if is_new {
            Change::Added
        } else if moved {
            Change::Moved
        } else {
            Change::Updated
        };
        Ok(Some(KeyDelta { change, ops }))
    }

    fn join_bucket(&self, table: &str, field: &str, value: &str, key: &str) -> KvOp {
        KvOp::SetAdd {
            key: self.keys.group_ids(table, field, value),
            member: key.to_string(),
            counter: Some(CounterRef::new(self.keys.group_count(table, field), value)),
        }
    }

    fn leave_bucket(&self, table: &str, field: &str, value: &str, key: &str) -> KvOp {
        KvOp::SetRemove {
            key: self.keys.group_ids(table, field, value),
            member: key.to_string(),
            counter: Some(CounterRef::new(self.keys.group_count(table, field), value)),
        }
    }

    // ── State inspection ─────────────────────────────────────────────

    /// Read the stored index of `table`.
    ///
    /// Buckets are collected for `grouping_fields` plus every field that
    /// still has counters or row state in the store.
    pub fn load_state(&self, table: &str, grouping_fields: &[String]) -> Result<IndexState> {
        let mut state = IndexState {
            ids: self.store.set_members(&self.keys.ids(table))?,
            ..IndexState::default()
        };
        let rows = self.keys.row_state_scan(table);
        for state_key in self.store.keys(rows.pattern())? {
            let Some(key) = rows.tail(&state_key)? else {
                continue;
            };
            let fields = self.store.hash_get_all(&state_key)?;
            if !fields.is_empty() {
                state.row_group_state.insert(key, fields);
            }
        }

        let mut fields: BTreeSet<String> = grouping_fields.iter().cloned().collect();
        let counters = self.keys.group_count_scan(table);
        for count_key in self.store.keys(counters.pattern())? {
            if let Some(field) = counters.tail(&count_key)? {
                fields.insert(field);
            }
        }
        for row_fields in state.row_group_state.values() {
            fields.extend(row_fields.keys().cloned());
        }

        for field in fields {
            let counts = self.store.counters(&self.keys.group_count(table, &field))?;
            if !counts.is_empty() {
                state.group_count.insert(field.clone(), counts);
            }

            let scan = self.keys.group_ids_scan(table, &field);
            let mut buckets = BTreeMap::new();
            for bucket_key in self.store.keys(scan.pattern())? {
                let Some(value) = scan.tail(&bucket_key)? else {
                    continue;
                };
                let members = self.store.set_members(&bucket_key)?;
                if !members.is_empty() {
                    buckets.insert(value, members);
                }
            }
            if !buckets.is_empty() {
                state.grouped_ids.insert(field, buckets);
            }
        }

        Ok(state)
    }

    /// Invariant violations in the stored index. Empty when consistent.
    pub fn verify(&self, table: &str, grouping_fields: &[String]) -> Result<Vec<String>> {
        Ok(self.load_state(table, grouping_fields)?.violations())
    }

    /// Drop the stored index and build it again from `records`.
    pub fn rebuild(
        &self,
        table: &str,
        records: &RecordSet,
        grouping_fields: &[String],
    ) -> Result<ReconcileReport> {
        self.drop_table(table)?;
        self.reconcile(table, records, grouping_fields)
    }

    /// Remove every index key of `table`.
    pub fn drop_table(&self, table: &str) -> Result<usize> {
        let mut removed = 0;
        for pattern in self.keys.table_patterns(table) {
            removed += self.store.delete_matching(&pattern)?;
        }
        log::debug!("dropped {} index keys for '{}'", removed, table);
        Ok(removed)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn ids(&self, table: &str) -> Result<BTreeSet<String>> {
        self.store.set_members(&self.keys.ids(table))
    }

    pub fn group_ids(&self, table: &str, field: &str, value: &str) -> Result<BTreeSet<String>> {
        self.store.set_members(&self.keys.group_ids(table, field, value))
    }

    pub fn group_counts(&self, table: &str, field: &str) -> Result<BTreeMap<String, i64>> {
        self.store.counters(&self.keys.group_count(table, field))
    }

    pub fn row_state(&self, table: &str, key: &str) -> Result<BTreeMap<String, String>> {
        self.store.hash_get_all(&self.keys.row_state(table, key))
    }

    pub fn row(&self, table: &str, key: &str) -> Result<Option<Value>> {
        match self.store.get(&self.keys.row(table, key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

fn row_payload(table: &str, record: &Record) -> Result<String> {
    let mut payload = record.clone();
    payload.insert("_table".to_string(), Value::String(table.to_string()));
    Ok(serde_json::to_string(&payload)?)
}
