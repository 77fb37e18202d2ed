use crate::transform::RecordSet;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot of one table's primary and grouped indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexState {
    pub ids: BTreeSet<String>,
    /// field -> value -> keys
    pub grouped_ids: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// field -> value -> count
    pub group_count: BTreeMap<String, BTreeMap<String, i64>>,
    /// key -> field -> last applied value
    pub row_group_state: BTreeMap<String, BTreeMap<String, String>>,
}

impl IndexState {
    /// The state a table with exactly `records` should have.
    pub fn from_records(records: &RecordSet, fields: &[String]) -> Self {
        let mut state = IndexState::default();
        for (key, record) in records {
            state.ids.insert(key.clone());
            for field in fields {
                if let Some(value) = grouping_value(record.get(field)) {
                    state
                        .grouped_ids
                        .entry(field.clone())
                        .or_default()
                        .entry(value.clone())
                        .or_default()
                        .insert(key.clone());
                    *state
                        .group_count
                        .entry(field.clone())
                        .or_default()
                        .entry(value.clone())
                        .or_insert(0) += 1;
                    state
                        .row_group_state
                        .entry(key.clone())
                        .or_default()
                        .insert(field.clone(), value);
                }
            }
        }
        state
    }

    pub fn bucket(&self, field: &str, value: &str) -> BTreeSet<String> {
        self.grouped_ids
            .get(field)
            .and_then(|b| b.get(value))
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, field: &str, value: &str) -> i64 {
        self.group_count
            .get(field)
            .and_then(|c| c.get(value))
            .copied()
            .unwrap_or(0)
    }

    /// Every broken invariant, described. Empty when the state is consistent.
    pub fn violations(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (field, buckets) in &self.grouped_ids {
            let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
            for (value, members) in buckets {
                let count = self.count(field, value);
                if count != members.len() as i64 {
                    problems.push(format!(
                        "{field}={value}: count {count} but {} members",
                        members.len()
                    ));
                }
                for member in members {
                    if !self.ids.contains(member) {
                        problems.push(format!("{field}={value}: member {member} missing from ids"));
                    }
                    if let Some(other) = owner.insert(member, value) {
                        problems.push(format!("{field}: {member} in buckets {other} and {value}"));
                    }
                    let recorded = self.row_group_state.get(member).and_then(|s| s.get(field));
                    if recorded.map(String::as_str) != Some(value.as_str()) {
                        problems.push(format!(
                            "{field}={value}: member {member} has row state {recorded:?}"
                        ));
                    }
                }
            }
        }

        for (field, counts) in &self.group_count {
            for (value, count) in counts {
                if *count < 0 {
                    problems.push(format!("{field}={value}: negative count {count}"));
                } else if *count > 0 && self.bucket(field, value).is_empty() {
                    problems.push(format!("{field}={value}: count {count} with empty bucket"));
                }
            }
        }

        for (key, fields) in &self.row_group_state {
            if !self.ids.contains(key) {
                problems.push(format!("row state for {key} which is not in ids"));
            }
            for (field, value) in fields {
                if !self.bucket(field, value).contains(key) {
                    problems.push(format!("{key}: row state {field}={value} but not in bucket"));
                }
            }
        }

        problems
    }
}

/// Bucket value for a grouping field. Null, blank and non-scalar values
/// have no bucket.
pub fn grouping_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
