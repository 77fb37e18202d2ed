use crate::error::MergeError;
use crate::schema::FieldKind;
use crate::transform::{Record, RecordSet, TableRecords};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How conflicting keys across subtypes are resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    FirstWin,
    #[default]
    LastWin,
    MergeFields,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    #[default]
    BySubtype,
    /// Union of disjoint key spaces; overlapping keys are an error.
    Concat,
}

/// Per-group merge configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRule {
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub merge_mode: MergeMode,
}

/// Which subtypes supplied a merged record, and which one won.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub winner: String,
    pub contributors: Vec<String>,
}

/// Result of merging one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedGroup {
    pub records: RecordSet,
    pub provenance: BTreeMap<String, Provenance>,
    /// Subtypes in the order they were applied.
    pub subtype_order: Vec<String>,
}

impl MergedGroup {
    /// Records nested under the subtype that won them.
    pub fn by_subtype(&self) -> BTreeMap<String, RecordSet> {
        let mut out: BTreeMap<String, RecordSet> = BTreeMap::new();
        for (key, record) in &self.records {
            if let Some(prov) = self.provenance.get(key) {
                out.entry(prov.winner.clone())
                    .or_default()
                    .insert(key.clone(), record.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Order subtypes by the rule's priority list; unlisted subtypes follow in
/// their input order.
pub fn order_subtypes<'a>(inputs: &[(String, &'a TableRecords)], rule: &MergeRule) -> Vec<(String, &'a TableRecords)> {
    let mut ordered = Vec::with_capacity(inputs.len());
    for wanted in &rule.priority_order {
        if let Some((name, records)) = inputs.iter().find(|(name, _)| name == wanted) {
            ordered.push((name.clone(), *records));
        }
    }
    for (name, records) in inputs {
        if !rule.priority_order.contains(name) {
            ordered.push((name.clone(), *records));
        }
    }
    ordered
}

/// Merge the record sets of one group's subtypes.
///
/// Pure: identical inputs always produce identical records and provenance.
pub fn merge_group(inputs: &[(String, &TableRecords)], rule: &MergeRule) -> Result<MergedGroup, MergeError> {
    let ordered = order_subtypes(inputs, rule);
    let subtype_order: Vec<String> = ordered.iter().map(|(name, _)| name.clone()).collect();

    let mut records = RecordSet::new();
    let mut provenance: BTreeMap<String, Provenance> = BTreeMap::new();

    if rule.merge_mode == MergeMode::Concat {
        for (subtype, table) in &ordered {
            for (key, record) in &table.records {
                if let Some(existing) = provenance.get(key) {
                    return Err(MergeError::DuplicateKeyAcrossSubtypes {
                        key: key.clone(),
                        first: existing.winner.clone(),
                        second: subtype.clone(),
                    });
                }
                records.insert(key.clone(), record.clone());
                provenance.insert(
                    key.clone(),
                    Provenance {
                        winner: subtype.clone(),
                        contributors: vec![subtype.clone()],
                    },
                );
            }
        }
        return Ok(MergedGroup {
            records,
            provenance,
            subtype_order,
        });
    }

    for (subtype, table) in &ordered {
        for (key, record) in &table.records {
            match provenance.get_mut(key) {
                None => {
                    records.insert(key.clone(), record.clone());
                    provenance.insert(
                        key.clone(),
                        Provenance {
                            winner: subtype.clone(),
                            contributors: vec![subtype.clone()],
                        },
                    );
                }
                Some(prov) => {
                    prov.contributors.push(subtype.clone());
                    match rule.conflict_strategy {
                        ConflictStrategy::FirstWin => {}
                        ConflictStrategy::LastWin => {
                            records.insert(key.clone(), record.clone());
                            prov.winner = subtype.clone();
                        }
                        ConflictStrategy::MergeFields => {
                            if let Some(existing) = records.get_mut(key) {
                                merge_fields(existing, record, |field| {
                                    table.schema.kind_of(field) == Some(FieldKind::Array)
                                });
                            }
                            prov.winner = subtype.clone();
                        }
                    }
                }
            }
        }
    }

    log::debug!(
        "merged {} subtypes into {} records ({:?})",
        subtype_order.len(),
        records.len(),
        rule.conflict_strategy
    );

    Ok(MergedGroup {
        records,
        provenance,
        subtype_order,
    })
}

/// Overlay `incoming` onto `existing`. Nulls never overwrite; array fields
/// are unioned in first-seen order.
fn merge_fields(existing: &mut Record, incoming: &Record, is_array: impl Fn(&str) -> bool) {
    for (field, value) in incoming {
        if value.is_null() {
            existing.entry(field.clone()).or_insert(Value::Null);
            continue;
        }

        match (existing.get_mut(field), value) {
            (Some(Value::Array(current)), Value::Array(extra)) if is_array(field) => {
                for item in extra {
                    if !current.contains(item) {
                        current.push(item.clone());
                    }
                }
            }
            _ => {
                existing.insert(field.clone(), value.clone());
            }
        }
    }
}
