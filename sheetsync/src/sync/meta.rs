use crate::digest::StableHasher;
use crate::merge::{MergeRule, Provenance};
use crate::schema::FieldSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sidecar metadata of the last completed sync of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub display_name: String,
    pub source_id: String,
    pub group: String,
    pub subtype: Option<String>,
    pub schema: FieldSchema,
    pub schema_fingerprint: String,
    pub source_version: String,
    pub grouping_fields: Vec<String>,
    pub row_count: usize,
    pub warning_count: usize,
    pub last_synced: DateTime<Utc>,
}

/// A member table as used by one group merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberVersion {
    pub display_name: String,
    pub subtype: String,
    pub source_version: String,
}

/// Sidecar metadata of the last completed merge of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group: String,
    pub members: Vec<MemberVersion>,
    pub merge_rule: MergeRule,
    pub subtype_order: Vec<String>,
    pub provenance: BTreeMap<String, Provenance>,
    pub source_version: String,
    pub grouping_fields: Vec<String>,
    pub row_count: usize,
    pub last_synced: DateTime<Utc>,
}

/// Version token of a merge: changes when any member version or the rule
/// changes.
pub(crate) fn group_version(members: &[MemberVersion], rule: &MergeRule) -> String {
    let mut hasher = StableHasher::new();
    hasher.count(members.len());
    for member in members {
        hasher
            .part(&member.display_name)
            .part(&member.subtype)
            .part(&member.source_version);
    }
    hasher
        .part(format!("{:?}", rule.conflict_strategy))
        .count(rule.priority_order.len());
    for subtype in &rule.priority_order {
        hasher.part(subtype);
    }
    hasher.part(format!("{:?}", rule.merge_mode));
    format!("g-{}", hasher.finish())
}
