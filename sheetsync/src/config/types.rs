use crate::cache::Staleness;
use crate::error::{Result, SyncError};
use crate::merge::MergeRule;
use crate::schema::SchemaOverride;
use crate::source::SheetRange;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Top-level configuration parsed from sheetsync.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub settings: Settings,
    /// Keyed by table display name
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
    /// Keyed by group name
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_key_column")]
    pub default_key_column: String,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default)]
    pub staleness: Staleness,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_grouping_fields")]
    pub default_grouping_fields: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            key_prefix: default_key_prefix(),
            default_key_column: default_key_column(),
            default_ttl_secs: default_ttl_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            lock_wait_ms: default_lock_wait_ms(),
            staleness: Staleness::default(),
            retry: RetryPolicy::default(),
            default_grouping_fields: default_grouping_fields(),
        }
    }
}

impl Settings {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

fn default_key_prefix() -> String {
    "sheetsync".into()
}

fn default_key_column() -> String {
    "ID".into()
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_lock_lease_secs() -> u64 {
    30
}

fn default_lock_wait_ms() -> u64 {
    5000
}

fn default_grouping_fields() -> Vec<String> {
    vec!["Subtype".into()]
}

/// Retry policy for retryable source errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff before attempt `attempt` (1-based; the first attempt
    /// never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt.saturating_sub(1))))
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

/// Definition of a single table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table locator in the spreadsheet source
    pub source: String,
    #[serde(default)]
    pub range: Option<SheetRange>,
    #[serde(default)]
    pub schema: SchemaOverride,
    #[serde(default)]
    pub grouping_fields: Option<Vec<String>>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Definition of a table group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub merge: MergeRule,
    #[serde(default)]
    pub grouping_fields: Option<Vec<String>>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl SyncConfig {
    pub fn table(&self, display_name: &str) -> Option<&TableConfig> {
        self.tables.get(display_name)
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }

    pub fn table_grouping_fields(&self, display_name: &str) -> Vec<String> {
        self.table(display_name)
            .and_then(|t| t.grouping_fields.clone())
            .unwrap_or_else(|| self.settings.default_grouping_fields.clone())
    }

    pub fn group_grouping_fields(&self, name: &str) -> Vec<String> {
        self.group(name)
            .and_then(|g| g.grouping_fields.clone())
            .unwrap_or_else(|| self.settings.default_grouping_fields.clone())
    }

    pub fn table_ttl(&self, display_name: &str) -> u64 {
        self.table(display_name)
            .and_then(|t| t.ttl_secs)
            .unwrap_or(self.settings.default_ttl_secs)
    }

    pub fn group_ttl(&self, name: &str) -> u64 {
        self.group(name)
            .and_then(|g| g.ttl_secs)
            .unwrap_or(self.settings.default_ttl_secs)
    }

    /// Merge rule for a group; unconfigured groups use the defaults.
    pub fn merge_rule(&self, name: &str) -> MergeRule {
        self.group(name).map(|g| g.merge.clone()).unwrap_or_default()
    }

    /// Key column of a table: its schema override, else the default.
    pub fn key_column(&self, display_name: &str) -> &str {
        self.table(display_name)
            .and_then(|t| t.schema.key_column.as_deref())
            .unwrap_or(&self.settings.default_key_column)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.settings.key_prefix.trim().is_empty() {
            problems.push("settings.key_prefix must not be empty".to_string());
        }
        if self.settings.default_key_column.trim().is_empty() {
            problems.push("settings.default_key_column must not be empty".to_string());
        }
        if self.settings.default_ttl_secs == 0 {
            problems.push("settings.default_ttl_secs must be greater than zero".to_string());
        }
        if self.settings.lock_lease_secs == 0 {
            problems.push("settings.lock_lease_secs must be greater than zero".to_string());
        }
        if self.settings.retry.max_attempts == 0 {
            problems.push("settings.retry.max_attempts must be at least 1".to_string());
        }

        for (name, table) in &self.tables {
            if table.source.trim().is_empty() {
                problems.push(format!("table '{name}': source must not be empty"));
            }
            if table.ttl_secs == Some(0) {
                problems.push(format!("table '{name}': ttl_secs must be greater than zero"));
            }
        }

        for (name, group) in &self.groups {
            let mut seen = BTreeSet::new();
            for subtype in &group.merge.priority_order {
                if !seen.insert(subtype) {
                    problems.push(format!(
                        "group '{name}': subtype '{subtype}' listed twice in priority_order"
                    ));
                }
            }
            if group.ttl_secs == Some(0) {
                problems.push(format!("group '{name}': ttl_secs must be greater than zero"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Config(problems.join("; ")))
        }
    }
}
