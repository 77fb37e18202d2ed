use crate::error::{Result, SyncError};
use std::borrow::Cow;

/// Key layout under a configurable prefix.
///
/// ```text
/// {p}:ids:{table}                      set of record keys
/// {p}:gids:{table}:{field}:{value}     set of record keys in one bucket
/// {p}:gcount:{table}:{field}           counter per bucket value
/// {p}:gstate:{table}:{key}             hash field -> last applied value
/// {p}:row:{table}:{key}                row JSON
/// {p}:meta:{table}                     table / group metadata JSON
/// {p}:cache:{scope}:{name}             cache entry JSON
/// {p}:lock:{name}                      advisory lock
/// ```
///
/// Table, field, value and key segments of index keys are percent-encoded,
/// so a segment never contains `:` or a glob metacharacter and a scan of
/// `{table}:*` cannot reach into another table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeySpace { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ids(&self, table: &str) -> String {
        format!("{}:ids:{}", self.prefix, segment(table))
    }

    pub fn group_ids(&self, table: &str, field: &str, value: &str) -> String {
        format!(
            "{}:gids:{}:{}:{}",
            self.prefix,
            segment(table),
            segment(field),
            segment(value)
        )
    }

    pub fn group_count(&self, table: &str, field: &str) -> String {
        format!("{}:gcount:{}:{}", self.prefix, segment(table), segment(field))
    }

    pub fn row_state(&self, table: &str, key: &str) -> String {
        format!("{}:gstate:{}:{}", self.prefix, segment(table), segment(key))
    }

    pub fn row(&self, table: &str, key: &str) -> String {
        format!("{}:row:{}:{}", self.prefix, segment(table), segment(key))
    }

    /// Prefix shared by every row state key of `table`, with a pattern
    /// matching exactly those keys.
    pub fn row_state_scan(&self, table: &str) -> KeyScan {
        KeyScan::new(format!("{}:gstate:{}:", self.prefix, segment(table)))
    }

    pub fn group_count_scan(&self, table: &str) -> KeyScan {
        KeyScan::new(format!("{}:gcount:{}:", self.prefix, segment(table)))
    }

    pub fn group_ids_scan(&self, table: &str, field: &str) -> KeyScan {
        KeyScan::new(format!(
            "{}:gids:{}:{}:",
            self.prefix,
            segment(table),
            segment(field)
        ))
    }

    pub fn meta(&self, table: &str) -> String {
        format!("{}:meta:{}", self.prefix, table)
    }

    pub fn cache(&self, name: &str) -> String {
        format!("{}:cache:{}", self.prefix, name)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    /// Patterns covering every index key of one table.
    pub fn table_patterns(&self, table: &str) -> Vec<String> {
        let table = segment(table);
        ["ids", "gids", "gcount", "gstate", "row"]
            .iter()
            .map(|kind| {
                if *kind == "ids" {
                    format!("{}:{}:{}", self.prefix, kind, table)
                } else {
                    format!("{}:{}:{}:*", self.prefix, kind, table)
                }
            })
            .collect()
    }
}

/// A key prefix plus the glob matching every key under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScan {
    prefix: String,
    pattern: String,
}

impl KeyScan {
    fn new(prefix: String) -> Self {
        let pattern = format!("{}*", glob::Pattern::escape(&prefix));
        KeyScan { prefix, pattern }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The decoded segment following the prefix, if `key` is under it.
    pub fn tail(&self, key: &str) -> Result<Option<String>> {
        match key.strip_prefix(&self.prefix) {
            Some(tail) if !tail.contains(':') => decode_segment(tail).map(Some),
            _ => Ok(None),
        }
    }
}

fn segment(raw: &str) -> Cow<'_, str> {
    urlencoding::encode(raw)
}

fn decode_segment(encoded: &str) -> Result<String> {
    urlencoding::decode(encoded)
        .map(Cow::into_owned)
        .map_err(|e| SyncError::Store(format!("undecodable key segment '{encoded}': {e}")))
}

impl Default for KeySpace {
    fn default() -> Self {
        KeySpace::new("sheetsync")
    }
}

/// Cache names for tables and merged groups.
pub fn table_cache_name(table: &str) -> String {
    format!("table:{table}")
}

pub fn group_cache_name(group: &str) -> String {
    format!("group:{group}")
}

/// Index and metadata namespace of a merged group. The `@` keeps it apart
/// from a member table whose display name equals the group name.
pub fn group_index_name(group: &str) -> String {
    format!("@{group}")
}
