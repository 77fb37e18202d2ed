//! Key-value store contract consumed by the index builder and cache manager.
//!
//! The store exposes sets, counters, field hashes and plain values under
//! string keys, plus a leased advisory lock. Multi-step mutations go through
//! [`KvStore::apply`], which must execute the whole batch atomically.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A counter field adjusted together with a set membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRef {
    pub key: String,
    pub field: String,
}

impl CounterRef {
    pub fn new(key: impl Into<String>, field: impl Into<String>) -> Self {
        CounterRef {
            key: key.into(),
            field: field.into(),
        }
    }
}

/// One mutation inside an atomic batch.
///
/// `SetAdd`/`SetRemove` adjust their counter only when membership actually
/// changed, so replaying a batch never double-counts. A counter field that
/// reaches zero is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    SetAdd {
        key: String,
        member: String,
        counter: Option<CounterRef>,
    },
    SetRemove {
        key: String,
        member: String,
        counter: Option<CounterRef>,
    },
    Incr {
        key: String,
        field: String,
        delta: i64,
    },
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    HashDel {
        key: String,
        field: String,
    },
    Put {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set_members(&self, key: &str) -> Result<BTreeSet<String>>;

    fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    fn set_len(&self, key: &str) -> Result<usize>;

    fn counters(&self, key: &str) -> Result<BTreeMap<String, i64>>;

    fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Execute a batch atomically. Returns, per op, whether it changed state.
    fn apply(&self, ops: &[KvOp]) -> Result<Vec<bool>>;

    /// Keys matching a glob pattern, sorted. Lock keys are not included.
    fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete every key matching a glob pattern. Returns the number removed.
    fn delete_matching(&self, pattern: &str) -> Result<usize>;

    /// Take an advisory lock. Succeeds if the lock is free, expired, or
    /// already held by `owner` (which renews the lease).
    fn try_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Release a lock held by `owner`. Returns false if it was not held.
    fn unlock(&self, key: &str, owner: &str) -> Result<bool>;

    // ── Single-op conveniences ───────────────────────────────────────

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.apply(&[KvOp::Put {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }])?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let changed = self.apply(&[KvOp::Delete { key: key.to_string() }])?;
        Ok(changed.first().copied().unwrap_or(false))
    }

    fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let changed = self.apply(&[KvOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
            counter: None,
        }])?;
        Ok(changed.first().copied().unwrap_or(false))
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let changed = self.apply(&[KvOp::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
            counter: None,
        }])?;
        Ok(changed.first().copied().unwrap_or(false))
    }

    fn incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.apply(&[KvOp::Incr {
            key: key.to_string(),
            field: field.to_string(),
            delta,
        }])?;
        Ok(self.counters(key)?.get(field).copied().unwrap_or(0))
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn expiry_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now_millis().saturating_add(d.as_millis().min(i64::MAX as u128) as i64))
}
