use super::{expiry_millis, now_millis, KvOp, KvStore};
use crate::error::{Result, SyncError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Option<i64>)>,
    sets: HashMap<String, BTreeSet<String>>,
    counters: HashMap<String, BTreeMap<String, i64>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    locks: HashMap<String, (String, i64)>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(self.values.get(key), Some((_, Some(at))) if *at <= now_millis());
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|(v, _)| v)
    }

    fn purge_expired(&mut self) {
        let now = now_millis();
        self.values.retain(|_, (_, exp)| exp.map_or(true, |at| at > now));
    }

    fn all_keys(&mut self) -> BTreeSet<String> {
        self.purge_expired();
        self.values
            .keys()
            .chain(self.sets.keys())
            .chain(self.counters.keys())
            .chain(self.hashes.keys())
            .cloned()
            .collect()
    }

    fn bump(&mut self, key: &str, field: &str, delta: i64) {
        let fields = self.counters.entry(key.to_string()).or_default();
        let value = fields.entry(field.to_string()).or_insert(0);
        *value += delta;
        if *value == 0 {
            fields.remove(field);
        }
        if fields.is_empty() {
            self.counters.remove(key);
        }
    }

    fn apply_one(&mut self, op: &KvOp) -> bool {
        match op {
            KvOp::SetAdd { key, member, counter } => {
                let added = self.sets.entry(key.clone()).or_default().insert(member.clone());
                if added {
                    if let Some(c) = counter {
                        self.bump(&c.key, &c.field, 1);
                    }
                }
                added
            }
            KvOp::SetRemove { key, member, counter } => {
                let removed = match self.sets.get_mut(key) {
                    Some(set) => {
                        let removed = set.remove(member);
                        if set.is_empty() {
                            self.sets.remove(key);
                        }
                        removed
                    }
                    None => false,
                };
                if removed {
                    if let Some(c) = counter {
                        self.bump(&c.key, &c.field, -1);
                    }
                }
                removed
            }
            KvOp::Incr { key, field, delta } => {
                self.bump(key, field, *delta);
                *delta != 0
            }
            KvOp::HashSet { key, field, value } => {
                let previous = self
                    .hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
                previous.as_ref() != Some(value)
            }
            KvOp::HashDel { key, field } => match self.hashes.get_mut(key) {
                Some(fields) => {
                    let removed = fields.remove(field).is_some();
                    if fields.is_empty() {
                        self.hashes.remove(key);
                    }
                    removed
                }
                None => false,
            },
            KvOp::Put { key, value, ttl } => {
                self.values.insert(key.clone(), (value.clone(), expiry_millis(*ttl)));
                true
            }
            KvOp::Delete { key } => {
                let mut removed = self.values.remove(key).is_some();
                removed |= self.sets.remove(key).is_some();
                removed |= self.counters.remove(key).is_some();
                removed |= self.hashes.remove(key).is_some();
                removed
            }
        }
    }
}

/// In-process store backed by hash maps behind a single mutex.
///
/// Every call holds the mutex for its whole duration, which makes `apply`
/// batches atomic with respect to concurrent readers.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Store("memory store mutex poisoned".into()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.live_value(key).cloned())
    }

    fn set_members(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(self.lock()?.sets.get(key).cloned().unwrap_or_default())
    }

    fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.lock()?.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    fn set_len(&self, key: &str) -> Result<usize> {
        Ok(self.lock()?.sets.get(key).map_or(0, BTreeSet::len))
    }

    fn counters(&self, key: &str) -> Result<BTreeMap<String, i64>> {
        Ok(self.lock()?.counters.get(key).cloned().unwrap_or_default())
    }

    fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.lock()?.hashes.get(key).cloned().unwrap_or_default())
    }

    fn apply(&self, ops: &[KvOp]) -> Result<Vec<bool>> {
        let mut inner = self.lock()?;
        Ok(ops.iter().map(|op| inner.apply_one(op)).collect())
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)?;
        let mut inner = self.lock()?;
        Ok(inner
            .all_keys()
            .into_iter()
            .filter(|k| pattern.matches(k))
            .collect())
    }

    fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let pattern = glob::Pattern::new(pattern)?;
        let mut inner = self.lock()?;
        let doomed: Vec<String> = inner
            .all_keys()
            .into_iter()
            .filter(|k| pattern.matches(k))
            .collect();
        for key in &doomed {
            inner.apply_one(&KvOp::Delete { key: key.clone() });
        }
        Ok(doomed.len())
    }

    fn try_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let mut inner = self.lock()?;
        let now = now_millis();
        let free = match inner.locks.get(key) {
            None => true,
            Some((holder, expires)) => holder == owner || *expires <= now,
        };
        if free {
            let expires = expiry_millis(Some(lease)).unwrap_or(now);
            inner.locks.insert(key.to_string(), (owner.to_string(), expires));
        }
        Ok(free)
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.locks.get(key) {
            Some((holder, _)) if holder == owner => {
                inner.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
