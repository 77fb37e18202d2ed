//! Versioned cache entries with TTL staleness and single-flight rebuilds.
//!
//! Entries are stored without a store-level expiry so a stale entry stays
//! readable while it is being replaced. Rebuilds of one cache name are
//! coalesced in-process and serialized across processes by a leased lock.

use crate::error::{Result, SyncError};
use crate::keys::KeySpace;
use crate::kv::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const LOCK_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Value,
    pub last_updated: DateTime<Utc>,
    pub source_version: String,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(payload: Value, source_version: impl Into<String>, ttl_secs: u64) -> Self {
        CacheEntry {
            payload,
            last_updated: Utc::now(),
            source_version: source_version.into(),
            ttl_secs,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        let age_ms = (now - self.last_updated).num_milliseconds();
        let ttl_ms = i64::try_from(self.ttl_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        age_ms > ttl_ms
    }

    /// Same payload and version, freshly stamped.
    pub fn restamped(&self, ttl_secs: u64) -> Self {
        CacheEntry {
            payload: self.payload.clone(),
            last_updated: Utc::now(),
            source_version: self.source_version.clone(),
            ttl_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Absent,
    Fresh,
    Stale,
    Rebuilding,
}

/// What a reader gets while someone else rebuilds a stale entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    /// Return the stale entry immediately.
    #[default]
    ServeStale,
    /// Block until the rebuild finishes.
    Wait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadPolicy {
    pub force_refresh: bool,
    pub staleness: Staleness,
}

impl ReadPolicy {
    pub fn cached(staleness: Staleness) -> Self {
        ReadPolicy {
            force_refresh: false,
            staleness,
        }
    }

    pub fn forced() -> Self {
        ReadPolicy {
            force_refresh: true,
            staleness: Staleness::Wait,
        }
    }
}

/// How a read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    Hit,
    Rebuilt,
    /// Waited on a rebuild led by another caller.
    Joined,
    Stale,
    /// The rebuild failed and the previous entry was served.
    StaleAfterError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub entry: CacheEntry,
    pub origin: CacheOrigin,
}

impl CacheRead {
    fn new(entry: CacheEntry, origin: CacheOrigin) -> Self {
        CacheRead { entry, origin }
    }
}

// ── Single flight ────────────────────────────────────────────────────

type FlightResult = std::result::Result<CacheEntry, String>;

#[derive(Default)]
struct Flight {
    result: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> FlightResult {
        let mut guard = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            guard = self.done.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn complete(&self, result: FlightResult) {
        let mut guard = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(result);
        }
        self.done.notify_all();
    }
}

/// Held by the caller leading a rebuild. Waiters are released when it is
/// finished or dropped.
struct Leader<'a> {
    cache: &'a CacheManager,
    name: String,
    flight: Arc<Flight>,
}

impl Leader<'_> {
    fn finish(self, result: &Result<CacheRead>) {
        self.flight.complete(match result {
            Ok(read) => Ok(read.entry.clone()),
            Err(e) => Err(e.to_string()),
        });
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        self.flight.complete(Err("rebuild aborted".to_string()));
        let mut flights = self.cache.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(&self.name)
            .is_some_and(|f| Arc::ptr_eq(f, &self.flight))
        {
            flights.remove(&self.name);
        }
    }
}

// ── Cache manager ────────────────────────────────────────────────────

pub struct CacheManager {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    lock_lease: Duration,
    lock_wait: Duration,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KvStore>, keys: KeySpace) -> Self {
        CacheManager {
            store,
            keys,
            lock_lease: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lock_timing(mut self, lease: Duration, wait: Duration) -> Self {
        self.lock_lease = lease;
        self.lock_wait = wait;
        self
    }

    pub fn get(&self, name: &str) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.store.get(&self.keys.cache(name))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                log::warn!("discarding unreadable cache entry '{}': {}", name, e);
                Ok(None)
            }
        }
    }

    pub fn put(&self, name: &str, entry: &CacheEntry) -> Result<()> {
        let raw = serde_json::to_string(entry)?;
        self.store.put(&self.keys.cache(name), &raw, None)
    }

    /// Drop every entry whose name matches a glob, e.g. `table:*`.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        let removed = self.store.delete_matching(&self.keys.cache(pattern))?;
        log::info!("invalidated {} cache entries matching '{}'", removed, pattern);
        Ok(removed)
    }

    pub fn state(&self, name: &str) -> Result<CacheState> {
        if self.flights.lock().unwrap_or_else(PoisonError::into_inner).contains_key(name) {
            return Ok(CacheState::Rebuilding);
        }
        Ok(match self.get(name)? {
            None => CacheState::Absent,
            Some(entry) if entry.is_stale() => CacheState::Stale,
            Some(_) => CacheState::Fresh,
        })
    }

    /// Return the cached entry, rebuilding it when absent, stale or forced.
    ///
    /// At most one `rebuild` per name runs at a time in this process; other
    /// callers join it (or take the stale entry under
    /// [`Staleness::ServeStale`]). Across processes the rebuild is guarded
    /// by a leased lock. When an unforced rebuild fails and an older entry
    /// exists, the older entry is served.
    pub fn get_or_rebuild<F>(&self, name: &str, policy: ReadPolicy, rebuild: F) -> Result<CacheRead>
    where
        F: FnOnce() -> Result<CacheEntry>,
    {
        let existing = self.get(name)?;
        if !policy.force_refresh {
            if let Some(entry) = &existing {
                if !entry.is_stale() {
                    return Ok(CacheRead::new(entry.clone(), CacheOrigin::Hit));
                }
            }
        }

        let (flight, leading) = self.join_flight(name);
        if !leading {
            if let (Some(entry), Staleness::ServeStale, false) =
                (&existing, policy.staleness, policy.force_refresh)
            {
                log::debug!("serving stale '{}' during rebuild", name);
                return Ok(CacheRead::new(entry.clone(), CacheOrigin::Stale));
            }
            return match flight.wait() {
                Ok(entry) => Ok(CacheRead::new(entry, CacheOrigin::Joined)),
                Err(message) => self.fall_back(name, existing, &policy, message),
            };
        }

        let leader = Leader {
            cache: self,
            name: name.to_string(),
            flight,
        };
        let result = self.lead(name, &policy, existing, rebuild);
        leader.finish(&result);
        result
    }

    fn join_flight(&self, name: &str) -> (Arc<Flight>, bool) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = flights.get(name) {
            return (flight.clone(), false);
        }
        let flight = Arc::new(Flight::default());
        flights.insert(name.to_string(), flight.clone());
        (flight, true)
    }

    fn lead<F>(
        &self,
        name: &str,
        policy: &ReadPolicy,
        existing: Option<CacheEntry>,
        rebuild: F,
    ) -> Result<CacheRead>
    where
        F: FnOnce() -> Result<CacheEntry>,
    {
        let lock_key = self.keys.lock(name);
        let owner = Uuid::new_v4().to_string();
        if !self.acquire_lock(&lock_key, &owner)? {
            log::warn!("could not take '{}' within {:?}", lock_key, self.lock_wait);
            return match self.get(name)? {
                Some(entry) if !entry.is_stale() => Ok(CacheRead::new(entry, CacheOrigin::Hit)),
                Some(entry) if !policy.force_refresh => Ok(CacheRead::new(entry, CacheOrigin::Stale)),
                _ => Err(SyncError::LockTimeout { key: lock_key }),
            };
        }

        let result = self.rebuild_locked(name, policy, existing, rebuild);
        if let Err(e) = self.store.unlock(&lock_key, &owner) {
            log::warn!("failed to release '{}': {}", lock_key, e);
        }
        result
    }

    fn rebuild_locked<F>(
        &self,
        name: &str,
        policy: &ReadPolicy,
        existing: Option<CacheEntry>,
        rebuild: F,
    ) -> Result<CacheRead>
    where
        F: FnOnce() -> Result<CacheEntry>,
    {
        // Another process may have finished while we waited on the lock.
        if !policy.force_refresh {
            if let Some(entry) = self.get(name)? {
                if !entry.is_stale() {
                    return Ok(CacheRead::new(entry, CacheOrigin::Hit));
                }
            }
        }

        match rebuild() {
            Ok(entry) => {
                self.put(name, &entry)?;
                log::debug!("rebuilt cache '{}' at version {}", name, entry.source_version);
                Ok(CacheRead::new(entry, CacheOrigin::Rebuilt))
            }
            Err(e) => self.fall_back(name, existing, policy, e.to_string()).map_err(|fallback| {
                log::error!("rebuild of '{}' failed: {}", name, e);
                match fallback {
                    SyncError::Rebuild { .. } => e,
                    other => other,
                }
            }),
        }
    }

    fn fall_back(
        &self,
        name: &str,
        existing: Option<CacheEntry>,
        policy: &ReadPolicy,
        message: String,
    ) -> Result<CacheRead> {
        match existing {
            Some(entry) if !policy.force_refresh => {
                log::warn!("rebuild of '{}' failed, serving previous entry: {}", name, message);
                Ok(CacheRead::new(entry, CacheOrigin::StaleAfterError))
            }
            _ => Err(SyncError::Rebuild {
                key: name.to_string(),
                message,
            }),
        }
    }

    fn acquire_lock(&self, lock_key: &str, owner: &str) -> Result<bool> {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            if self.store.try_lock(lock_key, owner, self.lock_lease)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(LOCK_POLL);
        }
    }
}
