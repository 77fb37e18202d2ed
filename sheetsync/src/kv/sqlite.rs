use super::{expiry_millis, now_millis, KvOp, KvStore};
use crate::error::{Result, SyncError};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// SQLite-backed store. Sets, counters, hashes and values each get their own
/// table; `apply` runs inside a single transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.initialize_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Store("sqlite connection mutex poisoned".into()))
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_values (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS kv_sets (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (key, member)
            );

            CREATE TABLE IF NOT EXISTS kv_counters (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (key, field)
            );

            CREATE TABLE IF NOT EXISTS kv_hashes (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );

            CREATE TABLE IF NOT EXISTS kv_locks (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

// ── Batch execution ──────────────────────────────────────────────────

fn bump(tx: &Transaction<'_>, key: &str, field: &str, delta: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO kv_counters (key, field, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(key, field) DO UPDATE SET value = value + excluded.value",
        params![key, field, delta],
    )?;
    tx.execute(
        "DELETE FROM kv_counters WHERE key = ?1 AND field = ?2 AND value = 0",
        params![key, field],
    )?;
    Ok(())
}

fn apply_one(tx: &Transaction<'_>, op: &KvOp) -> Result<bool> {
    let changed = match op {
        KvOp::SetAdd { key, member, counter } => {
            let added = tx.execute(
                "INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?1, ?2)",
                params![key, member],
            )? == 1;
            if added {
                if let Some(c) = counter {
                    bump(tx, &c.key, &c.field, 1)?;
                }
            }
            added
        }
        KvOp::SetRemove { key, member, counter } => {
            let removed = tx.execute(
                "DELETE FROM kv_sets WHERE key = ?1 AND member = ?2",
                params![key, member],
            )? == 1;
            if removed {
                if let Some(c) = counter {
                    bump(tx, &c.key, &c.field, -1)?;
                }
            }
            removed
        }
        KvOp::Incr { key, field, delta } => {
            bump(tx, key, field, *delta)?;
            *delta != 0
        }
        KvOp::HashSet { key, field, value } => {
            let previous: Option<String> = tx
                .query_row(
                    "SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2",
                    params![key, field],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT OR REPLACE INTO kv_hashes (key, field, value) VALUES (?1, ?2, ?3)",
                params![key, field, value],
            )?;
            previous.as_ref() != Some(value)
        }
        KvOp::HashDel { key, field } => {
            tx.execute(
                "DELETE FROM kv_hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
            )? == 1
        }
        KvOp::Put { key, value, ttl } => {
            tx.execute(
                "INSERT OR REPLACE INTO kv_values (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry_millis(*ttl)],
            )?;
            true
        }
        KvOp::Delete { key } => {
            let mut removed = 0;
            for table in ["kv_values", "kv_sets", "kv_counters", "kv_hashes"] {
                removed += tx.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
            }
            removed > 0
        }
    };
    Ok(changed)
}

fn purge_expired(conn: &Connection) -> Result<()> {
    conn.execute(
        "DELETE FROM kv_values WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now_millis()],
    )?;
    Ok(())
}

fn matching_keys(conn: &Connection, pattern: &glob::Pattern) -> Result<Vec<String>> {
    purge_expired(conn)?;
    let mut stmt = conn.prepare(
        "SELECT key FROM kv_values
         UNION SELECT key FROM kv_sets
         UNION SELECT key FROM kv_counters
         UNION SELECT key FROM kv_hashes
         ORDER BY key",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = Vec::new();
    for row in rows {
        let key = row?;
        if pattern.matches(&key) {
            keys.push(key);
        }
    }
    Ok(keys)
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT value FROM kv_values
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    fn set_members(&self, key: &str) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT member FROM kv_sets WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;

        let mut members = BTreeSet::new();
        for row in rows {
            members.insert(row?);
        }
        Ok(members)
    }

    fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM kv_sets WHERE key = ?1 AND member = ?2",
                params![key, member],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_len(&self, key: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_sets WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn counters(&self, key: &str) -> Result<BTreeMap<String, i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT field, value FROM kv_counters WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counters = BTreeMap::new();
        for row in rows {
            let (field, value) = row?;
            counters.insert(field, value);
        }
        Ok(counters)
    }

    fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT field, value FROM kv_hashes WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut fields = BTreeMap::new();
        for row in rows {
            let (field, value) = row?;
            fields.insert(field, value);
        }
        Ok(fields)
    }

    fn apply(&self, ops: &[KvOp]) -> Result<Vec<bool>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = Vec::with_capacity(ops.len());
        for op in ops {
            changed.push(apply_one(&tx, op)?);
        }
        tx.commit()?;
        Ok(changed)
    }

    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)?;
        let conn = self.conn()?;
        matching_keys(&conn, &pattern)
    }

    fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let pattern = glob::Pattern::new(pattern)?;
        let mut conn = self.conn()?;
        let doomed = matching_keys(&conn, &pattern)?;

        let tx = conn.transaction()?;
        for key in &doomed {
            apply_one(&tx, &KvOp::Delete { key: key.clone() })?;
        }
        tx.commit()?;
        Ok(doomed.len())
    }

    fn try_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_millis();
        let expires = expiry_millis(Some(lease)).unwrap_or(now);
        let taken = conn.execute(
            "INSERT INTO kv_locks (key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE kv_locks.owner = excluded.owner OR kv_locks.expires_at <= ?4",
            params![key, owner, expires, now],
        )?;
        Ok(taken == 1)
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
        let conn = self.conn()?;
        let released = conn.execute(
            "DELETE FROM kv_locks WHERE key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(released == 1)
    }
}
