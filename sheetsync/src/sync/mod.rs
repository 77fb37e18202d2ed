//! Sync orchestration: fetch, infer, transform, merge, index, publish.
//!
//! Every table and group sync runs as the rebuild of its cache entry, so
//! the cache manager's single-flight and leased lock serialize syncs of the
//! same name while syncs of different names proceed in parallel. The index
//! is always reconciled before the cache entry is published.

mod meta;
mod report;

pub use meta::{GroupMeta, MemberVersion, TableMeta};
pub use report::{
    BatchReport, GroupStatus, GroupSyncReport, StatusReport, SyncOutcome, SyncReport, TableStatus,
};

use crate::cache::{CacheEntry, CacheManager, CacheRead, ReadPolicy};
use crate::config::SyncConfig;
use crate::error::{MergeError, Result, SyncError};
use crate::index::{IndexBuilder, ReconcileReport};
use crate::keys::{group_cache_name, group_index_name, table_cache_name, KeySpace};
use crate::kv::KvStore;
use crate::merge::{merge_group, MergedGroup};
use crate::naming::TableIdentity;
use crate::schema::infer_schema;
use crate::source::{SourceResult, SourceTable, SpreadsheetSource};
use crate::transform::{transform_rows, RecordSet, TableRecords};
use chrono::Utc;
use meta::group_version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

/// Everything a sync engine needs, built once at process start.
pub struct SyncContext {
    pub source: Arc<dyn SpreadsheetSource>,
    pub store: Arc<dyn KvStore>,
    /// Snapshot read by every run; swap the engine to change it.
    pub config: Arc<SyncConfig>,
}

/// The index namespace a grouped-ID query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTarget<'a> {
    Table(&'a str),
    Group(&'a str),
}

impl IndexTarget<'_> {
    fn index_name(&self) -> String {
        match self {
            IndexTarget::Table(name) => name.to_string(),
            IndexTarget::Group(group) => group_index_name(group),
        }
    }
}

/// A table taking part in a group merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub display_name: String,
    pub subtype: String,
}

/// How a group merge brings its member tables up to date first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberMode {
    /// Use the cached snapshot, rebuilding only absent or stale members.
    Read,
    /// Sync every member; unchanged members short-circuit.
    Sync,
    /// Force a full sync of every member.
    Refresh,
}

pub struct SyncEngine {
    ctx: SyncContext,
    keys: KeySpace,
    index: IndexBuilder,
    cache: CacheManager,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        let settings = &ctx.config.settings;
        let keys = KeySpace::new(settings.key_prefix.clone());
        let index = IndexBuilder::new(ctx.store.clone(), keys.clone());
        let cache = CacheManager::new(ctx.store.clone(), keys.clone())
            .with_lock_timing(settings.lock_lease(), settings.lock_wait());
        SyncEngine {
            ctx,
            keys,
            index,
            cache,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn index(&self) -> &IndexBuilder {
        &self.index
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    // ── Tables ───────────────────────────────────────────────────────

    /// Fetch and publish one table. An unchanged source version only
    /// renews the cache timestamp.
    pub fn sync_table(&self, display_name: &str) -> Result<SyncReport> {
        let table = self.locate_table(display_name)?;
        self.sync_located(&table, false)
    }

    /// Like [`sync_table`](Self::sync_table) but always re-transforms and
    /// re-indexes.
    ///
    /// Groups the table belongs to are not touched: their cached merge
    /// stays fresh with the old member records until its TTL runs out, or
    /// until [`sync_group`](Self::sync_group), [`refresh_group`](Self::refresh_group)
    /// or an invalidation of `group:<name>`.
    pub fn refresh_table(&self, display_name: &str) -> Result<SyncReport> {
        let table = self.locate_table(display_name)?;
        self.sync_located(&table, true)
    }

    /// Cached records of a table, rebuilt when absent, stale or forced.
    pub fn read_table(&self, display_name: &str, force: bool) -> Result<CacheRead> {
        let policy = ReadPolicy {
            force_refresh: force,
            staleness: self.ctx.config.settings.staleness,
        };
        self.cache
            .get_or_rebuild(&table_cache_name(display_name), policy, || {
                let table = self.locate_table(display_name)?;
                self.run_table_sync(&table, force).map(|(entry, _)| entry)
            })
    }

    fn sync_located(&self, table: &SourceTable, force: bool) -> Result<SyncReport> {
        let name = table.display_name.as_str();
        let mut report = None;
        let read = self
            .cache
            .get_or_rebuild(&table_cache_name(name), ReadPolicy::forced(), || {
                let (entry, r) = self.run_table_sync(table, force)?;
                report = Some(r);
                Ok(entry)
            })
            .map_err(|e| {
                log::error!("sync of '{}' failed: {}", name, e);
                e
            })?;

        match report {
            Some(report) => Ok(report),
            None => {
                let meta = self.table_meta(name)?;
                Ok(SyncReport {
                    table: name.to_string(),
                    outcome: SyncOutcome::Coalesced,
                    source_version: read.entry.source_version,
                    row_count: meta.map_or(0, |m| m.row_count),
                    warnings: Vec::new(),
                    index: ReconcileReport::default(),
                    schema_changed: false,
                    attempts: 0,
                })
            }
        }
    }

    fn run_table_sync(&self, table: &SourceTable, force: bool) -> Result<(CacheEntry, SyncReport)> {
        let config = &self.ctx.config;
        let name = table.display_name.as_str();
        let table_config = config.table(name);
        let range = table_config.and_then(|t| t.range.as_ref());

        let (values, attempts) =
            self.with_retry(name, || self.ctx.source.read_rows(&table.id, range))?;
        let version = values.version();

        let overrides = table_config.map(|t| t.schema.clone()).unwrap_or_default();
        let schema = infer_schema(&values.header, &overrides, config.key_column(name))?;
        let fingerprint = schema.fingerprint();
        let grouping = config.table_grouping_fields(name);
        let ttl = config.table_ttl(name);
        let previous = self.table_meta(name)?;

        if !force {
            if let (Some(meta), Some(entry)) = (&previous, self.cache.get(&table_cache_name(name))?) {
                if meta.source_version == version
                    && entry.source_version == version
                    && meta.schema_fingerprint == fingerprint
                    && meta.grouping_fields == grouping
                {
                    log::debug!("'{}' unchanged at {}", name, version);
                    let report = SyncReport {
                        table: name.to_string(),
                        outcome: SyncOutcome::Unchanged,
                        source_version: version,
                        row_count: meta.row_count,
                        warnings: Vec::new(),
                        index: ReconcileReport::default(),
                        schema_changed: false,
                        attempts,
                    };
                    return Ok((entry.restamped(ttl), report));
                }
            }
        }

        let schema_changed = previous
            .as_ref()
            .is_some_and(|m| m.schema_fingerprint != fingerprint);
        if schema_changed {
            log::info!("schema of '{}' changed", name);
        }

        let records = transform_rows(&values.rows, &schema);
        for warning in &records.warnings {
            log::warn!("{}: {}", name, warning);
        }

        let index = self.index.reconcile(name, &records.records, &grouping)?;

        let identity = TableIdentity::parse(name);
        let meta = TableMeta {
            display_name: name.to_string(),
            source_id: table.id.clone(),
            group: identity.group,
            subtype: identity.subtype,
            schema,
            schema_fingerprint: fingerprint,
            source_version: version.clone(),
            grouping_fields: grouping,
            row_count: records.len(),
            warning_count: records.warnings.len(),
            last_synced: Utc::now(),
        };
        self.put_json(&self.keys.meta(name), &meta)?;

        log::info!(
            "synced '{}' at {}: {} rows, {} warnings",
            name,
            version,
            records.len(),
            records.warnings.len()
        );
        let payload = serde_json::to_value(&records.records)?;
        let report = SyncReport {
            table: name.to_string(),
            outcome: SyncOutcome::Synced,
            source_version: version.clone(),
            row_count: records.len(),
            warnings: records.warnings,
            index,
            schema_changed,
            attempts,
        };
        Ok((CacheEntry::new(payload, version, ttl), report))
    }

    /// Source table behind a display name: configured locator first, then
    /// the locator recorded by an earlier folder sync.
    fn locate_table(&self, display_name: &str) -> Result<SourceTable> {
        if let Some(config) = self.ctx.config.table(display_name) {
            return Ok(SourceTable {
                id: config.source.clone(),
                display_name: display_name.to_string(),
            });
        }
        if let Some(meta) = self.table_meta(display_name)? {
            return Ok(SourceTable {
                id: meta.source_id,
                display_name: display_name.to_string(),
            });
        }
        Err(SyncError::NotConfigured {
            name: display_name.to_string(),
        })
    }

    /// The last completed sync of a table: its schema and published records.
    fn table_snapshot(&self, display_name: &str) -> Result<Option<(TableRecords, String)>> {
        let Some(meta) = self.table_meta(display_name)? else {
            return Ok(None);
        };
        let Some(entry) = self.cache.get(&table_cache_name(display_name))? else {
            return Ok(None);
        };
        let records: RecordSet = serde_json::from_value(entry.payload)?;
        Ok(Some((
            TableRecords::from_parts(meta.schema, records),
            entry.source_version,
        )))
    }

    // ── Groups ───────────────────────────────────────────────────────

    /// Sync every member table, then merge and publish the group.
    pub fn sync_group(&self, group: &str) -> Result<GroupSyncReport> {
        self.sync_group_with(group, MemberMode::Sync, false)
    }

    /// Force-sync every member table, then merge and publish the group.
    pub fn refresh_group(&self, group: &str) -> Result<GroupSyncReport> {
        self.sync_group_with(group, MemberMode::Refresh, true)
    }

    /// Cached merged records of a group, rebuilt when absent, stale or
    /// forced.
    pub fn read_group(&self, group: &str, force: bool) -> Result<CacheRead> {
        let policy = ReadPolicy {
            force_refresh: force,
            staleness: self.ctx.config.settings.staleness,
        };
        let mode = if force { MemberMode::Refresh } else { MemberMode::Read };
        self.cache.get_or_rebuild(&group_cache_name(group), policy, || {
            self.run_group_sync(group, mode, force).map(|(entry, _)| entry)
        })
    }

    /// Merged records of a group nested under the subtype that won them.
    pub fn read_group_by_subtype(
        &self,
        group: &str,
        force: bool,
    ) -> Result<BTreeMap<String, RecordSet>> {
        let read = self.read_group(group, force)?;
        let records: RecordSet = serde_json::from_value(read.entry.payload)?;
        let meta = self
            .group_meta(group)?
            .ok_or_else(|| SyncError::Store(format!("no metadata for group '{group}'")))?;
        let merged = MergedGroup {
            records,
            provenance: meta.provenance,
            subtype_order: meta.subtype_order,
        };
        Ok(merged.by_subtype())
    }

    /// Member tables of a group, one per subtype, ordered by subtype.
    ///
    /// Members come from configured tables and from tables recorded by
    /// earlier syncs whose display name resolves to `group`.
    pub fn resolve_group_tables(&self, group: &str) -> Result<Vec<GroupMember>> {
        let mut by_subtype: BTreeMap<String, String> = BTreeMap::new();
        for name in self.known_tables()? {
            let identity = TableIdentity::parse(&name);
            if identity.group != group {
                continue;
            }
            let subtype = identity.subtype_or_default().to_string();
            match by_subtype.get(&subtype) {
                Some(kept) => log::warn!(
                    "group '{}': '{}' and '{}' share subtype '{}'; using '{}'",
                    group,
                    kept,
                    name,
                    subtype,
                    kept
                ),
                None => {
                    by_subtype.insert(subtype, name);
                }
            }
        }
        Ok(by_subtype
            .into_iter()
            .map(|(subtype, display_name)| GroupMember {
                display_name,
                subtype,
            })
            .collect())
    }

    fn sync_group_with(&self, group: &str, mode: MemberMode, force: bool) -> Result<GroupSyncReport> {
        let mut report = None;
        let read = self
            .cache
            .get_or_rebuild(&group_cache_name(group), ReadPolicy::forced(), || {
                let (entry, r) = self.run_group_sync(group, mode, force)?;
                report = Some(r);
                Ok(entry)
            })
            .map_err(|e| {
                log::error!("sync of group '{}' failed: {}", group, e);
                e
            })?;

        match report {
            Some(report) => Ok(report),
            None => {
                let meta = self.group_meta(group)?;
                Ok(GroupSyncReport {
                    group: group.to_string(),
                    outcome: SyncOutcome::Coalesced,
                    source_version: read.entry.source_version,
                    members: meta
                        .as_ref()
                        .map(|m| m.members.iter().map(|v| v.display_name.clone()).collect())
                        .unwrap_or_default(),
                    row_count: meta.map_or(0, |m| m.row_count),
                    index: ReconcileReport::default(),
                })
            }
        }
    }

    fn run_group_sync(
        &self,
        group: &str,
        mode: MemberMode,
        force: bool,
    ) -> Result<(CacheEntry, GroupSyncReport)> {
        let config = &self.ctx.config;
        let members = self.resolve_group_tables(group)?;
        if members.is_empty() {
            return Err(MergeError::EmptyGroup(group.to_string()).into());
        }

        let mut snapshots = Vec::with_capacity(members.len());
        let mut versions = Vec::with_capacity(members.len());
        for member in &members {
            let name = member.display_name.as_str();
            let updated = match mode {
                MemberMode::Read => self.read_table(name, false).map(|_| ()),
                MemberMode::Sync => self.sync_table(name).map(|_| ()),
                MemberMode::Refresh => self.refresh_table(name).map(|_| ()),
            };
            let (records, version) = match (updated, self.table_snapshot(name)?) {
                (Ok(()), Some(snapshot)) => snapshot,
                (Err(e), Some(snapshot)) => {
                    log::warn!(
                        "group '{}': member '{}' failed to sync, merging its last snapshot: {}",
                        group,
                        name,
                        e
                    );
                    snapshot
                }
                (Err(e), None) => return Err(e),
                (Ok(()), None) => {
                    return Err(SyncError::Store(format!("no published snapshot for '{name}'")))
                }
            };
            versions.push(MemberVersion {
                display_name: name.to_string(),
                subtype: member.subtype.clone(),
                source_version: version,
            });
            snapshots.push((member.subtype.clone(), records));
        }

        let rule = config.merge_rule(group);
        let version = group_version(&versions, &rule);
        let grouping = config.group_grouping_fields(group);
        let ttl = config.group_ttl(group);
        let member_names: Vec<String> = members.iter().map(|m| m.display_name.clone()).collect();

        if !force {
            if let (Some(meta), Some(entry)) =
                (self.group_meta(group)?, self.cache.get(&group_cache_name(group))?)
            {
                if meta.source_version == version
                    && entry.source_version == version
                    && meta.grouping_fields == grouping
                {
                    log::debug!("group '{}' unchanged at {}", group, version);
                    let report = GroupSyncReport {
                        group: group.to_string(),
                        outcome: SyncOutcome::Unchanged,
                        source_version: version,
                        members: member_names,
                        row_count: meta.row_count,
                        index: ReconcileReport::default(),
                    };
                    return Ok((entry.restamped(ttl), report));
                }
            }
        }

        let inputs: Vec<(String, &TableRecords)> =
            snapshots.iter().map(|(subtype, r)| (subtype.clone(), r)).collect();
        let merged = merge_group(&inputs, &rule)?;

        let index_name = group_index_name(group);
        let index = self.index.reconcile(&index_name, &merged.records, &grouping)?;

        let meta = GroupMeta {
            group: group.to_string(),
            members: versions,
            merge_rule: rule,
            subtype_order: merged.subtype_order.clone(),
            provenance: merged.provenance.clone(),
            source_version: version.clone(),
            grouping_fields: grouping,
            row_count: merged.len(),
            last_synced: Utc::now(),
        };
        self.put_json(&self.keys.meta(&index_name), &meta)?;

        log::info!(
            "merged group '{}' from {} tables: {} rows",
            group,
            members.len(),
            merged.len()
        );
        let payload = serde_json::to_value(&merged.records)?;
        let report = GroupSyncReport {
            group: group.to_string(),
            outcome: SyncOutcome::Synced,
            source_version: version.clone(),
            members: member_names,
            row_count: merged.len(),
            index,
        };
        Ok((CacheEntry::new(payload, version, ttl), report))
    }

    // ── Batches ──────────────────────────────────────────────────────

    /// Sync every table listed in a source folder, then every group those
    /// tables belong to.
    pub fn sync_folder(&self, folder: &str) -> Result<BatchReport> {
        let (tables, _) = self.with_retry(folder, || self.ctx.source.list_tables(folder))?;
        log::info!("folder '{}': {} tables", folder, tables.len());
        Ok(self.sync_batch(&tables))
    }

    /// Sync every configured table and group.
    pub fn sync_all(&self) -> Result<BatchReport> {
        let tables: Vec<SourceTable> = self
            .ctx
            .config
            .tables
            .iter()
            .map(|(name, t)| SourceTable {
                id: t.source.clone(),
                display_name: name.clone(),
            })
            .collect();
        let mut batch = self.sync_batch(&tables);

        for group in self.ctx.config.groups.keys() {
            if !batch.groups.contains_key(group) {
                let result = self.sync_group_with(group, MemberMode::Read, false);
                batch.groups.insert(group.clone(), result.map_err(|e| e.to_string()));
            }
        }
        Ok(batch)
    }

    fn sync_batch(&self, tables: &[SourceTable]) -> BatchReport {
        let mut batch = BatchReport::default();
        let mut groups = BTreeSet::new();

        for table in tables {
            let result = self.sync_located(table, false);
            let identity = TableIdentity::parse(&table.display_name);
            if identity.has_subtype() || self.ctx.config.group(&identity.group).is_some() {
                groups.insert(identity.group);
            }
            batch
                .tables
                .insert(table.display_name.clone(), result.map_err(|e| e.to_string()));
        }

        // Members were just synced, so merging reads their snapshots.
        for group in groups {
            let result = self.sync_group_with(&group, MemberMode::Read, false);
            batch.groups.insert(group, result.map_err(|e| e.to_string()));
        }

        let failures = batch.failures();
        if failures.is_empty() {
            log::info!(
                "batch finished: {} tables, {} groups",
                batch.tables.len(),
                batch.groups.len()
            );
        } else {
            log::warn!(
                "batch finished with {} failures: {}",
                failures.len(),
                failures
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        batch
    }

    // ── Queries and maintenance ──────────────────────────────────────

    /// Drop cache entries matching a glob relative to the cache namespace,
    /// e.g. `table:*` or `group:Config_Unit`.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        self.cache.invalidate(pattern)
    }

    /// Drop the index of a table or group and build it again from the
    /// published records. Runs as a forced flight on the cache entry, so it
    /// never interleaves with a sync of the same name. Grouping fields are
    /// the ones recorded by the last sync.
    pub fn rebuild_index(&self, target: IndexTarget<'_>) -> Result<ReconcileReport> {
        let config = &self.ctx.config;
        let (cache_name, grouping) = match target {
            IndexTarget::Table(name) => (
                table_cache_name(name),
                self.table_meta(name)?
                    .map(|m| m.grouping_fields)
                    .unwrap_or_else(|| config.table_grouping_fields(name)),
            ),
            IndexTarget::Group(group) => (
                group_cache_name(group),
                self.group_meta(group)?
                    .map(|m| m.grouping_fields)
                    .unwrap_or_else(|| config.group_grouping_fields(group)),
            ),
        };
        let index_name = target.index_name();

        let mut report = None;
        self.cache
            .get_or_rebuild(&cache_name, ReadPolicy::forced(), || {
                let entry = self.cache.get(&cache_name)?.ok_or_else(|| {
                    SyncError::Store(format!("nothing published for '{index_name}'"))
                })?;
                let records: RecordSet = serde_json::from_value(entry.payload.clone())?;
                report = Some(self.index.rebuild(&index_name, &records, &grouping)?);
                Ok(entry)
            })
            .map_err(|e| {
                log::error!("index rebuild of '{}' failed: {}", index_name, e);
                e
            })?;

        let report = report.unwrap_or_default();
        log::info!("rebuilt index of '{}': {} keys", index_name, report.added);
        Ok(report)
    }

    pub fn group_ids(&self, target: IndexTarget<'_>, field: &str, value: &str) -> Result<BTreeSet<String>> {
        self.index.group_ids(&target.index_name(), field, value)
    }

    pub fn group_counts(&self, target: IndexTarget<'_>, field: &str) -> Result<BTreeMap<String, i64>> {
        self.index.group_counts(&target.index_name(), field)
    }

    pub fn table_meta(&self, display_name: &str) -> Result<Option<TableMeta>> {
        self.get_json(&self.keys.meta(display_name))
    }

    pub fn group_meta(&self, group: &str) -> Result<Option<GroupMeta>> {
        self.get_json(&self.keys.meta(&group_index_name(group)))
    }

    pub fn status(&self) -> Result<StatusReport> {
        let mut report = StatusReport::default();

        let tables = self.known_tables()?;
        let mut groups: BTreeSet<String> = self.ctx.config.groups.keys().cloned().collect();
        for name in &tables {
            let identity = TableIdentity::parse(name);
            if identity.has_subtype() {
                groups.insert(identity.group);
            }
            let meta = self.table_meta(name)?;
            report.tables.push(TableStatus {
                table: name.clone(),
                cache: self.cache.state(&table_cache_name(name))?,
                source_version: meta.as_ref().map(|m| m.source_version.clone()),
                row_count: meta.as_ref().map(|m| m.row_count),
                warning_count: meta.as_ref().map(|m| m.warning_count),
                last_synced: meta.as_ref().map(|m| m.last_synced),
            });
        }
        groups.extend(self.meta_names()?.into_iter().filter_map(|n| n.strip_prefix('@').map(String::from)));

        for group in groups {
            let meta = self.group_meta(&group)?;
            report.groups.push(GroupStatus {
                cache: self.cache.state(&group_cache_name(&group))?,
                members: self
                    .resolve_group_tables(&group)?
                    .into_iter()
                    .map(|m| m.display_name)
                    .collect(),
                source_version: meta.as_ref().map(|m| m.source_version.clone()),
                row_count: meta.as_ref().map(|m| m.row_count),
                last_synced: meta.as_ref().map(|m| m.last_synced),
                group,
            });
        }
        Ok(report)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Configured tables plus tables with recorded metadata.
    fn known_tables(&self) -> Result<BTreeSet<String>> {
        let mut names: BTreeSet<String> = self.ctx.config.tables.keys().cloned().collect();
        names.extend(self.meta_names()?.into_iter().filter(|n| !n.starts_with('@')));
        Ok(names)
    }

    fn meta_names(&self) -> Result<Vec<String>> {
        let prefix = format!("{}:meta:", self.keys.prefix());
        let pattern = format!("{}*", glob::Pattern::escape(&prefix));
        Ok(self
            .ctx
            .store
            .keys(&pattern)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
            .collect())
    }

    fn with_retry<T>(&self, what: &str, mut op: impl FnMut() -> SourceResult<T>) -> Result<(T, u32)> {
        let policy = &self.ctx.config.settings.retry;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    attempt += 1;
                    let delay = policy.delay_before(attempt);
                    log::warn!(
                        "{}: {}; retrying in {:?} (attempt {}/{})",
                        what,
                        e,
                        delay,
                        attempt,
                        policy.max_attempts
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.ctx.store.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.ctx.store.put(key, &serde_json::to_string(value)?, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOrigin, CacheState};
    use crate::config::parse_config_str;
    use crate::error::{SchemaError, SourceError};
    use crate::kv::MemoryStore;
    use crate::source::{MemorySource, SheetRange, SheetValues};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    const CONFIG: &str = r#"
settings:
  retry:
    backoff_ms: 0
tables:
  Config_Unit(hero):
    source: units_hero
    schema:
      type_hints: {ID: int, Level: int}
  Config_Unit(soldier):
    source: units_soldier
    schema:
      type_hints: {ID: int, Level: int}
groups:
  Config_Unit:
    merge:
      conflict_strategy: first_win
      priority_order: [hero, soldier]
"#;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn ids(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    struct Fixture {
        source: Arc<MemorySource>,
        engine: SyncEngine,
    }

    fn source() -> Arc<MemorySource> {
        let source = Arc::new(MemorySource::new());
        source.add_table(
            "cfg",
            "units_hero",
            "Config_Unit(hero)",
            grid(&[
                &["ID", "Name", "Subtype", "Level"],
                &["11001", "英雄A", "hero", "10"],
                &["1", "A", "hero", "1"],
            ]),
        );
        source.add_table(
            "cfg",
            "units_soldier",
            "Config_Unit(soldier)",
            grid(&[
                &["ID", "Name", "Subtype", "Level"],
                &["21001", "Soldier", "soldier", "3"],
                &["1", "B", "soldier", "2"],
            ]),
        );
        source
    }

    fn engine_with(source: Arc<dyn SpreadsheetSource>, config: &str) -> SyncEngine {
        SyncEngine::new(SyncContext {
            source,
            store: Arc::new(MemoryStore::new()),
            config: Arc::new(parse_config_str(config).unwrap()),
        })
    }

    fn fixture(config: &str) -> Fixture {
        let source = source();
        let engine = engine_with(source.clone(), config);
        Fixture { source, engine }
    }

    #[test]
    fn test_sync_table_publishes_records_and_index() {
        let f = fixture(CONFIG);
        let report = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(report.outcome, SyncOutcome::Synced);
        assert_eq!(report.row_count, 2);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.index.added, 2);

        let read = f.engine.read_table("Config_Unit(hero)", false).unwrap();
        assert_eq!(read.origin, CacheOrigin::Hit);
        assert_eq!(
            read.entry.payload["11001"],
            json!({"ID": 11001, "Name": "英雄A", "Subtype": "hero", "Level": 10})
        );

        let counts = f
            .engine
            .group_counts(IndexTarget::Table("Config_Unit(hero)"), "Subtype")
            .unwrap();
        assert_eq!(counts.get("hero"), Some(&2));

        let meta = f.engine.table_meta("Config_Unit(hero)").unwrap().unwrap();
        assert_eq!(meta.group, "Config_Unit");
        assert_eq!(meta.subtype.as_deref(), Some("hero"));
        assert_eq!(meta.source_id, "units_hero");
        assert_eq!(meta.source_version, read.entry.source_version);
    }

    #[test]
    fn test_unchanged_source_short_circuits() {
        let f = fixture(CONFIG);
        f.engine.sync_table("Config_Unit(hero)").unwrap();

        let again = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(again.outcome, SyncOutcome::Unchanged);

        let forced = f.engine.refresh_table("Config_Unit(hero)").unwrap();
        assert_eq!(forced.outcome, SyncOutcome::Synced);
        assert_eq!(forced.index.unchanged, 2);

        f.source.set_grid(
            "units_hero",
            grid(&[&["ID", "Name", "Subtype", "Level"], &["11001", "英雄A", "hero", "11"]]),
        );
        let changed = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(changed.outcome, SyncOutcome::Synced);
        assert_eq!(changed.index.removed, 1);
        assert_eq!(changed.index.updated, 1);
    }

    #[test]
    fn test_rows_moving_between_subtypes() {
        let source = Arc::new(MemorySource::new());
        source.add_table(
            "misc",
            "t",
            "T",
            grid(&[&["ID", "Subtype"], &["11001", "hero"], &["21001", "soldier"]]),
        );
        let engine = engine_with(source.clone(), "{}");
        engine.sync_folder("misc").unwrap();

        source.set_grid("t", grid(&[&["ID", "Subtype"], &["11001", "soldier"], &["21001", "soldier"]]));
        let report = engine.sync_table("T").unwrap();
        assert_eq!(report.index.moved, 1);

        let target = IndexTarget::Table("T");
        assert!(engine.group_ids(target, "Subtype", "hero").unwrap().is_empty());
        assert_eq!(
            engine.group_ids(target, "Subtype", "soldier").unwrap(),
            ids(&["11001", "21001"])
        );
        let counts = engine.group_counts(target, "Subtype").unwrap();
        assert_eq!(counts.get("hero").copied().unwrap_or(0), 0);
        assert_eq!(counts.get("soldier"), Some(&2));
    }

    #[test]
    fn test_group_merge_first_win() {
        let f = fixture(CONFIG);
        let report = f.engine.sync_group("Config_Unit").unwrap();
        assert_eq!(report.outcome, SyncOutcome::Synced);
        assert_eq!(report.members, vec!["Config_Unit(hero)", "Config_Unit(soldier)"]);
        assert_eq!(report.row_count, 3);

        let read = f.engine.read_group("Config_Unit", false).unwrap();
        assert_eq!(read.origin, CacheOrigin::Hit);
        assert_eq!(read.entry.payload["1"]["Name"], json!("A"));

        let meta = f.engine.group_meta("Config_Unit").unwrap().unwrap();
        assert_eq!(meta.provenance["1"].winner, "hero");
        assert_eq!(meta.provenance["1"].contributors, vec!["hero", "soldier"]);

        let by_subtype = f.engine.read_group_by_subtype("Config_Unit", false).unwrap();
        assert_eq!(by_subtype["hero"].keys().cloned().collect::<BTreeSet<_>>(), ids(&["1", "11001"]));
        assert_eq!(by_subtype["soldier"].len(), 1);

        let counts = f
            .engine
            .group_counts(IndexTarget::Group("Config_Unit"), "Subtype")
            .unwrap();
        assert_eq!(counts.get("hero"), Some(&2));
        assert_eq!(counts.get("soldier"), Some(&1));

        let again = f.engine.sync_group("Config_Unit").unwrap();
        assert_eq!(again.outcome, SyncOutcome::Unchanged);
    }

    #[test]
    fn test_concat_overlap_fails_group_only() {
        let config = CONFIG.replace("conflict_strategy: first_win", "merge_mode: concat");
        let f = fixture(&config);

        let batch = f.engine.sync_folder("cfg").unwrap();
        assert!(batch.tables.values().all(std::result::Result::is_ok));
        let group_error = batch.groups["Config_Unit"].as_ref().unwrap_err();
        assert!(group_error.contains("concat"), "{group_error}");

        assert_eq!(
            f.engine.cache().state("table:Config_Unit(soldier)").unwrap(),
            CacheState::Fresh
        );
        assert_eq!(f.engine.cache().state("group:Config_Unit").unwrap(), CacheState::Absent);
    }

    #[test]
    fn test_retryable_errors_are_retried() {
        let f = fixture(CONFIG);
        f.source.fail_next("units_hero", SourceError::Transient("502".into()));
        f.source.fail_next("units_hero", SourceError::RateLimited("429".into()));

        let report = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(f.source.read_count("units_hero"), 3);
    }

    #[test]
    fn test_non_retryable_error_fails_fast() {
        let f = fixture(CONFIG);
        f.source.fail_next("units_hero", SourceError::Unauthorized("token".into()));

        let err = f.engine.sync_table("Config_Unit(hero)").unwrap_err();
        assert!(matches!(err, SyncError::Source(SourceError::Unauthorized(_))));
        assert_eq!(f.source.read_count("units_hero"), 1);
    }

    #[test]
    fn test_exhausted_retries_keep_published_entry() {
        let f = fixture(CONFIG);
        f.engine.sync_table("Config_Unit(hero)").unwrap();
        for _ in 0..3 {
            f.source.fail_next("units_hero", SourceError::RateLimited("429".into()));
        }

        let err = f.engine.refresh_table("Config_Unit(hero)").unwrap_err();
        assert!(matches!(err, SyncError::Source(SourceError::RateLimited(_))));

        let read = f.engine.read_table("Config_Unit(hero)", false).unwrap();
        assert_eq!(read.origin, CacheOrigin::Hit);
        assert_eq!(read.entry.payload.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_stale_entry_served_when_source_fails() {
        let f = fixture(CONFIG);
        f.engine.sync_table("Config_Unit(hero)").unwrap();

        let name = table_cache_name("Config_Unit(hero)");
        let mut entry = f.engine.cache().get(&name).unwrap().unwrap();
        entry.last_updated -= chrono::Duration::hours(2);
        f.engine.cache().put(&name, &entry).unwrap();
        f.source.fail_next("units_hero", SourceError::NotFound("sheet deleted".into()));

        let read = f.engine.read_table("Config_Unit(hero)", false).unwrap();
        assert_eq!(read.origin, CacheOrigin::StaleAfterError);
        assert_eq!(read.entry.payload, entry.payload);
    }

    #[test]
    fn test_schema_error_keeps_previous_state() {
        let f = fixture(CONFIG);
        f.engine.sync_table("Config_Unit(hero)").unwrap();

        f.source.set_grid("units_hero", grid(&[&["Name", "Subtype"], &["A", "hero"]]));
        let err = f.engine.sync_table("Config_Unit(hero)").unwrap_err();
        assert!(matches!(
            err,
            SyncError::Schema(SchemaError::MissingKeyColumn(ref column)) if column == "ID"
        ));

        assert_eq!(
            f.engine.index().ids("Config_Unit(hero)").unwrap(),
            ids(&["1", "11001"])
        );
        let read = f.engine.read_table("Config_Unit(hero)", false).unwrap();
        assert_eq!(read.origin, CacheOrigin::Hit);
    }

    #[test]
    fn test_folder_sync_isolates_failures() {
        let f = fixture(CONFIG);
        f.source.add_table("cfg", "units_mage", "Config_Unit(mage)", grid(&[&["Name"], &["x"]]));

        let batch = f.engine.sync_folder("cfg").unwrap();
        assert!(!batch.is_success());
        assert_eq!(batch.failures().len(), 1);
        assert!(batch.tables["Config_Unit(mage)"].is_err());
        assert!(batch.tables["Config_Unit(hero)"].is_ok());

        let group = batch.groups["Config_Unit"].as_ref().unwrap();
        assert_eq!(group.members.len(), 2);
    }

    #[test]
    fn test_folder_tables_resolve_without_config() {
        let source = source();
        let engine = engine_with(source, "settings:\n  retry:\n    backoff_ms: 0\n");
        engine.sync_folder("cfg").unwrap();

        let members = engine.resolve_group_tables("Config_Unit").unwrap();
        assert_eq!(
            members,
            vec![
                GroupMember {
                    display_name: "Config_Unit(hero)".into(),
                    subtype: "hero".into()
                },
                GroupMember {
                    display_name: "Config_Unit(soldier)".into(),
                    subtype: "soldier".into()
                },
            ]
        );
        // default rule is last_win in subtype order
        let read = engine.read_group("Config_Unit", false).unwrap();
        assert_eq!(read.entry.payload["1"]["Name"], json!("B"));
        assert_eq!(engine.sync_table("Config_Unit(hero)").unwrap().outcome, SyncOutcome::Unchanged);
    }

    #[test]
    fn test_unknown_table_is_not_configured() {
        let f = fixture(CONFIG);
        assert!(matches!(
            f.engine.sync_table("Nope").unwrap_err(),
            SyncError::NotConfigured { .. }
        ));
        assert!(matches!(
            f.engine.read_table("Nope", false).unwrap_err(),
            SyncError::NotConfigured { .. }
        ));
        assert!(matches!(
            f.engine.sync_group("Nope").unwrap_err(),
            SyncError::Merge(MergeError::EmptyGroup(_))
        ));
    }

    #[test]
    fn test_invalidate_then_lazy_rebuild() {
        let f = fixture(CONFIG);
        f.engine.sync_all().unwrap();
        assert_eq!(f.engine.invalidate("table:*").unwrap(), 2);
        assert_eq!(
            f.engine.cache().state("table:Config_Unit(hero)").unwrap(),
            CacheState::Absent
        );

        let read = f.engine.read_table("Config_Unit(hero)", false).unwrap();
        assert_eq!(read.origin, CacheOrigin::Rebuilt);
        assert_eq!(
            f.engine.cache().state("group:Config_Unit").unwrap(),
            CacheState::Fresh
        );
    }

    #[test]
    fn test_rebuild_index_repairs_drift() {
        let f = fixture(CONFIG);
        f.engine.sync_group("Config_Unit").unwrap();
        let store = &f.engine.ctx.store;
        let group_index = group_index_name("Config_Unit");
        store
            .incr(&f.engine.keys.group_count("Config_Unit(hero)", "Subtype"), "hero", 4)
            .unwrap();
        store
            .set_add(&f.engine.keys.group_ids(&group_index, "Subtype", "hero"), "404")
            .unwrap();
        let before = f.engine.cache().get("table:Config_Unit(hero)").unwrap().unwrap();

        let report = f.engine.rebuild_index(IndexTarget::Table("Config_Unit(hero)")).unwrap();
        assert_eq!(report.added, 2);
        let counts = f
            .engine
            .group_counts(IndexTarget::Table("Config_Unit(hero)"), "Subtype")
            .unwrap();
        assert_eq!(counts.get("hero"), Some(&2));
        let after = f.engine.cache().get("table:Config_Unit(hero)").unwrap().unwrap();
        assert_eq!(after.source_version, before.source_version);
        assert_eq!(after.payload, before.payload);

        let report = f.engine.rebuild_index(IndexTarget::Group("Config_Unit")).unwrap();
        assert_eq!(report.added, 3);
        assert_eq!(
            f.engine
                .group_ids(IndexTarget::Group("Config_Unit"), "Subtype", "hero")
                .unwrap(),
            ids(&["1", "11001"])
        );
        assert!(f
            .engine
            .index()
            .verify(&group_index, &["Subtype".to_string()])
            .unwrap()
            .is_empty());

        assert!(matches!(
            f.engine.rebuild_index(IndexTarget::Table("Nope")).unwrap_err(),
            SyncError::Store(_)
        ));
    }

    #[test]
    fn test_source_revision_is_the_version() {
        let f = fixture(CONFIG);
        f.source.set_revision("units_hero", "7");
        let first = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(first.source_version, "rev-7");

        // edits stay invisible until the revision moves
        f.source.set_grid(
            "units_hero",
            grid(&[&["ID", "Name", "Subtype", "Level"], &["5", "C", "hero", "1"]]),
        );
        let same = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(same.outcome, SyncOutcome::Unchanged);

        f.source.set_revision("units_hero", "8");
        let bumped = f.engine.sync_table("Config_Unit(hero)").unwrap();
        assert_eq!(bumped.outcome, SyncOutcome::Synced);
        assert_eq!(bumped.source_version, "rev-8");
        assert_eq!(bumped.row_count, 1);
        assert_eq!(bumped.index.removed, 2);
        assert_eq!(bumped.index.added, 1);
    }

    #[test]
    fn test_removed_source_table_keeps_last_snapshot() {
        let f = fixture(CONFIG);
        f.engine.sync_all().unwrap();
        f.source.remove_table("units_soldier");

        let err = f.engine.refresh_table("Config_Unit(soldier)").unwrap_err();
        assert!(matches!(err, SyncError::Source(SourceError::NotFound(_))));
        assert_eq!(
            f.engine.index().ids("Config_Unit(soldier)").unwrap(),
            ids(&["1", "21001"])
        );

        let group = f.engine.refresh_group("Config_Unit").unwrap();
        assert_eq!(group.outcome, SyncOutcome::Synced);
        assert_eq!(group.row_count, 3);

        let batch = f.engine.sync_folder("cfg").unwrap();
        assert!(!batch.tables.contains_key("Config_Unit(soldier)"));
        assert!(batch.is_success());
    }

    #[test]
    fn test_status_lists_tables_and_groups() {
        let f = fixture(CONFIG);
        f.engine.sync_table("Config_Unit(hero)").unwrap();

        let status = f.engine.status().unwrap();
        assert_eq!(status.tables.len(), 2);
        let hero = &status.tables[0];
        assert_eq!(hero.cache, CacheState::Fresh);
        assert_eq!(hero.row_count, Some(2));
        let soldier = &status.tables[1];
        assert_eq!(soldier.cache, CacheState::Absent);
        assert_eq!(soldier.source_version, None);

        assert_eq!(status.groups.len(), 1);
        assert_eq!(status.groups[0].cache, CacheState::Absent);
        assert_eq!(status.groups[0].members.len(), 2);
    }

    /// Delays every read so concurrent callers overlap.
    struct SlowSource {
        inner: Arc<MemorySource>,
        delay: Duration,
    }

    impl SpreadsheetSource for SlowSource {
        fn list_tables(&self, folder: &str) -> SourceResult<Vec<SourceTable>> {
            self.inner.list_tables(folder)
        }

        fn read_rows(&self, table_id: &str, range: Option<&SheetRange>) -> SourceResult<SheetValues> {
            thread::sleep(self.delay);
            self.inner.read_rows(table_id, range)
        }
    }

    #[test]
    fn test_concurrent_refreshes_coalesce() {
        let inner = source();
        let slow = Arc::new(SlowSource {
            inner: inner.clone(),
            delay: Duration::from_millis(150),
        });
        let engine = engine_with(slow, CONFIG);

        let outcomes: Vec<SyncOutcome> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| engine.refresh_table("Config_Unit(hero)").unwrap().outcome))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(inner.read_count("units_hero"), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == SyncOutcome::Synced).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == SyncOutcome::Coalesced).count(), 3);
    }
}
