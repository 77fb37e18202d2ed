use super::{SheetRange, SheetValues, SourceResult, SourceTable, SpreadsheetSource};
use crate::error::SourceError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    folders: BTreeMap<String, Vec<SourceTable>>,
    grids: HashMap<String, (Vec<Vec<String>>, Option<String>)>,
    failures: HashMap<String, VecDeque<SourceError>>,
    reads: HashMap<String, usize>,
}

/// Source holding tables registered in code. Failures can be queued per
/// table to exercise retry paths.
#[derive(Default)]
pub struct MemorySource {
    inner: Mutex<Inner>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a table in `folder`. The first row of `grid` is the header.
    pub fn add_table(&self, folder: &str, id: &str, display_name: &str, grid: Vec<Vec<String>>) {
        let mut inner = self.lock();
        let tables = inner.folders.entry(folder.to_string()).or_default();
        tables.retain(|t| t.id != id);
        tables.push(SourceTable {
            id: id.to_string(),
            display_name: display_name.to_string(),
        });
        inner.grids.insert(id.to_string(), (grid, None));
    }

    /// Replace a table's cells, keeping its registration.
    pub fn set_grid(&self, id: &str, grid: Vec<Vec<String>>) {
        let mut inner = self.lock();
        let revision = inner.grids.get(id).and_then(|(_, r)| r.clone());
        inner.grids.insert(id.to_string(), (grid, revision));
    }

    pub fn set_revision(&self, id: &str, revision: &str) {
        if let Some((_, r)) = self.lock().grids.get_mut(id) {
            *r = Some(revision.to_string());
        }
    }

    pub fn remove_table(&self, id: &str) {
        let mut inner = self.lock();
        inner.grids.remove(id);
        for tables in inner.folders.values_mut() {
            tables.retain(|t| t.id != id);
        }
    }

    /// Make the next read of `id` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, id: &str, error: SourceError) {
        self.lock()
            .failures
            .entry(id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of `read_rows` calls made for `id`, failed ones included.
    pub fn read_count(&self, id: &str) -> usize {
        self.lock().reads.get(id).copied().unwrap_or(0)
    }
}

impl SpreadsheetSource for MemorySource {
    fn list_tables(&self, folder: &str) -> SourceResult<Vec<SourceTable>> {
        self.lock()
            .folders
            .get(folder)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("folder '{folder}'")))
    }

    fn read_rows(&self, table_id: &str, range: Option<&SheetRange>) -> SourceResult<SheetValues> {
        let mut inner = self.lock();
        *inner.reads.entry(table_id.to_string()).or_insert(0) += 1;

        if let Some(error) = inner.failures.get_mut(table_id).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        let (grid, revision) = inner
            .grids
            .get(table_id)
            .ok_or_else(|| SourceError::NotFound(format!("table '{table_id}'")))?;
        let grid = match range {
            Some(range) => range.apply(grid),
            None => grid.clone(),
        };
        Ok(SheetValues::from_grid(grid, revision.clone()))
    }
}
