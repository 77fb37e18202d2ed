//! Spreadsheet source contract and the sources shipped with the crate.

mod directory;
mod memory;
mod range;

pub use directory::DirectorySource;
pub use memory::MemorySource;
pub use range::{column_index, column_letters, SheetRange};

use crate::digest::StableHasher;
use crate::error::SourceError;
use serde::{Deserialize, Serialize};

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A table as listed by a source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceTable {
    pub id: String,
    pub display_name: String,
}

/// Raw cell values of one table: the header row and the data rows below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SheetValues {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Revision token reported by the source, when it has one.
    pub revision: Option<String>,
}

impl SheetValues {
    /// Split a grid into header (first row) and data rows.
    pub fn from_grid(mut grid: Vec<Vec<String>>, revision: Option<String>) -> Self {
        if grid.is_empty() {
            return SheetValues {
                revision,
                ..SheetValues::default()
            };
        }
        let rows = grid.split_off(1);
        let header = grid.pop().unwrap_or_default();
        SheetValues {
            header,
            rows,
            revision,
        }
    }

    /// Opaque version token: the source revision when present, otherwise
    /// a content hash.
    pub fn version(&self) -> String {
        if let Some(revision) = &self.revision {
            return format!("rev-{revision}");
        }
        let mut hasher = StableHasher::new();
        for row in std::iter::once(&self.header).chain(&self.rows) {
            hasher.count(row.len());
            for cell in row {
                hasher.part(cell);
            }
        }
        format!("h-{}", hasher.finish())
    }
}

pub trait SpreadsheetSource: Send + Sync {
    /// Tables inside a folder or spreadsheet.
    fn list_tables(&self, folder: &str) -> SourceResult<Vec<SourceTable>>;

    /// Header and data rows of one table, cropped to `range` when given.
    fn read_rows(&self, table_id: &str, range: Option<&SheetRange>) -> SourceResult<SheetValues>;
}
