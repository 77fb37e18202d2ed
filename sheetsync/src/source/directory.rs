use super::{SheetRange, SheetValues, SourceResult, SourceTable, SpreadsheetSource};
use crate::error::SourceError;
use serde::Deserialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// One exported spreadsheet table on disk.
#[derive(Debug, Deserialize)]
struct SheetFile {
    name: String,
    #[serde(default)]
    revision: Option<Value>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Source reading tables from `*.json` / `*.yaml` files under a root.
///
/// A folder id is a directory relative to the root (`""` for the root
/// itself). A table id is the file's path relative to the root without its
/// extension, e.g. `config/units_hero`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectorySource { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_id(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .with_extension("")
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn find_file(&self, table_id: &str) -> SourceResult<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.root.join(format!("{table_id}.{ext}")))
            .find(|p| p.is_file())
            .ok_or_else(|| SourceError::NotFound(format!("table '{table_id}'")))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> SourceError {
    let message = format!("{}: {}", path.display(), e);
    match e.kind() {
        ErrorKind::NotFound => SourceError::NotFound(message),
        ErrorKind::PermissionDenied => SourceError::Unauthorized(message),
        _ => SourceError::Transient(message),
    }
}

fn read_sheet_file(path: &Path) -> SourceResult<SheetFile> {
    let content = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let parsed = if is_json {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| SourceError::NotFound(format!("{} is not a table file: {e}", path.display())))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

impl SpreadsheetSource for DirectorySource {
    fn list_tables(&self, folder: &str) -> SourceResult<Vec<SourceTable>> {
        let base = self.root.join(folder);
        if !base.is_dir() {
            return Err(SourceError::NotFound(format!("folder '{folder}'")));
        }

        let base = base.to_string_lossy();
        let base = base.trim_end_matches(['/', '\\']);
        let mut files = Vec::new();
        for ext in EXTENSIONS {
            let pattern = format!("{}/**/*.{}", glob::Pattern::escape(base), ext);
            let found = glob::glob(&pattern)
                .map_err(|e| SourceError::NotFound(format!("bad folder '{folder}': {e}")))?;
            files.extend(found.filter_map(|r| r.ok()));
        }
        files.sort();

        let mut tables = Vec::new();
        for path in &files {
            let file = match read_sheet_file(path) {
                Ok(file) => file,
                Err(e) => {
                    log::warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            tables.push(SourceTable {
                id: self.table_id(path),
                display_name: file.name,
            });
        }
        Ok(tables)
    }

    fn read_rows(&self, table_id: &str, range: Option<&SheetRange>) -> SourceResult<SheetValues> {
        let path = self.find_file(table_id)?;
        let file = read_sheet_file(&path)?;

        let grid: Vec<Vec<String>> = file
            .values
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();
        let grid = match range {
            Some(range) => range.apply(&grid),
            None => grid,
        };
        let revision = file.revision.as_ref().map(cell_text);
        Ok(SheetValues::from_grid(grid, revision))
    }
}
