pub mod cache;
pub mod config;
mod digest;
pub mod error;
pub mod index;
pub mod keys;
pub mod kv;
pub mod merge;
pub mod naming;
pub mod schema;
pub mod source;
pub mod sync;
pub mod transform;

pub use cache::{CacheEntry, CacheManager, CacheOrigin, CacheRead, CacheState, ReadPolicy, Staleness};
pub use config::{parse_config, parse_config_str, SyncConfig};
pub use error::{Result, SyncError};
pub use index::{IndexBuilder, ReconcileReport};
pub use keys::KeySpace;
pub use kv::{KvStore, MemoryStore, SqliteStore};
pub use merge::{merge_group, ConflictStrategy, MergeMode, MergeRule, MergedGroup};
pub use naming::TableIdentity;
pub use schema::{infer_schema, FieldKind, FieldSchema};
pub use source::{DirectorySource, MemorySource, SheetRange, SheetValues, SpreadsheetSource};
pub use sync::{BatchReport, IndexTarget, SyncContext, SyncEngine, SyncOutcome, SyncReport};
pub use transform::{transform_rows, Record, RecordSet, TableRecords};
