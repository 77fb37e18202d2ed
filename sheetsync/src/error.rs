use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not configured: {name}")]
    NotConfigured { name: String },

    #[error("Timed out waiting for lock: {key}")]
    LockTimeout { key: String },

    #[error("Rebuild of '{key}' failed: {message}")]
    Rebuild { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid key pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Fatal for one table's sync; the table is skipped and its prior
/// cache/index are retained.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate field '{0}' in header row")]
    DuplicateField(String),

    #[error("key column '{0}' not found in header row")]
    MissingKeyColumn(String),

    #[error("header row is empty")]
    EmptyHeader,
}

/// Fatal for one group's merge; the member tables stay indexed and cached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("key '{key}' appears in subtypes '{first}' and '{second}' under concat mode")]
    DuplicateKeyAcrossSubtypes {
        key: String,
        first: String,
        second: String,
    },

    #[error("group '{0}' has no member tables")]
    EmptyGroup(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl SourceError {
    /// Rate limits and transient failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited(_) | SourceError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
