//! Error types for the sentinel.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Tick phase '{phase}' failed: {reason}")]
    Phase { phase: &'static str, reason: String },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron schedule '{schedule}': {message}")]
    InvalidSchedule { schedule: String, message: String },
}

/// Storage-related errors.
///
/// `SchemaMismatch` is the recoverable "column/table absent" condition: a
/// reader that hits it degrades (skips the table with a warning) instead of
/// failing the tick.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Schema mismatch in {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether this error means the schema is missing something we can live
    /// without (optional column or table not yet migrated).
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch { .. })
    }
}

/// Result type alias for the sentinel.
pub type Result<T> = std::result::Result<T, Error>;
