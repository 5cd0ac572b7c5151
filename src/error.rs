use thiserror::Error;

use crate::types::NativeType;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The store rejected a write because it would violate a uniqueness or
    /// other integrity constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error(transparent)]
    Sqlite(rusqlite::Error),
    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for TransportError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                TransportError::Constraint(
                    message.clone().unwrap_or_else(|| failure.to_string()),
                )
            }
            _ => TransportError::Sqlite(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot infer a storage type for column '{column}' of table '{table}'")]
    SchemaInference { table: String, column: String },

    #[error(
        "column '{column}' of table '{table}' is stored as {existing} and cannot hold {desired}"
    )]
    SchemaConflict {
        table: String,
        column: String,
        existing: NativeType,
        desired: NativeType,
    },

    #[error("table '{table}' has no column '{column}' and schema alteration is disabled")]
    MissingColumn { table: String, column: String },

    #[error("write to '{table}' conflicts with a concurrent write for key {key}: {message}")]
    WriteConflict {
        table: String,
        key: String,
        message: String,
    },

    #[error("nothing stored in '{table}' for {key}")]
    NotFound { table: String, key: String },

    #[error("row {row} of '{table}' has no value for key column '{column}'")]
    NullKey {
        table: String,
        column: String,
        row: usize,
    },

    #[error("row {row} of '{table}' repeats stored key {key} with different values")]
    DuplicateMismatch {
        table: String,
        key: String,
        row: usize,
    },

    #[error("row {row} of '{table}' holds symbol '{found}' in '{column}' but '{expected}' was requested")]
    SymbolMismatch {
        table: String,
        column: String,
        row: usize,
        expected: String,
        found: String,
    },

    #[error("row {row} of '{table}': {kind} value '{value}' cannot be stored in column '{column}' ({native})")]
    ValueType {
        table: String,
        column: String,
        row: usize,
        kind: &'static str,
        value: String,
        native: NativeType,
    },

    #[error("'{0}' is not a valid table or column name")]
    InvalidIdentifier(String),

    #[error("invalid row batch: {0}")]
    InvalidBatch(String),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Transport(err.into())
    }
}

impl StoreError {
    /// Re-tags a constraint violation raised while writing `table` as a
    /// [`StoreError::WriteConflict`]; every other error passes through as is.
    pub fn into_write_conflict(self, table: &str, key: impl FnOnce() -> String) -> Self {
        match self {
            StoreError::Transport(TransportError::Constraint(message)) => {
                StoreError::WriteConflict {
                    table: table.to_string(),
                    key: key(),
                    message,
                }
            }
            other => other,
        }
    }
}
