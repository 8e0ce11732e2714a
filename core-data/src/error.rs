use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Database error: {0}")]
    Database(#[from] BridgeError),

    #[error("Invalid argument: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Entity type is not mapped: {0}")]
    UnmappedEntity(String),

    #[error(
        "Concurrency conflict on {table} with id {id}: expected {expected} affected row(s), got {actual}"
    )]
    Concurrency {
        table: String,
        id: i64,
        expected: u64,
        actual: u64,
    },

    #[error("Another instance of {table} with id {id} is already tracked")]
    IdentityConflict { table: String, id: i64 },

    #[error("Cannot materialize {table}: {message}")]
    Materialization { table: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Object is disposed: {0}")]
    Disposed(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),
}

impl DataError {
    pub(crate) fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        DataError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
