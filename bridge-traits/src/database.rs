//! Database Abstraction Layer
//!
//! Provides the driver-facing contract the data core talks to. The core never
//! speaks a wire protocol itself: it renders parameterised SQL and hands it to
//! whichever [`DatabaseAdapter`] was configured for a [`NodeType`] role.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_traits::database::{DatabaseAdapter, DatabaseConfig, QueryValue};
//!
//! let adapter = SqliteAdapter::connect_lazy(DatabaseConfig::in_memory())?;
//!
//! let tx = adapter.begin_transaction().await?;
//! adapter
//!     .execute_in_transaction(tx, "DELETE FROM \"User\" WHERE \"Id\" = ?", &[QueryValue::Integer(7)])
//!     .await?;
//! adapter.commit_transaction(tx).await?;
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration for one physical endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database file path or connection string
    pub database_url: String,

    /// Minimum number of connections in the pool
    pub min_connections: u32,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,

    /// Enable statement caching
    pub enable_cache: bool,

    /// Statement cache capacity
    pub cache_capacity: usize,
}

impl DatabaseConfig {
    /// Create a new database configuration with the given file path
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        let path = database_path.into();
        Self::from_url(format!("sqlite:{}", path.display()))
    }

    /// Create a configuration from a full connection string. In-memory URLs
    /// get the single connection pool of [`DatabaseConfig::in_memory`].
    pub fn from_url(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        if database_url.contains(":memory:") {
            return Self {
                database_url,
                ..Self::in_memory()
            };
        }
        Self {
            database_url,
            min_connections: 1,
            max_connections: 5,
            acquire_timeout_secs: 30,
            enable_cache: true,
            cache_capacity: 100,
        }
    }

    /// Create a configuration for a private in-memory database
    ///
    /// The pool is capped at a single connection so the database lives exactly
    /// as long as that connection.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            min_connections: 0,
            max_connections: 1,
            acquire_timeout_secs: 30,
            enable_cache: true,
            cache_capacity: 100,
        }
    }

    /// Whether this configuration points at an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Logical role of a database endpoint
///
/// `Master` is the authoritative read-write endpoint; `Slave` is the
/// read-optimised replica. A deployment without a replica simply registers no
/// `Slave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Master,
    Slave,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Master => "Master",
            NodeType::Slave => "Slave",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(NodeType::Master),
            "slave" => Ok(NodeType::Slave),
            other => Err(BridgeError::InvalidInput(format!(
                "Unknown node type '{}', expected 'Master' or 'Slave'",
                other
            ))),
        }
    }
}

// =============================================================================
// Query Result Types
// =============================================================================

/// Represents a single row from a database query as a map of column names to values
pub type QueryRow = std::collections::HashMap<String, QueryValue>;

/// Represents a database value that can be null, integer, real, text, or blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl QueryValue {
    /// Convert to i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            QueryValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Convert to f64 if possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            QueryValue::Real(r) => Some(*r),
            QueryValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Convert to bool if possible (integers, zero is false)
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            QueryValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Convert to String if possible
    pub fn as_str(&self) -> Option<&str> {
        match self {
            QueryValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert to String (owned) if possible
    pub fn as_string(&self) -> Option<String> {
        match self {
            QueryValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Convert to bytes if possible
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            QueryValue::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Parse an RFC 3339 text value into a UTC timestamp
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        self.as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, QueryValue::Null)
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue::Integer(value)
    }
}

impl From<i32> for QueryValue {
    fn from(value: i32) -> Self {
        QueryValue::Integer(i64::from(value))
    }
}

impl From<u32> for QueryValue {
    fn from(value: u32) -> Self {
        QueryValue::Integer(i64::from(value))
    }
}

impl From<f64> for QueryValue {
    fn from(value: f64) -> Self {
        QueryValue::Real(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue::Integer(i64::from(value))
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Text(value)
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Text(value.to_string())
    }
}

impl From<&String> for QueryValue {
    fn from(value: &String) -> Self {
        QueryValue::Text(value.clone())
    }
}

impl From<Vec<u8>> for QueryValue {
    fn from(value: Vec<u8>) -> Self {
        QueryValue::Blob(value)
    }
}

/// Timestamps are stored as RFC 3339 text with microsecond precision so that
/// values read back compare equal to values written.
impl From<DateTime<Utc>> for QueryValue {
    fn from(value: DateTime<Utc>) -> Self {
        QueryValue::Text(value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(QueryValue::Null)
    }
}

// =============================================================================
// Database Adapter Trait
// =============================================================================

/// Database adapter trait for the outbound database driver
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`: one adapter (and its pool) is shared
/// by every session created for its role.
///
/// ## Transaction Support
///
/// `begin_transaction` pins a dedicated connection and returns a
/// [`TransactionId`]; every `*_in_transaction` call with that id runs on the
/// pinned connection until `commit_transaction` or `rollback_transaction`
/// releases it.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Check if the database connection is healthy
    async fn health_check(&self) -> Result<()>;

    /// Close all database connections
    async fn close(&self) -> Result<()>;

    /// Execute a raw SQL query and return rows
    ///
    /// # Safety
    ///
    /// This method should use parameterized queries to prevent SQL injection.
    /// Never concatenate user input directly into the query string.
    async fn query(&self, query: &str, params: &[QueryValue]) -> Result<Vec<QueryRow>>;

    /// Execute a SQL statement that doesn't return rows (INSERT, UPDATE, DELETE)
    ///
    /// # Returns
    ///
    /// Number of rows affected
    async fn execute(&self, statement: &str, params: &[QueryValue]) -> Result<u64>;

    /// Begin a new database transaction
    async fn begin_transaction(&self) -> Result<TransactionId>;

    /// Commit a transaction
    async fn commit_transaction(&self, transaction_id: TransactionId) -> Result<()>;

    /// Rollback a transaction
    async fn rollback_transaction(&self, transaction_id: TransactionId) -> Result<()>;

    /// Execute a query within a transaction
    async fn query_in_transaction(
        &self,
        transaction_id: TransactionId,
        query: &str,
        params: &[QueryValue],
    ) -> Result<Vec<QueryRow>>;

    /// Execute a statement within a transaction
    async fn execute_in_transaction(
        &self,
        transaction_id: TransactionId,
        statement: &str,
        params: &[QueryValue],
    ) -> Result<u64>;

    /// Get detailed statistics about the database
    async fn get_statistics(&self) -> Result<DatabaseStatistics>;
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Unique identifier for a database transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStatistics {
    /// Total number of connections in the pool
    pub total_connections: u32,
    /// Number of idle connections
    pub idle_connections: u32,
    /// Number of active connections
    pub active_connections: u32,
    /// Number of open transactions
    pub open_transactions: usize,
}
