//! Native SQLite Database Adapter
//!
//! Implements the `DatabaseAdapter` trait using `sqlx` with the native SQLite
//! driver.
//!
//! ## Features
//!
//! - Connection pooling with configurable limits
//! - WAL mode and foreign key enforcement
//! - Prepared statement caching
//! - Transactions pinned to a dedicated connection
//! - Constraint failures reported as `BridgeError::ConstraintViolation`
//!
//! ## In-memory databases
//!
//! Every `sqlite::memory:` pool owns a private database that lives as long as
//! its connections. [`DatabaseConfig::in_memory`] caps the pool at one
//! connection and this adapter disables idle and lifetime recycling for it, so
//! the database survives for the lifetime of the adapter. While a transaction
//! is open that single connection is pinned, so statements must be routed
//! through the transaction.

use async_trait::async_trait;
use bridge_traits::database::{
    DatabaseAdapter, DatabaseConfig, DatabaseStatistics, QueryRow, QueryValue, TransactionId,
};
use bridge_traits::error::{BridgeError, Result};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, Pool, Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Native SQLite implementation of DatabaseAdapter
///
/// This adapter wraps a `sqlx::Pool<Sqlite>`. Each open transaction holds its
/// own pooled connection until it is committed or rolled back.
pub struct SqliteAdapter {
    pool: Pool<Sqlite>,
    transaction_counter: AtomicU64,
    transactions: Mutex<HashMap<TransactionId, Transaction<'static, Sqlite>>>,
}

impl SqliteAdapter {
    fn connect_options(config: &DatabaseConfig) -> Result<SqliteConnectOptions> {
        let mut connect_options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| BridgeError::DatabaseError(format!("Invalid database URL: {}", e)))?;

        connect_options = connect_options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true)
            // 64MB page cache
            .pragma("cache_size", "-64000")
            .pragma("mmap_size", "268435456")
            .pragma("auto_vacuum", "INCREMENTAL");

        if config.enable_cache {
            connect_options = connect_options.statement_cache_capacity(config.cache_capacity);
        }

        Ok(connect_options)
    }

    fn pool_options(config: &DatabaseConfig) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

        if config.is_in_memory() {
            options.idle_timeout(None).max_lifetime(None)
        } else {
            options
        }
    }

    /// Create an adapter without opening a connection.
    ///
    /// The first statement opens one. For file databases this must be called
    /// from within a Tokio runtime, which drives the pool's maintenance task.
    ///
    /// # Errors
    ///
    /// Returns error if the database URL cannot be parsed
    pub fn connect_lazy(config: DatabaseConfig) -> Result<Self> {
        debug!(
            database_url = %config.database_url,
            max_connections = config.max_connections,
            "Creating lazy SQLite database adapter"
        );

        let connect_options = Self::connect_options(&config)?;
        let pool = Self::pool_options(&config).connect_lazy_with(connect_options);
        Ok(Self::from_pool(pool))
    }

    /// Create an adapter and establish the connection pool
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or connection pool creation fails
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        info!(
            database_url = %config.database_url,
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            "Creating SQLite database adapter"
        );

        let connect_options = Self::connect_options(&config)?;
        let pool = Self::pool_options(&config)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to create connection pool");
                BridgeError::DatabaseError(format!("Connection pool creation failed: {}", e))
            })?;

        info!(
            connections = pool.size(),
            "SQLite connection pool created successfully"
        );

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            transaction_counter: AtomicU64::new(1),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Convert a sqlx Row to a QueryRow (HashMap)
    fn row_to_query_row(row: &SqliteRow) -> QueryRow {
        let mut result = HashMap::new();

        for column in row.columns() {
            let column_name = column.name().to_string();

            let value = if let Ok(v) = row.try_get::<Option<i64>, _>(column.ordinal()) {
                v.map(QueryValue::Integer).unwrap_or(QueryValue::Null)
            } else if let Ok(v) = row.try_get::<Option<f64>, _>(column.ordinal()) {
                v.map(QueryValue::Real).unwrap_or(QueryValue::Null)
            } else if let Ok(v) = row.try_get::<Option<String>, _>(column.ordinal()) {
                v.map(QueryValue::Text).unwrap_or(QueryValue::Null)
            } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(column.ordinal()) {
                v.map(QueryValue::Blob).unwrap_or(QueryValue::Null)
            } else {
                QueryValue::Null
            };

            result.insert(column_name, value);
        }

        result
    }

    /// Convert QueryValue parameters to sqlx-compatible format
    fn bind_params<'q>(query: SqliteQuery<'q>, params: &'q [QueryValue]) -> SqliteQuery<'q> {
        let mut query = query;
        for param in params {
            query = match param {
                QueryValue::Null => query.bind(None::<i64>),
                QueryValue::Integer(i) => query.bind(i),
                QueryValue::Real(r) => query.bind(r),
                QueryValue::Text(s) => query.bind(s.as_str()),
                QueryValue::Blob(b) => query.bind(b.as_slice()),
            };
        }
        query
    }

    /// Map a driver error, keeping constraint failures distinguishable
    fn map_error(context: &str, error: sqlx::Error) -> BridgeError {
        if let sqlx::Error::Database(db_error) = &error {
            if db_error.is_unique_violation()
                || db_error.is_foreign_key_violation()
                || db_error.is_check_violation()
            {
                return BridgeError::ConstraintViolation(format!("{}: {}", context, db_error));
            }
        }
        BridgeError::DatabaseError(format!("{}: {}", context, error))
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn health_check(&self) -> Result<()> {
        debug!("Performing database health check");

        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                warn!(error = %e, "Database health check failed");
                BridgeError::DatabaseError(format!("Health check failed: {}", e))
            })?;

        debug!("Database health check passed");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing database connection pool");
        self.transactions.lock().await.clear();
        self.pool.close().await;
        Ok(())
    }

    async fn query(&self, query: &str, params: &[QueryValue]) -> Result<Vec<QueryRow>> {
        debug!(query = %query, param_count = params.len(), "Executing query");

        let rows = Self::bind_params(sqlx::query(query), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::map_error("Query failed", e))?;

        let result: Vec<QueryRow> = rows.iter().map(Self::row_to_query_row).collect();

        debug!(row_count = result.len(), "Query executed successfully");
        Ok(result)
    }

    async fn execute(&self, statement: &str, params: &[QueryValue]) -> Result<u64> {
        debug!(statement = %statement, param_count = params.len(), "Executing statement");

        let result = Self::bind_params(sqlx::query(statement), params)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_error("Execute failed", e))?;

        let rows_affected = result.rows_affected();
        debug!(rows_affected, "Statement executed successfully");

        Ok(rows_affected)
    }

    async fn begin_transaction(&self) -> Result<TransactionId> {
        let transaction = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::map_error("Begin transaction failed", e))?;

        let transaction_id =
            TransactionId(self.transaction_counter.fetch_add(1, Ordering::SeqCst));
        self.transactions
            .lock()
            .await
            .insert(transaction_id, transaction);

        debug!(transaction_id = transaction_id.0, "Transaction started");
        Ok(transaction_id)
    }

    async fn commit_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        debug!(transaction_id = transaction_id.0, "Committing transaction");

        let transaction = self
            .transactions
            .lock()
            .await
            .remove(&transaction_id)
            .ok_or(BridgeError::TransactionNotFound(transaction_id.0))?;

        transaction
            .commit()
            .await
            .map_err(|e| Self::map_error("Commit transaction failed", e))
    }

    async fn rollback_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        debug!(
            transaction_id = transaction_id.0,
            "Rolling back transaction"
        );

        let transaction = self
            .transactions
            .lock()
            .await
            .remove(&transaction_id)
            .ok_or(BridgeError::TransactionNotFound(transaction_id.0))?;

        transaction
            .rollback()
            .await
            .map_err(|e| Self::map_error("Rollback transaction failed", e))
    }

    async fn query_in_transaction(
        &self,
        transaction_id: TransactionId,
        query: &str,
        params: &[QueryValue],
    ) -> Result<Vec<QueryRow>> {
        debug!(
            transaction_id = transaction_id.0,
            query = %query,
            param_count = params.len(),
            "Executing query in transaction"
        );

        let mut transactions = self.transactions.lock().await;
        let transaction = transactions
            .get_mut(&transaction_id)
            .ok_or(BridgeError::TransactionNotFound(transaction_id.0))?;

        let rows = Self::bind_params(sqlx::query(query), params)
            .fetch_all(&mut **transaction)
            .await
            .map_err(|e| Self::map_error("Query failed", e))?;

        Ok(rows.iter().map(Self::row_to_query_row).collect())
    }

    async fn execute_in_transaction(
        &self,
        transaction_id: TransactionId,
        statement: &str,
        params: &[QueryValue],
    ) -> Result<u64> {
        debug!(
            transaction_id = transaction_id.0,
            statement = %statement,
            param_count = params.len(),
            "Executing statement in transaction"
        );

        let mut transactions = self.transactions.lock().await;
        let transaction = transactions
            .get_mut(&transaction_id)
            .ok_or(BridgeError::TransactionNotFound(transaction_id.0))?;

        let result = Self::bind_params(sqlx::query(statement), params)
            .execute(&mut **transaction)
            .await
            .map_err(|e| Self::map_error("Execute failed", e))?;

        Ok(result.rows_affected())
    }

    async fn get_statistics(&self) -> Result<DatabaseStatistics> {
        let total_connections = self.pool.size();
        let idle_connections = self.pool.num_idle() as u32;
        let active_connections = total_connections.saturating_sub(idle_connections);

        Ok(DatabaseStatistics {
            total_connections,
            idle_connections,
            active_connections,
            open_transactions: self.transactions.lock().await.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::connect(DatabaseConfig::in_memory())
            .await
            .unwrap();
        adapter
            .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT UNIQUE)", &[])
            .await
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_health_check() {
        let adapter = SqliteAdapter::connect_lazy(DatabaseConfig::in_memory()).unwrap();
        assert!(adapter.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let result = SqliteAdapter::connect_lazy(DatabaseConfig::from_url("sqlite://worklog.db?mode=bogus"));
        assert!(matches!(result, Err(BridgeError::DatabaseError(_))));
    }

    #[tokio::test]
    async fn test_query_values() {
        let adapter = create_test_adapter().await;
        let rows = adapter
            .query("SELECT 1 AS a, 2.5 AS b, 'x' AS c, NULL AS d", &[])
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("a"), Some(&QueryValue::Integer(1)));
        assert_eq!(rows[0].get("b"), Some(&QueryValue::Real(2.5)));
        assert_eq!(rows[0].get("c"), Some(&QueryValue::Text("x".to_string())));
        assert_eq!(rows[0].get("d"), Some(&QueryValue::Null));
    }

    #[tokio::test]
    async fn test_unique_violation_is_a_constraint_violation() {
        let adapter = create_test_adapter().await;
        let params = vec![QueryValue::Integer(1), QueryValue::Text("a".to_string())];
        adapter
            .execute("INSERT INTO test (id, name) VALUES (?, ?)", &params)
            .await
            .unwrap();

        let params = vec![QueryValue::Integer(2), QueryValue::Text("a".to_string())];
        let err = adapter
            .execute("INSERT INTO test (id, name) VALUES (?, ?)", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let adapter = create_test_adapter().await;

        let tx_id = adapter.begin_transaction().await.unwrap();
        let params = vec![QueryValue::Integer(1), QueryValue::Text("a".to_string())];
        adapter
            .execute_in_transaction(tx_id, "INSERT INTO test (id, name) VALUES (?, ?)", &params)
            .await
            .unwrap();

        let rows = adapter
            .query_in_transaction(tx_id, "SELECT * FROM test", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(adapter.get_statistics().await.unwrap().open_transactions, 1);

        adapter.rollback_transaction(tx_id).await.unwrap();

        let rows = adapter.query("SELECT * FROM test", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let adapter = create_test_adapter().await;

        let tx_id = adapter.begin_transaction().await.unwrap();
        let params = vec![QueryValue::Integer(1), QueryValue::Text("a".to_string())];
        adapter
            .execute_in_transaction(tx_id, "INSERT INTO test (id, name) VALUES (?, ?)", &params)
            .await
            .unwrap();
        adapter.commit_transaction(tx_id).await.unwrap();

        let rows = adapter.query("SELECT * FROM test", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let adapter = create_test_adapter().await;
        let err = adapter
            .commit_transaction(TransactionId(999))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransactionNotFound(999)));
    }

    #[tokio::test]
    async fn test_get_statistics() {
        let adapter = create_test_adapter().await;
        let stats = adapter.get_statistics().await.unwrap();

        assert!(stats.total_connections > 0);
        assert_eq!(stats.open_transactions, 0);
    }
}
