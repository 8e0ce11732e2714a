//! # Host Bridge Traits
//!
//! Contracts between the data core and the outside world.
//!
//! ## Overview
//!
//! The data core owns change tracking and the master/slave synchronization
//! policy, but it never talks to a database directly. Everything it needs from
//! the environment is expressed here:
//!
//! - [`DatabaseAdapter`](database::DatabaseAdapter) - connect, query, execute,
//!   begin/commit/rollback against one physical endpoint
//! - [`NodeType`](database::NodeType) - the role (`Master`/`Slave`) an endpoint plays
//! - [`Clock`](time::Clock) - time source for audit stamps, replaceable in tests
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert driver-specific errors into it and keep constraint
//! violations distinguishable from other failures.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds so one adapter can back the
//! sessions of many concurrent requests.

pub mod database;
pub mod error;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use database::{
    DatabaseAdapter, DatabaseConfig, DatabaseStatistics, NodeType, QueryRow, QueryValue,
    TransactionId,
};
pub use time::{Clock, FixedClock, LogLevel, SystemClock};
