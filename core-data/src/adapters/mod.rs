//! Database adapter implementations
//!
//! Concrete [`DatabaseAdapter`](bridge_traits::database::DatabaseAdapter)
//! implementations a [`SessionProvider`](crate::ingress::SessionProvider) can
//! be built with.

pub mod sqlite_native;

pub use sqlite_native::SqliteAdapter;
