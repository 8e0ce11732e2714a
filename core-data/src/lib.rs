//! # Data Core
//!
//! Unit-of-work persistence over a master/slave database pair.
//!
//! ## Overview
//!
//! This module provides:
//! - Entity contract, explicit entity maps and a model registry
//! - Sessions with change tracking and identity resolution
//! - A repository factory that stages writes in the master session while
//!   sourcing originals from the slave, and reconciles the slave's tracker
//!   after each save
//! - Lazy, filterable queries with pagination
//! - A native SQLite adapter built on `sqlx`
//!
//! ## Example
//!
//! ```no_run
//! use bridge_traits::database::DatabaseConfig;
//! use core_data::entity::{Entity, EntityBase, EntityHandle, PropertyValues, PropertyValuesExt};
//! use core_data::mapping::{ColumnType, EntityMapBuilder, ModelBuilder};
//! use core_data::{Filter, SessionProvider};
//! use core_runtime::config::DataConfig;
//!
//! #[derive(Debug)]
//! struct Project {
//!     base: EntityBase,
//!     name: String,
//! }
//!
//! impl Entity for Project {
//!     const TABLE: &'static str = "Project";
//!
//!     fn configure(map: &mut EntityMapBuilder) {
//!         map.property("Name", ColumnType::Text).required();
//!     }
//!
//!     fn base(&self) -> &EntityBase {
//!         &self.base
//!     }
//!
//!     fn base_mut(&mut self) -> &mut EntityBase {
//!         &mut self.base
//!     }
//!
//!     fn write_values(&self, values: &mut PropertyValues) {
//!         values.insert("Name".to_string(), self.name.as_str().into());
//!     }
//!
//!     fn from_values(base: EntityBase, values: &PropertyValues) -> core_data::Result<Self> {
//!         Ok(Self { base, name: values.get_string("Name")? })
//!     }
//! }
//!
//! # async fn run() -> core_data::Result<()> {
//! let config = DataConfig::builder()
//!     .master(DatabaseConfig::new("/var/lib/worklog/master.db"))
//!     .slave(DatabaseConfig::new("/var/lib/worklog/replica.db"))
//!     .build()?;
//! let provider = SessionProvider::from_config(&config, &ModelBuilder::new().entity::<Project>())?;
//!
//! let factory = provider.create_factory();
//! let projects = factory.create::<Project>()?;
//! projects.create(&EntityHandle::new(Project { base: EntityBase::new(1), name: "Atlas".into() }))?;
//! factory.save_changes().await?;
//!
//! let atlas = projects.read_where(Filter::eq("Name", "Atlas")).await?;
//! assert_eq!(atlas.len(), 1);
//! factory.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod entity;
pub mod error;
pub mod factory;
pub mod filter;
pub mod ingress;
pub mod mapping;
pub mod pagination;
pub mod query;
pub mod repository;
pub mod session;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use adapters::SqliteAdapter;
pub use entity::{ActorId, Entity, EntityBase, EntityHandle, Navigation};
pub use error::{DataError, Result};
pub use factory::{RepositoryFactory, RepositoryTransaction};
pub use filter::Filter;
pub use ingress::{SessionIngress, SessionProvider, SessionSource};
pub use mapping::{ModelBuilder, ModelRegistry};
pub use pagination::{Page, PageRequest};
pub use query::Query;
pub use repository::Repository;
pub use session::Session;
pub use tracker::{CascadeTiming, EntityState, EntrySnapshot};
