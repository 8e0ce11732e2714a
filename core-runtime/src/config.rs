//! # Data Configuration Module
//!
//! Provides the configuration surface consumed when the data core is wired up.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a [`DataConfig`]
//! holding:
//! - one [`ConnectionSetting`] per database role (`Master`, optionally `Slave`)
//! - the [`EntityMapSettings`] toggles that drop audit columns from every map
//!
//! Validation is fail-fast at [`DataConfigBuilder::build`]. A configuration
//! without a `Master` role is still accepted here: the data core reports it the
//! first time a master session is requested.
//!
//! ## Usage
//!
//! ### Explicit roles
//!
//! ```
//! use bridge_traits::database::DatabaseConfig;
//! use core_runtime::config::DataConfig;
//!
//! let config = DataConfig::builder()
//!     .master(DatabaseConfig::new("/var/lib/worklog/master.db"))
//!     .slave(DatabaseConfig::new("/var/lib/worklog/replica.db"))
//!     .build()
//!     .expect("valid configuration");
//!
//! assert_eq!(config.connections.len(), 2);
//! ```
//!
//! ### From an application settings section
//!
//! ```
//! use core_runtime::config::{ConnectionSection, DataConfig};
//!
//! let section = ConnectionSection::from_json(
//!     r#"{ "Master": { "Connection": "sqlite::memory:" } }"#,
//! )
//! .expect("valid json");
//!
//! let config = DataConfig::builder()
//!     .connection_section(&section)
//!     .build()
//!     .expect("valid configuration");
//!
//! assert!(config.connection(bridge_traits::NodeType::Slave).is_none());
//! ```

use crate::error::{Error, Result};
use bridge_traits::database::{DatabaseConfig, NodeType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Toggles that remove audit columns from every entity map.
///
/// An ignored column is neither mapped, persisted, nor stamped on save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EntityMapSettings {
    pub ignore_creator_id: bool,
    pub ignore_creation_date: bool,
    pub ignore_modifier_id: bool,
    pub ignore_modification_date: bool,
}

impl EntityMapSettings {
    /// Settings that keep every audit column
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_creator_id(mut self, ignore: bool) -> Self {
        self.ignore_creator_id = ignore;
        self
    }

    pub fn with_ignore_creation_date(mut self, ignore: bool) -> Self {
        self.ignore_creation_date = ignore;
        self
    }

    pub fn with_ignore_modifier_id(mut self, ignore: bool) -> Self {
        self.ignore_modifier_id = ignore;
        self
    }

    pub fn with_ignore_modification_date(mut self, ignore: bool) -> Self {
        self.ignore_modification_date = ignore;
        self
    }
}

/// Connection settings for one database role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSetting {
    pub node: NodeType,
    pub database: DatabaseConfig,
}

/// One entry of an application's connection section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionEntry {
    /// Connection string for the role
    pub connection: String,
}

/// Role name to connection string, as found in application settings
///
/// ```json
/// {
///   "Master": { "Connection": "sqlite:/var/lib/worklog/master.db" },
///   "Slave":  { "Connection": "sqlite:/var/lib/worklog/replica.db" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionSection(pub BTreeMap<String, ConnectionEntry>);

impl ConnectionSection {
    /// Parse a connection section from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid connection section: {}", e)))
    }

    /// Add or replace the connection string of a role
    pub fn insert(&mut self, role: impl Into<String>, connection: impl Into<String>) {
        self.0.insert(
            role.into(),
            ConnectionEntry {
                connection: connection.into(),
            },
        );
    }
}

/// Configuration of the data core.
///
/// Use [`DataConfig::builder`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConfig {
    /// Configured database roles, at most one per [`NodeType`]
    pub connections: Vec<ConnectionSetting>,

    /// Audit column toggles applied to every entity map
    pub entity_map_settings: EntityMapSettings,
}

impl DataConfig {
    /// Creates a new builder for constructing a `DataConfig`.
    pub fn builder() -> DataConfigBuilder {
        DataConfigBuilder::default()
    }

    /// Connection settings registered for a role, if any
    pub fn connection(&self, node: NodeType) -> Option<&ConnectionSetting> {
        self.connections.iter().find(|setting| setting.node == node)
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - At least one connection is configured
    /// - No role is configured twice
    /// - Every connection string is non-empty
    /// - Pool sizes are consistent
    pub fn validate(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(Error::Config(
                "At least one database connection must be configured".to_string(),
            ));
        }

        for (index, setting) in self.connections.iter().enumerate() {
            if self.connections[..index]
                .iter()
                .any(|other| other.node == setting.node)
            {
                return Err(Error::Config(format!(
                    "Database role {} is configured more than once",
                    setting.node
                )));
            }

            let database = &setting.database;
            if database.database_url.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Connection string for {} cannot be empty",
                    setting.node
                )));
            }

            if database.max_connections == 0 {
                return Err(Error::Config(format!(
                    "Max connections for {} must be greater than 0",
                    setting.node
                )));
            }

            if database.min_connections > database.max_connections {
                return Err(Error::Config(format!(
                    "Min connections for {} exceeds max connections ({} > {})",
                    setting.node, database.min_connections, database.max_connections
                )));
            }
        }

        Ok(())
    }
}

/// Builder for constructing [`DataConfig`] instances.
///
/// Role names given as strings are parsed at [`build()`](DataConfigBuilder::build)
/// so the builder chain itself never fails.
#[derive(Debug, Default)]
pub struct DataConfigBuilder {
    connections: Vec<(String, DatabaseConfig)>,
    entity_map_settings: EntityMapSettings,
}

impl DataConfigBuilder {
    /// Sets the master (read-write) database.
    pub fn master(self, database: DatabaseConfig) -> Self {
        self.connection(NodeType::Master, database)
    }

    /// Sets the slave (read replica) database.
    pub fn slave(self, database: DatabaseConfig) -> Self {
        self.connection(NodeType::Slave, database)
    }

    /// Registers a database for a role.
    pub fn connection(mut self, node: NodeType, database: DatabaseConfig) -> Self {
        self.connections.push((node.as_str().to_string(), database));
        self
    }

    /// Registers a connection string for a role given by name.
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::DataConfig;
    ///
    /// let config = DataConfig::builder()
    ///     .connection_string("Master", "sqlite::memory:")
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.connections.len(), 1);
    /// ```
    pub fn connection_string(mut self, role: impl Into<String>, url: impl Into<String>) -> Self {
        self.connections
            .push((role.into(), DatabaseConfig::from_url(url)));
        self
    }

    /// Registers every role of a connection section.
    pub fn connection_section(mut self, section: &ConnectionSection) -> Self {
        for (role, entry) in &section.0 {
            self = self.connection_string(role.clone(), entry.connection.clone());
        }
        self
    }

    /// Sets the entity map toggles.
    pub fn entity_map_settings(mut self, settings: EntityMapSettings) -> Self {
        self.entity_map_settings = settings;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a role name is unknown or
    /// [`DataConfig::validate`] fails.
    pub fn build(self) -> Result<DataConfig> {
        let connections = self
            .connections
            .into_iter()
            .map(|(role, database)| {
                let node = role.parse::<NodeType>().map_err(|e| {
                    Error::Config(format!("Invalid database role '{}': {}", role, e))
                })?;
                Ok(ConnectionSetting { node, database })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = DataConfig {
            connections,
            entity_map_settings: self.entity_map_settings,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_with_master_and_slave() {
        let config = DataConfig::builder()
            .master(DatabaseConfig::new("master.db"))
            .slave(DatabaseConfig::new("replica.db"))
            .build()
            .unwrap();

        assert_eq!(
            config.connection(NodeType::Master).unwrap().database.database_url,
            "sqlite:master.db"
        );
        assert_eq!(
            config.connection(NodeType::Slave).unwrap().database.database_url,
            "sqlite:replica.db"
        );
        assert_eq!(config.entity_map_settings, EntityMapSettings::default());
    }

    #[test]
    fn test_builder_requires_a_connection() {
        let result = DataConfig::builder().build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_accepts_slave_only() {
        // A missing master is reported lazily by the data core.
        let config = DataConfig::builder()
            .slave(DatabaseConfig::in_memory())
            .build()
            .unwrap();
        assert!(config.connection(NodeType::Master).is_none());
    }

    #[test]
    fn test_builder_rejects_duplicate_roles() {
        let result = DataConfig::builder()
            .master(DatabaseConfig::in_memory())
            .connection_string("master", "sqlite::memory:")
            .build();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_builder_rejects_unknown_role() {
        let result = DataConfig::builder()
            .connection_string("Replica", "sqlite::memory:")
            .build();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Replica"));
    }

    #[test]
    fn test_builder_rejects_empty_url() {
        let result = DataConfig::builder().connection_string("Master", "  ").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_pool_sizes() {
        let mut database = DatabaseConfig::in_memory();
        database.min_connections = 4;
        database.max_connections = 2;

        let result = DataConfig::builder().master(database).build();
        assert!(result.unwrap_err().to_string().contains("exceeds"));
    }

    #[test]
    fn test_connection_section_from_json() {
        let section = ConnectionSection::from_json(
            r#"{
                "Master": { "Connection": "sqlite:master.db" },
                "Slave": { "Connection": "sqlite:replica.db" }
            }"#,
        )
        .unwrap();

        let config = DataConfig::builder()
            .connection_section(&section)
            .build()
            .unwrap();

        assert_eq!(config.connections.len(), 2);
        assert_eq!(
            config.connection(NodeType::Slave).unwrap().database.database_url,
            "sqlite:replica.db"
        );
    }

    #[test]
    fn test_connection_section_invalid_json() {
        assert!(ConnectionSection::from_json("{ not json").is_err());
    }

    #[test]
    fn test_entity_map_settings_deserialize() {
        let settings: EntityMapSettings =
            serde_json::from_str(r#"{ "IgnoreCreatorId": true, "IgnoreModificationDate": true }"#)
                .unwrap();

        assert_eq!(
            settings,
            EntityMapSettings::new()
                .with_ignore_creator_id(true)
                .with_ignore_modification_date(true)
        );
    }
}
