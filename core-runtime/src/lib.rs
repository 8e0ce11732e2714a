//! # Core Runtime Module
//!
//! Provides the ambient infrastructure the data core depends on:
//! - Logging and tracing infrastructure
//! - Configuration of database roles and entity mapping toggles
//!
//! ## Overview
//!
//! The runtime does not parse application settings files itself. Hosts hand it
//! connection strings per role (or a deserialized [`config::ConnectionSection`])
//! and get back a validated [`config::DataConfig`].

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ConnectionSection, ConnectionSetting, DataConfig, EntityMapSettings};
pub use error::{Error, Result};
