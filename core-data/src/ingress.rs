//! Session resolution
//!
//! [`SessionIngress`] resolves the two database roles of a unit of work on
//! demand and caches them. When no `Slave` role is registered the slave
//! accessor hands back the master session itself, which turns every
//! dual-write path of a [`RepositoryFactory`] into a plain single-session
//! flow.

use crate::adapters::SqliteAdapter;
use crate::entity::ActorId;
use crate::error::{DataError, Result};
use crate::factory::RepositoryFactory;
use crate::mapping::{ModelBuilder, ModelRegistry};
use crate::session::Session;
use bridge_traits::database::{DatabaseAdapter, NodeType};
use bridge_traits::time::{Clock, SystemClock};
use core_runtime::config::DataConfig;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates sessions for the database roles it knows about
pub trait SessionSource: Send + Sync {
    /// A fresh session for `node`, or `None` if the role is not registered
    fn resolve(&self, node: NodeType) -> Option<Session>;
}

/// Standard [`SessionSource`]: one adapter per role plus the shared model
#[derive(Clone)]
pub struct SessionProvider {
    adapters: HashMap<NodeType, Arc<dyn DatabaseAdapter>>,
    registry: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
}

impl SessionProvider {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            adapters: HashMap::new(),
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Register the adapter for a role, replacing any previous one
    pub fn with_adapter(mut self, node: NodeType, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        self.adapters.insert(node, adapter);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build a provider with a lazily connecting [`SqliteAdapter`] per
    /// configured role.
    ///
    /// # Errors
    ///
    /// - [`DataError::Runtime`] if the configuration is invalid
    /// - [`DataError::Configuration`] if the model cannot be built
    /// - [`DataError::Database`] if a connection string cannot be parsed
    pub fn from_config(config: &DataConfig, model: &ModelBuilder) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(model.build(config.entity_map_settings)?);

        let mut provider = Self::new(registry);
        for setting in &config.connections {
            let adapter = SqliteAdapter::connect_lazy(setting.database.clone())?;
            provider = provider.with_adapter(setting.node, Arc::new(adapter));
        }

        info!(
            roles = provider.adapters.len(),
            entities = provider.registry.maps().count(),
            "Session provider configured"
        );
        Ok(provider)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn has_role(&self, node: NodeType) -> bool {
        self.adapters.contains_key(&node)
    }

    /// A factory for one unit of work, stamping audit columns with the
    /// anonymous actor
    pub fn create_factory(&self) -> RepositoryFactory {
        RepositoryFactory::new(Arc::new(self.clone()))
    }

    /// A factory for one unit of work performed by `actor`
    pub fn create_factory_as(&self, actor: ActorId) -> RepositoryFactory {
        RepositoryFactory::with_actor(Arc::new(self.clone()), actor)
    }
}

impl SessionSource for SessionProvider {
    fn resolve(&self, node: NodeType) -> Option<Session> {
        let adapter = self.adapters.get(&node)?;
        Some(Session::new(
            node,
            Arc::clone(adapter),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        ))
    }
}

impl fmt::Debug for SessionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut roles: Vec<&NodeType> = self.adapters.keys().collect();
        roles.sort_by_key(|node| node.as_str());
        f.debug_struct("SessionProvider")
            .field("roles", &roles)
            .finish_non_exhaustive()
    }
}

/// Lazily resolved, cached master and slave sessions
pub struct SessionIngress {
    source: Arc<dyn SessionSource>,
    master: OnceCell<Arc<Session>>,
    slave: OnceCell<Arc<Session>>,
}

impl SessionIngress {
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        Self {
            source,
            master: OnceCell::new(),
            slave: OnceCell::new(),
        }
    }

    /// The master session, resolved on first access.
    ///
    /// # Errors
    ///
    /// [`DataError::Configuration`] if no `Master` role is registered.
    pub fn master(&self) -> Result<Arc<Session>> {
        self.master
            .get_or_try_init(|| {
                let session = self.source.resolve(NodeType::Master).ok_or_else(|| {
                    DataError::Configuration("no Master database is registered".to_string())
                })?;
                debug!(session_id = %session.id(), "Master session resolved");
                Ok(Arc::new(session))
            })
            .map(Arc::clone)
    }

    /// The slave session, resolved on first access. Without a `Slave` role
    /// this is the master session itself.
    ///
    /// # Errors
    ///
    /// [`DataError::Configuration`] if the slave falls back to a master that
    /// is not registered either.
    pub fn slave(&self) -> Result<Arc<Session>> {
        self.slave
            .get_or_try_init(|| match self.source.resolve(NodeType::Slave) {
                Some(session) => {
                    debug!(session_id = %session.id(), "Slave session resolved");
                    Ok(Arc::new(session))
                }
                None => {
                    debug!("No Slave database registered, falling back to Master");
                    self.master()
                }
            })
            .map(Arc::clone)
    }

    /// The master session if it has been resolved already
    pub fn master_if_resolved(&self) -> Option<Arc<Session>> {
        self.master.get().cloned()
    }

    /// The slave session if it has been resolved already
    pub fn slave_if_resolved(&self) -> Option<Arc<Session>> {
        self.slave.get().cloned()
    }
}

impl fmt::Debug for SessionIngress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIngress")
            .field("master", &self.master.get().map(|session| session.id()))
            .field("slave", &self.slave.get().map(|session| session.id()))
            .finish()
    }
}
