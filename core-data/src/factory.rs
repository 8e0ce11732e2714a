//! Repository factory
//!
//! A [`RepositoryFactory`] is one unit of work. It owns the master/slave
//! session pair, hands out [`Repository`] instances bound to it, controls the
//! master transaction and runs the save protocol that keeps the slave's
//! tracker in step with what was just written to the master database.
//!
//! ## Save protocol
//!
//! 1. Instances the slave tracks as `Unchanged` are forced to `Unchanged` in
//!    the master, so shared graphs are not written as new or dirty.
//! 2. The master session saves. A failure propagates and nothing below runs.
//! 3. With a single session the result is returned right away.
//! 4. Otherwise both sessions switch cascade timings to `OnSaveChanges`, the
//!    slave accepts its pending entries as persisted (deleted ones are
//!    detached) and every master entry is detached.
//!
//! The slave database is never written; replication is expected to catch up.

use crate::entity::{ActorId, Entity};
use crate::error::{DataError, Result};
use crate::ingress::{SessionIngress, SessionSource};
use crate::repository::Repository;
use crate::session::Session;
use crate::tracker::{CascadeTiming, EntityState};
use async_trait::async_trait;
use bridge_traits::database::QueryValue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Master transaction control
#[async_trait]
pub trait RepositoryTransaction: Send + Sync {
    /// Begin a transaction on the master session unless one is active
    async fn start_transaction(&self) -> Result<()>;

    /// Commit the active master transaction; no-op without one
    async fn commit_transaction(&self) -> Result<()>;

    /// Roll back the active master transaction; no-op without one
    async fn abort_transaction(&self) -> Result<()>;
}

/// Something the factory disposes together with itself
pub(crate) trait DisposableRepository: Send + Sync {
    fn entity_name(&self) -> &'static str;
    fn dispose(&self) -> Result<()>;
}

/// One unit of work over the master/slave session pair.
///
/// Prefer [`RepositoryFactory::dispose`] over dropping a factory with an open
/// transaction: drop can only spawn the rollback onto the current runtime,
/// and the task is lost if that runtime shuts down first.
pub struct RepositoryFactory {
    ingress: SessionIngress,
    repositories: Mutex<Vec<Arc<dyn DisposableRepository>>>,
    actor: ActorId,
    disposed: AtomicBool,
}

impl RepositoryFactory {
    /// A factory stamping audit columns with [`ActorId::ANONYMOUS`]
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        Self::with_actor(source, ActorId::ANONYMOUS)
    }

    pub fn with_actor(source: Arc<dyn SessionSource>, actor: ActorId) -> Self {
        debug!(actor = %actor, "Repository factory created");
        Self {
            ingress: SessionIngress::new(source),
            repositories: Mutex::new(Vec::new()),
            actor,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DataError::Disposed("repository factory".to_string()));
        }
        Ok(())
    }

    /// The session writes are staged in
    pub fn master(&self) -> Result<Arc<Session>> {
        self.ingress.master()
    }

    /// The session reads are served from; the master itself when no replica
    /// is registered
    pub fn slave(&self) -> Result<Arc<Session>> {
        self.ingress.slave()
    }

    pub fn is_master_same_as_slave(&self) -> Result<bool> {
        Ok(self.master()?.id() == self.slave()?.id())
    }

    /// Create a repository for `T` bound to this factory's sessions.
    ///
    /// # Errors
    ///
    /// - [`DataError::Disposed`] if the factory is disposed
    /// - [`DataError::Configuration`] if no master is registered
    /// - [`DataError::UnmappedEntity`] if `T` is not in the model
    pub fn create<T: Entity>(&self) -> Result<Repository<T>> {
        self.ensure_active()?;
        let master = self.master()?;
        let slave = self.slave()?;
        master.registry().map::<T>()?;

        let repository = Repository::new(master, slave);
        self.repositories.lock().push(repository.disposable());
        debug!(entity = T::TABLE, "Repository created");
        Ok(repository)
    }

    /// Number of repositories awaiting disposal
    pub fn repository_count(&self) -> usize {
        self.repositories.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn register_disposable(&self, disposable: Arc<dyn DisposableRepository>) {
        self.repositories.lock().push(disposable);
    }

    /// Save with the factory's actor. Returns the number of entries written
    /// to the master database.
    pub async fn save_changes(&self) -> Result<usize> {
        self.save_changes_as(self.actor).await
    }

    /// Save, stamping audit columns with `actor`.
    ///
    /// # Errors
    ///
    /// Any failure of the master save is returned as is; the slave tracker is
    /// then left exactly as it was.
    #[instrument(skip(self))]
    pub async fn save_changes_as(&self, actor: ActorId) -> Result<usize> {
        self.ensure_active()?;
        let master = self.master()?;
        let slave = self.slave()?;
        let same_session = master.id() == slave.id();

        if !same_session {
            for object in slave.unchanged_objects() {
                master.set_object_state(&object, EntityState::Unchanged)?;
            }
        }

        let affected = master.save_changes(actor).await?;

        if same_session {
            debug!(affected, "Changes saved");
            return Ok(affected);
        }

        for session in [&master, &slave] {
            session.set_cascade_delete_timing(CascadeTiming::OnSaveChanges);
            session.set_delete_orphans_timing(CascadeTiming::OnSaveChanges);
        }
        slave.accept_all_changes();
        let detached = master.detach_all();

        info!(affected, detached, "Changes saved and replica tracker reconciled");
        Ok(affected)
    }

    /// A positional parameter for [`execute_sql_command`](Self::execute_sql_command)
    pub fn create_parameter(&self, value: impl Into<QueryValue>) -> QueryValue {
        value.into()
    }

    /// Run a raw statement against the master database, inside the active
    /// transaction if any. Returns the number of affected rows.
    pub async fn execute_sql_command(&self, sql: &str, params: &[QueryValue]) -> Result<u64> {
        self.ensure_active()?;
        if sql.trim().is_empty() {
            return Err(DataError::invalid_argument("sql", "SQL command cannot be empty"));
        }
        self.master()?.execute(sql, params).await
    }

    fn dispose_repositories(&self) {
        let repositories = std::mem::take(&mut *self.repositories.lock());
        for repository in repositories {
            if let Err(e) = repository.dispose() {
                warn!(
                    entity = repository.entity_name(),
                    error = %e,
                    "Failed to dispose repository"
                );
            }
        }
    }

    fn dispose_sessions(&self) {
        if let Some(slave) = self.ingress.slave_if_resolved() {
            slave.dispose();
        }
        if let Some(master) = self.ingress.master_if_resolved() {
            master.dispose();
        }
    }

    /// Dispose every created repository, roll back a dangling master
    /// transaction and dispose both sessions. Idempotent; never fails.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.dispose_repositories();
        if let Some(master) = self.ingress.master_if_resolved() {
            if master.has_active_transaction() {
                warn!("Rolling back transaction left open at disposal");
                if let Err(e) = master.rollback_transaction().await {
                    warn!(error = %e, "Failed to roll back transaction at disposal");
                }
            }
        }
        self.dispose_sessions();
        debug!("Repository factory disposed");
    }
}

#[async_trait]
impl RepositoryTransaction for RepositoryFactory {
    async fn start_transaction(&self) -> Result<()> {
        self.ensure_active()?;
        let master = self.master()?;
        if master.has_active_transaction() {
            debug!("Transaction already active");
            return Ok(());
        }
        master.begin_transaction().await?;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.ensure_active()?;
        if let Some(master) = self.ingress.master_if_resolved() {
            master.commit_transaction().await?;
        }
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        self.ensure_active()?;
        if let Some(master) = self.ingress.master_if_resolved() {
            master.rollback_transaction().await?;
        }
        Ok(())
    }
}

impl Drop for RepositoryFactory {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.dispose_repositories();
        if let Some(master) = self.ingress.master_if_resolved() {
            if master.has_active_transaction() {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        warn!("Transaction left open at drop, rolling back in the background");
                        handle.spawn(async move {
                            if let Err(e) = master.rollback_transaction().await {
                                warn!(error = %e, "Failed to roll back transaction at drop");
                            }
                        });
                    }
                    Err(_) => warn!("Transaction left open at drop without a runtime to roll it back"),
                }
            }
        }
        self.dispose_sessions();
    }
}

impl fmt::Debug for RepositoryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryFactory")
            .field("ingress", &self.ingress)
            .field("actor", &self.actor)
            .field("repositories", &self.repository_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
