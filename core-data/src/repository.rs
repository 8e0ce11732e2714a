//! Per-entity repository
//!
//! Reads are served by the slave session. Writes are staged in the master
//! session, which is the one that will issue the statements. When the two
//! sessions differ, the originals and state the master writes with are taken
//! from the slave, which holds the last synchronised view of each instance.
//! There is no conflict detection across the pair: the last writer wins.

use crate::entity::{columns, object_address, Entity, EntityHandle, TrackedObject};
use crate::error::{DataError, Result};
use crate::factory::DisposableRepository;
use crate::filter::Filter;
use crate::query::Query;
use crate::session::Session;
use crate::tracker::EntityState;
use bridge_traits::database::QueryValue;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Disposal flag shared between a repository and its factory
struct RepositoryState {
    entity: &'static str,
    disposed: AtomicBool,
}

impl DisposableRepository for RepositoryState {
    fn entity_name(&self) -> &'static str {
        self.entity
    }

    fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(DataError::Cancelled);
    }
    Ok(())
}

/// CRUD and query routing for one entity type.
///
/// Created by [`RepositoryFactory::create`](crate::factory::RepositoryFactory::create).
/// The `*_cancellable` variants only check their token on entry; a database
/// call already in flight is not interrupted.
pub struct Repository<T: Entity> {
    master: Arc<Session>,
    slave: Arc<Session>,
    is_master_same_as_slave: bool,
    state: Arc<RepositoryState>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    pub(crate) fn new(master: Arc<Session>, slave: Arc<Session>) -> Self {
        let is_master_same_as_slave = master.id() == slave.id();
        Self {
            master,
            slave,
            is_master_same_as_slave,
            state: Arc::new(RepositoryState {
                entity: T::TABLE,
                disposed: AtomicBool::new(false),
            }),
            _entity: PhantomData,
        }
    }

    pub(crate) fn disposable(&self) -> Arc<dyn DisposableRepository> {
        Arc::clone(&self.state) as Arc<dyn DisposableRepository>
    }

    pub fn is_master_same_as_slave(&self) -> bool {
        self.is_master_same_as_slave
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Mark the repository disposed. Idempotent. The sessions belong to the
    /// factory and stay open.
    pub fn dispose(&self) {
        self.state.disposed.store(true, Ordering::SeqCst);
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DataError::Disposed(format!("repository of {}", T::TABLE)));
        }
        Ok(())
    }

    /// Reject filters that cannot be rendered for `T`
    fn checked(&self, filter: Filter) -> Result<Filter> {
        let map = self.slave.registry().map::<T>()?;
        filter.render(Some(map))?;
        Ok(filter)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Lazy query over every row
    pub fn query(&self) -> Result<Query<T>> {
        self.ensure_active()?;
        Ok(Query::table(Arc::clone(&self.slave)))
    }

    /// Lazy query over the rows matching `filter`
    pub fn query_where(&self, filter: Filter) -> Result<Query<T>> {
        let filter = self.checked(filter)?;
        Ok(self.query()?.filter(filter))
    }

    /// Lazy query over the rows of a caller supplied `SELECT`
    pub fn from_sql(&self, sql: &str, params: Vec<QueryValue>) -> Result<Query<T>> {
        self.ensure_active()?;
        if sql.trim().is_empty() {
            return Err(DataError::invalid_argument("sql", "SQL query cannot be empty"));
        }
        Ok(Query::sql(Arc::clone(&self.slave), sql.to_string(), params))
    }

    pub async fn read(&self) -> Result<Vec<EntityHandle<T>>> {
        self.query()?.to_list().await
    }

    pub async fn read_where(&self, filter: Filter) -> Result<Vec<EntityHandle<T>>> {
        self.query_where(filter)?.to_list().await
    }

    /// Whether every row satisfies `filter`
    pub async fn all(&self, filter: Filter) -> Result<bool> {
        let filter = self.checked(filter)?;
        self.query()?.all(&filter).await
    }

    pub async fn any(&self) -> Result<bool> {
        self.query()?.any().await
    }

    pub async fn any_where(&self, filter: Filter) -> Result<bool> {
        self.query_where(filter)?.any().await
    }

    pub async fn count(&self) -> Result<i64> {
        self.query()?.count().await
    }

    pub async fn count_where(&self, filter: Filter) -> Result<i64> {
        self.query_where(filter)?.count().await
    }

    /// Whether a row with the instance's id exists
    pub async fn exists(&self, handle: &EntityHandle<T>) -> Result<bool> {
        self.any_where(Filter::eq(columns::ID, handle.id())).await
    }

    pub async fn exists_where(&self, filter: Filter) -> Result<bool> {
        self.any_where(filter).await
    }

    pub async fn exists_cancellable(
        &self,
        handle: &EntityHandle<T>,
        token: &CancellationToken,
    ) -> Result<bool> {
        check_cancelled(token)?;
        self.exists(handle).await
    }

    pub async fn exists_where_cancellable(
        &self,
        filter: Filter,
        token: &CancellationToken,
    ) -> Result<bool> {
        check_cancelled(token)?;
        self.exists_where(filter).await
    }

    pub async fn read_cancellable(&self, token: &CancellationToken) -> Result<Vec<EntityHandle<T>>> {
        check_cancelled(token)?;
        self.read().await
    }

    pub async fn read_where_cancellable(
        &self,
        filter: Filter,
        token: &CancellationToken,
    ) -> Result<Vec<EntityHandle<T>>> {
        check_cancelled(token)?;
        self.read_where(filter).await
    }

    pub async fn query_cancellable(&self, token: &CancellationToken) -> Result<Query<T>> {
        check_cancelled(token)?;
        self.query()
    }

    pub async fn query_where_cancellable(
        &self,
        filter: Filter,
        token: &CancellationToken,
    ) -> Result<Query<T>> {
        check_cancelled(token)?;
        self.query_where(filter)
    }

    pub async fn from_sql_cancellable(
        &self,
        sql: &str,
        params: Vec<QueryValue>,
        token: &CancellationToken,
    ) -> Result<Query<T>> {
        check_cancelled(token)?;
        self.from_sql(sql, params)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Stage an insert. The same instance is tracked `Added` by both
    /// sessions.
    ///
    /// # Errors
    ///
    /// - [`DataError::InvalidArgument`] if the instance has no id yet
    /// - [`DataError::IdentityConflict`] if another instance with the same id
    ///   is already tracked
    pub fn create(&self, handle: &EntityHandle<T>) -> Result<()> {
        self.ensure_active()?;
        let id = handle.id();
        if id == 0 {
            return Err(DataError::invalid_argument(
                "entity",
                format!("{} must have an id assigned before it is created", T::TABLE),
            ));
        }

        self.master.set_state(handle, EntityState::Added)?;
        if !self.is_master_same_as_slave {
            self.slave.set_state(handle, EntityState::Added)?;
        }
        debug!(entity = T::TABLE, id, "Create staged");
        Ok(())
    }

    /// Stage a delete. The slave entry is marked first and the master copies
    /// its originals and state. Always returns `true`.
    pub fn delete(&self, handle: &EntityHandle<T>) -> Result<bool> {
        self.ensure_active()?;
        self.delete_object(&handle.tracked())?;
        debug!(entity = T::TABLE, id = handle.id(), "Delete staged");
        Ok(true)
    }

    fn delete_object(&self, object: &Arc<dyn TrackedObject>) -> Result<()> {
        self.slave.set_object_state(object, EntityState::Deleted)?;
        if self.is_master_same_as_slave {
            return Ok(());
        }

        match self.slave.observe_object(object) {
            Some((original, state)) => self.master.mirror_object(object, Some(original), state),
            // A slave entry that was only Added is gone now
            None => self
                .master
                .mirror_object(object, None, EntityState::Detached),
        }
    }

    /// Stage a delete of every row matching `filter`, as read from the slave.
    /// Returns `false` if nothing matched.
    pub async fn delete_where(&self, filter: Filter) -> Result<bool> {
        let matches = self.read_where(filter).await?;
        if matches.is_empty() {
            debug!(entity = T::TABLE, "Delete matched no rows");
            return Ok(false);
        }

        for handle in &matches {
            self.delete_object(&handle.tracked())?;
        }
        debug!(entity = T::TABLE, count = matches.len(), "Deletes staged");
        Ok(true)
    }

    /// Stage an update of the instance and every instance reachable through
    /// its navigations. Always returns `true`.
    pub fn update(&self, handle: &EntityHandle<T>) -> Result<bool> {
        self.update_with(handle, |_| {})
    }

    /// Apply `mutator` in place, then stage the update.
    ///
    /// Nodes the master already tracks are left alone together with
    /// everything reachable only through them. Every other node takes the
    /// slave's originals and state, or is marked `Modified` with its current
    /// values as originals when the slave does not know it either.
    ///
    /// `mutator` runs under the instance's write lock and must not call back
    /// into a repository. It must not change the `Id`; a changed key is put
    /// back and the call fails with [`DataError::InvalidArgument`].
    pub fn update_with<F>(&self, handle: &EntityHandle<T>, mutator: F) -> Result<bool>
    where
        F: FnOnce(&mut T),
    {
        self.ensure_active()?;
        {
            let mut entity = handle.write();
            let id = entity.base().id;
            mutator(&mut *entity);
            if entity.base().id != id {
                entity.base_mut().id = id;
                return Err(DataError::invalid_argument(
                    columns::ID,
                    format!("the key of {} {} cannot be changed by an update", T::TABLE, id),
                ));
            }
        }

        let mut visited = HashSet::new();
        let mut pending = VecDeque::from([handle.tracked()]);
        let mut staged = 0usize;

        while let Some(object) = pending.pop_front() {
            if !visited.insert(object_address(&object)) {
                continue;
            }
            if self.master.is_tracking_object(&object) {
                continue;
            }

            self.stage_update(&object)?;
            staged += 1;
            pending.extend(
                object
                    .navigations()
                    .into_iter()
                    .map(|navigation| navigation.into_target()),
            );
        }

        debug!(entity = T::TABLE, id = handle.id(), staged, "Update staged");
        Ok(true)
    }

    fn stage_update(&self, object: &Arc<dyn TrackedObject>) -> Result<()> {
        if !self.is_master_same_as_slave {
            if let Some((original, state)) = self.slave.observe_object(object) {
                return self.master.mirror_object(object, Some(original), state);
            }
        }
        self.master
            .mirror_object(object, None, EntityState::Modified)
    }

    pub async fn create_cancellable(
        &self,
        handle: &EntityHandle<T>,
        token: &CancellationToken,
    ) -> Result<()> {
        check_cancelled(token)?;
        self.create(handle)
    }

    pub async fn delete_cancellable(
        &self,
        handle: &EntityHandle<T>,
        token: &CancellationToken,
    ) -> Result<bool> {
        check_cancelled(token)?;
        self.delete(handle)
    }

    pub async fn delete_where_cancellable(
        &self,
        filter: Filter,
        token: &CancellationToken,
    ) -> Result<bool> {
        check_cancelled(token)?;
        self.delete_where(filter).await
    }

    pub async fn update_cancellable<F>(
        &self,
        handle: &EntityHandle<T>,
        mutator: F,
        token: &CancellationToken,
    ) -> Result<bool>
    where
        F: FnOnce(&mut T),
    {
        check_cancelled(token)?;
        self.update_with(handle, mutator)
    }
}

impl<T: Entity> fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &T::TABLE)
            .field("master", &self.master.id())
            .field("slave", &self.slave.id())
            .field("is_master_same_as_slave", &self.is_master_same_as_slave)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
