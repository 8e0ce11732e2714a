//! Unit-of-work session
//!
//! A [`Session`] binds one [`DatabaseAdapter`] to one change tracker. It reads
//! rows into shared entity instances (resolving identities against what it
//! already tracks), records state changes, and flushes pending entries with
//! [`Session::save_changes`].
//!
//! ## Saving
//!
//! A save detects changes, stamps audit columns for the given [`ActorId`],
//! then issues one statement per pending entry in tracking order. Every
//! statement must affect exactly one row. Statements run inside the session's
//! active transaction, or inside an implicit one that is committed on success
//! and rolled back on failure. The tracker is only updated once every
//! statement has succeeded.

use crate::entity::{columns, ActorId, Entity, EntityBase, EntityHandle, PropertyValues};
use crate::entity::{PropertyValuesExt, TrackedObject};
use crate::error::{DataError, Result};
use crate::mapping::{quote_ident, ModelRegistry};
use crate::tracker::{CascadeTiming, ChangeTracker, EntityKey, EntityState, EntrySnapshot};
use crate::tracker::PendingChange;
use bridge_traits::database::{DatabaseAdapter, NodeType, QueryRow, QueryValue, TransactionId};
use bridge_traits::time::Clock;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// One statement produced by a save
struct WriteStatement {
    key: EntityKey,
    sql: String,
    params: Vec<QueryValue>,
}

/// A unit-of-work scope bound to one database endpoint
pub struct Session {
    id: Uuid,
    node: NodeType,
    adapter: Arc<dyn DatabaseAdapter>,
    registry: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
    tracker: Mutex<ChangeTracker>,
    transaction: Mutex<Option<TransactionId>>,
    disposed: AtomicBool,
}

impl Session {
    /// Create a session. No connection is opened until the first statement.
    pub fn new(
        node: NodeType,
        adapter: Arc<dyn DatabaseAdapter>,
        registry: Arc<ModelRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, node = %node, "Session created");

        Self {
            id,
            node,
            adapter,
            tracker: Mutex::new(ChangeTracker::new(Arc::clone(&registry))),
            registry,
            clock,
            transaction: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Identity of this session; two sessions are the same iff their ids match
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn node(&self) -> NodeType {
        self.node
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DataError::Disposed(format!(
                "{} session {}",
                self.node, self.id
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Change tracking
    // ------------------------------------------------------------------

    /// State of this exact instance in the tracker
    pub fn entry_state<T: Entity>(&self, handle: &EntityHandle<T>) -> EntityState {
        self.tracker.lock().state_of(&handle.tracked())
    }

    /// Snapshot of the instance's tracking entry, if tracked
    pub fn entry<T: Entity>(&self, handle: &EntityHandle<T>) -> Option<EntrySnapshot> {
        self.tracker.lock().snapshot(&handle.tracked())
    }

    /// Last known persisted values of the instance, if tracked
    pub fn original_values<T: Entity>(&self, handle: &EntityHandle<T>) -> Option<PropertyValues> {
        self.tracker.lock().original_values(&handle.tracked())
    }

    /// Every tracking entry in tracking order, after detecting changes
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let mut tracker = self.tracker.lock();
        tracker.detect_changes();
        tracker.snapshots()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracker.lock().len()
    }

    pub fn set_state<T: Entity>(&self, handle: &EntityHandle<T>, state: EntityState) -> Result<()> {
        self.ensure_active()?;
        self.tracker.lock().set_state(&handle.tracked(), state)
    }

    /// Overwrite the originals of a tracked instance
    pub fn set_original_values<T: Entity>(
        &self,
        handle: &EntityHandle<T>,
        values: PropertyValues,
    ) -> Result<()> {
        self.ensure_active()?;
        let object = handle.tracked();
        let mut tracker = self.tracker.lock();
        let state = tracker.state_of(&object);
        if state == EntityState::Detached {
            return Err(DataError::invalid_argument(
                "handle",
                format!("{} {} is not tracked", T::TABLE, handle.id()),
            ));
        }
        tracker.mirror(&object, Some(values), state)
    }

    /// Mark drifted `Unchanged` entries as `Modified`. Returns how many
    /// changed state.
    pub fn detect_changes(&self) -> usize {
        self.tracker.lock().detect_changes()
    }

    pub fn cascade_delete_timing(&self) -> CascadeTiming {
        self.tracker.lock().cascade_delete_timing()
    }

    pub fn set_cascade_delete_timing(&self, timing: CascadeTiming) {
        self.tracker.lock().set_cascade_delete_timing(timing);
    }

    pub fn delete_orphans_timing(&self) -> CascadeTiming {
        self.tracker.lock().delete_orphans_timing()
    }

    pub fn set_delete_orphans_timing(&self, timing: CascadeTiming) {
        self.tracker.lock().set_delete_orphans_timing(timing);
    }

    pub(crate) fn state_of_object(&self, object: &Arc<dyn TrackedObject>) -> EntityState {
        self.tracker.lock().state_of(object)
    }

    pub(crate) fn is_tracking_object(&self, object: &Arc<dyn TrackedObject>) -> bool {
        self.tracker.lock().is_tracking(object)
    }

    /// Detect changes on one instance, then return its originals and state
    pub(crate) fn observe_object(
        &self,
        object: &Arc<dyn TrackedObject>,
    ) -> Option<(PropertyValues, EntityState)> {
        let mut tracker = self.tracker.lock();
        tracker.detect_object(object);
        let state = tracker.state_of(object);
        tracker
            .original_values(object)
            .map(|original| (original, state))
    }

    pub(crate) fn set_object_state(
        &self,
        object: &Arc<dyn TrackedObject>,
        state: EntityState,
    ) -> Result<()> {
        self.ensure_active()?;
        self.tracker.lock().set_state(object, state)
    }

    pub(crate) fn mirror_object(
        &self,
        object: &Arc<dyn TrackedObject>,
        original: Option<PropertyValues>,
        state: EntityState,
    ) -> Result<()> {
        self.ensure_active()?;
        self.tracker.lock().mirror(object, original, state)
    }

    /// `Unchanged` instances after detecting changes, in tracking order
    pub(crate) fn unchanged_objects(&self) -> Vec<Arc<dyn TrackedObject>> {
        let mut tracker = self.tracker.lock();
        tracker.detect_changes();
        tracker.unchanged_objects()
    }

    /// Treat every pending entry as persisted without touching the database
    pub(crate) fn accept_all_changes(&self) {
        let mut tracker = self.tracker.lock();
        tracker.detect_changes();
        tracker.accept_all();
    }

    pub(crate) fn detach_all(&self) -> usize {
        self.tracker.lock().detach_all()
    }

    /// Turn rows into tracked instances, reusing instances already tracked
    /// under the same key
    pub(crate) fn materialize<T: Entity>(&self, rows: Vec<QueryRow>) -> Result<Vec<EntityHandle<T>>> {
        let map = self.registry.map::<T>()?;
        let mut tracker = self.tracker.lock();
        let mut handles = Vec::with_capacity(rows.len());

        for row in rows {
            let values = map.project(row.into_iter().collect());
            let id = values
                .get_i64(columns::ID)
                .map_err(|e| materialization_error(T::TABLE, e))?;

            if let Some(object) = tracker.resolve(TypeId::of::<T>(), T::TABLE, id) {
                let handle = EntityHandle::<T>::from_tracked(object).ok_or_else(|| {
                    DataError::Materialization {
                        table: T::TABLE.to_string(),
                        message: format!("tracked instance {} has an unexpected type", id),
                    }
                })?;
                handles.push(handle);
                continue;
            }

            let base =
                EntityBase::from_values(&values).map_err(|e| materialization_error(T::TABLE, e))?;
            let entity =
                T::from_values(base, &values).map_err(|e| materialization_error(T::TABLE, e))?;
            let handle = EntityHandle::new(entity);
            tracker.attach_unchanged(&handle.tracked())?;
            handles.push(handle);
        }

        Ok(handles)
    }

    // ------------------------------------------------------------------
    // Database access
    // ------------------------------------------------------------------

    pub fn current_transaction(&self) -> Option<TransactionId> {
        *self.transaction.lock()
    }

    pub fn has_active_transaction(&self) -> bool {
        self.current_transaction().is_some()
    }

    /// Begin a transaction, or return the one already active
    pub async fn begin_transaction(&self) -> Result<TransactionId> {
        self.ensure_active()?;
        if let Some(transaction_id) = self.current_transaction() {
            debug!(session_id = %self.id, transaction_id = transaction_id.0, "Transaction already active");
            return Ok(transaction_id);
        }

        let transaction_id = self.adapter.begin_transaction().await?;
        *self.transaction.lock() = Some(transaction_id);
        info!(
            session_id = %self.id,
            node = %self.node,
            transaction_id = transaction_id.0,
            "Transaction started"
        );
        Ok(transaction_id)
    }

    /// Commit the active transaction. Returns `false` if there was none.
    pub async fn commit_transaction(&self) -> Result<bool> {
        let active = self.transaction.lock().take();
        let Some(transaction_id) = active else {
            return Ok(false);
        };

        self.adapter.commit_transaction(transaction_id).await?;
        info!(session_id = %self.id, transaction_id = transaction_id.0, "Transaction committed");
        Ok(true)
    }

    /// Roll back the active transaction. Returns `false` if there was none.
    pub async fn rollback_transaction(&self) -> Result<bool> {
        let active = self.transaction.lock().take();
        let Some(transaction_id) = active else {
            return Ok(false);
        };

        self.adapter.rollback_transaction(transaction_id).await?;
        info!(session_id = %self.id, transaction_id = transaction_id.0, "Transaction rolled back");
        Ok(true)
    }

    /// Run a statement, inside the active transaction if any
    pub async fn execute(&self, sql: &str, params: &[QueryValue]) -> Result<u64> {
        self.ensure_active()?;
        let affected = match self.current_transaction() {
            Some(transaction_id) => {
                self.adapter
                    .execute_in_transaction(transaction_id, sql, params)
                    .await?
            }
            None => self.adapter.execute(sql, params).await?,
        };
        Ok(affected)
    }

    /// Run a query, inside the active transaction if any
    pub async fn query_rows(&self, sql: &str, params: &[QueryValue]) -> Result<Vec<QueryRow>> {
        self.ensure_active()?;
        let rows = match self.current_transaction() {
            Some(transaction_id) => {
                self.adapter
                    .query_in_transaction(transaction_id, sql, params)
                    .await?
            }
            None => self.adapter.query(sql, params).await?,
        };
        Ok(rows)
    }

    /// Create the tables of every registered entity that do not exist yet
    pub async fn ensure_created(&self) -> Result<()> {
        for statement in self.registry.schema_sql() {
            self.execute(&statement, &[]).await?;
        }
        debug!(session_id = %self.id, node = %self.node, "Schema ensured");
        Ok(())
    }

    /// Flush pending entries. Returns the number of entries written.
    ///
    /// # Errors
    ///
    /// - [`DataError::Database`] when a statement fails
    /// - [`DataError::Concurrency`] when a statement does not affect exactly
    ///   one row
    ///
    /// On error the tracker is left as it was before the call.
    #[instrument(skip(self), fields(session_id = %self.id, node = %self.node))]
    pub async fn save_changes(&self, actor: ActorId) -> Result<usize> {
        self.ensure_active()?;

        let pending = {
            let mut tracker = self.tracker.lock();
            tracker.detect_changes();
            tracker.pending()
        };
        if pending.is_empty() {
            debug!("Nothing to save");
            return Ok(0);
        }

        self.stamp_audit_columns(&pending, actor);
        let statements = pending
            .iter()
            .map(|change| self.write_statement(change))
            .collect::<Result<Vec<_>>>()?;

        match self.current_transaction() {
            Some(transaction_id) => self.run_statements(transaction_id, &statements).await?,
            None => {
                let transaction_id = self.adapter.begin_transaction().await?;
                if let Err(e) = self.run_statements(transaction_id, &statements).await {
                    if let Err(rollback_error) =
                        self.adapter.rollback_transaction(transaction_id).await
                    {
                        warn!(error = %rollback_error, "Rollback after failed save failed");
                    }
                    return Err(e);
                }
                self.adapter.commit_transaction(transaction_id).await?;
            }
        }

        self.tracker.lock().accept_all();
        debug!(affected = statements.len(), "Changes saved");
        Ok(statements.len())
    }

    fn stamp_audit_columns(&self, pending: &[PendingChange], actor: ActorId) {
        let settings = self.registry.settings();
        let now = self.clock.now();

        for change in pending {
            match change.state {
                EntityState::Added => change.object.stamp(&mut |base: &mut EntityBase| {
                    if !settings.ignore_creator_id {
                        base.creator_id = actor.0;
                    }
                    if !settings.ignore_creation_date {
                        base.creation_date = now;
                    }
                }),
                EntityState::Modified => change.object.stamp(&mut |base: &mut EntityBase| {
                    if !settings.ignore_modifier_id {
                        base.modifier_id = actor.0;
                    }
                    if !settings.ignore_modification_date {
                        base.modification_date = now;
                    }
                }),
                _ => {}
            }
        }
    }

    fn write_statement(&self, change: &PendingChange) -> Result<WriteStatement> {
        let map = self
            .registry
            .map_by_type(change.key.type_id)
            .ok_or_else(|| DataError::UnmappedEntity(change.key.table.to_string()))?;
        let values = map.project(change.object.values());
        let value_of = |name: &str| values.get(name).cloned().unwrap_or(QueryValue::Null);
        let table = quote_ident(map.table());
        let key_column = quote_ident(columns::ID);

        let (sql, params) = match change.state {
            EntityState::Added => {
                let placeholders = vec!["?"; map.columns().len()].join(", ");
                (
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table,
                        map.column_list(),
                        placeholders
                    ),
                    map.columns()
                        .iter()
                        .map(|column| value_of(&column.name))
                        .collect(),
                )
            }
            EntityState::Deleted => (
                format!("DELETE FROM {} WHERE {} = ?", table, key_column),
                vec![QueryValue::Integer(change.key.id)],
            ),
            // Modified; pending() yields nothing else
            _ => {
                let assignments = map
                    .non_key_columns()
                    .map(|column| format!("{} = ?", quote_ident(&column.name)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut params: Vec<QueryValue> = map
                    .non_key_columns()
                    .map(|column| value_of(&column.name))
                    .collect();
                params.push(QueryValue::Integer(change.key.id));
                (
                    format!(
                        "UPDATE {} SET {} WHERE {} = ?",
                        table, assignments, key_column
                    ),
                    params,
                )
            }
        };

        Ok(WriteStatement {
            key: change.key,
            sql,
            params,
        })
    }

    async fn run_statements(
        &self,
        transaction_id: TransactionId,
        statements: &[WriteStatement],
    ) -> Result<()> {
        for statement in statements {
            let affected = self
                .adapter
                .execute_in_transaction(transaction_id, &statement.sql, &statement.params)
                .await?;
            debug!(
                table = statement.key.table,
                id = statement.key.id,
                affected,
                "Statement executed"
            );

            if affected != 1 {
                return Err(DataError::Concurrency {
                    table: statement.key.table.to_string(),
                    id: statement.key.id,
                    expected: 1,
                    actual: affected,
                });
            }
        }
        Ok(())
    }

    /// Release the tracker. Idempotent.
    ///
    /// A transaction left open is not rolled back here; the owning factory
    /// does that before disposing its sessions.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let detached = self.tracker.lock().detach_all();
        debug!(session_id = %self.id, node = %self.node, detached, "Session disposed");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("tracked", &self.tracked_count())
            .field("transaction", &self.current_transaction())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn materialization_error(table: &str, error: DataError) -> DataError {
    match error {
        DataError::InvalidArgument { field, message } => DataError::Materialization {
            table: table.to_string(),
            message: format!("{}: {}", field, message),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteAdapter;
    use crate::test_support::{note, registry, Note};
    use bridge_traits::database::DatabaseConfig;
    use bridge_traits::time::SystemClock;

    async fn session() -> Session {
        let adapter = SqliteAdapter::connect_lazy(DatabaseConfig::in_memory()).unwrap();
        let session = Session::new(
            NodeType::Master,
            Arc::new(adapter),
            registry(),
            Arc::new(SystemClock),
        );
        session.ensure_created().await.unwrap();
        session
    }

    async fn count_notes(session: &Session) -> i64 {
        let rows = session
            .query_rows("SELECT COUNT(*) AS \"Count\" FROM \"Note\"", &[])
            .await
            .unwrap();
        rows[0].get("Count").and_then(|v| v.as_i64()).unwrap()
    }

    #[tokio::test]
    async fn test_nothing_pending_returns_zero() {
        let session = session().await;
        assert_eq!(session.save_changes(ActorId::ANONYMOUS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let session = session().await;
        let handle = note(1, "draft");

        session.set_state(&handle, EntityState::Added).unwrap();
        assert_eq!(session.save_changes(ActorId(5)).await.unwrap(), 1);
        assert_eq!(session.entry_state(&handle), EntityState::Unchanged);
        assert_eq!(handle.read().base.creator_id, 5);

        handle.write().body = "final".to_string();
        assert_eq!(session.save_changes(ActorId(6)).await.unwrap(), 1);
        assert_eq!(handle.read().base.modifier_id, 6);

        let rows = session
            .query_rows("SELECT \"Body\" FROM \"Note\" WHERE \"Id\" = ?", &[1i64.into()])
            .await
            .unwrap();
        assert_eq!(rows[0].get("Body").and_then(|v| v.as_string()), Some("final".to_string()));

        session.set_state(&handle, EntityState::Deleted).unwrap();
        assert_eq!(session.save_changes(ActorId(6)).await.unwrap(), 1);
        assert_eq!(session.entry_state(&handle), EntityState::Detached);
        assert_eq!(count_notes(&session).await, 0);
    }

    #[tokio::test]
    async fn test_materialize_resolves_identity() {
        let session = session().await;
        session.set_state(&note(1, "a"), EntityState::Added).unwrap();
        session.save_changes(ActorId::ANONYMOUS).await.unwrap();
        session.detach_all();

        let rows = session.query_rows("SELECT * FROM \"Note\"", &[]).await.unwrap();
        let first: Vec<EntityHandle<Note>> = session.materialize(rows.clone()).unwrap();
        let second: Vec<EntityHandle<Note>> = session.materialize(rows).unwrap();

        assert_eq!(first.len(), 1);
        assert!(first[0].same_instance(&second[0]));
        assert_eq!(session.entry_state(&first[0]), EntityState::Unchanged);
        assert_eq!(session.detect_changes(), 0);
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_a_concurrency_error() {
        let session = session().await;
        let handle = note(42, "ghost");
        session.set_state(&handle, EntityState::Modified).unwrap();

        let err = session.save_changes(ActorId::ANONYMOUS).await.unwrap_err();
        assert!(matches!(
            err,
            DataError::Concurrency { id: 42, expected: 1, actual: 0, .. }
        ));
        assert_eq!(session.entry_state(&handle), EntityState::Modified);
        assert!(!session.has_active_transaction());
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_earlier_statements() {
        let session = session().await;
        session.set_state(&note(1, "a"), EntityState::Added).unwrap();
        session.save_changes(ActorId::ANONYMOUS).await.unwrap();

        let fresh = note(2, "b");
        let missing = note(3, "c");
        session.set_state(&fresh, EntityState::Added).unwrap();
        session.set_state(&missing, EntityState::Deleted).unwrap();

        assert!(session.save_changes(ActorId::ANONYMOUS).await.is_err());
        assert_eq!(count_notes(&session).await, 1);
        assert_eq!(session.entry_state(&fresh), EntityState::Added);
    }

    #[tokio::test]
    async fn test_statements_join_explicit_transaction() {
        let session = session().await;
        let transaction_id = session.begin_transaction().await.unwrap();
        assert_eq!(session.begin_transaction().await.unwrap(), transaction_id);

        session.set_state(&note(1, "a"), EntityState::Added).unwrap();
        session.save_changes(ActorId::ANONYMOUS).await.unwrap();
        assert_eq!(count_notes(&session).await, 1);

        assert!(session.rollback_transaction().await.unwrap());
        assert!(!session.rollback_transaction().await.unwrap());
        assert_eq!(count_notes(&session).await, 0);
    }

    #[tokio::test]
    async fn test_disposed_session_rejects_work() {
        let session = session().await;
        session.set_state(&note(1, "a"), EntityState::Added).unwrap();

        session.dispose();
        session.dispose();

        assert_eq!(session.tracked_count(), 0);
        assert!(matches!(
            session.save_changes(ActorId::ANONYMOUS).await,
            Err(DataError::Disposed(_))
        ));
    }
}
