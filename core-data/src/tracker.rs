//! Per-session change tracking
//!
//! Each [`Session`](crate::session::Session) owns one `ChangeTracker`. An entry
//! records the persistence state of one shared entity instance and the values
//! last known to be persisted ("originals"). Current values are always read
//! from the instance itself, so the tracker never holds a stale copy of them.

use crate::entity::{same_object, PropertyValues, TrackedObject};
use crate::error::{DataError, Result};
use crate::mapping::ModelRegistry;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// Persistence state of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked
    Detached,
    /// Tracked, current values match the originals
    Unchanged,
    /// Will be inserted on save
    Added,
    /// Will be updated on save
    Modified,
    /// Will be deleted on save
    Deleted,
}

impl EntityState {
    /// Whether a save writes this entry
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }
}

/// When cascade deletes and orphan deletes are applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CascadeTiming {
    #[default]
    Immediate,
    OnSaveChanges,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntityKey {
    pub type_id: TypeId,
    pub table: &'static str,
    pub id: i64,
}

impl EntityKey {
    pub fn of(object: &Arc<dyn TrackedObject>) -> Self {
        Self {
            type_id: object.entity_type(),
            table: object.table(),
            id: object.id(),
        }
    }
}

struct TrackedEntry {
    object: Arc<dyn TrackedObject>,
    state: EntityState,
    original: PropertyValues,
    seq: u64,
}

/// Point-in-time copy of a tracking entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub table: &'static str,
    pub id: i64,
    pub state: EntityState,
    pub original_values: PropertyValues,
    pub current_values: PropertyValues,
}

/// An entry a save has to write
pub(crate) struct PendingChange {
    pub key: EntityKey,
    pub object: Arc<dyn TrackedObject>,
    pub state: EntityState,
}

pub(crate) struct ChangeTracker {
    registry: Arc<ModelRegistry>,
    entries: HashMap<EntityKey, TrackedEntry>,
    next_seq: u64,
    cascade_delete_timing: CascadeTiming,
    delete_orphans_timing: CascadeTiming,
}

/// Mapped current values of a tracked instance
fn current_values(registry: &ModelRegistry, object: &Arc<dyn TrackedObject>) -> PropertyValues {
    match registry.map_by_type(object.entity_type()) {
        Some(map) => map.project(object.values()),
        None => object.values(),
    }
}

fn identity_conflict(key: &EntityKey) -> DataError {
    DataError::IdentityConflict {
        table: key.table.to_string(),
        id: key.id,
    }
}

impl ChangeTracker {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            entries: HashMap::new(),
            next_seq: 0,
            cascade_delete_timing: CascadeTiming::default(),
            delete_orphans_timing: CascadeTiming::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry_for(&self, object: &Arc<dyn TrackedObject>) -> Option<&TrackedEntry> {
        self.entries
            .get(&EntityKey::of(object))
            .filter(|entry| same_object(&entry.object, object))
    }

    /// State of this exact instance; another instance with the same key does
    /// not count
    pub fn state_of(&self, object: &Arc<dyn TrackedObject>) -> EntityState {
        self.entry_for(object)
            .map(|entry| entry.state)
            .unwrap_or(EntityState::Detached)
    }

    pub fn is_tracking(&self, object: &Arc<dyn TrackedObject>) -> bool {
        self.entry_for(object).is_some()
    }

    pub fn original_values(&self, object: &Arc<dyn TrackedObject>) -> Option<PropertyValues> {
        self.entry_for(object).map(|entry| entry.original.clone())
    }

    pub fn snapshot(&self, object: &Arc<dyn TrackedObject>) -> Option<EntrySnapshot> {
        self.entry_for(object).map(|entry| self.snapshot_of(entry))
    }

    fn snapshot_of(&self, entry: &TrackedEntry) -> EntrySnapshot {
        let key = EntityKey::of(&entry.object);
        EntrySnapshot {
            table: key.table,
            id: key.id,
            state: entry.state,
            original_values: entry.original.clone(),
            current_values: current_values(&self.registry, &entry.object),
        }
    }

    /// Every entry in tracking order
    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        self.ordered()
            .into_iter()
            .map(|entry| self.snapshot_of(entry))
            .collect()
    }

    fn ordered(&self) -> Vec<&TrackedEntry> {
        let mut entries: Vec<&TrackedEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Tracked instance with the given key, whatever its state
    pub fn resolve(&self, type_id: TypeId, table: &'static str, id: i64) -> Option<Arc<dyn TrackedObject>> {
        self.entries
            .get(&EntityKey { type_id, table, id })
            .map(|entry| Arc::clone(&entry.object))
    }

    fn attach(
        &mut self,
        object: &Arc<dyn TrackedObject>,
        key: EntityKey,
        state: EntityState,
        original: Option<PropertyValues>,
    ) -> Result<()> {
        let map = self
            .registry
            .map_by_type(key.type_id)
            .ok_or_else(|| DataError::UnmappedEntity(key.table.to_string()))?;
        let original = original.unwrap_or_else(|| map.project(object.values()));

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key,
            TrackedEntry {
                object: Arc::clone(object),
                state,
                original,
                seq,
            },
        );
        Ok(())
    }

    /// Move an instance to `state`.
    ///
    /// - an untracked instance is attached with its current values as originals
    /// - `Deleted` on an `Added` entry detaches it
    /// - `Unchanged` accepts the current values as originals
    /// - `Detached` removes the entry
    ///
    /// # Errors
    ///
    /// [`DataError::IdentityConflict`] if a different instance with the same
    /// key is already tracked.
    pub fn set_state(&mut self, object: &Arc<dyn TrackedObject>, state: EntityState) -> Result<()> {
        let key = EntityKey::of(object);
        match self.entries.get_mut(&key) {
            Some(entry) if !same_object(&entry.object, object) => {
                if state == EntityState::Detached {
                    Ok(())
                } else {
                    Err(identity_conflict(&key))
                }
            }
            Some(entry) => {
                match (entry.state, state) {
                    (_, EntityState::Detached) | (EntityState::Added, EntityState::Deleted) => {
                        self.entries.remove(&key);
                    }
                    (_, EntityState::Unchanged) => {
                        entry.original = current_values(&self.registry, object);
                        entry.state = EntityState::Unchanged;
                    }
                    (_, new_state) => entry.state = new_state,
                }
                Ok(())
            }
            None if state == EntityState::Detached => Ok(()),
            None => self.attach(object, key, state, None),
        }
    }

    /// Overwrite originals (current values when `None`) and state in one
    /// step, attaching the instance if needed
    pub fn mirror(
        &mut self,
        object: &Arc<dyn TrackedObject>,
        original: Option<PropertyValues>,
        state: EntityState,
    ) -> Result<()> {
        let key = EntityKey::of(object);
        match self.entries.get_mut(&key) {
            Some(entry) if !same_object(&entry.object, object) => {
                if state == EntityState::Detached {
                    Ok(())
                } else {
                    Err(identity_conflict(&key))
                }
            }
            Some(_) if state == EntityState::Detached => {
                self.entries.remove(&key);
                Ok(())
            }
            Some(entry) => {
                entry.original = original.unwrap_or_else(|| current_values(&self.registry, object));
                entry.state = state;
                Ok(())
            }
            None if state == EntityState::Detached => Ok(()),
            None => self.attach(object, key, state, original),
        }
    }

    /// Track a freshly materialised instance as `Unchanged`
    pub fn attach_unchanged(&mut self, object: &Arc<dyn TrackedObject>) -> Result<()> {
        let key = EntityKey::of(object);
        if self.entries.contains_key(&key) {
            return Err(identity_conflict(&key));
        }
        self.attach(object, key, EntityState::Unchanged, None)
    }

    /// Mark `Unchanged` entries whose current values drifted from their
    /// originals as `Modified`. Returns how many changed state.
    pub fn detect_changes(&mut self) -> usize {
        let mut detected = 0;
        for entry in self.entries.values_mut() {
            if entry.state == EntityState::Unchanged
                && current_values(&self.registry, &entry.object) != entry.original
            {
                entry.state = EntityState::Modified;
                detected += 1;
            }
        }
        detected
    }

    /// [`detect_changes`](Self::detect_changes) for a single instance
    pub fn detect_object(&mut self, object: &Arc<dyn TrackedObject>) {
        let key = EntityKey::of(object);
        if let Some(entry) = self.entries.get_mut(&key) {
            if same_object(&entry.object, object)
                && entry.state == EntityState::Unchanged
                && current_values(&self.registry, object) != entry.original
            {
                entry.state = EntityState::Modified;
            }
        }
    }

    /// Instances currently `Unchanged`, in tracking order
    pub fn unchanged_objects(&self) -> Vec<Arc<dyn TrackedObject>> {
        self.ordered()
            .into_iter()
            .filter(|entry| entry.state == EntityState::Unchanged)
            .map(|entry| Arc::clone(&entry.object))
            .collect()
    }

    /// Entries a save has to write, in tracking order
    pub fn pending(&self) -> Vec<PendingChange> {
        self.ordered()
            .into_iter()
            .filter(|entry| entry.state.is_pending())
            .map(|entry| PendingChange {
                key: EntityKey::of(&entry.object),
                object: Arc::clone(&entry.object),
                state: entry.state,
            })
            .collect()
    }

    /// Treat every pending write as persisted: `Deleted` entries are
    /// detached, `Added`/`Modified` ones become `Unchanged` with their current
    /// values as originals
    pub fn accept_all(&mut self) {
        self.entries
            .retain(|_, entry| entry.state != EntityState::Deleted);
        for entry in self.entries.values_mut() {
            if matches!(entry.state, EntityState::Added | EntityState::Modified) {
                entry.original = current_values(&self.registry, &entry.object);
                entry.state = EntityState::Unchanged;
            }
        }
    }

    /// Detach every entry. Returns how many were detached.
    pub fn detach_all(&mut self) -> usize {
        let detached = self.entries.len();
        self.entries.clear();
        detached
    }

    pub fn cascade_delete_timing(&self) -> CascadeTiming {
        self.cascade_delete_timing
    }

    pub fn set_cascade_delete_timing(&mut self, timing: CascadeTiming) {
        self.cascade_delete_timing = timing;
    }

    pub fn delete_orphans_timing(&self) -> CascadeTiming {
        self.delete_orphans_timing
    }

    pub fn set_delete_orphans_timing(&mut self, timing: CascadeTiming) {
        self.delete_orphans_timing = timing;
    }
}
