//! Entity contract
//!
//! Every persisted type embeds an [`EntityBase`] (identity plus audit columns)
//! and implements [`Entity`] to describe how its own fields map to columns.
//! Instances are shared through [`EntityHandle`]: the caller and every session
//! that tracks the entity hold the very same allocation, so a mutation made by
//! the caller is visible to both trackers.
//!
//! ## Example
//!
//! ```
//! use core_data::entity::{Entity, EntityBase, PropertyValues, PropertyValuesExt};
//! use core_data::mapping::{ColumnType, EntityMapBuilder};
//! use core_data::Result;
//!
//! #[derive(Debug, Clone)]
//! pub struct Project {
//!     pub base: EntityBase,
//!     pub name: String,
//! }
//!
//! impl Entity for Project {
//!     const TABLE: &'static str = "Project";
//!
//!     fn configure(map: &mut EntityMapBuilder) {
//!         map.property("Name", ColumnType::Text).required().max_length(100);
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
//!     fn from_values(base: EntityBase, values: &PropertyValues) -> Result<Self> {
//!         Ok(Self {
//!             base,
//!             name: values.get_string("Name")?,
//!         })
//!     }
//! }
//! ```

use crate::error::{DataError, Result};
use crate::mapping::EntityMapBuilder;
use bridge_traits::database::QueryValue;
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Column name to value, for one entity instance
pub type PropertyValues = BTreeMap<String, QueryValue>;

/// Names of the columns every entity map starts with
pub mod columns {
    pub const ID: &str = "Id";
    pub const CREATOR_ID: &str = "CreatorId";
    pub const CREATION_DATE: &str = "CreationDate";
    pub const MODIFIER_ID: &str = "ModifierId";
    pub const MODIFICATION_DATE: &str = "ModificationDate";
    pub const TRACE_ID: &str = "TraceId";
}

/// Maximum length of [`EntityBase::trace_id`]
pub const TRACE_ID_MAX_LENGTH: usize = 50;

/// Identity of whoever is making a change, stamped into audit columns on save.
///
/// `ActorId(0)` is used when no actor is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub i64);

impl ActorId {
    pub const ANONYMOUS: ActorId = ActorId(0);

    /// Parse the numeric name of an authenticated principal, falling back to
    /// [`ActorId::ANONYMOUS`] when it is missing or not a number.
    pub fn from_principal_name(name: Option<&str>) -> Self {
        name.and_then(|name| name.trim().parse::<i64>().ok())
            .map(ActorId)
            .unwrap_or(Self::ANONYMOUS)
    }
}

impl From<i64> for ActorId {
    fn from(value: i64) -> Self {
        ActorId(value)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes shared by every persisted entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityBase {
    /// Caller or generator assigned identity; never generated by the database
    pub id: i64,
    pub creator_id: i64,
    pub creation_date: DateTime<Utc>,
    pub modifier_id: i64,
    pub modification_date: DateTime<Utc>,
    pub trace_id: Option<String>,
}

impl EntityBase {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            creator_id: 0,
            creation_date: DateTime::<Utc>::default(),
            modifier_id: 0,
            modification_date: DateTime::<Utc>::default(),
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Write the base columns. Columns dropped from the map are filtered out
    /// by the caller.
    pub fn write_values(&self, values: &mut PropertyValues) {
        values.insert(columns::ID.to_string(), self.id.into());
        values.insert(columns::CREATOR_ID.to_string(), self.creator_id.into());
        values.insert(columns::CREATION_DATE.to_string(), self.creation_date.into());
        values.insert(columns::MODIFIER_ID.to_string(), self.modifier_id.into());
        values.insert(
            columns::MODIFICATION_DATE.to_string(),
            self.modification_date.into(),
        );
        values.insert(columns::TRACE_ID.to_string(), self.trace_id.clone().into());
    }

    /// Read the base columns. Only `Id` is mandatory; ignored audit columns
    /// keep their defaults.
    pub fn from_values(values: &PropertyValues) -> Result<Self> {
        let mut base = EntityBase::new(values.get_i64(columns::ID)?);
        if let Some(creator_id) = values.get_opt_i64(columns::CREATOR_ID)? {
            base.creator_id = creator_id;
        }
        if let Some(creation_date) = values.get_opt_datetime(columns::CREATION_DATE)? {
            base.creation_date = creation_date;
        }
        if let Some(modifier_id) = values.get_opt_i64(columns::MODIFIER_ID)? {
            base.modifier_id = modifier_id;
        }
        if let Some(modification_date) = values.get_opt_datetime(columns::MODIFICATION_DATE)? {
            base.modification_date = modification_date;
        }
        base.trace_id = values.get_opt_string(columns::TRACE_ID)?;
        Ok(base)
    }
}

/// A persisted type.
///
/// Implementations describe their columns in [`Entity::configure`] and convert
/// between themselves and [`PropertyValues`]. Relationships that an update
/// should walk are declared explicitly through [`Entity::navigations`].
pub trait Entity: Send + Sync + Sized + 'static {
    /// Table the entity is stored in
    const TABLE: &'static str;

    /// Declare the entity specific columns. Base columns are added by the
    /// registry.
    fn configure(map: &mut EntityMapBuilder);

    fn base(&self) -> &EntityBase;

    fn base_mut(&mut self) -> &mut EntityBase;

    /// Write the entity specific column values
    fn write_values(&self, values: &mut PropertyValues);

    /// Rebuild an entity from a row
    fn from_values(base: EntityBase, values: &PropertyValues) -> Result<Self>;

    /// Entities reachable from this one that an update should reconcile too
    fn navigations(&self) -> Vec<Navigation> {
        Vec::new()
    }
}

/// Shared, mutable ownership of one entity instance.
///
/// Cloning a handle clones the pointer, not the entity. Do not hold a guard
/// returned by [`read`](EntityHandle::read) or [`write`](EntityHandle::write)
/// across a repository or session call: both lock the instance.
pub struct EntityHandle<T: Entity> {
    inner: Arc<RwLock<T>>,
}

impl<T: Entity> EntityHandle<T> {
    pub fn new(entity: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// Current identity of the instance
    pub fn id(&self) -> i64 {
        self.inner.read().base().id
    }

    /// Whether both handles point at the same instance
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn tracked(&self) -> Arc<dyn TrackedObject> {
        self.inner.clone()
    }

    pub(crate) fn from_tracked(object: Arc<dyn TrackedObject>) -> Option<Self> {
        object
            .into_any()
            .downcast::<RwLock<T>>()
            .ok()
            .map(|inner| Self { inner })
    }
}

impl<T: Entity> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity + fmt::Debug> fmt::Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityHandle").field(&*self.inner.read()).finish()
    }
}

impl<T: Entity> From<T> for EntityHandle<T> {
    fn from(entity: T) -> Self {
        EntityHandle::new(entity)
    }
}

/// A declared relationship from one entity instance to another
#[derive(Clone)]
pub struct Navigation {
    target: Arc<dyn TrackedObject>,
}

impl Navigation {
    pub fn to<T: Entity>(handle: &EntityHandle<T>) -> Self {
        Self {
            target: handle.tracked(),
        }
    }

    pub(crate) fn into_target(self) -> Arc<dyn TrackedObject> {
        self.target
    }
}

impl fmt::Debug for Navigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Navigation")
            .field("table", &self.target.table())
            .field("id", &self.target.id())
            .finish()
    }
}

/// Type-erased view of a shared entity instance, as held by change trackers
pub(crate) trait TrackedObject: Send + Sync {
    fn entity_type(&self) -> TypeId;
    fn table(&self) -> &'static str;
    fn id(&self) -> i64;
    /// Every value the entity writes, before filtering against its map
    fn values(&self) -> PropertyValues;
    fn stamp(&self, apply: &mut dyn FnMut(&mut EntityBase));
    fn navigations(&self) -> Vec<Navigation>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> TrackedObject for RwLock<T> {
    fn entity_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn table(&self) -> &'static str {
        T::TABLE
    }

    fn id(&self) -> i64 {
        self.read().base().id
    }

    fn values(&self) -> PropertyValues {
        let entity = self.read();
        let mut values = PropertyValues::new();
        entity.base().write_values(&mut values);
        entity.write_values(&mut values);
        values
    }

    fn stamp(&self, apply: &mut dyn FnMut(&mut EntityBase)) {
        apply(self.write().base_mut());
    }

    fn navigations(&self) -> Vec<Navigation> {
        self.read().navigations()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Address of the shared allocation, used to tell instances apart
pub(crate) fn object_address(object: &Arc<dyn TrackedObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

pub(crate) fn same_object(left: &Arc<dyn TrackedObject>, right: &Arc<dyn TrackedObject>) -> bool {
    object_address(left) == object_address(right)
}

/// Typed accessors used by [`Entity::from_values`] implementations.
///
/// Missing columns read as `NULL`.
pub trait PropertyValuesExt {
    fn value(&self, column: &str) -> &QueryValue;
    fn get_i64(&self, column: &str) -> Result<i64>;
    fn get_opt_i64(&self, column: &str) -> Result<Option<i64>>;
    fn get_f64(&self, column: &str) -> Result<f64>;
    fn get_bool(&self, column: &str) -> Result<bool>;
    fn get_string(&self, column: &str) -> Result<String>;
    fn get_opt_string(&self, column: &str) -> Result<Option<String>>;
    fn get_datetime(&self, column: &str) -> Result<DateTime<Utc>>;
    fn get_opt_datetime(&self, column: &str) -> Result<Option<DateTime<Utc>>>;
}

fn unexpected(column: &str, expected: &str, found: &QueryValue) -> DataError {
    DataError::invalid_argument(column, format!("expected {}, found {:?}", expected, found))
}

impl PropertyValuesExt for PropertyValues {
    fn value(&self, column: &str) -> &QueryValue {
        static NULL: QueryValue = QueryValue::Null;
        self.get(column).unwrap_or(&NULL)
    }

    fn get_i64(&self, column: &str) -> Result<i64> {
        self.get_opt_i64(column)?
            .ok_or_else(|| unexpected(column, "integer", self.value(column)))
    }

    fn get_opt_i64(&self, column: &str) -> Result<Option<i64>> {
        match self.value(column) {
            QueryValue::Null => Ok(None),
            QueryValue::Integer(value) => Ok(Some(*value)),
            other => Err(unexpected(column, "integer", other)),
        }
    }

    fn get_f64(&self, column: &str) -> Result<f64> {
        self.value(column)
            .as_f64()
            .ok_or_else(|| unexpected(column, "real", self.value(column)))
    }

    fn get_bool(&self, column: &str) -> Result<bool> {
        self.value(column)
            .as_bool()
            .ok_or_else(|| unexpected(column, "boolean", self.value(column)))
    }

    fn get_string(&self, column: &str) -> Result<String> {
        self.get_opt_string(column)?
            .ok_or_else(|| unexpected(column, "text", self.value(column)))
    }

    fn get_opt_string(&self, column: &str) -> Result<Option<String>> {
        match self.value(column) {
            QueryValue::Null => Ok(None),
            QueryValue::Text(value) => Ok(Some(value.clone())),
            other => Err(unexpected(column, "text", other)),
        }
    }

    fn get_datetime(&self, column: &str) -> Result<DateTime<Utc>> {
        self.get_opt_datetime(column)?
            .ok_or_else(|| unexpected(column, "timestamp", self.value(column)))
    }

    fn get_opt_datetime(&self, column: &str) -> Result<Option<DateTime<Utc>>> {
        match self.value(column) {
            QueryValue::Null => Ok(None),
            other => other
                .as_datetime()
                .map(Some)
                .ok_or_else(|| unexpected(column, "timestamp", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_actor_from_principal_name() {
        assert_eq!(ActorId::from_principal_name(Some("42")), ActorId(42));
        assert_eq!(ActorId::from_principal_name(Some("alice")), ActorId::ANONYMOUS);
        assert_eq!(ActorId::from_principal_name(None), ActorId(0));
    }

    #[test]
    fn test_base_values_round_trip() {
        let mut base = EntityBase::new(7).with_trace_id("trace-1");
        base.creator_id = 3;
        base.creation_date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut values = PropertyValues::new();
        base.write_values(&mut values);

        assert_eq!(values.value(columns::ID), &QueryValue::Integer(7));
        assert_eq!(EntityBase::from_values(&values).unwrap(), base);
    }

    #[test]
    fn test_base_from_values_requires_id() {
        let values = PropertyValues::new();
        let err = EntityBase::from_values(&values).unwrap_err();
        assert!(matches!(err, DataError::InvalidArgument { ref field, .. } if field == "Id"));
    }

    #[test]
    fn test_base_from_values_tolerates_ignored_columns() {
        let mut values = PropertyValues::new();
        values.insert(columns::ID.to_string(), QueryValue::Integer(1));

        let base = EntityBase::from_values(&values).unwrap();
        assert_eq!(base.creator_id, 0);
        assert_eq!(base.creation_date, DateTime::<Utc>::default());
        assert!(base.trace_id.is_none());
    }

    #[test]
    fn test_typed_getters_reject_wrong_types() {
        let mut values = PropertyValues::new();
        values.insert("Name".to_string(), QueryValue::Integer(1));

        assert!(values.get_string("Name").is_err());
        assert_eq!(values.get_opt_string("Missing").unwrap(), None);
        assert!(values.get_i64("Missing").is_err());
    }
}
