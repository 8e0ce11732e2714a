//! Entity mapping
//!
//! Maps are built from an explicit list of entity types handed to
//! [`ModelBuilder`] at startup; nothing is discovered at runtime. Each map
//! starts with the base columns (`Id` and the audit columns), drops the audit
//! columns switched off in [`EntityMapSettings`], then adds whatever the entity
//! declares in [`Entity::configure`].
//!
//! ```
//! # use core_data::entity::{Entity, EntityBase, PropertyValues};
//! # use core_data::mapping::{EntityMapBuilder, ModelRegistry};
//! # use core_runtime::config::EntityMapSettings;
//! # struct Tag { base: EntityBase }
//! # impl Entity for Tag {
//! #     const TABLE: &'static str = "Tag";
//! #     fn configure(_map: &mut EntityMapBuilder) {}
//! #     fn base(&self) -> &EntityBase { &self.base }
//! #     fn base_mut(&mut self) -> &mut EntityBase { &mut self.base }
//! #     fn write_values(&self, _values: &mut PropertyValues) {}
//! #     fn from_values(base: EntityBase, _values: &PropertyValues) -> core_data::Result<Self> {
//! #         Ok(Self { base })
//! #     }
//! # }
//! let settings = EntityMapSettings::new().with_ignore_modifier_id(true);
//! let registry = ModelRegistry::builder()
//!     .entity::<Tag>()
//!     .build(settings)
//!     .unwrap();
//!
//! let map = registry.map::<Tag>().unwrap();
//! assert!(map.has_column("CreatorId"));
//! assert!(!map.has_column("ModifierId"));
//! ```

use crate::entity::{columns, Entity, PropertyValues, TRACE_ID_MAX_LENGTH};
use crate::error::{DataError, Result};
use core_runtime::config::EntityMapSettings;
use std::any::{type_name, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Storage class of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    /// RFC 3339 text, UTC
    Timestamp,
    Blob,
}

impl ColumnType {
    fn sql_type(&self, max_length: Option<usize>) -> String {
        match (self, max_length) {
            (ColumnType::Text, Some(length)) => format!("VARCHAR({})", length),
            (ColumnType::Integer, _) | (ColumnType::Boolean, _) => "INTEGER".to_string(),
            (ColumnType::Real, _) => "REAL".to_string(),
            (ColumnType::Text, None) | (ColumnType::Timestamp, _) => "TEXT".to_string(),
            (ColumnType::Blob, _) => "BLOB".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub required: bool,
    pub max_length: Option<usize>,
    pub is_key: bool,
}

impl ColumnDef {
    fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            required: false,
            max_length: None,
            is_key: false,
        }
    }
}

/// Relationship from a dependent column to a principal table's key.
///
/// Deleting a principal that still has dependents is always refused by the
/// database; the core never cascades deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub column: String,
    pub principal_table: String,
}

/// Fluent column configuration returned by [`EntityMapBuilder::property`]
pub struct ColumnBuilder<'a> {
    column: &'a mut ColumnDef,
}

impl<'a> ColumnBuilder<'a> {
    pub fn required(self) -> Self {
        self.column.required = true;
        self
    }

    pub fn optional(self) -> Self {
        self.column.required = false;
        self
    }

    pub fn max_length(self, length: usize) -> Self {
        self.column.max_length = Some(length);
        self
    }
}

/// Collects the columns of one entity
#[derive(Debug, Default)]
pub struct EntityMapBuilder {
    columns: Vec<ColumnDef>,
    foreign_keys: Vec<ForeignKeyDef>,
    ignored: Vec<String>,
}

impl EntityMapBuilder {
    fn with_base_columns() -> Self {
        let mut builder = Self::default();
        builder.columns.push(ColumnDef {
            is_key: true,
            required: true,
            ..ColumnDef::new(columns::ID, ColumnType::Integer)
        });
        builder
            .property(columns::CREATOR_ID, ColumnType::Integer)
            .required();
        builder
            .property(columns::CREATION_DATE, ColumnType::Timestamp)
            .required();
        builder
            .property(columns::MODIFIER_ID, ColumnType::Integer)
            .required();
        builder
            .property(columns::MODIFICATION_DATE, ColumnType::Timestamp)
            .required();
        builder
            .property(columns::TRACE_ID, ColumnType::Text)
            .max_length(TRACE_ID_MAX_LENGTH);
        builder
    }

    /// Declare a column
    pub fn property(&mut self, name: &str, column_type: ColumnType) -> ColumnBuilder<'_> {
        let index = self.columns.len();
        self.columns.push(ColumnDef::new(name, column_type));
        ColumnBuilder {
            column: &mut self.columns[index],
        }
    }

    /// Remove a column from the map
    pub fn ignore(&mut self, name: &str) -> &mut Self {
        self.ignored.push(name.to_string());
        self
    }

    /// Declare that `column` references the key of `principal_table`
    pub fn foreign_key(&mut self, column: &str, principal_table: &str) -> &mut Self {
        self.foreign_keys.push(ForeignKeyDef {
            column: column.to_string(),
            principal_table: principal_table.to_string(),
        });
        self
    }

    fn build(mut self, table: &'static str, entity_name: &'static str) -> Result<EntityMap> {
        if table.trim().is_empty() {
            return Err(DataError::Configuration(format!(
                "Entity {} has an empty table name",
                entity_name
            )));
        }

        let ignored = std::mem::take(&mut self.ignored);
        if ignored.iter().any(|name| name == columns::ID) {
            return Err(DataError::Configuration(format!(
                "The key column of {} cannot be ignored",
                table
            )));
        }
        self.columns.retain(|column| !ignored.contains(&column.name));

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(DataError::Configuration(format!(
                    "Entity {} declares a column with an empty name",
                    table
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(DataError::Configuration(format!(
                    "Column {} is declared more than once on {}",
                    column.name, table
                )));
            }
        }

        for foreign_key in &self.foreign_keys {
            if !seen.contains(foreign_key.column.as_str()) {
                return Err(DataError::Configuration(format!(
                    "Foreign key column {} is not mapped on {}",
                    foreign_key.column, table
                )));
            }
        }

        Ok(EntityMap {
            table,
            entity_name,
            columns: self.columns,
            foreign_keys: self.foreign_keys,
        })
    }
}

/// Column layout of one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMap {
    table: &'static str,
    entity_name: &'static str,
    columns: Vec<ColumnDef>,
    foreign_keys: Vec<ForeignKeyDef>,
}

impl EntityMap {
    fn build<T: Entity>(settings: &EntityMapSettings) -> Result<EntityMap> {
        let mut builder = EntityMapBuilder::with_base_columns();
        T::configure(&mut builder);

        if settings.ignore_creator_id {
            builder.ignore(columns::CREATOR_ID);
        }
        if settings.ignore_creation_date {
            builder.ignore(columns::CREATION_DATE);
        }
        if settings.ignore_modifier_id {
            builder.ignore(columns::MODIFIER_ID);
        }
        if settings.ignore_modification_date {
            builder.ignore(columns::MODIFICATION_DATE);
        }

        builder.build(T::TABLE, type_name::<T>())
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Rust type name of the mapped entity
    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyDef] {
        &self.foreign_keys
    }

    /// Columns written by an `UPDATE`
    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|column| !column.is_key)
    }

    /// Keep only the values of mapped columns
    pub fn project(&self, mut values: PropertyValues) -> PropertyValues {
        values.retain(|name, _| self.has_column(name));
        values
    }

    /// Quoted, comma separated list of every mapped column
    pub(crate) fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn create_table_sql(&self) -> String {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut definition = format!(
                    "{} {}",
                    quote_ident(&column.name),
                    column.column_type.sql_type(column.max_length)
                );
                if column.required {
                    definition.push_str(" NOT NULL");
                }
                if column.is_key {
                    definition.push_str(" PRIMARY KEY");
                }
                definition
            })
            .collect();

        definitions.extend(self.foreign_keys.iter().map(|foreign_key| {
            format!(
                "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE RESTRICT",
                quote_ident(&foreign_key.column),
                quote_ident(&foreign_key.principal_table),
                quote_ident(columns::ID)
            )
        }));

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(self.table),
            definitions.join(", ")
        )
    }
}

type MapFactory = fn(&EntityMapSettings) -> Result<EntityMap>;

/// Explicit list of the entity types an application persists
#[derive(Clone, Default)]
pub struct ModelBuilder {
    registrations: Vec<(TypeId, MapFactory)>,
}

impl fmt::Debug for ModelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBuilder")
            .field("entities", &self.registrations.len())
            .finish()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type
    pub fn entity<T: Entity>(mut self) -> Self {
        self.registrations
            .push((TypeId::of::<T>(), EntityMap::build::<T> as MapFactory));
        self
    }

    /// Build every registered map with the given toggles.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::Configuration`] if a type or table is registered
    /// twice or a map is invalid.
    pub fn build(&self, settings: EntityMapSettings) -> Result<ModelRegistry> {
        let mut maps = HashMap::with_capacity(self.registrations.len());
        let mut order = Vec::with_capacity(self.registrations.len());
        let mut tables = HashSet::new();

        for (type_id, factory) in &self.registrations {
            let map = factory(&settings)?;
            if maps.contains_key(type_id) {
                return Err(DataError::Configuration(format!(
                    "Entity {} is registered more than once",
                    map.entity_name()
                )));
            }
            if !tables.insert(map.table()) {
                return Err(DataError::Configuration(format!(
                    "Table {} is mapped by more than one entity",
                    map.table()
                )));
            }
            order.push(*type_id);
            maps.insert(*type_id, map);
        }

        Ok(ModelRegistry {
            settings,
            maps,
            order,
        })
    }
}

/// Every entity map of an application, shared by all sessions
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    settings: EntityMapSettings,
    maps: HashMap<TypeId, EntityMap>,
    order: Vec<TypeId>,
}

impl ModelRegistry {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    pub fn settings(&self) -> EntityMapSettings {
        self.settings
    }

    /// Map of `T`, or [`DataError::UnmappedEntity`]
    pub fn map<T: Entity>(&self) -> Result<&EntityMap> {
        self.maps
            .get(&TypeId::of::<T>())
            .ok_or_else(|| DataError::UnmappedEntity(type_name::<T>().to_string()))
    }

    pub fn contains<T: Entity>(&self) -> bool {
        self.maps.contains_key(&TypeId::of::<T>())
    }

    pub(crate) fn map_by_type(&self, type_id: TypeId) -> Option<&EntityMap> {
        self.maps.get(&type_id)
    }

    /// Maps in registration order
    pub fn maps(&self) -> impl Iterator<Item = &EntityMap> {
        self.order.iter().filter_map(|type_id| self.maps.get(type_id))
    }

    /// `CREATE TABLE IF NOT EXISTS` statements in registration order
    pub fn schema_sql(&self) -> Vec<String> {
        self.maps().map(EntityMap::create_table_sql).collect()
    }
}

/// Quote an identifier for SQL, doubling embedded quotes
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityBase, PropertyValuesExt};
    use bridge_traits::database::QueryValue;

    struct Note {
        base: EntityBase,
        body: String,
    }

    impl Entity for Note {
        const TABLE: &'static str = "Note";

        fn configure(map: &mut EntityMapBuilder) {
            map.property("Body", ColumnType::Text).required().max_length(500);
            map.property("AuthorId", ColumnType::Integer);
            map.foreign_key("AuthorId", "User");
        }

        fn base(&self) -> &EntityBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut EntityBase {
            &mut self.base
        }

        fn write_values(&self, values: &mut PropertyValues) {
            values.insert("Body".to_string(), self.body.as_str().into());
        }

        fn from_values(base: EntityBase, values: &PropertyValues) -> Result<Self> {
            Ok(Self {
                base,
                body: values.get_string("Body")?,
            })
        }
    }

    struct Broken {
        base: EntityBase,
    }

    impl Entity for Broken {
        const TABLE: &'static str = "Broken";

        fn configure(map: &mut EntityMapBuilder) {
            map.property("Name", ColumnType::Text);
            map.property("Name", ColumnType::Integer);
        }

        fn base(&self) -> &EntityBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut EntityBase {
            &mut self.base
        }

        fn write_values(&self, _values: &mut PropertyValues) {}

        fn from_values(base: EntityBase, _values: &PropertyValues) -> Result<Self> {
            Ok(Self { base })
        }
    }

    #[test]
    fn test_base_columns_are_mapped() {
        let registry = ModelRegistry::builder()
            .entity::<Note>()
            .build(EntityMapSettings::default())
            .unwrap();
        let map = registry.map::<Note>().unwrap();

        let names: Vec<&str> = map.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Id",
                "CreatorId",
                "CreationDate",
                "ModifierId",
                "ModificationDate",
                "TraceId",
                "Body",
                "AuthorId"
            ]
        );
        assert!(map.column("Id").unwrap().is_key);
        assert_eq!(map.column("TraceId").unwrap().max_length, Some(50));
        assert_eq!(map.non_key_columns().count(), 7);
    }

    #[test]
    fn test_ignore_flags_drop_audit_columns() {
        let settings = EntityMapSettings::new()
            .with_ignore_creator_id(true)
            .with_ignore_creation_date(true)
            .with_ignore_modifier_id(true)
            .with_ignore_modification_date(true);
        let registry = ModelRegistry::builder()
            .entity::<Note>()
            .build(settings)
            .unwrap();
        let map = registry.map::<Note>().unwrap();

        assert!(map.has_column("Id"));
        assert!(map.has_column("TraceId"));
        assert!(!map.has_column("CreatorId"));
        assert!(!map.has_column("CreationDate"));
        assert!(!map.has_column("ModifierId"));
        assert!(!map.has_column("ModificationDate"));
    }

    #[test]
    fn test_duplicate_column_is_rejected() {
        let result = ModelRegistry::builder()
            .entity::<Broken>()
            .build(EntityMapSettings::default());
        assert!(matches!(result, Err(DataError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_entity_is_rejected() {
        let result = ModelRegistry::builder()
            .entity::<Note>()
            .entity::<Note>()
            .build(EntityMapSettings::default());
        assert!(matches!(result, Err(DataError::Configuration(_))));
    }

    #[test]
    fn test_unmapped_entity() {
        let registry = ModelRegistry::builder()
            .build(EntityMapSettings::default())
            .unwrap();
        assert!(!registry.contains::<Note>());
        assert!(matches!(
            registry.map::<Note>(),
            Err(DataError::UnmappedEntity(_))
        ));
    }

    #[test]
    fn test_create_table_sql() {
        let registry = ModelRegistry::builder()
            .entity::<Note>()
            .build(EntityMapSettings::new().with_ignore_modifier_id(true))
            .unwrap();
        let sql = registry.schema_sql();

        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE TABLE IF NOT EXISTS \"Note\" ("));
        assert!(sql[0].contains("\"Id\" INTEGER NOT NULL PRIMARY KEY"));
        assert!(sql[0].contains("\"Body\" VARCHAR(500) NOT NULL"));
        assert!(sql[0].contains("\"TraceId\" VARCHAR(50)"));
        assert!(!sql[0].contains("ModifierId"));
        assert!(sql[0]
            .contains("FOREIGN KEY (\"AuthorId\") REFERENCES \"User\" (\"Id\") ON DELETE RESTRICT"));
    }

    #[test]
    fn test_project_keeps_mapped_columns() {
        let registry = ModelRegistry::builder()
            .entity::<Note>()
            .build(EntityMapSettings::new().with_ignore_creator_id(true))
            .unwrap();
        let map = registry.map::<Note>().unwrap();

        let mut values = PropertyValues::new();
        values.insert("Id".to_string(), QueryValue::Integer(1));
        values.insert("CreatorId".to_string(), QueryValue::Integer(9));
        values.insert("Unknown".to_string(), QueryValue::Null);

        let projected = map.project(values);
        assert_eq!(projected.len(), 1);
        assert!(projected.contains_key("Id"));
    }

    #[test]
    fn test_model_builder_debug_lists_entity_count() {
        let builder = ModelRegistry::builder().entity::<Note>();
        assert_eq!(format!("{:?}", builder), "ModelBuilder { entities: 1 }");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("User"), "\"User\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
