//! Shared fixtures for the integration tests
#![allow(dead_code)]

use bridge_traits::database::{DatabaseAdapter, DatabaseConfig, NodeType, QueryRow, QueryValue};
use core_data::entity::{Navigation, PropertyValues, PropertyValuesExt};
use core_data::mapping::{ColumnType, EntityMapBuilder, ModelBuilder, ModelRegistry};
use core_data::{Entity, EntityBase, EntityHandle, SessionProvider, SqliteAdapter};
use core_runtime::config::EntityMapSettings;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub base: EntityBase,
    pub name: String,
    pub username: String,
    pub email: Option<String>,
    pub department_id: Option<i64>,
}

impl Entity for User {
    const TABLE: &'static str = "User";

    fn configure(map: &mut EntityMapBuilder) {
        map.property("Name", ColumnType::Text).required().max_length(100);
        map.property("Username", ColumnType::Text).required().max_length(50);
        map.property("Email", ColumnType::Text).max_length(200);
        map.property("DepartmentId", ColumnType::Integer);
        map.foreign_key("DepartmentId", "Department");
    }

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    fn write_values(&self, values: &mut PropertyValues) {
        values.insert("Name".to_string(), self.name.as_str().into());
        values.insert("Username".to_string(), self.username.as_str().into());
        values.insert("Email".to_string(), self.email.clone().into());
        values.insert("DepartmentId".to_string(), self.department_id.into());
    }

    fn from_values(base: EntityBase, values: &PropertyValues) -> core_data::Result<Self> {
        Ok(Self {
            base,
            name: values.get_string("Name")?,
            username: values.get_string("Username")?,
            email: values.get_opt_string("Email")?,
            department_id: values.get_opt_i64("DepartmentId")?,
        })
    }
}

#[derive(Debug)]
pub struct Department {
    pub base: EntityBase,
    pub name: String,
    pub users: Vec<EntityHandle<User>>,
}

impl Entity for Department {
    const TABLE: &'static str = "Department";

    fn configure(map: &mut EntityMapBuilder) {
        map.property("Name", ColumnType::Text).required().max_length(100);
    }

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }

    fn write_values(&self, values: &mut PropertyValues) {
        values.insert("Name".to_string(), self.name.as_str().into());
    }

    fn from_values(base: EntityBase, values: &PropertyValues) -> core_data::Result<Self> {
        Ok(Self {
            base,
            name: values.get_string("Name")?,
            users: Vec::new(),
        })
    }

    fn navigations(&self) -> Vec<Navigation> {
        self.users.iter().map(Navigation::to).collect()
    }
}

pub fn user(id: i64, username: &str) -> EntityHandle<User> {
    EntityHandle::new(User {
        base: EntityBase::new(id),
        name: username.to_string(),
        username: username.to_string(),
        email: None,
        department_id: None,
    })
}

pub fn department(id: i64, name: &str, users: Vec<EntityHandle<User>>) -> EntityHandle<Department> {
    EntityHandle::new(Department {
        base: EntityBase::new(id),
        name: name.to_string(),
        users,
    })
}

pub fn model() -> ModelBuilder {
    ModelBuilder::new().entity::<Department>().entity::<User>()
}

pub fn registry_with(settings: EntityMapSettings) -> Arc<ModelRegistry> {
    Arc::new(model().build(settings).unwrap())
}

pub fn registry() -> Arc<ModelRegistry> {
    registry_with(EntityMapSettings::default())
}

/// An in-memory database with the schema of `registry`
pub async fn database(registry: &ModelRegistry) -> Arc<SqliteAdapter> {
    let adapter = SqliteAdapter::connect_lazy(DatabaseConfig::in_memory()).unwrap();
    for statement in registry.schema_sql() {
        adapter.execute(&statement, &[]).await.unwrap();
    }
    Arc::new(adapter)
}

/// Master and slave roles backed by two separate databases
pub struct DualDatabases {
    pub registry: Arc<ModelRegistry>,
    pub master: Arc<SqliteAdapter>,
    pub slave: Arc<SqliteAdapter>,
}

impl DualDatabases {
    pub async fn new() -> Self {
        Self::with_registry(registry()).await
    }

    pub async fn with_registry(registry: Arc<ModelRegistry>) -> Self {
        let master = database(&registry).await;
        let slave = database(&registry).await;
        Self {
            registry,
            master,
            slave,
        }
    }

    pub fn provider(&self) -> SessionProvider {
        SessionProvider::new(Arc::clone(&self.registry))
            .with_adapter(NodeType::Master, self.master.clone())
            .with_adapter(NodeType::Slave, self.slave.clone())
    }

    /// Write rows to both databases, as if replication had caught up
    pub async fn seed_users(&self, users: &[(i64, &str)]) {
        for adapter in [&self.master, &self.slave] {
            seed_users(&self.registry, adapter, users).await;
        }
    }
}

/// Write rows straight into one database through a single-session factory
pub async fn seed_users(registry: &Arc<ModelRegistry>, adapter: &Arc<SqliteAdapter>, users: &[(i64, &str)]) {
    let factory = SessionProvider::new(Arc::clone(registry))
        .with_adapter(NodeType::Master, adapter.clone())
        .create_factory();
    let repository = factory.create::<User>().unwrap();
    for (id, username) in users {
        repository.create(&user(*id, username)).unwrap();
    }
    factory.save_changes().await.unwrap();
    factory.dispose().await;
}

pub async fn rows(adapter: &SqliteAdapter, sql: &str, params: &[QueryValue]) -> Vec<QueryRow> {
    adapter.query(sql, params).await.unwrap()
}

pub async fn count_users(adapter: &SqliteAdapter) -> i64 {
    rows(adapter, "SELECT COUNT(*) AS \"Count\" FROM \"User\"", &[]).await[0]
        .get("Count")
        .and_then(QueryValue::as_i64)
        .unwrap()
}

pub async fn user_row(adapter: &SqliteAdapter, id: i64) -> Option<QueryRow> {
    rows(
        adapter,
        "SELECT * FROM \"User\" WHERE \"Id\" = ?",
        &[QueryValue::Integer(id)],
    )
    .await
    .into_iter()
    .next()
}
