//! Entity used by unit tests

use crate::entity::{Entity, EntityBase, EntityHandle, PropertyValues, PropertyValuesExt};
use crate::error::Result;
use crate::mapping::{ColumnType, EntityMapBuilder, ModelRegistry};
use core_runtime::config::EntityMapSettings;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub base: EntityBase,
    pub body: String,
}

impl Entity for Note {
    const TABLE: &'static str = "Note";

    fn configure(map: &mut EntityMapBuilder) {
        map.property("Body", ColumnType::Text).required().max_length(200);
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

pub fn note(id: i64, body: &str) -> EntityHandle<Note> {
    EntityHandle::new(Note {
        base: EntityBase::new(id),
        body: body.to_string(),
    })
}

pub fn registry() -> Arc<ModelRegistry> {
    registry_with(EntityMapSettings::default())
}

pub fn registry_with(settings: EntityMapSettings) -> Arc<ModelRegistry> {
    Arc::new(
        ModelRegistry::builder()
            .entity::<Note>()
            .build(settings)
            .expect("note map is valid"),
    )
}
