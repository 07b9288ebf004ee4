// Schema registry for entity field catalogues
//
// The schema layer (field and relationship declarations) lives outside the cache. What the cache
// consumes from it is captured here: one field-descriptor table per entity type, built once at
// registration time, plus the named value processors attributes may refer to.

use crate::{error::CacheError, identity::EntityType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

/// Transforms a raw field value before it is stored in a root cell.
pub type ValueProcessor = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    ToOne,
    ToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldMeta {
    Attribute {
        /// Server-side field name, when it differs from the property name.
        data_key_alias: Option<String>,
        default_value: Option<Value>,
        /// Name of a processor registered with [SchemaRegistry::register_processor].
        processor: Option<String>,
    },
    Relationship {
        kind: RelationshipKind,
        target: EntityType,
        inverse: Option<String>,
        /// Restricts which entity types the field may reference. `None` accepts only `target`.
        polymorphic_types: Option<BTreeSet<EntityType>>,
    },
}

impl FieldMeta {
    pub fn attribute() -> Self {
        FieldMeta::Attribute {
            data_key_alias: None,
            default_value: None,
            processor: None,
        }
    }

    pub fn to_one<T: Into<EntityType>>(target: T) -> Self {
        FieldMeta::Relationship {
            kind: RelationshipKind::ToOne,
            target: target.into(),
            inverse: None,
            polymorphic_types: None,
        }
    }

    pub fn to_many<T: Into<EntityType>>(target: T) -> Self {
        FieldMeta::Relationship {
            kind: RelationshipKind::ToMany,
            target: target.into(),
            inverse: None,
            polymorphic_types: None,
        }
    }

    pub fn alias(mut self, data_key: &str) -> Self {
        if let FieldMeta::Attribute { data_key_alias, .. } = &mut self {
            *data_key_alias = Some(data_key.to_string());
        }
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        if let FieldMeta::Attribute { default_value, .. } = &mut self {
            *default_value = Some(value);
        }
        self
    }

    pub fn processor(mut self, name: &str) -> Self {
        if let FieldMeta::Attribute { processor, .. } = &mut self {
            *processor = Some(name.to_string());
        }
        self
    }

    pub fn inverse(mut self, field: &str) -> Self {
        if let FieldMeta::Relationship { inverse, .. } = &mut self {
            *inverse = Some(field.to_string());
        }
        self
    }

    pub fn polymorphic<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        if let FieldMeta::Relationship {
            polymorphic_types, ..
        } = &mut self
        {
            *polymorphic_types = Some(types.into_iter().map(Into::into).collect());
        }
        self
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self, FieldMeta::Relationship { .. })
    }

    /// Entity types a relationship field may point at. Empty for attributes.
    pub fn accepted_types(&self) -> BTreeSet<EntityType> {
        match self {
            FieldMeta::Attribute { .. } => BTreeSet::new(),
            FieldMeta::Relationship {
                target,
                polymorphic_types,
                ..
            } => polymorphic_types
                .clone()
                .unwrap_or_else(|| BTreeSet::from([target.clone()])),
        }
    }
}

/// Field catalogue for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub identifier_field: String,
    pub fields: BTreeMap<String, FieldMeta>,
}

impl EntitySchema {
    /// New catalogue whose identifier is the attribute `identifier_field`.
    pub fn new(identifier_field: &str) -> Self {
        EntitySchema {
            identifier_field: identifier_field.to_string(),
            fields: BTreeMap::from([(identifier_field.to_string(), FieldMeta::attribute())]),
        }
    }

    pub fn field(mut self, name: &str, meta: FieldMeta) -> Self {
        self.fields.insert(name.to_string(), meta);
        self
    }

    /// Property name for a server-side field name, honoring `data_key_alias`.
    pub fn property_for_data_key(&self, data_key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, meta)| {
                matches!(meta, FieldMeta::Attribute { data_key_alias: Some(alias), .. } if alias == data_key)
            })
            .map(|(name, _)| name.as_str())
            .or_else(|| self.fields.get_key_value(data_key).map(|(k, _)| k.as_str()))
    }

    /// Server-side field name for a property.
    pub fn data_key_for_property<'a>(&'a self, property: &'a str) -> &'a str {
        match self.fields.get(property) {
            Some(FieldMeta::Attribute {
                data_key_alias: Some(alias),
                ..
            }) => alias.as_str(),
            _ => property,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    entities: HashMap<EntityType, Arc<EntitySchema>>,
    processors: HashMap<String, ValueProcessor>,
}

/// Thread-safe registry of entity schemas and value processors.
///
/// Cloning is cheap; clones share the same tables. A registry is owned by (and usually built
/// alongside) one [crate::cache::Cache].
#[derive(Clone, Default)]
pub struct SchemaRegistry(Arc<RwLock<RegistryInner>>);

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reader = self.0.read();
        f.debug_struct("SchemaRegistry")
            .field("entities", &reader.entities.keys().collect::<Vec<_>>())
            .field("processors", &reader.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Register a schema definition
    ///
    /// If a schema for this entity type already exists, it will be overwritten and a log message
    /// emitted.
    pub fn register<T: Into<EntityType>>(&self, entity_type: T, schema: EntitySchema) {
        let entity_type = entity_type.into();
        let mut writer = self.0.write();
        if writer.entities.contains_key(&entity_type) {
            tracing::info!(
                "[SchemaRegistry::register] Overwriting existing schema: {}",
                entity_type
            );
        }
        writer.entities.insert(entity_type, Arc::new(schema));
    }

    pub fn register_processor<F>(&self, name: &str, processor: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.0
            .write()
            .processors
            .insert(name.to_string(), Arc::new(processor));
    }

    pub fn get(&self, entity_type: &EntityType) -> Result<Arc<EntitySchema>, CacheError> {
        self.0
            .read()
            .entities
            .get(entity_type)
            .cloned()
            .ok_or_else(|| CacheError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.0.read().entities.contains_key(entity_type)
    }

    pub fn field(&self, entity_type: &EntityType, field: &str) -> Result<FieldMeta, CacheError> {
        self.get(entity_type)?
            .fields
            .get(field)
            .cloned()
            .ok_or_else(|| CacheError::UnknownField {
                entity_type: entity_type.to_string(),
                field: field.to_string(),
            })
    }

    pub fn identifier_field(&self, entity_type: &EntityType) -> Result<String, CacheError> {
        let schema = self.get(entity_type)?;
        if schema.identifier_field.is_empty() {
            return Err(CacheError::MissingIdentifier(entity_type.to_string()));
        }
        Ok(schema.identifier_field.clone())
    }

    pub fn processor(&self, name: &str) -> Result<ValueProcessor, CacheError> {
        self.0
            .read()
            .processors
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::MissingProcessor(name.to_string()))
    }

    /// The processor configured for an attribute, if any.
    pub fn field_processor(
        &self,
        entity_type: &EntityType,
        field: &str,
    ) -> Result<Option<ValueProcessor>, CacheError> {
        match self.field(entity_type, field)? {
            FieldMeta::Attribute {
                processor: Some(name),
                ..
            } => self.processor(&name).map(Some),
            _ => Ok(None),
        }
    }

    pub fn list_entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> = self.0.read().entities.keys().cloned().collect();
        types.sort();
        types
    }

    /// Check every registered catalogue for dangling references: identifier fields that are not
    /// attributes, relationship targets or inverses that are not registered, inverses that do not
    /// point back, and processors that were never registered.
    pub fn validate(&self) -> Result<(), CacheError> {
        for entity_type in self.list_entity_types() {
            let schema = self.get(&entity_type)?;
            match schema.fields.get(&schema.identifier_field) {
                Some(FieldMeta::Attribute { .. }) => {}
                _ => return Err(CacheError::MissingIdentifier(entity_type.to_string())),
            }
            for (name, meta) in schema.fields.iter() {
                match meta {
                    FieldMeta::Attribute {
                        processor: Some(processor),
                        ..
                    } => {
                        self.processor(processor)?;
                    }
                    FieldMeta::Attribute { .. } => {}
                    FieldMeta::Relationship {
                        target, inverse, ..
                    } => {
                        for accepted in meta.accepted_types() {
                            self.get(&accepted)?;
                        }
                        if let Some(inverse) = inverse {
                            match self.field(target, inverse)? {
                                FieldMeta::Relationship {
                                    inverse: Some(back),
                                    ..
                                } if back == *name => {}
                                _ => {
                                    return Err(CacheError::Schema(format!(
                                        "{entity_type}.{name} declares inverse {target}.{inverse}, \
                                         which does not point back to {name}"
                                    )))
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
