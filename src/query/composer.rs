//! Query composition.
//!
//! The composer turns a tree of [FieldSpec]s into query text and, in the same walk, decides once
//! for every response key what shape of data the normalizer should expect there. Classification
//! happens here, at composition time, and is looked up by exact `(response_key, level)` during
//! normalization; the response itself is never pattern-matched.

use crate::{
    cache::Cache,
    config::CacheConfig,
    error::CacheError,
    identity::EntityType,
    schema::{FieldMeta, RelationshipKind, SchemaRegistry},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::expectation::{Expectation, ExpectationKind, ExpectationTable};

/// Explicit shape marker, overriding the naming conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeMarker {
    Connection,
    List,
    Edges,
    Node,
}

/// Inline argument of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Value,
    /// GraphQL type. Inferred from `value` when absent.
    pub type_name: Option<String>,
}

/// One node of a selection tree. The response key is the key it is selected under; `field` names
/// the server field (or cache property) when the key is an alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: Option<String>,
    pub marker: Option<ShapeMarker>,
    pub entity_type: Option<EntityType>,
    pub params: Vec<Param>,
    pub fields: Vec<(String, FieldSpec)>,
}

impl FieldSpec {
    pub fn leaf() -> Self {
        FieldSpec::default()
    }

    pub fn entity<T: Into<EntityType>>(entity_type: T) -> Self {
        FieldSpec {
            entity_type: Some(entity_type.into()),
            ..Default::default()
        }
    }

    pub fn node<T: Into<EntityType>>(entity_type: T) -> Self {
        FieldSpec::entity(entity_type).marker(ShapeMarker::Node)
    }

    pub fn connection<T: Into<EntityType>>(entity_type: T) -> Self {
        FieldSpec::entity(entity_type).marker(ShapeMarker::Connection)
    }

    pub fn list<T: Into<EntityType>>(entity_type: T) -> Self {
        FieldSpec::entity(entity_type).marker(ShapeMarker::List)
    }

    pub fn edges() -> Self {
        FieldSpec::leaf().marker(ShapeMarker::Edges)
    }

    pub fn marker(mut self, marker: ShapeMarker) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Select server field `field` under this field's response key.
    pub fn of(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    pub fn param<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            value: value.into(),
            type_name: None,
        });
        self
    }

    pub fn typed_param<V: Into<Value>>(mut self, name: &str, value: V, type_name: &str) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            value: value.into(),
            type_name: Some(type_name.to_string()),
        });
        self
    }

    pub fn select(mut self, key: &str, spec: FieldSpec) -> Self {
        self.fields.push((key.to_string(), spec));
        self
    }

    pub fn select_leaf(self, key: &str) -> Self {
        self.select(key, FieldSpec::leaf())
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    fn server_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.field.as_deref().unwrap_or(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone)]
struct Operation {
    name: String,
    kind: OperationKind,
    selections: Vec<String>,
    variables: Vec<VariableDecl>,
}

/// A finished request document together with what its response should look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedRequest {
    pub text: String,
    pub variables: Map<String, Value>,
    pub operations: Vec<String>,
    #[serde(skip)]
    pub expectations: ExpectationTable,
}

/// Entity context a field is selected in.
#[derive(Debug, Clone, Default)]
struct Scope {
    /// Entity whose fields are being selected.
    owner: Option<EntityType>,
    /// Entity type imposed by an enclosing connection or edge list.
    enforced: Option<EntityType>,
}

/// GraphQL type for a variable value.
fn infer_type(value: &Value) -> Option<String> {
    match value {
        Value::String(_) => Some("String".to_string()),
        Value::Bool(_) => Some("Boolean".to_string()),
        Value::Number(n) if n.is_f64() => Some("Float".to_string()),
        Value::Number(_) => Some("Int".to_string()),
        Value::Array(items) => items
            .first()
            .and_then(infer_type)
            .map(|inner| format!("[{inner}]")),
        Value::Null | Value::Object(_) => None,
    }
}

pub struct QueryComposer {
    schemas: SchemaRegistry,
    config: CacheConfig,
    connection_pattern: Regex,
    node_pattern: Regex,
    expectations: ExpectationTable,
    operations: Vec<Operation>,
    variables: Map<String, Value>,
    sequence: usize,
}

impl QueryComposer {
    pub fn new(schemas: SchemaRegistry, config: &CacheConfig) -> Result<Self, CacheError> {
        let (connection_pattern, node_pattern) = config.naming_patterns()?;
        Ok(QueryComposer {
            schemas,
            config: config.clone(),
            connection_pattern,
            node_pattern,
            expectations: ExpectationTable::new(),
            operations: Vec::new(),
            variables: Map::new(),
            sequence: 0,
        })
    }

    /// Composer using `cache`'s schemas and configuration.
    pub fn for_cache(cache: &Cache) -> Result<Self, CacheError> {
        QueryComposer::new(cache.schemas(), &cache.config())
    }

    pub fn expectations(&self) -> &ExpectationTable {
        &self.expectations
    }

    /// Add one operation and walk its selection tree.
    pub fn add_operation(
        &mut self,
        kind: OperationKind,
        name: &str,
        fields: Vec<(String, FieldSpec)>,
    ) -> Result<&mut Self, CacheError> {
        if self.operations.iter().any(|op| op.name == name) {
            return Err(CacheError::DuplicateOperation(name.to_string()));
        }
        self.operations.push(Operation {
            name: name.to_string(),
            kind,
            selections: Vec::new(),
            variables: Vec::new(),
        });
        for (key, spec) in fields.iter() {
            let text = self.resolve_fields(key, spec, name, &[], 0, None)?;
            if let Some(op) = self.operations.iter_mut().find(|op| op.name == name) {
                op.selections.push(text);
            }
        }
        Ok(self)
    }

    /// Classify `key`, register its expectation (and those of everything below it) and return the
    /// query text for the selection. Variables found on the way are recorded against `operation`.
    pub fn resolve_fields(
        &mut self,
        key: &str,
        spec: &FieldSpec,
        operation: &str,
        path: &[String],
        level: usize,
        enforced: Option<&EntityType>,
    ) -> Result<String, CacheError> {
        let op = self
            .operations
            .iter()
            .position(|op| op.name == operation)
            .ok_or_else(|| CacheError::Composition(format!("unknown operation '{operation}'")))?;
        let scope = Scope {
            owner: None,
            enforced: enforced.cloned(),
        };
        self.resolve(key, spec, op, path, level, &scope)
    }

    fn resolve(
        &mut self,
        key: &str,
        spec: &FieldSpec,
        op: usize,
        path: &[String],
        level: usize,
        scope: &Scope,
    ) -> Result<String, CacheError> {
        let mut path = path.to_vec();
        path.push(key.to_string());
        let name = spec.server_name(key);

        // Under an owning entity the key must name one of its properties.
        let mut field_key = name.to_string();
        let mut server_name = name.to_string();
        let mut owner_meta = None;
        if let Some(owner) = &scope.owner {
            let schema = self.schemas.get(owner)?;
            match schema.property_for_data_key(name) {
                Some(property) => {
                    field_key = property.to_string();
                    server_name = schema.data_key_for_property(property).to_string();
                    owner_meta = schema.fields.get(property).cloned();
                }
                None if name.starts_with("__") => {}
                None => {
                    return Err(CacheError::UnknownField {
                        entity_type: owner.to_string(),
                        field: name.to_string(),
                    })
                }
            }
        }

        let (inferred, relationship) = match &owner_meta {
            Some(FieldMeta::Relationship { kind, target, .. }) => (Some(target.clone()), Some(*kind)),
            _ => (None, None),
        };
        let explicit = spec.entity_type.clone().or(inferred);
        let target = explicit.clone().or_else(|| scope.enforced.clone());
        let kind = self.classify(key, spec, explicit.is_some(), target.is_some(), relationship, scope);
        self.check_kind(key, kind, &owner_meta, &target)?;

        let (args, params) = self.arguments(spec, level, op)?;
        let head = if key != server_name {
            format!("{key}: {server_name}{args}")
        } else {
            format!("{server_name}{args}")
        };

        let mut expectation = Expectation::new(key, level, kind)
            .field_key(&field_key)
            .path(path.clone());
        let mut children = spec.fields.clone();
        let child_scope = match kind {
            ExpectationKind::Node | ExpectationKind::NodeList => {
                let entity_type = target.clone().ok_or_else(|| missing_type(key))?;
                let identifier = self.schemas.identifier_field(&entity_type)?;
                let schema = self.schemas.get(&entity_type)?;
                let id_key = schema.data_key_for_property(&identifier).to_string();
                let selected = children.iter().any(|(child_key, child)| {
                    let child_name = child.server_name(child_key);
                    child_name == id_key || child_name == identifier
                });
                if self.config.inject_identifier && !selected {
                    children.insert(0, (id_key, FieldSpec::leaf()));
                }
                expectation = expectation.entity(entity_type.clone()).identifier(&identifier);
                if kind == ExpectationKind::NodeList {
                    expectation = expectation.params(params);
                }
                Scope {
                    owner: Some(entity_type),
                    enforced: None,
                }
            }
            ExpectationKind::Connection => {
                let entity_type = target.clone().ok_or_else(|| missing_type(key))?;
                expectation = expectation.entity(entity_type.clone()).params(params);
                Scope {
                    owner: None,
                    enforced: Some(entity_type),
                }
            }
            ExpectationKind::Edges => {
                if let Some(entity_type) = &target {
                    expectation = expectation.entity(entity_type.clone());
                }
                Scope {
                    owner: None,
                    enforced: target.clone(),
                }
            }
            ExpectationKind::Scalar => {
                if let Some(owner) = &scope.owner {
                    expectation = expectation.entity(owner.clone());
                }
                Scope::default()
            }
            ExpectationKind::Record | ExpectationKind::End => Scope::default(),
        };
        self.expectations.register(expectation)?;

        let mut rendered = Vec::with_capacity(children.len());
        for (child_key, child) in children.iter() {
            rendered.push(match kind {
                ExpectationKind::Record | ExpectationKind::End => {
                    self.render_opaque(child_key, child, op, level + 1)?
                }
                _ => self.resolve(child_key, child, op, &path, level + 1, &child_scope)?,
            });
        }
        if rendered.is_empty() {
            Ok(head)
        } else {
            Ok(format!("{head} {{ {} }}", rendered.join(" ")))
        }
    }

    /// First matching rule wins.
    fn classify(
        &self,
        key: &str,
        spec: &FieldSpec,
        has_explicit_type: bool,
        has_target: bool,
        relationship: Option<RelationshipKind>,
        scope: &Scope,
    ) -> ExpectationKind {
        let marker = spec.marker;
        if marker == Some(ShapeMarker::Connection) || self.connection_pattern.is_match(key) {
            ExpectationKind::Connection
        } else if marker == Some(ShapeMarker::List) && has_target {
            ExpectationKind::NodeList
        } else if key == self.config.edges_key || marker == Some(ShapeMarker::Edges) {
            ExpectationKind::Edges
        } else if key == self.config.node_key
            || self.node_pattern.is_match(key)
            || marker == Some(ShapeMarker::Node)
        {
            ExpectationKind::Node
        } else if spec.has_fields() {
            match (has_explicit_type, relationship) {
                (false, _) => ExpectationKind::Record,
                (true, Some(RelationshipKind::ToMany)) => ExpectationKind::Connection,
                (true, _) => ExpectationKind::Node,
            }
        } else if scope.owner.is_some() && !key.starts_with("__") {
            ExpectationKind::Scalar
        } else {
            ExpectationKind::End
        }
    }

    fn check_kind(
        &self,
        key: &str,
        kind: ExpectationKind,
        owner_meta: &Option<FieldMeta>,
        target: &Option<EntityType>,
    ) -> Result<(), CacheError> {
        if ExpectationKind::entity_bearing().contains(kind) && target.is_none() {
            return Err(missing_type(key));
        }
        let problem = match (owner_meta, kind) {
            (Some(FieldMeta::Attribute { .. }), k) if ExpectationKind::entity_bearing().contains(k) => {
                Some("is an attribute and cannot hold entities")
            }
            (Some(FieldMeta::Relationship { .. }), ExpectationKind::Scalar) => {
                Some("is a relationship and needs a sub-selection")
            }
            (
                Some(FieldMeta::Relationship {
                    kind: RelationshipKind::ToOne,
                    ..
                }),
                ExpectationKind::Connection | ExpectationKind::NodeList,
            ) => Some("is a to-one relationship and cannot be selected as a list"),
            (
                Some(FieldMeta::Relationship {
                    kind: RelationshipKind::ToMany,
                    ..
                }),
                ExpectationKind::Node,
            ) => Some("is a to-many relationship and cannot be selected as a single node"),
            _ => None,
        };
        match problem {
            Some(problem) => Err(CacheError::Composition(format!("'{key}' {problem}"))),
            None => Ok(()),
        }
    }

    /// Text for a selection below a record or leaf. Nothing under it is registered.
    fn render_opaque(
        &mut self,
        key: &str,
        spec: &FieldSpec,
        op: usize,
        level: usize,
    ) -> Result<String, CacheError> {
        let name = spec.server_name(key);
        let (args, _) = self.arguments(spec, level, op)?;
        let head = if key != name {
            format!("{key}: {name}{args}")
        } else {
            format!("{name}{args}")
        };
        if !spec.has_fields() {
            return Ok(head);
        }
        let mut rendered = Vec::with_capacity(spec.fields.len());
        for (child_key, child) in spec.fields.iter() {
            rendered.push(self.render_opaque(child_key, child, op, level + 1)?);
        }
        Ok(format!("{head} {{ {} }}", rendered.join(" ")))
    }

    /// Argument list text plus the argument values by declared name. Each argument becomes a
    /// request variable named `{param}_{level}_{sequence}`.
    fn arguments(
        &mut self,
        spec: &FieldSpec,
        level: usize,
        op: usize,
    ) -> Result<(String, Map<String, Value>), CacheError> {
        let mut params = Map::new();
        if spec.params.is_empty() {
            return Ok((String::new(), params));
        }
        let mut parts = Vec::with_capacity(spec.params.len());
        for param in spec.params.iter() {
            let type_name = param
                .type_name
                .clone()
                .or_else(|| infer_type(&param.value))
                .ok_or_else(|| {
                    CacheError::Composition(format!(
                        "cannot infer a type for argument '{}' ({})",
                        param.name, param.value
                    ))
                })?;
            let variable = format!("{}_{}_{}", param.name, level, self.sequence);
            self.sequence += 1;
            if let Some(operation) = self.operations.get_mut(op) {
                operation.variables.push(VariableDecl {
                    name: variable.clone(),
                    type_name,
                });
            }
            self.variables.insert(variable.clone(), param.value.clone());
            parts.push(format!("{}: ${variable}", param.name));
            params.insert(param.name.clone(), param.value.clone());
        }
        Ok((format!("({})", parts.join(", ")), params))
    }

    /// Assemble the document. Operation signatures are written only now, so variables declared
    /// anywhere in a tree appear in its operation's signature.
    pub fn finish(self) -> ComposedRequest {
        let text = self
            .operations
            .iter()
            .map(|op| {
                let signature = if op.variables.is_empty() {
                    String::new()
                } else {
                    format!(
                        "({})",
                        op.variables
                            .iter()
                            .map(|v| format!("${}: {}", v.name, v.type_name))
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                };
                format!(
                    "{} {}{} {{ {} }}",
                    op.kind,
                    op.name,
                    signature,
                    op.selections.join(" ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        tracing::debug!("[QueryComposer::finish] composed:\n{text}");
        ComposedRequest {
            text,
            variables: self.variables,
            operations: self.operations.into_iter().map(|op| op.name).collect(),
            expectations: self.expectations,
        }
    }
}

fn missing_type(key: &str) -> CacheError {
    CacheError::Composition(format!("'{key}' selects entities but no entity type is known"))
}
