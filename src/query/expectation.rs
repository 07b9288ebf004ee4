use crate::{cache::RootKind, error::CacheError, identity::EntityType};
use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Shape of data expected under one response key.
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
pub enum ExpectationKind {
    /// Attribute value of the owning entity
    Scalar,
    /// Single entity
    Node,
    /// Relay-style connection (edges/pageInfo) over an entity set
    Connection,
    /// Edge list inside a connection
    Edges,
    /// Flat list of entities, always the complete set
    NodeList,
    /// Opaque nested object; passed through without creating cache state
    Record,
    /// Leaf with no cache meaning (cursors, counts, `__typename`, ...)
    End,
}

impl ExpectationKind {
    /// Kinds whose expectation must name an entity type.
    pub fn entity_bearing() -> EnumSet<ExpectationKind> {
        ExpectationKind::Node | ExpectationKind::Connection | ExpectationKind::NodeList
    }

    /// Root kind used for top-level roots of this kind.
    pub fn root_kind(&self) -> Option<RootKind> {
        match self {
            ExpectationKind::Scalar => Some(RootKind::Scalar),
            ExpectationKind::Node => Some(RootKind::Node),
            ExpectationKind::Connection | ExpectationKind::NodeList => Some(RootKind::Connection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub response_key: String,
    /// Cache property (or top-level root field) the response key stands for.
    pub field_key: String,
    /// Response keys from the operation root down to this key.
    pub path: Vec<String>,
    pub level: usize,
    pub kind: ExpectationKind,
    pub entity_type: Option<EntityType>,
    pub identifier_field: Option<String>,
    /// Argument values (by their declared names), used to pick the connection window.
    pub query_params: Option<Map<String, Value>>,
}

impl Expectation {
    pub fn new(response_key: &str, level: usize, kind: ExpectationKind) -> Self {
        Expectation {
            response_key: response_key.to_string(),
            field_key: response_key.to_string(),
            path: vec![response_key.to_string()],
            level,
            kind,
            entity_type: None,
            identifier_field: None,
            query_params: None,
        }
    }

    pub fn field_key(mut self, field_key: &str) -> Self {
        self.field_key = field_key.to_string();
        self
    }

    pub fn path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    pub fn entity<T: Into<EntityType>>(mut self, entity_type: T) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn identifier(mut self, identifier_field: &str) -> Self {
        self.identifier_field = Some(identifier_field.to_string());
        self
    }

    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.query_params = Some(params);
        self
    }

    /// Whether `other` may share this expectation's `(response_key, level)` slot.
    fn compatible(&self, other: &Expectation) -> bool {
        if self.kind != other.kind || self.field_key != other.field_key {
            return false;
        }
        match self.kind {
            ExpectationKind::Scalar | ExpectationKind::Record | ExpectationKind::End => true,
            ExpectationKind::Connection | ExpectationKind::NodeList => {
                self.entity_type == other.entity_type
                    && self.query_params.clone().unwrap_or_default()
                        == other.query_params.clone().unwrap_or_default()
            }
            ExpectationKind::Node | ExpectationKind::Edges => {
                self.entity_type == other.entity_type
            }
        }
    }
}

/// Expectations of one composed request, keyed by `(response_key, level)`.
///
/// The level is the nesting depth from the operation root, not from the owning entity, so the
/// same response key can mean different things at different depths of one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectationTable {
    entries: BTreeMap<(String, usize), Expectation>,
}

impl ExpectationTable {
    pub fn new() -> Self {
        ExpectationTable::default()
    }

    /// Record `expectation`. Registering the same shape twice is a no-op; registering a different
    /// shape under an occupied slot is a [CacheError::DuplicateAlias].
    pub fn register(&mut self, expectation: Expectation) -> Result<(), CacheError> {
        if Self::entity_bearing_without_type(&expectation) {
            return Err(CacheError::Composition(format!(
                "{:?} expectation for '{}' has no entity type",
                expectation.kind, expectation.response_key
            )));
        }
        let slot = (expectation.response_key.clone(), expectation.level);
        match self.entries.get(&slot) {
            Some(existing) if existing.compatible(&expectation) => Ok(()),
            Some(_) => Err(CacheError::DuplicateAlias {
                key: slot.0,
                level: slot.1,
            }),
            None => {
                tracing::debug!(
                    "[ExpectationTable::register] {}@{} => {:?}",
                    slot.0,
                    slot.1,
                    expectation.kind
                );
                self.entries.insert(slot, expectation);
                Ok(())
            }
        }
    }

    fn entity_bearing_without_type(expectation: &Expectation) -> bool {
        ExpectationKind::entity_bearing().contains(expectation.kind)
            && expectation.entity_type.is_none()
    }

    pub fn get(&self, response_key: &str, level: usize) -> Option<&Expectation> {
        self.entries.get(&(response_key.to_string(), level))
    }

    /// Fold `other` into this table under the same conflict rules as [ExpectationTable::register].
    pub fn merge(&mut self, other: &ExpectationTable) -> Result<(), CacheError> {
        for expectation in other.entries.values() {
            self.register(expectation.clone())?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expectation> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
