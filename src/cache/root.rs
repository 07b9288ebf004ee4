//! Root cells: the per-field (or per top-level query root) storage units of the cache.

use crate::{
    error::CacheError,
    identity::{EntityType, Identity},
    schema::ValueProcessor,
};
use enumset::EnumSetType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use super::window::{identify, ConnectionWindow};

#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
pub enum RootKind {
    /// Attribute value
    Scalar,
    /// To-one reference
    Node,
    /// To-many reference set, optionally paginated through connection windows
    Connection,
}

/// Addresses a root cell: either one field of one entity, or a top-level query root.
#[derive(Clone, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum RootKey {
    Field {
        identity: Identity,
        field: String,
    },
    Top {
        entity_type: EntityType,
        field: String,
        kind: RootKind,
    },
}

impl RootKey {
    pub fn field(identity: &Identity, field: &str) -> Self {
        RootKey::Field {
            identity: identity.clone(),
            field: field.to_string(),
        }
    }

    pub fn top<T: Into<EntityType>>(entity_type: T, field: &str, kind: RootKind) -> Self {
        RootKey::Top {
            entity_type: entity_type.into(),
            field: field.to_string(),
            kind,
        }
    }

    /// The entity owning this root, for entity field roots.
    pub fn owner(&self) -> Option<&Identity> {
        match self {
            RootKey::Field { identity, .. } => Some(identity),
            RootKey::Top { .. } => None,
        }
    }

    pub fn field_name(&self) -> &str {
        match self {
            RootKey::Field { field, .. } | RootKey::Top { field, .. } => field,
        }
    }
}

impl fmt::Display for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootKey::Field { identity, field } => write!(f, "{identity}.{field}"),
            RootKey::Top {
                entity_type,
                field,
                kind,
            } => write!(f, "{entity_type}::{field}({kind:?})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RootValue {
    Scalar(Value),
    Node(Option<Identity>),
    Connection(BTreeSet<Identity>),
}

impl RootValue {
    pub fn kind(&self) -> RootKind {
        match self {
            RootValue::Scalar(_) => RootKind::Scalar,
            RootValue::Node(_) => RootKind::Node,
            RootValue::Connection(_) => RootKind::Connection,
        }
    }

    pub fn empty(kind: RootKind) -> Self {
        match kind {
            RootKind::Scalar => RootValue::Scalar(Value::Null),
            RootKind::Node => RootValue::Node(None),
            RootKind::Connection => RootValue::Connection(BTreeSet::new()),
        }
    }

    /// Every identity this value references.
    pub fn references(&self) -> Vec<Identity> {
        match self {
            RootValue::Scalar(_) => vec![],
            RootValue::Node(node) => node.iter().cloned().collect(),
            RootValue::Connection(members) => members.iter().cloned().collect(),
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        match self {
            RootValue::Scalar(_) => false,
            RootValue::Node(node) => node.as_ref() == Some(identity),
            RootValue::Connection(members) => members.contains(identity),
        }
    }
}

/// Storage for one field of one entity, or for one top-level query root.
///
/// Keeps the current `value` next to the last known persisted `initial_value`, which is what
/// [RootCell::revert] restores and what [RootCell::is_settled] compares against. Connection roots
/// additionally own the pagination windows requested against them.
#[derive(Clone)]
pub struct RootCell {
    key: RootKey,
    value: RootValue,
    initial_value: RootValue,
    loaded: bool,
    processor: Option<ValueProcessor>,
    accepts: BTreeSet<EntityType>,
    errors: Vec<String>,
    windows: BTreeMap<String, ConnectionWindow>,
    version: u64,
}

impl fmt::Debug for RootCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCell")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("initial_value", &self.initial_value)
            .field("loaded", &self.loaded)
            .field("processor", &self.processor.is_some())
            .field("accepts", &self.accepts)
            .field("errors", &self.errors)
            .field("windows", &self.windows.keys().collect::<Vec<_>>())
            .field("version", &self.version)
            .finish()
    }
}

impl RootCell {
    pub fn scalar(key: RootKey, default: Value, processor: Option<ValueProcessor>) -> Self {
        RootCell::build(key, RootValue::Scalar(default), processor, BTreeSet::new())
    }

    pub fn node(key: RootKey, accepts: BTreeSet<EntityType>) -> Self {
        RootCell::build(key, RootValue::Node(None), None, accepts)
    }

    pub fn connection(key: RootKey, accepts: BTreeSet<EntityType>) -> Self {
        RootCell::build(
            key,
            RootValue::Connection(BTreeSet::new()),
            None,
            accepts,
        )
    }

    fn build(
        key: RootKey,
        value: RootValue,
        processor: Option<ValueProcessor>,
        accepts: BTreeSet<EntityType>,
    ) -> Self {
        RootCell {
            key,
            initial_value: value.clone(),
            value,
            loaded: false,
            processor,
            accepts,
            errors: Vec::new(),
            windows: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn key(&self) -> &RootKey {
        &self.key
    }

    pub fn kind(&self) -> RootKind {
        self.value.kind()
    }

    pub fn get(&self) -> &RootValue {
        &self.value
    }

    pub fn initial_value(&self) -> &RootValue {
        &self.initial_value
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn accepts(&self) -> &BTreeSet<EntityType> {
        &self.accepts
    }

    pub fn scalar_value(&self) -> Option<&Value> {
        match &self.value {
            RootValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Target of a node root; `None` for null references and non-node roots.
    pub fn node_value(&self) -> Option<&Identity> {
        match &self.value {
            RootValue::Node(node) => node.as_ref(),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&BTreeSet<Identity>> {
        match &self.value {
            RootValue::Connection(members) => Some(members),
            _ => None,
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.value.contains(identity)
    }

    /// Value structurally equals the last persisted value.
    pub fn is_settled(&self) -> bool {
        self.value == self.initial_value
    }

    /// Local write. Applies the value processor to scalars and leaves `initial_value` alone, so
    /// the cell becomes unsettled until the next persisted update.
    pub fn set(&mut self, value: RootValue) -> Result<bool, CacheError> {
        self.update(value, false, false)
    }

    /// Write used by normalization. `update_initial` commits the value as the persisted value too;
    /// `mark_loaded` flips the loaded flag. Returns whether anything observable changed.
    pub fn update(
        &mut self,
        value: RootValue,
        update_initial: bool,
        mark_loaded: bool,
    ) -> Result<bool, CacheError> {
        let value = self.admit(value)?;
        let mut changed = false;
        if update_initial && self.initial_value != value {
            self.initial_value = value.clone();
            changed = true;
        }
        if self.value != value {
            self.value = value;
            changed = true;
        }
        if mark_loaded && !self.loaded {
            self.loaded = true;
            changed = true;
        }
        if changed {
            self.version += 1;
        }
        Ok(changed)
    }

    /// Reset `value` to `initial_value`.
    pub fn revert(&mut self) -> bool {
        let mut changed = false;
        if self.value != self.initial_value {
            self.value = self.initial_value.clone();
            changed = true;
        }
        for window in self.windows.values_mut() {
            changed |= window.revert_local();
        }
        if changed {
            self.version += 1;
        }
        changed
    }

    pub fn mark_loaded(&mut self) -> bool {
        if self.loaded {
            return false;
        }
        self.loaded = true;
        self.version += 1;
        true
    }

    pub fn add_error(&mut self, message: &str) {
        if !self.errors.iter().any(|existing| existing == message) {
            self.errors.push(message.to_string());
            self.version += 1;
        }
    }

    pub fn reset_errors(&mut self) -> bool {
        if self.errors.is_empty() {
            return false;
        }
        self.errors.clear();
        self.version += 1;
        true
    }

    /// Fails unless this root may reference `identity`.
    pub fn check_accepts(&self, identity: &Identity) -> Result<(), CacheError> {
        if self.kind() == RootKind::Scalar {
            return Err(CacheError::TypeMismatch {
                field: self.key.to_string(),
                expected: "a scalar value".to_string(),
                found: identity.entity_type().to_string(),
            });
        }
        if self.accepts.is_empty() || self.accepts.contains(identity.entity_type()) {
            return Ok(());
        }
        Err(CacheError::TypeMismatch {
            field: self.key.to_string(),
            expected: self
                .accepts
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join("|"),
            found: identity.entity_type().to_string(),
        })
    }

    fn admit(&self, value: RootValue) -> Result<RootValue, CacheError> {
        if value.kind() != self.kind() {
            return Err(CacheError::TypeMismatch {
                field: self.key.to_string(),
                expected: format!("{:?}", self.kind()),
                found: format!("{:?}", value.kind()),
            });
        }
        for identity in value.references() {
            self.check_accepts(&identity)?;
        }
        Ok(match (value, &self.processor) {
            (RootValue::Scalar(raw), Some(processor)) => RootValue::Scalar(processor(raw)),
            (value, _) => value,
        })
    }

    /// Point a node root at `target`. Returns the previous target.
    pub(crate) fn set_node(
        &mut self,
        target: Option<Identity>,
        update_initial: bool,
    ) -> Result<Option<Identity>, CacheError> {
        let previous = self.node_value().cloned();
        if let Some(identity) = &target {
            self.check_accepts(identity)?;
        }
        let mut changed = false;
        if update_initial && self.initial_value != RootValue::Node(target.clone()) {
            self.initial_value = RootValue::Node(target.clone());
            changed = true;
        }
        if previous != target {
            self.value = RootValue::Node(target);
            changed = true;
        }
        if changed {
            self.version += 1;
        }
        Ok(previous)
    }

    /// Add `identity` to a connection root. Returns true when the membership changed.
    pub(crate) fn insert_member(
        &mut self,
        identity: &Identity,
        update_initial: bool,
    ) -> Result<bool, CacheError> {
        self.check_accepts(identity)?;
        let mut changed = false;
        if let RootValue::Connection(members) = &mut self.value {
            changed |= members.insert(identity.clone());
        }
        if update_initial {
            if let RootValue::Connection(members) = &mut self.initial_value {
                changed |= members.insert(identity.clone());
            }
        }
        if changed {
            self.version += 1;
        }
        Ok(changed)
    }

    /// Drop `identity` from a connection root. With `prune_windows`, every window forgets it too.
    pub(crate) fn remove_member(
        &mut self,
        identity: &Identity,
        update_initial: bool,
        prune_windows: bool,
    ) -> bool {
        let mut changed = false;
        if let RootValue::Connection(members) = &mut self.value {
            changed |= members.remove(identity);
        }
        if update_initial {
            if let RootValue::Connection(members) = &mut self.initial_value {
                changed |= members.remove(identity);
            }
        }
        if prune_windows {
            for window in self.windows.values_mut() {
                changed |= window.prune(identity);
            }
        }
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Drop `identity` from the persisted value only, for entities that left the cache while
    /// the current value pointed elsewhere.
    pub(crate) fn forget_committed(&mut self, identity: &Identity) -> bool {
        let forgotten = match &mut self.initial_value {
            RootValue::Node(node) if node.as_ref() == Some(identity) => {
                *node = None;
                true
            }
            RootValue::Connection(members) => members.remove(identity),
            _ => false,
        };
        if forgotten {
            self.version += 1;
        }
        forgotten
    }

    /// Record a change made through a window borrowed from [RootCell::window_for].
    pub(crate) fn bump(&mut self) {
        self.version += 1;
    }

    pub fn windows(&self) -> &BTreeMap<String, ConnectionWindow> {
        &self.windows
    }

    pub fn window(&self, variables: &Map<String, Value>) -> Option<&ConnectionWindow> {
        self.windows.get(&identify(variables))
    }

    /// Window for `variables`, created on first use. Only connection roots own windows.
    pub fn window_for(
        &mut self,
        variables: &Map<String, Value>,
    ) -> Result<&mut ConnectionWindow, CacheError> {
        if self.kind() != RootKind::Connection {
            return Err(CacheError::TypeMismatch {
                field: self.key.to_string(),
                expected: "Connection".to_string(),
                found: format!("{:?}", self.kind()),
            });
        }
        Ok(self
            .windows
            .entry(identify(variables))
            .or_insert_with(|| ConnectionWindow::new(variables.clone())))
    }
}
