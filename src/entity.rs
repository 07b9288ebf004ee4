//! Read-only entity views.
//!
//! An entity owns no data: every field lives in a root cell keyed by `(identity, property)`. The
//! types here are snapshots assembled from those cells by [crate::cache::Cache] accessors, so
//! holding one never blocks writers.

use crate::{
    cache::{RootCell, RootValue},
    identity::{EntityType, Identity},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot of one field's root cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldView {
    pub value: RootValue,
    pub initial_value: RootValue,
    pub loaded: bool,
    pub errors: Vec<String>,
    pub version: u64,
}

impl FieldView {
    /// State of a field whose root has not been created yet.
    pub fn unloaded(value: RootValue) -> Self {
        FieldView {
            initial_value: value.clone(),
            value,
            loaded: false,
            errors: Vec::new(),
            version: 0,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.value == self.initial_value
    }

    pub fn scalar(&self) -> Option<&Value> {
        match &self.value {
            RootValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn node(&self) -> Option<&Identity> {
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
}

impl From<&RootCell> for FieldView {
    fn from(cell: &RootCell) -> Self {
        FieldView {
            value: cell.get().clone(),
            initial_value: cell.initial_value().clone(),
            loaded: cell.loaded(),
            errors: cell.errors().to_vec(),
            version: cell.version(),
        }
    }
}

/// Snapshot of an entity and all of its declared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub identity: Identity,
    /// Server identifier, canonicalized to a string. `None` until the server assigns one.
    pub identifier: Option<String>,
    pub is_deleted: bool,
    pub fields: BTreeMap<String, FieldView>,
}

impl Entity {
    pub fn entity_type(&self) -> &EntityType {
        self.identity.entity_type()
    }

    /// No server identifier assigned yet.
    pub fn is_new(&self) -> bool {
        self.identifier.is_none()
    }

    pub fn field(&self, name: &str) -> Option<&FieldView> {
        self.fields.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<&Value> {
        self.field(name).and_then(FieldView::scalar)
    }

    pub fn node(&self, name: &str) -> Option<&Identity> {
        self.field(name).and_then(FieldView::node)
    }

    pub fn members(&self, name: &str) -> Option<&BTreeSet<Identity>> {
        self.field(name).and_then(FieldView::members)
    }

    /// True when any field differs from its last persisted value.
    pub fn has_unsaved_changes(&self) -> bool {
        self.fields.values().any(|field| !field.is_settled())
    }
}

/// Canonical string form of a server identifier. Strings are used verbatim and numbers use their
/// JSON rendering, so `7` and `"7"` name the same entity. Anything else is not an identifier.
pub fn identifier_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn test_identifier_key() {
        assert_eq!(identifier_key(&json!("A1")), Some("A1".to_string()));
        assert_eq!(identifier_key(&json!(7)), identifier_key(&json!("7")));
        assert_eq!(identifier_key(&json!("")), None);
        assert_eq!(identifier_key(&Value::Null), None);
        assert_eq!(identifier_key(&json!({"id": 1})), None);
    }

    #[test]
    fn test_unloaded_field_view() {
        let view = FieldView::unloaded(RootValue::Scalar(json!("draft")));
        assert!(!view.loaded);
        assert!(view.is_settled());
        assert_eq!(view.scalar(), Some(&json!("draft")));
        assert_eq!(view.node(), None);
    }
}
