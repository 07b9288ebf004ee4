//! Response normalization.
//!
//! The [Normalizer] walks a response document alongside the [ExpectationTable] composed for it,
//! and decomposes it into identity-keyed root cell writes. Classification is looked up by
//! `(response_key, level)`, never guessed from the data. Data that contradicts its expectation is
//! logged as an unexpected structure and skipped; the rest of the response still normalizes.

use crate::{
    cache::{CacheState, RootKey, RootKind, RootValue},
    entity::identifier_key,
    error::CacheError,
    event::{CacheEvent, EventOrigin},
    identity::{EntityType, Identity},
    query::{Expectation, ExpectationKind, ExpectationTable},
    transport::{render_path, GraphQLError, PathSegment},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// What one normalization pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub entities_created: Vec<Identity>,
    /// Roots written (or confirmed) by this pass.
    pub roots_written: usize,
    pub errors_attached: usize,
    /// Messages of errors whose path addressed no root cell.
    pub unmatched_errors: Vec<String>,
    /// Paths of subtrees skipped as unexpected structure.
    pub skipped: Vec<String>,
}

/// Where a response key sits.
#[derive(Debug, Clone, Default)]
struct Frame {
    level: usize,
    path: Vec<PathSegment>,
    /// Entity whose fields are being walked.
    parent: Option<Identity>,
    /// Connection root collecting the members found below.
    container: Option<RootKey>,
}

impl Frame {
    fn child(&self, key: &str) -> Vec<PathSegment> {
        let mut path = self.path.clone();
        path.push(PathSegment::Key(key.to_string()));
        path
    }
}

pub struct Normalizer<'a> {
    state: &'a mut CacheState,
    expectations: &'a ExpectationTable,
    errors: &'a [GraphQLError],
    consumed: Vec<bool>,
    report: NormalizeReport,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        state: &'a mut CacheState,
        expectations: &'a ExpectationTable,
        errors: &'a [GraphQLError],
    ) -> Self {
        Normalizer {
            state,
            expectations,
            errors,
            consumed: vec![false; errors.len()],
            report: NormalizeReport::default(),
        }
    }

    /// Normalize one response `data` object.
    pub fn run(mut self, data: &Value) -> Result<NormalizeReport, CacheError> {
        let frame = Frame::default();
        match data {
            Value::Object(map) => {
                for (key, value) in map.iter() {
                    self.walk(key, value, &frame, None)?;
                }
                self.attach_absent(&frame, map)?;
            }
            Value::Null => self.attach_absent(&frame, &Map::new())?,
            _ => self.skip(&[], "response data is not an object"),
        }
        for (error, consumed) in self.errors.iter().zip(self.consumed.iter()) {
            if !consumed {
                tracing::debug!(
                    "[Normalizer::run] Unmatched error at '{}': {}",
                    render_path(error.path()),
                    error.message
                );
                self.report.unmatched_errors.push(error.message.clone());
            }
        }
        tracing::debug!(
            "[Normalizer::run] {} entities created, {} roots written, {} errors attached",
            self.report.entities_created.len(),
            self.report.roots_written,
            self.report.errors_attached
        );
        Ok(self.report)
    }

    fn walk(
        &mut self,
        key: &str,
        value: &Value,
        frame: &Frame,
        pending: Option<&mut Vec<Identity>>,
    ) -> Result<(), CacheError> {
        if key.starts_with("__") {
            return Ok(());
        }
        let path = frame.child(key);
        let expectations = self.expectations;
        let Some(expectation) = expectations.get(key, frame.level) else {
            self.skip(&path, "no expectation registered");
            return Ok(());
        };
        if self.attach_errors(expectation, &path, value.is_null(), frame)? {
            return Ok(());
        }
        match expectation.kind {
            ExpectationKind::Scalar => self.scalar(expectation, value, &path, frame),
            ExpectationKind::Node => self.node(expectation, value, &path, frame, pending),
            ExpectationKind::Connection => self.connection(expectation, value, &path, frame),
            ExpectationKind::Edges => self.edges(value, &path, frame, pending),
            ExpectationKind::NodeList => self.node_list(expectation, value, &path, frame, pending),
            ExpectationKind::Record | ExpectationKind::End => Ok(()),
        }
    }

    fn skip(&mut self, path: &[PathSegment], reason: &str) {
        let rendered = render_path(path);
        tracing::warn!("[Normalizer] unexpected structure at '{rendered}': {reason}");
        self.report.skipped.push(rendered);
    }

    /// The root cell an expectation addresses from `frame`.
    fn root_key(&self, expectation: &Expectation, frame: &Frame) -> Option<RootKey> {
        let root_kind = expectation.kind.root_kind()?;
        if let Some(owner) = &frame.parent {
            return Some(RootKey::field(owner, &expectation.field_key));
        }
        if let Some(container) = &frame.container {
            return Some(container.clone());
        }
        let entity_type = expectation.entity_type.clone()?;
        Some(RootKey::top(entity_type, &expectation.field_key, root_kind))
    }

    /// Attach every error addressed at `path` (or anywhere below it, when the value there is
    /// null) to the root `expectation` stands for. Returns true when errors were found, in which
    /// case no value is written for this key.
    fn attach_errors(
        &mut self,
        expectation: &Expectation,
        path: &[PathSegment],
        is_null: bool,
        frame: &Frame,
    ) -> Result<bool, CacheError> {
        let errors = self.errors;
        let matched: Vec<usize> = errors
            .iter()
            .enumerate()
            .filter(|(idx, error)| {
                !self.consumed[*idx]
                    && (error.path() == path || (is_null && error.path().starts_with(path)))
            })
            .map(|(idx, _)| idx)
            .collect();
        if matched.is_empty() {
            return Ok(false);
        }
        if let Some(key) = self.root_key(expectation, frame) {
            for idx in matched {
                self.attach_error(&key, idx);
            }
        }
        Ok(true)
    }

    /// Errors below `frame.path` whose next key is absent from `object`.
    fn attach_absent(&mut self, frame: &Frame, object: &Map<String, Value>) -> Result<(), CacheError> {
        let depth = frame.path.len();
        let expectations = self.expectations;
        let errors = self.errors;
        for (idx, error) in errors.iter().enumerate() {
            if self.consumed[idx] {
                continue;
            }
            let error_path = error.path();
            if error_path.len() <= depth || !error_path.starts_with(&frame.path) {
                continue;
            }
            let PathSegment::Key(key) = &error_path[depth] else {
                continue;
            };
            if object.contains_key(key) {
                continue;
            }
            let Some(expectation) = expectations.get(key, frame.level) else {
                continue;
            };
            if let Some(root) = self.root_key(expectation, frame) {
                self.attach_error(&root, idx);
            }
        }
        Ok(())
    }

    fn attach_error(&mut self, key: &RootKey, idx: usize) {
        let errors = self.errors;
        let message = errors[idx].message.clone();
        match self.state.ensure_root(key) {
            Ok(cell) => {
                cell.add_error(&message);
                let count = cell.errors().len();
                self.consumed[idx] = true;
                self.report.errors_attached += 1;
                tracing::debug!("[Normalizer::attach_error] {key}: {message}");
                self.state.emit(CacheEvent::RootErrored(key.clone(), count));
            }
            Err(err) => {
                tracing::warn!("[Normalizer::attach_error] cannot attach '{message}' to {key}: {err}");
            }
        }
    }

    /// Version of root `key`, creating it first.
    fn version_of(&mut self, key: &RootKey) -> Result<(RootKind, u64), CacheError> {
        let cell = self.state.ensure_root(key)?;
        Ok((cell.kind(), cell.version()))
    }

    /// Mark a written root loaded, clear its errors and announce it if anything changed.
    fn settle(&mut self, key: &RootKey, before: u64) -> Result<(), CacheError> {
        let clear = self.state.config.clear_errors_on_write;
        let cell = self.state.root_mut(key)?;
        cell.mark_loaded();
        if clear {
            cell.reset_errors();
        }
        let changed = cell.version() != before;
        self.report.roots_written += 1;
        if changed {
            self.state.touch(key, EventOrigin::Remote);
        }
        Ok(())
    }

    fn scalar(
        &mut self,
        expectation: &Expectation,
        value: &Value,
        path: &[PathSegment],
        frame: &Frame,
    ) -> Result<(), CacheError> {
        let Some(key) = self.root_key(expectation, frame) else {
            self.skip(path, "scalar outside of an entity");
            return Ok(());
        };
        let (kind, before) = self.version_of(&key)?;
        if kind != RootKind::Scalar {
            self.skip(path, "expected a scalar field");
            return Ok(());
        }
        self.state
            .root_mut(&key)?
            .update(RootValue::Scalar(value.clone()), true, true)?;
        self.settle(&key, before)
    }

    /// Find or create the entity `object` describes. `None` (after logging) when it carries no
    /// usable identifier.
    fn resolve_entity(
        &mut self,
        expectation: &Expectation,
        object: &Map<String, Value>,
        path: &[PathSegment],
    ) -> Result<Option<Identity>, CacheError> {
        let Some(mut entity_type) = expectation.entity_type.clone() else {
            self.skip(path, "no entity type for node");
            return Ok(None);
        };
        let mut identifier_field = expectation.identifier_field.clone();
        if let Some(Value::String(typename)) = object.get("__typename") {
            let concrete = EntityType::from(typename.as_str());
            if concrete != entity_type && self.state.schemas.contains(&concrete) {
                entity_type = concrete;
                identifier_field = None;
            }
        }
        let identifier_field = match identifier_field {
            Some(field) => field,
            None => self.state.schemas.identifier_field(&entity_type)?,
        };
        let schema = self.state.schemas.get(&entity_type)?;
        let raw = object
            .get(schema.data_key_for_property(&identifier_field))
            .or_else(|| object.get(&identifier_field));
        let Some(raw) = raw.filter(|raw| identifier_key(raw).is_some()) else {
            self.skip(path, "record carries no valid identifier");
            return Ok(None);
        };
        let (identity, created) =
            self.state
                .resolve_identifier(&entity_type, raw, EventOrigin::Remote)?;
        if created {
            self.report.entities_created.push(identity.clone());
        }
        Ok(Some(identity))
    }

    /// Walk the fields of entity `owner`, one level down.
    fn walk_fields(
        &mut self,
        object: &Map<String, Value>,
        path: &[PathSegment],
        level: usize,
        owner: &Identity,
    ) -> Result<(), CacheError> {
        let frame = Frame {
            level,
            path: path.to_vec(),
            parent: Some(owner.clone()),
            container: None,
        };
        for (key, value) in object.iter() {
            self.walk(key, value, &frame, None)?;
        }
        self.attach_absent(&frame, object)
    }

    /// Reference `target` from the root `expectation` addresses, committing it as persisted.
    fn reference(
        &mut self,
        expectation: &Expectation,
        target: &Identity,
        path: &[PathSegment],
        frame: &Frame,
    ) -> Result<bool, CacheError> {
        let Some(key) = self.root_key(expectation, frame) else {
            return Ok(false);
        };
        let (_, before) = self.version_of(&key)?;
        match self.state.attach(&key, target, true, EventOrigin::Remote) {
            Ok(()) => {}
            Err(err @ CacheError::TypeMismatch { .. }) => {
                self.skip(path, &err.to_string());
                return Ok(false);
            }
            Err(err) => return Err(err),
        }
        self.settle(&key, before)?;
        Ok(true)
    }

    fn node(
        &mut self,
        expectation: &Expectation,
        value: &Value,
        path: &[PathSegment],
        frame: &Frame,
        pending: Option<&mut Vec<Identity>>,
    ) -> Result<(), CacheError> {
        let object = match value {
            Value::Object(object) => object,
            Value::Null if pending.is_none() => return self.clear_reference(expectation, path, frame),
            Value::Null => return Ok(()),
            _ => {
                self.skip(path, "expected an object");
                return Ok(());
            }
        };
        let Some(identity) = self.resolve_entity(expectation, object, path)? else {
            return Ok(());
        };
        match pending {
            Some(pending) => {
                if !pending.contains(&identity) {
                    pending.push(identity.clone());
                }
            }
            None => {
                if !self.reference(expectation, &identity, path, frame)? {
                    return Ok(());
                }
            }
        }
        self.walk_fields(object, path, frame.level + 1, &identity)
    }

    /// A null to-one: drop whatever the root referenced.
    fn clear_reference(
        &mut self,
        expectation: &Expectation,
        path: &[PathSegment],
        frame: &Frame,
    ) -> Result<(), CacheError> {
        let Some(key) = self.root_key(expectation, frame) else {
            return Ok(());
        };
        let (kind, before) = self.version_of(&key)?;
        if kind != RootKind::Node {
            self.skip(path, "expected a to-one field");
            return Ok(());
        }
        let current = self.state.root_mut(&key)?.node_value().cloned();
        if let Some(current) = current {
            self.state
                .detach(&key, &current, true, EventOrigin::Remote)?;
        }
        self.state
            .root_mut(&key)?
            .update(RootValue::Node(None), true, true)?;
        self.settle(&key, before)
    }

    fn connection(
        &mut self,
        expectation: &Expectation,
        value: &Value,
        path: &[PathSegment],
        frame: &Frame,
    ) -> Result<(), CacheError> {
        let container = Frame {
            level: frame.level,
            path: frame.path.clone(),
            parent: frame.parent.clone(),
            container: None,
        };
        let Some(key) = self.root_key(expectation, &container) else {
            self.skip(path, "connection without a root");
            return Ok(());
        };
        let (kind, before) = self.version_of(&key)?;
        if kind != RootKind::Connection {
            self.skip(path, "expected a to-many field");
            return Ok(());
        }
        let object = match value {
            Value::Object(object) => object,
            Value::Null => return self.settle(&key, before),
            _ => {
                self.skip(path, "expected an object");
                return Ok(());
            }
        };

        let page_info_key = self.state.config.page_info_key.clone();
        let inner = Frame {
            level: frame.level + 1,
            path: path.to_vec(),
            parent: None,
            container: Some(key.clone()),
        };
        let mut members = Vec::new();
        for (child, child_value) in object.iter() {
            if *child == page_info_key {
                continue;
            }
            self.walk(child, child_value, &inner, Some(&mut members))?;
        }

        let accepted = self.attach_members(&key, members, path)?;
        let variables = expectation.query_params.clone().unwrap_or_default();
        let page_info = object.get(&page_info_key).cloned();
        if self
            .state
            .connection_window(&key, &variables)?
            .update(page_info, accepted)
        {
            self.state.root_mut(&key)?.bump();
        }
        self.settle(&key, before)
    }

    /// Register `members` on connection root `key` (set union). Members the root does not
    /// accept are skipped. Returns the accepted ones in order.
    fn attach_members(
        &mut self,
        key: &RootKey,
        members: Vec<Identity>,
        path: &[PathSegment],
    ) -> Result<Vec<Identity>, CacheError> {
        let mut accepted = Vec::with_capacity(members.len());
        for member in members {
            match self.state.attach(key, &member, true, EventOrigin::Remote) {
                Ok(()) => accepted.push(member),
                Err(err @ CacheError::TypeMismatch { .. }) => self.skip(path, &err.to_string()),
                Err(err) => return Err(err),
            }
        }
        Ok(accepted)
    }

    fn edges(
        &mut self,
        value: &Value,
        path: &[PathSegment],
        frame: &Frame,
        pending: Option<&mut Vec<Identity>>,
    ) -> Result<(), CacheError> {
        let items = match value {
            Value::Array(items) => items,
            Value::Null => return Ok(()),
            _ => {
                self.skip(path, "expected a list of edges");
                return Ok(());
            }
        };
        let mut discarded = Vec::new();
        let pending = match pending {
            Some(pending) => pending,
            None => &mut discarded,
        };
        for (idx, edge) in items.iter().enumerate() {
            let mut edge_path = path.to_vec();
            edge_path.push(PathSegment::Index(idx));
            match edge {
                Value::Object(edge) => {
                    let inner = Frame {
                        level: frame.level + 1,
                        path: edge_path,
                        parent: None,
                        container: frame.container.clone(),
                    };
                    for (key, value) in edge.iter() {
                        self.walk(key, value, &inner, Some(&mut *pending))?;
                    }
                }
                Value::Null => {}
                _ => self.skip(&edge_path, "expected an edge object"),
            }
        }
        Ok(())
    }

    fn node_list(
        &mut self,
        expectation: &Expectation,
        value: &Value,
        path: &[PathSegment],
        frame: &Frame,
        pending: Option<&mut Vec<Identity>>,
    ) -> Result<(), CacheError> {
        let items = match value {
            Value::Array(items) => items,
            Value::Null => return Ok(()),
            _ => {
                self.skip(path, "expected a list");
                return Ok(());
            }
        };
        let mut members = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let mut item_path = path.to_vec();
            item_path.push(PathSegment::Index(idx));
            match item {
                Value::Object(object) => {
                    if let Some(identity) = self.resolve_entity(expectation, object, &item_path)? {
                        if !members.contains(&identity) {
                            members.push(identity.clone());
                        }
                        self.walk_fields(object, &item_path, frame.level + 1, &identity)?;
                    }
                }
                Value::Null => {}
                _ => self.skip(&item_path, "expected an object"),
            }
        }
        match pending {
            Some(pending) => {
                for member in members {
                    if !pending.contains(&member) {
                        pending.push(member);
                    }
                }
                Ok(())
            }
            None => self.replace_members(expectation, members, path, frame),
        }
    }

    /// Complete-list sync: the root's membership (current and persisted) becomes exactly
    /// `members`, and the window for this request's variables is replaced.
    fn replace_members(
        &mut self,
        expectation: &Expectation,
        members: Vec<Identity>,
        path: &[PathSegment],
        frame: &Frame,
    ) -> Result<(), CacheError> {
        let Some(key) = self.root_key(expectation, frame) else {
            self.skip(path, "list without a root");
            return Ok(());
        };
        let (kind, before) = self.version_of(&key)?;
        if kind != RootKind::Connection {
            self.skip(path, "expected a to-many field");
            return Ok(());
        }
        let cell = self.state.root_mut(&key)?;
        let mut stale: BTreeSet<Identity> = cell.get().references().into_iter().collect();
        stale.extend(cell.initial_value().references());
        for identity in stale.iter().filter(|identity| !members.contains(identity)) {
            self.state
                .detach(&key, identity, true, EventOrigin::Remote)?;
        }
        let accepted = self.attach_members(&key, members, path)?;
        let variables = expectation.query_params.clone().unwrap_or_default();
        if self
            .state
            .connection_window(&key, &variables)?
            .replace_records(None, accepted)
        {
            self.state.root_mut(&key)?.bump();
        }
        self.settle(&key, before)
    }
}
