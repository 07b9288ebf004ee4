use crate::{
    config::{CacheConfig, DEFAULT_CONFIG},
    entity::{identifier_key, Entity, FieldView},
    error::CacheError,
    event::{CacheEvent, EventOrigin},
    identity::{EntityType, Identity, IdentityAllocator},
    normalize::{NormalizeReport, Normalizer},
    query::ExpectationTable,
    schema::{FieldMeta, RelationshipKind, SchemaRegistry},
    transport::{GraphQLError, GraphQLResponse},
};
use parking_lot::{RwLock, RwLockReadGuard};
use serde_json::{Map, Value};
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::mpsc::UnboundedSender;

use super::{
    bonds::BondIndex,
    root::{RootCell, RootKey, RootKind, RootValue},
    window::{ConnectionWindow, WindowView},
};

/// Build the root cell `key` addresses from its schema metadata.
fn build_root(schemas: &SchemaRegistry, key: &RootKey) -> Result<RootCell, CacheError> {
    match key {
        RootKey::Field { identity, field } => {
            let entity_type = identity.entity_type();
            let meta = schemas.field(entity_type, field)?;
            Ok(match &meta {
                FieldMeta::Attribute { default_value, .. } => RootCell::scalar(
                    key.clone(),
                    default_value.clone().unwrap_or(Value::Null),
                    schemas.field_processor(entity_type, field)?,
                ),
                FieldMeta::Relationship {
                    kind: RelationshipKind::ToOne,
                    ..
                } => RootCell::node(key.clone(), meta.accepted_types()),
                FieldMeta::Relationship {
                    kind: RelationshipKind::ToMany,
                    ..
                } => RootCell::connection(key.clone(), meta.accepted_types()),
            })
        }
        RootKey::Top {
            entity_type, kind, ..
        } => {
            schemas.get(entity_type)?;
            let accepts = BTreeSet::from([entity_type.clone()]);
            Ok(match kind {
                RootKind::Scalar => RootCell::scalar(key.clone(), Value::Null, None),
                RootKind::Node => RootCell::node(key.clone(), accepts),
                RootKind::Connection => RootCell::connection(key.clone(), accepts),
            })
        }
    }
}

/// The mutable core of a [Cache]: identity tables, root cells and the bond index.
///
/// All mutation is synchronous and runs under the owning [Cache]'s write lock, so every public
/// operation observes (and leaves behind) a state in which the bond invariant holds.
pub struct CacheState {
    pub(crate) schemas: SchemaRegistry,
    pub(crate) config: Arc<CacheConfig>,
    allocator: IdentityAllocator,
    /// Every live entity and its canonical server identifier, if known.
    pub(crate) entities: BTreeMap<Identity, Option<String>>,
    identifiers: BTreeMap<(EntityType, String), Identity>,
    pub(crate) roots: BTreeMap<RootKey, RootCell>,
    pub(crate) bonds: BondIndex,
    removed: BTreeSet<Identity>,
    tx: Option<UnboundedSender<CacheEvent>>,
}

impl CacheState {
    pub fn new(schemas: SchemaRegistry, config: Arc<CacheConfig>) -> Self {
        CacheState {
            schemas,
            config,
            allocator: IdentityAllocator::default(),
            entities: BTreeMap::new(),
            identifiers: BTreeMap::new(),
            roots: BTreeMap::new(),
            bonds: BondIndex::default(),
            removed: BTreeSet::new(),
            tx: None,
        }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn roots(&self) -> &BTreeMap<RootKey, RootCell> {
        &self.roots
    }

    pub fn bonds(&self) -> &BondIndex {
        &self.bonds
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entities.contains_key(identity)
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("[CacheState::emit] Event receiver dropped");
            }
        }
    }

    /// Announce that root `key` changed.
    pub(crate) fn touch(&self, key: &RootKey, origin: EventOrigin) {
        if let Some(cell) = self.roots.get(key) {
            self.emit(CacheEvent::RootUpdated(key.clone(), cell.version(), origin));
        }
    }

    pub(crate) fn create_entity(
        &mut self,
        entity_type: &EntityType,
        origin: EventOrigin,
    ) -> Result<Identity, CacheError> {
        self.schemas.get(entity_type)?;
        let identity = self.allocator.allocate(entity_type);
        self.entities.insert(identity.clone(), None);
        tracing::debug!("[CacheState::create_entity] {identity}");
        self.emit(CacheEvent::EntityCreated(identity.clone(), origin));
        Ok(identity)
    }

    pub fn lookup_identifier(&self, entity_type: &EntityType, identifier: &str) -> Option<&Identity> {
        self.identifiers
            .get(&(entity_type.clone(), identifier.to_string()))
    }

    /// The entity with server identifier `raw`, created on first sight. Returns whether it was
    /// created. New entities get `raw` committed into their identifier root.
    pub(crate) fn resolve_identifier(
        &mut self,
        entity_type: &EntityType,
        raw: &Value,
        origin: EventOrigin,
    ) -> Result<(Identity, bool), CacheError> {
        let identifier = identifier_key(raw).ok_or_else(|| {
            CacheError::MissingIdentifier(format!("{entity_type} (got {raw})"))
        })?;
        if let Some(identity) = self.lookup_identifier(entity_type, &identifier) {
            return Ok((identity.clone(), false));
        }
        let identity = self.create_entity(entity_type, origin)?;
        self.bind_identifier(&identity, raw, origin)?;
        Ok((identity, true))
    }

    /// Attach server identifier `raw` to an existing entity.
    pub(crate) fn bind_identifier(
        &mut self,
        identity: &Identity,
        raw: &Value,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        let entity_type = identity.entity_type().clone();
        let identifier = identifier_key(raw).ok_or_else(|| {
            CacheError::MissingIdentifier(format!("{entity_type} (got {raw})"))
        })?;
        let current = self
            .entities
            .get(identity)
            .ok_or_else(|| CacheError::NotFound(identity.to_string()))?
            .clone();
        if current.as_deref() == Some(identifier.as_str()) {
            return Ok(());
        }
        match self.lookup_identifier(&entity_type, &identifier) {
            Some(owner) if owner != identity => {
                return Err(CacheError::IdentifierConflict {
                    entity_type: entity_type.to_string(),
                    identifier,
                })
            }
            _ => {}
        }
        let identifier_field = self.schemas.identifier_field(&entity_type)?;
        if let Some(previous) = current {
            self.identifiers.remove(&(entity_type.clone(), previous));
        }
        self.identifiers
            .insert((entity_type, identifier.clone()), identity.clone());
        self.entities.insert(identity.clone(), Some(identifier));

        let key = RootKey::field(identity, &identifier_field);
        if self
            .ensure_root(&key)?
            .update(RootValue::Scalar(raw.clone()), true, true)?
        {
            self.touch(&key, origin);
        }
        Ok(())
    }

    /// Root cell `key`, created from schema metadata on first use.
    pub(crate) fn ensure_root(&mut self, key: &RootKey) -> Result<&mut RootCell, CacheError> {
        if let Some(owner) = key.owner() {
            if !self.entities.contains_key(owner) {
                return Err(CacheError::NotFound(owner.to_string()));
            }
        }
        match self.roots.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(build_root(&self.schemas, key)?)),
        }
    }

    pub(crate) fn root_mut(&mut self, key: &RootKey) -> Result<&mut RootCell, CacheError> {
        self.roots
            .get_mut(key)
            .ok_or_else(|| CacheError::MissingRoot(key.to_string()))
    }

    pub fn entity(&self, identity: &Identity) -> Option<Entity> {
        let identifier = self.entities.get(identity)?.clone();
        let schema = self.schemas.get(identity.entity_type()).ok()?;
        let fields = schema
            .fields
            .keys()
            .filter_map(|name| {
                self.field_view(identity, name)
                    .ok()
                    .map(|view| (name.clone(), view))
            })
            .collect();
        Some(Entity {
            identity: identity.clone(),
            identifier,
            is_deleted: self.removed.contains(identity),
            fields,
        })
    }

    /// Field state without creating its root. Fields never written read as their default and
    /// `loaded == false`.
    pub fn field_view(&self, identity: &Identity, field: &str) -> Result<FieldView, CacheError> {
        if !self.entities.contains_key(identity) {
            return Err(CacheError::NotFound(identity.to_string()));
        }
        let key = RootKey::field(identity, field);
        if let Some(cell) = self.roots.get(&key) {
            return Ok(FieldView::from(cell));
        }
        let cell = build_root(&self.schemas, &key)?;
        Ok(FieldView::unloaded(cell.get().clone()))
    }

    /// Root `key` as stored, or as it would be built on first write.
    pub fn root_view(&self, key: &RootKey) -> Result<RootCell, CacheError> {
        if let Some(owner) = key.owner() {
            if !self.entities.contains_key(owner) {
                return Err(CacheError::NotFound(owner.to_string()));
            }
        }
        match self.roots.get(key) {
            Some(cell) => Ok(cell.clone()),
            None => build_root(&self.schemas, key),
        }
    }

    pub fn removed(&self) -> &BTreeSet<Identity> {
        &self.removed
    }

    pub(crate) fn mark_for_removal(&mut self, identity: &Identity) -> Result<bool, CacheError> {
        if !self.entities.contains_key(identity) {
            return Err(CacheError::NotFound(identity.to_string()));
        }
        Ok(self.removed.insert(identity.clone()))
    }

    pub(crate) fn unmark_for_removal(&mut self, identity: &Identity) -> bool {
        self.removed.remove(identity)
    }

    /// Delete an entity: unwind every bond pointing at it, drop its own root cells (and the bonds
    /// they held), then forget its identity and identifier mappings.
    pub(crate) fn remove_pod(
        &mut self,
        identity: &Identity,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        let identifier = self
            .entities
            .get(identity)
            .ok_or_else(|| CacheError::NotFound(identity.to_string()))?
            .clone();
        self.unregister_bonds(identity, true, origin)?;

        let own_roots: Vec<RootKey> = self
            .roots
            .keys()
            .filter(|key| key.owner() == Some(identity))
            .cloned()
            .collect();
        for key in own_roots {
            if let Some(cell) = self.roots.remove(&key) {
                for target in cell.get().references() {
                    self.bonds.remove(&target, &key);
                }
            }
        }

        // Roots whose current value moved away still hold `identity` as committed.
        let committed: Vec<RootKey> = self
            .roots
            .iter()
            .filter(|(_, cell)| cell.initial_value().contains(identity))
            .map(|(key, _)| key.clone())
            .collect();
        for key in committed {
            if self.root_mut(&key)?.forget_committed(identity) {
                self.touch(&key, origin);
            }
        }

        if let Some(identifier) = identifier {
            self.identifiers
                .remove(&(identity.entity_type().clone(), identifier));
        }
        self.entities.remove(identity);
        self.removed.remove(identity);
        tracing::debug!("[CacheState::remove_pod] {identity}");
        self.emit(CacheEvent::EntityRemoved(identity.clone(), origin));
        Ok(())
    }

    /// The connection root `key` and its window for `variables`, created as needed.
    pub(crate) fn connection_window(
        &mut self,
        key: &RootKey,
        variables: &Map<String, Value>,
    ) -> Result<&mut ConnectionWindow, CacheError> {
        self.ensure_root(key)?.window_for(variables)
    }
}

/// A normalized entity cache.
///
/// Cloning is cheap; clones share the same state. Reads take a shared lock, every mutation
/// (including a whole [Cache::serialize] pass) takes the write lock for its full duration, so
/// responses are applied one at a time in completion order.
#[derive(Clone)]
pub struct Cache {
    state: Arc<RwLock<CacheState>>,
}

impl Cache {
    pub fn new(schemas: SchemaRegistry) -> Self {
        Cache::with_shared_config(schemas, DEFAULT_CONFIG.clone())
    }

    pub fn with_config(schemas: SchemaRegistry, config: CacheConfig) -> Self {
        Cache::with_shared_config(schemas, Arc::new(config))
    }

    fn with_shared_config(schemas: SchemaRegistry, config: Arc<CacheConfig>) -> Self {
        Cache {
            state: Arc::new(RwLock::new(CacheState::new(schemas, config))),
        }
    }

    /// Send a [CacheEvent] on `tx` for every entity creation, removal and root change.
    pub fn with_events(self, tx: UnboundedSender<CacheEvent>) -> Self {
        self.state.write().tx = Some(tx);
        self
    }

    pub fn schemas(&self) -> SchemaRegistry {
        self.state.read().schemas.clone()
    }

    pub fn config(&self) -> Arc<CacheConfig> {
        self.state.read().config.clone()
    }

    /// Shared read access to the whole state, for callers that need a consistent multi-root read.
    pub fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read()
    }

    /// Construct a client-only entity. It has no server identifier until [Cache::assign_identifier].
    pub fn create_pod<T: Into<EntityType>>(&self, entity_type: T) -> Result<Identity, CacheError> {
        self.state
            .write()
            .create_entity(&entity_type.into(), EventOrigin::Local)
    }

    /// Attach the server identifier (e.g. after a save). The entity keeps its identity.
    pub fn assign_identifier(&self, identity: &Identity, identifier: Value) -> Result<(), CacheError> {
        self.state
            .write()
            .bind_identifier(identity, &identifier, EventOrigin::Local)
    }

    pub fn lookup_by_identifier<T: Into<EntityType>>(
        &self,
        entity_type: T,
        identifier: &Value,
    ) -> Option<Entity> {
        let state = self.state.read();
        let identifier = identifier_key(identifier)?;
        let identity = state.lookup_identifier(&entity_type.into(), &identifier)?;
        state.entity(identity)
    }

    pub fn lookup_by_identity(&self, identity: &Identity) -> Option<Entity> {
        self.state.read().entity(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.state.read().contains(identity)
    }

    /// Snapshot of root `key`. A root never written reads as a fresh, unloaded cell; reading does
    /// not create it.
    pub fn root(&self, key: &RootKey) -> Result<RootCell, CacheError> {
        self.state.read().root_view(key)
    }

    /// Field state without creating the root. Unwritten fields report their default value.
    pub fn field(&self, identity: &Identity, field: &str) -> Result<FieldView, CacheError> {
        self.state.read().field_view(identity, field)
    }

    /// Local write of an attribute. The field stays unsettled until the next server sync commits
    /// it or [Cache::revert_field] restores the persisted value.
    pub fn set_field(&self, identity: &Identity, field: &str, value: Value) -> Result<(), CacheError> {
        let mut state = self.state.write();
        let key = RootKey::field(identity, field);
        let cell = state.ensure_root(&key)?;
        if cell.kind() != RootKind::Scalar {
            return Err(CacheError::TypeMismatch {
                field: key.to_string(),
                expected: format!("{:?}", cell.kind()),
                found: "a scalar value".to_string(),
            });
        }
        if cell.set(RootValue::Scalar(value))? {
            state.touch(&key, EventOrigin::Local);
        }
        Ok(())
    }

    /// Point a to-one relationship at `target` (or clear it). The inverse side is updated in the
    /// same step.
    pub fn set_relation(
        &self,
        identity: &Identity,
        field: &str,
        target: Option<&Identity>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write();
        let key = RootKey::field(identity, field);
        let kind = state.ensure_root(&key)?.kind();
        if kind != RootKind::Node {
            return Err(CacheError::TypeMismatch {
                field: key.to_string(),
                expected: format!("{kind:?}"),
                found: "a single reference".to_string(),
            });
        }
        match target {
            Some(target) => {
                if !state.contains(target) {
                    return Err(CacheError::NotFound(target.to_string()));
                }
                state.link(identity, field, target, false, EventOrigin::Local)
            }
            None => {
                let current = state.root_mut(&key)?.node_value().cloned();
                match current {
                    Some(current) => state.unlink(identity, field, &current, false, EventOrigin::Local),
                    None => Ok(()),
                }
            }
        }
    }

    /// Add `target` to connection root `key`; with `variables`, also record it as a local
    /// addition in that pagination window.
    pub fn add_to_connection(
        &self,
        key: &RootKey,
        target: &Identity,
        variables: Option<&Map<String, Value>>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write();
        Cache::require_connection(&mut state, key, target)?;
        state.attach(key, target, false, EventOrigin::Local)?;
        if let Some(variables) = variables {
            if state.connection_window(key, variables)?.add(target) {
                state.root_mut(key)?.bump();
                state.touch(key, EventOrigin::Local);
            }
        }
        Ok(())
    }

    pub fn remove_from_connection(
        &self,
        key: &RootKey,
        target: &Identity,
        variables: Option<&Map<String, Value>>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write();
        Cache::require_connection(&mut state, key, target)?;
        state.detach(key, target, false, EventOrigin::Local)?;
        if let Some(variables) = variables {
            if state.connection_window(key, variables)?.remove(target) {
                state.root_mut(key)?.bump();
                state.touch(key, EventOrigin::Local);
            }
        }
        Ok(())
    }

    fn require_connection(
        state: &mut CacheState,
        key: &RootKey,
        target: &Identity,
    ) -> Result<(), CacheError> {
        if !state.contains(target) {
            return Err(CacheError::NotFound(target.to_string()));
        }
        let kind = state.ensure_root(key)?.kind();
        if kind != RootKind::Connection {
            return Err(CacheError::TypeMismatch {
                field: key.to_string(),
                expected: format!("{kind:?}"),
                found: "a connection member".to_string(),
            });
        }
        Ok(())
    }

    /// Restore root `key` to its persisted value, discarding local window changes. Reference
    /// roots are reverted through the bond index so inverse sides follow.
    pub fn revert_field(&self, key: &RootKey) -> Result<bool, CacheError> {
        let mut state = self.state.write();
        let cell = state.root_mut(key)?;
        let version = cell.version();
        let current = cell.get().references();
        let initial = cell.initial_value().references();
        for target in current.iter().filter(|target| !initial.contains(target)) {
            state.detach(key, target, false, EventOrigin::Local)?;
        }
        for target in initial.iter().filter(|target| !current.contains(target)) {
            if state.contains(target) {
                state.attach(key, target, false, EventOrigin::Local)?;
            } else {
                state.root_mut(key)?.forget_committed(target);
            }
        }
        let cell = state.root_mut(key)?;
        cell.revert();
        let changed = cell.version() != version;
        if changed {
            state.touch(key, EventOrigin::Local);
        }
        Ok(changed)
    }

    /// Window of connection root `key` for `variables`, with its visible membership. A window
    /// that was never requested reads as empty.
    pub fn window(&self, key: &RootKey, variables: &Map<String, Value>) -> Result<WindowView, CacheError> {
        let cell = self.state.read().root_view(key)?;
        let members = cell.members().cloned().ok_or_else(|| CacheError::TypeMismatch {
            field: key.to_string(),
            expected: "Connection".to_string(),
            found: format!("{:?}", cell.kind()),
        })?;
        let window = cell
            .window(variables)
            .cloned()
            .unwrap_or_else(|| ConnectionWindow::new(variables.clone()));
        let visible = window.visible(&members);
        Ok(WindowView { window, visible })
    }

    /// Normalize `data` into the cache, attaching `errors` to the roots their paths address.
    #[tracing::instrument(skip_all)]
    pub fn serialize(
        &self,
        expectations: &ExpectationTable,
        data: &Value,
        errors: &[GraphQLError],
    ) -> Result<NormalizeReport, CacheError> {
        let mut state = self.state.write();
        Normalizer::new(&mut state, expectations, errors).run(data)
    }

    pub fn serialize_response(
        &self,
        expectations: &ExpectationTable,
        response: &GraphQLResponse,
    ) -> Result<NormalizeReport, CacheError> {
        self.serialize(expectations, &response.data, &response.errors)
    }

    pub fn mark_for_removal(&self, identity: &Identity) -> Result<bool, CacheError> {
        self.state.write().mark_for_removal(identity)
    }

    pub fn unmark_for_removal(&self, identity: &Identity) -> bool {
        self.state.write().unmark_for_removal(identity)
    }

    pub fn removed_identities(&self) -> BTreeSet<Identity> {
        self.state.read().removed().clone()
    }

    pub fn remove_pod(&self, identity: &Identity) -> Result<(), CacheError> {
        self.state.write().remove_pod(identity, EventOrigin::Local)
    }

    /// Remove every entity marked for removal. Returns the removed identities.
    pub fn purge_removed(&self) -> Result<Vec<Identity>, CacheError> {
        let mut state = self.state.write();
        let marked: Vec<Identity> = state.removed().iter().cloned().collect();
        for identity in marked.iter() {
            state.remove_pod(identity, EventOrigin::Local)?;
        }
        Ok(marked)
    }

    pub fn check_bonds(&self) -> Vec<String> {
        self.state.read().check_bonds()
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn root_count(&self) -> usize {
        self.state.read().roots.len()
    }
}
