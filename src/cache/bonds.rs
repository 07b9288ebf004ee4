//! Bond index: the reverse map from an identity to every root cell that references it.
//!
//! Invariant (checked by [CacheState::check_bonds]): identity `X` appears in root `R`'s value if
//! and only if `R`'s key appears in the bond set of `X`. Every mutating operation in this module
//! leaves the invariant intact before returning.

use crate::{
    error::CacheError,
    event::EventOrigin,
    identity::Identity,
    schema::{FieldMeta, RelationshipKind},
};
use std::collections::{BTreeMap, BTreeSet};

use super::{
    root::{RootKey, RootKind},
    store::CacheState,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BondIndex(BTreeMap<Identity, BTreeSet<RootKey>>);

impl BondIndex {
    pub fn get(&self, identity: &Identity) -> Option<&BTreeSet<RootKey>> {
        self.0.get(identity)
    }

    pub fn contains(&self, identity: &Identity, key: &RootKey) -> bool {
        self.0.get(identity).is_some_and(|keys| keys.contains(key))
    }

    pub fn insert(&mut self, identity: &Identity, key: &RootKey) -> bool {
        self.0
            .entry(identity.clone())
            .or_default()
            .insert(key.clone())
    }

    pub fn remove(&mut self, identity: &Identity, key: &RootKey) -> bool {
        let Some(keys) = self.0.get_mut(identity) else {
            return false;
        };
        let removed = keys.remove(key);
        if keys.is_empty() {
            self.0.remove(identity);
        }
        removed
    }

    pub fn take(&mut self, identity: &Identity) -> BTreeSet<RootKey> {
        self.0.remove(identity).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &BTreeSet<RootKey>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `(kind, inverse field)` of a relationship field.
fn relationship(
    meta: FieldMeta,
    owner: &Identity,
    field: &str,
) -> Result<(RelationshipKind, Option<String>), CacheError> {
    match meta {
        FieldMeta::Relationship { kind, inverse, .. } => Ok((kind, inverse)),
        FieldMeta::Attribute { .. } => Err(CacheError::TypeMismatch {
            field: format!("{owner}.{field}"),
            expected: "an attribute value".to_string(),
            found: "an entity reference".to_string(),
        }),
    }
}

impl CacheState {
    /// Record that root `key` references `identity`, and make the root's value agree.
    ///
    /// Connection roots gain `identity` as a member; node roots are re-pointed at it (dropping
    /// the bond of whatever they referenced before). With `update_initial` the change is also
    /// committed as the persisted value.
    pub(crate) fn register_bond(
        &mut self,
        identity: &Identity,
        key: &RootKey,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        let cell = self
            .roots
            .get_mut(key)
            .ok_or_else(|| CacheError::MissingRoot(key.to_string()))?;
        let changed = match cell.kind() {
            RootKind::Connection => cell.insert_member(identity, update_initial)?,
            RootKind::Node => {
                let version = cell.version();
                let previous = cell.set_node(Some(identity.clone()), update_initial)?;
                let changed = cell.version() != version;
                if let Some(previous) = previous.filter(|previous| previous != identity) {
                    self.bonds.remove(&previous, key);
                }
                changed
            }
            RootKind::Scalar => {
                return Err(CacheError::TypeMismatch {
                    field: key.to_string(),
                    expected: "an attribute value".to_string(),
                    found: identity.to_string(),
                })
            }
        };
        self.bonds.insert(identity, key);
        if changed {
            self.touch(key, origin);
        }
        Ok(())
    }

    /// Drop the single bond between `identity` and root `key`, removing `identity` from the root.
    pub(crate) fn unregister_bond(
        &mut self,
        identity: &Identity,
        key: &RootKey,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        self.bonds.remove(identity, key);
        self.release(identity, key, update_initial, false, origin)
    }

    /// Drop every bond of `identity`: no root references it afterwards. Connection windows are
    /// pruned as well, since this is the path taken when an entity leaves the cache.
    pub(crate) fn unregister_bonds(
        &mut self,
        identity: &Identity,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        for key in self.bonds.take(identity) {
            self.release(identity, &key, update_initial, true, origin)?;
        }
        Ok(())
    }

    fn release(
        &mut self,
        identity: &Identity,
        key: &RootKey,
        update_initial: bool,
        prune_windows: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        let cell = self
            .roots
            .get_mut(key)
            .ok_or_else(|| CacheError::MissingRoot(key.to_string()))?;
        let changed = match cell.kind() {
            RootKind::Connection => cell.remove_member(identity, update_initial, prune_windows),
            RootKind::Node if cell.node_value() == Some(identity) => {
                cell.set_node(None, update_initial)?;
                true
            }
            // Value already moved on; only the committed value may still point here.
            RootKind::Node if update_initial => cell.forget_committed(identity),
            _ => false,
        };
        if changed {
            self.touch(key, origin);
        }
        Ok(())
    }

    /// Point relationship `field` of `owner` at `target`, keeping the inverse side consistent.
    ///
    /// For to-one fields the previous target is unlinked first. When the field declares an
    /// inverse, `owner` is registered on `target`'s inverse root too; if that inverse is itself
    /// to-one, whatever it pointed at before is unlinked from both sides.
    pub(crate) fn link(
        &mut self,
        owner: &Identity,
        field: &str,
        target: &Identity,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        let meta = self.schemas.field(owner.entity_type(), field)?;
        let (kind, inverse) = relationship(meta, owner, field)?;
        let key = RootKey::field(owner, field);
        self.ensure_root(&key)?.check_accepts(target)?;
        let inverse_key = match &inverse {
            Some(inverse) => {
                let inverse_key = RootKey::field(target, inverse);
                self.ensure_root(&inverse_key)?.check_accepts(owner)?;
                Some(inverse_key)
            }
            None => None,
        };

        if kind == RelationshipKind::ToOne {
            let current = self.roots.get(&key).and_then(|cell| cell.node_value().cloned());
            if let Some(current) = current.filter(|current| current != target) {
                self.unlink(owner, field, &current, update_initial, origin)?;
            }
        }
        self.register_bond(target, &key, update_initial, origin)?;

        if let (Some(inverse), Some(inverse_key)) = (inverse, inverse_key) {
            let displaced = self
                .roots
                .get(&inverse_key)
                .and_then(|cell| cell.node_value().cloned())
                .filter(|other| other != owner);
            if let Some(other) = displaced {
                self.unlink(target, &inverse, &other, update_initial, origin)?;
            }
            self.register_bond(owner, &inverse_key, update_initial, origin)?;
        }
        Ok(())
    }

    /// Remove `target` from relationship `field` of `owner`, and `owner` from the inverse side.
    pub(crate) fn unlink(
        &mut self,
        owner: &Identity,
        field: &str,
        target: &Identity,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        let meta = self.schemas.field(owner.entity_type(), field)?;
        let (_, inverse) = relationship(meta, owner, field)?;
        let key = RootKey::field(owner, field);
        if self.roots.contains_key(&key) {
            self.unregister_bond(target, &key, update_initial, origin)?;
        }
        if let Some(inverse) = inverse {
            let inverse_key = RootKey::field(target, &inverse);
            if self.roots.contains_key(&inverse_key) {
                self.unregister_bond(owner, &inverse_key, update_initial, origin)?;
            }
        }
        Ok(())
    }

    /// Reference `target` from root `key`, dispatching to [CacheState::link] for entity fields.
    pub(crate) fn attach(
        &mut self,
        key: &RootKey,
        target: &Identity,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        match key {
            RootKey::Field { identity, field } => {
                self.link(identity, field, target, update_initial, origin)
            }
            RootKey::Top { .. } => {
                self.ensure_root(key)?.check_accepts(target)?;
                self.register_bond(target, key, update_initial, origin)
            }
        }
    }

    /// Inverse of [CacheState::attach].
    pub(crate) fn detach(
        &mut self,
        key: &RootKey,
        target: &Identity,
        update_initial: bool,
        origin: EventOrigin,
    ) -> Result<(), CacheError> {
        match key {
            RootKey::Field { identity, field } => {
                self.unlink(identity, field, target, update_initial, origin)
            }
            RootKey::Top { .. } => self.unregister_bond(target, key, update_initial, origin),
        }
    }

    /// Built-in consistency test for the bond invariant. Returns one message per violation.
    pub fn check_bonds(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (key, cell) in self.roots.iter() {
            for identity in cell.get().references() {
                if !self.bonds.contains(&identity, key) {
                    errors.push(format!("{key} references {identity} without a bond"));
                }
                if !self.entities.contains_key(&identity) {
                    errors.push(format!("{key} references unknown entity {identity}"));
                }
            }
        }
        for (identity, keys) in self.bonds.iter() {
            for key in keys {
                match self.roots.get(key) {
                    Some(cell) if cell.contains(identity) => {}
                    Some(_) => errors.push(format!(
                        "bond {identity} -> {key} but the root does not reference it"
                    )),
                    None => errors.push(format!("bond {identity} -> {key} names a missing root")),
                }
            }
        }
        errors
    }
}
