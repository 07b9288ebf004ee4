//! Pagination windows layered over connection roots.
//!
//! A connection root holds the full membership set of a to-many relationship (or a top-level
//! list). Each distinct set of pagination/filter variables the application requested against that
//! root gets its own [ConnectionWindow], so page one and page two of the same relationship, or a
//! filtered and an unfiltered listing, keep independent `records`.

use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Canonical key for a variable bag.
///
/// Object keys are emitted in sorted order at every depth and top-level `null` variables are
/// dropped, so `{first: 10, after: "c1"}` and `{after: "c1", first: 10}` map to the same window.
pub fn identify(variables: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(
        variables.iter().filter(|(_, v)| !v.is_null()).collect(),
        &mut out,
    );
    out
}

fn write_object(mut entries: Vec<(&String, &Value)>, out: &mut String) {
    entries.sort_by(|a, b| a.0.cmp(b.0));
    out.push('{');
    for (idx, (key, value)) in entries.into_iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(value, out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map.iter().collect(), out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionWindow {
    key: String,
    variables: Map<String, Value>,
    records: Vec<Identity>,
    page_info: Value,
    locally_added: BTreeSet<Identity>,
    locally_removed: BTreeSet<Identity>,
}

impl ConnectionWindow {
    pub fn new(variables: Map<String, Value>) -> Self {
        ConnectionWindow {
            key: identify(&variables),
            variables,
            records: Vec::new(),
            page_info: Value::Null,
            locally_added: BTreeSet::new(),
            locally_removed: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Server-confirmed members, in response order.
    pub fn records(&self) -> &[Identity] {
        &self.records
    }

    pub fn page_info(&self) -> &Value {
        &self.page_info
    }

    pub fn locally_added(&self) -> &BTreeSet<Identity> {
        &self.locally_added
    }

    pub fn locally_removed(&self) -> &BTreeSet<Identity> {
        &self.locally_removed
    }

    /// Server sync: overwrite `page_info` (when given) and append records not seen before. Local
    /// additions and removals are left untouched.
    pub fn update<I>(&mut self, page_info: Option<Value>, added: I) -> bool
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut changed = false;
        if let Some(page_info) = page_info {
            if self.page_info != page_info {
                self.page_info = page_info;
                changed = true;
            }
        }
        for identity in added {
            if !self.records.contains(&identity) {
                self.records.push(identity);
                changed = true;
            }
        }
        changed
    }

    /// Server sync for complete (non-paginated) lists: the response replaces `records` wholesale.
    pub fn replace_records<I>(&mut self, page_info: Option<Value>, records: I) -> bool
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut next: Vec<Identity> = Vec::new();
        for identity in records {
            if !next.contains(&identity) {
                next.push(identity);
            }
        }
        let mut changed = next != self.records;
        self.records = next;
        if let Some(page_info) = page_info {
            changed |= self.page_info != page_info;
            self.page_info = page_info;
        }
        changed
    }

    pub fn add(&mut self, identity: &Identity) -> bool {
        let removed = self.locally_removed.remove(identity);
        self.locally_added.insert(identity.clone()) || removed
    }

    pub fn remove(&mut self, identity: &Identity) -> bool {
        let added = self.locally_added.remove(identity);
        self.locally_removed.insert(identity.clone()) || added
    }

    pub fn revert_local(&mut self) -> bool {
        let changed = !self.locally_added.is_empty() || !self.locally_removed.is_empty();
        self.locally_added.clear();
        self.locally_removed.clear();
        changed
    }

    /// Local additions the server does not know about yet.
    pub fn added(&self) -> BTreeSet<Identity> {
        self.locally_added
            .iter()
            .filter(|identity| !self.records.contains(identity))
            .cloned()
            .collect()
    }

    /// Local removals of records the server still lists.
    pub fn removed(&self) -> BTreeSet<Identity> {
        self.locally_removed
            .iter()
            .filter(|identity| self.records.contains(identity))
            .cloned()
            .collect()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.added().is_empty() || !self.removed().is_empty()
    }

    /// Forget `identity` everywhere in this window. Used when the entity leaves the cache.
    pub fn prune(&mut self, identity: &Identity) -> bool {
        let before = self.records.len();
        self.records.retain(|record| record != identity);
        let added = self.locally_added.remove(identity);
        let removed = self.locally_removed.remove(identity);
        before != self.records.len() || added || removed
    }

    /// Membership as the application should see it: records minus local removals, followed by
    /// local additions, restricted to what the owning root currently contains.
    pub fn visible(&self, root_members: &BTreeSet<Identity>) -> Vec<Identity> {
        let removed = self.removed();
        let mut visible: Vec<Identity> = self
            .records
            .iter()
            .filter(|identity| !removed.contains(identity) && root_members.contains(identity))
            .cloned()
            .collect();
        for identity in self.added() {
            if root_members.contains(&identity) {
                visible.push(identity);
            }
        }
        visible
    }
}

/// Snapshot of a window together with its visible membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowView {
    pub window: ConnectionWindow,
    pub visible: Vec<Identity>,
}
