use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{cache::RootKey, identity::Identity};

/// Indicates what caused a [CacheEvent].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventOrigin {
    /// A local mutation through the cache's setter, relation or removal APIs.
    Local,
    /// A server response applied by the normalizer.
    #[default]
    Remote,
}

/// Change notifications emitted by a [crate::cache::Cache] configured with an event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEvent {
    EntityCreated(Identity, EventOrigin),
    EntityRemoved(Identity, EventOrigin),
    /// Root key, new root version
    RootUpdated(RootKey, u64, EventOrigin),
    /// Root key, number of errors now attached
    RootErrored(RootKey, usize),
}

impl CacheEvent {
    pub fn origin(&self) -> Option<EventOrigin> {
        match self {
            CacheEvent::EntityCreated(_, origin) => Some(*origin),
            CacheEvent::EntityRemoved(_, origin) => Some(*origin),
            CacheEvent::RootUpdated(_, _, origin) => Some(*origin),
            CacheEvent::RootErrored(_, _) => Some(EventOrigin::Remote),
        }
    }

    /// The root this event is about, if any.
    pub fn root(&self) -> Option<&RootKey> {
        match self {
            CacheEvent::RootUpdated(key, _, _) | CacheEvent::RootErrored(key, _) => Some(key),
            _ => None,
        }
    }
}

impl Display for CacheEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CacheEvent::EntityCreated(identity, _) => write!(f, "EntityCreated({identity})"),
            CacheEvent::EntityRemoved(identity, _) => write!(f, "EntityRemoved({identity})"),
            CacheEvent::RootUpdated(key, version, _) => write!(f, "RootUpdated({key}@{version})"),
            CacheEvent::RootErrored(key, count) => write!(f, "RootErrored({key}, {count})"),
        }
    }
}
