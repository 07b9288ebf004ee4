use std::io;

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CacheError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("Entity type '{entity_type}' has no field '{field}'")]
    UnknownField { entity_type: String, field: String },
    #[error("Entity type '{0}' does not declare an identifier field")]
    MissingIdentifier(String),
    #[error("Value processor '{0}' is not registered")]
    MissingProcessor(String),
    #[error("Schema misconfiguration: {0}")]
    Schema(String),
    #[error("Field '{field}' cannot hold a reference to '{found}' (accepts: {expected})")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },
    #[error("Root cell {0} does not exist in the cache")]
    MissingRoot(String),
    #[error("Identifier '{identifier}' already belongs to another {entity_type}")]
    IdentifierConflict {
        entity_type: String,
        identifier: String,
    },
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Operation '{0}' is declared more than once in the same request")]
    DuplicateOperation(String),
    #[error("Response key '{key}' at level {level} is declared with conflicting shapes")]
    DuplicateAlias { key: String, level: usize },
    #[error("Query composition error: {0}")]
    Composition(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("File System error: {0}")]
    Io(String),
}

impl CacheError {
    /// True for the error kinds that indicate a programming or schema mistake rather than a
    /// runtime condition.
    pub fn is_programmer_error(&self) -> bool {
        !matches!(
            self,
            CacheError::NotFound(_)
                | CacheError::Serialization(_)
                | CacheError::Transport(_)
                | CacheError::Io(_)
        )
    }
}

impl From<JsonError> for CacheError {
    fn from(src: JsonError) -> CacheError {
        CacheError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(src: toml::de::Error) -> CacheError {
        CacheError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<RegexError> for CacheError {
    fn from(x: RegexError) -> Self {
        CacheError::Config(format!("Regex parse failed: {x}"))
    }
}

impl From<io::Error> for CacheError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(format!("{x}")),
            _ => CacheError::Io(format!("IOError: {}", x.kind())),
        }
    }
}
