use crate::error::CacheError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fs::read_to_string, path::Path, sync::Arc};

/// Shared default configuration. Caches built with [crate::cache::Cache::new] all hold this one
/// instance.
pub static DEFAULT_CONFIG: Lazy<Arc<CacheConfig>> =
    Lazy::new(|| Arc::new(CacheConfig::default()));

/// Tunables for query composition and response normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Response keys matching this pattern are treated as connections.
    pub connection_pattern: String,
    /// Response keys matching this pattern are treated as single nodes.
    pub node_pattern: String,
    pub edges_key: String,
    pub node_key: String,
    pub page_info_key: String,
    /// Add the identifier field to node selections that omit it.
    pub inject_identifier: bool,
    /// Clear a root cell's server errors when normalization writes a value into it.
    pub clear_errors_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            connection_pattern: "Connection$".to_string(),
            node_pattern: "Node$".to_string(),
            edges_key: "edges".to_string(),
            node_key: "node".to_string(),
            page_info_key: "pageInfo".to_string(),
            inject_identifier: true,
            clear_errors_on_write: true,
        }
    }
}

impl CacheConfig {
    pub fn from_toml(content: &str) -> Result<CacheConfig, CacheError> {
        let config: CacheConfig = toml::from_str(content)?;
        config.naming_patterns()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<CacheConfig, CacheError> {
        tracing::debug!("Reading cache config from {:?}", path.as_ref());
        if !path.as_ref().exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(CacheConfig::clone(&DEFAULT_CONFIG));
        }
        CacheConfig::from_toml(&read_to_string(path)?)
    }

    /// Compiled `(connection, node)` naming-convention patterns.
    pub fn naming_patterns(&self) -> Result<(Regex, Regex), CacheError> {
        Ok((
            Regex::new(&self.connection_pattern)?,
            Regex::new(&self.node_pattern)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::Cache, schema::SchemaRegistry};
    use std::fs::write;
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CacheConfig::from_toml(
            r#"
            edges_key = "items"
            inject_identifier = false
            "#,
        )
        .unwrap();
        assert_eq!(config.edges_key, "items");
        assert!(!config.inject_identifier);
        assert_eq!(config.node_key, "node");
        assert_eq!(config.connection_pattern, "Connection$");
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = CacheConfig::from_toml(r#"node_pattern = "(unclosed""#).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::load(dir.path().join("normcache.toml")).unwrap();
        assert_eq!(config, **DEFAULT_CONFIG);
    }

    #[test]
    fn test_default_caches_share_config() {
        let first = Cache::new(SchemaRegistry::new());
        let second = Cache::new(SchemaRegistry::new());
        assert!(Arc::ptr_eq(&first.config(), &second.config()));
        assert!(Arc::ptr_eq(&first.config(), &DEFAULT_CONFIG));

        let custom = Cache::with_config(SchemaRegistry::new(), CacheConfig::default());
        assert!(!Arc::ptr_eq(&custom.config(), &DEFAULT_CONFIG));
        assert_eq!(*custom.config(), **DEFAULT_CONFIG);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("normcache.toml");
        write(&path, "page_info_key = \"page\"\n").unwrap();
        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.page_info_key, "page");
    }
}
