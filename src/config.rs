use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// One index declaration as it appears in a configuration file's `indexes`
/// list: a comma-separated keys string plus an optional uniqueness flag.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub keys: Vec<String>,
    pub unique: bool,
}

/// Schema configuration for a collection, either built up in code or loaded
/// from a JSON configuration file. Recognized keys when loading from JSON:
/// `indexes`, `queryableFields`, `defaultJson`, `aliases`; unknown keys are
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct CollectionConfig {
    pub cache_size: i64,
    pub indexes: Vec<IndexSpec>,
    pub queryable_fields: Vec<String>,
    pub default_json: serde_json::Map<String, Value>,
    pub aliases: HashMap<String, String>,
}

/// The `cache_size` a freshly constructed collection uses unless the caller
/// overrides it.
pub const DEFAULT_CACHE_SIZE: i64 = 100;

impl CollectionConfig {
    pub fn new() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, cache_size: i64) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn add_index(mut self, keys: &str, unique: bool) -> Self {
        self.indexes.push(IndexSpec {
            keys: parse_keys(keys),
            unique,
        });
        self
    }

    pub fn add_queryable_field(mut self, path: impl Into<String>) -> Self {
        self.queryable_fields.push(path.into());
        self
    }

    pub fn add_alias(mut self, name: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.aliases.insert(name.into(), replacement.into());
        self
    }

    /// Loads and merges a JSON configuration file into a fresh config with
    /// default `cache_size`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::InvalidSqlResult(format!(
                "failed to read config file {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(contents)
            .map_err(|err| Error::InvalidSqlResult(format!("invalid config json: {err}")))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let mut config = Self::new();

        if let Some(indexes) = value.get("indexes").and_then(Value::as_array) {
            for entry in indexes {
                let Some(keys) = entry.get("keys").and_then(Value::as_str) else {
                    continue;
                };
                let unique = entry.get("unique").and_then(Value::as_bool).unwrap_or(false);
                config.indexes.push(IndexSpec {
                    keys: parse_keys(keys),
                    unique,
                });
            }
        }

        if let Some(fields) = value.get("queryableFields").and_then(Value::as_array) {
            config.queryable_fields = fields.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }

        if let Some(defaults) = value.get("defaultJson").and_then(Value::as_object) {
            config.default_json = defaults.clone();
        }

        if let Some(aliases) = value.get("aliases").and_then(Value::as_object) {
            for (name, replacement) in aliases {
                if let Some(s) = replacement.as_str() {
                    config.aliases.insert(name.clone(), s.to_string());
                }
            }
        }

        Ok(config)
    }
}

fn parse_keys(keys: &str) -> Vec<String> {
    keys.split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_recognized_keys_and_ignores_unknown_ones() {
        let config = CollectionConfig::from_json(&json!({
            "indexes": [{"keys": "lastName, firstName", "unique": true}],
            "queryableFields": ["age", "name"],
            "defaultJson": {"age": 0},
            "aliases": {"ADULT": "[age] >= 18"},
            "somethingElseEntirely": 42,
        }))
        .unwrap();

        assert_eq!(config.indexes.len(), 1);
        assert_eq!(config.indexes[0].keys, vec!["lastName".to_string(), "firstName".to_string()]);
        assert!(config.indexes[0].unique);
        assert_eq!(config.queryable_fields, vec!["age".to_string(), "name".to_string()]);
        assert_eq!(config.default_json.get("age"), Some(&json!(0)));
        assert_eq!(config.aliases.get("ADULT"), Some(&"[age] >= 18".to_string()));
    }
}
