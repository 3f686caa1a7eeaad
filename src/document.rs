use serde_json::{Map, Value};
use std::collections::HashMap;

/// The reserved top-level key every persisted document carries once it has
/// a row in the store.
pub const ROWID_KEY: &str = "__rowid__";

/// An unordered mapping from string keys to JSON values. Carries an implicit
/// `__rowid__` once persisted.
///
/// `Document` wraps a `serde_json::Map` rather than a bare `serde_json::Value`
/// so that callers can rely on every document being object-shaped; arrays,
/// scalars, and other non-object top-level values are never valid records.
#[derive(Debug, Clone, PartialEq)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(crate::Error::InvalidSqlResult(format!(
                "expected a JSON object document, found {other}"
            ))),
        }
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn rowid(&self) -> Option<crate::RowId> {
        self.0.get(ROWID_KEY).and_then(Value::as_i64)
    }

    pub fn set_rowid(&mut self, rowid: crate::RowId) {
        self.0.insert(ROWID_KEY.to_string(), Value::from(rowid));
    }

    /// Resolves a dotted JSON path (`"a.b.c"`) within this document, falling
    /// back to `defaults` when the path or any of its ancestors is absent.
    ///
    /// Per the projection invariant, a missing path resolves to the
    /// collection's `defaultJson` entry for that same path, or `Value::Null`
    /// if no default is declared.
    pub fn resolve(&self, path: &str, defaults: &HashMap<String, Value>) -> Value {
        match resolve_path(&Value::Object(self.0.clone()), path) {
            Some(value) => value,
            None => defaults.get(path).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Walks `value` along the dotted `path`, returning the located value if
/// every segment along the way exists. Numeric segments index into arrays;
/// all other segments index into objects.
pub fn resolve_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Splits a dotted JSON path into its component segments.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_paths() {
        let doc = Document::from_value(json!({
            "name": "alice",
            "address": {"city": "nyc", "zips": [10001, 10002]},
        }))
        .unwrap();
        let defaults = HashMap::new();

        assert_eq!(doc.resolve("name", &defaults), json!("alice"));
        assert_eq!(doc.resolve("address.city", &defaults), json!("nyc"));
        assert_eq!(doc.resolve("address.zips.1", &defaults), json!(10002));
        assert_eq!(doc.resolve("address.missing", &defaults), Value::Null);
    }

    #[test]
    fn falls_back_to_defaults_for_absent_paths() {
        let doc = Document::from_value(json!({"name": "alice"})).unwrap();
        let mut defaults = HashMap::new();
        defaults.insert("age".to_string(), json!(0));

        assert_eq!(doc.resolve("age", &defaults), json!(0));
        assert_eq!(doc.resolve("nickname", &defaults), Value::Null);
    }

    #[test]
    fn rowid_roundtrips() {
        let mut doc = Document::from_value(json!({"name": "alice"})).unwrap();
        assert_eq!(doc.rowid(), None);
        doc.set_rowid(42);
        assert_eq!(doc.rowid(), Some(42));
    }
}
