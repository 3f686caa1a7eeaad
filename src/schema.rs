use crate::codec::JsonCodec;
use crate::column::Column;
use crate::connection::{SqlConnection, SqlValue};
use crate::index::Index;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Name of the persistent table holding one metadata row per collection.
pub const METADATA_TABLE: &str = "NTJsonStore_Metadata";

/// The shape of one collection's metadata row, persisted as the `json` blob
/// in [`METADATA_TABLE`]. `#[serde(default)]` on every field makes loading
/// permissive: a row written by an older version of this crate that lacks a
/// since-added field deserializes with that field empty rather than failing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CollectionMetadata {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    indexes: Vec<IndexMetadata>,
    #[serde(rename = "queryableFields", default)]
    queryable_fields: Vec<String>,
    #[serde(rename = "defaultJson", default)]
    default_json: HashMap<String, Value>,
    #[serde(default)]
    aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexMetadata {
    keys: Vec<String>,
    #[serde(default)]
    unique: bool,
}

pub fn create_metadata_table(conn: &SqlConnection) -> Result<()> {
    conn.exec(
        &format!("CREATE TABLE IF NOT EXISTS {METADATA_TABLE} (name TEXT PRIMARY KEY, json BLOB)"),
        &[],
    )?;
    Ok(())
}

/// The applied or pending half of a collection's schema: the union of
/// columns, indexes, queryable fields, default document entries, and
/// aliases known in that state.
#[derive(Debug, Clone, Default)]
struct SchemaSet {
    columns: Vec<Column>,
    indexes: Vec<Index>,
    queryable_fields: Vec<String>,
    defaults: HashMap<String, Value>,
    aliases: HashMap<String, String>,
}

impl SchemaSet {
    fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.indexes.is_empty()
            && self.queryable_fields.is_empty()
            && self.defaults.is_empty()
            && self.aliases.is_empty()
    }
}

/// Tracks applied vs. pending schema for one collection and carries out the
/// apply algorithm that reconciles them with the underlying table.
pub struct SchemaManager {
    table_name: String,
    applied: SchemaSet,
    pending: SchemaSet,
    codec: JsonCodec,
}

impl SchemaManager {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            applied: SchemaSet::default(),
            pending: SchemaSet::default(),
            codec: JsonCodec::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn applied_columns(&self) -> &[Column] {
        &self.applied.columns
    }

    pub fn applied_indexes(&self) -> &[Index] {
        &self.applied.indexes
    }

    pub fn effective_defaults(&self) -> HashMap<String, Value> {
        let mut defaults = self.applied.defaults.clone();
        for (k, v) in &self.pending.defaults {
            defaults.insert(k.clone(), v.clone());
        }
        defaults
    }

    pub fn effective_aliases(&self) -> HashMap<String, String> {
        let mut aliases = self.applied.aliases.clone();
        for (k, v) in &self.pending.aliases {
            aliases.insert(k.clone(), v.clone());
        }
        aliases
    }

    /// Idempotently requests that `path` be projected as a column, returning
    /// its (possibly freshly assigned) storage name. Does not enforce the
    /// queryable-fields allow-list; see [`SchemaManager::resolve_storage_name`]
    /// for the version the translator uses.
    pub fn add_column(&mut self, path: &str) -> String {
        self.reserve_column(path).storage_name().to_string()
    }

    fn reserve_column(&mut self, path: &str) -> &Column {
        if let Some(index) = self.applied.columns.iter().position(|c| c.path() == path) {
            return &self.applied.columns[index];
        }
        if let Some(index) = self.pending.columns.iter().position(|c| c.path() == path) {
            return &self.pending.columns[index];
        }
        self.pending.columns.push(Column::new(path));
        self.pending.columns.last().unwrap()
    }

    /// Resolves `path` to a storage column name for the translator,
    /// enforcing the queryable-fields allow-list (when non-empty) and
    /// reserving a pending column on first reference.
    pub fn resolve_storage_name(&mut self, path: &str) -> Result<String> {
        let allow_list_active =
            !self.applied.queryable_fields.is_empty() || !self.pending.queryable_fields.is_empty();

        if allow_list_active {
            let allowed = self.applied.queryable_fields.iter().any(|f| f == path)
                || self.pending.queryable_fields.iter().any(|f| f == path);
            if !allowed {
                return Err(Error::InvalidSqlArgument(format!(
                    "path '{path}' is not a declared queryable field"
                )));
            }
        }

        Ok(self.reserve_column(path).storage_name().to_string())
    }

    /// Adds a secondary index over `keys`, reserving a column for each key
    /// path. Idempotent: an index with the same (keys, unique) is a no-op.
    pub fn add_index(&mut self, keys: Vec<String>, unique: bool) {
        for key in &keys {
            self.reserve_column(key);
        }
        let index = Index::new(keys, unique);
        let already_known = self.applied.indexes.iter().any(|i| i.name() == index.name())
            || self.pending.indexes.iter().any(|i| i.name() == index.name());
        if !already_known {
            self.pending.indexes.push(index);
        }
    }

    pub fn add_queryable_fields(&mut self, paths: Vec<String>) {
        for path in paths {
            let already_known = self.applied.queryable_fields.iter().any(|f| f == &path)
                || self.pending.queryable_fields.iter().any(|f| f == &path);
            if !already_known {
                self.pending.queryable_fields.push(path);
            }
        }
    }

    pub fn add_default(&mut self, path: impl Into<String>, value: Value) {
        self.pending.defaults.insert(path.into(), value);
    }

    pub fn add_alias(&mut self, name: impl Into<String>, replacement: impl Into<String>) {
        self.pending.aliases.insert(name.into(), replacement.into());
    }

    fn ensure_queryable_columns(&mut self) {
        let fields: Vec<String> = self
            .applied
            .queryable_fields
            .iter()
            .chain(self.pending.queryable_fields.iter())
            .cloned()
            .collect();
        for field in fields {
            self.reserve_column(&field);
        }
    }

    fn storage_name_for(&self, path: &str) -> String {
        self.applied
            .columns
            .iter()
            .find(|c| c.path() == path)
            .or_else(|| self.pending.columns.iter().find(|c| c.path() == path))
            .map(|c| c.storage_name().to_string())
            .unwrap_or_else(|| crate::column::mangle(path))
    }

    /// Runs the apply algorithm: opens a savepoint, emits DDL for every
    /// pending column and index, backfills existing rows, persists the
    /// metadata row, and commits. On any failure the savepoint is rolled
    /// back and the pending set is left untouched so the next call retries.
    pub fn apply(&mut self, conn: &SqlConnection, collection_name: &str) -> Result<()> {
        if !self.has_pending() {
            return Ok(());
        }

        let token = conn.begin_savepoint()?;
        match self.apply_inner(conn, collection_name) {
            Ok(()) => {
                conn.commit(&token)?;
                tracing::debug!(collection = collection_name, "schema apply committed");
                Ok(())
            }
            Err(err) => {
                conn.rollback(&token)?;
                tracing::warn!(collection = collection_name, %err, "schema apply rolled back, pending set retained");
                Err(err)
            }
        }
    }

    fn apply_inner(&mut self, conn: &SqlConnection, collection_name: &str) -> Result<()> {
        self.ensure_queryable_columns();

        let pending_columns = self.pending.columns.clone();
        for column in &pending_columns {
            conn.exec(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    self.table_name,
                    column.storage_name()
                ),
                &[],
            )?;
            self.backfill_column(conn, column)?;
        }

        let pending_indexes = self.pending.indexes.clone();
        for index in &pending_indexes {
            let storage_columns: Vec<String> =
                index.keys().iter().map(|path| self.storage_name_for(path)).collect();
            conn.exec(
                &format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    if index.unique() { "UNIQUE " } else { "" },
                    index.name(),
                    self.table_name,
                    storage_columns.join(", "),
                ),
                &[],
            )?;
        }

        // Compute the prospective applied state without committing it to
        // `self` yet: if `persist_metadata` below fails, `self.applied` and
        // `self.pending` must still reflect the state before this call so
        // the next `apply()` retries the same DDL/backfill instead of
        // silently skipping it (`has_pending()` would otherwise go false
        // while the columns/indexes above never actually landed).
        let mut columns = self.applied.columns.clone();
        columns.extend(pending_columns.iter().cloned());
        let mut indexes = self.applied.indexes.clone();
        indexes.extend(pending_indexes.iter().cloned());
        let mut queryable_fields = self.applied.queryable_fields.clone();
        queryable_fields.extend(self.pending.queryable_fields.iter().cloned());
        let mut defaults = self.applied.defaults.clone();
        defaults.extend(self.pending.defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut aliases = self.applied.aliases.clone();
        aliases.extend(self.pending.aliases.iter().map(|(k, v)| (k.clone(), v.clone())));

        let metadata = CollectionMetadata {
            columns: columns.iter().map(|c| c.path().to_string()).collect(),
            indexes: indexes
                .iter()
                .map(|i| IndexMetadata {
                    keys: i.keys().to_vec(),
                    unique: i.unique(),
                })
                .collect(),
            queryable_fields: queryable_fields.clone(),
            default_json: defaults.clone(),
            aliases: aliases.clone(),
        };
        self.persist_metadata(conn, collection_name, &metadata)?;

        // Persist succeeded: only now fold pending into applied and clear it.
        self.applied.columns = columns;
        self.applied.indexes = indexes;
        self.applied.queryable_fields = queryable_fields;
        self.applied.defaults = defaults;
        self.applied.aliases = aliases;
        self.pending.columns.clear();
        self.pending.indexes.clear();
        self.pending.queryable_fields.clear();
        self.pending.defaults.clear();
        self.pending.aliases.clear();

        Ok(())
    }

    fn backfill_column(&self, conn: &SqlConnection, column: &Column) -> Result<()> {
        let rows = conn.query_rows(
            &format!("SELECT __rowid__, __json__ FROM {}", self.table_name),
            &[],
            |row| {
                let rowid: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((rowid, blob))
            },
        )?;

        if rows.is_empty() {
            return Ok(());
        }

        let defaults = self.effective_defaults();
        for (rowid, blob) in rows {
            let document = self.codec.decode(&blob)?;
            let projected = document.resolve(column.path(), &defaults);
            let bound = SqlValue::try_from(&projected).unwrap_or(SqlValue::Null);
            conn.exec(
                &format!(
                    "UPDATE {} SET {} = ? WHERE __rowid__ = ?",
                    self.table_name,
                    column.storage_name()
                ),
                &[bound, SqlValue::Integer(rowid)],
            )?;
        }
        Ok(())
    }

    fn persist_metadata(
        &self,
        conn: &SqlConnection,
        collection_name: &str,
        metadata: &CollectionMetadata,
    ) -> Result<()> {
        let json = serde_json::to_vec(metadata).map_err(|err| {
            Error::InvalidSqlResult(format!("failed to serialize schema metadata: {err}"))
        })?;
        conn.exec(
            &format!(
                "INSERT INTO {METADATA_TABLE} (name, json) VALUES (?, ?) \
                 ON CONFLICT(name) DO UPDATE SET json = excluded.json"
            ),
            &[
                SqlValue::Text(collection_name.to_string()),
                SqlValue::Blob(json),
            ],
        )?;
        Ok(())
    }

    fn to_metadata(&self) -> CollectionMetadata {
        CollectionMetadata {
            columns: self.applied.columns.iter().map(|c| c.path().to_string()).collect(),
            indexes: self
                .applied
                .indexes
                .iter()
                .map(|i| IndexMetadata {
                    keys: i.keys().to_vec(),
                    unique: i.unique(),
                })
                .collect(),
            queryable_fields: self.applied.queryable_fields.clone(),
            default_json: self.applied.defaults.clone(),
            aliases: self.applied.aliases.clone(),
        }
    }

    fn to_metadata_json(&self) -> Value {
        serde_json::to_value(self.to_metadata())
            .expect("CollectionMetadata is always representable as JSON")
    }

    /// Reconstructs applied state from a previously persisted metadata row.
    /// An unparseable row (e.g. `defaultJson` values that aren't plain
    /// objects) degrades to an empty metadata set rather than failing the
    /// whole collection open.
    pub fn from_metadata_json(table_name: impl Into<String>, value: &Value) -> Self {
        let mut manager = Self::new(table_name);
        let metadata: CollectionMetadata = serde_json::from_value(value.clone()).unwrap_or_default();

        for path in &metadata.columns {
            manager.applied.columns.push(Column::new(path));
        }
        for index in &metadata.indexes {
            if !index.keys.is_empty() {
                manager
                    .applied
                    .indexes
                    .push(Index::new(index.keys.clone(), index.unique));
            }
        }
        manager.applied.queryable_fields = metadata.queryable_fields;
        manager.applied.defaults = metadata.default_json;
        manager.applied.aliases = metadata.aliases;

        manager
    }

    pub fn applied_queryable_fields(&self) -> &[String] {
        &self.applied.queryable_fields
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::Document;
    use serde_json::json;

    fn setup(table: &str) -> SqlConnection {
        let conn = SqlConnection::open(":memory:").unwrap();
        conn.exec(
            &format!("CREATE TABLE {table} (__rowid__ INTEGER PRIMARY KEY, __json__ BLOB NOT NULL)"),
            &[],
        )
        .unwrap();
        create_metadata_table(&conn).unwrap();
        conn
    }

    #[test]
    fn apply_adds_columns_and_backfills_existing_rows() {
        let conn = setup("people");
        let codec = JsonCodec::new();
        let doc = Document::from_value(json!({"name": "alice", "age": 30})).unwrap();
        conn.exec_insert(
            "INSERT INTO people (__json__) VALUES (?)",
            &[SqlValue::Blob(codec.encode(&doc).unwrap())],
        )
        .unwrap();

        let mut schema = SchemaManager::new("people");
        let storage_name = schema.add_column("age");
        assert!(schema.has_pending());
        schema.apply(&conn, "people").unwrap();
        assert!(!schema.has_pending());

        let value = conn
            .exec_value(&format!("SELECT {storage_name} FROM people"), &[])
            .unwrap();
        assert_eq!(value, Some(SqlValue::Integer(30)));
    }

    #[test]
    fn apply_is_idempotent_and_clears_pending() {
        let conn = setup("people");
        let mut schema = SchemaManager::new("people");
        schema.add_index(vec!["lastName".to_string(), "firstName".to_string()], false);
        schema.add_index(vec!["lastName".to_string(), "firstName".to_string()], false);
        schema.apply(&conn, "people").unwrap();
        assert!(!schema.has_pending());
        assert_eq!(schema.applied_indexes().len(), 1);
    }

    #[test]
    fn queryable_allow_list_rejects_undeclared_paths() {
        let mut schema = SchemaManager::new("people");
        schema.add_queryable_fields(vec!["age".to_string()]);
        assert!(schema.resolve_storage_name("age").is_ok());
        assert!(matches!(
            schema.resolve_storage_name("secret"),
            Err(Error::InvalidSqlArgument(_))
        ));
    }

    #[test]
    fn failed_apply_retains_pending_set() {
        let conn = SqlConnection::open(":memory:").unwrap();
        // No table created: ALTER TABLE will fail.
        let mut schema = SchemaManager::new("missing");
        schema.add_column("age");
        assert!(schema.apply(&conn, "missing").is_err());
        assert!(schema.has_pending());
    }

    /// The DDL (ALTER TABLE / CREATE INDEX / backfill) can succeed while the
    /// final metadata-row write still fails (e.g. the metadata table is
    /// missing). The savepoint rolls the DDL back, but `apply_inner` must
    /// not have already folded the pending set into `applied` by that point:
    /// otherwise the in-memory state would claim a column that was just
    /// rolled back out of existence, `has_pending()` would go false, and no
    /// future `apply()` call would ever recreate it.
    #[test]
    fn failed_metadata_persist_retains_pending_set_and_does_not_mark_applied() {
        let conn = setup("people");
        // Drop the metadata table so the DDL above succeeds but the final
        // `INSERT INTO ... METADATA` write fails.
        conn.exec(&format!("DROP TABLE {METADATA_TABLE}"), &[]).unwrap();

        let mut schema = SchemaManager::new("people");
        schema.add_column("age");
        assert!(schema.apply(&conn, "people").is_err());
        assert!(schema.has_pending());
        assert!(schema.applied_columns().is_empty());

        // Recreate the metadata table and retry: the same pending column
        // must still apply successfully rather than being permanently lost.
        create_metadata_table(&conn).unwrap();
        schema.apply(&conn, "people").unwrap();
        assert!(!schema.has_pending());
        assert_eq!(schema.applied_columns().len(), 1);
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let conn = setup("people");
        let mut schema = SchemaManager::new("people");
        schema.add_column("age");
        schema.add_queryable_fields(vec!["age".to_string()]);
        schema.add_default("age", json!(0));
        schema.apply(&conn, "people").unwrap();

        let reloaded = SchemaManager::from_metadata_json("people", &schema.to_metadata_json());
        assert_eq!(reloaded.applied_columns().len(), 1);
        assert_eq!(reloaded.applied_queryable_fields(), &["age".to_string()]);
        assert_eq!(reloaded.effective_defaults().get("age"), Some(&json!(0)));
    }
}
