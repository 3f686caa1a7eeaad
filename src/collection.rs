use crate::cache::{CacheHandle, ObjectCache};
use crate::codec::JsonCodec;
use crate::config::CollectionConfig;
use crate::connection::{SqlConnection, SqlValue};
use crate::document::Document;
use crate::live_query::LiveQuery;
use crate::queue::{DispatchTarget, SerialQueue};
use crate::schema::SchemaManager;
use crate::translator::QueryTranslator;
use crate::{Error, Result, RowId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A named, case-insensitive container of documents, backed by one table.
///
/// Orchestrates the [`QueryTranslator`], [`SchemaManager`], [`ObjectCache`],
/// and a collection's [`LiveQuery`] subscribers. Every public operation has a
/// synchronous form that blocks on the collection's own serial queue, and a
/// `begin_*` form that enqueues the work and runs a completion callback on a
/// caller-chosen [`DispatchTarget`]. Schema-apply is always run ahead of (or
/// fused with) the data operation that triggered it, on the same queue task,
/// so no operation ever observes a half-applied schema for its own query.
pub struct Collection {
    name: String,
    conn: Arc<SqlConnection>,
    queue: SerialQueue,
    schema: Mutex<SchemaManager>,
    cache: ObjectCache,
    codec: JsonCodec,
    translator: QueryTranslator,
    live_queries: Mutex<Vec<Arc<LiveQuery>>>,
    last_error: Mutex<Option<Error>>,
    closed: AtomicBool,
}

impl Collection {
    pub(crate) fn new(name: impl Into<String>, conn: Arc<SqlConnection>, config: &CollectionConfig) -> Result<Arc<Self>> {
        let name = name.into();
        conn.exec(
            &format!(
                "CREATE TABLE IF NOT EXISTS {name} (__rowid__ INTEGER PRIMARY KEY, __json__ BLOB NOT NULL)"
            ),
            &[],
        )?;

        let schema = match load_metadata(&conn, &name)? {
            Some(value) => SchemaManager::from_metadata_json(name.clone(), &value),
            None => SchemaManager::new(name.clone()),
        };

        let collection = Arc::new(Self {
            name,
            conn,
            queue: SerialQueue::new(),
            schema: Mutex::new(schema),
            cache: ObjectCache::new(config.cache_size),
            codec: JsonCodec::new(),
            translator: QueryTranslator::new(),
            live_queries: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        collection.apply_config(config);
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().as_ref().map(Error::to_string)
    }

    fn record_error(&self, err: Error) -> Error {
        tracing::warn!(collection = %self.name, %err, "operation failed");
        *self.last_error.lock().unwrap() = Some(clone_error(&err));
        err
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // ---- schema configuration -------------------------------------------------

    /// Merges a loaded [`CollectionConfig`] into pending schema: indexes,
    /// queryable fields, default document entries, and aliases. Does not
    /// apply it; the next data operation (or an explicit `ensure_schema`)
    /// does that.
    pub fn apply_config(&self, config: &CollectionConfig) {
        let mut schema = self.schema.lock().unwrap();
        for index in &config.indexes {
            schema.add_index(index.keys.clone(), index.unique);
        }
        if !config.queryable_fields.is_empty() {
            schema.add_queryable_fields(config.queryable_fields.clone());
        }
        for (path, value) in &config.default_json {
            schema.add_default(path.clone(), value.clone());
        }
        for (name, replacement) in &config.aliases {
            schema.add_alias(name.clone(), replacement.clone());
        }
    }

    /// Loads a JSON configuration file per §6 and merges it into pending
    /// schema the same way [`Collection::apply_config`] does.
    pub fn apply_config_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let config = CollectionConfig::from_file(path)?;
        self.apply_config(&config);
        Ok(())
    }

    pub fn add_index(&self, keys: &str) {
        self.schema.lock().unwrap().add_index(split_keys(keys), false);
    }

    pub fn add_unique_index(&self, keys: &str) {
        self.schema.lock().unwrap().add_index(split_keys(keys), true);
    }

    pub fn add_queryable_fields(&self, paths: Vec<String>) {
        self.schema.lock().unwrap().add_queryable_fields(paths);
    }

    pub fn add_default(&self, path: impl Into<String>, value: serde_json::Value) {
        self.schema.lock().unwrap().add_default(path, value);
    }

    pub fn add_alias(&self, name: impl Into<String>, replacement: impl Into<String>) {
        self.schema.lock().unwrap().add_alias(name, replacement);
    }

    /// Replaces any `$NAME` alias tokens in `clause` with their registered
    /// replacement text, without parsing or rewriting paths. Exposed mainly
    /// for tests that want to assert on the substituted clause directly.
    pub fn replace_aliases_in(&self, clause: &str) -> String {
        let schema = self.schema.lock().unwrap();
        self.translator.substitute_aliases(clause, &schema.effective_aliases())
    }

    /// Drops unpinned cache entries for this collection. Pinned (in-use)
    /// entries are left alone.
    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    /// Applies any pending columns, indexes, queryable fields, defaults, and
    /// aliases. A no-op if there is nothing pending.
    pub fn ensure_schema(&self) -> Result<()> {
        self.queue.dispatch_sync(|| self.ensure_schema_inner())
    }

    pub fn begin_ensure_schema(
        self: &Arc<Self>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.ensure_schema_inner();
            target.run(move || callback(result));
        });
    }

    fn ensure_schema_inner(&self) -> Result<()> {
        self.check_open()?;
        self.schema
            .lock()
            .unwrap()
            .apply(&self.conn, &self.name)
            .map_err(|err| self.record_error(err))
    }

    // ---- query translation ------------------------------------------------

    fn translate_where(&self, clause: &str) -> Result<String> {
        let mut schema = self.schema.lock().unwrap();
        let aliases = schema.effective_aliases();
        let substituted = self.translator.substitute_aliases(clause, &aliases);
        self.translator
            .rewrite_where(&substituted, |path| schema.resolve_storage_name(path))
    }

    fn translate_order_by(&self, clause: &str) -> Result<String> {
        let mut schema = self.schema.lock().unwrap();
        let aliases = schema.effective_aliases();
        let substituted = self.translator.substitute_aliases(clause, &aliases);
        self.translator
            .rewrite_order_by(&substituted, |path| schema.resolve_storage_name(path))
    }

    fn projected_columns(&self) -> Vec<crate::column::Column> {
        self.schema.lock().unwrap().applied_columns().to_vec()
    }

    /// Builds the rewritten SQL clauses and reserves any newly-referenced
    /// columns, then flushes them to storage before the data operation that
    /// needed them runs. Returns `(where_sql, order_by_sql)`.
    fn translate_and_apply(
        &self,
        where_clause: Option<&str>,
        order_by: Option<&str>,
    ) -> Result<(Option<String>, Option<String>)> {
        self.ensure_schema_inner()?;

        let where_sql = where_clause.map(|c| self.translate_where(c)).transpose()?;
        let order_sql = order_by.map(|c| self.translate_order_by(c)).transpose()?;

        // Referencing a new path above may have reserved a pending column;
        // flush it before the caller executes against it.
        self.ensure_schema_inner()?;

        Ok((where_sql, order_sql))
    }

    fn build_select(&self, where_sql: &Option<String>, order_sql: &Option<String>, limit: i64) -> String {
        let mut sql = format!("SELECT __rowid__, __json__ FROM {}", self.name);
        if let Some(w) = where_sql {
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }
        if let Some(o) = order_sql {
            sql.push_str(" ORDER BY ");
            sql.push_str(o);
        }
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    fn query_rows(
        &self,
        where_clause: Option<&str>,
        args: &[SqlValue],
        order_by: Option<&str>,
        limit: i64,
    ) -> Result<Vec<(RowId, Vec<u8>)>> {
        let (where_sql, order_sql) = self.translate_and_apply(where_clause, order_by)?;
        let sql = self.build_select(&where_sql, &order_sql, limit);
        self.conn
            .query_rows(&sql, args, |row| {
                let rowid: RowId = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((rowid, blob))
            })
            .map_err(|err| self.record_error(err))
    }

    fn decode_handle(&self, rowid: RowId, blob: Vec<u8>) -> Result<CacheHandle> {
        if let Some(handle) = self.cache.lookup(rowid) {
            return Ok(handle);
        }
        let document = self.codec.decode(&blob)?;
        Ok(self.cache.intern(rowid, document))
    }

    // ---- data operations ---------------------------------------------------

    /// Encodes and inserts `document`, projecting every applied column.
    /// Returns the new row-id, or `0` on failure (mirroring the original
    /// sentinel return convention).
    pub fn insert(&self, document: Document) -> Result<RowId> {
        self.queue.dispatch_sync(|| self.insert_inner(document))
    }

    pub fn begin_insert(
        self: &Arc<Self>,
        document: Document,
        target: DispatchTarget,
        callback: impl FnOnce(Result<RowId>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.insert_inner(document);
            target.run(move || callback(result));
        });
    }

    fn insert_inner(&self, document: Document) -> Result<RowId> {
        self.check_open()?;
        self.ensure_schema_inner()?;
        let rowid = self
            .insert_row(&document)
            .map_err(|err| self.record_error(err))?;

        let mut stored = document;
        stored.set_rowid(rowid);
        self.cache.intern(rowid, stored).release();
        self.notify_all();
        Ok(rowid)
    }

    fn insert_row(&self, document: &Document) -> Result<RowId> {
        let columns = self.projected_columns();
        let defaults = self.schema.lock().unwrap().effective_defaults();
        let blob = self.codec.encode(document)?;

        let mut names = vec!["__json__".to_string()];
        let mut values = vec![SqlValue::Blob(blob)];
        for column in &columns {
            names.push(column.storage_name().to_string());
            let projected = document.resolve(column.path(), &defaults);
            values.push(SqlValue::try_from(&projected)?);
        }

        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name,
            names.join(", "),
            placeholders
        );
        self.conn.exec_insert(&sql, &values)
    }

    /// Inserts every document in `documents` atomically: a single savepoint
    /// covers the whole batch, so a failure on any item rolls back all of
    /// them.
    pub fn insert_batch(&self, documents: Vec<Document>) -> Result<Vec<RowId>> {
        self.queue.dispatch_sync(|| self.insert_batch_inner(documents))
    }

    pub fn begin_insert_batch(
        self: &Arc<Self>,
        documents: Vec<Document>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<Vec<RowId>>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.insert_batch_inner(documents);
            target.run(move || callback(result));
        });
    }

    fn insert_batch_inner(&self, documents: Vec<Document>) -> Result<Vec<RowId>> {
        self.check_open()?;
        self.ensure_schema_inner()?;

        let token = self.conn.begin_savepoint()?;
        let mut rowids = Vec::with_capacity(documents.len());
        for document in &documents {
            match self.insert_row(document) {
                Ok(rowid) => rowids.push(rowid),
                Err(err) => {
                    self.conn.rollback(&token)?;
                    return Err(self.record_error(err));
                }
            }
        }
        self.conn.commit(&token)?;

        for (document, rowid) in documents.into_iter().zip(&rowids) {
            let mut stored = document;
            stored.set_rowid(*rowid);
            self.cache.intern(*rowid, stored).release();
        }
        if !rowids.is_empty() {
            self.notify_all();
        }
        Ok(rowids)
    }

    /// Updates the row named by `document`'s `__rowid__`.
    pub fn update(&self, document: Document) -> Result<()> {
        self.queue.dispatch_sync(|| self.update_inner(document))
    }

    pub fn begin_update(
        self: &Arc<Self>,
        document: Document,
        target: DispatchTarget,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.update_inner(document);
            target.run(move || callback(result));
        });
    }

    fn update_inner(&self, document: Document) -> Result<()> {
        self.check_open()?;
        let rowid = document.rowid().ok_or_else(|| {
            Error::InvalidSqlArgument("update requires a document with __rowid__".to_string())
        })?;
        self.ensure_schema_inner()?;

        let columns = self.projected_columns();
        let defaults = self.schema.lock().unwrap().effective_defaults();
        let blob = self.codec.encode(&document)?;

        let mut assignments = vec!["__json__ = ?".to_string()];
        let mut values = vec![SqlValue::Blob(blob)];
        for column in &columns {
            assignments.push(format!("{} = ?", column.storage_name()));
            let projected = document.resolve(column.path(), &defaults);
            values.push(SqlValue::try_from(&projected)?);
        }
        values.push(SqlValue::Integer(rowid));

        let sql = format!(
            "UPDATE {} SET {} WHERE __rowid__ = ?",
            self.name,
            assignments.join(", ")
        );
        self.conn
            .exec(&sql, &values)
            .map_err(|err| self.record_error(err))?;

        self.cache.invalidate(rowid);
        self.cache.intern(rowid, document).release();
        self.notify_all();
        Ok(())
    }

    /// Deletes the row named by `document`'s `__rowid__`.
    pub fn remove(&self, document: &Document) -> Result<()> {
        self.queue.dispatch_sync(|| self.remove_inner(document))
    }

    pub fn begin_remove(
        self: &Arc<Self>,
        document: Document,
        target: DispatchTarget,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.remove_inner(&document);
            target.run(move || callback(result));
        });
    }

    fn remove_inner(&self, document: &Document) -> Result<()> {
        self.check_open()?;
        let rowid = document.rowid().ok_or_else(|| {
            Error::InvalidSqlArgument("remove requires a document with __rowid__".to_string())
        })?;
        self.ensure_schema_inner()?;

        self.conn
            .exec(
                &format!("DELETE FROM {} WHERE __rowid__ = ?", self.name),
                &[SqlValue::Integer(rowid)],
            )
            .map_err(|err| self.record_error(err))?;

        self.cache.invalidate(rowid);
        self.notify_all();
        Ok(())
    }

    /// Total row count.
    pub fn count(&self) -> Result<i64> {
        self.count_where(None, &[])
    }

    /// Row count matching a translated WHERE clause.
    pub fn count_where(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Result<i64> {
        self.queue.dispatch_sync(|| self.count_where_inner(where_clause, args))
    }

    pub fn begin_count_where(
        self: &Arc<Self>,
        where_clause: Option<String>,
        args: Vec<SqlValue>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<i64>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.count_where_inner(where_clause.as_deref(), &args);
            target.run(move || callback(result));
        });
    }

    fn count_where_inner(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Result<i64> {
        self.check_open()?;
        let (where_sql, _) = self.translate_and_apply(where_clause, None)?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.name);
        if let Some(w) = &where_sql {
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }
        let value = self
            .conn
            .exec_value(&sql, args)
            .map_err(|err| self.record_error(err))?;
        match value {
            Some(SqlValue::Integer(n)) => Ok(n),
            _ => Err(Error::InvalidSqlResult("COUNT(*) returned no integer".to_string())),
        }
    }

    /// All documents matching `where_clause`/`order_by`, unlimited.
    pub fn find_where(
        &self,
        where_clause: Option<&str>,
        args: &[SqlValue],
        order_by: Option<&str>,
    ) -> Result<Vec<CacheHandle>> {
        self.find_where_limit(where_clause, args, order_by, 0)
    }

    pub fn begin_find_where(
        self: &Arc<Self>,
        where_clause: Option<String>,
        args: Vec<SqlValue>,
        order_by: Option<String>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<Vec<CacheHandle>>) + Send + 'static,
    ) {
        self.begin_find_where_limit(where_clause, args, order_by, 0, target, callback)
    }

    /// Returns at most the first document matching `where_clause`.
    pub fn find_one_where(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Result<Option<CacheHandle>> {
        Ok(self.find_where_limit(where_clause, args, None, 1)?.into_iter().next())
    }

    /// Same as [`Collection::find_where`], but caps the result at `limit`
    /// rows. `limit == 0` means unlimited.
    pub fn find_where_limit(
        &self,
        where_clause: Option<&str>,
        args: &[SqlValue],
        order_by: Option<&str>,
        limit: i64,
    ) -> Result<Vec<CacheHandle>> {
        self.queue
            .dispatch_sync(|| self.find_where_limit_inner(where_clause, args, order_by, limit))
    }

    pub fn begin_find_where_limit(
        self: &Arc<Self>,
        where_clause: Option<String>,
        args: Vec<SqlValue>,
        order_by: Option<String>,
        limit: i64,
        target: DispatchTarget,
        callback: impl FnOnce(Result<Vec<CacheHandle>>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.find_where_limit_inner(where_clause.as_deref(), &args, order_by.as_deref(), limit);
            target.run(move || callback(result));
        });
    }

    fn find_where_limit_inner(
        &self,
        where_clause: Option<&str>,
        args: &[SqlValue],
        order_by: Option<&str>,
        limit: i64,
    ) -> Result<Vec<CacheHandle>> {
        self.check_open()?;
        let rows = self.query_rows(where_clause, args, order_by, limit)?;
        rows.into_iter()
            .map(|(rowid, blob)| self.decode_handle(rowid, blob))
            .collect()
    }

    /// Deletes every row matching `where_clause`, invalidating each affected
    /// rowid in the cache. Returns the number of rows removed.
    pub fn remove_where(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Result<i64> {
        self.queue.dispatch_sync(|| self.remove_where_inner(where_clause, args))
    }

    pub fn begin_remove_where(
        self: &Arc<Self>,
        where_clause: Option<String>,
        args: Vec<SqlValue>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<i64>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.remove_where_inner(where_clause.as_deref(), &args);
            target.run(move || callback(result));
        });
    }

    fn remove_where_inner(&self, where_clause: Option<&str>, args: &[SqlValue]) -> Result<i64> {
        self.check_open()?;
        let (where_sql, _) = self.translate_and_apply(where_clause, None)?;

        let mut select_sql = format!("SELECT __rowid__ FROM {}", self.name);
        if let Some(w) = &where_sql {
            select_sql.push_str(" WHERE ");
            select_sql.push_str(w);
        }
        let rowids = self
            .conn
            .query_rows(&select_sql, args, |row| row.get::<_, RowId>(0))
            .map_err(|err| self.record_error(err))?;

        if rowids.is_empty() {
            return Ok(0);
        }

        let mut delete_sql = format!("DELETE FROM {}", self.name);
        if let Some(w) = &where_sql {
            delete_sql.push_str(" WHERE ");
            delete_sql.push_str(w);
        }
        self.conn
            .exec(&delete_sql, args)
            .map_err(|err| self.record_error(err))?;

        for rowid in &rowids {
            self.cache.invalidate(*rowid);
        }
        self.notify_all();
        Ok(rowids.len() as i64)
    }

    /// Drops every row in the collection's table and its cache entries.
    pub fn remove_all(&self) -> Result<()> {
        self.queue.dispatch_sync(|| self.remove_all_inner())
    }

    pub fn begin_remove_all(
        self: &Arc<Self>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.remove_all_inner();
            target.run(move || callback(result));
        });
    }

    fn remove_all_inner(&self) -> Result<()> {
        self.check_open()?;
        self.conn
            .exec(&format!("DELETE FROM {}", self.name), &[])
            .map_err(|err| self.record_error(err))?;
        self.cache.remove_all();
        self.notify_all();
        Ok(())
    }

    /// Blocks until this collection's serial queue has drained every task
    /// enqueued before this call.
    pub fn sync(&self) {
        self.queue.dispatch_sync(|| {});
    }

    pub fn begin_sync(self: &Arc<Self>, target: DispatchTarget, callback: impl FnOnce() + Send + 'static) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            this.queue.dispatch_sync(|| {});
            target.run(callback);
        });
    }

    /// Like [`Collection::sync`], but returns `false` if `timeout` elapses
    /// before the queue drains rather than blocking indefinitely. The
    /// pending work itself is never cancelled.
    pub fn sync_wait(self: &Arc<Self>, timeout: std::time::Duration) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        let this = Arc::clone(self);
        std::thread::spawn(move || {
            this.queue.dispatch_sync(|| {});
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }

    // ---- live queries -------------------------------------------------------

    /// Registers a standing query. Its first publish occurs on the next
    /// `push_changes` call.
    pub fn live_query(
        self: &Arc<Self>,
        where_clause: Option<&str>,
        args: Vec<SqlValue>,
        order_by: Option<&str>,
        limit: i64,
    ) -> Arc<LiveQuery> {
        let live_query = Arc::new(LiveQuery::new(
            where_clause.map(str::to_string),
            args,
            order_by.map(str::to_string),
            limit,
        ));
        self.live_queries.lock().unwrap().push(Arc::clone(&live_query));
        live_query
    }

    fn notify_all(&self) {
        for live_query in self.live_queries.lock().unwrap().iter() {
            live_query.notify_change();
        }
    }

    /// Re-executes every dirty live query registered on this collection and
    /// delivers a change-set to its subscribers.
    pub fn push_changes(&self) -> Result<()> {
        self.queue.dispatch_sync(|| self.push_changes_inner())
    }

    pub fn begin_push_changes(
        self: &Arc<Self>,
        target: DispatchTarget,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.queue.dispatch_async(move || {
            let result = this.push_changes_inner();
            target.run(move || callback(result));
        });
    }

    fn push_changes_inner(&self) -> Result<()> {
        self.check_open()?;
        let live_queries: Vec<Arc<LiveQuery>> = self.live_queries.lock().unwrap().clone();
        for live_query in live_queries {
            if !live_query.is_dirty() {
                continue;
            }
            let rows = self.query_rows(
                live_query.where_clause(),
                live_query.args(),
                live_query.order_by(),
                live_query.limit(),
            )?;
            let mut items = Vec::with_capacity(rows.len());
            for (rowid, blob) in rows {
                let handle = self.decode_handle(rowid, blob)?;
                items.push(handle.document().clone());
                handle.release();
            }
            live_query.push_changes(items)?;
        }
        Ok(())
    }

    /// Marks this collection closed; further operations fail with `Closed`.
    /// Called by the owning [`crate::Store`] on `close`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for live_query in self.live_queries.lock().unwrap().iter() {
            live_query.close();
        }
    }
}

fn split_keys(keys: &str) -> Vec<String> {
    keys.split(',')
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

fn clone_error(err: &Error) -> Error {
    match err {
        Error::InvalidSqlArgument(msg) => Error::InvalidSqlArgument(msg.clone()),
        Error::InvalidSqlResult(msg) => Error::InvalidSqlResult(msg.clone()),
        Error::Closed => Error::Closed,
        Error::Sqlite { code, message } => Error::Sqlite {
            code: *code,
            message: message.clone(),
        },
    }
}

fn load_metadata(conn: &SqlConnection, name: &str) -> Result<Option<serde_json::Value>> {
    let blob = conn.exec_value(
        &format!("SELECT json FROM {} WHERE name = ?", crate::schema::METADATA_TABLE),
        &[SqlValue::Text(name.to_string())],
    )?;
    match blob {
        Some(SqlValue::Blob(bytes)) => {
            let value = serde_json::from_slice(&bytes).map_err(|err| {
                Error::InvalidSqlResult(format!("corrupt metadata row for '{name}': {err}"))
            })?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn collection(name: &str) -> Arc<Collection> {
        let conn = Arc::new(SqlConnection::open(":memory:").unwrap());
        crate::schema::create_metadata_table(&conn).unwrap();
        Collection::new(name, conn, &CollectionConfig::new()).unwrap()
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn insert_then_find_by_rowid_returns_same_fields() {
        let collection = collection("people");
        let rowid = collection.insert(doc(json!({"name": "alice", "age": 30}))).unwrap();
        assert!(rowid > 0);

        let found = collection
            .find_where("[__rowid__] = ?", &[SqlValue::Integer(rowid)], None)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].document().as_map().get("name"), Some(&json!("alice")));
        assert_eq!(found[0].document().rowid(), Some(rowid));
    }

    #[test]
    fn count_where_reflects_projected_column() {
        let collection = collection("people");
        collection.insert(doc(json!({"name": "alice", "age": 30}))).unwrap();
        collection.insert(doc(json!({"name": "bob", "age": 12}))).unwrap();

        let adults = collection.count_where(Some("[age] >= ?"), &[SqlValue::Integer(18)]).unwrap();
        assert_eq!(adults, 1);
    }

    #[test]
    fn order_by_honors_index_declared_keys() {
        let collection = collection("people");
        collection.add_index("lastName, firstName");
        collection
            .insert(doc(json!({"lastName": "Zin", "firstName": "Amy"})))
            .unwrap();
        collection
            .insert(doc(json!({"lastName": "Abe", "firstName": "Zoe"})))
            .unwrap();
        collection
            .insert(doc(json!({"lastName": "Abe", "firstName": "Amy"})))
            .unwrap();

        let rows = collection
            .find_where(None, &[], Some("[lastName], [firstName]"))
            .unwrap();
        let names: Vec<(String, String)> = rows
            .iter()
            .map(|h| {
                let map = h.document().as_map();
                (
                    map["lastName"].as_str().unwrap().to_string(),
                    map["firstName"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("Abe".to_string(), "Amy".to_string()),
                ("Abe".to_string(), "Zoe".to_string()),
                ("Zin".to_string(), "Amy".to_string()),
            ]
        );
    }

    #[test]
    fn update_invalidates_cached_handle_and_refreshes_body() {
        let collection = collection("people");
        let rowid = collection.insert(doc(json!({"name": "alice"}))).unwrap();
        let retained = collection
            .find_one_where("[__rowid__] = ?", &[SqlValue::Integer(rowid)])
            .unwrap()
            .unwrap();

        let mut updated = doc(json!({"name": "alicia"}));
        updated.set_rowid(rowid);
        collection.update(updated).unwrap();

        assert!(!retained.is_current());
        let fresh = collection
            .find_one_where("[__rowid__] = ?", &[SqlValue::Integer(rowid)])
            .unwrap()
            .unwrap();
        assert_eq!(fresh.document().as_map().get("name"), Some(&json!("alicia")));
    }

    #[test]
    fn insert_batch_rolls_back_entirely_on_bind_failure() {
        let collection = collection("people");
        let good_one = doc(json!({"name": "alice"}));
        let good_two = doc(json!({"name": "bob"}));
        let mut malformed_map = serde_json::Map::new();
        malformed_map.insert("active".to_string(), json!(true));
        // `active` is declared as a queryable field below, forcing it to be
        // projected with an unsupported bool bind value.
        collection.add_queryable_fields(vec!["active".to_string()]);
        collection.ensure_schema().unwrap();
        let malformed = Document::new(malformed_map);

        let result = collection.insert_batch(vec![good_one, good_two, malformed]);
        assert!(matches!(result, Err(Error::InvalidSqlArgument(_))));
        assert_eq!(collection.count().unwrap(), 0);
    }

    #[test]
    fn live_query_publishes_ordered_inserts_to_subscriber() {
        let collection = collection("tasks");
        let live_query = collection.live_query(None, vec![], Some("[priority]"), 0);

        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        live_query.add_subscriber(move |cs| {
            *received_clone.lock().unwrap() = Some(cs.changes.len());
        });

        collection.insert(doc(json!({"priority": 2}))).unwrap();
        collection.insert(doc(json!({"priority": 1}))).unwrap();
        collection.push_changes().unwrap();

        assert_eq!(*received.lock().unwrap(), Some(2));
        let items = live_query.last_published();
        assert_eq!(items[0].as_map().get("priority"), Some(&json!(1)));
        assert_eq!(items[1].as_map().get("priority"), Some(&json!(2)));
    }

    #[test]
    fn remove_where_invalidates_and_counts_affected_rows() {
        let collection = collection("people");
        collection.insert(doc(json!({"age": 10}))).unwrap();
        collection.insert(doc(json!({"age": 20}))).unwrap();
        collection.insert(doc(json!({"age": 30}))).unwrap();

        let removed = collection.remove_where(Some("[age] < ?"), &[SqlValue::Integer(25)]).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(collection.count().unwrap(), 1);
    }

    #[test]
    fn sync_wait_returns_true_once_queue_drains() {
        let collection = collection("people");
        collection.insert(doc(json!({"name": "alice"}))).unwrap();
        assert!(collection.sync_wait(std::time::Duration::from_secs(5)));
    }

    #[test]
    fn closed_collection_rejects_further_operations() {
        let collection = collection("people");
        collection.close();
        assert!(matches!(collection.insert(doc(json!({}))), Err(Error::Closed)));
    }
}
