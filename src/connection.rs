use crate::queue::SerialQueue;
use crate::{Error, Result, RowId};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A value that can be bound as a SQL parameter or returned from a scalar
/// query. Mirrors the five types SQLite itself natively stores.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
            SqlValue::Blob(b) => ToSqlOutput::Owned(Value::Blob(b.clone())),
        })
    }
}

impl From<rusqlite::types::Value> for SqlValue {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => SqlValue::Null,
            rusqlite::types::Value::Integer(i) => SqlValue::Integer(i),
            rusqlite::types::Value::Real(f) => SqlValue::Real(f),
            rusqlite::types::Value::Text(s) => SqlValue::Text(s),
            rusqlite::types::Value::Blob(b) => SqlValue::Blob(b),
        }
    }
}

impl TryFrom<&serde_json::Value> for SqlValue {
    type Error = Error;

    /// Validates and converts a JSON value into a bindable SQL argument.
    /// Only null, integer, real, and string are accepted per the argument
    /// binding contract; any other JSON shape (bool, array, object) is
    /// rejected rather than silently coerced.
    fn try_from(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(SqlValue::Null),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(SqlValue::Real(f))
                } else {
                    Err(Error::InvalidSqlArgument(format!(
                        "number {n} cannot be represented as a SQL argument"
                    )))
                }
            }
            serde_json::Value::String(s) => Ok(SqlValue::Text(s.clone())),
            other => Err(Error::InvalidSqlArgument(format!(
                "unsupported bind argument type: {other}"
            ))),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

/// Owns a single SQLite database handle, bound to one serial execution
/// queue. All database access for this connection happens on that queue,
/// whether the connection is shared directly (the Store) or reached via a
/// collection's own queue dispatching down into it.
pub struct SqlConnection {
    filename: String,
    conn: Mutex<Option<Connection>>,
    queue: SerialQueue,
    last_error: Mutex<Option<String>>,
    savepoint_seq: AtomicU64,
}

impl SqlConnection {
    pub fn open(filename: &str) -> Result<Self> {
        let conn = Connection::open(filename)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;

        Ok(Self {
            filename: filename.to_string(),
            conn: Mutex::new(Some(conn)),
            queue: SerialQueue::new(),
            last_error: Mutex::new(None),
            savepoint_seq: AtomicU64::new(0),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    fn record_error(&self, err: Error) -> Error {
        *self.last_error.lock().unwrap() = Some(err.to_string());
        err
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::Closed),
        }
    }

    /// Drains the queue and finalizes the handle. Subsequent calls fail
    /// with `Error::Closed`.
    pub fn close(&self) -> Result<()> {
        self.queue.dispatch_sync(|| {
            *self.conn.lock().unwrap() = None;
            Ok(())
        })
    }

    pub fn dispatch_sync<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.queue.dispatch_sync(f)
    }

    pub fn dispatch_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.dispatch_async(f)
    }

    /// Executes `sql`, discarding any result rows. Returns whether the
    /// statement ran without error.
    pub fn exec(&self, sql: &str, args: &[SqlValue]) -> Result<bool> {
        self.queue.dispatch_sync(|| {
            self.with_connection(|conn| {
                conn.execute(sql, rusqlite::params_from_iter(args.iter()))
                    .map_err(Error::from)
                    .map_err(|err| self.record_error(err))?;
                Ok(true)
            })
        })
    }

    /// Executes a write and returns the engine's `last_insert_rowid`.
    pub fn exec_insert(&self, sql: &str, args: &[SqlValue]) -> Result<RowId> {
        self.queue.dispatch_sync(|| {
            self.with_connection(|conn| {
                conn.execute(sql, rusqlite::params_from_iter(args.iter()))
                    .map_err(Error::from)
                    .map_err(|err| self.record_error(err))?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    /// Executes `sql` and returns the first column of the first row, or
    /// `None` if the statement produced no rows.
    pub fn exec_value(&self, sql: &str, args: &[SqlValue]) -> Result<Option<SqlValue>> {
        self.queue.dispatch_sync(|| {
            self.with_connection(|conn| {
                let mut stmt = conn.prepare(sql).map_err(Error::from)?;
                let mut rows = stmt
                    .query(rusqlite::params_from_iter(args.iter()))
                    .map_err(Error::from)?;
                match rows.next().map_err(Error::from)? {
                    Some(row) => {
                        let value: rusqlite::types::Value = row.get(0).map_err(Error::from)?;
                        Ok(Some(SqlValue::from(value)))
                    }
                    None => Ok(None),
                }
            })
        })
    }

    /// Prepares and runs `sql`, mapping every result row through `row_fn`,
    /// collecting the mapped rows in statement order.
    pub fn query_rows<T>(
        &self,
        sql: &str,
        args: &[SqlValue],
        mut row_fn: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        self.queue.dispatch_sync(|| {
            self.with_connection(|conn| {
                let mut stmt = conn.prepare(sql).map_err(Error::from)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |row| row_fn(row))
                    .map_err(Error::from)?;
                rows.collect::<rusqlite::Result<Vec<T>>>()
                    .map_err(Error::from)
            })
        })
    }

    /// Opens a nestable savepoint, returning a fresh token identifying it.
    pub fn begin_savepoint(&self) -> Result<String> {
        let token = format!("ntjson_sp_{}", self.savepoint_seq.fetch_add(1, Ordering::Relaxed));
        self.exec(&format!("SAVEPOINT {token}"), &[])?;
        Ok(token)
    }

    pub fn commit(&self, token: &str) -> Result<bool> {
        self.exec(&format!("RELEASE {token}"), &[])
    }

    pub fn rollback(&self, token: &str) -> Result<bool> {
        self.exec(&format!("ROLLBACK TO {token}"), &[])?;
        self.exec(&format!("RELEASE {token}"), &[])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_exec_and_query() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let conn = SqlConnection::open(tmp.path().to_str().unwrap()).unwrap();

        conn.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();
        let rowid = conn
            .exec_insert(
                "INSERT INTO t (name) VALUES (?)",
                &[SqlValue::from("alice")],
            )
            .unwrap();
        assert_eq!(rowid, 1);

        let name = conn
            .exec_value("SELECT name FROM t WHERE id = ?", &[SqlValue::Integer(rowid)])
            .unwrap();
        assert_eq!(name, Some(SqlValue::Text("alice".to_string())));
    }

    #[test]
    fn savepoints_nest_and_roll_back() {
        let conn = SqlConnection::open(":memory:").unwrap();
        conn.exec("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[]).unwrap();

        let outer = conn.begin_savepoint().unwrap();
        conn.exec("INSERT INTO t DEFAULT VALUES", &[]).unwrap();

        let inner = conn.begin_savepoint().unwrap();
        conn.exec("INSERT INTO t DEFAULT VALUES", &[]).unwrap();
        conn.rollback(&inner).unwrap();

        conn.commit(&outer).unwrap();

        let count = conn.exec_value("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, Some(SqlValue::Integer(1)));
    }

    #[test]
    fn close_then_any_operation_fails() {
        let conn = SqlConnection::open(":memory:").unwrap();
        conn.close().unwrap();
        assert!(matches!(
            conn.exec("SELECT 1", &[]),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn rejects_invalid_argument_types() {
        let bad = serde_json::json!(true);
        assert!(matches!(
            SqlValue::try_from(&bad),
            Err(Error::InvalidSqlArgument(_))
        ));
    }
}
