//! An embedded, single-file document store for JSON-shaped records.
//!
//! Each [`Document`](document::Document) is an opaque JSON object. The store transparently
//! projects selected paths of each document into typed SQLite columns so that
//! [`Collection::find_where`](collection::Collection::find_where) and friends can be answered
//! with ordinary SQL plus secondary indexes, while callers keep writing queries against JSON
//! paths (`[a.b.c]`) rather than storage column names.

mod cache;
mod codec;
mod collection;
mod column;
mod config;
mod connection;
mod document;
mod index;
mod live_query;
mod queue;
mod schema;
mod store;
mod translator;

pub use cache::CacheHandle;
pub use collection::Collection;
pub use column::Column;
pub use config::{CollectionConfig, IndexSpec};
pub use connection::SqlValue;
pub use document::Document;
pub use index::Index;
pub use live_query::{Change, ChangeSet, LiveQuery};
pub use queue::DispatchTarget;
pub use store::Store;

/// The error domain a given [`Error`] originated from: whether it came from
/// this crate's own validation or was surfaced verbatim from SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// `NTJsonStoreErrorDomain`: errors raised by this crate itself.
    Store,
    /// `NTJsonStoreSqliteErrorDomain`: errors surfaced verbatim from SQLite.
    Sqlite,
}

/// All errors this crate can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A query clause was malformed, referenced a field outside the declared
    /// queryable-field allow-list, or bound an argument of an unsupported type.
    #[error("invalid sql argument: {0}")]
    InvalidSqlArgument(String),

    /// The database returned a row shape the caller didn't expect (wrong
    /// column count, unexpected type, etc).
    #[error("invalid sql result: {0}")]
    InvalidSqlResult(String),

    /// The store, connection, or a derived handle has already been closed.
    #[error("store is closed")]
    Closed,

    /// An error surfaced verbatim from the SQLite engine.
    #[error("sqlite error {code}: {message}")]
    Sqlite { code: i32, message: String },
}

impl Error {
    pub fn domain(&self) -> ErrorDomain {
        match self {
            Error::Sqlite { .. } => ErrorDomain::Sqlite,
            _ => ErrorDomain::Store,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(sqlite_err, message) => Error::Sqlite {
                code: sqlite_err.extended_code,
                message: message.clone().unwrap_or_else(|| sqlite_err.to_string()),
            },
            rusqlite::Error::InvalidParameterName(name) => {
                Error::InvalidSqlArgument(format!("unknown parameter: {name}"))
            }
            other => Error::InvalidSqlResult(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A 64-bit SQLite `rowid`. Zero is never a valid persisted rowid and is used
/// as the sentinel "no row" value returned by failed inserts.
pub type RowId = i64;
