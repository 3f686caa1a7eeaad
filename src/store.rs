use crate::collection::Collection;
use crate::config::CollectionConfig;
use crate::connection::SqlConnection;
use crate::queue::DispatchTarget;
use crate::schema::create_metadata_table;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Owns the [`SqlConnection`], a directory of [`Collection`]s keyed
/// case-insensitively by name, and the persistent metadata table. The
/// connection's own serial queue is the store-wide queue every collection's
/// queue eventually funnels database access through.
pub struct Store {
    conn: Arc<SqlConnection>,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
    closed: AtomicBool,
}

impl Store {
    /// Opens (creating if absent) the single-file store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| Error::InvalidSqlArgument("store path is not valid UTF-8".to_string()))?;
        let conn = Arc::new(SqlConnection::open(path_str)?);
        create_metadata_table(&conn)?;
        Ok(Self {
            conn,
            collections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The default directory this crate's callers are expected to place
    /// their store file under, mirroring the "filesystem + default cache
    /// directory" collaborator this component treats as external.
    pub fn default_directory() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("NTJsonStore"))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Returns the named collection, constructing it (and loading any
    /// persisted metadata row) on first access. Lookup is case-insensitive;
    /// the table name uses the casing of whichever call created it first.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.check_open()?;
        let key = name.to_ascii_lowercase();

        let mut collections = self.collections.lock().unwrap();
        if let Some(existing) = collections.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let collection = Collection::new(name, Arc::clone(&self.conn), &CollectionConfig::new())?;
        collections.insert(key, Arc::clone(&collection));
        Ok(collection)
    }

    /// Like [`Store::collection`], but merges `config` into the collection's
    /// pending schema before returning it (only meaningful the first time a
    /// given name is requested; later calls ignore `config` and return the
    /// already-constructed collection).
    pub fn collection_with_config(&self, name: &str, config: CollectionConfig) -> Result<Arc<Collection>> {
        self.check_open()?;
        let key = name.to_ascii_lowercase();

        let mut collections = self.collections.lock().unwrap();
        if let Some(existing) = collections.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let collection = Collection::new(name, Arc::clone(&self.conn), &config)?;
        collections.insert(key, Arc::clone(&collection));
        Ok(collection)
    }

    fn known_collections(&self) -> Vec<Arc<Collection>> {
        self.collections.lock().unwrap().values().cloned().collect()
    }

    /// Applies pending schema across every known collection, returning the
    /// errors (if any) encountered, one per collection that failed.
    pub fn ensure_schema(&self) -> Vec<Error> {
        self.known_collections()
            .into_iter()
            .filter_map(|collection| collection.ensure_schema().err())
            .collect()
    }

    pub fn begin_ensure_schema(
        self: &Arc<Self>,
        target: DispatchTarget,
        callback: impl FnOnce(Vec<Error>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        self.conn.dispatch_async(move || {
            let result = this.ensure_schema();
            target.run(move || callback(result));
        });
    }

    /// Blocks until each named collection's serial queue has drained. `None`
    /// means every collection currently known to the store.
    pub fn sync(&self, names: Option<&[String]>) {
        let collections = match names {
            Some(names) => names
                .iter()
                .filter_map(|name| self.collections.lock().unwrap().get(&name.to_ascii_lowercase()).cloned())
                .collect(),
            None => self.known_collections(),
        };
        for collection in collections {
            collection.sync();
        }
    }

    pub fn begin_sync(self: &Arc<Self>, names: Option<Vec<String>>, target: DispatchTarget, callback: impl FnOnce() + Send + 'static) {
        let this = Arc::clone(self);
        self.conn.dispatch_async(move || {
            this.sync(names.as_deref());
            target.run(callback);
        });
    }

    /// Like [`Store::sync`], but returns `false` if `timeout` elapses before
    /// every named collection's queue drains.
    pub fn sync_wait(&self, names: Option<&[String]>, timeout: std::time::Duration) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        let collections: Vec<Arc<Collection>> = match names {
            Some(names) => names
                .iter()
                .filter_map(|name| self.collections.lock().unwrap().get(&name.to_ascii_lowercase()).cloned())
                .collect(),
            None => self.known_collections(),
        };
        std::thread::spawn(move || {
            for collection in collections {
                collection.sync();
            }
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }

    /// Drains and closes every collection and the connection itself.
    /// Further operations on the store or any derived collection
    /// unconditionally fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        tracing::debug!(filename = self.conn.filename(), "closing store");
        self.closed.store(true, Ordering::SeqCst);
        for collection in self.known_collections() {
            collection.sync();
            collection.close();
        }
        self.conn.close()
    }
}
