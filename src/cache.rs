use crate::document::Document;
use crate::RowId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

struct CacheEntry {
    document: Document,
    generation: u64,
    pins: u32,
}

struct Inner {
    cache_size: i64,
    entries: HashMap<RowId, CacheEntry>,
    lru: VecDeque<RowId>,
    generation_seq: u64,
}

impl Inner {
    fn new(cache_size: i64) -> Self {
        Self {
            cache_size,
            entries: HashMap::new(),
            lru: VecDeque::new(),
            generation_seq: 0,
        }
    }
}

/// Row-id to document map. Distinguishes in-use (pinned) entries from
/// unpinned entries eligible for LRU eviction.
///
/// `cache_size == -1` disables caching entirely: `lookup` always misses and
/// `intern` hands back an uncached handle that is never current. `cache_size
/// == 0` still dedupes entries while pinned, but evicts the instant they
/// become unpinned. Any positive value bounds the unpinned LRU list.
#[derive(Clone)]
pub struct ObjectCache(Arc<Mutex<Inner>>);

impl ObjectCache {
    pub fn new(cache_size: i64) -> Self {
        Self(Arc::new(Mutex::new(Inner::new(cache_size))))
    }

    pub fn cache_size(&self) -> i64 {
        self.0.lock().unwrap().cache_size
    }

    fn disabled(&self) -> bool {
        self.cache_size() == -1
    }

    /// Number of unpinned entries presently held for LRU eviction, exposed
    /// for invariant testing.
    pub fn unpinned_len(&self) -> usize {
        self.0.lock().unwrap().lru.len()
    }

    fn generation_of(&self, rowid: RowId) -> Option<u64> {
        self.0.lock().unwrap().entries.get(&rowid).map(|e| e.generation)
    }

    /// Returns the cached document for `rowid`, marking it in-use. `None` if
    /// absent or caching is disabled.
    pub fn lookup(&self, rowid: RowId) -> Option<CacheHandle> {
        if self.disabled() {
            return None;
        }
        let mut inner = self.0.lock().unwrap();
        let entry = inner.entries.get_mut(&rowid)?;
        entry.pins += 1;
        let generation = entry.generation;
        let document = entry.document.clone();
        inner.lru.retain(|r| *r != rowid);
        drop(inner);

        Some(CacheHandle {
            rowid,
            generation,
            document,
            cache: self.clone(),
            disabled: false,
        })
    }

    /// Inserts `document` for `rowid` if absent, otherwise returns the
    /// existing entry (deduplication). The returned handle is marked in-use.
    pub fn intern(&self, rowid: RowId, document: Document) -> CacheHandle {
        if self.disabled() {
            return CacheHandle {
                rowid,
                generation: 0,
                document,
                cache: self.clone(),
                disabled: true,
            };
        }

        let mut inner = self.0.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&rowid) {
            entry.pins += 1;
            let generation = entry.generation;
            let existing = entry.document.clone();
            inner.lru.retain(|r| *r != rowid);
            return CacheHandle {
                rowid,
                generation,
                document: existing,
                cache: self.clone(),
                disabled: false,
            };
        }

        inner.generation_seq += 1;
        let generation = inner.generation_seq;
        inner.entries.insert(
            rowid,
            CacheEntry {
                document: document.clone(),
                generation,
                pins: 1,
            },
        );

        CacheHandle {
            rowid,
            generation,
            document,
            cache: self.clone(),
            disabled: false,
        }
    }

    /// Drops any entry for `rowid`; any outstanding handle for it becomes
    /// not current.
    pub fn invalidate(&self, rowid: RowId) {
        let mut inner = self.0.lock().unwrap();
        inner.entries.remove(&rowid);
        inner.lru.retain(|r| *r != rowid);
    }

    /// Drops unpinned entries only.
    pub fn flush(&self) {
        let mut inner = self.0.lock().unwrap();
        for rowid in inner.lru.drain(..).collect::<Vec<_>>() {
            inner.entries.remove(&rowid);
        }
    }

    /// Drops every entry, pinned or not. Pinned handles become not current.
    pub fn remove_all(&self) {
        let mut inner = self.0.lock().unwrap();
        inner.entries.clear();
        inner.lru.clear();
    }

    /// Signals that an outstanding holder for `rowid` dropped its reference.
    /// Once unpinned, the entry joins the LRU list and, if the list now
    /// exceeds `cache_size`, the oldest unpinned entry is evicted.
    pub fn release(&self, rowid: RowId) {
        let mut inner = self.0.lock().unwrap();
        let cache_size = inner.cache_size;

        let Some(entry) = inner.entries.get_mut(&rowid) else {
            return;
        };
        if entry.pins > 0 {
            entry.pins -= 1;
        }
        if entry.pins != 0 {
            return;
        }

        inner.lru.push_back(rowid);
        if cache_size >= 0 {
            while inner.lru.len() as i64 > cache_size {
                match inner.lru.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }
}

/// A handle to a document backed by the cache. Carries the rowid and the
/// generation the document was current as of, so `is_current` can be
/// answered without holding a strong reference into the cache itself.
#[derive(Clone)]
pub struct CacheHandle {
    rowid: RowId,
    generation: u64,
    document: Document,
    cache: ObjectCache,
    disabled: bool,
}

impl CacheHandle {
    pub fn rowid(&self) -> RowId {
        self.rowid
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    /// True iff the cache still considers this handle's document the
    /// authoritative one for its rowid. Always false when caching is
    /// disabled.
    pub fn is_current(&self) -> bool {
        if self.disabled {
            return false;
        }
        self.cache.generation_of(self.rowid) == Some(self.generation)
    }

    /// Signals that this holder is done with the document. Equivalent to
    /// calling `ObjectCache::release` for this handle's rowid.
    pub fn release(&self) {
        self.cache.release(self.rowid);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn intern_dedupes_same_rowid() {
        let cache = ObjectCache::new(10);
        let first = cache.intern(1, doc(json!({"name": "a"})));
        let second = cache.intern(1, doc(json!({"name": "different"})));
        assert_eq!(first.document(), second.document());
    }

    #[test]
    fn invalidate_marks_handle_not_current() {
        let cache = ObjectCache::new(10);
        let handle = cache.intern(1, doc(json!({"name": "a"})));
        assert!(handle.is_current());
        cache.invalidate(1);
        assert!(!handle.is_current());
    }

    #[test]
    fn lru_evicts_oldest_unpinned_beyond_cache_size() {
        let cache = ObjectCache::new(1);
        let a = cache.intern(1, doc(json!({"n": 1})));
        let b = cache.intern(2, doc(json!({"n": 2})));
        a.release();
        b.release();
        assert_eq!(cache.unpinned_len(), 1);
        assert!(!a.is_current());
        assert!(b.is_current());
    }

    #[test]
    fn pinned_entries_are_never_evicted() {
        let cache = ObjectCache::new(0);
        let pinned = cache.intern(1, doc(json!({"n": 1})));
        let _other = cache.intern(2, doc(json!({"n": 2})));
        assert!(pinned.is_current());
        assert_eq!(cache.unpinned_len(), 0);
    }

    #[test]
    fn cache_size_zero_evicts_immediately_on_release() {
        let cache = ObjectCache::new(0);
        let handle = cache.intern(1, doc(json!({"n": 1})));
        handle.release();
        assert_eq!(cache.unpinned_len(), 0);
        assert!(!handle.is_current());
    }

    #[test]
    fn cache_size_negative_one_disables_caching_entirely() {
        let cache = ObjectCache::new(-1);
        let handle = cache.intern(1, doc(json!({"n": 1})));
        assert!(!handle.is_current());
        assert!(cache.lookup(1).is_none());
    }

    #[test]
    fn remove_all_invalidates_pinned_entries_too() {
        let cache = ObjectCache::new(10);
        let handle = cache.intern(1, doc(json!({"n": 1})));
        cache.remove_all();
        assert!(!handle.is_current());
    }
}
