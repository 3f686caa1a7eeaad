use crate::connection::SqlValue;
use crate::document::Document;
use crate::{Error, Result, RowId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One reconciling change between an old and a new result list.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Delete { old_index: usize, item: Document },
    Insert { new_index: usize, item: Document },
    Update { old_index: usize, new_index: usize, item: Document },
    Move { old_index: usize, new_index: usize, item: Document },
}

/// The diff between two ordered result lists, plus the lists themselves.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub old_items: Vec<Document>,
    pub items: Vec<Document>,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Diffs `old_items` against `new_items` by `__rowid__`. Emits deletes in
    /// increasing old index, then updates in increasing new index, then
    /// moves in increasing new index, then inserts in increasing new index.
    pub fn compute(old_items: Vec<Document>, new_items: Vec<Document>) -> Self {
        let old_index_by_rowid: HashMap<RowId, usize> = old_items
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.rowid().map(|r| (r, i)))
            .collect();
        let new_rowids: std::collections::HashSet<RowId> =
            new_items.iter().filter_map(Document::rowid).collect();

        let mut deletes = Vec::new();
        for (old_index, item) in old_items.iter().enumerate() {
            if let Some(rowid) = item.rowid() {
                if !new_rowids.contains(&rowid) {
                    deletes.push(Change::Delete {
                        old_index,
                        item: item.clone(),
                    });
                }
            }
        }

        let mut updates = Vec::new();
        let mut moves = Vec::new();
        let mut inserts = Vec::new();

        for (new_index, item) in new_items.iter().enumerate() {
            let existing = item.rowid().and_then(|rowid| old_index_by_rowid.get(&rowid).copied());
            match existing {
                Some(old_index) => {
                    let old_item = &old_items[old_index];
                    if old_item != item {
                        updates.push(Change::Update {
                            old_index,
                            new_index,
                            item: item.clone(),
                        });
                    } else if old_index != new_index {
                        moves.push(Change::Move {
                            old_index,
                            new_index,
                            item: item.clone(),
                        });
                    }
                }
                None => inserts.push(Change::Insert {
                    new_index,
                    item: item.clone(),
                }),
            }
        }

        let mut changes = Vec::with_capacity(deletes.len() + updates.len() + moves.len() + inserts.len());
        changes.extend(deletes);
        changes.extend(updates);
        changes.extend(moves);
        changes.extend(inserts);

        Self {
            old_items,
            items: new_items,
            changes,
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// True iff applying `changes` to `old_items` yields `items` exactly,
    /// and every rowid common to both lists is covered by exactly one of
    /// Update or Move.
    pub fn validate(&self) -> bool {
        let n = self.items.len();
        let mut reconstruction: Vec<Option<Document>> = vec![None; n];

        for change in &self.changes {
            let (new_index, item) = match change {
                Change::Insert { new_index, item } => (*new_index, item),
                Change::Update { new_index, item, .. } => (*new_index, item),
                Change::Move { new_index, item, .. } => (*new_index, item),
                Change::Delete { .. } => continue,
            };
            match reconstruction.get_mut(new_index) {
                Some(slot) => *slot = Some(item.clone()),
                None => return false,
            }
        }

        for (index, slot) in reconstruction.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let (Some(new_item), Some(old_item)) = (self.items.get(index), self.old_items.get(index)) else {
                return false;
            };
            if old_item == new_item {
                *slot = Some(new_item.clone());
            } else {
                return false;
            }
        }

        let reconstructed: Option<Vec<Document>> = reconstruction.into_iter().collect();
        if reconstructed.as_deref() != Some(self.items.as_slice()) {
            return false;
        }

        let mut coverage: HashMap<RowId, u32> = HashMap::new();
        for change in &self.changes {
            let item = match change {
                Change::Update { item, .. } | Change::Move { item, .. } => item,
                _ => continue,
            };
            if let Some(rowid) = item.rowid() {
                *coverage.entry(rowid).or_insert(0) += 1;
            }
        }
        coverage.values().all(|count| *count == 1)
    }
}

type Subscriber = Box<dyn Fn(&ChangeSet) + Send>;

/// A standing query over one collection, diffing its result set against the
/// previous publish on every `push_changes` call.
pub struct LiveQuery {
    where_clause: Option<String>,
    args: Vec<SqlValue>,
    order_by: Option<String>,
    limit: i64,
    last_published: Mutex<Option<Vec<Document>>>,
    dirty: AtomicBool,
    closed: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LiveQuery {
    pub fn new(where_clause: Option<String>, args: Vec<SqlValue>, order_by: Option<String>, limit: i64) -> Self {
        Self {
            where_clause,
            args,
            order_by,
            limit,
            last_published: Mutex::new(None),
            dirty: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn where_clause(&self) -> Option<&str> {
        self.where_clause.as_deref()
    }

    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn last_published(&self) -> Vec<Document> {
        self.last_published.lock().unwrap().clone().unwrap_or_default()
    }

    /// Registers a subscriber. If a result has already been published, the
    /// subscriber is immediately delivered a change-set of all inserts
    /// against an empty `old_items`.
    pub fn add_subscriber(&self, subscriber: impl Fn(&ChangeSet) + Send + 'static) {
        let boxed: Subscriber = Box::new(subscriber);
        if let Some(items) = self.last_published.lock().unwrap().clone() {
            let change_set = ChangeSet::compute(Vec::new(), items);
            boxed(&change_set);
        }
        self.subscribers.lock().unwrap().push(boxed);
    }

    /// Called by the owning collection on every mutation that could affect
    /// this query's result. Marks the query dirty; publishing is deferred
    /// to the next `push_changes`.
    pub fn notify_change(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Re-publishes against `new_items` if dirty, diffing against the
    /// previous publish and delivering the resulting change-set to every
    /// subscriber. A no-op if not dirty.
    pub fn push_changes(&self, new_items: Vec<Document>) -> Result<Option<ChangeSet>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.is_dirty() {
            return Ok(None);
        }

        let old_items = self.last_published.lock().unwrap().clone().unwrap_or_default();
        let change_set = ChangeSet::compute(old_items, new_items);
        *self.last_published.lock().unwrap() = Some(change_set.items.clone());
        self.dirty.store(false, Ordering::SeqCst);

        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(&change_set);
        }

        Ok(Some(change_set))
    }

    /// Marks this live query closed. Further `push_changes` calls fail with
    /// `Closed`; `last_published` keeps returning the last published items.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
