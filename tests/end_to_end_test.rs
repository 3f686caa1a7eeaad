use ntjson_store::{Document, SqlValue, Store};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn doc(value: serde_json::Value) -> Document {
    Document::from_value(value).unwrap()
}

#[test]
fn insert_then_count_where_matches_age_filter() {
    let store = Store::open(":memory:").unwrap();
    let people = store.collection("people").unwrap();

    people.insert(doc(json!({"name": "alice", "age": 30}))).unwrap();

    let adults = people.count_where(Some("[age] >= ?"), &[SqlValue::Integer(18)]).unwrap();
    assert_eq!(adults, 1);
}

#[test]
fn close_then_any_operation_on_any_collection_fails() {
    let store = Store::open(":memory:").unwrap();
    let people = store.collection("people").unwrap();
    people.insert(doc(json!({"name": "alice"}))).unwrap();

    store.close().unwrap();

    assert!(matches!(
        people.insert(doc(json!({"name": "bob"}))),
        Err(ntjson_store::Error::Closed)
    ));
    assert!(matches!(store.collection("other"), Err(ntjson_store::Error::Closed)));
}

#[test]
fn live_query_delivers_single_changeset_with_two_ordered_inserts() {
    let store = Store::open(":memory:").unwrap();
    let tasks = store.collection("tasks").unwrap();

    let live_query = tasks.live_query(None, vec![], Some("[priority]"), 0);
    let deliveries: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let deliveries_clone = Arc::clone(&deliveries);
    live_query.add_subscriber(move |change_set| {
        deliveries_clone.lock().unwrap().push(change_set.changes.len());
    });

    tasks.insert(doc(json!({"priority": 2}))).unwrap();
    tasks.insert(doc(json!({"priority": 1}))).unwrap();
    tasks.push_changes().unwrap();

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.as_slice(), &[2]);

    let published = live_query.last_published();
    assert_eq!(published[0].as_map().get("priority"), Some(&json!(1)));
    assert_eq!(published[1].as_map().get("priority"), Some(&json!(2)));
}

#[test]
fn insert_batch_with_a_malformed_document_changes_nothing() {
    let store = Store::open(":memory:").unwrap();
    let people = store.collection("people").unwrap();
    people.add_queryable_fields(vec!["active".to_string()]);
    people.ensure_schema().unwrap();

    let good_one = doc(json!({"name": "alice", "active": 1}));
    let good_two = doc(json!({"name": "bob", "active": 0}));
    let malformed = doc(json!({"name": "carol", "active": true}));

    let result = people.insert_batch(vec![good_one, good_two, malformed]);
    assert!(result.is_err());
    assert_eq!(people.count().unwrap(), 0);
}

#[test]
fn schema_idempotence_for_repeated_index_declarations() {
    let store = Store::open(":memory:").unwrap();
    let people = store.collection("people").unwrap();

    for _ in 0..3 {
        people.add_index("lastName, firstName");
    }
    people.ensure_schema().unwrap();
    people.ensure_schema().unwrap();

    // A second round of ensure_schema with nothing pending must be a no-op;
    // re-declaring the same index again still only applies it once.
    people.add_index("lastName, firstName");
    people.ensure_schema().unwrap();
}
