//! Edge case tests for tether-engine
//!
//! These tests drive whole stores through the public API and cover the
//! boundary conditions between batching, syncing, crawling and teardown.

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_engine::{
    BatchKind, Engine, EngineConfig, Error, Event, HttpResponse, MemoryStorage, MockBackend,
    Selector, Sensitivity, Store, StoreConfig, Verb,
};

const ITEMS: &str = "https://api.test/items";

fn local(key: Option<&str>) -> Store {
    let config = match key {
        Some(key) => StoreConfig::new().with_key(key),
        None => StoreConfig::new(),
    };
    Engine::new(MockBackend::new()).create("items", config)
}

fn record_events(store: &Store, events: &[Event]) -> Arc<Mutex<Vec<(Event, Value)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let name = store.name().unwrap();
    for &event in events {
        let s = Arc::clone(&seen);
        store.engine().bus().on(
            &name,
            event.as_str(),
            Arc::new(move |payload: &Value| s.lock().push((event, payload.clone()))),
            "edge-cases",
        );
    }
    seen
}

// ============================================================================
// Set / Get
// ============================================================================

#[tokio::test]
async fn keyed_batch_scenario() {
    let store = local(Some("id"));

    store
        .batch(
            BatchKind::Set,
            vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})],
            true,
            None,
        )
        .await
        .unwrap();

    assert_eq!(store.total(), 2);
    assert_eq!(store.record("1").unwrap().to_json(), json!({"v": "a"}));

    let keys = |records: Vec<tether_engine::Record>| {
        records.into_iter().map(|r| r.key).collect::<Vec<_>>()
    };
    assert_eq!(keys(store.sort("v asc", false, Sensitivity::default()).unwrap()), vec!["1", "2"]);
    assert_eq!(keys(store.sort("v desc", false, Sensitivity::default()).unwrap()), vec!["2", "1"]);
}

#[tokio::test]
async fn unicode_and_empty_values() {
    let store = local(None);
    let names = ["日本語テスト", "Привет мир", "🎉🚀💯", "", "Hello\nWorld\tTab"];

    for (i, name) in names.iter().enumerate() {
        let key = i.to_string();
        store.set(Some(key.as_str()), json!({"name": name}), false).await.unwrap();
        assert_eq!(store.record(key.as_str()).unwrap().to_json(), json!({"name": name}));
    }
    assert_eq!(store.find("мир", None).unwrap().len(), 1);
}

#[tokio::test]
async fn keys_with_special_characters() {
    let store = local(Some("id"));
    for key in ["a/b", "a b", "a,b", "ключ"] {
        store.set(Some(key), json!({"v": 1}), false).await.unwrap();
    }

    assert_eq!(store.total(), 4);
    assert!(store.record(Selector::Key("a,b".into())).is_some());
    // A bare comma in a selector string means a list
    assert!(matches!(store.get("a,b"), Some(tether_engine::Selection::List(_))));
}

#[tokio::test]
async fn unknown_selectors_never_fail() {
    let store = local(None);

    assert!(store.get("missing").is_none());
    assert!(store.get(99usize).is_none());
    assert_eq!(
        store.get(Selector::Range { start: 5, offset: 5 }).unwrap().into_records(),
        Vec::new()
    );
}

#[tokio::test]
async fn deeply_nested_composite_survives() {
    let store = local(None);
    let mut nested = json!({"leaf": true});
    for _ in 0..64 {
        nested = json!({"inner": nested});
    }

    store.set(Some("deep"), json!({"tree": nested.clone()}), false).await.unwrap();
    assert_eq!(store.record("deep").unwrap().to_json()["tree"], nested);
}

// ============================================================================
// Batch
// ============================================================================

#[tokio::test]
async fn batch_delete_by_mixed_selectors_keeps_keys_unique() {
    let store = local(None);
    let items = (0..10).map(|i| json!({"n": i})).collect();
    store.batch(BatchKind::Set, items, false, Some(3)).await.unwrap();

    store
        .batch(BatchKind::Delete, vec![json!(9), json!("0"), json!(4)], false, None)
        .await
        .unwrap();

    assert_eq!(store.total(), 7);
    let mut keys = store.keys();
    keys.dedup();
    assert_eq!(keys.len(), 7);
    // Delete batches reindex, so auto keys are dense again
    assert_eq!(store.keys(), (0..7).map(|i| i.to_string()).collect::<Vec<_>>());
}

#[tokio::test]
async fn batch_events_fire_once() {
    let store = local(Some("id"));
    let seen = record_events(
        &store,
        &[Event::BeforeDataBatch, Event::AfterDataBatch, Event::FailedDataBatch],
    );

    store
        .batch(BatchKind::Set, vec![json!({"id": "a"}), json!({"id": "b"})], false, None)
        .await
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, Event::BeforeDataBatch);
    assert_eq!(seen[1], (Event::AfterDataBatch, json!({"type": "set", "items": 2, "total": 2})));
}

#[tokio::test]
async fn large_batch_in_small_chunks() {
    let store = Engine::builder(Arc::new(MockBackend::new()))
        .config(EngineConfig::default().with_chunk_size(7))
        .build()
        .create("bulk", StoreConfig::new());

    let items: Vec<Value> = (0..500).map(|i| json!({"n": i})).collect();
    let records = store.batch(BatchKind::Set, items, false, None).await.unwrap();

    assert_eq!(records.len(), 500);
    assert_eq!(store.record("499").unwrap().to_json(), json!({"n": 499}));
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn sync_failure_leaves_store_empty_and_unloaded() {
    for failure in [
        HttpResponse::status(500),
        HttpResponse::status(401),
        HttpResponse::json(200, json!("not a collection")),
    ] {
        let backend = MockBackend::new();
        let store = Engine::new(backend.clone()).create("items", StoreConfig::new().with_uri(ITEMS));
        store
            .batch(BatchKind::Set, vec![json!({"a": 1}), json!({"a": 2})], true, None)
            .await
            .unwrap();
        assert!(store.loaded());

        backend.on(Verb::Get, ITEMS, failure);
        assert!(store.sync(false).await.is_err());
        assert_eq!(store.total(), 0);
        assert!(!store.loaded());
        // Configuration survives
        assert_eq!(store.uri().as_deref(), Some(ITEMS));
    }
}

#[tokio::test]
async fn sync_through_source_path() {
    let backend = MockBackend::new();
    backend.get(ITEMS, json!({"meta": {"count": 2}, "data": {"rows": [{"id": "x"}, {"id": "y"}]}}));
    let store = Engine::new(backend).create(
        "items",
        StoreConfig::new().with_uri(ITEMS).with_key("id").with_source("data.rows"),
    );

    store.sync(true).await.unwrap();
    assert_eq!(store.total(), 2);
    assert!(store.record("y").is_some());
}

#[tokio::test]
async fn changing_endpoint_moves_subscription() {
    let backend = MockBackend::new();
    backend.get(ITEMS, json!([{"id": 1}]));
    backend.get("https://api.test/other", json!([{"id": 2}, {"id": 3}]));
    let store = Engine::new(backend.clone()).create("items", StoreConfig::new().with_key("id"));

    store.set_uri(Some(ITEMS.into())).await.unwrap();
    store.set_uri(Some("https://api.test/other".into())).await.unwrap();
    assert_eq!(store.total(), 2);

    // Expiring the old endpoint no longer re-syncs
    store.engine().cache().expire(ITEMS, false);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.count(Verb::Get, ITEMS), 1);
}

#[tokio::test(start_paused = true)]
async fn expiry_timer_drives_resync() {
    let backend = MockBackend::new();
    backend.get(ITEMS, json!([{"id": 1}]));
    let store = Engine::new(backend.clone()).create("items", StoreConfig::new().with_key("id"));
    store.set_uri(Some(ITEMS.into())).await.unwrap();
    store.set_expires(Some(Duration::from_secs(1))).unwrap();

    backend.get(ITEMS, json!([{"id": 1}, {"id": 2}]));
    tokio::time::sleep(Duration::from_millis(1100)).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(store.total(), 2);
    assert_eq!(backend.count(Verb::Get, ITEMS), 2);

    store.set_expires(None).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.count(Verb::Get, ITEMS), 2);
}

// ============================================================================
// Crawl / Generate
// ============================================================================

#[tokio::test]
async fn crawl_resolves_children_against_record_endpoint() {
    let backend = MockBackend::new();
    backend.get("/items/1/x", json!({"name": "x"}));
    backend.get("/items/1/y", json!({"name": "y"}));
    let store = Engine::new(backend.clone()).create("items", StoreConfig::new().with_uri("/items"));
    store
        .set(Some("1"), json!({"children": ["x", "y"]}), true)
        .await
        .unwrap();

    store.crawl("1").await.unwrap();

    let child = store.child("1", Some("children")).unwrap();
    assert_eq!(child.total(), 2);
    assert_eq!(backend.count(Verb::Get, "/items/1/x"), 1);
    assert_eq!(backend.count(Verb::Get, "/items/1/y"), 1);
}

#[tokio::test]
async fn deleting_a_record_releases_its_subtree() {
    let engine = Engine::new(MockBackend::new());
    let store = engine.create("root", StoreConfig::new().with_retrieve(true));

    store
        .set(Some("1"), json!({"groups": [{"members": [{"n": 1}, {"n": 2}]}]}), false)
        .await
        .unwrap();
    assert_eq!(engine.len(), 3);

    store.del("1", true, false).await.unwrap();
    assert_eq!(engine.len(), 1);
}

#[tokio::test]
async fn failed_relation_is_announced_on_child() {
    let backend = MockBackend::new();
    backend.on(Verb::Get, "https://api.test/users/1", HttpResponse::status(403));
    let engine = Engine::new(backend);
    let store = engine.create("posts", StoreConfig::new().with_uri("https://api.test/posts"));
    store
        .set(Some("1"), json!({"author": "/users/1"}), true)
        .await
        .unwrap();

    let failures = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&failures);
    engine.bus().on(
        "1-author",
        Event::FailedDataRetrieve.as_str(),
        Arc::new(move |payload| f.lock().push(payload.clone())),
        "edge-cases",
    );

    store.crawl("1").await.unwrap();
    assert_eq!(failures.lock().len(), 1);
    assert_eq!(failures.lock()[0]["field"], json!("author"));
}

// ============================================================================
// Permissions
// ============================================================================

#[tokio::test]
async fn advertised_read_only_collection_blocks_writes() {
    let backend = MockBackend::new();
    backend.on(
        Verb::Get,
        ITEMS,
        HttpResponse::json(200, json!([{"id": 1}])).with_header("Allow", "GET, HEAD"),
    );
    let store = Engine::new(backend.clone()).create("items", StoreConfig::new().with_key("id"));
    store.set_uri(Some(ITEMS.into())).await.unwrap();

    let err = store.set(None, json!({"v": 1}), false).await.unwrap_err();
    assert_eq!(err, Error::ServerInvalidMethod);
    assert_eq!(backend.count(Verb::Post, ITEMS), 0);

    // Local changes are still allowed
    store.set(Some("2"), json!({"v": 2}), true).await.unwrap();
    assert_eq!(store.total(), 2);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn snapshot_survives_into_fresh_engine() {
    let storage = MemoryStorage::new();
    let store = local(Some("id"));
    store
        .batch(BatchKind::Set, vec![json!({"id": "a", "v": 1}), json!({"id": "b", "v": 2})], false, None)
        .await
        .unwrap();
    store.save(&storage).unwrap();

    let restored = local(Some("id"));
    restored.restore(&storage).unwrap();
    assert_eq!(restored.records(), store.records());
}

// ============================================================================
// Properties
// ============================================================================

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn set_then_get_returns_data_without_key(
        fields in proptest::collection::btree_map("[a-z]{1,6}", any::<i32>(), 1..8),
        id in "[a-z0-9]{1,8}",
    ) {
        let store = local(Some("id"));
        let mut data: serde_json::Map<String, Value> =
            fields.into_iter().map(|(k, v)| (k, json!(v))).collect();
        let expected = {
            let mut expected = data.clone();
            expected.remove("id");
            Value::Object(expected)
        };
        data.insert("id".into(), json!(id.clone()));

        runtime().block_on(store.set(Some(id.as_str()), Value::Object(data), false)).unwrap();
        prop_assert_eq!(store.record(id.as_str()).unwrap().to_json(), expected);
    }

    #[test]
    fn reindex_is_idempotent(count in 1usize..30, removals in proptest::collection::vec(0usize..30, 0..10)) {
        let store = local(None);
        let rt = runtime();
        rt.block_on(store.batch(BatchKind::Set, (0..count).map(|i| json!({"n": i})).collect(), false, None)).unwrap();
        for r in removals {
            if let Some(record) = store.record(r % store.total().max(1)) {
                rt.block_on(store.del(record.key.as_str(), false, false)).unwrap();
            }
        }

        store.reindex().unwrap();
        let once = store.keys();
        store.reindex().unwrap();
        prop_assert_eq!(store.keys(), once);
    }
}
