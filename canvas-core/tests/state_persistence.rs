//! State store persistence, batching and sync against real collaborators.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowcanvas_core::{
    CanvasEngine, CanvasResult, Clock, EngineConfig, EntryListCodec, FilePersistence,
    ManualClock, MemoryGraph, MemoryPersistence, Namespace, PersistenceBackend, SetOptions,
    StateStore, StoreConfig, SubscribeOptions, SyncRecord, SyncSink,
};
use serde_json::json;

#[derive(Debug, Default)]
struct CollectingSink {
    flushed: Mutex<Vec<Vec<SyncRecord>>>,
}

impl SyncSink for CollectingSink {
    fn flush(&self, batch: &[SyncRecord]) -> CanvasResult<()> {
        self.flushed.lock().expect("lock").push(batch.to_vec());
        Ok(())
    }
}

#[test]
fn values_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig {
        persistence_key: "diagram-7".to_string(),
        ..StoreConfig::default()
    };

    {
        let backend = FilePersistence::new(dir.path()).expect("backend");
        let store = StateStore::builder()
            .config(config.clone())
            .persistence(Arc::new(backend))
            .build();
        store
            .set_state(Namespace::Zoom, json!({ "scale": 2.5 }), SetOptions::default())
            .expect("set");
        store
            .update_state(
                Namespace::Nodes,
                json!({ "z": { "id": "z" }, "a": { "id": "a" } }),
                SetOptions::default(),
            )
            .expect("update");
    }

    let backend = FilePersistence::new(dir.path()).expect("backend");
    let notified = Arc::new(Mutex::new(0));
    let store = StateStore::builder()
        .config(config)
        .persistence(Arc::new(backend))
        .build();
    let count = Arc::clone(&notified);
    store
        .subscribe(
            Namespace::Zoom,
            move |_change| *count.lock().expect("lock") += 1,
            SubscribeOptions::default(),
        )
        .expect("subscribe");

    assert_eq!(
        store.get_state_key(Namespace::Zoom, "scale").expect("live"),
        Some(json!(2.5))
    );
    let nodes = store.get_state(Namespace::Nodes).expect("live").expect("nodes");
    let keys: Vec<_> = nodes.as_object().expect("object").keys().cloned().collect();
    assert_eq!(keys, vec!["z", "a"]);
    assert_eq!(*notified.lock().expect("lock"), 0, "initial load is silent");
    assert_eq!(store.status().changes, 0);
}

#[test]
fn entry_list_codec_on_the_wire() {
    let backend = Arc::new(MemoryPersistence::new());
    let store = StateStore::builder()
        .persistence(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
        .codec(Namespace::Edges, Arc::new(EntryListCodec))
        .build();
    store
        .set_state(
            Namespace::Edges,
            json!({ "e2": { "id": "e2" }, "e1": { "id": "e1" } }),
            SetOptions::default(),
        )
        .expect("set");

    let raw = backend
        .load("flowCanvas.edges")
        .expect("load")
        .expect("persisted");
    assert_eq!(raw, r#"[["e2",{"id":"e2"}],["e1",{"id":"e1"}]]"#);

    let reloaded = StateStore::builder()
        .persistence(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
        .codec(Namespace::Edges, Arc::new(EntryListCodec))
        .build();
    assert_eq!(
        reloaded.get_state(Namespace::Edges).expect("live"),
        store.get_state(Namespace::Edges).expect("live")
    );
}

#[test]
fn delete_namespace_removes_persisted_copy() {
    let backend = Arc::new(MemoryPersistence::new());
    let store = StateStore::builder()
        .persistence(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
        .build();
    store
        .set_state(Namespace::Viewport, json!({ "x": 5 }), SetOptions::default())
        .expect("set");
    assert_eq!(backend.keys(), vec!["flowCanvas.viewport".to_string()]);

    assert!(store.delete_state(Namespace::Viewport, None).expect("delete"));
    assert!(backend.keys().is_empty());
}

#[tokio::test]
async fn batch_commits_each_namespace_once() {
    let backend = Arc::new(MemoryPersistence::new());
    let store = StateStore::builder()
        .persistence(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
        .build();
    let changes = Arc::new(Mutex::new(Vec::new()));
    for ns in [Namespace::Zoom, Namespace::Viewport] {
        let log = Arc::clone(&changes);
        store
            .subscribe(
                ns,
                move |change| log.lock().expect("lock").push(change.namespace),
                SubscribeOptions::default(),
            )
            .expect("subscribe");
    }

    let seen_inside = store
        .batch(|s| async move {
            s.set_state(Namespace::Zoom, json!({ "scale": 2.0 }), SetOptions::default())
                .expect("queued");
            tokio::task::yield_now().await;
            s.update_state(Namespace::Zoom, json!({ "min": 0.5 }), SetOptions::default())
                .expect("queued");
            s.merge_state(Namespace::Viewport, json!({ "x": 10 }), SetOptions::default())
                .expect("queued");
            s.get_state_key(Namespace::Zoom, "scale").expect("live")
        })
        .await
        .expect("batch");

    assert_eq!(seen_inside, Some(json!(1.0)));
    assert_eq!(
        store.get_state(Namespace::Zoom).expect("live"),
        Some(json!({ "scale": 2.0, "min": 0.5 }))
    );
    assert_eq!(
        store.get_state(Namespace::Viewport).expect("live"),
        Some(json!({ "x": 10, "y": 0, "width": 800, "height": 600 }))
    );
    assert_eq!(
        *changes.lock().expect("lock"),
        vec![Namespace::Zoom, Namespace::Viewport]
    );
    assert_eq!(store.status().persisted_writes, 2);
    assert!(!store.status().batching);
}

#[tokio::test]
async fn batch_is_not_atomic() {
    let store = StateStore::new();
    store
        .register_validator(Namespace::Zoom, |_| Err("zoom is locked".to_string()))
        .expect("validator");

    store
        .batch(|s| async move {
            s.set_state(Namespace::Zoom, json!({ "scale": 9.0 }), SetOptions::default())
                .expect("queued");
            s.set_state(Namespace::Layout, json!({ "direction": "TB" }), SetOptions::default())
                .expect("queued");
        })
        .await
        .expect("batch");

    assert_eq!(
        store.get_state_key(Namespace::Zoom, "scale").expect("live"),
        Some(json!(1.0))
    );
    assert_eq!(
        store.get_state_key(Namespace::Layout, "direction").expect("live"),
        Some(json!("TB"))
    );
    assert_eq!(store.status().validation_failures, 1);
}

#[tokio::test]
async fn cancelled_batch_releases_the_store() {
    let store = StateStore::new();

    let outcome = tokio::time::timeout(
        Duration::from_millis(10),
        store.batch(|s| async move {
            s.set_state(Namespace::Zoom, json!({ "scale": 9.0 }), SetOptions::default())
                .expect("queued");
            std::future::pending::<()>().await;
        }),
    )
    .await;
    assert!(outcome.is_err(), "batch never finishes on its own");
    assert!(!store.status().batching);

    store
        .set_state(Namespace::Zoom, json!({ "scale": 2.0 }), SetOptions::default())
        .expect("set");
    assert_eq!(
        store.get_state_key(Namespace::Zoom, "scale").expect("live"),
        Some(json!(2.0))
    );
}

#[test]
fn panicking_batch_releases_the_store() {
    let store = StateStore::new();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let inner = store.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        runtime.block_on(inner.batch(|s| async move {
            s.set_state(Namespace::Layout, json!({ "direction": "TB" }), SetOptions::default())
                .expect("queued");
            panic!("handler blew up");
        }))
    }));
    assert!(result.is_err());
    assert!(!store.status().batching);
    assert_eq!(
        store.get_state_key(Namespace::Layout, "direction").expect("live"),
        Some(json!("LR"))
    );
}

#[test]
fn entry_list_codec_refuses_non_objects() {
    let backend = Arc::new(MemoryPersistence::new());
    let store = StateStore::builder()
        .persistence(Arc::clone(&backend) as Arc<dyn PersistenceBackend>)
        .codec(Namespace::Edges, Arc::new(EntryListCodec))
        .build();
    store
        .set_state(Namespace::Edges, json!(["e1", "e2"]), SetOptions::default())
        .expect("in-memory write still succeeds");

    assert_eq!(backend.load("flowCanvas.edges").expect("load"), None);
    let status = store.status();
    assert_eq!(status.persisted_writes, 0);
    assert_eq!(status.persistence_errors, 1);
    assert_eq!(
        store.get_state(Namespace::Edges).expect("live"),
        Some(json!(["e1", "e2"]))
    );
}

#[test]
fn engine_tick_pumps_debounced_sync() {
    let clock = Arc::new(ManualClock::new());
    let sink = Arc::new(CollectingSink::default());
    let store = StateStore::builder()
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .sync_sink(Arc::clone(&sink) as Arc<dyn SyncSink>)
        .build();
    let mut engine = CanvasEngine::with_store(EngineConfig::default(), store, MemoryGraph::new());

    for scale in [1.1, 1.2, 1.3] {
        engine
            .store()
            .set_state(Namespace::Zoom, json!({ "scale": scale }), SetOptions::default())
            .expect("set");
        clock.advance(Duration::from_millis(50));
        engine.tick();
    }
    assert!(sink.flushed.lock().expect("lock").is_empty());

    clock.advance(Duration::from_millis(200));
    engine.tick();

    let flushed = sink.flushed.lock().expect("lock");
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].len(), 3);
    assert_eq!(flushed[0][2].value, json!({ "scale": 1.3 }));
    assert_eq!(engine.status().store.sync_flushes, 1);
}
