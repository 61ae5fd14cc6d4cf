//! End-to-end behaviour of the bus, store and overlap manager.

use std::sync::{Arc, Mutex};

use flowcanvas_core::{
    CanvasEngine, CanvasGraph, DispatchBus, Edge, EdgeId, EdgeRouting, Endpoint, EngineConfig,
    GraphEvent, HandlerOptions, LayoutDirection, MemoryGraph, Namespace, Node, NodeId,
    OffsetKind, Priority, Propagation, SetOptions, StateStore, SubscribeOptions,
};
use serde_json::{json, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine_with_nodes(nodes: &[(&str, f64, f64)]) -> CanvasEngine<MemoryGraph> {
    init_tracing();
    let mut graph = MemoryGraph::new();
    for (id, x, y) in nodes {
        graph.add_node(Node::new(*id, *x, *y));
    }
    let mut engine = CanvasEngine::new(EngineConfig::default(), graph);
    engine.pump_graph_events();
    engine
}

#[test]
fn handlers_run_in_priority_order() {
    let mut bus = DispatchBus::default();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&calls);
    bus.register("node:clicked", HandlerOptions::priority(Priority::LOW), move |_ctx| {
        log.lock().expect("lock").push("H2");
        Ok(Propagation::Continue)
    });
    let log = Arc::clone(&calls);
    bus.register("node:clicked", HandlerOptions::priority(Priority::HIGH), move |_ctx| {
        log.lock().expect("lock").push("H1");
        Ok(Propagation::Continue)
    });

    let outcome = bus.emit("node:clicked", json!({ "id": "n1" }), Priority::NORMAL);
    assert!(outcome.delivered);
    assert_eq!(*calls.lock().expect("lock"), vec!["H1", "H2"]);
}

#[test]
fn parallel_edges_split_then_restore() {
    let mut engine = engine_with_nodes(&[("N1", 0.0, 0.0), ("N2", 400.0, 0.0)]);
    engine
        .graph_mut()
        .add_edge(Edge::new("E1", Endpoint::node("N1"), Endpoint::node("N2")));
    engine.pump_graph_events();
    engine.tick();
    engine
        .graph_mut()
        .add_edge(Edge::new("E2", Endpoint::node("N1"), Endpoint::node("N2")));
    engine.pump_graph_events();
    engine.tick();

    let e1 = engine.graph().edge(&EdgeId::new("E1")).expect("E1");
    let e2 = engine.graph().edge(&EdgeId::new("E2")).expect("E2");
    assert!(!e1.vertices.is_empty());
    assert!(!e2.vertices.is_empty());
    assert!(e1.vertices[0].y > 24.0, "E1 runs below the axis");
    assert!(e2.vertices[0].y < 24.0, "E2 runs above the axis");

    let r1 = engine.overlap().offset_for(&e1.id).expect("E1 record");
    let r2 = engine.overlap().offset_for(&e2.id).expect("E2 record");
    assert_eq!(r1.kind, OffsetKind::CrossBranch);
    assert!(r1.factor * r2.factor < 0.0);

    engine.graph_mut().remove_edge(&EdgeId::new("E2"));
    engine.pump_graph_events();

    let e1 = engine.graph().edge(&EdgeId::new("E1")).expect("E1");
    assert!(e1.vertices.is_empty());
    assert_eq!(e1.routing(), EdgeRouting::default_for(LayoutDirection::LR));
    assert!(engine
        .store()
        .get_state_key(Namespace::Edges, "E2")
        .expect("live")
        .is_none());
}

#[test]
fn snapshot_restores_zoom() {
    let store = StateStore::new();
    store
        .set_state(Namespace::Zoom, json!({ "scale": 1.5 }), SetOptions::default())
        .expect("set");
    let s1 = store.create_snapshot("s1", None).expect("snapshot");
    store
        .set_state(Namespace::Zoom, json!({ "scale": 3 }), SetOptions::default())
        .expect("set");
    store.restore_snapshot(s1).expect("restore");

    assert_eq!(
        store.get_state_key(Namespace::Zoom, "scale").expect("live"),
        Some(json!(1.5))
    );
}

#[test]
fn immediate_subscription_sees_empty_default() {
    let store = StateStore::new();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    store
        .subscribe(
            Namespace::Nodes,
            move |change| sink.lock().expect("lock").push(change.value.clone()),
            SubscribeOptions::immediate(),
        )
        .expect("subscribe");

    assert_eq!(*seen.lock().expect("lock"), vec![json!({})]);
}

#[test]
fn shared_source_port_fans_out() {
    let mut engine = engine_with_nodes(&[
        ("A", 0.0, 0.0),
        ("B", 400.0, -200.0),
        ("C", 400.0, 0.0),
        ("D", 400.0, 200.0),
    ]);
    for (id, target) in [("E1", "B"), ("E2", "C"), ("E3", "D")] {
        engine
            .graph_mut()
            .add_edge(Edge::new(id, Endpoint::port("A", "P"), Endpoint::node(target)));
        engine.pump_graph_events();
        engine.tick();
    }

    let mut factors: Vec<f64> = ["E1", "E2", "E3"]
        .iter()
        .map(|id| {
            engine
                .overlap()
                .offset_for(&EdgeId::new(*id))
                .expect("offset")
                .factor
        })
        .collect();
    factors.sort_by(f64::total_cmp);
    for (got, want) in factors.iter().zip([-0.8, 0.0, 0.8]) {
        assert!((got - want).abs() < 1e-9, "{got} != {want}");
    }
    assert_eq!(engine.overlap().port_count("A:P"), 3);
}

#[test]
fn edges_added_in_one_tick_still_conflict() {
    let mut engine = engine_with_nodes(&[("N1", 0.0, 0.0), ("N2", 400.0, 0.0)]);
    for id in ["E1", "E2", "E3"] {
        engine
            .graph_mut()
            .add_edge(Edge::new(id, Endpoint::node("N1"), Endpoint::node("N2")));
    }
    engine.pump_graph_events();
    assert_eq!(engine.tick(), 3);

    let totals: Vec<usize> = ["E1", "E2", "E3"]
        .iter()
        .map(|id| engine.overlap().offset_for(&EdgeId::new(*id)).expect("offset").total)
        .collect();
    assert_eq!(totals, vec![3, 3, 3]);
    let middle = engine.graph().edge(&EdgeId::new("E2")).expect("E2");
    assert!(middle.vertices.is_empty(), "centre lane stays straight");
}

#[test]
fn removing_a_node_cleans_up_its_edges() {
    let mut engine = engine_with_nodes(&[("N1", 0.0, 0.0), ("N2", 400.0, 0.0)]);
    for id in ["E1", "E2"] {
        engine
            .graph_mut()
            .add_edge(Edge::new(id, Endpoint::node("N1"), Endpoint::node("N2")));
    }
    engine.pump_graph_events();
    engine.tick();

    engine
        .graph_mut()
        .remove_node(&NodeId::new("N2"))
        .expect("remove");
    engine.pump_graph_events();

    let status = engine.status();
    assert_eq!(status.overlap.cached_offsets, 0);
    assert!(status.overlap.port_counts.is_empty());
    assert_eq!(
        engine.store().get_state(Namespace::Edges).expect("live"),
        Some(json!({}))
    );
    assert!(engine
        .store()
        .get_state_key(Namespace::Nodes, "N2")
        .expect("live")
        .is_none());
}

#[test]
fn stopping_handler_still_lets_engine_mirror() {
    let mut engine = engine_with_nodes(&[("N1", 0.0, 0.0)]);
    engine
        .bus_mut()
        .register("node:moved", HandlerOptions::default(), |_ctx| Ok(Propagation::Stop));
    engine.handle(&GraphEvent::NodeMoved {
        node: NodeId::new("N1"),
        previous: flowcanvas_core::Point::new(0.0, 0.0),
        current: flowcanvas_core::Point::new(5.0, 5.0),
    });
    let node = engine
        .store()
        .get_state_key(Namespace::Nodes, "N1")
        .expect("live")
        .expect("node");
    assert_eq!(node["position"], json!({ "x": 5.0, "y": 5.0 }));
}
