//! # Canvas Engine
//!
//! Wires the three components around one graph:
//!
//! ```text
//! GraphEvent ──► DispatchBus ──► mirror handlers (CRITICAL) ──► StateStore
//!                    │                user handlers
//!                    ▼ delivered?
//!              OverlapManager ──► routing written back to the graph
//! ```
//!
//! Edge additions are analysed on the next [`CanvasEngine::tick`], which
//! also pumps debounced sync. Removals and moves are handled immediately.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bus::{
    BusConfig, BusStatus, DispatchBus, EmitOutcome, HandlerOptions, Priority, Propagation,
};
use crate::event::{self, GraphEvent};
use crate::graph::{CanvasGraph, MemoryGraph};
use crate::namespace::Namespace;
use crate::overlap::{OverlapConfig, OverlapManager, OverlapStatus};
use crate::state::{SetOptions, StateStore, StoreConfig, StoreStatus};
use crate::{CanvasError, CanvasResult};

/// Configuration of every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatch bus.
    pub bus: BusConfig,
    /// State store.
    pub store: StoreConfig,
    /// Overlap manager.
    pub overlap: OverlapConfig,
}

impl EngineConfig {
    /// Parse a configuration; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Serialization`] for malformed JSON.
    pub fn from_json(json: &str) -> CanvasResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Combined diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Dispatch bus.
    pub bus: BusStatus,
    /// State store.
    pub store: StoreStatus,
    /// Overlap manager.
    pub overlap: OverlapStatus,
}

/// Interaction and consistency engine for one diagram.
#[derive(Debug)]
pub struct CanvasEngine<G: CanvasGraph> {
    bus: DispatchBus,
    store: StateStore,
    overlap: OverlapManager,
    graph: G,
    destroyed: bool,
}

impl<G: CanvasGraph> CanvasEngine<G> {
    /// Create an engine with an in-memory store.
    #[must_use]
    pub fn new(config: EngineConfig, graph: G) -> Self {
        let store = StateStore::builder().config(config.store.clone()).build();
        Self::with_store(config, store, graph)
    }

    /// Create an engine around a store built with collaborators.
    ///
    /// `config.store` is ignored; the store keeps its own configuration.
    #[must_use]
    pub fn with_store(config: EngineConfig, store: StateStore, graph: G) -> Self {
        let mut engine = Self {
            bus: DispatchBus::new(config.bus),
            store,
            overlap: OverlapManager::new(config.overlap),
            graph,
            destroyed: false,
        };
        engine.install_mirrors();
        engine
    }

    /// Run one graph event through the bus, then the overlap manager.
    ///
    /// Overlap handling is skipped when the bus did not deliver the event
    /// (disabled bus or filter veto). After [`Self::destroy`] this does
    /// nothing and reports the event as undelivered.
    pub fn handle(&mut self, event: &GraphEvent) -> EmitOutcome {
        if self.destroyed {
            tracing::debug!("Event {} ignored, engine destroyed", event.name());
            return EmitOutcome::default();
        }
        let outcome = self.bus.dispatch(event);
        if !outcome.delivered {
            tracing::debug!("Event {} not delivered, overlap skipped", event.name());
            return outcome;
        }
        match event {
            GraphEvent::EdgeAdded { edge } => self.overlap.on_edge_added(&edge.id),
            GraphEvent::EdgeRemoved { edge } => {
                self.overlap.on_edge_removed(&mut self.graph, edge);
            }
            GraphEvent::NodeMoved { node, .. } => {
                self.overlap.on_node_moved(&mut self.graph, node);
            }
            _ => {}
        }
        outcome
    }

    /// Analyse deferred edge additions and pump debounced sync.
    ///
    /// Returns the number of edges analysed; always zero after
    /// [`Self::destroy`].
    pub fn tick(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        let processed = self.overlap.process_pending(&mut self.graph);
        if let Err(e) = self.store.poll_sync() {
            tracing::debug!("Sync poll skipped: {e}");
        }
        processed
    }

    /// The dispatch bus.
    #[must_use]
    pub const fn bus(&self) -> &DispatchBus {
        &self.bus
    }

    /// The dispatch bus, for registering handlers and filters.
    pub fn bus_mut(&mut self) -> &mut DispatchBus {
        &mut self.bus
    }

    /// The state store. Clones share state with the engine.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// The overlap manager.
    #[must_use]
    pub const fn overlap(&self) -> &OverlapManager {
        &self.overlap
    }

    /// The graph.
    #[must_use]
    pub const fn graph(&self) -> &G {
        &self.graph
    }

    /// The graph, for host-side mutation.
    pub fn graph_mut(&mut self) -> &mut G {
        &mut self.graph
    }

    /// Combined diagnostics.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            bus: self.bus.status(),
            store: self.store.status(),
            overlap: self.overlap.status(),
        }
    }

    /// Whether [`Self::destroy`] was called.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Tear down the bus, store and overlap state.
    ///
    /// The graph is left as it is; later events and ticks are ignored.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.bus.destroy();
        if let Err(e) = self.store.destroy() {
            tracing::debug!("Store already gone: {e}");
        }
        self.overlap.reset();
        tracing::info!("Canvas engine destroyed");
    }

    fn install_mirrors(&mut self) {
        let critical = HandlerOptions::priority(Priority::CRITICAL);

        let store = self.store.clone();
        self.bus.register(event::EDGE_ADDED, critical, move |ctx| {
            let id = id_at(ctx.payload, "/edge/id")?;
            let record = ctx.payload.get("edge").cloned().unwrap_or(Value::Null);
            store.update_state(Namespace::Edges, json!({ id: record }), SetOptions::default())?;
            Ok(Propagation::Continue)
        });

        let store = self.store.clone();
        self.bus.register(event::EDGE_REMOVED, critical, move |ctx| {
            let id = id_at(ctx.payload, "/edge/id")?;
            store.delete_state(Namespace::Edges, Some(&id))?;
            Ok(Propagation::Continue)
        });

        let store = self.store.clone();
        self.bus.register(event::NODE_ADDED, critical, move |ctx| {
            let id = id_at(ctx.payload, "/node/id")?;
            let record = ctx.payload.get("node").cloned().unwrap_or(Value::Null);
            store.update_state(Namespace::Nodes, json!({ id: record }), SetOptions::default())?;
            Ok(Propagation::Continue)
        });

        let store = self.store.clone();
        self.bus.register(event::NODE_REMOVED, critical, move |ctx| {
            let id = id_at(ctx.payload, "/node/id")?;
            store.delete_state(Namespace::Nodes, Some(&id))?;
            Ok(Propagation::Continue)
        });

        let store = self.store.clone();
        self.bus.register(event::NODE_MOVED, critical, move |ctx| {
            let id = id_at(ctx.payload, "/node/id")?;
            if store.get_state_key(Namespace::Nodes, &id)?.is_some() {
                let position = ctx.payload.get("current").cloned().unwrap_or(Value::Null);
                store.merge_state(
                    Namespace::Nodes,
                    json!({ id: { "position": position } }),
                    SetOptions::default(),
                )?;
            }
            Ok(Propagation::Continue)
        });

        let store = self.store.clone();
        self.bus.register(event::SELECTION_CHANGED, critical, move |ctx| {
            let selection = json!({
                "nodes": ctx.payload.get("nodes").cloned().unwrap_or_else(|| json!([])),
                "edges": ctx.payload.get("edges").cloned().unwrap_or_else(|| json!([])),
            });
            store.set_state(Namespace::Selection, selection, SetOptions::default())?;
            Ok(Propagation::Continue)
        });
    }
}

impl CanvasEngine<MemoryGraph> {
    /// Feed every event the in-memory graph recorded since the last call.
    ///
    /// Returns the number of events handled.
    pub fn pump_graph_events(&mut self) -> usize {
        let events = self.graph.drain_events();
        for event in &events {
            self.handle(event);
        }
        events.len()
    }
}

fn id_at(payload: &Value, pointer: &str) -> CanvasResult<String> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CanvasError::Handler(format!("payload has no {pointer}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeId, Endpoint, Node, NodeId};

    fn engine() -> CanvasEngine<MemoryGraph> {
        let mut graph = MemoryGraph::new();
        graph.add_node(Node::new("n1", 0.0, 0.0));
        graph.add_node(Node::new("n2", 400.0, 0.0));
        let mut engine = CanvasEngine::new(EngineConfig::default(), graph);
        engine.pump_graph_events();
        engine
    }

    #[test]
    fn test_nodes_mirrored_in_order() {
        let engine = engine();
        let nodes = engine
            .store()
            .get_state(Namespace::Nodes)
            .expect("live")
            .expect("nodes");
        let keys: Vec<_> = nodes.as_object().expect("object").keys().cloned().collect();
        assert_eq!(keys, vec!["n1", "n2"]);
    }

    #[test]
    fn test_edge_flow_end_to_end() {
        let mut engine = engine();
        engine
            .graph_mut()
            .add_edge(Edge::new("e1", Endpoint::node("n1"), Endpoint::node("n2")));
        engine
            .graph_mut()
            .add_edge(Edge::new("e2", Endpoint::node("n1"), Endpoint::node("n2")));
        assert_eq!(engine.pump_graph_events(), 2);
        assert!(engine.overlap().offset_for(&EdgeId::new("e2")).is_none(), "deferred until tick");

        assert_eq!(engine.tick(), 2);
        assert!(engine.overlap().offset_for(&EdgeId::new("e2")).is_some());
        assert!(engine
            .store()
            .get_state_key(Namespace::Edges, "e2")
            .expect("live")
            .is_some());
    }

    #[test]
    fn test_node_move_mirrors_position() {
        let mut engine = engine();
        engine
            .graph_mut()
            .move_node(&NodeId::new("n1"), 10.0, 20.0)
            .expect("move");
        engine.pump_graph_events();
        let position = engine
            .store()
            .get_state_key(Namespace::Nodes, "n1")
            .expect("live")
            .expect("node")["position"]
            .clone();
        assert_eq!(position, json!({ "x": 10.0, "y": 20.0 }));
    }

    #[test]
    fn test_selection_mirrored() {
        let mut engine = engine();
        engine.handle(&GraphEvent::SelectionChanged {
            nodes: vec![NodeId::new("n1")],
            edges: vec![],
        });
        assert_eq!(
            engine.store().get_state(Namespace::Selection).expect("live"),
            Some(json!({ "nodes": ["n1"], "edges": [] }))
        );
    }

    #[test]
    fn test_vetoed_event_skips_overlap() {
        let mut engine = engine();
        engine
            .bus_mut()
            .add_filter(event::EDGE_ADDED, |_payload, _type| Ok(false));
        engine
            .graph_mut()
            .add_edge(Edge::new("e1", Endpoint::node("n1"), Endpoint::node("n2")));
        engine.pump_graph_events();
        assert_eq!(engine.status().overlap.pending, 0);
        assert!(engine
            .store()
            .get_state_key(Namespace::Edges, "e1")
            .expect("live")
            .is_none());
    }

    #[test]
    fn test_config_from_json_fills_defaults() {
        let config = EngineConfig::from_json(
            r#"{ "bus": { "history_limit": 5 }, "overlap": { "layer_spacing": 60.0 } }"#,
        )
        .expect("config");
        assert_eq!(config.bus.history_limit, 5);
        assert!(config.bus.enabled);
        assert_eq!(config.overlap.routing.layer_spacing, 60.0);
        assert_eq!(config.store.sync_debounce_ms, 200);
        assert!(EngineConfig::from_json("{oops").is_err());
    }

    #[test]
    fn test_destroy() {
        let mut engine = engine();
        engine.destroy();
        assert!(engine.is_destroyed());
        assert!(engine.status().store.destroyed);
        assert_eq!(engine.bus().handler_count(event::EDGE_ADDED), 0);
        assert_eq!(engine.tick(), 0);
        engine.destroy();
    }

    #[test]
    fn test_destroyed_engine_leaves_graph_alone() {
        let mut engine = engine();
        engine.destroy();
        for id in ["e1", "e2"] {
            engine
                .graph_mut()
                .add_edge(Edge::new(id, Endpoint::node("n1"), Endpoint::node("n2")));
        }
        let before = engine.graph().edges();

        assert_eq!(engine.pump_graph_events(), 2);
        assert_eq!(engine.status().overlap.pending, 0);
        assert_eq!(engine.tick(), 0);
        assert_eq!(engine.graph().edges(), before);
        assert!(engine.overlap().offset_for(&EdgeId::new("e2")).is_none());

        let outcome = engine.handle(&GraphEvent::SelectionChanged {
            nodes: vec![NodeId::new("n1")],
            edges: vec![],
        });
        assert!(!outcome.delivered);
    }
}
