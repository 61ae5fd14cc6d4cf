//! WebAssembly bindings for flowcanvas-core.
//!
//! JSON in, JSON out. The host mirrors its diagram into the in-memory graph
//! and calls `tick` from its animation frame.

use wasm_bindgen::prelude::*;

use crate::engine::{CanvasEngine, EngineConfig};
use crate::event::GraphEvent;
use crate::graph::{CanvasGraph, Edge, EdgeId, MemoryGraph, Node, NodeId};
use crate::namespace::Namespace;
use crate::state::SetOptions;
use crate::CanvasError;

/// Initialize the WASM module.
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

fn js_error(e: impl std::fmt::Display) -> String {
    e.to_string()
}

fn namespace(name: &str) -> Result<Namespace, String> {
    Namespace::parse(name).ok_or_else(|| format!("unknown namespace {name}"))
}

/// Engine instance for WASM.
#[wasm_bindgen]
pub struct WasmCanvasEngine {
    engine: CanvasEngine<MemoryGraph>,
}

#[wasm_bindgen]
impl WasmCanvasEngine {
    /// Create an engine, optionally from a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error string if the configuration is malformed.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<WasmCanvasEngine, String> {
        let config = match config_json {
            Some(json) => EngineConfig::from_json(&json).map_err(js_error)?,
            None => EngineConfig::default(),
        };
        let graph = MemoryGraph::with_layout(config.overlap.layout);
        Ok(Self {
            engine: CanvasEngine::new(config, graph),
        })
    }

    /// Add a node from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error string if the JSON is not a node.
    #[wasm_bindgen(js_name = addNode)]
    pub fn add_node(&mut self, json: &str) -> Result<(), String> {
        let node: Node = serde_json::from_str(json).map_err(js_error)?;
        self.engine.graph_mut().add_node(node);
        self.engine.pump_graph_events();
        Ok(())
    }

    /// Move a node.
    ///
    /// # Errors
    ///
    /// Returns an error string if the node does not exist.
    #[wasm_bindgen(js_name = moveNode)]
    pub fn move_node(&mut self, id: &str, x: f64, y: f64) -> Result<(), String> {
        self.engine
            .graph_mut()
            .move_node(&NodeId::new(id), x, y)
            .map_err(js_error)?;
        self.engine.pump_graph_events();
        Ok(())
    }

    /// Remove a node and its edges.
    ///
    /// # Errors
    ///
    /// Returns an error string if the node does not exist.
    #[wasm_bindgen(js_name = removeNode)]
    pub fn remove_node(&mut self, id: &str) -> Result<(), String> {
        self.engine
            .graph_mut()
            .remove_node(&NodeId::new(id))
            .map_err(js_error)?;
        self.engine.pump_graph_events();
        Ok(())
    }

    /// Add an edge from its JSON form. Offsets apply on the next `tick`.
    ///
    /// # Errors
    ///
    /// Returns an error string if the JSON is not an edge.
    #[wasm_bindgen(js_name = addEdge)]
    pub fn add_edge(&mut self, json: &str) -> Result<(), String> {
        let edge: Edge = serde_json::from_str(json).map_err(js_error)?;
        self.engine.graph_mut().add_edge(edge);
        self.engine.pump_graph_events();
        Ok(())
    }

    /// Remove an edge. Returns whether it existed.
    #[wasm_bindgen(js_name = removeEdge)]
    pub fn remove_edge(&mut self, id: &str) -> bool {
        let removed = self.engine.graph_mut().remove_edge(&EdgeId::new(id)).is_some();
        self.engine.pump_graph_events();
        removed
    }

    /// Emit a custom event. Returns the outcome as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error string if the payload is not JSON.
    pub fn emit(&mut self, event_type: &str, payload_json: &str) -> Result<String, String> {
        let payload = serde_json::from_str(payload_json).map_err(js_error)?;
        let outcome = self.engine.handle(&GraphEvent::custom(event_type, payload));
        Ok(serde_json::json!({
            "delivered": outcome.delivered,
            "vetoed": outcome.vetoed,
            "handlersRun": outcome.handlers_run,
            "stopped": outcome.stopped,
            "errors": outcome.errors,
        })
        .to_string())
    }

    /// Process deferred work. Returns the number of edges analysed.
    #[must_use]
    pub fn tick(&mut self) -> u32 {
        u32::try_from(self.engine.tick()).unwrap_or(u32::MAX)
    }

    /// Current value of a namespace as JSON (`null` when deleted).
    ///
    /// # Errors
    ///
    /// Returns an error string for unknown namespaces or a destroyed store.
    #[wasm_bindgen(js_name = getState)]
    pub fn get_state(&self, ns: &str) -> Result<String, String> {
        let value = self.engine.store().get_state(namespace(ns)?).map_err(js_error)?;
        Ok(value.unwrap_or(serde_json::Value::Null).to_string())
    }

    /// Replace a namespace value.
    ///
    /// # Errors
    ///
    /// Returns an error string for unknown namespaces, bad JSON or a
    /// rejected value.
    #[wasm_bindgen(js_name = setState)]
    pub fn set_state(&self, ns: &str, json: &str) -> Result<(), String> {
        let value = serde_json::from_str(json).map_err(js_error)?;
        self.engine
            .store()
            .set_state(namespace(ns)?, value, SetOptions::default())
            .map_err(|e: CanvasError| serde_json::json!(e.info()).to_string())
    }

    /// All edges with their current routing, as JSON.
    #[wasm_bindgen(js_name = getEdgesJson)]
    #[must_use]
    pub fn get_edges_json(&self) -> String {
        serde_json::to_string(&self.engine.graph().edges()).unwrap_or_default()
    }

    /// Engine diagnostics as JSON.
    #[wasm_bindgen(js_name = getStatusJson)]
    #[must_use]
    pub fn get_status_json(&self) -> String {
        serde_json::to_string(&self.engine.status()).unwrap_or_default()
    }
}
