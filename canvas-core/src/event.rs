//! Graph-surface events and their normalized bus form.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::graph::{Edge, Node, NodeId, Point};
use crate::EdgeId;

/// Bus name of [`GraphEvent::EdgeAdded`].
pub const EDGE_ADDED: &str = "edge:added";
/// Bus name of [`GraphEvent::EdgeRemoved`].
pub const EDGE_REMOVED: &str = "edge:removed";
/// Bus name of [`GraphEvent::NodeAdded`].
pub const NODE_ADDED: &str = "node:added";
/// Bus name of [`GraphEvent::NodeRemoved`].
pub const NODE_REMOVED: &str = "node:removed";
/// Bus name of [`GraphEvent::NodeMoved`].
pub const NODE_MOVED: &str = "node:moved";
/// Bus name of [`GraphEvent::SelectionChanged`].
pub const SELECTION_CHANGED: &str = "selection:changed";

/// A mutation reported by the graph surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GraphEvent {
    /// An edge was committed to the graph.
    EdgeAdded {
        /// The edge as it was added.
        edge: Edge,
    },
    /// An edge left the graph.
    EdgeRemoved {
        /// The edge as it was before removal.
        edge: Edge,
    },
    /// A node was added.
    NodeAdded {
        /// The node as it was added.
        node: Node,
    },
    /// A node was removed.
    NodeRemoved {
        /// Id of the removed node.
        node: NodeId,
    },
    /// A node finished moving.
    NodeMoved {
        /// Node that moved.
        node: NodeId,
        /// Position before the move.
        previous: Point,
        /// Position after the move.
        current: Point,
    },
    /// The selected cells changed.
    SelectionChanged {
        /// Selected node ids.
        nodes: Vec<NodeId>,
        /// Selected edge ids.
        edges: Vec<EdgeId>,
    },
    /// Any other named event (clicks, hovers, business events).
    Custom {
        /// Event name, e.g. `node:clicked`.
        name: String,
        /// Event payload.
        payload: Value,
    },
}

impl GraphEvent {
    /// Create a custom event.
    #[must_use]
    pub fn custom(name: impl Into<String>, payload: Value) -> Self {
        Self::Custom {
            name: name.into(),
            payload,
        }
    }

    /// Name the event is dispatched under.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::EdgeAdded { .. } => EDGE_ADDED,
            Self::EdgeRemoved { .. } => EDGE_REMOVED,
            Self::NodeAdded { .. } => NODE_ADDED,
            Self::NodeRemoved { .. } => NODE_REMOVED,
            Self::NodeMoved { .. } => NODE_MOVED,
            Self::SelectionChanged { .. } => SELECTION_CHANGED,
            Self::Custom { name, .. } => name,
        }
    }

    /// JSON payload handed to bus handlers.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::EdgeAdded { edge } | Self::EdgeRemoved { edge } => {
                json!({ "edge": serde_json::to_value(edge).unwrap_or(Value::Null) })
            }
            Self::NodeAdded { node } => {
                json!({ "node": serde_json::to_value(node).unwrap_or(Value::Null) })
            }
            Self::NodeRemoved { node } => json!({ "node": { "id": node } }),
            Self::NodeMoved {
                node,
                previous,
                current,
            } => json!({
                "node": { "id": node },
                "previous": { "x": previous.x, "y": previous.y },
                "current": { "x": current.x, "y": current.y },
            }),
            Self::SelectionChanged { nodes, edges } => json!({ "nodes": nodes, "edges": edges }),
            Self::Custom { payload, .. } => payload.clone(),
        }
    }
}
