//! Graph collaborator contract and the in-memory reference graph.
//!
//! The overlap manager never owns the diagram. It reads nodes and edges
//! through [`CanvasGraph`] and writes routing back through the same trait, so
//! any rendering library can sit behind it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::event::GraphEvent;
use crate::{CanvasError, CanvasResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from any string-like value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw id.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a node cell.
    NodeId
);
string_id!(
    /// Identifier of an edge cell.
    EdgeId
);
string_id!(
    /// Identifier of a port on a node.
    PortId
);

/// A point in graph coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

impl Point {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width and height of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: f64,
    /// Height in pixels.
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 160.0,
            height: 48.0,
        }
    }
}

/// A node handle: id, top-left position and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id.
    pub id: NodeId,
    /// Top-left corner.
    pub position: Point,
    /// Bounding size.
    #[serde(default)]
    pub size: Size,
}

impl Node {
    /// Create a node at a position with the default size.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            position: Point::new(x, y),
            size: Size::default(),
        }
    }

    /// Set the size.
    #[must_use]
    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size = Size { width, height };
        self
    }

    /// Center of the bounding box.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(
            self.position.x + self.size.width / 2.0,
            self.position.y + self.size.height / 2.0,
        )
    }

    /// Midpoint of the given side of the bounding box.
    #[must_use]
    pub fn side_midpoint(&self, side: Direction) -> Point {
        let c = self.center();
        match side {
            Direction::Top => Point::new(c.x, self.position.y),
            Direction::Bottom => Point::new(c.x, self.position.y + self.size.height),
            Direction::Left => Point::new(self.position.x, c.y),
            Direction::Right => Point::new(self.position.x + self.size.width, c.y),
        }
    }
}

/// Side of a node a router may leave from or enter at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Top side.
    Top,
    /// Right side.
    Right,
    /// Bottom side.
    Bottom,
    /// Left side.
    Left,
}

/// Main flow direction of the diagram layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutDirection {
    /// Left to right.
    #[default]
    LR,
    /// Right to left.
    RL,
    /// Top to bottom.
    TB,
    /// Bottom to top.
    BT,
}

impl LayoutDirection {
    /// Whether the flow runs along the x axis.
    #[must_use]
    pub const fn is_horizontal(self) -> bool {
        matches!(self, Self::LR | Self::RL)
    }

    /// Side edges leave their source from.
    #[must_use]
    pub const fn start_side(self) -> Direction {
        match self {
            Self::LR => Direction::Right,
            Self::RL => Direction::Left,
            Self::TB => Direction::Bottom,
            Self::BT => Direction::Top,
        }
    }

    /// Side edges enter their target at.
    #[must_use]
    pub const fn end_side(self) -> Direction {
        match self {
            Self::LR => Direction::Left,
            Self::RL => Direction::Right,
            Self::TB => Direction::Top,
            Self::BT => Direction::Bottom,
        }
    }

    /// Unit vector along the flow.
    #[must_use]
    pub const fn forward(self) -> Point {
        match self {
            Self::LR => Point::new(1.0, 0.0),
            Self::RL => Point::new(-1.0, 0.0),
            Self::TB => Point::new(0.0, 1.0),
            Self::BT => Point::new(0.0, -1.0),
        }
    }

    /// Unit vector perpendicular to the flow. Positive offsets move along it.
    #[must_use]
    pub const fn perpendicular(self) -> Point {
        if self.is_horizontal() {
            Point::new(0.0, 1.0)
        } else {
            Point::new(1.0, 0.0)
        }
    }

    /// Side facing the negative perpendicular.
    #[must_use]
    pub const fn negative_side(self) -> Direction {
        if self.is_horizontal() {
            Direction::Top
        } else {
            Direction::Left
        }
    }

    /// Side facing the positive perpendicular.
    #[must_use]
    pub const fn positive_side(self) -> Direction {
        if self.is_horizontal() {
            Direction::Bottom
        } else {
            Direction::Right
        }
    }
}

/// Router family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterKind {
    /// Straight segments through the vertices.
    Normal,
    /// Axis-aligned segments.
    Orthogonal,
    /// Axis-aligned segments with obstacle avoidance.
    Manhattan,
}

/// Router configuration of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    /// Router family.
    pub kind: RouterKind,
    /// Sides the path may leave the source from.
    #[serde(default)]
    pub start_directions: Vec<Direction>,
    /// Sides the path may enter the target at.
    #[serde(default)]
    pub end_directions: Vec<Direction>,
}

/// Connector family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    /// Sharp corners.
    Normal,
    /// Rounded corners with a fixed radius.
    Rounded,
    /// Bezier smoothing.
    Smooth,
}

/// Connector configuration of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    /// Connector family.
    pub kind: ConnectorKind,
    /// Corner radius for rounded connectors.
    pub radius: Option<f64>,
}

/// How the path attaches to its terminals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPoint {
    /// Attach at the port/terminal anchor.
    #[default]
    Anchor,
    /// Attach where the path crosses the node boundary.
    Boundary,
}

/// Line stroke of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineStyle {
    /// Stroke color.
    pub stroke: String,
    /// Stroke width in pixels.
    pub stroke_width: f64,
    /// Arrowhead at the target end.
    pub target_marker: Option<String>,
}

/// Label placement along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelPosition {
    /// Relative distance from the source, `0.0..=1.0`.
    pub distance: f64,
    /// Perpendicular offset in pixels.
    pub offset: f64,
}

/// A text label attached to an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeLabel {
    /// Label text.
    pub text: String,
    /// Placement, if set.
    #[serde(default)]
    pub position: Option<LabelPosition>,
    /// Free-form style attributes.
    #[serde(default)]
    pub style: BTreeMap<String, String>,
}

impl EdgeLabel {
    /// Create an unpositioned label.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            position: None,
            style: BTreeMap::new(),
        }
    }
}

/// One end of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Node the edge attaches to.
    pub cell: NodeId,
    /// Port on that node, if any.
    #[serde(default)]
    pub port: Option<PortId>,
}

impl Endpoint {
    /// Endpoint attached to the node itself.
    #[must_use]
    pub fn node(cell: impl Into<NodeId>) -> Self {
        Self {
            cell: cell.into(),
            port: None,
        }
    }

    /// Endpoint attached to a port.
    #[must_use]
    pub fn port(cell: impl Into<NodeId>, port: impl Into<PortId>) -> Self {
        Self {
            cell: cell.into(),
            port: Some(port.into()),
        }
    }
}

/// Routing and style attributes that overlap handling rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRouting {
    /// Router.
    pub router: Router,
    /// Connector.
    pub connector: Connector,
    /// Intermediate vertices.
    pub vertices: Vec<Point>,
    /// Terminal attachment.
    pub connection_point: ConnectionPoint,
    /// Stroke.
    pub line: LineStyle,
}

/// Corner radius of the default rounded connector.
pub const DEFAULT_CONNECTOR_RADIUS: f64 = 8.0;

impl EdgeRouting {
    /// Routing of a freshly created edge in the given layout.
    #[must_use]
    pub fn default_for(layout: LayoutDirection) -> Self {
        Self {
            router: Router {
                kind: RouterKind::Orthogonal,
                start_directions: vec![layout.start_side()],
                end_directions: vec![layout.end_side()],
            },
            connector: Connector {
                kind: ConnectorKind::Rounded,
                radius: Some(DEFAULT_CONNECTOR_RADIUS),
            },
            vertices: Vec::new(),
            connection_point: ConnectionPoint::Anchor,
            line: LineStyle {
                stroke: "#A2B1C3".to_string(),
                stroke_width: 1.0,
                target_marker: Some("block".to_string()),
            },
        }
    }
}

/// An edge handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge id.
    pub id: EdgeId,
    /// Source terminal.
    pub source: Endpoint,
    /// Target terminal; `None` while the user is still dragging.
    pub target: Option<Endpoint>,
    /// Router.
    pub router: Router,
    /// Connector.
    pub connector: Connector,
    /// Intermediate vertices.
    #[serde(default)]
    pub vertices: Vec<Point>,
    /// Labels.
    #[serde(default)]
    pub labels: Vec<EdgeLabel>,
    /// Stroke.
    pub line: LineStyle,
    /// Terminal attachment.
    #[serde(default)]
    pub connection_point: ConnectionPoint,
    /// Temporary line drawn while connecting.
    #[serde(default)]
    pub preview: bool,
}

impl Edge {
    /// Create an edge with default LR routing.
    #[must_use]
    pub fn new(id: impl Into<EdgeId>, source: Endpoint, target: Endpoint) -> Self {
        Self::with_routing(id, source, Some(target), EdgeRouting::default_for(LayoutDirection::LR))
    }

    /// Create an edge with explicit routing.
    #[must_use]
    pub fn with_routing(
        id: impl Into<EdgeId>,
        source: Endpoint,
        target: Option<Endpoint>,
        routing: EdgeRouting,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            target,
            router: routing.router,
            connector: routing.connector,
            vertices: routing.vertices,
            labels: Vec::new(),
            line: routing.line,
            connection_point: routing.connection_point,
            preview: false,
        }
    }

    /// Mark as a preview line.
    #[must_use]
    pub fn as_preview(mut self) -> Self {
        self.preview = true;
        self
    }

    /// Attach a label.
    #[must_use]
    pub fn with_label(mut self, label: EdgeLabel) -> Self {
        self.labels.push(label);
        self
    }

    /// Current routing attributes.
    #[must_use]
    pub fn routing(&self) -> EdgeRouting {
        EdgeRouting {
            router: self.router.clone(),
            connector: self.connector,
            vertices: self.vertices.clone(),
            connection_point: self.connection_point,
            line: self.line.clone(),
        }
    }
}

/// The graph surface the engine reads from and writes routing to.
pub trait CanvasGraph {
    /// Look up a node.
    fn node(&self, id: &NodeId) -> Option<Node>;

    /// All nodes in insertion order.
    fn nodes(&self) -> Vec<Node>;

    /// Look up an edge.
    fn edge(&self, id: &EdgeId) -> Option<Edge>;

    /// All edges in insertion order.
    fn edges(&self) -> Vec<Edge>;

    /// Remove an edge, returning it.
    fn remove_edge(&mut self, id: &EdgeId) -> Option<Edge>;

    /// Re-attach the source terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_source(&mut self, id: &EdgeId, source: Endpoint) -> CanvasResult<()>;

    /// Re-attach or detach the target terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_target(&mut self, id: &EdgeId, target: Option<Endpoint>) -> CanvasResult<()>;

    /// Replace the router.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_router(&mut self, id: &EdgeId, router: Router) -> CanvasResult<()>;

    /// Replace the connector.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_connector(&mut self, id: &EdgeId, connector: Connector) -> CanvasResult<()>;

    /// Replace the vertices.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_vertices(&mut self, id: &EdgeId, vertices: Vec<Point>) -> CanvasResult<()>;

    /// Replace the labels.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_labels(&mut self, id: &EdgeId, labels: Vec<EdgeLabel>) -> CanvasResult<()>;

    /// Replace the stroke.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_line(&mut self, id: &EdgeId, line: LineStyle) -> CanvasResult<()>;

    /// Replace the terminal attachment.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge does not exist or the graph refuses.
    fn set_connection_point(&mut self, id: &EdgeId, point: ConnectionPoint) -> CanvasResult<()>;

    /// Whether an edge is a temporary preview line.
    fn is_preview(&self, edge: &Edge) -> bool {
        edge.preview
    }

    /// Edges whose source or target is the given node.
    fn connected_edges(&self, node: &NodeId) -> Vec<Edge> {
        self.edges()
            .into_iter()
            .filter(|e| {
                e.source.cell == *node || e.target.as_ref().is_some_and(|t| t.cell == *node)
            })
            .collect()
    }
}

/// In-memory graph that records the events its mutations produce.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    edges: HashMap<EdgeId, Edge>,
    edge_order: Vec<EdgeId>,
    /// Events not yet drained by the host.
    events: Vec<GraphEvent>,
    layout: LayoutDirection,
}

impl MemoryGraph {
    /// Create an empty graph with LR layout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty graph with the given layout.
    #[must_use]
    pub fn with_layout(layout: LayoutDirection) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    /// Layout used for new edges.
    #[must_use]
    pub const fn layout(&self) -> LayoutDirection {
        self.layout
    }

    /// Add a node.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id.clone();
        if !self.nodes.contains_key(&id) {
            self.node_order.push(id.clone());
        }
        self.events.push(GraphEvent::NodeAdded { node: node.clone() });
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Remove a node and every edge attached to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not found.
    pub fn remove_node(&mut self, id: &NodeId) -> CanvasResult<Node> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| CanvasError::NotFound(format!("node {id}")))?;
        self.node_order.retain(|n| n != id);
        for edge in self.connected_edges(id) {
            self.remove_edge(&edge.id);
        }
        self.events.push(GraphEvent::NodeRemoved { node: id.clone() });
        Ok(node)
    }

    /// Move a node to a new top-left position.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not found.
    pub fn move_node(&mut self, id: &NodeId, x: f64, y: f64) -> CanvasResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CanvasError::NotFound(format!("node {id}")))?;
        let previous = node.position;
        node.position = Point::new(x, y);
        self.events.push(GraphEvent::NodeMoved {
            node: id.clone(),
            previous,
            current: node.position,
        });
        Ok(())
    }

    /// Add an edge. Edges created through the graph get the layout's
    /// default routing.
    pub fn add_edge(&mut self, edge: Edge) -> EdgeId {
        let id = edge.id.clone();
        if !self.edges.contains_key(&id) {
            self.edge_order.push(id.clone());
        }
        self.events.push(GraphEvent::EdgeAdded { edge: edge.clone() });
        self.edges.insert(id.clone(), edge);
        id
    }

    /// Create and add an edge between two endpoints with default routing.
    pub fn connect(
        &mut self,
        id: impl Into<EdgeId>,
        source: Endpoint,
        target: Endpoint,
    ) -> EdgeId {
        let routing = EdgeRouting::default_for(self.layout);
        let edge = Edge::with_routing(id, source, Some(target), routing);
        self.add_edge(edge)
    }

    /// Take every event recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<GraphEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn edge_mut(&mut self, id: &EdgeId) -> CanvasResult<&mut Edge> {
        self.edges
            .get_mut(id)
            .ok_or_else(|| CanvasError::NotFound(format!("edge {id}")))
    }
}

impl CanvasGraph for MemoryGraph {
    fn node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.get(id).cloned()
    }

    fn nodes(&self) -> Vec<Node> {
        self.node_order
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect()
    }

    fn edge(&self, id: &EdgeId) -> Option<Edge> {
        self.edges.get(id).cloned()
    }

    fn edges(&self) -> Vec<Edge> {
        self.edge_order
            .iter()
            .filter_map(|id| self.edges.get(id).cloned())
            .collect()
    }

    fn remove_edge(&mut self, id: &EdgeId) -> Option<Edge> {
        let edge = self.edges.remove(id)?;
        self.edge_order.retain(|e| e != id);
        self.events.push(GraphEvent::EdgeRemoved { edge: edge.clone() });
        Some(edge)
    }

    fn set_source(&mut self, id: &EdgeId, source: Endpoint) -> CanvasResult<()> {
        self.edge_mut(id)?.source = source;
        Ok(())
    }

    fn set_target(&mut self, id: &EdgeId, target: Option<Endpoint>) -> CanvasResult<()> {
        self.edge_mut(id)?.target = target;
        Ok(())
    }

    fn set_router(&mut self, id: &EdgeId, router: Router) -> CanvasResult<()> {
        self.edge_mut(id)?.router = router;
        Ok(())
    }

    fn set_connector(&mut self, id: &EdgeId, connector: Connector) -> CanvasResult<()> {
        self.edge_mut(id)?.connector = connector;
        Ok(())
    }

    fn set_vertices(&mut self, id: &EdgeId, vertices: Vec<Point>) -> CanvasResult<()> {
        self.edge_mut(id)?.vertices = vertices;
        Ok(())
    }

    fn set_labels(&mut self, id: &EdgeId, labels: Vec<EdgeLabel>) -> CanvasResult<()> {
        self.edge_mut(id)?.labels = labels;
        Ok(())
    }

    fn set_line(&mut self, id: &EdgeId, line: LineStyle) -> CanvasResult<()> {
        self.edge_mut(id)?.line = line;
        Ok(())
    }

    fn set_connection_point(&mut self, id: &EdgeId, point: ConnectionPoint) -> CanvasResult<()> {
        self.edge_mut(id)?.connection_point = point;
        Ok(())
    }
}
