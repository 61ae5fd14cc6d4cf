//! # Edge Overlap Manager
//!
//! Keeps parallel and port-sharing edges visually apart.
//!
//! ```text
//! edge added   → queued; process_pending() groups it against earlier edges
//!                same pair > 1      → cross-branch lanes
//!                same port  > 1     → same-port fan-out (source port first)
//! edge removed → purge cache, re-spread or restore what is left
//! node moved   → re-spread port groups touching the node
//! ```
//!
//! Offsets are written through [`CanvasGraph`]. A failed write restores the
//! edge's previous routing and is logged; the cache only holds offsets that
//! were fully applied.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::graph::{
    CanvasGraph, Edge, EdgeId, EdgeLabel, EdgeRouting, Endpoint, LayoutDirection, NodeId, Point,
};
use crate::routing::{self, RoutingParams};
use crate::{CanvasError, CanvasResult};

/// Port id used for endpoints attached to a node without an explicit port.
pub const IMPLICIT_PORT: &str = "default";

/// Overlap manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlapConfig {
    /// Flow direction used for anchors, lanes and default routing.
    pub layout: LayoutDirection,
    /// Offset distances.
    #[serde(flatten)]
    pub routing: RoutingParams,
    /// Edge id substrings that mark preview lines, on top of the flag.
    pub preview_id_markers: Vec<String>,
    /// Recompute cross-branch lanes when an endpoint node moves.
    pub refresh_cross_branch_on_move: bool,
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            layout: LayoutDirection::LR,
            routing: RoutingParams::default(),
            preview_id_markers: Vec::new(),
            refresh_cross_branch_on_move: false,
        }
    }
}

/// Strategy that produced an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffsetKind {
    /// Parallel edges between the same endpoints.
    CrossBranch,
    /// Edges fanning out of or into one port.
    SimplePort,
}

/// Offset applied to one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRecord {
    /// Edge the offset belongs to.
    pub edge_id: EdgeId,
    /// Strategy.
    pub kind: OffsetKind,
    /// Symmetric factor (cross-branch) or multiplier (same-port).
    pub factor: f64,
    /// Perpendicular displacement in graph coordinates.
    pub vector: Point,
    /// Position within the group.
    pub index: usize,
    /// Group size.
    pub total: usize,
    /// Vertices written to the edge.
    pub vertices: Vec<Point>,
    /// Label offset written to the edge's labels.
    pub label_offset: f64,
}

/// Diagnostic snapshot of the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlapStatus {
    /// Edges with an applied offset.
    pub cached_offsets: usize,
    /// Connections per `node:port`.
    pub port_counts: BTreeMap<String, usize>,
    /// Edges counted in `port_counts`.
    pub managed_edges: usize,
    /// Added edges waiting for `process_pending`.
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum End {
    Source,
    Target,
}

/// `node:port` key of an endpoint.
#[must_use]
pub fn port_key(endpoint: &Endpoint) -> String {
    format!(
        "{}:{}",
        endpoint.cell,
        endpoint.port.as_ref().map_or(IMPLICIT_PORT, |p| p.as_str())
    )
}

fn end_key(edge: &Edge, end: End) -> Option<String> {
    match end {
        End::Source => Some(port_key(&edge.source)),
        End::Target => edge.target.as_ref().map(port_key),
    }
}

/// Detects endpoint conflicts and writes de-conflicting routing.
#[derive(Debug, Default)]
pub struct OverlapManager {
    config: OverlapConfig,
    cache: HashMap<EdgeId, OffsetRecord>,
    port_counts: HashMap<String, usize>,
    counted: HashSet<EdgeId>,
    pending: VecDeque<EdgeId>,
}

impl OverlapManager {
    /// Create a manager.
    #[must_use]
    pub fn new(config: OverlapConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &OverlapConfig {
        &self.config
    }

    /// Queue an added edge for the next [`Self::process_pending`].
    pub fn on_edge_added(&mut self, edge: &EdgeId) {
        if !self.pending.contains(edge) {
            self.pending.push_back(edge.clone());
        }
    }

    /// Analyse queued edges in order. Returns how many were processed.
    ///
    /// Each edge is grouped against itself and everything that was in the
    /// graph before it was queued, never against edges queued after it.
    pub fn process_pending<G: CanvasGraph>(&mut self, graph: &mut G) -> usize {
        let queued: Vec<EdgeId> = self.pending.drain(..).collect();
        for (i, id) in queued.iter().enumerate() {
            let later: HashSet<&EdgeId> = queued[i + 1..].iter().collect();
            self.analyse_added(graph, id, &later);
        }
        queued.len()
    }

    /// Handle an edge that left the graph.
    ///
    /// `edge` is the removed edge as it was before removal.
    pub fn on_edge_removed<G: CanvasGraph>(&mut self, graph: &mut G, edge: &Edge) {
        self.pending.retain(|id| *id != edge.id);
        if edge.target.is_none() || self.is_preview(graph, edge) {
            return;
        }

        if self.counted.remove(&edge.id) {
            for end in [End::Source, End::Target] {
                if let Some(key) = end_key(edge, end) {
                    self.decrement(&key);
                }
            }
        }

        let Some(record) = self.cache.remove(&edge.id) else {
            return;
        };
        tracing::debug!("Edge {} removed, recomputing its groups", edge.id);

        if record.kind == OffsetKind::CrossBranch {
            let pair = self.pair_group(graph, edge, &edge.id, &HashSet::new());
            if pair.len() > 1 {
                self.apply_cross_branch(graph, &pair);
            } else {
                for survivor in &pair {
                    self.restore(graph, survivor);
                }
            }
        }

        let mut respread: HashSet<EdgeId> = HashSet::new();
        for end in [End::Source, End::Target] {
            let Some(key) = end_key(edge, end) else {
                continue;
            };
            let group = self.port_group(graph, end, &key, &edge.id, &HashSet::new());
            if group.len() > 1 {
                self.apply_same_port(graph, &group);
                respread.extend(group.iter().map(|e| e.id.clone()));
            } else {
                for survivor in &group {
                    if !respread.contains(&survivor.id)
                        && self.kind_of(&survivor.id) == Some(OffsetKind::SimplePort)
                    {
                        self.restore(graph, survivor);
                    }
                }
            }
        }
    }

    /// Re-spread port groups of edges touching a moved node.
    pub fn on_node_moved<G: CanvasGraph>(&mut self, graph: &mut G, node: &NodeId) {
        let touching: Vec<Edge> = graph
            .connected_edges(node)
            .into_iter()
            .filter(|e| e.target.is_some() && !self.is_preview(graph, e))
            .collect();
        if touching.is_empty() {
            return;
        }

        let mut ports: Vec<(End, String)> = Vec::new();
        for edge in &touching {
            for end in [End::Source, End::Target] {
                let on_node = match end {
                    End::Source => edge.source.cell == *node,
                    End::Target => edge.target.as_ref().is_some_and(|t| t.cell == *node),
                };
                if let Some(key) = end_key(edge, end).filter(|_| on_node) {
                    if !ports.contains(&(end, key.clone())) {
                        ports.push((end, key));
                    }
                }
            }
        }

        let none = EdgeId::new("");
        for (end, key) in ports {
            let group = self.port_group(graph, end, &key, &none, &HashSet::new());
            if group.len() > 1 {
                self.apply_same_port(graph, &group);
            }
        }

        if self.config.refresh_cross_branch_on_move {
            let mut seen: HashSet<EdgeId> = HashSet::new();
            for edge in &touching {
                if seen.contains(&edge.id)
                    || self.kind_of(&edge.id) != Some(OffsetKind::CrossBranch)
                {
                    continue;
                }
                let pair = self.pair_group(graph, edge, &none, &HashSet::new());
                seen.extend(pair.iter().map(|e| e.id.clone()));
                if pair.len() > 1 {
                    self.apply_cross_branch(graph, &pair);
                }
            }
        }
    }

    /// Offset applied to an edge, if any.
    #[must_use]
    pub fn offset_for(&self, edge: &EdgeId) -> Option<&OffsetRecord> {
        self.cache.get(edge)
    }

    /// Connections counted at a `node:port` key.
    #[must_use]
    pub fn port_count(&self, key: &str) -> usize {
        self.port_counts.get(key).copied().unwrap_or(0)
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn status(&self) -> OverlapStatus {
        OverlapStatus {
            cached_offsets: self.cache.len(),
            port_counts: self
                .port_counts
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            managed_edges: self.counted.len(),
            pending: self.pending.len(),
        }
    }

    /// Forget all offsets, counters and queued edges. The graph is untouched.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.port_counts.clear();
        self.counted.clear();
        self.pending.clear();
    }

    fn analyse_added<G: CanvasGraph>(
        &mut self,
        graph: &mut G,
        id: &EdgeId,
        later: &HashSet<&EdgeId>,
    ) {
        let Some(edge) = graph.edge(id) else {
            tracing::debug!("Edge {id} vanished before processing");
            return;
        };
        if self.is_preview(graph, &edge) {
            return;
        }
        let Some(target) = edge.target.clone() else {
            return;
        };
        if graph.node(&edge.source.cell).is_none() || graph.node(&target.cell).is_none() {
            tracing::warn!(
                "Edge {id} skipped: endpoint {} or {} is missing",
                edge.source.cell,
                target.cell
            );
            return;
        }

        let none = EdgeId::new("");
        let pair = self.pair_group(graph, &edge, &none, later);
        if pair.len() > 1 {
            self.apply_cross_branch(graph, &pair);
            return;
        }

        for end in [End::Source, End::Target] {
            let Some(key) = end_key(&edge, end) else {
                continue;
            };
            let group = self.port_group(graph, end, &key, &none, later);
            if group.len() > 1 {
                self.apply_same_port(graph, &group);
                return;
            }
        }
    }

    fn is_preview<G: CanvasGraph>(&self, graph: &G, edge: &Edge) -> bool {
        graph.is_preview(edge)
            || self
                .config
                .preview_id_markers
                .iter()
                .any(|m| !m.is_empty() && edge.id.as_str().contains(m.as_str()))
    }

    fn kind_of(&self, id: &EdgeId) -> Option<OffsetKind> {
        self.cache.get(id).map(|r| r.kind)
    }

    fn candidates<G: CanvasGraph>(
        &self,
        graph: &G,
        removed: &EdgeId,
        later: &HashSet<&EdgeId>,
    ) -> Vec<Edge> {
        graph
            .edges()
            .into_iter()
            .filter(|e| {
                e.id != *removed
                    && !later.contains(&e.id)
                    && e.target.is_some()
                    && !self.is_preview(graph, e)
            })
            .collect()
    }

    /// Edges with the same source and target terminals as `edge`.
    fn pair_group<G: CanvasGraph>(
        &self,
        graph: &G,
        edge: &Edge,
        removed: &EdgeId,
        later: &HashSet<&EdgeId>,
    ) -> Vec<Edge> {
        let source = port_key(&edge.source);
        let target = end_key(edge, End::Target);
        self.candidates(graph, removed, later)
            .into_iter()
            .filter(|e| port_key(&e.source) == source && end_key(e, End::Target) == target)
            .collect()
    }

    /// Edges sharing a port on one end, minus cross-branch members.
    fn port_group<G: CanvasGraph>(
        &self,
        graph: &G,
        end: End,
        key: &str,
        removed: &EdgeId,
        later: &HashSet<&EdgeId>,
    ) -> Vec<Edge> {
        self.candidates(graph, removed, later)
            .into_iter()
            .filter(|e| {
                end_key(e, end).as_deref() == Some(key)
                    && self.kind_of(&e.id) != Some(OffsetKind::CrossBranch)
            })
            .collect()
    }

    fn anchors<G: CanvasGraph>(&self, graph: &G, edge: &Edge) -> Option<(Point, Point)> {
        let layout = self.config.layout;
        let source = graph.node(&edge.source.cell)?;
        let target = graph.node(&edge.target.as_ref()?.cell)?;
        Some((
            source.side_midpoint(layout.start_side()),
            target.side_midpoint(layout.end_side()),
        ))
    }

    fn apply_cross_branch<G: CanvasGraph>(&mut self, graph: &mut G, group: &[Edge]) {
        let total = group.len();
        let layout = self.config.layout;
        let params = self.config.routing;
        for (index, edge) in group.iter().enumerate() {
            let Some((source, target)) = self.anchors(graph, edge) else {
                tracing::warn!("Edge {} skipped: endpoint node is missing", edge.id);
                continue;
            };
            let factor = routing::cross_branch_factor(index, total);
            let routing = routing::cross_branch_routing(
                &edge.routing(),
                layout,
                source,
                target,
                factor,
                &params,
            );
            let label_offset = routing::label_offset(factor, &params);
            let record = OffsetRecord {
                edge_id: edge.id.clone(),
                kind: OffsetKind::CrossBranch,
                factor,
                vector: routing::displacement(layout, factor * params.layer_spacing),
                index,
                total,
                vertices: routing.vertices.clone(),
                label_offset,
            };
            let labels = routing::offset_labels(&edge.labels, label_offset);
            self.write(graph, edge, routing, labels, record);
        }
        self.adopt(group);
        tracing::debug!("Applied cross-branch offsets to {total} edges");
    }

    fn apply_same_port<G: CanvasGraph>(&mut self, graph: &mut G, group: &[Edge]) {
        let total = group.len();
        let layout = self.config.layout;
        let params = self.config.routing;
        for (index, edge) in group.iter().enumerate() {
            let Some((source, target)) = self.anchors(graph, edge) else {
                tracing::warn!("Edge {} skipped: endpoint node is missing", edge.id);
                continue;
            };
            let multiplier = routing::same_port_multiplier(index, total);
            let offset = routing::same_port_offset(multiplier, &params);
            let routing = routing::same_port_routing(
                &edge.routing(),
                layout,
                source,
                target,
                offset,
                &params,
            );
            let label_offset = routing::label_offset(multiplier, &params);
            let record = OffsetRecord {
                edge_id: edge.id.clone(),
                kind: OffsetKind::SimplePort,
                factor: multiplier,
                vector: routing::displacement(layout, offset),
                index,
                total,
                vertices: routing.vertices.clone(),
                label_offset,
            };
            let labels = routing::offset_labels(&edge.labels, label_offset);
            self.write(graph, edge, routing, labels, record);
        }
        self.adopt(group);
        tracing::debug!("Applied same-port offsets to {total} edges");
    }

    /// Put an edge back on default routing and drop its cache entry.
    fn restore<G: CanvasGraph>(&mut self, graph: &mut G, edge: &Edge) {
        let routing = EdgeRouting::default_for(self.config.layout);
        let labels = routing::default_labels(&edge.labels);
        match write_routing(graph, &edge.id, routing, labels) {
            Ok(()) => {
                self.cache.remove(&edge.id);
                tracing::debug!("Restored default routing on edge {}", edge.id);
            }
            Err(e) => {
                rollback(graph, edge);
                tracing::warn!("Failed to restore edge {}: {e}", edge.id);
            }
        }
    }

    fn write<G: CanvasGraph>(
        &mut self,
        graph: &mut G,
        edge: &Edge,
        routing: EdgeRouting,
        labels: Vec<EdgeLabel>,
        record: OffsetRecord,
    ) {
        match write_routing(graph, &edge.id, routing, labels) {
            Ok(()) => {
                self.cache.insert(edge.id.clone(), record);
            }
            Err(e) => {
                rollback(graph, edge);
                tracing::warn!("Offset on edge {} rolled back: {e}", edge.id);
            }
        }
    }

    /// Count the endpoints of group members not counted yet.
    ///
    /// Every group an offset is applied to passes through here, so each
    /// edge holding an offset is counted.
    fn adopt(&mut self, group: &[Edge]) {
        for edge in group {
            if !self.counted.insert(edge.id.clone()) {
                continue;
            }
            for end in [End::Source, End::Target] {
                if let Some(key) = end_key(edge, end) {
                    *self.port_counts.entry(key).or_insert(0) += 1;
                }
            }
        }
    }

    fn decrement(&mut self, key: &str) {
        if let Some(count) = self.port_counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.port_counts.remove(key);
            }
        }
    }
}

fn write_routing<G: CanvasGraph>(
    graph: &mut G,
    id: &EdgeId,
    routing: EdgeRouting,
    labels: Vec<EdgeLabel>,
) -> CanvasResult<()> {
    let geometry = |e: CanvasError| CanvasError::Geometry {
        edge: id.to_string(),
        reason: e.to_string(),
    };
    graph.set_router(id, routing.router).map_err(geometry)?;
    graph.set_connector(id, routing.connector).map_err(geometry)?;
    graph.set_vertices(id, routing.vertices).map_err(geometry)?;
    graph
        .set_connection_point(id, routing.connection_point)
        .map_err(geometry)?;
    graph.set_line(id, routing.line).map_err(geometry)?;
    graph.set_labels(id, labels).map_err(geometry)
}

/// Best-effort return to the routing an edge had before a failed write.
fn rollback<G: CanvasGraph>(graph: &mut G, edge: &Edge) {
    if let Err(e) = write_routing(graph, &edge.id, edge.routing(), edge.labels.clone()) {
        tracing::error!("Rollback of edge {} failed: {e}", edge.id);
    }
}
