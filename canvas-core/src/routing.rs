//! Offset math for de-conflicting overlapping edges.
//!
//! Pure functions only. [`crate::overlap::OverlapManager`] decides which
//! edges form a group and writes the resulting [`EdgeRouting`] back.
//!
//! Two strategies share the same shape: each member of a group of `N`
//! edges gets a factor symmetric around zero, which becomes a perpendicular
//! displacement of its path and a shift of its labels.
//!
//! | strategy     | N = 2        | N > 2                 | displacement              |
//! |--------------|--------------|-----------------------|---------------------------|
//! | cross-branch | +0.5, -0.5   | i - (N-1)/2           | factor * layer spacing    |
//! | same-port    | -0.5, +0.5   | (i - (N-1)/2) * 0.8   | clamp(factor * 15, ±40)   |

use serde::{Deserialize, Serialize};

use crate::graph::{
    ConnectorKind, Direction, EdgeLabel, EdgeRouting, LabelPosition, LayoutDirection, Point,
    RouterKind, DEFAULT_CONNECTOR_RADIUS,
};

/// Label distance used when a label has no position yet.
pub const DEFAULT_LABEL_DISTANCE: f64 = 0.5;

/// Spread between same-port factors when more than two edges share a port.
const SAME_PORT_SPREAD: f64 = 0.8;

/// Distances used by both strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingParams {
    /// Perpendicular spacing between cross-branch lanes.
    pub layer_spacing: f64,
    /// Label offset at factor zero.
    pub label_base: f64,
    /// Extra label offset per unit of factor.
    pub label_spacing: f64,
    /// Same-port offset per unit of factor.
    pub port_base_offset: f64,
    /// Largest same-port offset in either direction.
    pub port_max_offset: f64,
    /// Same-port offsets above this get explicit vertices.
    pub vertex_threshold: f64,
    /// Distance of generated vertices from their endpoint along the flow.
    pub endpoint_gap: f64,
}

impl Default for RoutingParams {
    fn default() -> Self {
        Self {
            layer_spacing: 40.0,
            label_base: 15.0,
            label_spacing: 12.0,
            port_base_offset: 15.0,
            port_max_offset: 40.0,
            vertex_threshold: 20.0,
            endpoint_gap: 30.0,
        }
    }
}

/// Cross-branch factor of member `index` in a group of `total`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cross_branch_factor(index: usize, total: usize) -> f64 {
    match total {
        0 | 1 => 0.0,
        2 => {
            if index == 0 {
                0.5
            } else {
                -0.5
            }
        }
        n => index as f64 - (n - 1) as f64 / 2.0,
    }
}

/// Same-port multiplier of member `index` in a group of `total`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn same_port_multiplier(index: usize, total: usize) -> f64 {
    match total {
        0 | 1 => 0.0,
        2 => {
            if index == 0 {
                -0.5
            } else {
                0.5
            }
        }
        n => (index as f64 - (n - 1) as f64 / 2.0) * SAME_PORT_SPREAD,
    }
}

/// Pixel offset for a same-port multiplier.
#[must_use]
pub fn same_port_offset(multiplier: f64, params: &RoutingParams) -> f64 {
    (multiplier * params.port_base_offset).clamp(-params.port_max_offset, params.port_max_offset)
}

/// Perpendicular label offset for a factor.
#[must_use]
pub fn label_offset(factor: f64, params: &RoutingParams) -> f64 {
    params.label_base + factor * params.label_spacing
}

fn shift(p: Point, dir: Point, distance: f64) -> Point {
    Point::new(p.x + dir.x * distance, p.y + dir.y * distance)
}

fn scale(dir: Point, distance: f64) -> Point {
    Point::new(dir.x * distance, dir.y * distance)
}

/// Perpendicular displacement vector for an offset in the given layout.
#[must_use]
pub fn displacement(layout: LayoutDirection, offset: f64) -> Point {
    scale(layout.perpendicular(), offset)
}

/// Two vertices displaced by `offset`: a branch point just after the source
/// and a turn point just before the target.
fn lane_vertices(
    layout: LayoutDirection,
    source: Point,
    target: Point,
    offset: f64,
    params: &RoutingParams,
) -> Vec<Point> {
    let forward = layout.forward();
    let perp = layout.perpendicular();
    vec![
        shift(shift(source, forward, params.endpoint_gap), perp, offset),
        shift(shift(target, forward, -params.endpoint_gap), perp, offset),
    ]
}

fn rounded(routing: &mut EdgeRouting) {
    routing.router.kind = RouterKind::Orthogonal;
    routing.connector.kind = ConnectorKind::Rounded;
    routing.connector.radius = Some(DEFAULT_CONNECTOR_RADIUS);
}

/// Routing for one member of a cross-branch group.
///
/// Keeps the line style and connection point of `current`.
#[must_use]
pub fn cross_branch_routing(
    current: &EdgeRouting,
    layout: LayoutDirection,
    source: Point,
    target: Point,
    factor: f64,
    params: &RoutingParams,
) -> EdgeRouting {
    let mut routing = current.clone();
    rounded(&mut routing);
    routing.router.start_directions = vec![layout.start_side()];
    routing.router.end_directions = vec![layout.end_side()];
    routing.vertices = if factor.abs() < f64::EPSILON {
        Vec::new()
    } else {
        lane_vertices(layout, source, target, factor * params.layer_spacing, params)
    };
    routing
}

/// Router directions that steer a path toward the side of `offset`.
fn steered(layout: LayoutDirection, offset: f64, flow_side: Direction) -> Vec<Direction> {
    if offset < 0.0 {
        vec![layout.negative_side(), flow_side]
    } else if offset > 0.0 {
        vec![layout.positive_side(), flow_side]
    } else {
        vec![flow_side]
    }
}

/// Routing for one member of a same-port group.
///
/// Small offsets are expressed through router directions alone; offsets
/// past the vertex threshold also get explicit vertices.
#[must_use]
pub fn same_port_routing(
    current: &EdgeRouting,
    layout: LayoutDirection,
    source: Point,
    target: Point,
    offset: f64,
    params: &RoutingParams,
) -> EdgeRouting {
    let mut routing = current.clone();
    rounded(&mut routing);
    routing.router.start_directions = steered(layout, offset, layout.start_side());
    routing.router.end_directions = steered(layout, offset, layout.end_side());
    routing.vertices = if offset.abs() > params.vertex_threshold {
        lane_vertices(layout, source, target, offset, params)
    } else {
        Vec::new()
    };
    routing
}

/// Shift existing labels to `offset`, keeping their distance.
#[must_use]
pub fn offset_labels(labels: &[EdgeLabel], offset: f64) -> Vec<EdgeLabel> {
    labels
        .iter()
        .map(|label| {
            let distance = label
                .position
                .map_or(DEFAULT_LABEL_DISTANCE, |p| p.distance);
            EdgeLabel {
                position: Some(LabelPosition { distance, offset }),
                ..label.clone()
            }
        })
        .collect()
}

/// Labels as they are on an edge with default routing.
#[must_use]
pub fn default_labels(labels: &[EdgeLabel]) -> Vec<EdgeLabel> {
    offset_labels(labels, 0.0)
}
