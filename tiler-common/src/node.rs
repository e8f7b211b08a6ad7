//! The in-memory octree/quadtree node: either an unsplit bag of points
//! ("leaf-buffer state") or a spacing-enforced grid plus a pending buffer
//! and child set ("grid state"). See the surrounding design notes for why
//! the split exists and when a node transitions between the two.

use crate::geometry::aabb::{Aabb, SubdivisionType};
use crate::geometry::name::NodeName;
use crate::geometry::point::PointBatch;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Points stay in leaf-buffer state until they reach this count (and spacing
/// has not yet bottomed out) - below this size a full grid is needless overhead.
pub const SPLIT_THRESHOLD: usize = 20_000;

/// A node whose spacing has shrunk to this fraction of the root scale never
/// subdivides further, regardless of point count; it would have zero effective
/// spacing below this, a smell that the node has hit useful float precision.
pub const MIN_SPACING_FACTOR: f64 = 0.001;

/// A grid cell is rebalanced (cell-count incremented on every axis, and on
/// z too for octree nodes) once any single cell holds more than this many points.
pub const BALANCE_THRESHOLD: usize = 100_000;

/// The hard cap on cell count per axis; a cell count that would need to exceed
/// this is an invariant violation (see error design) rather than something
/// silently clamped.
pub const MAX_CELL_COUNT: u32 = 8;

type CellKey = (u32, u32, u32);

#[derive(Debug, Clone, Default)]
struct GridCell {
    xyz: Vec<[f32; 3]>,
    rgb: Vec<[u8; 3]>,
    classification: Vec<u8>,
    intensity: Vec<u8>,
}

impl GridCell {
    fn len(&self) -> usize {
        self.xyz.len()
    }

    fn nearest_within(&self, p: [f32; 3], spacing_sq: f64) -> bool {
        for q in &self.xyz {
            let dx = (p[0] - q[0]) as f64;
            let dy = (p[1] - q[1]) as f64;
            let dz = (p[2] - q[2]) as f64;
            if dx * dx + dy * dy + dz * dz < spacing_sq {
                return true;
            }
        }
        false
    }

    fn push(&mut self, xyz: [f32; 3], rgb: [u8; 3], classification: u8, intensity: u8) {
        self.xyz.push(xyz);
        self.rgb.push(rgb);
        self.classification.push(classification);
        self.intensity.push(intensity);
    }
}

/// The uniform grid covering a grid-state node's AABB: `cell_count` cells per
/// axis (z is always 1 for quadtree nodes), each storing an accepted sub-list
/// of points that pairwise satisfy the node's minimum spacing.
#[derive(Debug, Clone)]
pub struct Grid {
    cell_count: [u32; 3],
    cells: HashMap<CellKey, GridCell>,
    spacing: f64,
}

impl Grid {
    fn new(spacing: f64) -> Self {
        Grid {
            cell_count: [3, 3, 3],
            cells: HashMap::new(),
            spacing,
        }
    }

    fn cell_key(&self, p: &Point3<f64>, aabb: &Aabb, subdivision: SubdivisionType) -> CellKey {
        let size = aabb.size();
        let cx = ((p.x - aabb.min.x) / size.x * self.cell_count[0] as f64)
            .floor()
            .clamp(0.0, (self.cell_count[0] - 1) as f64) as u32;
        let cy = ((p.y - aabb.min.y) / size.y * self.cell_count[1] as f64)
            .floor()
            .clamp(0.0, (self.cell_count[1] - 1) as f64) as u32;
        let cz = if subdivision == SubdivisionType::Quadtree {
            0
        } else {
            ((p.z - aabb.min.z) / size.z * self.cell_count[2] as f64)
                .floor()
                .clamp(0.0, (self.cell_count[2] - 1) as f64) as u32
        };
        (cx, cy, cz)
    }

    fn point_count(&self) -> usize {
        self.cells.values().map(GridCell::len).sum()
    }

    fn needs_balance(&self) -> bool {
        self.cell_count[0] < MAX_CELL_COUNT
            && self.cells.values().any(|c| c.len() > BALANCE_THRESHOLD)
    }

    /// Re-hashes every accepted point into a grid one cell wider per axis (z too,
    /// unless this node is a quadtree). `force` bypasses spacing rejection, used
    /// when re-inserting points that already satisfied the coarser grid.
    fn balance(&mut self, aabb: &Aabb, subdivision: SubdivisionType) {
        self.cell_count[0] += 1;
        self.cell_count[1] += 1;
        if subdivision != SubdivisionType::Quadtree {
            self.cell_count[2] += 1;
        }
        assert!(
            self.cell_count[0] <= MAX_CELL_COUNT,
            "grid cell count overflow during rebalance"
        );

        let old_cells = std::mem::take(&mut self.cells);
        for cell in old_cells.into_values() {
            for i in 0..cell.len() {
                let p = cell.xyz[i];
                let pf64 = Point3::new(p[0] as f64, p[1] as f64, p[2] as f64);
                let key = self.cell_key(&pf64, aabb, subdivision);
                self.cells.entry(key).or_default().push(
                    p,
                    cell.rgb[i],
                    cell.classification[i],
                    cell.intensity[i],
                );
            }
        }
    }

    /// Inserts `batch` into this grid. Returns the points rejected for being
    /// too close to an already-accepted point in their cell (these become
    /// pending, to be routed to a child octant), plus whether a rebalance
    /// is now due.
    fn insert(&mut self, batch: &PointBatch, aabb: &Aabb, subdivision: SubdivisionType) -> (PointBatch, bool) {
        let spacing_sq = self.spacing * self.spacing;
        let mut rejected = PointBatch::default();
        for i in 0..batch.len() {
            let p = batch.xyz[i];
            let pf64 = batch.position_f64(i);
            let key = self.cell_key(&pf64, aabb, subdivision);
            let cell = self.cells.entry(key).or_default();
            if cell.len() == 0 || !cell.nearest_within(p, spacing_sq) {
                cell.push(p, batch.rgb[i], batch.classification[i], batch.intensity[i]);
            } else {
                rejected.push(p, batch.rgb[i], batch.classification[i], batch.intensity[i]);
            }
        }
        let needs_balance = self.needs_balance();
        (rejected, needs_balance)
    }

    fn all_points(&self) -> PointBatch {
        let mut out = PointBatch::default();
        for cell in self.cells.values() {
            for i in 0..cell.len() {
                out.push(cell.xyz[i], cell.rgb[i], cell.classification[i], cell.intensity[i]);
            }
        }
        out
    }
}

/// Whether a node holds an unsplit bag of points, or has transitioned to a
/// spacing-enforced grid with a child set.
#[derive(Debug, Clone)]
pub enum NodeState {
    LeafBuffer(PointBatch),
    Grid {
        grid: Grid,
        children: Vec<u8>,
    },
}

/// The serialized form of a node's state, as persisted by the NodeStore.
/// The grid form is used iff the node has split (`children` non-empty or
/// the node is explicitly known to have children); round-tripping through
/// this type must be byte-identical in content (not necessarily in byte
/// layout) for the same logical state.
#[derive(Debug, Serialize, Deserialize)]
enum SerializedState {
    Points(PointBatch),
    Grid {
        cell_count: [u32; 3],
        spacing: f64,
        cells: Vec<(CellKey, SerializedCell)>,
        children: Vec<u8>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedCell {
    xyz: Vec<[f32; 3]>,
    rgb: Vec<[u8; 3]>,
    classification: Vec<u8>,
    intensity: Vec<u8>,
}

/// Computes the AABB and spacing a node named `name` would have, by
/// repeatedly bisecting from `root_aabb`/`root_spacing` - an AABB is always a
/// pure function of its parent, so this never needs to consult the
/// NodeStore for nodes that have not been created yet.
pub fn aabb_and_spacing_for(name: &NodeName, root_aabb: &Aabb, root_spacing: f64) -> (Aabb, f64) {
    let mut aabb = *root_aabb;
    let mut spacing = root_spacing;
    for &digit in name.digits() {
        let subdivision = aabb.subdivision_type();
        aabb = aabb.child_aabb(digit, subdivision).make_valid();
        spacing /= 2.0;
    }
    (aabb, spacing)
}

pub struct Node {
    pub name: NodeName,
    pub aabb: Aabb,
    pub spacing: f64,
    pub subdivision: SubdivisionType,
    pub state: NodeState,
    pending: PointBatch,
    pub dirty: bool,
}

impl Node {
    pub fn new(name: NodeName, aabb: Aabb, spacing: f64) -> Self {
        let subdivision = aabb.subdivision_type();
        Node {
            name,
            aabb,
            spacing,
            subdivision,
            state: NodeState::LeafBuffer(PointBatch::default()),
            pending: PointBatch::default(),
            dirty: false,
        }
    }

    /// Inserts `batch` into this node, transitioning leaf-buffer state to grid
    /// state once the split threshold is crossed (unless spacing has already
    /// bottomed out). Points rejected by the grid's spacing invariant are queued
    /// into `pending` for routing to a child via [`Node::flush_pending`].
    pub fn insert(&mut self, batch: &PointBatch, scale: f64) {
        self.dirty = true;
        match &mut self.state {
            NodeState::LeafBuffer(buf) => {
                buf.extend_from(batch);
                if buf.len() >= SPLIT_THRESHOLD && self.spacing > MIN_SPACING_FACTOR * scale {
                    self.split();
                }
            }
            NodeState::Grid { grid, .. } => {
                let (rejected, needs_balance) = grid.insert(batch, &self.aabb, self.subdivision);
                if needs_balance {
                    grid.balance(&self.aabb, self.subdivision);
                }
                if !rejected.is_empty() {
                    self.pending.extend_from(&rejected);
                }
            }
        }
    }

    /// Forces the transition from leaf-buffer to grid state, re-inserting all
    /// buffered points through the (now-empty) grid.
    fn split(&mut self) {
        let buffered = match std::mem::replace(&mut self.state, NodeState::LeafBuffer(PointBatch::default())) {
            NodeState::LeafBuffer(buf) => buf,
            other => {
                self.state = other;
                return;
            }
        };
        self.state = NodeState::Grid {
            grid: Grid::new(self.spacing),
            children: Vec::new(),
        };
        // `scale` is unused on the grid-insert path, so any value works here.
        self.insert(&buffered, 1.0);
    }

    pub fn needs_balance(&self) -> bool {
        match &self.state {
            NodeState::Grid { grid, .. } => grid.needs_balance(),
            NodeState::LeafBuffer(_) => false,
        }
    }

    pub fn pending_point_count(&self) -> usize {
        self.pending.len()
    }

    /// Routes every pending point into the correct child octant (creating the
    /// child entry in this node's child set if new) and returns one batch per
    /// child that received points. The caller is responsible for actually
    /// inserting those batches into the named children - this only classifies
    /// and drains `pending`.
    pub fn flush_pending(&mut self) -> Vec<(NodeName, PointBatch)> {
        let children_set = match &mut self.state {
            NodeState::Grid { children, .. } => children,
            NodeState::LeafBuffer(_) => return Vec::new(),
        };

        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Vec::new();
        }

        let center = self.aabb.center();
        // Quadtree nodes force the z-split plane to the node's max-z, so every
        // point's z-bit test against that plane comes out false - z is never split.
        let z_plane = match self.subdivision {
            SubdivisionType::Quadtree => self.aabb.max.z,
            SubdivisionType::Octree => center.z,
        };

        let mut buckets: HashMap<u8, PointBatch> = HashMap::new();
        for i in 0..pending.len() {
            let p = pending.position_f64(i);
            let mut octant = 0u8;
            if p.x >= center.x {
                octant |= 0b100;
            }
            if p.y >= center.y {
                octant |= 0b010;
            }
            if self.subdivision == SubdivisionType::Octree && p.z >= z_plane {
                octant |= 0b001;
            }
            buckets.entry(octant).or_default().push(
                pending.xyz[i],
                pending.rgb[i],
                pending.classification[i],
                pending.intensity[i],
            );
        }

        let mut result = Vec::with_capacity(buckets.len());
        for (octant, batch) in buckets {
            if !children_set.contains(&octant) {
                children_set.push(octant);
                self.dirty = true;
            }
            result.push((self.name.child(octant), batch));
        }
        result
    }

    /// Recursive point count, for leaf nodes the buffered count, for grid
    /// nodes the grid's own count (children are tracked and summed by the
    /// caller walking the node catalog, since this type has no child data).
    pub fn own_point_count(&self) -> usize {
        match &self.state {
            NodeState::LeafBuffer(buf) => buf.len(),
            NodeState::Grid { grid, .. } => grid.point_count(),
        }
    }

    pub fn children(&self) -> &[u8] {
        match &self.state {
            NodeState::Grid { children, .. } => children,
            NodeState::LeafBuffer(_) => &[],
        }
    }

    pub fn is_split(&self) -> bool {
        matches!(self.state, NodeState::Grid { .. })
    }

    /// Flattens this node's own accepted points (not descendants) into the
    /// `xyz || rgb || classification || intensity` layout the tile encoder expects.
    pub fn finalize(&self, include_rgb: bool, include_classification: bool, include_intensity: bool) -> Vec<u8> {
        let points = match &self.state {
            NodeState::LeafBuffer(buf) => buf.clone(),
            NodeState::Grid { grid, .. } => grid.all_points(),
        };
        points.finalize(include_rgb, include_classification, include_intensity)
    }

    pub fn all_points(&self) -> PointBatch {
        match &self.state {
            NodeState::LeafBuffer(buf) => buf.clone(),
            NodeState::Grid { grid, .. } => grid.all_points(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let serialized = match &self.state {
            NodeState::LeafBuffer(buf) => SerializedState::Points(buf.clone()),
            NodeState::Grid { grid, children } => SerializedState::Grid {
                cell_count: grid.cell_count,
                spacing: grid.spacing,
                cells: grid
                    .cells
                    .iter()
                    .map(|(k, v)| {
                        (
                            *k,
                            SerializedCell {
                                xyz: v.xyz.clone(),
                                rgb: v.rgb.clone(),
                                classification: v.classification.clone(),
                                intensity: v.intensity.clone(),
                            },
                        )
                    })
                    .collect(),
                children: children.clone(),
            },
        };
        bincode::serialize(&serialized).expect("in-memory node state is always serializable")
    }

    pub fn from_bytes(name: NodeName, aabb: Aabb, spacing: f64, bytes: &[u8]) -> Self {
        let serialized: SerializedState =
            bincode::deserialize(bytes).expect("node bytes came from to_bytes and are well-formed");
        let subdivision = aabb.subdivision_type();
        let state = match serialized {
            SerializedState::Points(points) => NodeState::LeafBuffer(points),
            SerializedState::Grid {
                cell_count,
                spacing,
                cells,
                children,
            } => {
                let mut grid = Grid {
                    cell_count,
                    cells: HashMap::new(),
                    spacing,
                };
                for (key, cell) in cells {
                    grid.cells.insert(
                        key,
                        GridCell {
                            xyz: cell.xyz,
                            rgb: cell.rgb,
                            classification: cell.classification,
                            intensity: cell.intensity,
                        },
                    );
                }
                NodeState::Grid { grid, children }
            }
        };
        Node {
            name,
            aabb,
            spacing,
            subdivision,
            state,
            pending: PointBatch::default(),
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_node(name: NodeName) -> Node {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0));
        Node::new(name, aabb, 1.0)
    }

    #[test]
    fn leaf_buffer_accumulates_until_split() {
        let mut node = cube_node(NodeName::root());
        let mut batch = PointBatch::default();
        for i in 0..100 {
            batch.push([i as f32 * 0.01, 0.0, 0.0], [0, 0, 0], 0, 0);
        }
        node.insert(&batch, 1.0);
        assert!(!node.is_split());
        assert_eq!(node.own_point_count(), 100);
    }

    #[test]
    fn split_transitions_to_grid_and_preserves_points() {
        let mut node = cube_node(NodeName::root());
        node.spacing = 0.0001;
        let mut batch = PointBatch::default();
        for i in 0..(SPLIT_THRESHOLD + 1) {
            let x = (i % 1000) as f32 * 0.01;
            batch.push([x, 0.0, 0.0], [0, 0, 0], 0, 0);
        }
        node.insert(&batch, 1.0);
        assert!(node.is_split());
    }

    #[test]
    fn grid_rejects_points_closer_than_spacing() {
        let mut node = cube_node(NodeName::root());
        node.spacing = 100.0; // spacing far larger than the node's own extent
        node.split();
        let mut batch = PointBatch::default();
        batch.push([1.0, 1.0, 1.0], [0, 0, 0], 0, 0);
        batch.push([1.01, 1.0, 1.0], [0, 0, 0], 0, 0);
        node.insert(&batch, 1.0);
        assert_eq!(node.own_point_count(), 1);
        assert_eq!(node.pending_point_count(), 1);
    }

    #[test]
    fn flush_pending_routes_by_octant() {
        let mut node = cube_node(NodeName::root());
        node.spacing = 100.0;
        node.split();
        let mut batch = PointBatch::default();
        batch.push([1.0, 1.0, 1.0], [0, 0, 0], 0, 0); // accepted
        batch.push([1.01, 1.0, 1.0], [0, 0, 0], 0, 0); // rejected -> pending, low octant
        batch.push([9.0, 9.0, 9.0], [0, 0, 0], 0, 0); // rejected -> pending, high octant
        node.insert(&batch, 1.0);
        let routed = node.flush_pending();
        assert!(!routed.is_empty());
        let total: usize = routed.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut node = cube_node(NodeName::root());
        node.spacing = 100.0;
        node.split();
        let mut batch = PointBatch::default();
        batch.push([1.0, 1.0, 1.0], [4, 5, 6], 2, 9);
        node.insert(&batch, 1.0);
        let bytes = node.to_bytes();
        let restored = Node::from_bytes(node.name.clone(), node.aabb, node.spacing, &bytes);
        assert_eq!(restored.own_point_count(), node.own_point_count());
    }
}
