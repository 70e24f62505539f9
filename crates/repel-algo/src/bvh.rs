//! Bounding volume hierarchy over curve edges.
//!
//! The tree groups edges by their midpoints into a binary hierarchy of
//! axis-aligned boxes. Each node carries *dual* bounds — over midpoint
//! positions and over unit tangents — because far-field admissibility for
//! the tangent-point kernel must certify that a cluster is both spatially
//! compact and directionally coherent before it can be summarized by its
//! monopole data (total mass, mass-weighted centroid, mass-weighted mean
//! tangent).
//!
//! Nodes are stored in a flat arena indexed by `usize`; every node covers a
//! contiguous range of the edge permutation, so "does this cluster contain
//! edge e" is a constant-time range test. Splits are binary, on the longest
//! position axis, at the mass median. Subtrees above a size threshold are
//! built in parallel.

use nalgebra::Vector3;
use repel_core::CurveNetwork;

/// Subtrees at least this large are built on separate rayon threads.
const PARALLEL_BUILD_THRESHOLD: usize = 1024;

/// Distances below this floor are treated as a failed admissibility gap and
/// force direct traversal.
const DISTANCE_FLOOR: f64 = 1e-12;

/// One node of the edge hierarchy.
#[derive(Debug, Clone)]
pub struct BvhNode {
    /// Bounds over edge midpoints contained in this cluster.
    pub pos_min: Vector3<f64>,
    pub pos_max: Vector3<f64>,
    /// Bounds over unit tangents of contained edges.
    pub tan_min: Vector3<f64>,
    pub tan_max: Vector3<f64>,
    /// Total dual mass Σℓ of contained edges.
    pub mass: f64,
    /// Mass-weighted centroid of contained midpoints.
    pub centroid: Vector3<f64>,
    /// Mass-weighted mean tangent, normalized.
    pub mean_tangent: Vector3<f64>,
    /// Half-open range into [`EdgeBvh::edge_order`] covered by this node.
    pub start: usize,
    pub end: usize,
    /// Child node indices; `None` marks a leaf holding a single edge.
    pub children: Option<(usize, usize)>,
}

impl BvhNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Diameter of the position box.
    pub fn pos_diameter(&self) -> f64 {
        (self.pos_max - self.pos_min).norm()
    }

    /// Diameter of the tangent box (dimensionless).
    pub fn tan_diameter(&self) -> f64 {
        (self.tan_max - self.tan_min).norm()
    }

    pub fn num_edges(&self) -> usize {
        self.end - self.start
    }

    /// Distance from a point to this node's position box (zero inside).
    pub fn distance_to_point(&self, p: &Vector3<f64>) -> f64 {
        let clamped = p.sup(&self.pos_min).inf(&self.pos_max);
        (p - clamped).norm()
    }

    /// Distance between the position boxes of two nodes (zero on overlap).
    pub fn distance_to_node(&self, other: &BvhNode) -> f64 {
        let mut gap2 = 0.0;
        for axis in 0..3 {
            let g = (self.pos_min[axis] - other.pos_max[axis])
                .max(other.pos_min[axis] - self.pos_max[axis])
                .max(0.0);
            gap2 += g * g;
        }
        gap2.sqrt()
    }
}

/// Spatial hierarchy over the edges of a curve, bound to the positions the
/// curve had at build time.
#[derive(Debug, Clone)]
pub struct EdgeBvh {
    nodes: Vec<BvhNode>,
    /// Permutation of edge indices; node ranges index into this.
    edge_order: Vec<usize>,
    /// Position of each edge in `edge_order` (inverse permutation).
    edge_slot: Vec<usize>,
}

/// Per-edge monopole data gathered once at build time.
struct EdgeData {
    midpoint: Vector3<f64>,
    tangent: Vector3<f64>,
    length: f64,
}

impl EdgeBvh {
    /// Build the hierarchy from the curve's current positions.
    pub fn build(curve: &CurveNetwork) -> Self {
        let m = curve.num_edges();
        let edges: Vec<EdgeData> = (0..m)
            .map(|e| EdgeData {
                midpoint: curve.edge_midpoint(e),
                tangent: curve.edge_tangent(e),
                length: curve.edge_length(e),
            })
            .collect();

        let mut order: Vec<usize> = (0..m).collect();
        let root = build_subtree(&edges, &mut order, 0);

        let mut nodes = Vec::with_capacity(2 * m - 1);
        flatten(root, &mut nodes);

        let mut edge_slot = vec![0usize; m];
        for (slot, &e) in order.iter().enumerate() {
            edge_slot[e] = slot;
        }

        Self {
            nodes,
            edge_order: order,
            edge_slot,
        }
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    pub fn node(&self, i: usize) -> &BvhNode {
        &self.nodes[i]
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Edge indices covered by `node`, in permutation order.
    pub fn edges_of(&self, node: usize) -> &[usize] {
        let n = &self.nodes[node];
        &self.edge_order[n.start..n.end]
    }

    /// Edge held by a leaf node.
    pub fn leaf_edge(&self, node: usize) -> usize {
        debug_assert!(self.nodes[node].is_leaf());
        self.edge_order[self.nodes[node].start]
    }

    /// Whole-tree edge permutation (prefix-sum friendly ordering).
    pub fn edge_order(&self) -> &[usize] {
        &self.edge_order
    }

    /// True when `node`'s range contains edge `e`.
    pub fn node_contains_edge(&self, node: usize, e: usize) -> bool {
        let n = &self.nodes[node];
        let slot = self.edge_slot[e];
        n.start <= slot && slot < n.end
    }

    /// Far-field test of `node` against a query point.
    ///
    /// Distances are measured to the position box, so a cluster is only
    /// summarized when its entire extent clears the separation ratio: the
    /// position box must be small relative to the gap and the tangent spread
    /// small in absolute terms. A distance underflowing the floor always
    /// fails, so traversal falls back to direct evaluation.
    pub fn admissible_for_point(&self, node: usize, point: &Vector3<f64>, sep: f64) -> bool {
        let n = &self.nodes[node];
        let dist = n.distance_to_point(point);
        dist > DISTANCE_FLOOR && n.pos_diameter() < sep * dist && n.tan_diameter() < sep
    }

    /// Far-field test between two clusters (position bounds only; the metric
    /// kernel has no tangent dependence). Box-to-box distance keeps clusters
    /// that nearly touch inadmissible regardless of their centroids.
    pub fn admissible_pair(&self, a: usize, b: usize, sep: f64) -> bool {
        let na = &self.nodes[a];
        let nb = &self.nodes[b];
        let dist = na.distance_to_node(nb);
        dist > DISTANCE_FLOOR && na.pos_diameter().max(nb.pos_diameter()) < sep * dist
    }
}

/// Intermediate recursive node; flattened into the arena after the build.
struct RawNode {
    data: BvhNode,
    children: Option<(Box<RawNode>, Box<RawNode>)>,
}

fn build_subtree(edges: &[EdgeData], order: &mut [usize], offset: usize) -> RawNode {
    let mut pos_min = Vector3::repeat(f64::INFINITY);
    let mut pos_max = Vector3::repeat(f64::NEG_INFINITY);
    let mut tan_min = Vector3::repeat(f64::INFINITY);
    let mut tan_max = Vector3::repeat(f64::NEG_INFINITY);
    let mut mass = 0.0;
    let mut centroid = Vector3::zeros();
    let mut mean_tangent = Vector3::zeros();

    for &e in order.iter() {
        let d = &edges[e];
        pos_min = pos_min.inf(&d.midpoint);
        pos_max = pos_max.sup(&d.midpoint);
        tan_min = tan_min.inf(&d.tangent);
        tan_max = tan_max.sup(&d.tangent);
        mass += d.length;
        centroid += d.length * d.midpoint;
        mean_tangent += d.length * d.tangent;
    }
    if mass > 0.0 {
        centroid /= mass;
    }
    let tangent_norm = mean_tangent.norm();
    if tangent_norm > 0.0 {
        mean_tangent /= tangent_norm;
    }

    let data = BvhNode {
        pos_min,
        pos_max,
        tan_min,
        tan_max,
        mass,
        centroid,
        mean_tangent,
        start: offset,
        end: offset + order.len(),
        children: None,
    };

    if order.len() == 1 {
        return RawNode {
            data,
            children: None,
        };
    }

    // Longest position axis, split at the mass median.
    let extent = pos_max - pos_min;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };
    order.sort_unstable_by(|&a, &b| {
        edges[a].midpoint[axis]
            .partial_cmp(&edges[b].midpoint[axis])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let half_mass = 0.5 * mass;
    let mut acc = 0.0;
    let mut split = 0;
    for (k, &e) in order.iter().enumerate() {
        acc += edges[e].length;
        if acc >= half_mass {
            split = k + 1;
            break;
        }
    }
    let split = split.clamp(1, order.len() - 1);

    let (left_order, right_order) = order.split_at_mut(split);
    let (left, right) = if left_order.len().min(right_order.len()) >= PARALLEL_BUILD_THRESHOLD {
        rayon::join(
            || build_subtree(edges, left_order, offset),
            || build_subtree(edges, right_order, offset + split),
        )
    } else {
        (
            build_subtree(edges, left_order, offset),
            build_subtree(edges, right_order, offset + split),
        )
    };

    RawNode {
        data,
        children: Some((Box::new(left), Box::new(right))),
    }
}

/// Preorder flatten; children indices become arena indices.
fn flatten(raw: RawNode, nodes: &mut Vec<BvhNode>) -> usize {
    let idx = nodes.len();
    nodes.push(raw.data);
    if let Some((left, right)) = raw.children {
        let li = flatten(*left, nodes);
        let ri = flatten(*right, nodes);
        nodes[idx].children = Some((li, ri));
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zigzag(n: usize) -> CurveNetwork {
        let positions = (0..=n)
            .map(|i| Vector3::new(i as f64, (i % 2) as f64 * 0.3, 0.0))
            .collect();
        let edges = (0..n).map(|i| [i, i + 1]).collect();
        CurveNetwork::new(positions, edges).unwrap()
    }

    #[test]
    fn test_build_counts() {
        let curve = zigzag(17);
        let bvh = EdgeBvh::build(&curve);
        // A binary tree over m leaves has exactly 2m - 1 nodes.
        assert_eq!(bvh.num_nodes(), 2 * curve.num_edges() - 1);
        let leaves = bvh.nodes().iter().filter(|n| n.is_leaf()).count();
        assert_eq!(leaves, curve.num_edges());
    }

    #[test]
    fn test_root_monopole() {
        let curve = zigzag(8);
        let bvh = EdgeBvh::build(&curve);
        let root = bvh.node(bvh.root());

        let total: f64 = (0..curve.num_edges()).map(|e| curve.edge_length(e)).sum();
        assert!((root.mass - total).abs() < 1e-12);

        let mut centroid = Vector3::zeros();
        for e in 0..curve.num_edges() {
            centroid += curve.edge_length(e) * curve.edge_midpoint(e);
        }
        centroid /= total;
        assert!((root.centroid - centroid).norm() < 1e-12);
    }

    #[test]
    fn test_ranges_partition_edges() {
        let curve = zigzag(13);
        let bvh = EdgeBvh::build(&curve);
        for i in 0..bvh.num_nodes() {
            let n = bvh.node(i);
            if let Some((l, r)) = n.children {
                assert_eq!(bvh.node(l).start, n.start);
                assert_eq!(bvh.node(l).end, bvh.node(r).start);
                assert_eq!(bvh.node(r).end, n.end);
            } else {
                assert_eq!(n.num_edges(), 1);
            }
        }
        for e in 0..curve.num_edges() {
            assert!(bvh.node_contains_edge(bvh.root(), e));
        }
    }

    #[test]
    fn test_admissibility_scales_with_distance() {
        let curve = zigzag(32);
        let bvh = EdgeBvh::build(&curve);
        let root = bvh.root();
        let far = Vector3::new(1e6, 0.0, 0.0);
        // The zigzag's tangents alternate, so the tangent box is wide and the
        // whole tree can never be summarized at sep well below the spread.
        assert!(!bvh.admissible_for_point(root, &far, 0.2));
        // A spatially tiny, directionally coherent cluster is admissible from
        // far away: any leaf qualifies.
        let leaf = (0..bvh.num_nodes())
            .find(|&i| bvh.node(i).is_leaf())
            .unwrap();
        assert!(bvh.admissible_for_point(leaf, &far, 0.5));
        // Never admissible at the cluster's own centroid.
        let c = bvh.node(root).centroid;
        assert!(!bvh.admissible_for_point(root, &c, 2.0));
    }
}
