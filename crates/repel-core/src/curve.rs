//! Polygonal curve networks embedded in ℝ³.
//!
//! A [`CurveNetwork`] is a 1-D simplicial complex: a vertex table of
//! positions and an edge table of ordered endpoint pairs. Incidence is kept
//! as two plain index tables (`vertex_edges[v]` and `edge_verts[e]`) so the
//! bidirectional vertex↔edge relation never involves owning pointers.
//!
//! Vertices may have any valence: 1 (open endpoint), 2 (interior), or ≥ 3
//! (junction). Positions change freely between optimization steps; topology
//! is immutable except through [`CurveNetwork::subdivide`], which returns a
//! new network and leaves the original untouched.
//!
//! Per-edge quantities follow the midpoint quadrature convention: an edge
//! carries its length as integration weight (*dual mass*), its midpoint as
//! sample point, and its normalized direction as tangent.

use crate::error::{CurveError, CurveResult};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A polygonal space curve (or network of curves) with per-vertex pin flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveNetwork {
    positions: Vec<Vector3<f64>>,
    edge_verts: Vec<[usize; 2]>,
    vertex_edges: Vec<Vec<usize>>,
    pinned_vertices: Vec<bool>,
    pinned_tangents: Vec<bool>,
    surface_pins: Vec<bool>,
}

impl CurveNetwork {
    /// Build a curve network from a vertex position table and (u, v) edge pairs.
    ///
    /// Fails on empty input, out-of-range endpoints, self-loops, and
    /// duplicate edges (compared as unordered pairs).
    pub fn new(positions: Vec<Vector3<f64>>, edges: Vec<[usize; 2]>) -> CurveResult<Self> {
        if positions.is_empty() || edges.is_empty() {
            return Err(CurveError::EmptyCurve);
        }

        let n = positions.len();
        let mut seen: HashSet<(usize, usize)> = HashSet::with_capacity(edges.len());
        for (e, &[u, v]) in edges.iter().enumerate() {
            if u >= n || v >= n {
                return Err(CurveError::VertexOutOfRange {
                    edge: e,
                    vertex: u.max(v),
                    vertex_count: n,
                });
            }
            if u == v {
                return Err(CurveError::SelfLoopEdge { edge: e, vertex: u });
            }
            if !seen.insert((u.min(v), u.max(v))) {
                return Err(CurveError::DuplicateEdge {
                    a: u.min(v),
                    b: u.max(v),
                });
            }
        }

        let vertex_edges = build_incidence(n, &edges);
        Ok(Self {
            positions,
            edge_verts: edges,
            vertex_edges,
            pinned_vertices: vec![false; n],
            pinned_tangents: vec![false; n],
            surface_pins: vec![false; n],
        })
    }

    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_verts.len()
    }

    pub fn positions(&self) -> &[Vector3<f64>] {
        &self.positions
    }

    pub fn position(&self, v: usize) -> Vector3<f64> {
        self.positions[v]
    }

    /// Replace all vertex positions. The length must match the vertex count.
    pub fn set_positions(&mut self, positions: Vec<Vector3<f64>>) -> CurveResult<()> {
        if positions.len() != self.positions.len() {
            return Err(CurveError::IndexOutOfBounds(format!(
                "position table has {} entries, curve has {} vertices",
                positions.len(),
                self.positions.len()
            )));
        }
        self.positions = positions;
        Ok(())
    }

    pub fn set_position(&mut self, v: usize, p: Vector3<f64>) {
        self.positions[v] = p;
    }

    /// Move every vertex by `scale * dir[v]`.
    pub fn displace(&mut self, dir: &[Vector3<f64>], scale: f64) {
        for (p, d) in self.positions.iter_mut().zip(dir.iter()) {
            *p += scale * d;
        }
    }

    /// Ordered endpoint pair (tail, head) of edge `e`.
    pub fn edge_verts(&self, e: usize) -> [usize; 2] {
        self.edge_verts[e]
    }

    /// Indices of all edges incident to vertex `v`.
    pub fn vertex_edges(&self, v: usize) -> &[usize] {
        &self.vertex_edges[v]
    }

    pub fn valence(&self, v: usize) -> usize {
        self.vertex_edges[v].len()
    }

    pub fn edge_vector(&self, e: usize) -> Vector3<f64> {
        let [u, v] = self.edge_verts[e];
        self.positions[v] - self.positions[u]
    }

    pub fn edge_length(&self, e: usize) -> f64 {
        self.edge_vector(e).norm()
    }

    pub fn edge_midpoint(&self, e: usize) -> Vector3<f64> {
        let [u, v] = self.edge_verts[e];
        0.5 * (self.positions[u] + self.positions[v])
    }

    /// Unit tangent of edge `e`. Degenerate (zero-length) edges yield zero.
    pub fn edge_tangent(&self, e: usize) -> Vector3<f64> {
        let d = self.edge_vector(e);
        let len = d.norm();
        if len > 0.0 {
            d / len
        } else {
            Vector3::zeros()
        }
    }

    pub fn total_length(&self) -> f64 {
        (0..self.num_edges()).map(|e| self.edge_length(e)).sum()
    }

    pub fn average_edge_length(&self) -> f64 {
        self.total_length() / self.num_edges() as f64
    }

    /// Mean of vertex positions.
    pub fn barycenter(&self) -> Vector3<f64> {
        let sum: Vector3<f64> = self.positions.iter().sum();
        sum / self.positions.len() as f64
    }

    /// Dual mass of vertex `v`: half the summed length of incident edges.
    pub fn vertex_dual_mass(&self, v: usize) -> f64 {
        0.5 * self.vertex_edges[v]
            .iter()
            .map(|&e| self.edge_length(e))
            .sum::<f64>()
    }

    /// True when edges `i` and `j` have a common endpoint (or are the same edge).
    pub fn edges_share_vertex(&self, i: usize, j: usize) -> bool {
        let [a, b] = self.edge_verts[i];
        let [c, d] = self.edge_verts[j];
        a == c || a == d || b == c || b == d
    }

    /// For a valence-2 vertex, the two neighboring vertices (ordered by the
    /// incident edge indices). `None` at endpoints and junctions.
    pub fn chord_neighbors(&self, v: usize) -> Option<(usize, usize)> {
        let edges = &self.vertex_edges[v];
        if edges.len() != 2 {
            return None;
        }
        let other = |e: usize| {
            let [a, b] = self.edge_verts[e];
            if a == v {
                b
            } else {
                a
            }
        };
        Some((other(edges[0]), other(edges[1])))
    }

    // --- pin flags ---------------------------------------------------------

    pub fn pin_vertex(&mut self, v: usize) {
        self.pinned_vertices[v] = true;
    }

    pub fn pin_tangent(&mut self, v: usize) {
        self.pinned_tangents[v] = true;
    }

    pub fn pin_to_surface(&mut self, v: usize) {
        self.surface_pins[v] = true;
    }

    pub fn is_vertex_pinned(&self, v: usize) -> bool {
        self.pinned_vertices[v]
    }

    pub fn is_tangent_pinned(&self, v: usize) -> bool {
        self.pinned_tangents[v]
    }

    pub fn is_surface_pinned(&self, v: usize) -> bool {
        self.surface_pins[v]
    }

    /// True when `v` carries any pin flag. Coarsening keeps such vertices.
    pub fn is_pinned_any(&self, v: usize) -> bool {
        self.pinned_vertices[v] || self.pinned_tangents[v] || self.surface_pins[v]
    }

    pub fn pinned_vertex_indices(&self) -> Vec<usize> {
        (0..self.num_vertices())
            .filter(|&v| self.pinned_vertices[v])
            .collect()
    }

    pub fn pinned_tangent_indices(&self) -> Vec<usize> {
        (0..self.num_vertices())
            .filter(|&v| self.pinned_tangents[v])
            .collect()
    }

    pub fn surface_pinned_indices(&self) -> Vec<usize> {
        (0..self.num_vertices())
            .filter(|&v| self.surface_pins[v])
            .collect()
    }

    // --- topology operations ----------------------------------------------

    /// Uniform subdivision: every edge is split at its midpoint.
    ///
    /// The first `n` vertices of the result are the original vertices with
    /// identical indices and positions; vertex `n + e` is the midpoint of old
    /// edge `e`. Old edge `e` becomes edges `2e` (tail half) and `2e + 1`
    /// (head half). Pin flags carry over to the original vertices; midpoints
    /// start unpinned.
    pub fn subdivide(&self) -> CurveNetwork {
        let n = self.num_vertices();
        let m = self.num_edges();

        let mut positions = Vec::with_capacity(n + m);
        positions.extend_from_slice(&self.positions);
        for e in 0..m {
            positions.push(self.edge_midpoint(e));
        }

        let mut edges = Vec::with_capacity(2 * m);
        for (e, &[u, v]) in self.edge_verts.iter().enumerate() {
            let w = n + e;
            edges.push([u, w]);
            edges.push([w, v]);
        }

        let vertex_edges = build_incidence(n + m, &edges);

        let mut pinned_vertices = self.pinned_vertices.clone();
        let mut pinned_tangents = self.pinned_tangents.clone();
        let mut surface_pins = self.surface_pins.clone();
        pinned_vertices.resize(n + m, false);
        pinned_tangents.resize(n + m, false);
        surface_pins.resize(n + m, false);

        CurveNetwork {
            positions,
            edge_verts: edges,
            vertex_edges,
            pinned_vertices,
            pinned_tangents,
            surface_pins,
        }
    }

    /// Number of connected components (BFS over the incidence tables).
    pub fn connected_components(&self) -> usize {
        let n = self.num_vertices();
        let mut visited = vec![false; n];
        let mut components = 0;
        let mut queue = Vec::new();
        for start in 0..n {
            if visited[start] {
                continue;
            }
            components += 1;
            visited[start] = true;
            queue.push(start);
            while let Some(v) = queue.pop() {
                for &e in &self.vertex_edges[v] {
                    let [a, b] = self.edge_verts[e];
                    let w = if a == v { b } else { a };
                    if !visited[w] {
                        visited[w] = true;
                        queue.push(w);
                    }
                }
            }
        }
        components
    }
}

fn build_incidence(n: usize, edges: &[[usize; 2]]) -> Vec<Vec<usize>> {
    let mut vertex_edges = vec![Vec::new(); n];
    for (e, &[u, v]) in edges.iter().enumerate() {
        vertex_edges[u].push(e);
        vertex_edges[v].push(e);
    }
    vertex_edges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> CurveNetwork {
        CurveNetwork::new(
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(1.0, 1.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1], [1, 2], [2, 3], [3, 0]],
        )
        .unwrap()
    }

    #[test]
    fn test_construction_and_queries() {
        let curve = unit_square();
        assert_eq!(curve.num_vertices(), 4);
        assert_eq!(curve.num_edges(), 4);
        assert!((curve.total_length() - 4.0).abs() < 1e-12);
        assert!((curve.average_edge_length() - 1.0).abs() < 1e-12);
        assert_eq!(curve.valence(0), 2);
        assert!((curve.barycenter() - Vector3::new(0.5, 0.5, 0.0)).norm() < 1e-12);

        let t = curve.edge_tangent(0);
        assert!((t - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
        let m = curve.edge_midpoint(0);
        assert!((m - Vector3::new(0.5, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            CurveNetwork::new(vec![], vec![]),
            Err(CurveError::EmptyCurve)
        ));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let r = CurveNetwork::new(
            vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)],
            vec![[0, 2]],
        );
        assert!(matches!(r, Err(CurveError::VertexOutOfRange { .. })));
    }

    #[test]
    fn test_rejects_self_loop() {
        let r = CurveNetwork::new(
            vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)],
            vec![[1, 1]],
        );
        assert!(matches!(r, Err(CurveError::SelfLoopEdge { .. })));
    }

    #[test]
    fn test_rejects_duplicate_edge() {
        let r = CurveNetwork::new(
            vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)],
            vec![[0, 1], [1, 0]],
        );
        assert!(matches!(r, Err(CurveError::DuplicateEdge { .. })));
    }

    #[test]
    fn test_neighbor_queries() {
        let curve = unit_square();
        assert!(curve.edges_share_vertex(0, 1));
        assert!(!curve.edges_share_vertex(0, 2));
        // Vertex 1 sits between vertices 0 and 2.
        assert_eq!(curve.chord_neighbors(1), Some((0, 2)));
    }

    #[test]
    fn test_subdivide_preserves_original_vertices() {
        let mut curve = unit_square();
        curve.pin_vertex(2);
        let fine = curve.subdivide();

        assert_eq!(fine.num_vertices(), 8);
        assert_eq!(fine.num_edges(), 8);
        for v in 0..curve.num_vertices() {
            assert!((fine.position(v) - curve.position(v)).norm() < 1e-15);
        }
        // Midpoint of old edge 0 lands at index n + 0.
        assert!((fine.position(4) - Vector3::new(0.5, 0.0, 0.0)).norm() < 1e-15);
        assert!(fine.is_vertex_pinned(2));
        assert!(!fine.is_vertex_pinned(4));
        assert!((fine.total_length() - curve.total_length()).abs() < 1e-12);
    }

    #[test]
    fn test_connected_components() {
        let curve = unit_square();
        assert_eq!(curve.connected_components(), 1);

        let two = CurveNetwork::new(
            vec![
                Vector3::zeros(),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 2.0, 0.0),
                Vector3::new(1.0, 2.0, 0.0),
            ],
            vec![[0, 1], [2, 3]],
        )
        .unwrap();
        assert_eq!(two.connected_components(), 2);
    }

    #[test]
    fn test_vertex_dual_mass() {
        let curve = unit_square();
        // Two unit edges meet at every vertex.
        assert!((curve.vertex_dual_mass(0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut curve = unit_square();
        curve.pin_vertex(1);
        let json = serde_json::to_string(&curve).unwrap();
        let back: CurveNetwork = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_vertices(), 4);
        assert_eq!(back.num_edges(), 4);
        assert!(back.is_vertex_pinned(1));
        assert!((back.position(2) - curve.position(2)).norm() < 1e-15);
    }
}
