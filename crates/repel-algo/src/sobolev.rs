//! Vertex-space Sobolev metric.
//!
//! The block-cluster tree applies the fractional kernel to *edge*-indexed
//! scalars. Descent directions and constraints live on *vertex* positions,
//! so the flow solves with the lifted operator
//!
//! ```text
//! B u = Dᵀ A (D u) + M_v u
//! ```
//!
//! where `(D u)_e = (u_head − u_tail)/ℓ_e` is the normalized edge
//! difference, `A` the edge-space metric and `M_v` the lumped vertex mass
//! (half the incident edge lengths). `D` kills constants and `A` is SPD, so
//! `B` is SPD with the mass term bounding it away from the constant-field
//! null direction. The same scalar operator acts on each coordinate of a
//! vector-valued vertex field.
//!
//! The exact diagonal of `B` is assembled at construction for Jacobi
//! smoothing: a vertex couples only through its incident edges, so the few
//! required off-diagonal entries of `A` are evaluated directly.

use nalgebra::Vector3;
use repel_core::CurveNetwork;

use crate::bct::BlockClusterTree;

/// The lifted SPD operator `B = Dᵀ A D + M_v` over vertex fields.
#[derive(Debug, Clone)]
pub struct VertexMetric {
    bct: BlockClusterTree,
    edge_verts: Vec<[usize; 2]>,
    lengths: Vec<f64>,
    vertex_mass: Vec<f64>,
    diag: Vec<f64>,
    num_vertices: usize,
}

impl VertexMetric {
    pub fn new(curve: &CurveNetwork, bct: BlockClusterTree) -> Self {
        let n = curve.num_vertices();
        let m = curve.num_edges();
        let edge_verts: Vec<[usize; 2]> = (0..m).map(|e| curve.edge_verts(e)).collect();
        let lengths: Vec<f64> = (0..m).map(|e| curve.edge_length(e)).collect();
        let vertex_mass: Vec<f64> = (0..n).map(|v| curve.vertex_dual_mass(v)).collect();

        // diag(B)_v = M_v + d_vᵀ A d_v with d_v supported on incident edges.
        let mut diag = vec![0.0; n];
        for v in 0..n {
            let incident = curve.vertex_edges(v);
            let mut quad = 0.0;
            for (ai, &e) in incident.iter().enumerate() {
                let se = if edge_verts[e][1] == v { 1.0 } else { -1.0 };
                let de = se / lengths[e];
                quad += de * de * bct.diagonal(e);
                for &f in incident.iter().skip(ai + 1) {
                    let sf = if edge_verts[f][1] == v { 1.0 } else { -1.0 };
                    let df = sf / lengths[f];
                    quad += 2.0 * de * df * (-bct.pair_weight(e, f));
                }
            }
            diag[v] = vertex_mass[v] + quad;
        }

        Self {
            bct,
            edge_verts,
            lengths,
            vertex_mass,
            diag,
            num_vertices: n,
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    pub fn num_edges(&self) -> usize {
        self.lengths.len()
    }

    pub fn bct(&self) -> &BlockClusterTree {
        &self.bct
    }

    /// Exact diagonal of `B`, for Jacobi smoothing.
    pub fn diagonal(&self) -> &[f64] {
        &self.diag
    }

    /// Apply `B` to a scalar vertex field.
    pub fn apply_scalar(&self, u: &[f64]) -> Vec<f64> {
        let m = self.lengths.len();
        let mut w = vec![0.0; m];
        for e in 0..m {
            let [a, b] = self.edge_verts[e];
            w[e] = (u[b] - u[a]) / self.lengths[e];
        }
        let aw = self.bct.apply(&w);

        let mut out: Vec<f64> = u
            .iter()
            .zip(self.vertex_mass.iter())
            .map(|(ui, mi)| mi * ui)
            .collect();
        for e in 0..m {
            let [a, b] = self.edge_verts[e];
            let t = aw[e] / self.lengths[e];
            out[b] += t;
            out[a] -= t;
        }
        out
    }

    /// Apply `B` coordinate-wise to a vector-valued vertex field.
    pub fn apply(&self, u: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        let n = self.num_vertices;
        let mut out = vec![Vector3::zeros(); n];
        let mut scratch = vec![0.0; n];
        for c in 0..3 {
            for (v, s) in scratch.iter_mut().enumerate() {
                *s = u[v][c];
            }
            let col = self.apply_scalar(&scratch);
            for (v, val) in col.into_iter().enumerate() {
                out[v][c] = val;
            }
        }
        out
    }
}

// Small kernels for vector-valued vertex fields, shared by the CG loop and
// the projector.

pub(crate) fn dot3(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x.dot(y)).sum()
}

pub(crate) fn norm3(a: &[Vector3<f64>]) -> f64 {
    dot3(a, a).sqrt()
}

pub(crate) fn axpy3(y: &mut [Vector3<f64>], alpha: f64, x: &[Vector3<f64>]) {
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::EdgeBvh;

    fn circle(n: usize) -> CurveNetwork {
        let positions = (0..n)
            .map(|i| {
                let t = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
                Vector3::new(t.cos(), t.sin(), 0.0)
            })
            .collect();
        let edges = (0..n).map(|i| [i, (i + 1) % n]).collect();
        CurveNetwork::new(positions, edges).unwrap()
    }

    fn metric(n: usize) -> (CurveNetwork, VertexMetric) {
        let curve = circle(n);
        let bvh = EdgeBvh::build(&curve);
        let bct = BlockClusterTree::new(&curve, &bvh, 1.0, 3.0, 6.0).unwrap();
        let vm = VertexMetric::new(&curve, bct);
        (curve, vm)
    }

    fn pseudo_random_field(n: usize, salt: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (((i as f64 + salt) * 12.9898).sin() * 43758.5453).fract() - 0.5)
            .collect()
    }

    #[test]
    fn test_symmetric_and_positive() {
        let (_, vm) = metric(24);
        let n = vm.num_vertices();
        let u = pseudo_random_field(n, 0.7);
        let w = pseudo_random_field(n, 5.3);

        let bu = vm.apply_scalar(&u);
        let bw = vm.apply_scalar(&w);
        let ubw: f64 = u.iter().zip(bw.iter()).map(|(a, b)| a * b).sum();
        let wbu: f64 = w.iter().zip(bu.iter()).map(|(a, b)| a * b).sum();
        assert!(
            (ubw - wbu).abs() < 1e-10 * ubw.abs().max(1.0),
            "u·Bw = {ubw} vs w·Bu = {wbu}"
        );

        let quad: f64 = u.iter().zip(bu.iter()).map(|(a, b)| a * b).sum();
        assert!(quad > 0.0, "uᵀBu = {quad}");
    }

    #[test]
    fn test_constants_see_only_mass() {
        let (curve, vm) = metric(16);
        let n = vm.num_vertices();
        let ones = vec![1.0; n];
        let b1 = vm.apply_scalar(&ones);
        for v in 0..n {
            let want = curve.vertex_dual_mass(v);
            assert!(
                (b1[v] - want).abs() < 1e-9 * want.max(1.0),
                "vertex {v}: B1 = {}, mass = {want}",
                b1[v]
            );
        }
    }

    #[test]
    fn test_diagonal_matches_operator() {
        let (_, vm) = metric(12);
        let n = vm.num_vertices();
        for v in [0, 3, 7] {
            let mut e = vec![0.0; n];
            e[v] = 1.0;
            let col = vm.apply_scalar(&e);
            assert!(
                (col[v] - vm.diagonal()[v]).abs() < 1e-9 * col[v].abs().max(1.0),
                "vertex {v}: diag {} vs column {}",
                vm.diagonal()[v],
                col[v]
            );
        }
    }

    #[test]
    fn test_vector_apply_matches_scalar() {
        let (_, vm) = metric(10);
        let n = vm.num_vertices();
        let u = pseudo_random_field(n, 2.2);
        let field: Vec<Vector3<f64>> = u.iter().map(|&x| Vector3::new(x, 2.0 * x, -x)).collect();

        let scalar = vm.apply_scalar(&u);
        let vector = vm.apply(&field);
        for v in 0..n {
            assert!((vector[v].x - scalar[v]).abs() < 1e-12);
            assert!((vector[v].y - 2.0 * scalar[v]).abs() < 1e-11);
            assert!((vector[v].z + scalar[v]).abs() < 1e-12);
        }
    }
}
