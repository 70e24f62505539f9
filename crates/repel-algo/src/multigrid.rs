//! # Geometric Multigrid for the Sobolev Metric
//!
//! Solving `B x = b` with the fractional vertex metric is the inner kernel
//! of every optimization step: the projected gradient needs one solve, each
//! constraint column another. Unpreconditioned CG on `B` degrades with mesh
//! resolution; a geometric hierarchy of coarsened curves restores
//! mesh-independent iteration counts.
//!
//! ## Hierarchy
//!
//! Each level contracts every other degree-2 vertex of the level above;
//! junctions, endpoints, and pinned vertices are always retained. The
//! prolongation `P` is linear interpolation — a retained fine vertex copies
//! its coarse twin, a removed vertex averages its two coarse neighbors —
//! and restriction is `R = Pᵀ`. Every level rebuilds its own BVH, block
//! cluster tree, and difference operator on the coarse geometry, which is
//! how edge-indexed quantities are transferred between levels.
//!
//! ## Cycle
//!
//! One damped-Jacobi sweep on the way down, a dense Cholesky
//! solve of the assembled coarsest operator, one sweep on the way up. The
//! outer solver is conjugate gradients over vector-valued vertex fields,
//! preconditioned by a single V-cycle per iteration, terminating at a
//! relative residual tolerance. The V-cycle is a fixed symmetric linear
//! operator, as CG requires.
//!
//! Reference: Briggs, Henson & McCormick, "A Multigrid Tutorial", 2nd ed.,
//! SIAM (2000). DOI: [10.1137/1.9780898719505](https://doi.org/10.1137/1.9780898719505)

use faer::prelude::SpSolver;
use faer::{FaerMat, Mat, Side};
use nalgebra::Vector3;
use rayon::prelude::*;
use repel_core::CurveNetwork;
use sprs::{CsMat, TriMat};
use std::collections::HashSet;
use tracing::trace;

use crate::bct::{BlockClusterTree, MetricError};
use crate::bvh::EdgeBvh;
use crate::sobolev::{axpy3, dot3, norm3, VertexMetric};

/// Jacobi damping factor. Conservative: the fractional stencils couple
/// beyond nearest neighbors, so the 1-D Laplacian's classic 2/3 has no
/// stability guarantee here.
const OMEGA: f64 = 0.5;

/// Options for the preconditioned solve.
#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    /// Relative residual target for CG.
    pub tolerance: f64,
    /// Use the V-cycle preconditioner; `false` falls back to Jacobi.
    pub use_multigrid: bool,
    /// Stop coarsening below this vertex count.
    pub coarse_threshold: usize,
    /// Iteration cap is `factor · log₂ m` plus a small constant.
    pub max_iteration_factor: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-2,
            use_multigrid: true,
            coarse_threshold: 48,
            max_iteration_factor: 10,
        }
    }
}

/// Result of one preconditioned CG solve.
#[derive(Debug, Clone)]
pub struct CgSolution {
    pub x: Vec<Vector3<f64>>,
    pub converged: bool,
    pub iterations: usize,
    /// Relative residual at exit.
    pub residual: f64,
    /// Relative residual after each iteration.
    pub residual_history: Vec<f64>,
}

struct MultigridLevel {
    metric: VertexMetric,
    /// Interpolation from this level up to the next finer one; `None` at the
    /// finest level.
    prolongation: Option<CsMat<f64>>,
}

/// Hierarchy of coarsened curves with their metric operators.
pub struct MultigridHierarchy {
    levels: Vec<MultigridLevel>,
    /// Dense coarsest operator; absent when the coarsest level is still too
    /// large to assemble (all vertices pinned, say) — smoothing stands in.
    coarse_dense: Option<Mat<f64>>,
    opts: SolverOptions,
    finest_edges: usize,
}

impl MultigridHierarchy {
    /// Build the hierarchy for the curve's current positions.
    pub fn build(
        curve: &CurveNetwork,
        sep: f64,
        alpha: f64,
        beta: f64,
        opts: SolverOptions,
    ) -> Result<Self, MetricError> {
        // Coarsen the geometry first; each prolongation pairs a coarse level
        // with the finer level above it.
        let mut curves = vec![curve.clone()];
        let mut prolongations: Vec<Option<CsMat<f64>>> = vec![None];
        if opts.use_multigrid {
            while curves.last().expect("nonempty").num_vertices() > opts.coarse_threshold {
                match coarsen(curves.last().expect("nonempty")) {
                    Some((coarse, p)) => {
                        curves.push(coarse);
                        prolongations.push(Some(p));
                    }
                    None => break,
                }
            }
        }

        let mut levels = Vec::with_capacity(curves.len());
        for (c, p) in curves.iter().zip(prolongations.into_iter()) {
            let bvh = EdgeBvh::build(c);
            let bct = BlockClusterTree::new(c, &bvh, sep, alpha, beta)?;
            levels.push(MultigridLevel {
                metric: VertexMetric::new(c, bct),
                prolongation: p,
            });
        }

        let coarsest = levels.last().expect("at least one level");
        let n_c = coarsest.metric.num_vertices();
        let coarse_dense = if n_c <= 4 * opts.coarse_threshold.max(1) {
            Some(assemble_dense(&coarsest.metric))
        } else {
            None
        };

        Ok(Self {
            finest_edges: levels[0].metric.num_edges(),
            levels,
            coarse_dense,
            opts,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn finest(&self) -> &VertexMetric {
        &self.levels[0].metric
    }

    pub fn max_iterations(&self) -> usize {
        let m = self.finest_edges.max(2) as f64;
        self.opts.max_iteration_factor * (m.log2().ceil() as usize) + 10
    }

    /// Preconditioned CG solve of `B x = b` on the finest level.
    pub fn solve(&self, b: &[Vector3<f64>]) -> CgSolution {
        let metric = self.finest();
        let n = b.len();
        let norm_b = norm3(b);
        if norm_b == 0.0 {
            return CgSolution {
                x: vec![Vector3::zeros(); n],
                converged: true,
                iterations: 0,
                residual: 0.0,
                residual_history: Vec::new(),
            };
        }

        let mut x = vec![Vector3::zeros(); n];
        let mut r = b.to_vec();
        let mut z = self.precondition(&r);
        let mut p = z.clone();
        let mut rz = dot3(&r, &z);
        let mut history = Vec::new();
        let max_iter = self.max_iterations();

        for it in 1..=max_iter {
            let ap = metric.apply(&p);
            let pap = dot3(&p, &ap);
            if pap <= 0.0 {
                // Numerical breakdown; report what we have.
                let res = norm3(&r) / norm_b;
                return CgSolution {
                    x,
                    converged: res <= self.opts.tolerance,
                    iterations: it - 1,
                    residual: res,
                    residual_history: history,
                };
            }
            let alpha = rz / pap;
            axpy3(&mut x, alpha, &p);
            axpy3(&mut r, -alpha, &ap);

            let res = norm3(&r) / norm_b;
            history.push(res);
            trace!(iteration = it, residual = res, "sobolev cg");
            if res <= self.opts.tolerance {
                return CgSolution {
                    x,
                    converged: true,
                    iterations: it,
                    residual: res,
                    residual_history: history,
                };
            }

            z = self.precondition(&r);
            let rz_new = dot3(&r, &z);
            let beta = rz_new / rz;
            rz = rz_new;
            for v in 0..n {
                p[v] = z[v] + beta * p[v];
            }
        }

        let residual = *history.last().unwrap_or(&f64::INFINITY);
        CgSolution {
            x,
            converged: false,
            iterations: max_iter,
            residual,
            residual_history: history,
        }
    }

    fn precondition(&self, r: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        if self.opts.use_multigrid {
            self.v_cycle(0, r)
        } else {
            let diag = self.finest().diagonal();
            r.iter().zip(diag.iter()).map(|(ri, &d)| ri / d).collect()
        }
    }

    fn v_cycle(&self, level: usize, b: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        if level + 1 == self.levels.len() {
            return self.coarse_solve(b);
        }
        let metric = &self.levels[level].metric;
        let diag = metric.diagonal();

        // Pre-smooth from the zero guess.
        let mut x: Vec<Vector3<f64>> = b
            .par_iter()
            .zip(diag.par_iter())
            .map(|(bi, &d)| OMEGA * bi / d)
            .collect();

        let bx = metric.apply(&x);
        let r: Vec<Vector3<f64>> = b
            .iter()
            .zip(bx.iter())
            .map(|(bi, bxi)| bi - bxi)
            .collect();

        let p = self.levels[level + 1]
            .prolongation
            .as_ref()
            .expect("coarser levels carry a prolongation");
        let rc = restrict(p, &r);
        let ec = self.v_cycle(level + 1, &rc);
        let correction = prolong(p, &ec);
        axpy3(&mut x, 1.0, &correction);

        // Post-smooth.
        let bx = metric.apply(&x);
        x.par_iter_mut().enumerate().for_each(|(v, xv)| {
            *xv += OMEGA * (b[v] - bx[v]) / diag[v];
        });
        x
    }

    fn coarse_solve(&self, b: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        let metric = &self.levels[self.levels.len() - 1].metric;
        match &self.coarse_dense {
            Some(mat) => {
                let n = b.len();
                let mut rhs = Mat::zeros(n, 3);
                for (i, bi) in b.iter().enumerate() {
                    for c in 0..3 {
                        rhs.write(i, c, bi[c]);
                    }
                }
                let sol = match mat.cholesky(Side::Lower) {
                    Ok(chol) => chol.solve(&rhs),
                    // SPD up to roundoff; LU covers the marginal case.
                    Err(_) => mat.partial_piv_lu().solve(&rhs),
                };
                (0..n)
                    .map(|i| Vector3::new(sol.read(i, 0), sol.read(i, 1), sol.read(i, 2)))
                    .collect()
            }
            None => {
                // No dense coarse operator: damped Jacobi stands in.
                let diag = metric.diagonal();
                let mut x: Vec<Vector3<f64>> = b
                    .iter()
                    .zip(diag.iter())
                    .map(|(bi, &d)| OMEGA * bi / d)
                    .collect();
                for _ in 0..3 {
                    let bx = metric.apply(&x);
                    for v in 0..x.len() {
                        x[v] += OMEGA * (b[v] - bx[v]) / diag[v];
                    }
                }
                x
            }
        }
    }
}

/// Contract every other unpinned degree-2 vertex.
///
/// Returns the coarse curve and the vertex prolongation (fine × coarse), or
/// `None` when no vertex can be removed.
pub fn coarsen(curve: &CurveNetwork) -> Option<(CurveNetwork, CsMat<f64>)> {
    let n = curve.num_vertices();
    let m = curve.num_edges();

    let mut removed = vec![false; n];
    for v in 0..n {
        if curve.valence(v) != 2 || curve.is_pinned_any(v) {
            continue;
        }
        let (a, b) = curve.chord_neighbors(v).expect("valence 2");
        if a == b || removed[a] || removed[b] {
            continue;
        }
        removed[v] = true;
    }

    // Contracting v merges its two edges into (a, b); back out removals that
    // would duplicate an edge (tight loops).
    loop {
        let mut pairs: HashSet<(usize, usize)> = HashSet::new();
        for e in 0..m {
            let [u, w] = curve.edge_verts(e);
            if removed[u] || removed[w] {
                continue;
            }
            pairs.insert((u.min(w), u.max(w)));
        }
        let mut conflict = None;
        for v in 0..n {
            if !removed[v] {
                continue;
            }
            let (a, b) = curve.chord_neighbors(v).expect("valence 2");
            if !pairs.insert((a.min(b), a.max(b))) {
                conflict = Some(v);
                break;
            }
        }
        match conflict {
            Some(v) => removed[v] = false,
            None => break,
        }
    }

    if !removed.iter().any(|&r| r) {
        return None;
    }

    let mut coarse_of = vec![usize::MAX; n];
    let mut positions = Vec::new();
    for v in 0..n {
        if !removed[v] {
            coarse_of[v] = positions.len();
            positions.push(curve.position(v));
        }
    }

    let mut edges = Vec::new();
    for e in 0..m {
        let [u, w] = curve.edge_verts(e);
        if !removed[u] && !removed[w] {
            edges.push([coarse_of[u], coarse_of[w]]);
        }
    }
    for v in 0..n {
        if removed[v] {
            let (a, b) = curve.chord_neighbors(v).expect("valence 2");
            edges.push([coarse_of[a], coarse_of[b]]);
        }
    }

    let mut coarse = CurveNetwork::new(positions, edges).ok()?;
    for v in 0..n {
        if removed[v] {
            continue;
        }
        if curve.is_vertex_pinned(v) {
            coarse.pin_vertex(coarse_of[v]);
        }
        if curve.is_tangent_pinned(v) {
            coarse.pin_tangent(coarse_of[v]);
        }
        if curve.is_surface_pinned(v) {
            coarse.pin_to_surface(coarse_of[v]);
        }
    }

    let n_c = coarse.num_vertices();
    let mut tri = TriMat::new((n, n_c));
    for v in 0..n {
        if removed[v] {
            let (a, b) = curve.chord_neighbors(v).expect("valence 2");
            tri.add_triplet(v, coarse_of[a], 0.5);
            tri.add_triplet(v, coarse_of[b], 0.5);
        } else {
            tri.add_triplet(v, coarse_of[v], 1.0);
        }
    }

    Some((coarse, tri.to_csr()))
}

/// `P e_c`: interpolate a coarse field to the fine level.
fn prolong(p: &CsMat<f64>, coarse: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    let mut out = vec![Vector3::zeros(); p.rows()];
    for (row, out_v) in out.iter_mut().enumerate() {
        if let Some(r) = p.outer_view(row) {
            for (col, &val) in r.iter() {
                *out_v += val * coarse[col];
            }
        }
    }
    out
}

/// `Pᵀ r`: restrict a fine field to the coarse level.
fn restrict(p: &CsMat<f64>, fine: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    let mut out = vec![Vector3::zeros(); p.cols()];
    for row in 0..p.rows() {
        if let Some(r) = p.outer_view(row) {
            for (col, &val) in r.iter() {
                out[col] += val * fine[row];
            }
        }
    }
    out
}

/// Assemble the dense coarsest operator column by column.
fn assemble_dense(metric: &VertexMetric) -> Mat<f64> {
    let n = metric.num_vertices();
    let mut mat = Mat::zeros(n, n);
    let mut e = vec![0.0; n];
    for j in 0..n {
        e[j] = 1.0;
        let col = metric.apply_scalar(&e);
        e[j] = 0.0;
        for (i, val) in col.into_iter().enumerate() {
            mat.write(i, j, val);
        }
    }
    mat
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn pseudo_random_field(n: usize, salt: f64) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let s = ((i as f64 + salt) * 12.9898).sin() * 43758.5453;
                Vector3::new(
                    s.fract() - 0.5,
                    (s * 1.618).fract() - 0.5,
                    (s * 2.236).fract() - 0.5,
                )
            })
            .collect()
    }

    #[test]
    fn test_coarsen_halves_a_loop() {
        let curve = circle(64);
        let (coarse, p) = coarsen(&curve).expect("a loop coarsens");
        assert_eq!(coarse.num_vertices(), 32);
        assert_eq!(coarse.num_edges(), 32);
        assert_eq!(p.rows(), 64);
        assert_eq!(p.cols(), 32);

        // Interpolating the coarse positions reproduces fine positions at
        // retained vertices and chord midpoints at removed ones.
        let interp = prolong(&p, &coarse.positions().to_vec());
        for v in 0..curve.num_vertices() {
            let row = p.outer_view(v).unwrap();
            if row.nnz() == 1 {
                assert!((interp[v] - curve.position(v)).norm() < 1e-14);
            }
        }
    }

    #[test]
    fn test_coarsen_keeps_pinned_vertices() {
        let mut curve = circle(32);
        curve.pin_vertex(5);
        curve.pin_tangent(11);
        let (coarse, p) = coarsen(&curve).expect("coarsens");

        let pinned: Vec<usize> = coarse.pinned_vertex_indices();
        assert_eq!(pinned.len(), 1);
        assert_eq!(coarse.pinned_tangent_indices().len(), 1);
        // The pinned vertex keeps its position.
        let pv = pinned[0];
        assert!((coarse.position(pv) - curve.position(5)).norm() < 1e-14);
        let _ = p;
    }

    #[test]
    fn test_coarsen_refuses_triangle() {
        let curve = CurveNetwork::new(
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.5, 1.0, 0.0),
            ],
            vec![[0, 1], [1, 2], [2, 0]],
        )
        .unwrap();
        // Any contraction would duplicate the remaining edge.
        assert!(coarsen(&curve).is_none());
    }

    #[test]
    fn test_restrict_is_prolong_transpose() {
        let curve = circle(24);
        let (coarse, p) = coarsen(&curve).unwrap();
        let fine = pseudo_random_field(curve.num_vertices(), 0.4);
        let coarse_f = pseudo_random_field(coarse.num_vertices(), 3.1);

        // ⟨P c, f⟩ == ⟨c, Pᵀ f⟩
        let lhs = dot3(&prolong(&p, &coarse_f), &fine);
        let rhs = dot3(&coarse_f, &restrict(&p, &fine));
        assert!((lhs - rhs).abs() < 1e-12 * lhs.abs().max(1.0));
    }

    #[test]
    fn test_solve_reaches_tolerance() {
        let curve = circle(128);
        let hierarchy =
            MultigridHierarchy::build(&curve, 1.0, 3.0, 6.0, SolverOptions::default()).unwrap();
        assert!(hierarchy.num_levels() > 1);

        let b = pseudo_random_field(curve.num_vertices(), 1.9);
        let sol = hierarchy.solve(&b);
        assert!(sol.converged, "residual {} after {} iterations", sol.residual, sol.iterations);
        assert!(sol.iterations <= hierarchy.max_iterations());

        // The returned x actually satisfies the system to the tolerance.
        let bx = hierarchy.finest().apply(&sol.x);
        let r: Vec<Vector3<f64>> = b.iter().zip(bx.iter()).map(|(a, c)| a - c).collect();
        assert!(norm3(&r) / norm3(&b) <= 1.05 * SolverOptions::default().tolerance);
    }

    #[test]
    fn test_jacobi_fallback_converges() {
        let curve = circle(48);
        let opts = SolverOptions {
            use_multigrid: false,
            max_iteration_factor: 40,
            ..SolverOptions::default()
        };
        let hierarchy = MultigridHierarchy::build(&curve, 1.0, 3.0, 6.0, opts).unwrap();
        assert_eq!(hierarchy.num_levels(), 1);

        let b = pseudo_random_field(curve.num_vertices(), 7.7);
        let sol = hierarchy.solve(&b);
        assert!(sol.converged, "residual {}", sol.residual);
    }

    #[test]
    fn test_vcycle_residual_contraction() {
        let curve = circle(96);
        let hierarchy =
            MultigridHierarchy::build(&curve, 1.0, 3.0, 6.0, SolverOptions::default()).unwrap();
        let b = pseudo_random_field(curve.num_vertices(), 5.5);
        let sol = hierarchy.solve(&b);

        // Residual history should be essentially monotone.
        for w in sol.residual_history.windows(2) {
            assert!(
                w[1] <= w[0] * 1.5,
                "residual rose sharply: {} -> {}",
                w[0],
                w[1]
            );
        }
    }
}
