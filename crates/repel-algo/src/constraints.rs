//! Constraint enumeration and saddle-point projection.
//!
//! Active constraints are scalar linear(ized) functions of the vertex
//! positions with small total row count c ≪ n. The Sobolev gradient must be
//! orthogonal, in the B-inner product, to the tangent space of the active
//! set; both that projection and the post-step feasibility restoration
//! reduce to solves with the saddle-point system
//!
//! ```text
//! [ B  Jᵀ ] [ ĝ ]   [ g ]
//! [ J  0  ] [ λ ] = [ 0 ]
//! ```
//!
//! handled by Schur-complement elimination: the c columns `y_k = B⁻¹ Jᵀ eₖ`
//! are computed with the multigrid-preconditioned CG solver, the dense c×c
//! Schur matrix `J B⁻¹ Jᵀ` is factored with Cholesky, and every subsequent
//! projection or Newton correction reuses those factors. Rows are
//! linearized once per optimization step; back-projection freezes them and
//! iterates on the residual values only.

use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use nalgebra::Vector3;
use repel_core::CurveNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::multigrid::MultigridHierarchy;
use crate::sobolev::axpy3;

/// Errors from saddle-point solves
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Inner solver did not converge: residual {residual:.3e} after {iterations} iterations")]
    SolverNonConvergent { iterations: usize, residual: f64 },

    #[error("Constraint back-projection failed: drift {drift:.3e} after {iterations} Newton iterations")]
    BackProjectionFailed { drift: f64, iterations: usize },
}

/// Implicit surfaces usable as pin targets, sdf = 0 on the surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignedDistance {
    Sphere { center: Vector3<f64>, radius: f64 },
    Plane { point: Vector3<f64>, normal: Vector3<f64> },
}

impl SignedDistance {
    pub fn value(&self, p: &Vector3<f64>) -> f64 {
        match self {
            SignedDistance::Sphere { center, radius } => (p - center).norm() - radius,
            SignedDistance::Plane { point, normal } => {
                let n = normal.normalize();
                n.dot(&(p - point))
            }
        }
    }

    pub fn gradient(&self, p: &Vector3<f64>) -> Vector3<f64> {
        match self {
            SignedDistance::Sphere { center, .. } => {
                let d = p - center;
                let r = d.norm();
                if r > 0.0 {
                    d / r
                } else {
                    Vector3::zeros()
                }
            }
            SignedDistance::Plane { normal, .. } => normal.normalize(),
        }
    }
}

/// Constraint families the flow solver can activate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Fix the vertex barycenter (3 rows).
    Barycenter,
    /// Hold every edge at its captured length (one row per edge; intended
    /// for small curves, the Schur assembly scales with the row count).
    EdgeLengths,
    /// Hold flagged vertices at their captured positions (3 rows each).
    PinnedVertices,
    /// Hold the chord across flagged valence-2 vertices (3 rows each).
    PinnedTangents,
    /// Keep flagged vertices on an implicit surface (1 row each).
    SurfacePins { surface: SignedDistance },
}

/// Active constraints with targets captured from a reference configuration.
#[derive(Debug, Clone)]
pub struct ConstraintSet {
    kinds: Vec<ConstraintKind>,
    barycenter: Vector3<f64>,
    edge_lengths: Vec<f64>,
    pinned_positions: Vec<(usize, Vector3<f64>)>,
    pinned_chords: Vec<(usize, Vector3<f64>)>,
}

/// One Jacobian row: sparse vertex coefficients.
#[derive(Debug, Clone)]
pub struct ConstraintRow {
    entries: Vec<(usize, Vector3<f64>)>,
}

impl ConstraintRow {
    fn dot(&self, field: &[Vector3<f64>]) -> f64 {
        self.entries.iter().map(|(v, c)| c.dot(&field[*v])).sum()
    }

    fn scatter(&self, scale: f64, out: &mut [Vector3<f64>]) {
        for (v, c) in &self.entries {
            out[*v] += scale * c;
        }
    }
}

impl ConstraintSet {
    /// Record the active kinds and their target values from `curve`.
    pub fn capture(curve: &CurveNetwork, kinds: &[ConstraintKind]) -> Self {
        let mut set = Self {
            kinds: kinds.to_vec(),
            barycenter: curve.barycenter(),
            edge_lengths: (0..curve.num_edges()).map(|e| curve.edge_length(e)).collect(),
            pinned_positions: Vec::new(),
            pinned_chords: Vec::new(),
        };
        for v in curve.pinned_vertex_indices() {
            set.pinned_positions.push((v, curve.position(v)));
        }
        for v in curve.pinned_tangent_indices() {
            if let Some((a, b)) = curve.chord_neighbors(v) {
                set.pinned_chords
                    .push((v, curve.position(b) - curve.position(a)));
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Linearized Jacobian rows at the curve's current positions.
    pub fn rows(&self, curve: &CurveNetwork) -> Vec<ConstraintRow> {
        let n = curve.num_vertices();
        let mut rows = Vec::new();
        for kind in &self.kinds {
            match kind {
                ConstraintKind::Barycenter => {
                    let w = 1.0 / n as f64;
                    for c in 0..3 {
                        let mut axis = Vector3::zeros();
                        axis[c] = w;
                        rows.push(ConstraintRow {
                            entries: (0..n).map(|v| (v, axis)).collect(),
                        });
                    }
                }
                ConstraintKind::EdgeLengths => {
                    for e in 0..curve.num_edges() {
                        let [a, b] = curve.edge_verts(e);
                        let t = curve.edge_tangent(e);
                        rows.push(ConstraintRow {
                            entries: vec![(b, t), (a, -t)],
                        });
                    }
                }
                ConstraintKind::PinnedVertices => {
                    for &(v, _) in &self.pinned_positions {
                        for c in 0..3 {
                            let mut axis = Vector3::zeros();
                            axis[c] = 1.0;
                            rows.push(ConstraintRow {
                                entries: vec![(v, axis)],
                            });
                        }
                    }
                }
                ConstraintKind::PinnedTangents => {
                    for &(v, _) in &self.pinned_chords {
                        let (a, b) = curve.chord_neighbors(v).expect("valence-2 pin");
                        for c in 0..3 {
                            let mut axis = Vector3::zeros();
                            axis[c] = 1.0;
                            rows.push(ConstraintRow {
                                entries: vec![(b, axis), (a, -axis)],
                            });
                        }
                    }
                }
                ConstraintKind::SurfacePins { surface } => {
                    for v in curve.surface_pinned_indices() {
                        rows.push(ConstraintRow {
                            entries: vec![(v, surface.gradient(&curve.position(v)))],
                        });
                    }
                }
            }
        }
        rows
    }

    /// Constraint values φ(x) in the same order as [`ConstraintSet::rows`].
    pub fn values(&self, curve: &CurveNetwork) -> Vec<f64> {
        let mut vals = Vec::new();
        for kind in &self.kinds {
            match kind {
                ConstraintKind::Barycenter => {
                    let d = curve.barycenter() - self.barycenter;
                    vals.extend_from_slice(&[d.x, d.y, d.z]);
                }
                ConstraintKind::EdgeLengths => {
                    for (e, &l0) in self.edge_lengths.iter().enumerate() {
                        vals.push(curve.edge_length(e) - l0);
                    }
                }
                ConstraintKind::PinnedVertices => {
                    for &(v, p0) in &self.pinned_positions {
                        let d = curve.position(v) - p0;
                        vals.extend_from_slice(&[d.x, d.y, d.z]);
                    }
                }
                ConstraintKind::PinnedTangents => {
                    for &(v, chord0) in &self.pinned_chords {
                        let (a, b) = curve.chord_neighbors(v).expect("valence-2 pin");
                        let d = (curve.position(b) - curve.position(a)) - chord0;
                        vals.extend_from_slice(&[d.x, d.y, d.z]);
                    }
                }
                ConstraintKind::SurfacePins { surface } => {
                    for v in curve.surface_pinned_indices() {
                        vals.push(surface.value(&curve.position(v)));
                    }
                }
            }
        }
        vals
    }
}

/// Schur-complement solver for the saddle-point system, built once per step.
pub struct SaddlePointProjector<'a> {
    hierarchy: &'a MultigridHierarchy,
    rows: Vec<ConstraintRow>,
    /// Lifted constraint columns y_k = B⁻¹ Jᵀ eₖ.
    lifted: Vec<Vec<Vector3<f64>>>,
    /// Dense Schur matrix J B⁻¹ Jᵀ.
    schur: Mat<f64>,
    cg_iterations: usize,
}

impl<'a> SaddlePointProjector<'a> {
    /// Linearize the constraints at `curve` and assemble the Schur system.
    pub fn build(
        hierarchy: &'a MultigridHierarchy,
        set: &ConstraintSet,
        curve: &CurveNetwork,
    ) -> Result<Self, ProjectionError> {
        let rows = set.rows(curve);
        let c = rows.len();
        let n = curve.num_vertices();

        let mut lifted = Vec::with_capacity(c);
        let mut cg_iterations = 0;
        for row in &rows {
            let mut rhs = vec![Vector3::zeros(); n];
            row.scatter(1.0, &mut rhs);
            let sol = hierarchy.solve(&rhs);
            if !sol.converged {
                return Err(ProjectionError::SolverNonConvergent {
                    iterations: sol.iterations,
                    residual: sol.residual,
                });
            }
            cg_iterations += sol.iterations;
            lifted.push(sol.x);
        }

        // S is symmetric in exact arithmetic, but the inner solves are only
        // accurate to the CG tolerance. Keeping the raw columns S_:k = J y_k
        // preserves the identity J(Σ μ_k y_k) = S μ to machine precision,
        // which is what makes projected directions leave J ĝ = 0 and lets
        // back-projection kill linear drift in one correction.
        let mut schur = Mat::zeros(c, c);
        for (k, y) in lifted.iter().enumerate() {
            for (l, row) in rows.iter().enumerate() {
                schur.write(l, k, row.dot(y));
            }
        }

        Ok(Self {
            hierarchy,
            rows,
            lifted,
            schur,
            cg_iterations,
        })
    }

    pub fn num_constraints(&self) -> usize {
        self.rows.len()
    }

    /// Total inner CG iterations spent so far.
    pub fn cg_iterations(&self) -> usize {
        self.cg_iterations
    }

    /// Sobolev gradient restricted to ker J: solve `B z = g`, then remove
    /// the lifted multiplier combination.
    pub fn project_gradient(
        &mut self,
        g: &[Vector3<f64>],
    ) -> Result<Vec<Vector3<f64>>, ProjectionError> {
        let sol = self.hierarchy.solve(g);
        if !sol.converged {
            return Err(ProjectionError::SolverNonConvergent {
                iterations: sol.iterations,
                residual: sol.residual,
            });
        }
        self.cg_iterations += sol.iterations;
        let mut ghat = sol.x;

        if !self.rows.is_empty() {
            let jz: Vec<f64> = self.rows.iter().map(|r| r.dot(&ghat)).collect();
            let lambda = self.solve_schur(&jz);
            for (k, y) in self.lifted.iter().enumerate() {
                axpy3(&mut ghat, -lambda[k], y);
            }
        }
        Ok(ghat)
    }

    /// Newton restoration of constraint feasibility after a position update.
    ///
    /// The Jacobian, Schur factors, and lifted columns stay frozen at the
    /// step's linearization point; only the residual values are refreshed.
    pub fn back_project(
        &mut self,
        curve: &mut CurveNetwork,
        set: &ConstraintSet,
        tolerance: f64,
        max_iterations: usize,
    ) -> Result<f64, ProjectionError> {
        if self.rows.is_empty() {
            return Ok(0.0);
        }
        let mut drift = constraint_norm(&set.values(curve));
        for it in 0..max_iterations {
            if drift < tolerance {
                return Ok(drift);
            }
            let delta = set.values(curve);
            let mu = self.solve_schur(&delta);
            let mut correction = vec![Vector3::zeros(); curve.num_vertices()];
            for (k, y) in self.lifted.iter().enumerate() {
                axpy3(&mut correction, -mu[k], y);
            }
            curve.displace(&correction, 1.0);
            drift = constraint_norm(&set.values(curve));
            debug!(iteration = it + 1, drift, "constraint back-projection");
        }
        if drift < tolerance {
            Ok(drift)
        } else {
            Err(ProjectionError::BackProjectionFailed {
                drift,
                iterations: max_iterations,
            })
        }
    }

    fn solve_schur(&self, rhs: &[f64]) -> Vec<f64> {
        let c = rhs.len();
        if c == 0 {
            return Vec::new();
        }
        let mut b = Mat::zeros(c, 1);
        for (i, &v) in rhs.iter().enumerate() {
            b.write(i, 0, v);
        }
        // Pivoted LU on the raw matrix: see the consistency note at assembly.
        let sol = self.schur.partial_piv_lu().solve(&b);
        (0..c).map(|i| sol.read(i, 0)).collect()
    }
}

fn constraint_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// A-orthogonality diagnostic: J ĝ for a projected gradient, used by tests.
pub fn constraint_violation_of_direction(
    set: &ConstraintSet,
    curve: &CurveNetwork,
    dir: &[Vector3<f64>],
) -> f64 {
    let rows = set.rows(curve);
    constraint_norm(&rows.iter().map(|r| r.dot(dir)).collect::<Vec<_>>())
}
