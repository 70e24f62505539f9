//! Auxiliary potentials added on top of the tangent-point energy.
//!
//! All variants share one energy/gradient dispatch so the flow solver can
//! fold any mix of them into its objective. Obstacles are analytic implicit
//! shapes with an inverse-distance barrier; field alignment rewards edges
//! that follow a prescribed direction field.

use nalgebra::Vector3;
use repel_core::CurveNetwork;
use serde::{Deserialize, Serialize};

/// Distance floor for obstacle barriers; closer approaches are clamped so a
/// grazing line search probe cannot produce infinities.
const BARRIER_FLOOR: f64 = 1e-9;

/// Direction fields for the alignment potential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VectorFieldKind {
    /// Uniform field.
    Constant { direction: Vector3<f64> },
    /// Circulation around an axis through the origin: f(p) = axis × p.
    Circular { axis: Vector3<f64> },
}

impl VectorFieldKind {
    fn at(&self, p: &Vector3<f64>) -> Vector3<f64> {
        match self {
            VectorFieldKind::Constant { direction } => *direction,
            VectorFieldKind::Circular { axis } => axis.cross(p),
        }
    }
}

/// A weighted auxiliary term of the objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuxPotential {
    /// Total length penalty w·Σℓ.
    Length { weight: f64 },
    /// Per-edge deviation from a rest length: w·Σ(ℓ − rest)².
    LengthDiff { rest: f64, weight: f64 },
    /// Soft straightness penalty at tangent-pinned valence-2 vertices:
    /// w·Σ (1 − t̂₁·t̂₂) over the two incident chord directions.
    PinBending { weight: f64 },
    /// One-sided inverse-distance barrier from a plane.
    PlaneObstacle {
        point: Vector3<f64>,
        normal: Vector3<f64>,
        weight: f64,
    },
    /// Inverse-distance barrier from a sphere surface.
    SphereObstacle {
        center: Vector3<f64>,
        radius: f64,
        weight: f64,
    },
    /// Alignment with a direction field: −w·Σ (x_head − x_tail)·f(midpoint).
    VectorField { field: VectorFieldKind, weight: f64 },
}

impl AuxPotential {
    pub fn energy(&self, curve: &CurveNetwork) -> f64 {
        match self {
            AuxPotential::Length { weight } => weight * curve.total_length(),
            AuxPotential::LengthDiff { rest, weight } => {
                let mut e = 0.0;
                for edge in 0..curve.num_edges() {
                    let d = curve.edge_length(edge) - rest;
                    e += d * d;
                }
                weight * e
            }
            AuxPotential::PinBending { weight } => {
                let mut e = 0.0;
                for v in curve.pinned_tangent_indices() {
                    let Some((a, b)) = curve.chord_neighbors(v) else {
                        continue;
                    };
                    let u1 = (curve.position(v) - curve.position(a)).normalize();
                    let u2 = (curve.position(b) - curve.position(v)).normalize();
                    e += 1.0 - u1.dot(&u2);
                }
                weight * e
            }
            AuxPotential::PlaneObstacle {
                point,
                normal,
                weight,
            } => {
                let n = normal.normalize();
                (0..curve.num_vertices())
                    .map(|v| {
                        let d = n.dot(&(curve.position(v) - point)).max(BARRIER_FLOOR);
                        weight / d
                    })
                    .sum()
            }
            AuxPotential::SphereObstacle {
                center,
                radius,
                weight,
            } => (0..curve.num_vertices())
                .map(|v| {
                    let d = ((curve.position(v) - center).norm() - radius)
                        .abs()
                        .max(BARRIER_FLOOR);
                    weight / d
                })
                .sum(),
            AuxPotential::VectorField { field, weight } => {
                let mut e = 0.0;
                for edge in 0..curve.num_edges() {
                    let [a, b] = curve.edge_verts(edge);
                    let chord = curve.position(b) - curve.position(a);
                    e -= chord.dot(&field.at(&curve.edge_midpoint(edge)));
                }
                weight * e
            }
        }
    }

    /// Add this potential's gradient into per-vertex rows.
    pub fn accumulate_gradient(&self, curve: &CurveNetwork, grad: &mut [Vector3<f64>]) {
        match self {
            AuxPotential::Length { weight } => {
                for edge in 0..curve.num_edges() {
                    let [a, b] = curve.edge_verts(edge);
                    let t = curve.edge_tangent(edge);
                    grad[b] += *weight * t;
                    grad[a] -= *weight * t;
                }
            }
            AuxPotential::LengthDiff { rest, weight } => {
                for edge in 0..curve.num_edges() {
                    let [a, b] = curve.edge_verts(edge);
                    let t = curve.edge_tangent(edge);
                    let f = 2.0 * weight * (curve.edge_length(edge) - rest);
                    grad[b] += f * t;
                    grad[a] -= f * t;
                }
            }
            AuxPotential::PinBending { weight } => {
                for v in curve.pinned_tangent_indices() {
                    let Some((a, b)) = curve.chord_neighbors(v) else {
                        continue;
                    };
                    let d1 = curve.position(v) - curve.position(a);
                    let d2 = curve.position(b) - curve.position(v);
                    let (l1, l2) = (d1.norm(), d2.norm());
                    if l1 <= 0.0 || l2 <= 0.0 {
                        continue;
                    }
                    let (u1, u2) = (d1 / l1, d2 / l2);
                    let c = u1.dot(&u2);
                    // ∇(û₁·û₂) through each chord's normalization.
                    let p1 = (u2 - c * u1) / l1;
                    let p2 = (u1 - c * u2) / l2;
                    grad[a] += *weight * p1;
                    grad[v] -= *weight * (p1 - p2);
                    grad[b] -= *weight * p2;
                }
            }
            AuxPotential::PlaneObstacle {
                point,
                normal,
                weight,
            } => {
                let n = normal.normalize();
                for v in 0..curve.num_vertices() {
                    let d = n.dot(&(curve.position(v) - point)).max(BARRIER_FLOOR);
                    grad[v] -= (weight / (d * d)) * n;
                }
            }
            AuxPotential::SphereObstacle {
                center,
                radius,
                weight,
            } => {
                for v in 0..curve.num_vertices() {
                    let offset = curve.position(v) - center;
                    let r = offset.norm();
                    if r <= BARRIER_FLOOR {
                        continue;
                    }
                    let signed = r - radius;
                    let d = signed.abs().max(BARRIER_FLOOR);
                    grad[v] -= (weight * signed.signum() / (d * d)) * (offset / r);
                }
            }
            AuxPotential::VectorField { field, weight } => {
                for edge in 0..curve.num_edges() {
                    let [a, b] = curve.edge_verts(edge);
                    let chord = curve.position(b) - curve.position(a);
                    let mid = curve.edge_midpoint(edge);
                    match field {
                        VectorFieldKind::Constant { direction } => {
                            grad[b] -= *weight * *direction;
                            grad[a] += *weight * *direction;
                        }
                        VectorFieldKind::Circular { axis } => {
                            // E_edge = −w (axis × m)·u with u the chord and
                            // m the midpoint; ∇_u = axis × m, ∇_m = u × axis.
                            let f_mid = axis.cross(&mid);
                            let cross = chord.cross(axis);
                            grad[b] -= *weight * (f_mid + 0.5 * cross);
                            grad[a] -= *weight * (-f_mid + 0.5 * cross);
                        }
                    }
                }
            }
        }
    }
}

/// Summed energy of a potential stack.
pub fn total_potential_energy(potentials: &[AuxPotential], curve: &CurveNetwork) -> f64 {
    potentials.iter().map(|p| p.energy(curve)).sum()
}

/// Summed gradient of a potential stack.
pub fn accumulate_potential_gradient(
    potentials: &[AuxPotential],
    curve: &CurveNetwork,
    grad: &mut [Vector3<f64>],
) {
    for p in potentials {
        p.accumulate_gradient(curve, grad);
    }
}
