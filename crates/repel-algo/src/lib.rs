//! # repel-algo: Scalable Repulsive Curve Optimization
//!
//! This crate provides the numerical engine for descending the
//! tangent-point energy of polygonal space curves with tens of thousands of
//! edges. Naïve assembly of the energy is O(m²) and the fractional Sobolev
//! preconditioner is a dense operator; every layer here exists to make one
//! optimization step O(m log m).
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`bvh`] | Barnes–Hut hierarchy over edges: dual position/tangent bounds, monopole summaries |
//! | [`tpe`] | Tangent-point energy and gradient, exact and Barnes–Hut |
//! | [`bct`] | Block cluster tree applying the edge-space metric in O(m log m) |
//! | [`sobolev`] | Lift of the edge metric to vertex fields |
//! | [`multigrid`] | Coarsened-curve hierarchy, V-cycle preconditioned CG |
//! | [`constraints`] | Constraint rows, Schur-complement saddle solves, back-projection |
//! | [`potential`] | Auxiliary potentials (length, obstacles, field alignment) |
//! | [`flow`] | The projected line-search step composing all of the above |
//!
//! ## Example
//!
//! ```ignore
//! use repel_algo::{FlowConfig, FlowSolver};
//! use repel_core::CurveNetwork;
//!
//! let curve = CurveNetwork::new(positions, edges)?;
//! let mut solver = FlowSolver::new(curve, FlowConfig::default())?;
//! let result = solver.step()?;
//! println!("E: {} -> {}", result.energy_before, result.energy_after);
//! ```
//!
//! ## Concurrency model
//!
//! Single-process, bulk-synchronous data parallelism over disjoint index
//! ranges (rayon fork-join): subtree builds, per-edge energy reductions,
//! per-thread gradient buffers, block-list sweeps, per-vertex smoothing.
//! Caches (BVH, BCT, hierarchy) are rebuilt per step and read-only while it
//! runs. Results are deterministic single-threaded; reduction order varies
//! across thread counts.

pub mod bct;
pub mod bvh;
pub mod constraints;
pub mod flow;
pub mod multigrid;
pub mod potential;
pub mod sobolev;
pub mod tpe;

pub use bct::{dense_metric, BlockClusterTree, MetricError};
pub use bvh::{BvhNode, EdgeBvh};
pub use constraints::{
    ConstraintKind, ConstraintSet, ProjectionError, SaddlePointProjector, SignedDistance,
};
pub use flow::{FlowConfig, FlowError, FlowSolver, FlowSummary, StepResult, StopReason};
pub use multigrid::{CgSolution, MultigridHierarchy, SolverOptions};
pub use potential::{AuxPotential, VectorFieldKind};
pub use sobolev::VertexMetric;
pub use tpe::{EnergyError, TangentPointEnergy};
