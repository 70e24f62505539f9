//! # repel-core: Curve Network Modeling Core
//!
//! Provides the fundamental data structures for repulsive curve optimization:
//! polygonal space curves embedded in ℝ³ with vertex/edge incidence tables,
//! per-vertex pin flags, and uniform midpoint subdivision.
//!
//! ## Design Philosophy
//!
//! Curve networks are modeled as **index tables** rather than pointer graphs:
//! - `positions[v]` — vertex positions,
//! - `edge_verts[e]` — ordered endpoint pairs,
//! - `vertex_edges[v]` — incident edge lists.
//!
//! This keeps the bidirectional vertex↔edge relation free of owning pointers,
//! makes remapping after subdivision trivial, and gives the numerical layers
//! (spatial hierarchies, cluster trees, multigrid) contiguous integer
//! indexing to parallelize over.
//!
//! ## Quick Start
//!
//! ```rust
//! use nalgebra::Vector3;
//! use repel_core::CurveNetwork;
//!
//! // A triangle in the xy-plane.
//! let curve = CurveNetwork::new(
//!     vec![
//!         Vector3::new(0.0, 0.0, 0.0),
//!         Vector3::new(1.0, 0.0, 0.0),
//!         Vector3::new(0.5, 1.0, 0.0),
//!     ],
//!     vec![[0, 1], [1, 2], [2, 0]],
//! )
//! .unwrap();
//!
//! assert_eq!(curve.num_edges(), 3);
//! let fine = curve.subdivide();
//! assert_eq!(fine.num_edges(), 6);
//! ```
//!
//! ## Modules
//!
//! - [`curve`] - Curve network topology, geometry queries, subdivision
//! - [`error`] - Unified error type and result alias
//!
//! Numerical algorithms (energies, metrics, solvers) live in `repel-algo`,
//! which consumes the interfaces defined here.

pub mod curve;
pub mod error;

pub use curve::CurveNetwork;
pub use error::{CurveError, CurveResult};

/// 3-vector type used throughout the workspace.
pub type Vec3 = nalgebra::Vector3<f64>;
