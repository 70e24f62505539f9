//! # Sobolev-Preconditioned Gradient Flow
//!
//! One optimization step composes the numerical layers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  1. Build the edge BVH; assemble energy E(x) and L² gradient g.  │
//! │  2. Build the block cluster tree and multigrid hierarchy for     │
//! │     the current positions.                                       │
//! │  3. Solve the saddle-point system for the Sobolev gradient ĝ     │
//! │     restricted to the tangent space of the active constraints.   │
//! │  4. Backtracking line search along −ĝ under the Armijo rule      │
//! │     E(x − tĝ) ≤ E(x) − c₁ t ⟨g, ĝ⟩.                              │
//! │  5. Project constraint drift back to the feasible set.           │
//! │  6. Near-minimum check on ⟨g, ĝ⟩ / (‖g‖‖ĝ‖).                     │
//! │  7. Subdivide uniformly once the mean edge length has doubled.   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The caches built in 1–2 are scoped to the step and read-only while it
//! runs; a topology change (subdivision) simply lets them drop. Termination
//! is the caller's decision — [`FlowSolver::step`] reports what happened and
//! [`FlowSolver::run`] offers a conventional stop policy on top of it.
//!
//! Failure surface: a rejected line search is data (`good_step = false`,
//! positions untouched), while an unconverged inner solve or a failed
//! back-projection aborts the step with positions rolled back.

use nalgebra::Vector3;
use repel_core::CurveNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::bct::MetricError;
use crate::bvh::EdgeBvh;
use crate::constraints::{ConstraintKind, ConstraintSet, ProjectionError, SaddlePointProjector};
use crate::multigrid::{MultigridHierarchy, SolverOptions};
use crate::potential::{accumulate_potential_gradient, total_potential_energy, AuxPotential};
use crate::sobolev::{dot3, norm3};
use crate::tpe::{EnergyError, TangentPointEnergy};

/// Armijo sufficient-decrease coefficient.
const ARMIJO_C1: f64 = 1e-4;

/// Maximum step halvings before the line search gives up.
const MAX_HALVINGS: usize = 16;

/// Directional-alignment threshold below which the flow is at a stationary
/// point as far as the preconditioner can tell.
const SOBO_ZERO_THRESHOLD: f64 = 1e-4;

/// Errors surfaced by the flow solver
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    Energy(#[from] EnergyError),

    #[error("Inner solver did not converge: residual {residual:.3e} after {iterations} iterations")]
    SolverNonConvergent { iterations: usize, residual: f64 },

    #[error("Constraint projection failed: drift {drift:.3e}; step rolled back")]
    ConstraintProjectionFailed { drift: f64 },
}

impl From<ProjectionError> for FlowError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::SolverNonConvergent {
                iterations,
                residual,
            } => FlowError::SolverNonConvergent {
                iterations,
                residual,
            },
            ProjectionError::BackProjectionFailed { drift, .. } => {
                FlowError::ConstraintProjectionFailed { drift }
            }
        }
    }
}

/// Flow solver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Tangent-point exponent α.
    pub alpha: f64,
    /// Tangent-point exponent β.
    pub beta: f64,
    /// Admissibility separation ratio for BVH and BCT.
    pub sep: f64,
    pub use_multigrid: bool,
    pub use_barnes_hut: bool,
    pub constraints: Vec<ConstraintKind>,
    /// Auxiliary potentials added to the objective.
    pub potentials: Vec<AuxPotential>,
    /// Maximum number of uniform subdivisions.
    pub subdivision_limit: usize,
    /// Step cap for [`FlowSolver::run`].
    pub step_limit: usize,
    /// `run` stops once the mean edge length reaches this multiple of its
    /// initial value; `0.0` disables the check.
    pub target_edge_length_scale: f64,
    /// Relative residual target for the inner CG solves.
    pub cg_tolerance: f64,
    /// Feasibility target for constraint back-projection.
    pub constraint_tolerance: f64,
    /// Vertex count below which the hierarchy stops coarsening.
    pub coarse_threshold: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            alpha: 3.0,
            beta: 6.0,
            sep: 1.0,
            use_multigrid: true,
            use_barnes_hut: true,
            constraints: Vec::new(),
            potentials: Vec::new(),
            subdivision_limit: 2,
            step_limit: 100,
            target_edge_length_scale: 0.0,
            cg_tolerance: 1e-2,
            constraint_tolerance: 1e-6,
            coarse_threshold: 48,
        }
    }
}

/// Outcome of one optimization step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// A step was accepted and positions moved.
    pub good_step: bool,
    /// The projected gradient no longer aligns with the L² gradient; the
    /// flow is stationary up to preconditioner resolution.
    pub sobo_norm_zero: bool,
    pub energy_before: f64,
    pub energy_after: f64,
    /// Accepted step size (0 when no step was taken).
    pub step_size: f64,
    /// Line search halvings performed.
    pub halvings: usize,
    /// Inner CG iterations spent across all solves of the step.
    pub cg_iterations: usize,
    /// The curve was uniformly subdivided after this step.
    pub subdivided: bool,
}

/// Why [`FlowSolver::run`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    StepLimit,
    SoboNormZero,
    LineSearchExhausted,
    TargetLengthReached,
}

/// Summary of a [`FlowSolver::run`] loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub steps_attempted: usize,
    pub steps_accepted: usize,
    pub final_energy: f64,
    pub stopped: StopReason,
}

/// Owns the curve being optimized and drives the descent.
pub struct FlowSolver {
    config: FlowConfig,
    curve: CurveNetwork,
    energy: TangentPointEnergy,
    constraints: ConstraintSet,
    initial_avg_edge_length: f64,
    prev_step: f64,
    subdivisions: usize,
    steps_taken: usize,
}

impl FlowSolver {
    pub fn new(curve: CurveNetwork, config: FlowConfig) -> Result<Self, FlowError> {
        let energy = TangentPointEnergy::new(config.alpha, config.beta)?;
        let constraints = ConstraintSet::capture(&curve, &config.constraints);
        let initial_avg_edge_length = curve.average_edge_length();
        Ok(Self {
            config,
            curve,
            energy,
            constraints,
            initial_avg_edge_length,
            prev_step: 0.0,
            subdivisions: 0,
            steps_taken: 0,
        })
    }

    pub fn curve(&self) -> &CurveNetwork {
        &self.curve
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn subdivisions(&self) -> usize {
        self.subdivisions
    }

    /// Replace the curve's positions between steps, e.g. after external
    /// edits by an interactive embedder. Constraint targets stay as
    /// captured; the next back-projection pulls the curve to them.
    pub fn set_positions(
        &mut self,
        positions: Vec<Vector3<f64>>,
    ) -> Result<(), repel_core::CurveError> {
        self.curve.set_positions(positions)
    }

    /// Objective at the given configuration (tangent-point energy plus the
    /// configured potential stack).
    pub fn objective(&self, curve: &CurveNetwork) -> f64 {
        let tpe = if self.config.use_barnes_hut {
            let bvh = EdgeBvh::build(curve);
            self.energy.energy_barnes_hut(curve, &bvh, self.config.sep)
        } else {
            self.energy.energy_exact(curve)
        };
        tpe + total_potential_energy(&self.config.potentials, curve)
    }

    fn objective_gradient(&self, curve: &CurveNetwork, bvh: &EdgeBvh) -> Vec<Vector3<f64>> {
        let mut g = if self.config.use_barnes_hut {
            self.energy.gradient_barnes_hut(curve, bvh, self.config.sep)
        } else {
            self.energy.gradient_exact(curve)
        };
        accumulate_potential_gradient(&self.config.potentials, curve, &mut g);
        g
    }

    /// Execute one optimization step.
    pub fn step(&mut self) -> Result<StepResult, FlowError> {
        let snapshot = self.curve.clone();

        let bvh = EdgeBvh::build(&self.curve);
        let energy_before = self.objective(&self.curve);
        let g = self.objective_gradient(&self.curve, &bvh);

        let opts = SolverOptions {
            tolerance: self.config.cg_tolerance,
            use_multigrid: self.config.use_multigrid,
            coarse_threshold: self.config.coarse_threshold,
            ..SolverOptions::default()
        };
        let hierarchy = MultigridHierarchy::build(
            &self.curve,
            self.config.sep,
            self.config.alpha,
            self.config.beta,
            opts,
        )?;
        let mut projector = SaddlePointProjector::build(&hierarchy, &self.constraints, &self.curve)?;
        let ghat = projector.project_gradient(&g)?;
        let cg_iterations = projector.cg_iterations();

        // Stationarity proxy: the unconditioned alignment of g and ĝ.
        let dir_dot = dot3(&g, &ghat);
        let g_norm = norm3(&g);
        let ghat_norm = norm3(&ghat);
        if g_norm == 0.0 || ghat_norm == 0.0 || dir_dot / (g_norm * ghat_norm) <= SOBO_ZERO_THRESHOLD
        {
            debug!(dir_dot, g_norm, ghat_norm, "flow is stationary");
            return Ok(StepResult {
                good_step: false,
                sobo_norm_zero: true,
                energy_before,
                energy_after: energy_before,
                step_size: 0.0,
                halvings: 0,
                cg_iterations,
                subdivided: false,
            });
        }

        // Backtracking line search along −ĝ. The initial step is capped so
        // no vertex moves more than one mean edge length: larger motions
        // leave the constraint linearization's contraction basin and starve
        // the back-projection.
        let mut t = if self.prev_step > 0.0 {
            2.0 * self.prev_step
        } else {
            1.0
        };
        let ghat_max = ghat.iter().map(|v| v.norm()).fold(0.0, f64::max);
        if ghat_max > 0.0 {
            t = t.min(self.curve.average_edge_length() / ghat_max);
        }
        let mut halvings = 0;
        let mut accepted = None;
        loop {
            let mut trial = snapshot.clone();
            trial.displace(&ghat, -t);
            let trial_energy = self.objective(&trial);
            trace!(t, trial_energy, "line search probe");
            if trial_energy <= energy_before - ARMIJO_C1 * t * dir_dot {
                accepted = Some((trial, trial_energy));
                break;
            }
            if halvings == MAX_HALVINGS {
                break;
            }
            halvings += 1;
            t *= 0.5;
        }

        let Some((stepped, mut energy_after)) = accepted else {
            debug!(halvings, "line search exhausted; step rejected");
            return Ok(StepResult {
                good_step: false,
                sobo_norm_zero: false,
                energy_before,
                energy_after: energy_before,
                step_size: 0.0,
                halvings,
                cg_iterations,
                subdivided: false,
            });
        };
        self.curve = stepped;
        self.prev_step = t;

        // Restore feasibility; a failure rolls the whole step back.
        if !self.constraints.is_empty() {
            match projector.back_project(
                &mut self.curve,
                &self.constraints,
                self.config.constraint_tolerance,
                4,
            ) {
                Ok(drift) => {
                    trace!(drift, "constraints restored");
                    energy_after = self.objective(&self.curve);
                }
                Err(err) => {
                    self.curve = snapshot;
                    return Err(err.into());
                }
            }
        }
        let cg_iterations = projector.cg_iterations();

        self.steps_taken += 1;
        debug!(
            step = self.steps_taken,
            t, energy_before, energy_after, "accepted step"
        );

        // Uniform subdivision once the resolution has visibly coarsened.
        let mut subdivided = false;
        if self.curve.average_edge_length() > 2.0 * self.initial_avg_edge_length
            && self.subdivisions < self.config.subdivision_limit
        {
            self.curve = self.curve.subdivide();
            self.subdivisions += 1;
            self.constraints = ConstraintSet::capture(&self.curve, &self.config.constraints);
            subdivided = true;
            debug!(
                edges = self.curve.num_edges(),
                "subdivided after edge length doubled"
            );
        }

        Ok(StepResult {
            good_step: true,
            sobo_norm_zero: false,
            energy_before,
            energy_after,
            step_size: t,
            halvings,
            cg_iterations,
            subdivided,
        })
    }

    /// Drive [`FlowSolver::step`] until the configured stop policy fires.
    pub fn run(&mut self) -> Result<FlowSummary, FlowError> {
        let mut attempted = 0;
        let mut accepted = 0;
        let mut stopped = StopReason::StepLimit;

        while attempted < self.config.step_limit {
            attempted += 1;
            let result = self.step()?;
            if result.sobo_norm_zero {
                stopped = StopReason::SoboNormZero;
                break;
            }
            if !result.good_step {
                stopped = StopReason::LineSearchExhausted;
                break;
            }
            accepted += 1;

            if self.config.target_edge_length_scale > 0.0
                && self.curve.average_edge_length()
                    >= self.config.target_edge_length_scale * self.initial_avg_edge_length
            {
                stopped = StopReason::TargetLengthReached;
                break;
            }
        }

        Ok(FlowSummary {
            steps_attempted: attempted,
            steps_accepted: accepted,
            final_energy: self.objective(&self.curve),
            stopped,
        })
    }
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

    #[test]
    fn test_config_serde_roundtrip() {
        let config = FlowConfig {
            alpha: 2.0,
            beta: 4.5,
            constraints: vec![ConstraintKind::Barycenter],
            ..FlowConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: FlowConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.alpha, 2.0);
        assert_eq!(back.beta, 4.5);
        assert_eq!(back.constraints.len(), 1);
    }

    #[test]
    fn test_rejects_bad_exponents() {
        let config = FlowConfig {
            alpha: 3.0,
            beta: 3.5,
            ..FlowConfig::default()
        };
        assert!(FlowSolver::new(circle(16), config).is_err());
    }

    #[test]
    fn test_single_step_decreases_energy() {
        let config = FlowConfig {
            step_limit: 1,
            ..FlowConfig::default()
        };
        let mut solver = FlowSolver::new(circle(48), config).unwrap();
        let r = solver.step().unwrap();
        assert!(r.good_step, "step rejected: {r:?}");
        assert!(
            r.energy_after < r.energy_before,
            "no descent: {} -> {}",
            r.energy_before,
            r.energy_after
        );
    }

    #[test]
    fn test_exact_path_matches_behavior() {
        // The exact evaluators drive the same descent when Barnes–Hut is off.
        let config = FlowConfig {
            use_barnes_hut: false,
            use_multigrid: false,
            ..FlowConfig::default()
        };
        let mut solver = FlowSolver::new(circle(24), config).unwrap();
        let r = solver.step().unwrap();
        assert!(r.good_step);
        assert!(r.energy_after < r.energy_before);
    }
}
