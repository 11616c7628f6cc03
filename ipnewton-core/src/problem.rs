//! Problem data structures, solver settings, and validation.
//!
//! This module defines the canonical optimization problem representation and
//! all associated types. The solver works with the formulation
//!
//! ```text
//! minimize    f(x, p)
//! subject to  Ax·x + Ap·p = b
//!             h(x, p) = 0
//!             v(x, p) = 0
//!             xlower ≤ x ≤ xupper
//! ```
//!
//! where x are the primal variables, p are parameters solved jointly with x
//! through the coupling equations v, and w = (y, z) collects the multipliers
//! of the linear and nonlinear equality constraints.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::kkt::KktMethod;

/// Problem dimensions, immutable after construction.
///
/// - `nx`: primal variables
/// - `np`: parameters solved jointly with x
/// - `ny`: linear equality constraints
/// - `nz`: nonlinear equality constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub nx: usize,
    pub np: usize,
    pub ny: usize,
    pub nz: usize,
}

impl Dims {
    pub fn new(nx: usize, np: usize, ny: usize, nz: usize) -> Self {
        Self { nx, np, ny, nz }
    }

    /// Number of equality-constraint multipliers, nw = ny + nz.
    pub fn nw(&self) -> usize {
        self.ny + self.nz
    }
}

/// Selects which quantities a callback must fill in.
#[derive(Debug, Clone, Copy)]
pub struct EvalRequest {
    /// Function value (f, h or v).
    pub value: bool,
    /// First and second derivatives (gradient/Hessian or Jacobians).
    pub derivatives: bool,
}

/// Result slots for an objective evaluation f(x, p).
///
/// Owned by the solver and handed to the callback as a mutable slot; the
/// callback never allocates.
#[derive(Debug, Clone)]
pub struct ObjectiveResult {
    /// Objective value f(x, p).
    pub f: f64,
    /// Gradient ∂f/∂x (length nx).
    pub fx: DVector<f64>,
    /// Gradient ∂f/∂p (length np).
    pub fp: DVector<f64>,
    /// Hessian block ∂²f/∂x² (nx×nx).
    pub fxx: DMatrix<f64>,
    /// Hessian block ∂²f/∂x∂p (nx×np).
    pub fxp: DMatrix<f64>,
    /// Set when fxx is diagonal; enables the rangespace KKT reduction.
    pub fxx_diagonal: bool,
}

impl ObjectiveResult {
    pub fn zeros(dims: Dims) -> Self {
        Self {
            f: 0.0,
            fx: DVector::zeros(dims.nx),
            fp: DVector::zeros(dims.np),
            fxx: DMatrix::zeros(dims.nx, dims.nx),
            fxp: DMatrix::zeros(dims.nx, dims.np),
            fxx_diagonal: false,
        }
    }
}

/// Result slots for a constraint evaluation h(x, p) or v(x, p).
#[derive(Debug, Clone)]
pub struct ConstraintResult {
    /// Constraint values (length nz for h, np for v).
    pub val: DVector<f64>,
    /// Jacobian w.r.t. x.
    pub ddx: DMatrix<f64>,
    /// Jacobian w.r.t. p.
    pub ddp: DMatrix<f64>,
}

impl ConstraintResult {
    pub fn zeros(rows: usize, dims: Dims) -> Self {
        Self {
            val: DVector::zeros(rows),
            ddx: DMatrix::zeros(rows, dims.nx),
            ddp: DMatrix::zeros(rows, dims.np),
        }
    }
}

/// Objective callback: fills `out` at (x, p), returns false on failure.
pub type ObjectiveFn =
    Box<dyn Fn(&DVector<f64>, &DVector<f64>, &EvalRequest, &mut ObjectiveResult) -> bool + Send>;

/// Constraint callback (h or v): fills `out` at (x, p), returns false on failure.
pub type ConstraintFn =
    Box<dyn Fn(&DVector<f64>, &DVector<f64>, &EvalRequest, &mut ConstraintResult) -> bool + Send>;

/// Master optimization problem.
///
/// The Ax/Ap blocks and b are fixed for the lifetime of the problem; the
/// callbacks are invoked each iteration with read-only views of the iterate.
pub struct MasterProblem {
    pub dims: Dims,
    /// Fixed coefficient block of the linear constraints w.r.t. x (ny×nx).
    pub ax: DMatrix<f64>,
    /// Fixed coefficient block of the linear constraints w.r.t. p (ny×np).
    pub ap: DMatrix<f64>,
    /// Right-hand side of the linear constraints (length ny).
    pub b: DVector<f64>,
    /// Lower bounds on x; -inf marks an absent bound.
    pub xlower: DVector<f64>,
    /// Upper bounds on x; +inf marks an absent bound.
    pub xupper: DVector<f64>,
    /// Objective f(x, p).
    pub f: ObjectiveFn,
    /// Nonlinear equality constraints h(x, p) = 0; required when nz > 0.
    pub h: Option<ConstraintFn>,
    /// Parameter coupling v(x, p) = 0; required when np > 0.
    pub v: Option<ConstraintFn>,
}

impl fmt::Debug for MasterProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterProblem")
            .field("dims", &self.dims)
            .field("has_h", &self.h.is_some())
            .field("has_v", &self.v.is_some())
            .finish()
    }
}

/// Problem validation errors (precondition violations, fatal before iteration 1).
#[derive(Error, Debug)]
pub enum ProblemError {
    #[error("{what} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("variable {index} has lower bound {lower} above upper bound {upper}")]
    InfeasibleBounds {
        index: usize,
        lower: f64,
        upper: f64,
    },

    #[error("missing {which} callback (required when {dim} > 0)")]
    MissingCallback { which: &'static str, dim: &'static str },

    #[error("problem has more equality constraints ({nw}) than primal variables ({nx})")]
    TooManyConstraints { nw: usize, nx: usize },

    #[error("right-hand side b contains non-finite values")]
    NonFiniteRhs,
}

impl MasterProblem {
    /// Validate dimensions, bounds, and callback presence.
    pub fn validate(&self) -> Result<(), ProblemError> {
        let Dims { nx, np, ny, nz } = self.dims;

        let checks: [(&'static str, usize, usize); 7] = [
            ("Ax rows", ny, self.ax.nrows()),
            ("Ax cols", nx, self.ax.ncols()),
            ("Ap rows", ny, self.ap.nrows()),
            ("Ap cols", np, self.ap.ncols()),
            ("b", ny, self.b.len()),
            ("xlower", nx, self.xlower.len()),
            ("xupper", nx, self.xupper.len()),
        ];
        for (what, expected, actual) in checks {
            if expected != actual {
                return Err(ProblemError::DimensionMismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }

        if ny + nz > nx {
            return Err(ProblemError::TooManyConstraints { nw: ny + nz, nx });
        }

        for i in 0..nx {
            if self.xlower[i] > self.xupper[i] {
                return Err(ProblemError::InfeasibleBounds {
                    index: i,
                    lower: self.xlower[i],
                    upper: self.xupper[i],
                });
            }
        }

        if self.b.iter().any(|v| !v.is_finite()) {
            return Err(ProblemError::NonFiniteRhs);
        }

        if nz > 0 && self.h.is_none() {
            return Err(ProblemError::MissingCallback { which: "h", dim: "nz" });
        }
        if np > 0 && self.v.is_none() {
            return Err(ProblemError::MissingCallback { which: "v", dim: "np" });
        }

        Ok(())
    }
}

/// The available stepping modes for the Newton update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Accept the full step, then project each component onto its bound.
    /// Components that would cross are clamped, the rest move freely.
    Aggressive,
    /// Scale the whole step by the fraction-to-the-boundary length so the
    /// direction is preserved.
    Conservative,
}

/// Options for the line-search trigger on the monitored error norm.
#[derive(Debug, Clone)]
pub struct LineSearchSettings {
    /// Maximum number of step halvings.
    pub maxiters: usize,
    /// Trigger when the trial error exceeds the initial error by this factor.
    pub trigger_ratio_vs_initial: f64,
    /// Trigger when the trial error exceeds the previous error by this factor.
    pub trigger_ratio_vs_previous: f64,
}

impl Default for LineSearchSettings {
    fn default() -> Self {
        Self {
            maxiters: 5,
            trigger_ratio_vs_initial: 1.0,
            trigger_ratio_vs_previous: 10.0,
        }
    }
}

/// Options for the backtrack search used when a trial iterate produces a
/// failed or non-finite evaluation.
#[derive(Debug, Clone)]
pub struct BacktrackSettings {
    /// Factor in (0, 1) applied to the step length on each backtrack.
    pub factor: f64,
    /// Maximum number of backtrack steps.
    pub maxiters: usize,
}

impl Default for BacktrackSettings {
    fn default() -> Self {
        Self {
            factor: 0.1,
            maxiters: 10,
        }
    }
}

/// Options for the KKT solve.
#[derive(Debug, Clone)]
pub struct KktSettings {
    /// Saddle-point reduction strategy.
    pub method: KktMethod,

    /// Re-use the previous factorization while the max column change of Jx
    /// stays below this threshold (0 = refactor every iteration).
    pub refactor_threshold: f64,
}

impl Default for KktSettings {
    fn default() -> Self {
        Self {
            method: KktMethod::Rangespace,
            refactor_threshold: 0.0,
        }
    }
}

/// Solver settings and parameters.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Tolerance for the residual of the optimality/feasibility conditions.
    pub tolerance: f64,

    /// Stop when max|dx| falls below this value (0 = disabled).
    pub tolerance_x: f64,

    /// Stop when |f - fprev| falls below this value (0 = disabled).
    pub tolerance_f: f64,

    /// Maximum number of outer Newton iterations.
    pub max_iterations: usize,

    /// Perturbation parameter; also the bound-proximity epsilon used by the
    /// stability classifier.
    pub mu: f64,

    /// Fraction-to-the-boundary parameter. The closer to one, the more likely
    /// a variable is driven prematurely to a bound and trapped there.
    pub tau: f64,

    /// Step mode for the Newton updates.
    pub step_mode: StepMode,

    /// Options for the solution of the KKT equations.
    pub kkt: KktSettings,

    /// Options for the line-search minimization operation.
    pub linesearch: LineSearchSettings,

    /// Options for the backtrack search operation.
    pub backtrack: BacktrackSettings,

    /// Proximal regularization added to near-zero Hessian diagonal entries so
    /// that LP-like blocks stay factorizable. Enters only as a proximal term,
    /// exact at a fixed point of the iteration.
    pub proximal_rho: f64,

    /// Print one line per iteration to stderr.
    pub verbose: bool,

    /// Wall-time limit in milliseconds (None = no limit).
    pub time_limit_ms: Option<u64>,

    /// Cooperative cancellation flag, polled between iterations.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        // Environment override mirrors how the tuning knobs of the KKT layer
        // are exposed elsewhere in the workspace.
        let proximal_rho = std::env::var("IPNEWTON_PROXIMAL_RHO")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(1.0);

        Self {
            tolerance: 1e-6,
            tolerance_x: 0.0,
            tolerance_f: 0.0,
            max_iterations: 200,
            mu: 1e-20,
            tau: 0.99,
            step_mode: StepMode::Aggressive,
            kkt: KktSettings::default(),
            linesearch: LineSearchSettings::default(),
            backtrack: BacktrackSettings::default(),
            proximal_rho,
            verbose: false,
            time_limit_ms: None,
            cancel: None,
        }
    }
}

/// Result of an optimization calculation.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    /// Whether the calculation converged.
    pub succeeded: bool,

    /// Reason for a failed calculation, when `succeeded` is false.
    pub failure_reason: Option<String>,

    /// Number of outer iterations performed.
    pub iterations: usize,

    /// Final residual error max(optimality, feasibility).
    pub error: f64,

    /// Final first-order optimality error.
    pub error_optimality: f64,

    /// Final feasibility error.
    pub error_feasibility: f64,

    /// Number of objective evaluations.
    pub num_objective_evals: usize,

    /// Number of constraint (h) evaluations.
    pub num_constraint_evals: usize,

    /// Number of coupling (v) evaluations.
    pub num_coupling_evals: usize,

    /// Total wall time of the calculation.
    pub time: std::time::Duration,

    /// Wall-time breakdown by phase.
    pub timers: crate::perf::PerfTimers,
}
