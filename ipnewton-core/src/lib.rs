//! ipnewton: an interior-point / active-set Newton engine for constrained
//! nonlinear optimization.
//!
//! The engine solves problems of the form
//!
//! ```text
//! minimize    f(x, p)
//! subject to  Ax·x + Ap·p = b
//!             h(x, p) = 0
//!             v(x, p) = 0
//!             xlower ≤ x ≤ xupper
//! ```
//!
//! with a Newton iteration whose inner loop is dominated by a saddle-point
//! (KKT) linear system. Key features:
//!
//! - **Incremental canonical forms**: the constraint matrix W = [Ax; Jx] is
//!   kept in weighted echelon form R·W·Q = [I S] across iterations, so the
//!   KKT factorization tracks the active partition instead of starting over.
//! - **Stability classification**: primal variables pinned against their
//!   bounds are excluded from the linear system and re-admitted when the
//!   Lagrangian gradient lets them move inward.
//! - **Three saddle-point strategies**: fullspace LU, rangespace Schur
//!   complement (LDL^T, for diagonal Hessians), and nullspace reduction.
//! - **Parameter sensitivities**: after convergence, ∂(x, p, w)/∂c by
//!   re-solving the cached factorization with differentiated right-hand
//!   sides.
//!
//! # Example
//!
//! ```ignore
//! use ipnewton_core::{Dims, MasterProblem, Solver, State};
//!
//! // minimize ½‖x‖² subject to x₀ + x₁ = 2
//! let problem = MasterProblem { /* dims, Ax, b, bounds, callbacks */ };
//! let mut solver = Solver::new(problem)?;
//! let mut state = State::new(dims);
//! let result = solver.solve(&mut state)?;
//!
//! assert!(result.succeeded);
//! println!("x = {:?}", state.u.x);
//! ```

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)] // KKT assembly routines carry many blocks
#![allow(clippy::needless_range_loop)] // index loops mirror the block algebra

pub mod diagnostics;
pub mod kkt;
pub mod linalg;
pub mod perf;
pub mod problem;
pub mod residual;
pub mod sensitivity;
pub mod solver;
pub mod stability;
pub mod state;
pub mod stepper;

pub use kkt::{KktError, KktMethod, SaddlePointSolver};
pub use problem::{
    BacktrackSettings, ConstraintFn, ConstraintResult, Dims, EvalRequest, KktSettings,
    LineSearchSettings, MasterProblem, ObjectiveFn, ObjectiveResult, ProblemError, SolveResult,
    SolverSettings, StepMode,
};
pub use residual::{ResidualErrors, ResidualFunction, UpdateStatus};
pub use sensitivity::{SensitivityError, SensitivityRhs};
pub use solver::{Solver, SolverError};
pub use stability::{StabilityClassifier, StabilityError, StabilityStatus};
pub use state::{MasterVector, Sensitivities, State};
pub use stepper::Stepper;
