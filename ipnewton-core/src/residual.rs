//! Residual function: user evaluations and residual assembly.
//!
//! Owns the evaluation slots for f, h, v, keeps the coefficient matrix
//! W = [Ax; Jx] current, derives the priority weights for the echelonizer,
//! and assembles the first-order optimality and feasibility residuals. Each
//! evaluation returns a per-callback status; a failed evaluation aborts the
//! step so the caller can shrink the step length and retry from the last
//! accepted iterate.

use nalgebra::{DMatrix, DVector};

use crate::problem::{
    ConstraintResult, Dims, EvalRequest, MasterProblem, ObjectiveResult,
};
use crate::stability::StabilityStatus;
use crate::state::MasterVector;

/// Per-callback evaluation status.
#[derive(Debug, Clone, Copy)]
pub struct UpdateStatus {
    pub f: bool,
    pub h: bool,
    pub v: bool,
}

impl UpdateStatus {
    pub fn ok(&self) -> bool {
        self.f && self.h && self.v
    }
}

/// Residual norms monitored by the outer loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidualErrors {
    /// ‖rx‖∞ of the first-order optimality residual (zero at unstable variables).
    pub optimality: f64,
    /// ‖ry‖∞ of the linear/nonlinear feasibility residual (including v).
    pub feasibility: f64,
    /// max(optimality, feasibility), the convergence measure.
    pub error: f64,
}

/// Evaluation cache and residual assembly.
#[derive(Debug)]
pub struct ResidualFunction {
    dims: Dims,
    /// Objective evaluation slots.
    pub fres: ObjectiveResult,
    /// Nonlinear constraint evaluation slots.
    pub hres: ConstraintResult,
    /// Parameter coupling evaluation slots.
    pub vres: ConstraintResult,
    /// W = [Ax; Jx]; the top block is fixed, the bottom re-filled per update.
    pub wx: DMatrix<f64>,
    /// [Ap; Jp].
    pub wp: DMatrix<f64>,
    /// Priority weights for the echelonizer column ordering.
    pub weights: DVector<f64>,
    /// Instability measure z = g + Wᵀ·w at the last `compute_errors` call.
    pub z: DVector<f64>,
    /// Previous Jx, for the material-change refactorization trigger.
    prev_jx: DMatrix<f64>,
    jx_change: f64,
    pub num_objective_evals: usize,
    pub num_constraint_evals: usize,
    pub num_coupling_evals: usize,
}

impl ResidualFunction {
    pub fn new(problem: &MasterProblem) -> Self {
        let dims = problem.dims;
        let nw = dims.nw();
        let mut wx = DMatrix::zeros(nw, dims.nx);
        let mut wp = DMatrix::zeros(nw, dims.np);
        wx.rows_mut(0, dims.ny).copy_from(&problem.ax);
        wp.rows_mut(0, dims.ny).copy_from(&problem.ap);

        Self {
            dims,
            fres: ObjectiveResult::zeros(dims),
            hres: ConstraintResult::zeros(dims.nz, dims),
            vres: ConstraintResult::zeros(dims.np, dims),
            wx,
            wp,
            weights: DVector::zeros(dims.nx),
            z: DVector::zeros(dims.nx),
            prev_jx: DMatrix::zeros(dims.nz, dims.nx),
            // Without nonlinear constraints W never changes between updates.
            jx_change: if dims.nz == 0 { 0.0 } else { f64::INFINITY },
            num_objective_evals: 0,
            num_constraint_evals: 0,
            num_coupling_evals: 0,
        }
    }

    /// Full evaluation including Jacobians.
    pub fn update(&mut self, problem: &MasterProblem, u: &MasterVector) -> UpdateStatus {
        self.evaluate(problem, u, true)
    }

    /// Function values only; Jacobians are reused from the last full update.
    pub fn update_skip_jacobian(
        &mut self,
        problem: &MasterProblem,
        u: &MasterVector,
    ) -> UpdateStatus {
        self.evaluate(problem, u, false)
    }

    fn evaluate(
        &mut self,
        problem: &MasterProblem,
        u: &MasterVector,
        derivatives: bool,
    ) -> UpdateStatus {
        let req = EvalRequest {
            value: true,
            derivatives,
        };
        let mut status = UpdateStatus {
            f: true,
            h: true,
            v: true,
        };

        self.num_objective_evals += 1;
        status.f = (problem.f)(&u.x, &u.p, &req, &mut self.fres);
        if !status.f {
            return status;
        }

        if self.dims.nz > 0 {
            let h = problem.h.as_ref().expect("validated: h callback present");
            self.num_constraint_evals += 1;
            status.h = h(&u.x, &u.p, &req, &mut self.hres);
            if !status.h {
                return status;
            }
        }

        if self.dims.np > 0 {
            let v = problem.v.as_ref().expect("validated: v callback present");
            self.num_coupling_evals += 1;
            status.v = v(&u.x, &u.p, &req, &mut self.vres);
            if !status.v {
                return status;
            }
        }

        if derivatives && self.dims.nz > 0 {
            // Track how much Jx moved before overwriting the W block.
            let mut change = 0.0_f64;
            for c in 0..self.dims.nx {
                let mut colmax = 0.0_f64;
                for r in 0..self.dims.nz {
                    colmax = colmax.max((self.hres.ddx[(r, c)] - self.prev_jx[(r, c)]).abs());
                }
                change = change.max(colmax);
            }
            self.jx_change = change;
            self.prev_jx.copy_from(&self.hres.ddx);

            self.wx
                .rows_mut(self.dims.ny, self.dims.nz)
                .copy_from(&self.hres.ddx);
            self.wp
                .rows_mut(self.dims.ny, self.dims.nz)
                .copy_from(&self.hres.ddp);
        }

        self.update_weights_from(problem, u);
        status
    }

    /// Priority weights: distance to the nearest bound, |x| when unbounded,
    /// and negative for variables sitting on a bound so they drop out of the
    /// basic set.
    fn update_weights_from(&mut self, problem: &MasterProblem, u: &MasterVector) {
        for i in 0..self.dims.nx {
            let mut w = (u.x[i] - problem.xlower[i]).min(problem.xupper[i] - u.x[i]);
            if !w.is_finite() {
                w = u.x[i].abs();
            }
            self.weights[i] = if w > 0.0 { w } else { -1.0 };
        }
    }

    /// Max column-wise change of Jx between the two latest full updates.
    pub fn jacobian_change(&self) -> f64 {
        self.jx_change
    }

    /// Recompute the instability measure z = g + Wᵀ·w at the given iterate.
    pub fn compute_z(&mut self, u: &MasterVector) -> &DVector<f64> {
        let Dims { nx, ny, nz, .. } = self.dims;
        self.z.copy_from(&self.fres.fx);
        for r in 0..ny + nz {
            let wr = u.w[r];
            if wr != 0.0 {
                for i in 0..nx {
                    self.z[i] += self.wx[(r, i)] * wr;
                }
            }
        }
        &self.z
    }

    /// Assemble the residual norms at the current evaluation point.
    ///
    /// The optimality residual of unstable variables is zeroed so that they
    /// are not taken into account when checking for convergence.
    pub fn compute_errors(
        &mut self,
        problem: &MasterProblem,
        u: &MasterVector,
        stability: &[StabilityStatus],
    ) -> ResidualErrors {
        let Dims { nx, .. } = self.dims;
        self.compute_z(u);

        let mut optimality = 0.0_f64;
        for i in 0..nx {
            if !stability[i].is_unstable() {
                optimality = optimality.max(self.z[i].abs());
            }
        }

        let mut feasibility = 0.0_f64;
        let ry_lin = &problem.ax * &u.x + &problem.ap * &u.p - &problem.b;
        for v in ry_lin.iter() {
            feasibility = feasibility.max(v.abs());
        }
        for v in self.hres.val.iter() {
            feasibility = feasibility.max(v.abs());
        }
        for v in self.vres.val.iter() {
            feasibility = feasibility.max(v.abs());
        }

        ResidualErrors {
            optimality,
            feasibility,
            error: optimality.max(feasibility),
        }
    }
}
