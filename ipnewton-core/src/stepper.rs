//! Newton step assembly and application.
//!
//! Coordinates the stability classifier and the saddle-point solver: each
//! iteration the variables are reclassified, W is re-echelonized under fresh
//! priority weights, the KKT system is factored and solved for the next
//! iterates, and the step is applied under one of two modes. The solver
//! computes (x̄, w̄) directly instead of (dx, dw); differences of nearly equal
//! iterates on the right-hand side would otherwise lose the small residuals
//! that drive the last iterations.

use nalgebra::DVector;

use crate::kkt::{KktAssembly, KktError, KktMethod, SaddlePointSolver};
use crate::problem::{Dims, MasterProblem, SolverSettings, StepMode};
use crate::residual::ResidualFunction;
use crate::stability::{StabilityClassifier, StabilityError, StabilityStatus};
use crate::state::MasterVector;

#[derive(Debug)]
pub struct Stepper {
    dims: Dims,
    pub classifier: StabilityClassifier,
    pub kkt: SaddlePointSolver,
    /// Solution of the saddle-point problem (the candidate next iterates).
    ubar: MasterVector,
    /// Newton step du = ū − u, with frozen components zeroed.
    du: MasterVector,
}

impl Stepper {
    pub fn new(dims: Dims, method: KktMethod, classifier_eps: f64) -> Self {
        Self {
            dims,
            classifier: StabilityClassifier::new(dims.nx, classifier_eps),
            kkt: SaddlePointSolver::new(dims, method),
            ubar: MasterVector::zeros(dims),
            du: MasterVector::zeros(dims),
        }
    }

    /// Clamp the initial guess into the bounds, detect strictly unstable
    /// variables, and pin them to their bounds.
    pub fn initialize(
        &mut self,
        problem: &MasterProblem,
        u: &mut MasterVector,
    ) -> Result<(), StabilityError> {
        for i in 0..self.dims.nx {
            u.x[i] = u.x[i].max(problem.xlower[i]).min(problem.xupper[i]);
        }

        self.classifier
            .initialize(&problem.ax, &problem.b, &problem.xlower, &problem.xupper)?;

        for (i, s) in self.classifier.status().iter().enumerate() {
            match s {
                StabilityStatus::StrictlyLowerUnstable => u.x[i] = problem.xlower[i],
                StabilityStatus::StrictlyUpperUnstable => u.x[i] = problem.xupper[i],
                _ => {}
            }
        }
        Ok(())
    }

    /// Reclassify the variables from the current instability measure.
    pub fn classify(
        &mut self,
        rf: &mut ResidualFunction,
        problem: &MasterProblem,
        u: &MasterVector,
    ) {
        rf.compute_z(u);
        self.classifier
            .update(&u.x, &rf.z, &problem.xlower, &problem.xupper);
    }

    pub fn status(&self) -> &[StabilityStatus] {
        self.classifier.status()
    }

    /// Re-echelonize W and factor the KKT system for the current iterate.
    pub fn decompose(
        &mut self,
        rf: &ResidualFunction,
        u: &MasterVector,
        settings: &SolverSettings,
    ) -> Result<(), KktError> {
        self.kkt.decompose(KktAssembly {
            hxx: &rf.fres.fxx,
            hxx_diagonal: rf.fres.fxx_diagonal,
            hxp: &rf.fres.fxp,
            vx: &rf.vres.ddx,
            vp: &rf.vres.ddp,
            wx: &rf.wx,
            wp: &rf.wp,
            x: &u.x,
            weights: &rf.weights,
            stable: self.classifier.stable_indices(),
            unstable: self.classifier.unstable_indices(),
            proximal_rho: settings.proximal_rho,
        })
    }

    /// Solve for the Newton step. NaN solution components signal variables
    /// tied to linearly dependent constraint rows; their steps are zeroed so
    /// they stay frozen for this iteration.
    pub fn solve(
        &mut self,
        rf: &ResidualFunction,
        problem: &MasterProblem,
        u: &MasterVector,
    ) -> Result<&MasterVector, KktError> {
        self.kkt.solve(
            &rf.fres.fx,
            &problem.b,
            &rf.hres.val,
            &rf.vres.val,
            u,
            &mut self.ubar,
        )?;

        for i in 0..self.dims.nx {
            let d = self.ubar.x[i] - u.x[i];
            self.du.x[i] = if d.is_nan() { 0.0 } else { d };
        }
        for k in 0..self.dims.np {
            let d = self.ubar.p[k] - u.p[k];
            self.du.p[k] = if d.is_nan() { 0.0 } else { d };
        }
        for r in 0..self.dims.nw() {
            let d = self.ubar.w[r] - u.w[r];
            self.du.w[r] = if d.is_nan() { 0.0 } else { d };
        }
        for &j in self.classifier.unstable_indices() {
            self.du.x[j] = 0.0;
        }
        Ok(&self.du)
    }

    pub fn step(&self) -> &MasterVector {
        &self.du
    }

    /// Largest α ∈ (0, 1] keeping x + α·dx inside the τ-relaxed bound box.
    pub fn fraction_to_boundary(&self, problem: &MasterProblem, u: &MasterVector, tau: f64) -> f64 {
        let mut alpha = 1.0_f64;
        for i in 0..self.dims.nx {
            let dx = self.du.x[i];
            if dx < 0.0 {
                let gap = u.x[i] - problem.xlower[i];
                if gap.is_finite() {
                    alpha = alpha.min(tau * gap / -dx);
                }
            } else if dx > 0.0 {
                let gap = problem.xupper[i] - u.x[i];
                if gap.is_finite() {
                    alpha = alpha.min(tau * gap / dx);
                }
            }
        }
        alpha.clamp(0.0, 1.0)
    }

    /// Apply the step with length α into `out`.
    ///
    /// Aggressive mode projects each trial component onto its bound, so
    /// components that would cross are clamped while the rest move freely;
    /// conservative mode relies on the caller passing α from
    /// `fraction_to_boundary` so the direction is preserved.
    pub fn apply(
        &self,
        problem: &MasterProblem,
        u: &MasterVector,
        alpha: f64,
        mode: StepMode,
        out: &mut MasterVector,
    ) {
        for i in 0..self.dims.nx {
            let mut xi = u.x[i] + alpha * self.du.x[i];
            if matches!(mode, StepMode::Aggressive) {
                xi = xi.max(problem.xlower[i]).min(problem.xupper[i]);
            }
            out.x[i] = xi;
        }
        out.p.copy_from(&u.p);
        out.p.axpy(alpha, &self.du.p, 1.0);
        out.w.copy_from(&u.w);
        out.w.axpy(alpha, &self.du.w, 1.0);

        // Strictly unstable variables never leave their bounds.
        for (i, s) in self.classifier.status().iter().enumerate() {
            match s {
                StabilityStatus::StrictlyLowerUnstable => out.x[i] = problem.xlower[i],
                StabilityStatus::StrictlyUpperUnstable => out.x[i] = problem.xupper[i],
                _ => {}
            }
        }
    }

    /// Steepest descent direction of the Lagrangian, used as a diagnostic
    /// fallback direction: dx = −z (zero at unstable variables) and
    /// dw = −[Ax·x + Ap·p − b; h].
    pub fn steepest_descent_lagrange(
        &self,
        rf: &ResidualFunction,
        problem: &MasterProblem,
        u: &MasterVector,
        dx: &mut DVector<f64>,
        dw: &mut DVector<f64>,
    ) {
        dx.copy_from(&rf.z);
        dx.neg_mut();
        for &j in self.classifier.unstable_indices() {
            dx[j] = 0.0;
        }

        let ry_lin = &problem.ax * &u.x + &problem.ap * &u.p - &problem.b;
        for r in 0..self.dims.ny {
            dw[r] = -ry_lin[r];
        }
        for r in 0..self.dims.nz {
            dw[self.dims.ny + r] = -rf.hres.val[r];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn bounded_problem() -> MasterProblem {
        let dims = Dims::new(2, 0, 1, 0);
        MasterProblem {
            dims,
            ax: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            ap: DMatrix::zeros(1, 0),
            b: DVector::from_row_slice(&[1.0]),
            xlower: DVector::from_row_slice(&[0.0, 0.0]),
            xupper: DVector::from_row_slice(&[2.0, 2.0]),
            f: Box::new(|x, _p, req, out| {
                out.f = 0.5 * x.dot(x);
                if req.derivatives {
                    out.fx.copy_from(x);
                    out.fxx.fill_with_identity();
                    out.fxx_diagonal = true;
                }
                true
            }),
            h: None,
            v: None,
        }
    }

    fn stepper_with_step(problem: &MasterProblem, dx: &[f64]) -> Stepper {
        let mut stepper = Stepper::new(problem.dims, KktMethod::Rangespace, 1e-15);
        for (i, &d) in dx.iter().enumerate() {
            stepper.du.x[i] = d;
        }
        stepper
    }

    #[test]
    fn test_fraction_to_boundary() {
        let problem = bounded_problem();
        let stepper = stepper_with_step(&problem, &[-1.0, 0.5]);
        let mut u = MasterVector::zeros(problem.dims);
        u.x[0] = 0.5;
        u.x[1] = 0.5;

        // x0 hits its lower bound at α = 0.5; with τ = 0.99 the step stops
        // just short of it.
        let alpha = stepper.fraction_to_boundary(&problem, &u, 0.99);
        assert!((alpha - 0.495).abs() < 1e-12, "alpha = {alpha}");
    }

    #[test]
    fn test_fraction_to_boundary_interior_step_is_full() {
        let problem = bounded_problem();
        let stepper = stepper_with_step(&problem, &[0.1, -0.1]);
        let mut u = MasterVector::zeros(problem.dims);
        u.x[0] = 1.0;
        u.x[1] = 1.0;
        assert_eq!(stepper.fraction_to_boundary(&problem, &u, 0.99), 1.0);
    }

    #[test]
    fn test_apply_aggressive_clamps_crossing_components() {
        let problem = bounded_problem();
        let stepper = stepper_with_step(&problem, &[-2.0, 0.5]);
        let mut u = MasterVector::zeros(problem.dims);
        u.x[0] = 0.5;
        u.x[1] = 0.5;

        let mut out = MasterVector::zeros(problem.dims);
        stepper.apply(&problem, &u, 1.0, StepMode::Aggressive, &mut out);
        assert_eq!(out.x[0], 0.0, "crossing component clamps to its bound");
        assert!((out.x[1] - 1.0).abs() < 1e-15, "free component moves fully");
    }

    #[test]
    fn test_apply_conservative_preserves_direction() {
        let problem = bounded_problem();
        let stepper = stepper_with_step(&problem, &[-1.0, 0.5]);
        let mut u = MasterVector::zeros(problem.dims);
        u.x[0] = 0.5;
        u.x[1] = 0.5;

        let alpha = stepper.fraction_to_boundary(&problem, &u, 0.99);
        let mut out = MasterVector::zeros(problem.dims);
        stepper.apply(&problem, &u, alpha, StepMode::Conservative, &mut out);
        let r0 = (out.x[0] - u.x[0]) / -1.0;
        let r1 = (out.x[1] - u.x[1]) / 0.5;
        assert!((r0 - r1).abs() < 1e-12, "direction not preserved: {r0} vs {r1}");
    }

    #[test]
    fn test_steepest_descent_lagrange() {
        let problem = bounded_problem();
        let mut rf = ResidualFunction::new(&problem);
        let mut u = MasterVector::zeros(problem.dims);
        u.x[0] = 0.5;
        u.x[1] = 0.2;
        rf.update(&problem, &u);
        rf.compute_z(&u);

        let stepper = Stepper::new(problem.dims, KktMethod::Rangespace, 1e-15);
        let mut dx = DVector::zeros(2);
        let mut dw = DVector::zeros(1);
        stepper.steepest_descent_lagrange(&rf, &problem, &u, &mut dx, &mut dw);

        // dx = −g (w = 0) and dw = −(Ax·x − b).
        assert!((dx[0] + 0.5).abs() < 1e-15);
        assert!((dx[1] + 0.2).abs() < 1e-15);
        assert!((dw[0] - 0.3).abs() < 1e-12);
    }
}
