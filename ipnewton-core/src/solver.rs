//! Outer Newton iteration.
//!
//! Drives one strict sequence per iteration: evaluate → classify →
//! echelonize → factor → solve → step. Convergence is declared when
//! max(‖rx‖∞, ‖ry‖∞) falls below the tolerance. Failed or non-finite trial
//! evaluations back off the step length; a growing error norm triggers the
//! step-halving line search. Precondition violations surface as `Err`;
//! numerical failures come back as `succeeded = false` with a reason, and the
//! state keeps the last accepted iterate.

use std::sync::atomic::Ordering;
use std::time::Instant;

use thiserror::Error;

use crate::diagnostics::DiagnosticsConfig;
use crate::kkt::KktError;
use crate::perf::{PerfSection, PerfTimers};
use crate::problem::{MasterProblem, ProblemError, SolveResult, SolverSettings, StepMode};
use crate::residual::ResidualFunction;
use crate::sensitivity::{compute_sensitivities, SensitivityError, SensitivityRhs};
use crate::stability::StabilityError;
use crate::state::{MasterVector, State};
use crate::stepper::Stepper;

/// Fatal (precondition-class) solver errors.
#[derive(Error, Debug)]
pub enum SolverError {
    #[error(transparent)]
    Problem(#[from] ProblemError),

    #[error(transparent)]
    Stability(#[from] StabilityError),

    #[error("initial guess contains non-finite values")]
    NonFiniteInitialGuess,

    #[error("objective/constraint evaluation failed at the initial point")]
    InitialEvaluationFailed,

    #[error("objective produced non-finite values at the initial point")]
    NonFiniteInitialObjective,

    #[error(transparent)]
    Sensitivity(#[from] SensitivityError),

    #[error(transparent)]
    Kkt(#[from] KktError),
}

/// Solver for master optimization problems.
///
/// All heavy state (echelon form, KKT factors, workspace vectors) lives
/// inside this object and is re-used across iterations and across repeated
/// `solve` calls on the same problem.
pub struct Solver {
    problem: MasterProblem,
    settings: SolverSettings,
    rf: ResidualFunction,
    stepper: Stepper,
    diag: DiagnosticsConfig,
    utrial: MasterVector,
}

impl Solver {
    /// Attach a problem. Validation failures are fatal.
    pub fn new(problem: MasterProblem) -> Result<Self, SolverError> {
        problem.validate()?;
        let settings = SolverSettings::default();
        let dims = problem.dims;
        let stepper = Stepper::new(
            dims,
            settings.kkt.method,
            settings.mu.max(f64::EPSILON),
        );
        let rf = ResidualFunction::new(&problem);
        Ok(Self {
            problem,
            settings,
            rf,
            stepper,
            diag: DiagnosticsConfig::from_env(),
            utrial: MasterVector::zeros(dims),
        })
    }

    pub fn problem(&self) -> &MasterProblem {
        &self.problem
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: SolverSettings) {
        self.settings = settings;
    }

    /// Run the Newton iteration from the iterate in `state`.
    pub fn solve(&mut self, state: &mut State) -> Result<SolveResult, SolverError> {
        let start = Instant::now();
        let mut result = SolveResult::default();
        let mut timers = PerfTimers::default();

        let dims = self.problem.dims;
        if dims.nx == 0 {
            result.succeeded = true;
            result.time = start.elapsed();
            return Ok(result);
        }

        if !state.u.is_finite() {
            return Err(SolverError::NonFiniteInitialGuess);
        }

        self.stepper.classifier.set_eps(self.settings.mu.max(f64::EPSILON));
        self.stepper.kkt.set_method(self.settings.kkt.method);

        let u = &mut state.u;
        self.stepper.initialize(&self.problem, u)?;

        {
            let _g = timers.scoped(PerfSection::FunctionEvals);
            let status = self.rf.update(&self.problem, u);
            if !status.ok() {
                return Err(SolverError::InitialEvaluationFailed);
            }
        }
        if !self.rf.fres.f.is_finite() || self.rf.fres.fx.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteInitialObjective);
        }

        let mut error_initial = f64::INFINITY;
        let mut fprev = self.rf.fres.f;
        let mut iter = 0usize;

        loop {
            let errors = {
                let _g = timers.scoped(PerfSection::Residuals);
                self.stepper.classify(&mut self.rf, &self.problem, u);
                self.rf
                    .compute_errors(&self.problem, u, self.stepper.status())
            };
            result.error = errors.error;
            result.error_optimality = errors.optimality;
            result.error_feasibility = errors.feasibility;
            if iter == 0 {
                error_initial = errors.error;
            }

            if self.diag.should_log(iter) || self.settings.verbose {
                eprintln!(
                    "iter {:4} f={:+.6e} error={:.3e} opt={:.3e} feas={:.3e} nu={} method={:?}",
                    iter,
                    self.rf.fres.f,
                    errors.error,
                    errors.optimality,
                    errors.feasibility,
                    self.stepper.classifier.unstable_indices().len(),
                    self.stepper.kkt.effective_method(),
                );
            }

            if errors.error < self.settings.tolerance {
                result.succeeded = true;
                break;
            }
            if iter >= self.settings.max_iterations {
                result.failure_reason = Some("maximum number of iterations reached".to_string());
                break;
            }
            if let Some(cancel) = &self.settings.cancel {
                if cancel.load(Ordering::Relaxed) {
                    result.failure_reason = Some("cancelled".to_string());
                    break;
                }
            }
            if let Some(limit) = self.settings.time_limit_ms {
                if start.elapsed().as_millis() as u64 >= limit {
                    result.failure_reason = Some("time limit reached".to_string());
                    break;
                }
            }

            iter += 1;
            result.iterations = iter;

            // Factor the KKT system unless the Jacobian barely moved and the
            // settings allow re-using the previous factors.
            let refactor = self.settings.kkt.refactor_threshold <= 0.0
                || self.rf.jacobian_change() >= self.settings.kkt.refactor_threshold
                || iter == 1;
            if refactor {
                let _g = timers.scoped(PerfSection::Factorization);
                if let Err(e) = self.stepper.decompose(&self.rf, u, &self.settings) {
                    result.failure_reason = Some(format!("KKT factorization failed: {e}"));
                    break;
                }
            }

            {
                let _g = timers.scoped(PerfSection::Solve);
                if let Err(e) = self.stepper.solve(&self.rf, &self.problem, u) {
                    result.failure_reason = Some(format!("KKT solve failed: {e}"));
                    break;
                }
            }

            let alpha_full = match self.settings.step_mode {
                StepMode::Aggressive => 1.0,
                StepMode::Conservative => {
                    self.stepper
                        .fraction_to_boundary(&self.problem, u, self.settings.tau)
                }
            };

            // Trial loop: backtrack on failed/non-finite evaluations, halve on
            // a growing error norm, and accept the last trial once the
            // halving allowance is spent.
            let mut alpha = alpha_full;
            let mut backtracks = 0usize;
            let mut halvings = 0usize;
            let trigger = (self.settings.linesearch.trigger_ratio_vs_initial * error_initial)
                .min(self.settings.linesearch.trigger_ratio_vs_previous * errors.error);
            let accepted = loop {
                {
                    let _g = timers.scoped(PerfSection::Stepping);
                    self.stepper.apply(
                        &self.problem,
                        u,
                        alpha,
                        self.settings.step_mode,
                        &mut self.utrial,
                    );
                }

                let status = {
                    let _g = timers.scoped(PerfSection::FunctionEvals);
                    self.rf.update(&self.problem, &self.utrial)
                };
                let finite = status.ok() && self.rf.fres.f.is_finite();
                if !finite {
                    if backtracks < self.settings.backtrack.maxiters {
                        alpha *= self.settings.backtrack.factor;
                        backtracks += 1;
                        continue;
                    }
                    break false;
                }

                let trial_errors = {
                    let _g = timers.scoped(PerfSection::Residuals);
                    self.rf
                        .compute_errors(&self.problem, &self.utrial, self.stepper.status())
                };
                if trial_errors.error > trigger && halvings < self.settings.linesearch.maxiters {
                    alpha *= 0.5;
                    halvings += 1;
                    continue;
                }
                break true;
            };

            if !accepted {
                result.failure_reason =
                    Some("line search could not produce a finite objective".to_string());
                break;
            }

            // Optional stopping rules on the variation of x and f.
            let mut dx_max = 0.0_f64;
            for i in 0..dims.nx {
                dx_max = dx_max.max((self.utrial.x[i] - u.x[i]).abs());
            }
            let f_new = self.rf.fres.f;

            u.x.copy_from(&self.utrial.x);
            u.p.copy_from(&self.utrial.p);
            u.w.copy_from(&self.utrial.w);

            if self.settings.tolerance_x > 0.0 && dx_max < self.settings.tolerance_x {
                let errors = self
                    .rf
                    .compute_errors(&self.problem, u, self.stepper.status());
                result.error = errors.error;
                result.error_optimality = errors.optimality;
                result.error_feasibility = errors.feasibility;
                result.succeeded = true;
                break;
            }
            if self.settings.tolerance_f > 0.0 && (f_new - fprev).abs() < self.settings.tolerance_f
            {
                let errors = self
                    .rf
                    .compute_errors(&self.problem, u, self.stepper.status());
                result.error = errors.error;
                result.error_optimality = errors.optimality;
                result.error_feasibility = errors.feasibility;
                result.succeeded = true;
                break;
            }
            fprev = f_new;
        }

        state.stability = self.stepper.status().to_vec();
        result.num_objective_evals = self.rf.num_objective_evals;
        result.num_constraint_evals = self.rf.num_constraint_evals;
        result.num_coupling_evals = self.rf.num_coupling_evals;
        result.time = start.elapsed();
        result.timers = timers;
        Ok(result)
    }

    /// Differentiate the optimum w.r.t. parameter columns, re-using the KKT
    /// factorization cached by the last solve. Fills `state.sensitivities`.
    pub fn sensitivities(
        &mut self,
        state: &mut State,
        rhs: SensitivityRhs<'_>,
    ) -> Result<(), SolverError> {
        let sens = compute_sensitivities(&mut self.stepper.kkt, self.problem.dims, rhs)?;
        state.sensitivities = Some(sens);
        Ok(())
    }
}
