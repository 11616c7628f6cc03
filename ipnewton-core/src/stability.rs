//! Stability classification of the primal variables.
//!
//! A variable is *unstable* when it sits on one of its bounds and the
//! Lagrangian gradient pushes it further against that bound; such variables
//! are excluded from the KKT system and their Newton-step components forced to
//! zero. The instability measure is z = g + Wᵀ·w.
//!
//! *Strictly* unstable variables are detected once, at initialization, from
//! the linear constraints alone: when the attainable extreme of a canonical
//! constraint row over the bound box equals the right-hand side, every
//! variable whose coefficient forces that extreme must sit on the
//! corresponding bound at any feasible point, and stays pinned for the whole
//! calculation.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::linalg::Echelonizer;

/// Stability status of a primal variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityStatus {
    /// Interior variable, part of the KKT system.
    Stable,
    /// On its lower bound with the gradient pushing below it.
    LowerUnstable,
    /// On its upper bound with the gradient pushing above it.
    UpperUnstable,
    /// Forced onto its lower bound by the constraints themselves.
    StrictlyLowerUnstable,
    /// Forced onto its upper bound by the constraints themselves.
    StrictlyUpperUnstable,
}

impl StabilityStatus {
    pub fn is_unstable(&self) -> bool {
        !matches!(self, StabilityStatus::Stable)
    }

    pub fn is_strictly_unstable(&self) -> bool {
        matches!(
            self,
            StabilityStatus::StrictlyLowerUnstable | StabilityStatus::StrictlyUpperUnstable
        )
    }
}

#[derive(Error, Debug)]
pub enum StabilityError {
    /// A linear constraint row cannot be satisfied inside the bound box.
    #[error("linear constraint row {row} is infeasible within the variable bounds")]
    InfeasibleLinearConstraints { row: usize },
}

/// Classifier for the primal variables.
#[derive(Debug)]
pub struct StabilityClassifier {
    nx: usize,
    /// Bound-proximity epsilon: x is "on" a bound within eps·max(1, |x|).
    eps: f64,
    status: Vec<StabilityStatus>,
    js: Vec<usize>,
    ju: Vec<usize>,
    jsu: Vec<usize>,
    ech: Echelonizer,
}

impl StabilityClassifier {
    /// Change the bound-proximity epsilon.
    pub fn set_eps(&mut self, eps: f64) {
        self.eps = eps;
    }

    pub fn new(nx: usize, eps: f64) -> Self {
        Self {
            nx,
            eps,
            status: vec![StabilityStatus::Stable; nx],
            js: (0..nx).collect(),
            ju: Vec::new(),
            jsu: Vec::new(),
            ech: Echelonizer::new(),
        }
    }

    /// Detect strictly unstable variables from the linear constraints.
    ///
    /// Returns an error when some constraint row cannot be met inside the
    /// bound box at all.
    pub fn initialize(
        &mut self,
        ax: &DMatrix<f64>,
        b: &DVector<f64>,
        xlower: &DVector<f64>,
        xupper: &DVector<f64>,
    ) -> Result<(), StabilityError> {
        for s in self.status.iter_mut() {
            *s = StabilityStatus::Stable;
        }

        let ny = ax.nrows();
        if ny > 0 && self.nx > 0 {
            self.ech.compute(ax);
            let bprime = self.ech.r() * b;
            let rank = self.ech.rank();
            let q = self.ech.q().to_vec();
            let nn = self.nx - rank;

            for i in 0..rank {
                // Canonical row i: x[q[i]] + Σ_j S[i,j]·x[q[rank+j]] = b'[i].
                let mut lo = 0.0_f64;
                let mut hi = 0.0_f64;
                let mut magnitude = 0.0_f64;
                let mut terms: Vec<(usize, f64)> = Vec::with_capacity(1 + nn);
                terms.push((q[i], 1.0));
                for j in 0..nn {
                    let c = self.ech.s()[(i, j)];
                    if c != 0.0 {
                        terms.push((q[rank + j], c));
                    }
                }
                for &(col, c) in &terms {
                    let (tlo, thi) = if c > 0.0 {
                        (c * xlower[col], c * xupper[col])
                    } else {
                        (c * xupper[col], c * xlower[col])
                    };
                    lo += tlo;
                    hi += thi;
                    if tlo.is_finite() {
                        magnitude = magnitude.max(tlo.abs());
                    }
                    if thi.is_finite() {
                        magnitude = magnitude.max(thi.abs());
                    }
                }

                let bi = bprime[i];
                let tol = 10.0 * f64::EPSILON * magnitude.max(bi.abs()).max(1.0);

                if (lo.is_finite() && bi < lo - tol) || (hi.is_finite() && bi > hi + tol) {
                    return Err(StabilityError::InfeasibleLinearConstraints { row: i });
                }

                if lo.is_finite() && (bi - lo).abs() <= tol {
                    // The row is satisfiable only at its minimum: positive
                    // coefficients at the lower bound, negative at the upper.
                    for &(col, c) in &terms {
                        self.status[col] = if c > 0.0 {
                            StabilityStatus::StrictlyLowerUnstable
                        } else {
                            StabilityStatus::StrictlyUpperUnstable
                        };
                    }
                } else if hi.is_finite() && (bi - hi).abs() <= tol {
                    for &(col, c) in &terms {
                        self.status[col] = if c > 0.0 {
                            StabilityStatus::StrictlyUpperUnstable
                        } else {
                            StabilityStatus::StrictlyLowerUnstable
                        };
                    }
                }
            }
        }

        self.rebuild_indices();
        Ok(())
    }

    /// Reclassify the non-strict variables from the current iterate and the
    /// instability measure z = g + Wᵀ·w.
    pub fn update(
        &mut self,
        x: &DVector<f64>,
        z: &DVector<f64>,
        xlower: &DVector<f64>,
        xupper: &DVector<f64>,
    ) {
        for i in 0..self.nx {
            if self.status[i].is_strictly_unstable() {
                continue;
            }
            let tol = self.eps * x[i].abs().max(1.0);
            let near_lower = x[i] - xlower[i] <= tol;
            let near_upper = xupper[i] - x[i] <= tol;
            let lower_fires = near_lower && z[i] >= 0.0;
            let upper_fires = near_upper && z[i] <= 0.0;

            // Degenerate case where both tests fire resolves to Stable to
            // avoid thrashing between the two bounds.
            self.status[i] = match (lower_fires, upper_fires) {
                (true, true) => StabilityStatus::Stable,
                (true, false) => StabilityStatus::LowerUnstable,
                (false, true) => StabilityStatus::UpperUnstable,
                (false, false) => StabilityStatus::Stable,
            };
        }
        self.rebuild_indices();
    }

    fn rebuild_indices(&mut self) {
        self.js.clear();
        self.ju.clear();
        self.jsu.clear();
        for (i, s) in self.status.iter().enumerate() {
            if s.is_unstable() {
                self.ju.push(i);
                if s.is_strictly_unstable() {
                    self.jsu.push(i);
                }
            } else {
                self.js.push(i);
            }
        }
    }

    pub fn status(&self) -> &[StabilityStatus] {
        &self.status
    }

    /// Indices of stable variables.
    pub fn stable_indices(&self) -> &[usize] {
        &self.js
    }

    /// Indices of all unstable variables (ordinary and strict).
    pub fn unstable_indices(&self) -> &[usize] {
        &self.ju
    }

    /// Indices of strictly unstable variables.
    pub fn strictly_unstable_indices(&self) -> &[usize] {
        &self.jsu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unbounded(n: usize) -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_element(n, f64::NEG_INFINITY),
            DVector::from_element(n, f64::INFINITY),
        )
    }

    #[test]
    fn test_update_classifies_bound_states() {
        let mut cls = StabilityClassifier::new(3, 1e-12);
        let xlower = DVector::from_row_slice(&[0.0, 0.0, f64::NEG_INFINITY]);
        let xupper = DVector::from_row_slice(&[2.0, 2.0, f64::INFINITY]);

        // x0 at lower bound pushed down, x1 at upper bound pushed up, x2 interior.
        let x = DVector::from_row_slice(&[0.0, 2.0, 1.0]);
        let z = DVector::from_row_slice(&[1.0, -1.0, 0.5]);
        cls.update(&x, &z, &xlower, &xupper);

        assert_eq!(cls.status()[0], StabilityStatus::LowerUnstable);
        assert_eq!(cls.status()[1], StabilityStatus::UpperUnstable);
        assert_eq!(cls.status()[2], StabilityStatus::Stable);
        assert_eq!(cls.stable_indices(), &[2]);
        assert_eq!(cls.unstable_indices(), &[0, 1]);
    }

    #[test]
    fn test_update_gradient_pulling_inward_is_stable() {
        let mut cls = StabilityClassifier::new(1, 1e-12);
        let xlower = DVector::from_row_slice(&[0.0]);
        let xupper = DVector::from_row_slice(&[2.0]);

        // On the lower bound but the gradient pulls into the interior.
        let x = DVector::from_row_slice(&[0.0]);
        let z = DVector::from_row_slice(&[-1.0]);
        cls.update(&x, &z, &xlower, &xupper);
        assert_eq!(cls.status()[0], StabilityStatus::Stable);
    }

    #[test]
    fn test_update_fixed_variable_tie_breaks_stable() {
        let mut cls = StabilityClassifier::new(1, 1e-12);
        let xlower = DVector::from_row_slice(&[1.0]);
        let xupper = DVector::from_row_slice(&[1.0]);
        let x = DVector::from_row_slice(&[1.0]);
        let z = DVector::from_row_slice(&[0.0]);
        cls.update(&x, &z, &xlower, &xupper);
        assert_eq!(cls.status()[0], StabilityStatus::Stable);
    }

    #[test]
    fn test_initialize_detects_strictly_unstable() {
        // x0 + x1 = 2 with 0 ≤ x ≤ 1 forces both to their upper bounds.
        let ax = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let b = DVector::from_row_slice(&[2.0]);
        let xlower = DVector::from_row_slice(&[0.0, 0.0]);
        let xupper = DVector::from_row_slice(&[1.0, 1.0]);

        let mut cls = StabilityClassifier::new(2, 1e-12);
        cls.initialize(&ax, &b, &xlower, &xupper).unwrap();
        assert_eq!(cls.status()[0], StabilityStatus::StrictlyUpperUnstable);
        assert_eq!(cls.status()[1], StabilityStatus::StrictlyUpperUnstable);
        assert_eq!(cls.strictly_unstable_indices(), &[0, 1]);
    }

    #[test]
    fn test_initialize_infeasible_row() {
        let ax = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let b = DVector::from_row_slice(&[5.0]);
        let xlower = DVector::from_row_slice(&[0.0, 0.0]);
        let xupper = DVector::from_row_slice(&[1.0, 1.0]);

        let mut cls = StabilityClassifier::new(2, 1e-12);
        assert!(matches!(
            cls.initialize(&ax, &b, &xlower, &xupper),
            Err(StabilityError::InfeasibleLinearConstraints { .. })
        ));
    }

    #[test]
    fn test_initialize_unbounded_box_no_strict() {
        let ax = DMatrix::from_row_slice(1, 2, &[1.0, -1.0]);
        let b = DVector::from_row_slice(&[0.0]);
        let (xlower, xupper) = unbounded(2);

        let mut cls = StabilityClassifier::new(2, 1e-12);
        cls.initialize(&ax, &b, &xlower, &xupper).unwrap();
        assert!(cls.strictly_unstable_indices().is_empty());
    }

    #[test]
    fn test_strict_tags_survive_update() {
        let ax = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let b = DVector::from_row_slice(&[2.0]);
        let xlower = DVector::from_row_slice(&[0.0, 0.0]);
        let xupper = DVector::from_row_slice(&[1.0, 1.0]);

        let mut cls = StabilityClassifier::new(2, 1e-12);
        cls.initialize(&ax, &b, &xlower, &xupper).unwrap();

        let x = DVector::from_row_slice(&[1.0, 1.0]);
        let z = DVector::from_row_slice(&[-3.0, -3.0]);
        cls.update(&x, &z, &xlower, &xupper);
        assert_eq!(cls.status()[0], StabilityStatus::StrictlyUpperUnstable);
        assert_eq!(cls.status()[1], StabilityStatus::StrictlyUpperUnstable);
    }
}
