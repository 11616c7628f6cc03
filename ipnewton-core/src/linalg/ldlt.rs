//! Dense LDL^T factorization with regularization.
//!
//! The rangespace strategy reduces the KKT system to a Schur complement that
//! is symmetric positive definite in exact arithmetic but can lose definiteness
//! to round-off near a degenerate basis. The factorization therefore carries
//! two defenses borrowed from quasi-definite KKT practice: a static shift added
//! to every diagonal entry, and dynamic bumps applied to pivots whose magnitude
//! falls below a floor. Bumps are counted and reported so callers can see when
//! the factor was perturbed.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// LDL^T factorization errors.
#[derive(Error, Debug)]
pub enum LdltError {
    /// Input matrix is not square.
    #[error("matrix is not square: {nrows}×{ncols}")]
    NotSquare { nrows: usize, ncols: usize },

    /// A non-finite value appeared during factorization.
    #[error("factorization produced non-finite values")]
    NonFinite,
}

/// Dense LDL^T of a symmetric matrix: A = L·D·L^T with unit-lower L.
#[derive(Debug, Clone)]
pub struct Ldlt {
    n: usize,
    l: DMatrix<f64>,
    d: DVector<f64>,
    d_inv: DVector<f64>,
    static_reg: f64,
    dynamic_reg_min_pivot: f64,
    dynamic_bumps: u64,
}

impl Ldlt {
    pub fn new(static_reg: f64, dynamic_reg_min_pivot: f64) -> Self {
        assert!(static_reg >= 0.0, "static regularization must be non-negative");
        assert!(
            dynamic_reg_min_pivot > 0.0,
            "dynamic regularization threshold must be positive"
        );
        Self {
            n: 0,
            l: DMatrix::zeros(0, 0),
            d: DVector::zeros(0),
            d_inv: DVector::zeros(0),
            static_reg,
            dynamic_reg_min_pivot,
            dynamic_bumps: 0,
        }
    }

    /// Factorize the (lower triangle of the) given symmetric matrix.
    pub fn factorize(&mut self, a: &DMatrix<f64>) -> Result<(), LdltError> {
        if a.nrows() != a.ncols() {
            return Err(LdltError::NotSquare {
                nrows: a.nrows(),
                ncols: a.ncols(),
            });
        }
        let n = a.nrows();
        self.n = n;
        if self.l.nrows() != n {
            self.l = DMatrix::zeros(n, n);
            self.d = DVector::zeros(n);
            self.d_inv = DVector::zeros(n);
        }
        self.dynamic_bumps = 0;

        // Pivot replacement follows the usual threshold-to-replacement ratio
        // used by regularized KKT factorizations (~2e6), capped at 1e-6.
        let replacement = (self.dynamic_reg_min_pivot * 2e6).min(1e-6);

        for j in 0..n {
            let mut dj = a[(j, j)] + self.static_reg;
            for k in 0..j {
                dj -= self.l[(j, k)] * self.l[(j, k)] * self.d[k];
            }
            if !dj.is_finite() {
                return Err(LdltError::NonFinite);
            }
            if dj.abs() < self.dynamic_reg_min_pivot {
                dj = if dj >= 0.0 { replacement } else { -replacement };
                self.dynamic_bumps += 1;
            }
            self.d[j] = dj;
            self.d_inv[j] = 1.0 / dj;
            self.l[(j, j)] = 1.0;

            for i in (j + 1)..n {
                let mut lij = a[(i, j)];
                for k in 0..j {
                    lij -= self.l[(i, k)] * self.l[(j, k)] * self.d[k];
                }
                self.l[(i, j)] = lij / dj;
            }
        }
        Ok(())
    }

    /// Solve A·x = b in place.
    pub fn solve_in_place(&self, x: &mut DVector<f64>) {
        assert_eq!(x.len(), self.n, "rhs length does not match factored matrix");
        let n = self.n;

        // L y = b
        for i in 0..n {
            let mut acc = x[i];
            for k in 0..i {
                acc -= self.l[(i, k)] * x[k];
            }
            x[i] = acc;
        }
        // D z = y
        for i in 0..n {
            x[i] *= self.d_inv[i];
        }
        // L^T x = z
        for i in (0..n).rev() {
            let mut acc = x[i];
            for k in (i + 1)..n {
                acc -= self.l[(k, i)] * x[k];
            }
            x[i] = acc;
        }
    }

    pub fn solve(&self, b: &DVector<f64>) -> DVector<f64> {
        let mut x = b.clone_owned();
        self.solve_in_place(&mut x);
        x
    }

    /// Number of dynamic pivot bumps applied in the last factorization.
    pub fn dynamic_bumps(&self) -> u64 {
        self.dynamic_bumps
    }

    /// Diagonal D of the last factorization.
    pub fn d_values(&self) -> &DVector<f64> {
        &self.d
    }
}
