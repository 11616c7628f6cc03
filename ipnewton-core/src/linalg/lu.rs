//! Full-pivoting LU factorization with rank detection.
//!
//! The saddle-point strategies and the echelonizer both need an LU that keeps
//! working when the input matrix is rank deficient: the factorization reports
//! the numerical rank, and `solve` restricts substitution to the leading
//! rank-sized block. Solution entries tied to the deficient trailing block are
//! filled with quiet NaN so that callers can recognize and freeze the affected
//! unknowns.

use nalgebra::{DMatrix, DVector};

/// Dense LU factorization P·A·Q = L·U with full pivoting.
///
/// L (unit lower) and U (upper) are packed into a single matrix. The row and
/// column permutations are stored as index vectors: `p[k]` (`q[k]`) is the
/// original row (column) sitting at permuted position k.
#[derive(Debug, Clone)]
pub struct DenseLu {
    nrows: usize,
    ncols: usize,
    lu: DMatrix<f64>,
    p: Vec<usize>,
    q: Vec<usize>,
    rank: usize,
    max_pivot: f64,
    threshold: f64,
}

impl DenseLu {
    pub fn new() -> Self {
        Self {
            nrows: 0,
            ncols: 0,
            lu: DMatrix::zeros(0, 0),
            p: Vec::new(),
            q: Vec::new(),
            rank: 0,
            max_pivot: 0.0,
            threshold: 0.0,
        }
    }

    /// Factorize the given matrix.
    ///
    /// The numerical rank is the length of the leading run of pivots with
    /// magnitude above `max_pivot * eps * max(m, n)`. When the largest pivot
    /// is itself below `10 * eps` the relative test is meaningless and an
    /// absolute threshold of 1 is used instead, so a residual-noise matrix
    /// factors with rank zero.
    pub fn decompose(&mut self, a: &DMatrix<f64>) {
        let m = a.nrows();
        let n = a.ncols();
        let dim = m.min(n);

        self.nrows = m;
        self.ncols = n;
        self.lu = a.clone_owned();
        self.p = (0..m).collect();
        self.q = (0..n).collect();

        for k in 0..dim {
            // Locate the largest entry in the remaining submatrix.
            let mut piv_row = k;
            let mut piv_col = k;
            let mut piv_val = 0.0_f64;
            for j in k..n {
                for i in k..m {
                    let v = self.lu[(i, j)].abs();
                    if v > piv_val {
                        piv_val = v;
                        piv_row = i;
                        piv_col = j;
                    }
                }
            }

            if piv_val == 0.0 {
                break;
            }

            if piv_row != k {
                self.lu.swap_rows(k, piv_row);
                self.p.swap(k, piv_row);
            }
            if piv_col != k {
                self.lu.swap_columns(k, piv_col);
                self.q.swap(k, piv_col);
            }

            let piv = self.lu[(k, k)];
            for i in (k + 1)..m {
                let f = self.lu[(i, k)] / piv;
                self.lu[(i, k)] = f;
                if f != 0.0 {
                    for j in (k + 1)..n {
                        let upd = f * self.lu[(k, j)];
                        self.lu[(i, j)] -= upd;
                    }
                }
            }
        }

        self.max_pivot = (0..dim)
            .map(|k| self.lu[(k, k)].abs())
            .fold(0.0_f64, f64::max);

        let eps = f64::EPSILON;
        self.threshold = if self.max_pivot < 10.0 * eps {
            1.0
        } else {
            self.max_pivot * eps * m.max(n) as f64
        };

        let mut rank = 0;
        while rank < dim && self.lu[(rank, rank)].abs() > self.threshold {
            rank += 1;
        }
        self.rank = rank;
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn max_pivot(&self) -> f64 {
        self.max_pivot
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Row permutation: `p()[k]` is the original row at permuted position k.
    pub fn row_permutation(&self) -> &[usize] {
        &self.p
    }

    /// Column permutation: `q()[k]` is the original column at permuted position k.
    pub fn col_permutation(&self) -> &[usize] {
        &self.q
    }

    /// Packed LU factors (unit-lower L below the diagonal, U on and above).
    pub fn packed(&self) -> &DMatrix<f64> {
        &self.lu
    }

    /// Solve A·x = b through the leading rank-sized block.
    ///
    /// Unknowns at permuted positions beyond the rank are reported as NaN;
    /// equations beyond the rank (linearly dependent rows) are ignored.
    pub fn solve(&self, b: &DVector<f64>) -> DVector<f64> {
        assert_eq!(b.len(), self.nrows, "rhs length does not match factored matrix");
        let r = self.rank;

        // Forward substitution on the unit-lower block of P·b.
        let mut y = DVector::zeros(r);
        for k in 0..r {
            let mut acc = b[self.p[k]];
            for j in 0..k {
                acc -= self.lu[(k, j)] * y[j];
            }
            y[k] = acc;
        }

        // Back substitution on the leading r×r block of U.
        for k in (0..r).rev() {
            let mut acc = y[k];
            for j in (k + 1)..r {
                acc -= self.lu[(k, j)] * y[j];
            }
            y[k] = acc / self.lu[(k, k)];
        }

        let mut x = DVector::from_element(self.ncols, f64::NAN);
        for k in 0..r {
            x[self.q[k]] = y[k];
        }
        x
    }

    /// Solve A·X = B column by column (same NaN convention as `solve`).
    pub fn solve_mat(&self, b: &DMatrix<f64>) -> DMatrix<f64> {
        let mut x = DMatrix::zeros(self.ncols, b.ncols());
        for c in 0..b.ncols() {
            let col = self.solve(&b.column(c).clone_owned());
            x.set_column(c, &col);
        }
        x
    }
}

impl Default for DenseLu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lu_full_rank_solve() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 1.0, 2.0, 5.0, 3.0, 1.0, 3.0, 6.0]);
        let b = DVector::from_row_slice(&[7.0, 10.0, 10.0]);

        let mut lu = DenseLu::new();
        lu.decompose(&a);
        assert_eq!(lu.rank(), 3);

        let x = lu.solve(&b);
        let res = &a * &x - &b;
        assert!(res.amax() < 1e-12, "residual too large: {}", res.amax());
    }

    #[test]
    fn test_lu_rank_deficient_nan_sentinel() {
        // Row 2 = 2 * row 1: rank 2.
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 0.0, 1.0, 1.0]);
        let mut lu = DenseLu::new();
        lu.decompose(&a);
        assert_eq!(lu.rank(), 2);

        let b = DVector::from_row_slice(&[1.0, 2.0, 1.0]);
        let x = lu.solve(&b);
        let nan_count = x.iter().filter(|v| v.is_nan()).count();
        assert_eq!(nan_count, 1, "exactly one frozen unknown expected, got {:?}", x);
    }

    #[test]
    fn test_lu_zero_matrix_rank_zero() {
        let a = DMatrix::from_element(2, 3, 1e-18);
        let mut lu = DenseLu::new();
        lu.decompose(&a);
        assert_eq!(lu.rank(), 0);

        let x = lu.solve(&DVector::zeros(2));
        assert!(x.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_lu_rectangular_wide() {
        let a = DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 2.0, -1.0, 0.0, 3.0, 1.0, 1.0]);
        let mut lu = DenseLu::new();
        lu.decompose(&a);
        assert_eq!(lu.rank(), 2);
    }
}
