//! Rangespace strategy: Schur complement in the multipliers.
//!
//! Applicable when H is diagonal. With the affine scaling d = max(|x|, 1) and
//! the canonical form R·W·Q = [I S], the scaled primal blocks are eliminated
//! to a symmetric positive definite system of size nb = rank(W),
//!
//! ```text
//! (Db·Gb⁻¹·Db + Bs·Gs⁻¹·Bsᵀ) ŷ = Db·Gb⁻¹·rb + Bs·Gs⁻¹·rs − b′
//! ```
//!
//! where Gb, Gs are the scaled Hessian diagonals of the basic and stable
//! non-basic variables, Bs collects the scaled S-columns of the stable
//! non-basic variables, and b′ = R·rw. The Schur matrix is scrubbed with the
//! echelonizer's σ before the LDL^T factorization.

use nalgebra::{DMatrix, DVector};

use super::{KktError, SharedBlocks};
use crate::linalg::{Echelonizer, Ldlt};

#[derive(Debug)]
pub struct RangespaceSolver {
    ldlt: Ldlt,
    nb: usize,
    /// Global indices of the basic columns (all stable).
    jb: Vec<usize>,
    /// Global indices of the stable non-basic columns.
    jn_s: Vec<usize>,
    /// Affine scale per basic / stable non-basic position.
    db: DVector<f64>,
    ds: DVector<f64>,
    /// Scaled Hessian diagonals.
    gb: DVector<f64>,
    gs: DVector<f64>,
    /// Scaled S-columns of the stable non-basic variables (nb × ns).
    bs: DMatrix<f64>,
}

impl RangespaceSolver {
    pub fn new(dynamic_reg_min_pivot: f64) -> Self {
        Self {
            ldlt: Ldlt::new(0.0, dynamic_reg_min_pivot),
            nb: 0,
            jb: Vec::new(),
            jn_s: Vec::new(),
            db: DVector::zeros(0),
            ds: DVector::zeros(0),
            gb: DVector::zeros(0),
            gs: DVector::zeros(0),
            bs: DMatrix::zeros(0, 0),
        }
    }

    pub(crate) fn factor(&mut self, shared: &SharedBlocks, ech: &Echelonizer) -> Result<(), KktError> {
        let nb = ech.rank();
        self.nb = nb;
        self.jb = ech.basic_indices().to_vec();

        // Positions of the stable columns within the non-basic block.
        let mut kn_s = Vec::new();
        self.jn_s.clear();
        for (k, &j) in ech.non_basic_indices().iter().enumerate() {
            if !shared.unstable_mask[j] {
                kn_s.push(k);
                self.jn_s.push(j);
            }
        }
        let ns = self.jn_s.len();

        self.db = DVector::from_fn(nb, |i, _| shared.x[self.jb[i]].abs().max(1.0));
        self.ds = DVector::from_fn(ns, |t, _| shared.x[self.jn_s[t]].abs().max(1.0));
        self.gb = DVector::from_fn(nb, |i, _| {
            let j = self.jb[i];
            self.db[i] * self.db[i] * shared.heff[(j, j)]
        });
        self.gs = DVector::from_fn(ns, |t, _| {
            let j = self.jn_s[t];
            self.ds[t] * self.ds[t] * shared.heff[(j, j)]
        });

        self.bs = DMatrix::zeros(nb, ns);
        for t in 0..ns {
            let k = kn_s[t];
            for i in 0..nb {
                self.bs[(i, t)] = ech.s()[(i, k)] * self.ds[t];
            }
        }

        // Schur complement in the canonical multipliers.
        let mut m = DMatrix::zeros(nb, nb);
        for i in 0..nb {
            m[(i, i)] = self.db[i] * self.db[i] / self.gb[i];
        }
        for t in 0..ns {
            let ginv = 1.0 / self.gs[t];
            for i in 0..nb {
                let bi = self.bs[(i, t)];
                if bi == 0.0 {
                    continue;
                }
                for j in 0..nb {
                    m[(i, j)] += bi * self.bs[(j, t)] * ginv;
                }
            }
        }

        let sigma = ech.sigma();
        if sigma != 0.0 {
            m.apply(|v| *v = (*v + sigma) - sigma);
        }

        self.ldlt.factorize(&m)?;
        Ok(())
    }

    pub(crate) fn solve_reduced(
        &mut self,
        ech: &Echelonizer,
        rx: &DVector<f64>,
        rw: &DVector<f64>,
        sol_x: &mut DVector<f64>,
        sol_w: &mut DVector<f64>,
    ) {
        let nb = self.nb;
        let ns = self.jn_s.len();
        let nw = rw.len();

        // b′ = R·rw on the leading rank rows.
        let mut bprime = DVector::zeros(nb);
        for i in 0..nb {
            let mut acc = 0.0;
            for c in 0..nw {
                acc += ech.r()[(i, c)] * rw[c];
            }
            bprime[i] = acc;
        }

        let rb = DVector::from_fn(nb, |i, _| self.db[i] * rx[self.jb[i]]);
        let rs = DVector::from_fn(ns, |t, _| self.ds[t] * rx[self.jn_s[t]]);

        let mut rhs = DVector::zeros(nb);
        for i in 0..nb {
            rhs[i] = self.db[i] / self.gb[i] * rb[i] - bprime[i];
        }
        for t in 0..ns {
            let f = rs[t] / self.gs[t];
            if f != 0.0 {
                for i in 0..nb {
                    rhs[i] += self.bs[(i, t)] * f;
                }
            }
        }

        let yhat = self.ldlt.solve(&rhs);

        // Scaled stable non-basic solution, then the basic one from the
        // constraint rows so feasibility holds exactly.
        let mut xs_hat = DVector::zeros(ns);
        for t in 0..ns {
            let mut acc = rs[t];
            for i in 0..nb {
                acc -= self.bs[(i, t)] * yhat[i];
            }
            xs_hat[t] = acc / self.gs[t];
        }

        for i in 0..nb {
            let mut acc = bprime[i];
            for t in 0..ns {
                acc -= self.bs[(i, t)] * xs_hat[t];
            }
            sol_x[self.jb[i]] = acc;
        }
        for t in 0..ns {
            sol_x[self.jn_s[t]] = self.ds[t] * xs_hat[t];
        }

        // w̄ = Rᵀ·ŷ using the top rank rows; multipliers of linearly
        // dependent rows stay frozen at zero.
        sol_w.fill(0.0);
        for i in 0..nb {
            let yi = yhat[i];
            if yi != 0.0 {
                for c in 0..nw {
                    sol_w[c] += ech.r()[(i, c)] * yi;
                }
            }
        }
    }
}
