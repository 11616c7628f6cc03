//! Nullspace strategy: elimination through a kernel basis of W.
//!
//! The canonical form R·W·Q = [I S] provides the kernel basis
//! Z = Q·[−S; I] over the stable non-basic columns: any feasible step is a
//! particular solution from the constraint rows plus a combination of Z's
//! columns. Projecting the optimality rows onto that basis leaves a reduced
//! system of size nx − rank(W),
//!
//! ```text
//! (Hss − Hsb·Ss − Ssᵀ·Hbs + Ssᵀ·Hbb·Ss) x̄s = rs − Ssᵀ·rb − (Hsb − Ssᵀ·Hbb)·b′
//! ```
//!
//! factored by LU. Unlike the rangespace path, H may carry off-diagonal
//! coupling.

use nalgebra::{DMatrix, DVector};

use super::SharedBlocks;
use crate::linalg::{DenseLu, Echelonizer};

#[derive(Debug)]
pub struct NullspaceSolver {
    lu: DenseLu,
    nb: usize,
    jb: Vec<usize>,
    jn_s: Vec<usize>,
    /// S-columns of the stable non-basic variables (nb × ns).
    ss: DMatrix<f64>,
    /// Permuted Hessian blocks kept for the multiplier recovery.
    hbb: DMatrix<f64>,
    hbs: DMatrix<f64>,
}

impl NullspaceSolver {
    pub fn new() -> Self {
        Self {
            lu: DenseLu::new(),
            nb: 0,
            jb: Vec::new(),
            jn_s: Vec::new(),
            ss: DMatrix::zeros(0, 0),
            hbb: DMatrix::zeros(0, 0),
            hbs: DMatrix::zeros(0, 0),
        }
    }

    pub(crate) fn factor(&mut self, shared: &SharedBlocks, ech: &Echelonizer) {
        let nb = ech.rank();
        self.nb = nb;
        self.jb = ech.basic_indices().to_vec();

        let mut kn_s = Vec::new();
        self.jn_s.clear();
        for (k, &j) in ech.non_basic_indices().iter().enumerate() {
            if !shared.unstable_mask[j] {
                kn_s.push(k);
                self.jn_s.push(j);
            }
        }
        let ns = self.jn_s.len();

        self.ss = DMatrix::zeros(nb, ns);
        for t in 0..ns {
            let k = kn_s[t];
            for i in 0..nb {
                self.ss[(i, t)] = ech.s()[(i, k)];
            }
        }

        self.hbb = DMatrix::from_fn(nb, nb, |i, j| shared.heff[(self.jb[i], self.jb[j])]);
        self.hbs = DMatrix::from_fn(nb, ns, |i, t| shared.heff[(self.jb[i], self.jn_s[t])]);
        let hsb = DMatrix::from_fn(ns, nb, |t, i| shared.heff[(self.jn_s[t], self.jb[i])]);
        let hss = DMatrix::from_fn(ns, ns, |t, r| shared.heff[(self.jn_s[t], self.jn_s[r])]);

        // Zᵀ·H·Z in the permuted coordinates.
        let k = hss - &hsb * &self.ss - self.ss.transpose() * &self.hbs
            + self.ss.transpose() * &self.hbb * &self.ss;
        self.lu.decompose(&k);
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

        let mut bprime = DVector::zeros(nb);
        for i in 0..nb {
            let mut acc = 0.0;
            for c in 0..nw {
                acc += ech.r()[(i, c)] * rw[c];
            }
            bprime[i] = acc;
        }

        let rb = DVector::from_fn(nb, |i, _| rx[self.jb[i]]);
        let rs = DVector::from_fn(ns, |t, _| rx[self.jn_s[t]]);

        // rhs_k = rs − Ssᵀ·rb − (Hsb − Ssᵀ·Hbb)·b′
        let mut rhs_k = rs.clone();
        for t in 0..ns {
            for i in 0..nb {
                rhs_k[t] -= self.ss[(i, t)] * rb[i];
            }
        }
        for t in 0..ns {
            let mut acc = 0.0;
            for i in 0..nb {
                // Hsb[t, i] = H[jn_s[t], jb[i]] = Hbs[i, t] for symmetric H.
                let hsb_ti = self.hbs[(i, t)];
                let mut sthbb = 0.0;
                for j in 0..nb {
                    sthbb += self.ss[(j, t)] * self.hbb[(j, i)];
                }
                acc += (hsb_ti - sthbb) * bprime[i];
            }
            rhs_k[t] -= acc;
        }

        let xs = self.lu.solve(&rhs_k);

        let mut xb = bprime.clone();
        for i in 0..nb {
            for t in 0..ns {
                xb[i] -= self.ss[(i, t)] * xs[t];
            }
        }

        // ŷ from the basic optimality rows, then w̄ = Rᵀ·ŷ.
        let mut yhat = rb.clone();
        for i in 0..nb {
            for j in 0..nb {
                yhat[i] -= self.hbb[(i, j)] * xb[j];
            }
            for t in 0..ns {
                yhat[i] -= self.hbs[(i, t)] * xs[t];
            }
        }

        for i in 0..nb {
            sol_x[self.jb[i]] = xb[i];
        }
        for t in 0..ns {
            sol_x[self.jn_s[t]] = xs[t];
        }

        sol_w.fill(0.0);
        for i in 0..nb {
            let yi = yhat[i];
            if yi != 0.0 && yi.is_finite() {
                for c in 0..nw {
                    sol_w[c] += ech.r()[(i, c)] * yi;
                }
            }
        }
    }
}

impl Default for NullspaceSolver {
    fn default() -> Self {
        Self::new()
    }
}
