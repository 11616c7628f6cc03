//! Fullspace strategy: dense LU of the whole block matrix.
//!
//! Assembles the saddle-point matrix over the stable primal variables, the
//! jointly solved parameters, and all multipliers:
//!
//! ```text
//! [ Hss  Hxp_s  Wsᵀ ]
//! [ Vx_s Vp     0   ]
//! [ Ws   Wp     0   ]
//! ```
//!
//! Rank deficiency from linearly dependent constraint rows surfaces as NaN in
//! the affected solution components, which the stepper maps to zero steps.

use nalgebra::{DMatrix, DVector};

use super::SharedBlocks;
use crate::linalg::DenseLu;
use crate::problem::Dims;

#[derive(Debug)]
pub struct FullspaceSolver {
    lu: DenseLu,
    mat: DMatrix<f64>,
    ns: usize,
    np: usize,
    nw: usize,
}

impl FullspaceSolver {
    pub fn new() -> Self {
        Self {
            lu: DenseLu::new(),
            mat: DMatrix::zeros(0, 0),
            ns: 0,
            np: 0,
            nw: 0,
        }
    }

    pub(crate) fn factor(&mut self, dims: Dims, shared: &SharedBlocks) {
        let ns = shared.js.len();
        let np = dims.np;
        let nw = dims.nw();
        let t = ns + np + nw;
        self.ns = ns;
        self.np = np;
        self.nw = nw;

        if self.mat.nrows() != t {
            self.mat = DMatrix::zeros(t, t);
        } else {
            self.mat.fill(0.0);
        }

        for (a, &ia) in shared.js.iter().enumerate() {
            for (c, &ic) in shared.js.iter().enumerate() {
                self.mat[(a, c)] = shared.heff[(ia, ic)];
            }
            for k in 0..np {
                self.mat[(a, ns + k)] = shared.hxp[(ia, k)];
            }
            for r in 0..nw {
                self.mat[(a, ns + np + r)] = shared.wx[(r, ia)];
                self.mat[(ns + np + r, a)] = shared.wx[(r, ia)];
            }
            for k in 0..np {
                self.mat[(ns + k, a)] = shared.vx[(k, ia)];
            }
        }
        for k in 0..np {
            for l in 0..np {
                self.mat[(ns + k, ns + l)] = shared.vp[(k, l)];
            }
        }
        for r in 0..nw {
            for k in 0..np {
                self.mat[(ns + np + r, ns + k)] = shared.wp[(r, k)];
            }
        }

        self.lu.decompose(&self.mat);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn solve_reduced(
        &mut self,
        shared: &SharedBlocks,
        rx: &DVector<f64>,
        rp: &DVector<f64>,
        rw: &DVector<f64>,
        sol_x: &mut DVector<f64>,
        sol_p: &mut DVector<f64>,
        sol_w: &mut DVector<f64>,
    ) {
        let (ns, np, nw) = (self.ns, self.np, self.nw);
        let mut rhs = DVector::zeros(ns + np + nw);
        for (a, &ia) in shared.js.iter().enumerate() {
            rhs[a] = rx[ia];
        }
        for k in 0..np {
            rhs[ns + k] = rp[k];
        }
        for r in 0..nw {
            rhs[ns + np + r] = rw[r];
        }

        let sol = self.lu.solve(&rhs);
        for (a, &ia) in shared.js.iter().enumerate() {
            sol_x[ia] = sol[a];
        }
        for k in 0..np {
            sol_p[k] = sol[ns + k];
        }
        for r in 0..nw {
            sol_w[r] = sol[ns + np + r];
        }
    }
}

impl Default for FullspaceSolver {
    fn default() -> Self {
        Self::new()
    }
}
