//! Saddle-point (KKT) solver.
//!
//! Factors and solves the block system arising from the KKT conditions,
//!
//! ```text
//! [ H   Wᵀ ] [x̄]   [rx]
//! [ W   0  ] [w̄] = [rw]
//! ```
//!
//! restricted to the stable primal variables (unstable ones are pinned to
//! their bounds and pre-substituted into the right-hand side). Three
//! reduction strategies are available; each holds its own factorization
//! workspace inside a tagged sum:
//!
//! - **Fullspace**: dense LU of the whole block matrix. Robust; the only
//!   path that handles jointly solved parameters (np > 0), where the block
//!   matrix grows by the coupling rows [Vx Vp 0].
//! - **Rangespace** (default): for diagonal H, eliminates the primal blocks
//!   to a symmetric positive definite Schur complement of size rank(W),
//!   factored by LDL^T. Rows and columns are scaled by the affine scaling
//!   d = max(|x|, 1) before the reduction and unscaled afterwards.
//! - **Nullspace**: eliminates the multipliers through a kernel basis of W
//!   from the canonical form and LU-factors the reduced block of size
//!   nx − rank(W). Handles non-diagonal H.
//!
//! The canonical form of W is maintained by the echelonizer with priority
//! weights derived from bound distances, so that large, interior variables
//! populate the basic set. Solutions are produced directly as the next
//! iterates (x̄, w̄) rather than as deltas; the algebra on nearly converged
//! right-hand sides is then less exposed to cancellation.

mod fullspace;
mod nullspace;
mod rangespace;

pub use fullspace::FullspaceSolver;
pub use nullspace::NullspaceSolver;
pub use rangespace::RangespaceSolver;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::linalg::{Echelonizer, LdltError};
use crate::problem::Dims;
use crate::state::{MasterVector, Sensitivities};

/// Diagonal entries of H with magnitude below this receive the proximal bump.
const PROXIMAL_EPS: f64 = 1e-12;

/// Minimum pivot magnitude before the Schur LDL^T applies a dynamic bump.
const DYNAMIC_REG_MIN_PIVOT: f64 = 1e-13;

/// Saddle-point reduction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KktMethod {
    Fullspace,
    Nullspace,
    Rangespace,
}

/// KKT solver errors (recoverable numerical failures).
#[derive(Error, Debug)]
pub enum KktError {
    #[error("Schur complement factorization failed: {0}")]
    SchurFactorization(#[from] LdltError),

    #[error("KKT system has not been decomposed")]
    NotDecomposed,
}

/// Borrowed views of everything `decompose` needs.
pub struct KktAssembly<'a> {
    /// Hessian block ∂²f/∂x² (nx×nx).
    pub hxx: &'a DMatrix<f64>,
    /// Whether `hxx` is diagonal (enables the rangespace reduction).
    pub hxx_diagonal: bool,
    /// Hessian block ∂²f/∂x∂p (nx×np).
    pub hxp: &'a DMatrix<f64>,
    /// Coupling Jacobians (np×nx, np×np).
    pub vx: &'a DMatrix<f64>,
    pub vp: &'a DMatrix<f64>,
    /// Coefficient matrix W = [Ax; Jx] (nw×nx) and [Ap; Jp] (nw×np).
    pub wx: &'a DMatrix<f64>,
    pub wp: &'a DMatrix<f64>,
    /// Current primal iterate (affine scaling source).
    pub x: &'a DVector<f64>,
    /// Priority weights for the echelonizer column ordering.
    pub weights: &'a DVector<f64>,
    /// Stable / unstable index partition of x.
    pub stable: &'a [usize],
    pub unstable: &'a [usize],
    /// Proximal regularization for near-zero Hessian diagonal entries.
    pub proximal_rho: f64,
}

/// Blocks cached at `decompose` time and shared by all strategies.
#[derive(Debug)]
pub(crate) struct SharedBlocks {
    pub heff: DMatrix<f64>,
    pub hxp: DMatrix<f64>,
    pub vx: DMatrix<f64>,
    pub vp: DMatrix<f64>,
    pub wx: DMatrix<f64>,
    pub wp: DMatrix<f64>,
    pub x: DVector<f64>,
    pub js: Vec<usize>,
    pub ju: Vec<usize>,
    pub unstable_mask: Vec<bool>,
}

impl SharedBlocks {
    fn empty() -> Self {
        Self {
            heff: DMatrix::zeros(0, 0),
            hxp: DMatrix::zeros(0, 0),
            vx: DMatrix::zeros(0, 0),
            vp: DMatrix::zeros(0, 0),
            wx: DMatrix::zeros(0, 0),
            wp: DMatrix::zeros(0, 0),
            x: DVector::zeros(0),
            js: Vec::new(),
            ju: Vec::new(),
            unstable_mask: Vec::new(),
        }
    }
}

/// Copy into the destination, re-sizing its storage only when the shape
/// changed (the hot path stays allocation-free across iterations).
fn store(dst: &mut DMatrix<f64>, src: &DMatrix<f64>) {
    if dst.shape() == src.shape() {
        dst.copy_from(src);
    } else {
        *dst = src.clone_owned();
    }
}

/// Per-strategy factorization workspace.
#[derive(Debug)]
enum KktWorkspace {
    Fullspace(FullspaceSolver),
    Rangespace(RangespaceSolver),
    Nullspace(NullspaceSolver),
}

/// The saddle-point solver: canonical form, strategy dispatch, cached factors.
#[derive(Debug)]
pub struct SaddlePointSolver {
    dims: Dims,
    method: KktMethod,
    ech: Echelonizer,
    shared: SharedBlocks,
    ws: KktWorkspace,
    decomposed: bool,
}

impl SaddlePointSolver {
    pub fn new(dims: Dims, method: KktMethod) -> Self {
        let ws = match method {
            KktMethod::Fullspace => KktWorkspace::Fullspace(FullspaceSolver::new()),
            KktMethod::Rangespace => {
                KktWorkspace::Rangespace(RangespaceSolver::new(DYNAMIC_REG_MIN_PIVOT))
            }
            KktMethod::Nullspace => KktWorkspace::Nullspace(NullspaceSolver::new()),
        };
        Self {
            dims,
            method,
            ech: Echelonizer::new(),
            shared: SharedBlocks::empty(),
            ws,
            decomposed: false,
        }
    }

    /// Change the configured strategy; the workspace is swapped lazily at the
    /// next `decompose`.
    pub fn set_method(&mut self, method: KktMethod) {
        self.method = method;
    }

    /// The strategy actually used by the last `decompose`.
    pub fn effective_method(&self) -> KktMethod {
        match &self.ws {
            KktWorkspace::Fullspace(_) => KktMethod::Fullspace,
            KktWorkspace::Rangespace(_) => KktMethod::Rangespace,
            KktWorkspace::Nullspace(_) => KktMethod::Nullspace,
        }
    }

    pub fn echelonizer(&self) -> &Echelonizer {
        &self.ech
    }

    /// Re-echelonize W under the given priority weights and compute the
    /// strategy-specific factorization.
    pub fn decompose(&mut self, asm: KktAssembly<'_>) -> Result<(), KktError> {
        let nx = self.dims.nx;

        store(&mut self.shared.heff, asm.hxx);
        for i in 0..nx {
            if self.shared.heff[(i, i)].abs() < PROXIMAL_EPS {
                self.shared.heff[(i, i)] += asm.proximal_rho;
            }
        }
        store(&mut self.shared.hxp, asm.hxp);
        store(&mut self.shared.vx, asm.vx);
        store(&mut self.shared.vp, asm.vp);
        store(&mut self.shared.wx, asm.wx);
        store(&mut self.shared.wp, asm.wp);
        if self.shared.x.len() == asm.x.len() {
            self.shared.x.copy_from(asm.x);
        } else {
            self.shared.x = asm.x.clone_owned();
        }
        self.shared.js.clear();
        self.shared.js.extend_from_slice(asm.stable);
        self.shared.ju.clear();
        self.shared.ju.extend_from_slice(asm.unstable);
        self.shared.unstable_mask.clear();
        self.shared.unstable_mask.resize(nx, false);
        for &j in asm.unstable {
            self.shared.unstable_mask[j] = true;
        }

        self.ech.compute(asm.wx);
        self.ech.update_weights(asm.weights);
        self.ech.clean_roundoff();

        // A reduction strategy only applies when its structural assumptions
        // hold; otherwise this round falls back to the fullspace path.
        let basic_unstable = self
            .ech
            .basic_indices()
            .iter()
            .any(|&j| self.shared.unstable_mask[j]);
        let effective = match self.method {
            KktMethod::Fullspace => KktMethod::Fullspace,
            _ if self.dims.np > 0 || basic_unstable => KktMethod::Fullspace,
            KktMethod::Rangespace if !asm.hxx_diagonal => KktMethod::Fullspace,
            other => other,
        };

        if self.effective_method() != effective {
            self.ws = match effective {
                KktMethod::Fullspace => KktWorkspace::Fullspace(FullspaceSolver::new()),
                KktMethod::Rangespace => {
                    KktWorkspace::Rangespace(RangespaceSolver::new(DYNAMIC_REG_MIN_PIVOT))
                }
                KktMethod::Nullspace => KktWorkspace::Nullspace(NullspaceSolver::new()),
            };
        }

        let dims = self.dims;
        match &mut self.ws {
            KktWorkspace::Fullspace(s) => s.factor(dims, &self.shared),
            KktWorkspace::Rangespace(s) => s.factor(&self.shared, &self.ech)?,
            KktWorkspace::Nullspace(s) => s.factor(&self.shared, &self.ech),
        }

        self.decomposed = true;
        Ok(())
    }

    /// Solve the KKT system for the next iterates (x̄, p̄, w̄).
    ///
    /// The right-hand side is assembled from the cached blocks: the optimality
    /// rows use H·x + Hxp·p − g, the coupling rows Vx·x + Vp·p − v, and the
    /// feasibility rows [b; Jx·x + Jp·p − h] with the bound-pinned unstable
    /// variables pre-substituted. Components of `sol` tied to linearly
    /// dependent constraint rows come back as NaN (fullspace) or frozen
    /// (reduced strategies); the caller maps both to a zero step.
    pub fn solve(
        &mut self,
        g: &DVector<f64>,
        b: &DVector<f64>,
        h: &DVector<f64>,
        v: &DVector<f64>,
        u: &MasterVector,
        sol: &mut MasterVector,
    ) -> Result<(), KktError> {
        if !self.decomposed {
            return Err(KktError::NotDecomposed);
        }
        let Dims { ny, .. } = self.dims;
        let nw = self.dims.nw();

        let rx = &self.shared.heff * &u.x + &self.shared.hxp * &u.p - g;
        let rp = &self.shared.vx * &u.x + &self.shared.vp * &u.p - v;

        let mut rw = DVector::zeros(nw);
        rw.rows_mut(0, ny).copy_from(b);
        if nw > ny {
            let wxx = &self.shared.wx * &u.x;
            let wpp = &self.shared.wp * &u.p;
            for r in ny..nw {
                rw[r] = wxx[r] + wpp[r] - h[r - ny];
            }
        }
        for &j in &self.shared.ju {
            let xj = u.x[j];
            if xj != 0.0 {
                for r in 0..nw {
                    rw[r] -= self.shared.wx[(r, j)] * xj;
                }
            }
        }

        // Unstable components of the solution stay at their pinned values.
        sol.x.copy_from(&u.x);
        sol.p.fill(0.0);
        sol.w.fill(0.0);

        match &mut self.ws {
            KktWorkspace::Fullspace(s) => {
                s.solve_reduced(&self.shared, &rx, &rp, &rw, &mut sol.x, &mut sol.p, &mut sol.w)
            }
            KktWorkspace::Rangespace(s) => {
                s.solve_reduced(&self.ech, &rx, &rw, &mut sol.x, &mut sol.w)
            }
            KktWorkspace::Nullspace(s) => {
                s.solve_reduced(&self.ech, &rx, &rw, &mut sol.x, &mut sol.w)
            }
        }
        Ok(())
    }

    /// Differentiate the optimum w.r.t. parameter columns by re-solving the
    /// cached factorization with differentiated right-hand sides. For
    /// unstable variables ∂xᵢ/∂c = 0 and ∂zᵢ/∂c = ∂gᵢ/∂c + Wᵢᵀ·∂w/∂c.
    pub fn sensitivities(
        &mut self,
        dgdc: &DMatrix<f64>,
        dbdc: &DMatrix<f64>,
        dhdc: &DMatrix<f64>,
        dvdc: Option<&DMatrix<f64>>,
        out: &mut Sensitivities,
    ) -> Result<(), KktError> {
        if !self.decomposed {
            return Err(KktError::NotDecomposed);
        }
        let Dims { nx, np, ny, nz } = self.dims;
        let nw = self.dims.nw();
        let nc = dgdc.ncols();

        let mut sol_x = DVector::zeros(nx);
        let mut sol_p = DVector::zeros(np);
        let mut sol_w = DVector::zeros(nw);

        for c in 0..nc {
            let rx = -dgdc.column(c).clone_owned();
            let rp = match dvdc {
                Some(dv) => -dv.column(c).clone_owned(),
                None => DVector::zeros(np),
            };
            let mut rw = DVector::zeros(nw);
            for r in 0..ny {
                rw[r] = dbdc[(r, c)];
            }
            for r in 0..nz {
                rw[ny + r] = -dhdc[(r, c)];
            }

            sol_x.fill(0.0);
            sol_p.fill(0.0);
            sol_w.fill(0.0);
            match &mut self.ws {
                KktWorkspace::Fullspace(s) => s.solve_reduced(
                    &self.shared,
                    &rx,
                    &rp,
                    &rw,
                    &mut sol_x,
                    &mut sol_p,
                    &mut sol_w,
                ),
                KktWorkspace::Rangespace(s) => {
                    s.solve_reduced(&self.ech, &rx, &rw, &mut sol_x, &mut sol_w)
                }
                KktWorkspace::Nullspace(s) => {
                    s.solve_reduced(&self.ech, &rx, &rw, &mut sol_x, &mut sol_w)
                }
            }

            // Frozen unknowns (dependent constraint rows) differentiate to zero.
            sol_x.apply(|v| {
                if v.is_nan() {
                    *v = 0.0;
                }
            });
            sol_p.apply(|v| {
                if v.is_nan() {
                    *v = 0.0;
                }
            });
            sol_w.apply(|v| {
                if v.is_nan() {
                    *v = 0.0;
                }
            });
            for &j in &self.shared.ju {
                sol_x[j] = 0.0;
            }

            out.dxdc.set_column(c, &sol_x);
            out.dpdc.set_column(c, &sol_p);
            out.dwdc.set_column(c, &sol_w);

            for i in 0..nx {
                out.dzdc[(i, c)] = 0.0;
            }
            for &j in &self.shared.ju {
                let mut acc = dgdc[(j, c)];
                for r in 0..nw {
                    acc += self.shared.wx[(r, j)] * sol_w[r];
                }
                out.dzdc[(j, c)] = acc;
            }
        }
        Ok(())
    }
}
