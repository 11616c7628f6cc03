//! Post-solution parameter sensitivities.
//!
//! A thin driver over the saddle-point solver: after convergence the cached
//! KKT factorization is re-used to solve one linear system per parameter
//! column, with the right-hand sides differentiated w.r.t. the parameters.
//! No new factorization is performed.

use nalgebra::DMatrix;
use thiserror::Error;

use crate::kkt::{KktError, SaddlePointSolver};
use crate::problem::Dims;
use crate::state::Sensitivities;

/// Differentiated right-hand sides supplied by the caller.
pub struct SensitivityRhs<'a> {
    /// ∂g/∂c (nx × nc).
    pub dgdc: &'a DMatrix<f64>,
    /// ∂b/∂c (ny × nc).
    pub dbdc: &'a DMatrix<f64>,
    /// ∂h/∂c (nz × nc).
    pub dhdc: &'a DMatrix<f64>,
    /// ∂v/∂c (np × nc); zero when absent.
    pub dvdc: Option<&'a DMatrix<f64>>,
}

#[derive(Error, Debug)]
pub enum SensitivityError {
    #[error("{what} has shape {rows}×{cols}, expected {exp_rows}×{exp_cols}")]
    DimensionMismatch {
        what: &'static str,
        rows: usize,
        cols: usize,
        exp_rows: usize,
        exp_cols: usize,
    },

    #[error(transparent)]
    Kkt(#[from] KktError),
}

/// Solve for ∂(x, p, w, z)/∂c using the cached factorization.
pub fn compute_sensitivities(
    kkt: &mut SaddlePointSolver,
    dims: Dims,
    rhs: SensitivityRhs<'_>,
) -> Result<Sensitivities, SensitivityError> {
    let nc = rhs.dgdc.ncols();

    let checks: [(&'static str, &DMatrix<f64>, usize); 3] = [
        ("dgdc", rhs.dgdc, dims.nx),
        ("dbdc", rhs.dbdc, dims.ny),
        ("dhdc", rhs.dhdc, dims.nz),
    ];
    for (what, mat, exp_rows) in checks {
        if mat.nrows() != exp_rows || mat.ncols() != nc {
            return Err(SensitivityError::DimensionMismatch {
                what,
                rows: mat.nrows(),
                cols: mat.ncols(),
                exp_rows,
                exp_cols: nc,
            });
        }
    }
    if let Some(dv) = rhs.dvdc {
        if dv.nrows() != dims.np || dv.ncols() != nc {
            return Err(SensitivityError::DimensionMismatch {
                what: "dvdc",
                rows: dv.nrows(),
                cols: dv.ncols(),
                exp_rows: dims.np,
                exp_cols: nc,
            });
        }
    }

    let mut sens = Sensitivities {
        dxdc: DMatrix::zeros(dims.nx, nc),
        dpdc: DMatrix::zeros(dims.np, nc),
        dwdc: DMatrix::zeros(dims.nw(), nc),
        dzdc: DMatrix::zeros(dims.nx, nc),
    };
    kkt.sensitivities(rhs.dgdc, rhs.dbdc, rhs.dhdc, rhs.dvdc, &mut sens)?;
    Ok(sens)
}
