//! Iterate state owned by the caller.

use nalgebra::{DMatrix, DVector};

use crate::problem::Dims;
use crate::stability::StabilityStatus;

/// The master variables u = (x, p, w).
#[derive(Debug, Clone, PartialEq)]
pub struct MasterVector {
    /// Primal variables (length nx).
    pub x: DVector<f64>,
    /// Jointly solved parameters (length np).
    pub p: DVector<f64>,
    /// Equality-constraint multipliers w = (y, z) (length nw).
    pub w: DVector<f64>,
}

impl MasterVector {
    pub fn zeros(dims: Dims) -> Self {
        Self {
            x: DVector::zeros(dims.nx),
            p: DVector::zeros(dims.np),
            w: DVector::zeros(dims.nw()),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.iter().all(|v| v.is_finite())
            && self.p.iter().all(|v| v.is_finite())
            && self.w.iter().all(|v| v.is_finite())
    }
}

/// Sensitivity derivatives of the optimum w.r.t. user-declared parameter
/// columns c, filled on explicit request after a solve.
#[derive(Debug, Clone)]
pub struct Sensitivities {
    /// ∂x/∂c (nx × nc).
    pub dxdc: DMatrix<f64>,
    /// ∂p/∂c (np × nc).
    pub dpdc: DMatrix<f64>,
    /// ∂w/∂c (nw × nc).
    pub dwdc: DMatrix<f64>,
    /// ∂z/∂c of the instability measure z = g + Wᵀw (nx × nc).
    pub dzdc: DMatrix<f64>,
}

/// Solver state: the current iterate plus inspection data.
#[derive(Debug, Clone)]
pub struct State {
    /// Current iterate.
    pub u: MasterVector,
    /// Stability classification of each primal variable.
    pub stability: Vec<StabilityStatus>,
    /// Parameter sensitivities; present only after an explicit request.
    pub sensitivities: Option<Sensitivities>,
}

impl State {
    pub fn new(dims: Dims) -> Self {
        Self {
            u: MasterVector::zeros(dims),
            stability: vec![StabilityStatus::Stable; dims.nx],
            sensitivities: None,
        }
    }
}
