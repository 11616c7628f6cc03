//! Dense linear algebra layer.
//!
//! LU / LDL^T factorization kernels and the weighted echelonizer used by the
//! saddle-point strategies.

pub mod echelon;
pub mod ldlt;
pub mod lu;

pub use echelon::Echelonizer;
pub use ldlt::{Ldlt, LdltError};
pub use lu::DenseLu;
