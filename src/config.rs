//! Serializable operator and inverse parameters.
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverseMethod {
    /// Preconditioned conjugate gradient on the assembled matrix.
    #[default]
    Pcg,
    /// Sparse Cholesky factorization.
    Cholesky,
    /// Dense LU factorization. Only meant for small or diagnostic systems.
    DenseLu,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionerKind {
    Identity,
    #[default]
    Jacobi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverseParameters {
    pub method: InverseMethod,
    pub preconditioner: PreconditionerKind,
    pub tolerance: f64,
    pub max_iterations: Option<usize>,
}

impl Default for InverseParameters {
    fn default() -> Self {
        Self {
            method: InverseMethod::default(),
            preconditioner: PreconditionerKind::default(),
            tolerance: 1e-10,
            max_iterations: None,
        }
    }
}

impl InverseParameters {
    pub fn with_method(self, method: InverseMethod) -> Self {
        Self { method, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorParameters {
    /// Uniform shift added to every diagonal entry of the assembled matrix.
    pub diagonal_shift: f64,
    /// Configures the inverse at construction when present.
    pub inverse: Option<InverseParameters>,
}
