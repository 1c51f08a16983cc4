//! Linear operators and Krylov solvers used by `mfd-operators`.
//!
//! The solvers here only see operators through [`LinearOperator`], so the same
//! code runs against an assembled CSR matrix, a dense matrix or a matrix-free
//! operator.

pub mod operator;
pub mod pcg;

pub use operator::{IdentityOperator, JacobiPreconditioner, LinearOperator, OperatorError, SingularDiagonal};
pub use pcg::{PcgError, PcgErrorKind, PcgOutput, PcgSolver, PcgWorkspace};
