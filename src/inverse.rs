//! Inverse services applied to assembled operators.
//!
//! An operator only talks to its inverse through [`InverseService`]: it hands over the
//! sparsity pattern once structure is built, the assembled matrix whenever numeric
//! values change, and then asks for `y = A^{-1} x`.
use crate::config::{InverseMethod, InverseParameters, PreconditionerKind};
use eyre::{eyre, WrapErr};
use log::debug;
use mfd_sparse::{IdentityOperator, JacobiPreconditioner, LinearOperator, PcgSolver, PcgWorkspace};
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut, Dyn, LU};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use parking_lot::Mutex;
use std::fmt::Debug;

pub trait InverseService: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn initialize_structure(&mut self, pattern: &SparsityPattern) -> eyre::Result<()>;

    fn compute_numeric(&mut self, matrix: &CsrMatrix<f64>) -> eyre::Result<()>;

    fn apply_inverse(&self, x: DVectorView<f64>, y: DVectorViewMut<f64>) -> eyre::Result<()>;
}

/// Creates the inverse service selected by the parameters.
pub fn create_inverse(parameters: &InverseParameters) -> Box<dyn InverseService> {
    match parameters.method {
        InverseMethod::Pcg => Box::new(PcgInverse::new(parameters)),
        InverseMethod::Cholesky => Box::new(CholeskyInverse::default()),
        InverseMethod::DenseLu => Box::new(DenseLuInverse::default()),
    }
}

fn check_square(dim: (usize, usize)) -> eyre::Result<usize> {
    if dim.0 != dim.1 {
        return Err(eyre!("cannot invert a non-square {}x{} operator", dim.0, dim.1));
    }
    Ok(dim.0)
}

fn check_dimension(expected: Option<usize>, actual: usize) -> eyre::Result<()> {
    match expected {
        Some(n) if n == actual => Ok(()),
        Some(n) => Err(eyre!("matrix has dimension {}, but structure was built for {}", actual, n)),
        None => Err(eyre!("structure has not been initialized")),
    }
}

#[derive(Debug)]
pub struct PcgInverse {
    preconditioner_kind: PreconditionerKind,
    tolerance: f64,
    max_iterations: Option<usize>,
    dim: Option<usize>,
    matrix: Option<CsrMatrix<f64>>,
    jacobi: Option<JacobiPreconditioner<f64>>,
    workspace: Mutex<PcgWorkspace<f64>>,
}

impl PcgInverse {
    pub fn new(parameters: &InverseParameters) -> Self {
        Self {
            preconditioner_kind: parameters.preconditioner,
            tolerance: parameters.tolerance,
            max_iterations: parameters.max_iterations,
            dim: None,
            matrix: None,
            jacobi: None,
            workspace: Mutex::new(PcgWorkspace::default()),
        }
    }
}

impl InverseService for PcgInverse {
    fn name(&self) -> &str {
        "pcg"
    }

    fn initialize_structure(&mut self, pattern: &SparsityPattern) -> eyre::Result<()> {
        self.dim = Some(check_square((pattern.major_dim(), pattern.minor_dim()))?);
        self.matrix = None;
        self.jacobi = None;
        Ok(())
    }

    fn compute_numeric(&mut self, matrix: &CsrMatrix<f64>) -> eyre::Result<()> {
        check_dimension(self.dim, matrix.nrows())?;
        self.jacobi = match self.preconditioner_kind {
            PreconditionerKind::Jacobi => {
                Some(JacobiPreconditioner::from_csr(matrix).wrap_err("failed to build Jacobi preconditioner")?)
            }
            PreconditionerKind::Identity => None,
        };
        self.matrix = Some(matrix.clone());
        Ok(())
    }

    fn apply_inverse(&self, x: DVectorView<f64>, mut y: DVectorViewMut<f64>) -> eyre::Result<()> {
        let matrix = self
            .matrix
            .as_ref()
            .ok_or_else(|| eyre!("numeric values have not been computed"))?;
        let identity = IdentityOperator;
        let preconditioner: &dyn LinearOperator<f64> = match &self.jacobi {
            Some(jacobi) => jacobi,
            None => &identity,
        };
        let mut solver = PcgSolver::new(matrix)
            .with_preconditioner(preconditioner)
            .with_tolerance(self.tolerance);
        if let Some(max_iterations) = self.max_iterations {
            solver = solver.with_max_iterations(max_iterations);
        }

        y.fill(0.0);
        let mut workspace = self.workspace.lock();
        let output = solver
            .solve_with_guess(&mut *workspace, x, y)
            .map_err(|err| eyre!("{}", err))?;
        debug!(
            "PCG inverse: {} iterations, residual norm {:e}",
            output.num_iterations, output.residual_norm
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CholeskyInverse {
    dim: Option<usize>,
    factorization: Option<CscCholesky<f64>>,
}

impl InverseService for CholeskyInverse {
    fn name(&self) -> &str {
        "cholesky"
    }

    fn initialize_structure(&mut self, pattern: &SparsityPattern) -> eyre::Result<()> {
        self.dim = Some(check_square((pattern.major_dim(), pattern.minor_dim()))?);
        self.factorization = None;
        Ok(())
    }

    fn compute_numeric(&mut self, matrix: &CsrMatrix<f64>) -> eyre::Result<()> {
        check_dimension(self.dim, matrix.nrows())?;
        let factorization =
            CscCholesky::factor(&CscMatrix::from(matrix)).map_err(|err| eyre!("Cholesky factorization failed: {:?}", err))?;
        self.factorization = Some(factorization);
        Ok(())
    }

    fn apply_inverse(&self, x: DVectorView<f64>, mut y: DVectorViewMut<f64>) -> eyre::Result<()> {
        let factorization = self
            .factorization
            .as_ref()
            .ok_or_else(|| eyre!("numeric values have not been computed"))?;
        let rhs = DMatrix::from_iterator(x.len(), 1, x.iter().copied());
        let solution = factorization.solve(&rhs);
        y.copy_from(&solution.column(0));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DenseLuInverse {
    dim: Option<usize>,
    factorization: Option<LU<f64, Dyn, Dyn>>,
}

impl InverseService for DenseLuInverse {
    fn name(&self) -> &str {
        "dense_lu"
    }

    fn initialize_structure(&mut self, pattern: &SparsityPattern) -> eyre::Result<()> {
        self.dim = Some(check_square((pattern.major_dim(), pattern.minor_dim()))?);
        self.factorization = None;
        Ok(())
    }

    fn compute_numeric(&mut self, matrix: &CsrMatrix<f64>) -> eyre::Result<()> {
        check_dimension(self.dim, matrix.nrows())?;
        let lu = DMatrix::from(matrix).lu();
        if !lu.is_invertible() {
            return Err(eyre!("matrix is singular"));
        }
        self.factorization = Some(lu);
        Ok(())
    }

    fn apply_inverse(&self, x: DVectorView<f64>, mut y: DVectorViewMut<f64>) -> eyre::Result<()> {
        let factorization = self
            .factorization
            .as_ref()
            .ok_or_else(|| eyre!("numeric values have not been computed"))?;
        let solution: DVector<f64> = factorization
            .solve(&x)
            .ok_or_else(|| eyre!("LU solve failed"))?;
        y.copy_from(&solution);
        Ok(())
    }
}
