use nalgebra::{ClosedAdd, ClosedMul, DMatrix, DVector, DVectorView, DVectorViewMut, RealField, Scalar};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use num::{One, Zero};
use std::error::Error;
use std::fmt;

/// Error type returned by operator applications.
pub type OperatorError = Box<dyn Error + Send + Sync>;

/// An operator computing `y = A x`.
pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T> LinearOperator<T> for DMatrix<T>
where
    T: Scalar + Zero + One + ClosedAdd + ClosedMul,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T> LinearOperator<T> for CsrMatrix<T>
where
    T: Scalar + Zero + One + ClosedAdd + ClosedMul,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(self), Op::NoOp(&x));
        Ok(())
    }
}

/// `y = x`.
#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        y.copy_from(&x);
        Ok(())
    }
}

/// Raised when a diagonal preconditioner meets a structurally missing or zero diagonal entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SingularDiagonal {
    pub row: usize,
}

impl fmt::Display for SingularDiagonal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zero or missing diagonal entry in row {}", self.row)
    }
}

impl Error for SingularDiagonal {}

/// Point Jacobi preconditioner `P = diag(A)^{-1}`.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner<T: Scalar> {
    inverse_diagonal: DVector<T>,
}

impl<T: RealField + Copy> JacobiPreconditioner<T> {
    pub fn from_csr(matrix: &CsrMatrix<T>) -> Result<Self, SingularDiagonal> {
        assert_eq!(matrix.nrows(), matrix.ncols(), "Jacobi preconditioner requires a square matrix");
        let mut inverse_diagonal = DVector::zeros(matrix.nrows());
        for (i, row) in matrix.row_iter().enumerate() {
            let diag = row
                .col_indices()
                .binary_search(&i)
                .ok()
                .map(|k| row.values()[k])
                .filter(|d| *d != T::zero())
                .ok_or(SingularDiagonal { row: i })?;
            inverse_diagonal[i] = T::one() / diag;
        }
        Ok(Self { inverse_diagonal })
    }

    pub fn inverse_diagonal(&self) -> &DVector<T> {
        &self.inverse_diagonal
    }
}

impl<T: RealField + Copy> LinearOperator<T> for JacobiPreconditioner<T> {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), OperatorError> {
        assert_eq!(x.len(), self.inverse_diagonal.len());
        for (i, d_i) in self.inverse_diagonal.iter().enumerate() {
            y[i] = x[i] * *d_i;
        }
        Ok(())
    }
}
