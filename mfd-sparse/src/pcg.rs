//! Preconditioned conjugate gradient.
use crate::operator::{LinearOperator, OperatorError};
use log::debug;
use nalgebra::{DVector, DVectorView, DVectorViewMut, RealField};
use std::error::Error;
use std::fmt;

/// Reusable buffers for [`PcgSolver`].
#[derive(Debug, Clone)]
pub struct PcgWorkspace<T: RealField> {
    r: DVector<T>,
    z: DVector<T>,
    p: DVector<T>,
    ap: DVector<T>,
}

impl<T: RealField> Default for PcgWorkspace<T> {
    fn default() -> Self {
        Self {
            r: DVector::zeros(0),
            z: DVector::zeros(0),
            p: DVector::zeros(0),
            ap: DVector::zeros(0),
        }
    }
}

impl<T: RealField> PcgWorkspace<T> {
    fn resize(&mut self, dim: usize) {
        self.r.resize_vertically_mut(dim, T::zero());
        self.z.resize_vertically_mut(dim, T::zero());
        self.p.resize_vertically_mut(dim, T::zero());
        self.ap.resize_vertically_mut(dim, T::zero());
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcgOutput<T> {
    /// Number of updates made to the solution vector.
    pub num_iterations: usize,
    /// Norm of the recursively updated residual at exit.
    pub residual_norm: T,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum PcgErrorKind {
    Operator(OperatorError),
    Preconditioner(OperatorError),
    IndefiniteOperator,
    IndefinitePreconditioner,
    MaxIterationsReached { max_iterations: usize },
}

impl fmt::Display for PcgErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator(err) => write!(f, "error applying operator: {}", err),
            Self::Preconditioner(err) => write!(f, "error applying preconditioner: {}", err),
            Self::IndefiniteOperator => write!(f, "operator appears to be indefinite"),
            Self::IndefinitePreconditioner => write!(f, "preconditioner appears to be indefinite"),
            Self::MaxIterationsReached { max_iterations } => {
                write!(f, "maximum number of iterations ({}) reached", max_iterations)
            }
        }
    }
}

#[derive(Debug)]
pub struct PcgError<T> {
    pub output: PcgOutput<T>,
    pub kind: PcgErrorKind,
}

impl<T: fmt::Debug> fmt::Display for PcgError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PCG failed after {} iterations: {}",
            self.output.num_iterations, self.kind
        )
    }
}

impl<T: fmt::Debug> Error for PcgError<T> {}

/// Conjugate gradient for symmetric positive definite operators, with an optional
/// symmetric positive definite preconditioner.
///
/// Convergence is declared when the recursively updated residual satisfies
/// `||r|| <= tol * ||b||`.
pub struct PcgSolver<'a, T: RealField> {
    operator: &'a dyn LinearOperator<T>,
    preconditioner: Option<&'a dyn LinearOperator<T>>,
    tolerance: T,
    max_iterations: Option<usize>,
}

impl<'a, T: RealField + Copy> PcgSolver<'a, T> {
    pub fn new(operator: &'a dyn LinearOperator<T>) -> Self {
        Self {
            operator,
            preconditioner: None,
            tolerance: nalgebra::convert(1e-10),
            max_iterations: None,
        }
    }

    pub fn with_preconditioner(self, preconditioner: &'a dyn LinearOperator<T>) -> Self {
        Self {
            preconditioner: Some(preconditioner),
            ..self
        }
    }

    pub fn with_tolerance(self, tolerance: T) -> Self {
        Self { tolerance, ..self }
    }

    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations: Some(max_iterations),
            ..self
        }
    }

    /// Solves `A x = b`, using the contents of `x` as the initial guess.
    pub fn solve_with_guess<'b>(
        &self,
        workspace: &mut PcgWorkspace<T>,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<PcgOutput<T>, PcgError<T>> {
        self.solve_with_guess_(workspace, b.into(), x.into())
    }

    fn precondition(&self, z: &mut DVector<T>, r: &DVector<T>) -> Result<(), OperatorError> {
        match self.preconditioner {
            Some(p) => p.apply(DVectorViewMut::from(z), DVectorView::from(r)),
            None => {
                z.copy_from(r);
                Ok(())
            }
        }
    }

    fn solve_with_guess_(
        &self,
        workspace: &mut PcgWorkspace<T>,
        b: DVectorView<T>,
        mut x: DVectorViewMut<T>,
    ) -> Result<PcgOutput<T>, PcgError<T>> {
        assert_eq!(b.len(), x.len(), "right-hand side and solution must have the same length");
        workspace.resize(x.len());
        let PcgWorkspace { r, z, p, ap } = workspace;

        let mut output = PcgOutput {
            num_iterations: 0,
            residual_norm: T::zero(),
        };
        let fail = |output: PcgOutput<T>, kind| Err(PcgError { output, kind });

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        // r = b - A x
        if let Err(err) = self.operator.apply(DVectorViewMut::from(&mut *r), DVectorView::from(&x)) {
            return fail(output, PcgErrorKind::Operator(err));
        }
        for (r_i, b_i) in r.iter_mut().zip(b.iter()) {
            *r_i = *b_i - *r_i;
        }

        if let Err(err) = self.precondition(z, r) {
            return fail(output, PcgErrorKind::Preconditioner(err));
        }
        p.copy_from(&*z);
        let mut z_dot_r = z.dot(&*r);

        loop {
            output.residual_norm = r.norm();
            if output.residual_norm <= self.tolerance * b_norm {
                break;
            }
            if let Some(max_iterations) = self.max_iterations {
                if output.num_iterations >= max_iterations {
                    return fail(output, PcgErrorKind::MaxIterationsReached { max_iterations });
                }
            }

            if let Err(err) = self.operator.apply(DVectorViewMut::from(&mut *ap), DVectorView::from(&*p)) {
                return fail(output, PcgErrorKind::Operator(err));
            }
            let p_dot_ap = p.dot(&*ap);
            if p_dot_ap <= T::zero() {
                return fail(output, PcgErrorKind::IndefiniteOperator);
            }
            if z_dot_r <= T::zero() {
                return fail(output, PcgErrorKind::IndefinitePreconditioner);
            }

            let alpha = z_dot_r / p_dot_ap;
            x.axpy(alpha, &*p, T::one());
            r.axpy(-alpha, &*ap, T::one());
            output.num_iterations += 1;

            if let Err(err) = self.precondition(z, r) {
                return fail(output, PcgErrorKind::Preconditioner(err));
            }
            let z_dot_r_next = z.dot(&*r);
            let beta = z_dot_r_next / z_dot_r;
            // p <- z + beta p
            p.axpy(T::one(), &*z, beta);
            z_dot_r = z_dot_r_next;
        }

        debug!(
            "PCG converged in {} iterations (residual norm {:?})",
            output.num_iterations, output.residual_norm
        );
        Ok(output)
    }
}
