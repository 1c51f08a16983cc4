//! Test helpers shared by the workspace crates.
use nalgebra::{DVector, Dim, Matrix, RawStorage};

/// Poor man's approx assertion for matrices
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let diff = &$x - &$y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", $x);
            println!("right: {}", $y);
            println!("diff: {:e}", diff);
        }
        assert!(approx_eq);
    }};
}

#[macro_export]
macro_rules! assert_panics {
    ($e:expr) => {{
        use std::panic::catch_unwind;
        use std::stringify;
        let expr_string = stringify!($e);
        let result = catch_unwind(|| $e);
        if result.is_ok() {
            panic!("assert_panics!({}) failed.", expr_string);
        }
    }};
}

/// Largest absolute entry of `a - b`, scaled by the largest absolute entry of `b` (or 1 if smaller).
pub fn relative_max_difference<R, C, S1, S2>(a: &Matrix<f64, R, C, S1>, b: &Matrix<f64, R, C, S2>) -> f64
where
    R: Dim,
    C: Dim,
    S1: RawStorage<f64, R, C>,
    S2: RawStorage<f64, R, C>,
{
    assert_eq!(a.shape(), b.shape());
    let scale = b.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
    let diff = a
        .iter()
        .zip(b.iter())
        .fold(0.0_f64, |m, (x, y)| m.max((x - y).abs()));
    diff / scale
}

/// A deterministic, reasonably irregular vector for tests.
pub fn test_vector(n: usize, seed: u64) -> DVector<f64> {
    DVector::from_fn(n, |i, _| {
        let k = (i as u64).wrapping_mul(2654435761).wrapping_add(seed.wrapping_mul(40503)) % 1000;
        (k as f64) / 500.0 - 1.0
    })
}
