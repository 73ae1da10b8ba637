//! Spectral norm via the symmetric eigen-decomposition of the Gram matrix.
//!
//! Kernels are small (`out` rarely exceeds a few hundred), so the Gram matrix
//! of the shorter side is cheap to decompose exactly.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::ArrayView2;

/// Largest singular value of `m`. Non-finite input yields NaN.
pub fn largest_singular_value(m: ArrayView2<f32>) -> f32 {
    if m.is_empty() { return 0.0; }
    if m.iter().any(|v| !v.is_finite()) { return f32::NAN; }
    let x = DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| f64::from(m[[i, j]]));
    let gram = if x.nrows() <= x.ncols() { &x * x.transpose() } else { x.transpose() * &x };
    let top = SymmetricEigen::new(gram).eigenvalues.max();
    // round-off can leave a rank-deficient Gram slightly negative
    (if top < 0.0 { 0.0 } else { top }).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn diagonal_singular_values() {
        let m = array![[3.0f32, 0.0, 0.0], [0.0, -5.0, 0.0]];
        assert!((largest_singular_value(m.view()) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn tall_and_wide_agree() {
        let m = array![[1.0f32, 2.0], [0.5, -1.0], [3.0, 0.0]];
        let wide = m.t().to_owned();
        assert!((largest_singular_value(m.view()) - largest_singular_value(wide.view())).abs() < 1e-5);
    }

    #[test]
    fn rank_one_matrix() {
        // u vᵀ with |u| = 5, |v| = sqrt(2)
        let m = array![[3.0f32, 3.0], [4.0, 4.0]];
        let sigma = largest_singular_value(m.view());
        assert!((sigma - 5.0 * 2f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn rotation_has_unit_spectral_norm() {
        let (s, c) = 0.3f32.sin_cos();
        let m = array![[c, -s], [s, c]];
        assert!((largest_singular_value(m.view()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn signed_permutation_is_exactly_one() {
        let m = array![[0.0f32, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]];
        assert_eq!(largest_singular_value(m.view()), 1.0);
    }

    #[test]
    fn non_finite_entries_are_not_hidden() {
        assert!(largest_singular_value(array![[f32::NAN, 0.0], [0.0, 1.0]].view()).is_nan());
        assert!(largest_singular_value(array![[f32::INFINITY, 0.0], [0.0, 1.0]].view()).is_nan());
    }
}
