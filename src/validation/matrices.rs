//! Test inputs with the same logical contents but different memory layouts.

use ndarray::prelude::*;
use ndarray::ShapeBuilder;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{StandardNormal, Uniform};

/// Uniform(−1, 1) matrices of shape `rows × cols` in C order, Fortran order,
/// as a transposed view, and as a strided slice of a larger array, each with
/// a description of its layout.
pub fn all_test_matrices_with_shape(rows: usize, cols: usize, seed: u64) -> Vec<(ArrayD<f64>, String)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let distribution = Uniform::new(-1., 1.);
    let mut matrices = Vec::with_capacity(4);

    let c_order = Array2::random_using((rows, cols), distribution, &mut rng);
    matrices.push((
        c_order.into_dyn(),
        format!("c-order {}×{} (seed {})", rows, cols, seed),
    ));

    let values = Array2::random_using((rows, cols), distribution, &mut rng);
    let mut f_order = Array2::<f64>::zeros((rows, cols).f());
    f_order.assign(&values);
    matrices.push((
        f_order.into_dyn(),
        format!("f-order {}×{} (seed {})", rows, cols, seed),
    ));

    let transposed = Array2::random_using((cols, rows), distribution, &mut rng).reversed_axes();
    matrices.push((
        transposed.into_dyn(),
        format!("transposed {}×{} (seed {})", rows, cols, seed),
    ));

    let larger = Array2::random_using((2 * rows, 2 * cols), distribution, &mut rng);
    let strided = larger.slice_move(s![..;2, 1..;2]);
    matrices.push((
        strided.into_dyn(),
        format!("strided {}×{} (seed {})", rows, cols, seed),
    ));

    matrices
}

/// Uniform(`low`, `high`) array of any shape, in standard layout.
pub fn uniform_array(shape: &[usize], low: f64, high: f64, rng: &mut StdRng) -> ArrayD<f64> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(low, high), rng)
}

/// Standard normal array of any shape, multiplied by `scale`.
pub fn normal_array(shape: &[usize], scale: f64, rng: &mut StdRng) -> ArrayD<f64> {
    ArrayD::random_using(IxDyn(shape), StandardNormal, rng) * scale
}

/// A copy of `x` with the same contents in column-major layout.
pub fn fortran_copy(x: &ArrayD<f64>) -> ArrayD<f64> {
    let mut copy = ArrayD::zeros(IxDyn(x.shape()).f());
    copy.assign(x);
    copy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_test_matrices_with_shape() {
        let matrices = all_test_matrices_with_shape(3, 4, 12345);
        assert_eq!(matrices.len(), 4);
        for (matrix, description) in &matrices {
            assert_eq!(matrix.shape(), &[3, 4], "{}", description);
            assert!(matrix.iter().all(|&x| (-1. ..1.).contains(&x)));
        }
        assert!(matrices[0].0.is_standard_layout());
        assert!(!matrices[1].0.is_standard_layout());
        assert!(!matrices[2].0.is_standard_layout());
        assert!(!matrices[3].0.is_standard_layout());
        assert!(matrices[3].1.starts_with("strided"));

        // same seed, same contents
        let again = all_test_matrices_with_shape(3, 4, 12345);
        assert_eq!(matrices[2].0, again[2].0);
    }

    #[test]
    fn test_uniform_array() {
        let mut rng = StdRng::seed_from_u64(12345);
        let array = uniform_array(&[2, 3, 4], 0.05, 1., &mut rng);
        assert_eq!(array.shape(), &[2, 3, 4]);
        assert!(array.iter().all(|&x| (0.05..1.).contains(&x)));
    }

    #[test]
    fn test_fortran_copy() {
        let mut rng = StdRng::seed_from_u64(12345);
        let array = normal_array(&[2, 3, 4], 100., &mut rng);
        let copy = fortran_copy(&array);
        assert_eq!(copy, array);
        assert!(!copy.is_standard_layout());
        assert!(copy.t().is_standard_layout());
    }
}
