use ndarray::prelude::*;
use ndarray::IxDyn;

use super::error::{GraphError, Result};
use super::lanes::{sign, LaneLayout};
use super::operations::{binary_inputs, Operation};
use super::{Graph, Variable};

/// Reduce3 kernels: a scalar per lane pair of two equally shaped inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceKind {
    Manhattan,
    Euclidean,
    CosineSimilarity,
    CosineDistance,
    Hamming,
    Jaccard,
    Dot,
}

fn norm(x: ArrayView1<f64>) -> f64 {
    x.dot(&x).sqrt()
}

fn cosine_similarity(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let denominator = norm(x) * norm(y);
    if denominator == 0. {
        0.
    } else {
        x.dot(&y) / denominator
    }
}

/// Σmin(x, y) and Σmax(x, y).
fn jaccard_terms(x: ArrayView1<f64>, y: ArrayView1<f64>) -> (f64, f64) {
    x.iter()
        .zip(y.iter())
        .fold((0., 0.), |(minima, maxima), (&a, &b)| {
            (minima + a.min(b), maxima + a.max(b))
        })
}

impl DistanceKind {
    pub fn all() -> Vec<DistanceKind> {
        vec![
            DistanceKind::Manhattan,
            DistanceKind::Euclidean,
            DistanceKind::CosineSimilarity,
            DistanceKind::CosineDistance,
            DistanceKind::Hamming,
            DistanceKind::Jaccard,
            DistanceKind::Dot,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistanceKind::Manhattan => "manhattan",
            DistanceKind::Euclidean => "euclidean",
            DistanceKind::CosineSimilarity => "cosine_similarity",
            DistanceKind::CosineDistance => "cosine_distance",
            DistanceKind::Hamming => "hamming",
            DistanceKind::Jaccard => "jaccard",
            DistanceKind::Dot => "dot",
        }
    }

    pub fn differentiable(&self) -> bool {
        *self != DistanceKind::Hamming
    }

    pub fn distance(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        match self {
            DistanceKind::Manhattan => (&x - &y).mapv(f64::abs).sum(),
            DistanceKind::Euclidean => norm((&x - &y).view()),
            DistanceKind::CosineSimilarity => cosine_similarity(x, y),
            DistanceKind::CosineDistance => 1. - cosine_similarity(x, y),
            DistanceKind::Hamming => {
                let differing = x.iter().zip(y.iter()).filter(|(a, b)| a != b).count();
                differing as f64 / x.len() as f64
            }
            DistanceKind::Jaccard => {
                let (minima, maxima) = jaccard_terms(x, y);
                if maxima == 0. {
                    0.
                } else {
                    1. - minima / maxima
                }
            }
            DistanceKind::Dot => x.dot(&y),
        }
    }

    /// Gradient with respect to `x` of `distance(x, y)`, scaled by `g`. Every
    /// kernel has the same form in both arguments, so the gradient with
    /// respect to `y` is `gradient(y, x, ..)`.
    pub fn gradient(&self, x: ArrayView1<f64>, y: ArrayView1<f64>, value: f64, g: f64) -> Array1<f64> {
        let length = x.len();
        match self {
            DistanceKind::Manhattan => (&x - &y).mapv(|d| g * sign(d)),
            DistanceKind::Euclidean => {
                if value == 0. {
                    return Array1::zeros(length);
                }
                (&x - &y).mapv(|d| g * d / value)
            }
            DistanceKind::CosineSimilarity | DistanceKind::CosineDistance => {
                let (x_norm, y_norm) = (norm(x), norm(y));
                if x_norm == 0. || y_norm == 0. {
                    return Array1::zeros(length);
                }
                let similarity = cosine_similarity(x, y);
                let direction = if *self == DistanceKind::CosineDistance { -g } else { g };
                // dc/dx_i = y_i/(‖x‖‖y‖) − c·x_i/‖x‖²
                Array1::from_shape_fn(length, |i| {
                    direction * (y[i] / (x_norm * y_norm) - similarity * x[i] / (x_norm * x_norm))
                })
            }
            DistanceKind::Hamming => Array1::zeros(length),
            DistanceKind::Jaccard => {
                let (minima, maxima) = jaccard_terms(x, y);
                if maxima == 0. {
                    return Array1::zeros(length);
                }
                // J = 1 − N/D; x_i feeds N where it is the minimum and D where
                // it is the maximum (half of each on ties)
                Array1::from_shape_fn(length, |i| {
                    let (d_minima, d_maxima) = if x[i] < y[i] {
                        (1., 0.)
                    } else if x[i] > y[i] {
                        (0., 1.)
                    } else {
                        (0.5, 0.5)
                    };
                    -g * (d_minima * maxima - minima * d_maxima) / (maxima * maxima)
                })
            }
            DistanceKind::Dot => y.mapv(|b| g * b),
        }
    }
}

pub struct PairwiseDistance {
    kind: DistanceKind,
    axes: Vec<usize>,
    keep_dims: bool,
}

impl PairwiseDistance {
    pub fn new(kind: DistanceKind, axes: &[usize], keep_dims: bool) -> Self {
        Self {
            kind,
            axes: axes.to_vec(),
            keep_dims,
        }
    }

    fn layout(&self, x: &ArrayD<f64>, y: &ArrayD<f64>) -> Result<LaneLayout> {
        if x.shape() != y.shape() {
            return Err(GraphError::shape_mismatch(self.kind.name(), x.shape(), y.shape()));
        }
        LaneLayout::new(x.shape(), &self.axes)
    }
}

impl Operation for PairwiseDistance {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (x, y) = binary_inputs(self.name(), inputs)?;
        let layout = self.layout(x, y)?;
        let (x_rows, y_rows) = (layout.rows(x)?, layout.rows(y)?);
        let values = x_rows
            .rows()
            .into_iter()
            .zip(y_rows.rows())
            .map(|(x_lane, y_lane)| self.kind.distance(x_lane, y_lane))
            .collect();
        layout.collect(values, self.keep_dims)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        if !self.kind.differentiable() {
            return Ok(ArrayD::zeros(IxDyn(args[arg_index].shape())));
        }
        let (x, y) = match arg_index {
            0 => (args[0], args[1]),
            1 => (args[1], args[0]),
            _ => return Err(GraphError::invalid_argument(self.name(), "no such argument")),
        };
        let layout = self.layout(x, y)?;
        let (x_rows, y_rows) = (layout.rows(x)?, layout.rows(y)?);
        let mut gradient = Array2::zeros(x_rows.raw_dim());
        for (i, ((x_lane, y_lane), (&value, &g))) in x_rows
            .rows()
            .into_iter()
            .zip(y_rows.rows())
            .zip(output.iter().zip(out_gradient.iter()))
            .enumerate()
        {
            gradient
                .row_mut(i)
                .assign(&self.kind.gradient(x_lane, y_lane, value, g));
        }
        layout.restore(&gradient)
    }

    fn differentiable(&self) -> bool {
        self.kind.differentiable()
    }
}

impl Graph {
    pub fn pairwise_distance(
        &mut self,
        kind: DistanceKind,
        x: Variable,
        y: Variable,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<Variable> {
        self.record(Box::new(PairwiseDistance::new(kind, axes, keep_dims)), vec![x, y])
    }

    pub fn manhattan_distance(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::Manhattan, x, y, axes, false)
    }

    pub fn euclidean_distance(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::Euclidean, x, y, axes, false)
    }

    pub fn cosine_similarity(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::CosineSimilarity, x, y, axes, false)
    }

    pub fn cosine_distance(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::CosineDistance, x, y, axes, false)
    }

    pub fn hamming_distance(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::Hamming, x, y, axes, false)
    }

    pub fn jaccard_distance(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::Jaccard, x, y, axes, false)
    }

    pub fn dot(&mut self, x: Variable, y: Variable, axes: &[usize]) -> Result<Variable> {
        self.pairwise_distance(DistanceKind::Dot, x, y, axes, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::operations::assert_gradients_match;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_values() {
        let x = array![1., 2., 3.];
        let y = array![2., 0., 3.];
        let distance = |kind: DistanceKind| kind.distance(x.view(), y.view());
        assert_eq!(distance(DistanceKind::Manhattan), 3.);
        assert_relative_eq!(distance(DistanceKind::Euclidean), 5f64.sqrt());
        let similarity = 11. / (14f64.sqrt() * 13f64.sqrt());
        assert_relative_eq!(distance(DistanceKind::CosineSimilarity), similarity);
        assert_relative_eq!(distance(DistanceKind::CosineDistance), 1. - similarity);
        assert_relative_eq!(distance(DistanceKind::Hamming), 2. / 3.);
        assert_relative_eq!(distance(DistanceKind::Jaccard), 1. - 4. / 7.);
        assert_eq!(distance(DistanceKind::Dot), 11.);
    }

    #[test]
    fn test_symmetric_and_zero_on_identical_inputs() {
        let x = array![0.5, -1.5, 2., 4.];
        let y = array![1., 3., -0.25, 4.];
        for kind in DistanceKind::all() {
            assert_relative_eq!(
                kind.distance(x.view(), y.view()),
                kind.distance(y.view(), x.view())
            );
            if kind != DistanceKind::Dot && kind != DistanceKind::CosineSimilarity {
                assert_relative_eq!(kind.distance(x.view(), x.view()), 0., epsilon = 1e-12);
            }
        }
        assert_relative_eq!(
            DistanceKind::CosineSimilarity.distance(x.view(), x.view()),
            1.,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_degenerate_denominators() {
        let zero = array![0., 0.];
        let x = array![1., 2.];
        assert_eq!(DistanceKind::CosineSimilarity.distance(zero.view(), x.view()), 0.);
        assert_eq!(DistanceKind::Jaccard.distance(zero.view(), zero.view()), 0.);
        assert_eq!(
            DistanceKind::CosineSimilarity.gradient(zero.view(), x.view(), 0., 1.),
            array![0., 0.]
        );
    }

    #[test]
    fn test_distance_along_axes() {
        let x = Array::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64).into_dyn();
        let y = x.mapv(|v| v + 1.);
        let manhattan = PairwiseDistance::new(DistanceKind::Manhattan, &[1, 2], false)
            .forward(&[&x, &y])
            .unwrap();
        assert_eq!(manhattan, array![12., 12.].into_dyn());
        let kept = PairwiseDistance::new(DistanceKind::Euclidean, &[0], true)
            .forward(&[&x, &y])
            .unwrap();
        assert_eq!(kept.shape(), &[1, 3, 4]);
        assert_relative_eq!(kept[[0, 2, 1]], 2f64.sqrt());
        let everything = PairwiseDistance::new(DistanceKind::Hamming, &[], false)
            .forward(&[&x, &y])
            .unwrap();
        assert_eq!(everything, arr0(1.).into_dyn());

        let mismatched = Array::zeros((2, 3)).into_dyn();
        assert!(matches!(
            PairwiseDistance::new(DistanceKind::Dot, &[], false).forward(&[&x, &mismatched]),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_distance_gradients() {
        let x = array![[0.3, -1.2, 2.5, 0.7], [1.1, 0.4, -0.8, 1.9]].into_dyn();
        let y = array![[1.3, 0.2, -0.5, 0.6], [0.1, 0.9, 0.8, -1.4]].into_dyn();
        for kind in DistanceKind::all() {
            if !kind.differentiable() {
                continue;
            }
            for axes in [vec![], vec![1], vec![0]] {
                assert_gradients_match(
                    &PairwiseDistance::new(kind, &axes, false),
                    &[x.clone(), y.clone()],
                    1e-5,
                );
            }
        }
    }
}
