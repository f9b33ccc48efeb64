use ndarray::prelude::*;
use ndarray::IxDyn;

use super::error::Result;
use super::index_accumulations::{position_of_best, Condition};
use super::lanes::{fold_lanes, sign, unfold_lanes};
use super::operations::{unary_input, Operation};
use super::{Graph, Variable};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReductionKind {
    Mean,
    Sum,
    StandardDeviation { bias_corrected: bool },
    Variance { bias_corrected: bool },
    Min,
    Max,
    Product,
    Norm1,
    Norm2,
    NormMax,
    SquaredNorm,
    AMax,
    AMin,
    ASum,
    AMean,
    Entropy,
    LogEntropy,
    ShannonEntropy,
    LogSumExp,
    CountNonZero,
    CountZero,
    ZeroFraction,
    All,
    Any,
    MatchConditionCount(Condition),
}

fn mean(lane: ArrayView1<f64>) -> f64 {
    lane.sum() / lane.len() as f64
}

/// Sum of squared deviations from the mean, and the divisor to apply to it.
fn squared_deviations(lane: ArrayView1<f64>, bias_corrected: bool) -> (f64, f64, f64) {
    let mean = mean(lane);
    let sum = lane.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>();
    let n = lane.len() as f64;
    let divisor = if bias_corrected { n - 1. } else { n };
    (mean, sum, divisor)
}

fn variance(lane: ArrayView1<f64>, bias_corrected: bool) -> f64 {
    if lane.len() < 2 {
        return 0.;
    }
    let (_, sum, divisor) = squared_deviations(lane, bias_corrected);
    sum / divisor
}

fn x_ln_x(x: f64) -> f64 {
    // 0·ln 0 is taken as its limit, 0
    if x == 0. {
        0.
    } else {
        x * x.ln()
    }
}

fn one_hot(length: usize, index: Option<usize>, value: f64) -> Array1<f64> {
    let mut gradient = Array1::zeros(length);
    if let Some(index) = index {
        gradient[index] = value;
    }
    gradient
}

impl ReductionKind {
    /// Every kind, with `condition` standing in for the match-condition count.
    pub fn all(condition: Condition) -> Vec<ReductionKind> {
        use ReductionKind::*;
        vec![
            Mean,
            Sum,
            StandardDeviation { bias_corrected: true },
            StandardDeviation { bias_corrected: false },
            Variance { bias_corrected: true },
            Variance { bias_corrected: false },
            Min,
            Max,
            Product,
            Norm1,
            Norm2,
            NormMax,
            SquaredNorm,
            AMax,
            AMin,
            ASum,
            AMean,
            Entropy,
            LogEntropy,
            ShannonEntropy,
            LogSumExp,
            CountNonZero,
            CountZero,
            ZeroFraction,
            All,
            Any,
            MatchConditionCount(condition),
        ]
    }

    pub fn name(&self) -> &'static str {
        use ReductionKind::*;
        match self {
            Mean => "reduce_mean",
            Sum => "reduce_sum",
            StandardDeviation { .. } => "reduce_stdev",
            Variance { .. } => "reduce_variance",
            Min => "reduce_min",
            Max => "reduce_max",
            Product => "reduce_prod",
            Norm1 => "reduce_norm1",
            Norm2 => "reduce_norm2",
            NormMax => "reduce_normmax",
            SquaredNorm => "reduce_sqnorm",
            AMax => "reduce_amax",
            AMin => "reduce_amin",
            ASum => "reduce_asum",
            AMean => "reduce_amean",
            Entropy => "entropy",
            LogEntropy => "log_entropy",
            ShannonEntropy => "shannon_entropy",
            LogSumExp => "reduce_logsumexp",
            CountNonZero => "count_non_zero",
            CountZero => "count_zero",
            ZeroFraction => "zero_fraction",
            All => "all",
            Any => "any",
            MatchConditionCount(_) => "match_condition_count",
        }
    }

    pub fn differentiable(&self) -> bool {
        use ReductionKind::*;
        !matches!(
            self,
            CountNonZero | CountZero | ZeroFraction | All | Any | MatchConditionCount(_)
        )
    }

    pub fn fold(&self, lane: ArrayView1<f64>) -> f64 {
        use ReductionKind::*;
        let n = lane.len() as f64;
        let count = |predicate: &dyn Fn(f64) -> bool| lane.iter().filter(|&&x| predicate(x)).count() as f64;
        match self {
            Mean => mean(lane),
            Sum => lane.sum(),
            StandardDeviation { bias_corrected } => variance(lane, *bias_corrected).sqrt(),
            Variance { bias_corrected } => variance(lane, *bias_corrected),
            Min => lane.fold(f64::INFINITY, |m, &x| m.min(x)),
            Max => lane.fold(f64::NEG_INFINITY, |m, &x| m.max(x)),
            Product => lane.product(),
            Norm1 | ASum => lane.fold(0., |s, &x| s + x.abs()),
            Norm2 => lane.fold(0., |s, &x| s + x * x).sqrt(),
            NormMax | AMax => lane.fold(0., |m, &x| m.max(x.abs())),
            SquaredNorm => lane.fold(0., |s, &x| s + x * x),
            AMin => lane.fold(f64::INFINITY, |m, &x| m.min(x.abs())),
            AMean => lane.fold(0., |s, &x| s + x.abs()) / n,
            Entropy => -lane.iter().map(|&x| x_ln_x(x)).sum::<f64>(),
            LogEntropy => (-lane.iter().map(|&x| x_ln_x(x)).sum::<f64>()).ln(),
            ShannonEntropy => -lane.iter().map(|&x| x_ln_x(x)).sum::<f64>() / std::f64::consts::LN_2,
            LogSumExp => {
                let maximum = lane.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
                if maximum.is_infinite() {
                    return maximum;
                }
                maximum + lane.iter().map(|&x| (x - maximum).exp()).sum::<f64>().ln()
            }
            CountNonZero => count(&|x| x != 0.),
            CountZero => count(&|x| x == 0.),
            ZeroFraction => count(&|x| x == 0.) / n,
            All => {
                if lane.iter().all(|&x| x != 0.) {
                    1.
                } else {
                    0.
                }
            }
            Any => {
                if lane.iter().any(|&x| x != 0.) {
                    1.
                } else {
                    0.
                }
            }
            MatchConditionCount(condition) => count(&|x| condition.matches(x)),
        }
    }

    /// Gradient of one lane, given its reduced `value` and the incoming
    /// gradient `g` for that value.
    pub fn lane_gradient(&self, lane: ArrayView1<f64>, value: f64, g: f64) -> Array1<f64> {
        use ReductionKind::*;
        let length = lane.len();
        let n = length as f64;
        match self {
            Mean => Array1::from_elem(length, g / n),
            Sum => Array1::from_elem(length, g),
            Variance { bias_corrected } => {
                if length < 2 {
                    return Array1::zeros(length);
                }
                let (mean, _, divisor) = squared_deviations(lane, *bias_corrected);
                lane.mapv(|x| g * 2. * (x - mean) / divisor)
            }
            StandardDeviation { bias_corrected } => {
                if length < 2 || value == 0. {
                    return Array1::zeros(length);
                }
                let (mean, _, divisor) = squared_deviations(lane, *bias_corrected);
                lane.mapv(|x| g * (x - mean) / (divisor * value))
            }
            Min => one_hot(length, position_of_best(lane, |x, best| x < best), g),
            Max => one_hot(length, position_of_best(lane, |x, best| x > best), g),
            Product => {
                // product of all other elements, without dividing by x_i
                let mut prefix = vec![1.; length + 1];
                for i in 0..length {
                    prefix[i + 1] = prefix[i] * lane[i];
                }
                let mut suffix = vec![1.; length + 1];
                for i in (0..length).rev() {
                    suffix[i] = suffix[i + 1] * lane[i];
                }
                Array1::from_shape_fn(length, |i| g * prefix[i] * suffix[i + 1])
            }
            Norm1 | ASum => lane.mapv(|x| g * sign(x)),
            AMean => lane.mapv(|x| g * sign(x) / n),
            Norm2 => {
                if value == 0. {
                    return Array1::zeros(length);
                }
                lane.mapv(|x| g * x / value)
            }
            NormMax | AMax | AMin => {
                let index = match self {
                    AMin => position_of_best(lane, |x, best| x.abs() < best.abs()),
                    _ => position_of_best(lane, |x, best| x.abs() > best.abs()),
                };
                one_hot(length, index, index.map_or(0., |i| g * sign(lane[i])))
            }
            SquaredNorm => lane.mapv(|x| g * 2. * x),
            Entropy => lane.mapv(|x| -g * (x.ln() + 1.)),
            LogEntropy => {
                // value = ln E, so dvalue/dx = (dE/dx)/E
                let entropy = value.exp();
                lane.mapv(|x| -g * (x.ln() + 1.) / entropy)
            }
            ShannonEntropy => lane.mapv(|x| -g * (x.ln() + 1.) / std::f64::consts::LN_2),
            LogSumExp => lane.mapv(|x| g * (x - value).exp()),
            CountNonZero | CountZero | ZeroFraction | All | Any | MatchConditionCount(_) => {
                Array1::zeros(length)
            }
        }
    }
}

/// A reduction of its single input along `axes` (all axes when empty).
pub struct Reduction {
    kind: ReductionKind,
    axes: Vec<usize>,
    keep_dims: bool,
}

impl Reduction {
    pub fn new(kind: ReductionKind, axes: &[usize], keep_dims: bool) -> Self {
        Self {
            kind,
            axes: axes.to_vec(),
            keep_dims,
        }
    }
}

impl Operation for Reduction {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let x = unary_input(self.name(), inputs)?;
        fold_lanes(x, &self.axes, self.keep_dims, |lane| self.kind.fold(lane))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        if !self.kind.differentiable() {
            return Ok(ArrayD::zeros(IxDyn(args[0].shape())));
        }
        unfold_lanes(args[0], &self.axes, output, out_gradient, |lane, value, g| {
            self.kind.lane_gradient(lane, value, g)
        })
    }

    fn differentiable(&self) -> bool {
        self.kind.differentiable()
    }
}

impl Graph {
    pub fn reduce(
        &mut self,
        kind: ReductionKind,
        x: Variable,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<Variable> {
        self.record(Box::new(Reduction::new(kind, axes, keep_dims)), vec![x])
    }

    pub fn mean(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Mean, x, axes, false)
    }

    pub fn sum(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Sum, x, axes, false)
    }

    pub fn standard_deviation(
        &mut self,
        x: Variable,
        bias_corrected: bool,
        axes: &[usize],
    ) -> Result<Variable> {
        self.reduce(
            ReductionKind::StandardDeviation { bias_corrected },
            x,
            axes,
            false,
        )
    }

    pub fn variance(
        &mut self,
        x: Variable,
        bias_corrected: bool,
        axes: &[usize],
    ) -> Result<Variable> {
        self.reduce(ReductionKind::Variance { bias_corrected }, x, axes, false)
    }

    pub fn min(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Min, x, axes, false)
    }

    pub fn max(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Max, x, axes, false)
    }

    pub fn prod(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Product, x, axes, false)
    }

    pub fn norm1(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Norm1, x, axes, false)
    }

    pub fn norm2(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Norm2, x, axes, false)
    }

    pub fn normmax(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::NormMax, x, axes, false)
    }

    pub fn squared_norm(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::SquaredNorm, x, axes, false)
    }

    pub fn amax(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::AMax, x, axes, false)
    }

    pub fn amin(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::AMin, x, axes, false)
    }

    pub fn asum(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::ASum, x, axes, false)
    }

    pub fn amean(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::AMean, x, axes, false)
    }

    pub fn entropy(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Entropy, x, axes, false)
    }

    pub fn log_entropy(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::LogEntropy, x, axes, false)
    }

    pub fn shannon_entropy(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::ShannonEntropy, x, axes, false)
    }

    pub fn log_sum_exp(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::LogSumExp, x, axes, false)
    }

    pub fn count_non_zero(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::CountNonZero, x, axes, false)
    }

    pub fn count_zero(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::CountZero, x, axes, false)
    }

    pub fn zero_fraction(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::ZeroFraction, x, axes, false)
    }

    pub fn all(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::All, x, axes, false)
    }

    pub fn any(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.reduce(ReductionKind::Any, x, axes, false)
    }

    pub fn match_condition_count(
        &mut self,
        x: Variable,
        condition: Condition,
        axes: &[usize],
    ) -> Result<Variable> {
        self.reduce(ReductionKind::MatchConditionCount(condition), x, axes, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::operations::assert_gradients_match;
    use crate::graph::GraphError;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn fold(kind: ReductionKind, values: &[f64]) -> f64 {
        kind.fold(ArrayView1::from(values))
    }

    #[test]
    fn test_mean_along_axes() {
        let x = Array::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64).into_dyn();
        let over_middle = Reduction::new(ReductionKind::Mean, &[1], false)
            .forward(&[&x])
            .unwrap();
        assert_eq!(over_middle.shape(), &[2, 4]);
        for i in 0..2 {
            for k in 0..4 {
                let expected = (0..3).map(|j| x[[i, j, k]]).sum::<f64>() / 3.;
                assert_abs_diff_eq!(over_middle[[i, k]], expected, epsilon = 1e-12);
            }
        }

        let kept = Reduction::new(ReductionKind::Mean, &[0, 2], true)
            .forward(&[&x])
            .unwrap();
        assert_eq!(kept.shape(), &[1, 3, 1]);
        // 4..=7 and 16..=19
        assert_abs_diff_eq!(kept[[0, 1, 0]], 11.5, epsilon = 1e-12);

        let everything = Reduction::new(ReductionKind::Mean, &[], false)
            .forward(&[&x])
            .unwrap();
        assert_eq!(everything.ndim(), 0);
        assert_abs_diff_eq!(everything.sum(), 11.5, epsilon = 1e-12);

        assert!(matches!(
            Reduction::new(ReductionKind::Mean, &[3], false).forward(&[&x]),
            Err(GraphError::InvalidAxis { axis: 3, rank: 3 })
        ));
    }

    #[test]
    fn test_fold_values() {
        use ReductionKind::*;
        let values = [1., -2., 3., -4.];
        assert_eq!(fold(Sum, &values), -2.);
        assert_eq!(fold(Min, &values), -4.);
        assert_eq!(fold(Max, &values), 3.);
        assert_eq!(fold(Product, &values), 24.);
        assert_eq!(fold(Norm1, &values), 10.);
        assert_eq!(fold(ASum, &values), 10.);
        assert_eq!(fold(AMean, &values), 2.5);
        assert_relative_eq!(fold(Norm2, &values), 30f64.sqrt());
        assert_eq!(fold(SquaredNorm, &values), 30.);
        assert_eq!(fold(NormMax, &values), 4.);
        assert_eq!(fold(AMax, &values), 4.);
        assert_eq!(fold(AMin, &values), 1.);
        // mean −0.5, squared deviations 2.25 + 2.25 + 12.25 + 12.25 = 29
        assert_relative_eq!(fold(Variance { bias_corrected: false }, &values), 29. / 4.);
        assert_relative_eq!(fold(Variance { bias_corrected: true }, &values), 29. / 3.);
        assert_relative_eq!(
            fold(StandardDeviation { bias_corrected: true }, &values),
            (29f64 / 3.).sqrt()
        );
        assert_eq!(fold(Variance { bias_corrected: true }, &[5.]), 0.);
        assert_eq!(fold(StandardDeviation { bias_corrected: true }, &[5.]), 0.);
    }

    #[test]
    fn test_entropies() {
        use ReductionKind::*;
        let p = [0.5, 0.25, 0.25];
        let expected = -(0.5 * 0.5f64.ln() + 2. * 0.25 * 0.25f64.ln());
        assert_relative_eq!(fold(Entropy, &p), expected);
        assert_relative_eq!(fold(LogEntropy, &p), expected.ln());
        assert_relative_eq!(fold(ShannonEntropy, &p), 1.5);
        assert_eq!(fold(Entropy, &[0., 1.]), 0.);
    }

    #[test]
    fn test_log_sum_exp_is_stable() {
        use ReductionKind::*;
        assert_relative_eq!(fold(LogSumExp, &[1000., 1000.]), 1000. + 2f64.ln());
        assert_relative_eq!(
            fold(LogSumExp, &[0.5, -1.]),
            (0.5f64.exp() + (-1f64).exp()).ln()
        );
        assert_eq!(fold(LogSumExp, &[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_counting_reductions() {
        use ReductionKind::*;
        let values = [0., 1., 0., -3., 2.];
        assert_eq!(fold(CountNonZero, &values), 3.);
        assert_eq!(fold(CountZero, &values), 2.);
        assert_eq!(fold(ZeroFraction, &values), 0.4);
        assert_eq!(fold(All, &values), 0.);
        assert_eq!(fold(Any, &values), 1.);
        assert_eq!(fold(All, &[1., -1.]), 1.);
        assert_eq!(fold(Any, &[0., 0.]), 0.);
        assert_eq!(
            fold(MatchConditionCount(Condition::GreaterThan(0.5)), &values),
            2.
        );
        assert!(!CountZero.differentiable());
    }

    #[test]
    fn test_extremum_gradients_go_to_first_index() {
        use ReductionKind::*;
        let lane = array![3., 1., 3., 1.];
        assert_eq!(
            Max.lane_gradient(lane.view(), 3., 2.),
            array![2., 0., 0., 0.]
        );
        assert_eq!(
            Min.lane_gradient(lane.view(), 1., 2.),
            array![0., 2., 0., 0.]
        );
        let signed = array![-4., 2., 4.];
        assert_eq!(
            AMax.lane_gradient(signed.view(), 4., 1.),
            array![-1., 0., 0.]
        );
    }

    #[test]
    fn test_product_gradient_with_zero() {
        let lane = array![2., 0., 5.];
        assert_eq!(
            ReductionKind::Product.lane_gradient(lane.view(), 0., 1.),
            array![0., 10., 0.]
        );
    }

    #[test]
    fn test_reduction_gradients() {
        let x = array![[0.3, -1.2, 2.5, 0.7], [1.1, 0.4, -0.8, 1.9], [-2.2, 0.6, 0.9, -0.1]]
            .into_dyn();
        let positive = x.mapv(|v: f64| v.abs() / 3. + 0.05);
        for kind in ReductionKind::all(Condition::GreaterThan(0.)) {
            if !kind.differentiable() {
                continue;
            }
            let input = match kind {
                ReductionKind::Entropy | ReductionKind::LogEntropy | ReductionKind::ShannonEntropy => {
                    positive.clone()
                }
                _ => x.clone(),
            };
            for axes in [vec![], vec![0], vec![1]] {
                assert_gradients_match(&Reduction::new(kind, &axes, false), &[input.clone()], 1e-5);
            }
            assert_gradients_match(&Reduction::new(kind, &[1], true), &[input.clone()], 1e-5);
        }
    }

    #[test]
    fn test_graph_reduction_backprop() {
        let mut graph = Graph::new();
        let x = graph
            .variable("x", array![[1., 2.], [3., 4.]].into_dyn())
            .unwrap();
        let column_means = graph.mean(x, &[0]).unwrap();
        let total = graph.sum(column_means, &[]).unwrap();
        let activations = graph.execute(&[column_means, total]).unwrap();
        assert_eq!(activations.array(column_means).unwrap(), &array![2., 3.].into_dyn());
        assert_eq!(activations.item(total).unwrap(), 5.);
        let gradients = graph.execute_backward(&[total]).unwrap();
        assert_eq!(
            gradients.array(x).unwrap(),
            &Array::from_elem((2, 2), 0.5).into_dyn()
        );
    }
}
