//! Built-in validation suites. Every suite returns the failure messages of
//! its cases; an empty list means everything passed.

use std::f64::consts::LN_2;

use log::info;
use ndarray::prelude::*;
use ndarray::IxDyn;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::matrices::{all_test_matrices_with_shape, fortran_copy, normal_array, uniform_array};
use super::{validate, TestCase};
use crate::graph::distances::DistanceKind;
use crate::graph::index_accumulations::{Condition, IndexAccumulationKind};
use crate::graph::reductions::ReductionKind;
use crate::graph::{Graph, Result, Variable};

const SEED: u64 = 12345;

pub type Suite = fn() -> Vec<String>;

pub fn suites() -> Vec<(&'static str, Suite)> {
    vec![
        ("stdev", stdev as Suite),
        ("zero_count", zero_count),
        ("zero_fraction", zero_fraction),
        ("reduction_gradients_simple", reduction_gradients_simple),
        ("reduction_gradients_non_final", reduction_gradients_non_final),
        ("reduction_gradients_along_axes", reduction_gradients_along_axes),
        ("reduce3", reduce3),
        ("moments", moments),
        ("normalize_moments", normalize_moments),
        ("all_any", all_any),
        ("index_accumulations", index_accumulations),
        ("reductions_backwards", reductions_backwards),
        ("dot_product_attention", dot_product_attention),
        ("multi_head_attention", multi_head_attention),
    ]
}

pub fn suite(name: &str) -> Option<Suite> {
    suites()
        .into_iter()
        .find(|(suite_name, _)| *suite_name == name)
        .map(|(_, suite)| suite)
}

fn run(failures: &mut Vec<String>, name: &str, test_case: Result<TestCase>) {
    match test_case {
        Ok(mut test_case) => {
            if let Err(error) = validate(&mut test_case) {
                failures.push(error.to_string());
            }
        }
        Err(error) => failures.push(format!("{}: {}", name, error)),
    }
}

/// Output shape and lanes (in C order) of reducing `x` along `axes`, all
/// axes when empty, gathered element by element.
fn lanes(x: &ArrayD<f64>, axes: &[usize]) -> (Vec<usize>, Vec<Vec<f64>>) {
    let rank = x.ndim();
    let mut reduced = if axes.is_empty() {
        (0..rank).collect::<Vec<_>>()
    } else {
        axes.to_vec()
    };
    reduced.sort_unstable();
    reduced.dedup();
    let kept = (0..rank).filter(|axis| !reduced.contains(axis)).collect::<Vec<_>>();
    let kept_shape = kept.iter().map(|&axis| x.shape()[axis]).collect::<Vec<_>>();
    let reduced_shape = reduced.iter().map(|&axis| x.shape()[axis]).collect::<Vec<_>>();

    let mut lanes = Vec::new();
    for outer in ndarray::indices(IxDyn(&kept_shape)) {
        let mut lane = Vec::new();
        for inner in ndarray::indices(IxDyn(&reduced_shape)) {
            let mut index = vec![0; rank];
            for (i, &axis) in kept.iter().enumerate() {
                index[axis] = outer[i];
            }
            for (i, &axis) in reduced.iter().enumerate() {
                index[axis] = inner[i];
            }
            lane.push(x[index.as_slice()]);
        }
        lanes.push(lane);
    }
    (kept_shape, lanes)
}

fn reduce_reference(
    x: &ArrayD<f64>,
    axes: &[usize],
    f: impl Fn(&[f64]) -> f64,
) -> Result<ArrayD<f64>> {
    let (shape, lanes) = lanes(x, axes);
    let values = lanes.iter().map(|lane| f(lane)).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

fn paired_reference(
    x: &ArrayD<f64>,
    y: &ArrayD<f64>,
    axes: &[usize],
    f: impl Fn(&[f64], &[f64]) -> f64,
) -> Result<ArrayD<f64>> {
    let (shape, x_lanes) = lanes(x, axes);
    let (_, y_lanes) = lanes(y, axes);
    let values = x_lanes
        .iter()
        .zip(&y_lanes)
        .map(|(x_lane, y_lane)| f(x_lane, y_lane))
        .collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

fn reference_reduction(kind: ReductionKind, lane: &[f64]) -> f64 {
    use ReductionKind::*;
    let n = lane.len() as f64;
    let mean = lane.iter().sum::<f64>() / n;
    let squared_deviations = lane.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    let entropy = -lane
        .iter()
        .map(|&x| if x == 0. { 0. } else { x * x.ln() })
        .sum::<f64>();
    let count = |predicate: &dyn Fn(f64) -> bool| lane.iter().filter(|&&x| predicate(x)).count() as f64;
    match kind {
        Mean => mean,
        Sum => lane.iter().sum(),
        StandardDeviation { bias_corrected } => {
            reference_reduction(Variance { bias_corrected }, lane).sqrt()
        }
        Variance {
            bias_corrected: true,
        } => {
            if lane.len() < 2 {
                0.
            } else {
                squared_deviations / (n - 1.)
            }
        }
        Variance {
            bias_corrected: false,
        } => squared_deviations / n,
        Min => lane.iter().copied().fold(f64::INFINITY, f64::min),
        Max => lane.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Product => lane.iter().product(),
        Norm1 | ASum => lane.iter().map(|x| x.abs()).sum(),
        Norm2 => lane.iter().map(|x| x * x).sum::<f64>().sqrt(),
        NormMax | AMax => lane.iter().map(|x| x.abs()).fold(0., f64::max),
        SquaredNorm => lane.iter().map(|x| x * x).sum(),
        AMin => lane.iter().map(|x| x.abs()).fold(f64::INFINITY, f64::min),
        AMean => lane.iter().map(|x| x.abs()).sum::<f64>() / n,
        Entropy => entropy,
        LogEntropy => entropy.ln(),
        ShannonEntropy => entropy / LN_2,
        LogSumExp => lane.iter().map(|x| x.exp()).sum::<f64>().ln(),
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

fn reference_distance(kind: DistanceKind, x: &[f64], y: &[f64]) -> f64 {
    use DistanceKind::*;
    let pairs = || x.iter().zip(y);
    let dot = pairs().map(|(a, b)| a * b).sum::<f64>();
    let norms = x.iter().map(|a| a * a).sum::<f64>().sqrt() * y.iter().map(|b| b * b).sum::<f64>().sqrt();
    match kind {
        Manhattan => pairs().map(|(a, b)| (a - b).abs()).sum(),
        Euclidean => pairs().map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt(),
        CosineSimilarity => dot / norms,
        CosineDistance => 1. - dot / norms,
        Hamming => pairs().filter(|(a, b)| a != b).count() as f64 / x.len() as f64,
        Jaccard => {
            let minima = pairs().map(|(a, b)| a.min(*b)).sum::<f64>();
            let maxima = pairs().map(|(a, b)| a.max(*b)).sum::<f64>();
            1. - minima / maxima
        }
        Dot => dot,
    }
}

/// `rows × cols` evenly spaced values from `start` to `end`, row by row.
fn linspace_matrix(start: f64, end: f64, rows: usize, cols: usize) -> ArrayD<f64> {
    let steps = (rows * cols).saturating_sub(1).max(1) as f64;
    ArrayD::from_shape_fn(IxDyn(&[rows, cols]), |index| {
        start + (end - start) * (index[0] * cols + index[1]) as f64 / steps
    })
}

fn first_position(lane: &[f64], better: impl Fn(f64, f64) -> bool) -> f64 {
    let mut best = 0;
    for i in 1..lane.len() {
        if better(lane[i], lane[best]) {
            best = i;
        }
    }
    best as f64
}

fn reference_index(kind: IndexAccumulationKind, lane: &[f64]) -> f64 {
    use IndexAccumulationKind::*;
    match kind {
        ArgMax => first_position(lane, |x, best| x > best),
        ArgMin => first_position(lane, |x, best| x < best),
        IAMax => first_position(lane, |x, best| x.abs() > best.abs()),
        IAMin => first_position(lane, |x, best| x.abs() < best.abs()),
        FirstIndex(condition) => lane
            .iter()
            .position(|&x| condition.matches(x))
            .map_or(-1., |i| i as f64),
        LastIndex(condition) => lane
            .iter()
            .rposition(|&x| condition.matches(x))
            .map_or(-1., |i| i as f64),
    }
}

fn stdev_case(matrix: &ArrayD<f64>, description: &str, bias_corrected: bool) -> Result<TestCase> {
    let expected = reduce_reference(matrix, &[], |lane| {
        reference_reduction(ReductionKind::StandardDeviation { bias_corrected }, lane)
    })?;
    let mut graph = Graph::new();
    let input = graph.variable("in", matrix.clone())?;
    let stdev = graph.standard_deviation(input, bias_corrected, &[])?;
    Ok(TestCase::new(graph)
        .test_name(format!("{} - bias corrected = {}", description, bias_corrected))
        .expected(stdev, expected)
        .gradient_check(false))
}

/// Standard deviation of every element, for inputs in every memory layout.
pub fn stdev() -> Vec<String> {
    let mut failures = Vec::new();
    for (matrix, description) in all_test_matrices_with_shape(3, 4, SEED) {
        for bias_corrected in [false, true] {
            run(
                &mut failures,
                &description,
                stdev_case(&matrix, &description, bias_corrected),
            );
        }
    }
    failures
}

fn zero_count_case(name: &str, input: ArrayD<f64>, non_zero: f64, zero: f64) -> Result<TestCase> {
    let mut graph = Graph::new();
    let x = graph.declare("in", &[Some(2), Some(2)])?;
    graph.associate_array(x, input)?;
    let non_zero_count = graph.count_non_zero(x, &[])?;
    let zero_count = graph.count_zero(x, &[])?;
    let total = graph.add(non_zero_count, zero_count)?;
    graph.standard_deviation(total, true, &[])?;
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected(non_zero_count, arr0(non_zero).into_dyn())
        .expected(zero_count, arr0(zero).into_dyn())
        .gradient_check(false))
}

pub fn zero_count() -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    run(
        &mut failures,
        "zero count - binary",
        zero_count_case(
            "zero count - binary",
            array![[0., 1.], [0., 1.]].into_dyn(),
            2.,
            2.,
        ),
    );
    run(
        &mut failures,
        "zero count - uniform",
        zero_count_case(
            "zero count - uniform",
            uniform_array(&[2, 2], 0.05, 1., &mut rng),
            4.,
            0.,
        ),
    );
    failures
}

fn zero_fraction_case(
    name: &str,
    input: ArrayD<f64>,
    fraction: f64,
    gradient_check: bool,
) -> Result<TestCase> {
    let mut graph = Graph::new();
    let x = graph.declare("in", &[Some(2), Some(2)])?;
    graph.associate_array(x, input)?;
    let zero_fraction = graph.zero_fraction(x, &[])?;
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected(zero_fraction, arr0(fraction).into_dyn())
        .gradient_check(gradient_check))
}

pub fn zero_fraction() -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    // zeros and ones are not gradient checkable
    run(
        &mut failures,
        "zero fraction - binary",
        zero_fraction_case(
            "zero fraction - binary",
            array![[0., 1.], [0., 1.]].into_dyn(),
            0.5,
            false,
        ),
    );
    run(
        &mut failures,
        "zero fraction - uniform",
        zero_fraction_case(
            "zero fraction - uniform",
            uniform_array(&[2, 2], 0.05, 1., &mut rng),
            0.,
            true,
        ),
    );
    failures
}

fn simple_reduction_case(name: &str, kind: ReductionKind, input: ArrayD<f64>) -> Result<TestCase> {
    let expected = reduce_reference(&input, &[], |lane| reference_reduction(kind, lane))?;
    let mut graph = Graph::new();
    let x = graph.declare("in", &[None, Some(4)])?;
    graph.associate_array(x, input)?;
    let loss = graph.reduce(kind, x, &[], false)?;
    graph.rename(loss, "loss")?;
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected_named("loss", expected))
}

/// Each reduction as the final and only function of the graph.
pub fn reduction_gradients_simple() -> Vec<String> {
    use ReductionKind::*;
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let (minibatch, n_out) = (10, 4);
    let kinds = [
        Mean,
        Sum,
        StandardDeviation {
            bias_corrected: true,
        },
        Min,
        Max,
        Variance {
            bias_corrected: true,
        },
        Product,
        Norm1,
        Norm2,
        NormMax,
        CountNonZero,
        CountZero,
        AMax,
        AMin,
        ASum,
        AMean,
        Entropy,
        LogSumExp,
        SquaredNorm,
        LogEntropy,
        ShannonEntropy,
    ];
    for (i, kind) in kinds.into_iter().enumerate() {
        let input = match kind {
            Product => uniform_array(&[minibatch, n_out], 0.5, 1.5, &mut rng),
            Entropy => linspace_matrix(0.01, 0.99, minibatch, n_out),
            LogSumExp | SquaredNorm | LogEntropy | ShannonEntropy => {
                uniform_array(&[minibatch, n_out], 0.05, 1., &mut rng)
            }
            _ => normal_array(&[minibatch, n_out], 100., &mut rng),
        };
        let name = format!("test: {} - {}", i, kind.name());
        info!("*** starting test: {}", name);
        run(&mut failures, &name, simple_reduction_case(&name, kind, input));
    }
    failures
}

/// `mean((input − label)², axis 1)`, the per-example squared error.
fn squared_error_per_example(graph: &mut Graph, input: Variable, label: Variable) -> Result<Variable> {
    let difference = graph.sub(input, label)?;
    let squared = graph.mul(difference, difference)?;
    let per_example = graph.mean(squared, &[1])?;
    graph.rename(per_example, "mse_per_example")?;
    Ok(per_example)
}

fn squared_error_reference(input: &ArrayD<f64>, label: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let squared = (input - label).mapv(|d| d * d);
    reduce_reference(&squared, &[1], |lane| lane.iter().sum::<f64>() / lane.len() as f64)
}

/// Gradient-check tolerances `(max relative, minimum absolute)` for a
/// reduction of per-example squared errors of ×100 normals. Those errors are
/// around 2e4, so finite differences carry rounding noise of about 1e-6 in
/// sums and far more in variances.
fn non_final_tolerances(kind: ReductionKind) -> (f64, f64) {
    match kind {
        ReductionKind::Variance { .. } => (1e-3, 1.),
        _ => (1e-4, 1e-4),
    }
}

fn non_final_case(
    name: &str,
    kind: ReductionKind,
    axes: &[usize],
    input: ArrayD<f64>,
    label: ArrayD<f64>,
) -> Result<TestCase> {
    let per_example = squared_error_reference(&input, &label)?;
    let expected = reduce_reference(&per_example, axes, |lane| reference_reduction(kind, lane))?;
    let mut graph = Graph::new();
    let x = graph.variable("in", input)?;
    let y = graph.variable("label", label)?;
    let squared_error = squared_error_per_example(&mut graph, x, y)?;
    let loss = graph.reduce(kind, squared_error, axes, false)?;
    graph.rename(loss, "loss")?;
    let (max_relative_error, minimum_absolute_error) = non_final_tolerances(kind);
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected_named("loss", expected)
        .max_relative_error(max_relative_error)
        .minimum_absolute_error(minimum_absolute_error))
}

/// Each reduction as the final function, applied to a per-example loss.
pub fn reduction_gradients_non_final() -> Vec<String> {
    use ReductionKind::*;
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let (minibatch, n_out) = (10, 4);
    let kinds = [
        Mean,
        Sum,
        StandardDeviation {
            bias_corrected: true,
        },
        Min,
        Max,
        Variance {
            bias_corrected: true,
        },
        Product,
        Norm1,
        Norm2,
        NormMax,
        Entropy,
        LogEntropy,
        AMax,
        AMin,
        ASum,
        AMean,
    ];
    // reducing the only axis and reducing everything are the same here
    for axes in [vec![0], vec![]] {
        for (i, kind) in kinds.into_iter().enumerate() {
            let (input, label) = if kind == LogEntropy {
                (
                    uniform_array(&[minibatch, n_out], 0., 1., &mut rng),
                    uniform_array(&[minibatch, n_out], 0., 1., &mut rng),
                )
            } else {
                (
                    normal_array(&[minibatch, n_out], 100., &mut rng),
                    normal_array(&[minibatch, n_out], 100., &mut rng),
                )
            };
            let name = format!("(test {} - {}, axes={:?})", i, kind.name(), axes);
            info!("*** starting test: {}", name);
            run(
                &mut failures,
                &name,
                non_final_case(&name, kind, &axes, input, label),
            );
        }
    }
    failures
}

#[derive(Debug, Clone, Copy)]
enum AxisReduction {
    Reduce(ReductionKind),
    Index(IndexAccumulationKind),
}

impl AxisReduction {
    fn name(&self) -> &'static str {
        match self {
            AxisReduction::Reduce(kind) => kind.name(),
            AxisReduction::Index(kind) => kind.name(),
        }
    }

    fn reference(&self, lane: &[f64]) -> f64 {
        match *self {
            AxisReduction::Reduce(kind) => reference_reduction(kind, lane),
            AxisReduction::Index(kind) => reference_index(kind, lane),
        }
    }

    fn gradient_checkable(&self) -> bool {
        match self {
            AxisReduction::Reduce(kind) => kind.differentiable(),
            AxisReduction::Index(_) => false,
        }
    }
}

/// Inputs, labels and gradient-check tolerances for reducing `2·input`
/// along one axis; magnitudes are chosen per reduction to keep finite
/// differences meaningful.
struct AlongAxisInputs {
    input: ArrayD<f64>,
    label: ArrayD<f64>,
    max_relative_error: f64,
    minimum_absolute_error: f64,
}

fn along_axis_inputs(
    reduction: AxisReduction,
    shape: &[usize],
    out_shape: &[usize],
    rng: &mut StdRng,
) -> AlongAxisInputs {
    use ReductionKind::*;
    let mut inputs = AlongAxisInputs {
        input: normal_array(shape, 1000., rng),
        label: normal_array(out_shape, 1000., rng),
        max_relative_error: 1e-4,
        minimum_absolute_error: 1e-4,
    };
    let AxisReduction::Reduce(kind) = reduction else {
        return inputs;
    };
    match kind {
        Sum => {
            inputs.input /= 100.;
            inputs.label /= 100.;
        }
        StandardDeviation { .. } => {
            inputs.input /= 1000.;
            inputs.label /= 1000.;
        }
        Variance { .. } => {
            // scores and gradients are huge; keep inputs away from zero
            inputs.max_relative_error = 1e-3;
            inputs.minimum_absolute_error = 1.;
            inputs.input /= 10.;
            inputs.label /= 100.;
            let replacements = uniform_array(shape, 100., 200., rng);
            inputs
                .input
                .zip_mut_with(&replacements, |x, &r| {
                    if x.abs() < 1. {
                        *x = r;
                    }
                });
        }
        Product => {
            inputs.input = uniform_array(shape, 0.5, 1.5, rng);
            inputs.label = uniform_array(out_shape, 0.5, 1.5, rng);
        }
        Norm1 => {
            inputs.input = uniform_array(shape, 0., 10., rng);
            inputs.label = uniform_array(out_shape, 0., 10., rng);
        }
        Norm2 => {
            inputs.max_relative_error = 1e-3;
        }
        NormMax => {
            inputs.input = uniform_array(shape, 0., 1., rng);
            inputs.label = uniform_array(out_shape, 0., 1., rng);
        }
        _ => {}
    }
    inputs
}

fn along_axis_case(
    name: &str,
    reduction: AxisReduction,
    axis: usize,
    inputs: AlongAxisInputs,
) -> Result<TestCase> {
    let doubled = inputs.input.mapv(|x| 2. * x);
    let expected = reduce_reference(&doubled, &[axis], |lane| reduction.reference(lane))?;

    let mut graph = Graph::new();
    graph.set_log_execution(false);
    let x = graph.variable("in", inputs.input)?;
    let label = graph.variable("label", inputs.label)?;
    let second = graph.scalar_mul(x, 2.)?;
    let reduced = match reduction {
        AxisReduction::Reduce(kind) => graph.reduce(kind, second, &[axis], false)?,
        AxisReduction::Index(kind) => graph.index_accumulation(kind, second, &[axis], false)?,
    };
    graph.rename(reduced, "reduced")?;
    let shifted = graph.scalar_add(reduced, 1.)?;
    let difference = graph.sub(label, shifted)?;
    let squared = graph.mul(difference, difference)?;
    let loss = graph.mean(squared, &[])?;
    graph.rename(loss, "loss")?;

    Ok(TestCase::new(graph)
        .test_name(name)
        .expected(reduced, expected)
        .gradient_check(reduction.gradient_checkable())
        .max_relative_error(inputs.max_relative_error)
        .minimum_absolute_error(inputs.minimum_absolute_error))
}

/// Each reduction as an intermediate function, along each axis of a rank-3
/// input.
pub fn reduction_gradients_along_axes() -> Vec<String> {
    use ReductionKind::*;
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let shape = [3, 4, 5];
    let reductions = [
        AxisReduction::Reduce(Mean),
        AxisReduction::Reduce(Sum),
        AxisReduction::Reduce(StandardDeviation {
            bias_corrected: true,
        }),
        AxisReduction::Reduce(Min),
        AxisReduction::Reduce(Max),
        AxisReduction::Reduce(Variance {
            bias_corrected: true,
        }),
        AxisReduction::Reduce(Product),
        AxisReduction::Reduce(Norm1),
        AxisReduction::Reduce(Norm2),
        AxisReduction::Reduce(NormMax),
        AxisReduction::Index(IndexAccumulationKind::ArgMax),
        AxisReduction::Index(IndexAccumulationKind::ArgMin),
        AxisReduction::Reduce(CountNonZero),
        AxisReduction::Reduce(CountZero),
        AxisReduction::Reduce(AMax),
        AxisReduction::Reduce(AMin),
        AxisReduction::Reduce(ASum),
        AxisReduction::Reduce(AMean),
    ];
    for axis in 0..shape.len() {
        let out_shape = shape
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != axis)
            .map(|(_, &extent)| extent)
            .collect::<Vec<_>>();
        for (i, &reduction) in reductions.iter().enumerate() {
            let inputs = along_axis_inputs(reduction, &shape, &out_shape, &mut rng);
            let name = format!("(test {} - {}, axis={})", i, reduction.name(), axis);
            info!("*** starting test: {}", name);
            run(
                &mut failures,
                &name,
                along_axis_case(&name, reduction, axis, inputs),
            );
        }
    }
    failures
}

fn reduce3_case(
    name: &str,
    kind: DistanceKind,
    axes: &[usize],
    x: ArrayD<f64>,
    y: ArrayD<f64>,
) -> Result<TestCase> {
    let expected = paired_reference(&x, &y, axes, |a, b| reference_distance(kind, a, b))?;
    let mut graph = Graph::new();
    graph.set_log_execution(false);
    let input = graph.declare("in", &[None, Some(4), Some(5)])?;
    let other = graph.declare("in2", &[None, Some(4), Some(5)])?;
    graph.associate_array(input, x)?;
    graph.associate_array(other, y)?;
    let reduced = graph.pairwise_distance(kind, input, other, axes, false)?;
    // a no-op for the full reductions
    graph.sum(reduced, &[])?;
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected(reduced, expected)
        .gradient_check(kind.differentiable()))
}

/// Pairwise distances along every subset of axes of a rank-3 input: output
/// shapes, values and gradients.
pub fn reduce3() -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let shape = [3, 4, 5];
    let axis_sets: [&[usize]; 8] = [&[], &[0, 1, 2], &[0], &[1], &[2], &[0, 1], &[0, 2], &[1, 2]];
    for axes in axis_sets {
        for kind in DistanceKind::all() {
            let (x, y) = match kind {
                DistanceKind::CosineSimilarity | DistanceKind::CosineDistance => (
                    normal_array(&shape, 1., &mut rng),
                    normal_array(&shape, 1., &mut rng),
                ),
                // positive inputs keep the min/max ratio well conditioned
                DistanceKind::Jaccard => (
                    uniform_array(&shape, 0.1, 1.1, &mut rng),
                    uniform_array(&shape, 0.1, 1.1, &mut rng),
                ),
                _ => (
                    normal_array(&shape, 100., &mut rng),
                    normal_array(&shape, 100., &mut rng),
                ),
            };
            let name = format!("(test {}, axes={:?})", kind.name(), axes);
            info!("*** starting test: {}", name);
            run(&mut failures, &name, reduce3_case(&name, kind, axes, x, y));
        }
    }
    failures
}

fn moments_case(axes: &[usize]) -> Result<TestCase> {
    let input = linspace_matrix(1., 12., 3, 4);
    let expected_mean = reduce_reference(&input, axes, |lane| {
        reference_reduction(ReductionKind::Mean, lane)
    })?;
    let expected_variance = reduce_reference(&input, axes, |lane| {
        reference_reduction(
            ReductionKind::Variance {
                bias_corrected: false,
            },
            lane,
        )
    })?;

    let mut graph = Graph::new();
    let x = graph.variable("in", input)?;
    let (mean, variance) = graph.moments(x, axes)?;
    let total = graph.add(mean, variance)?;
    if axes.len() < 2 {
        graph.standard_deviation(total, true, &[])?;
    } else {
        graph.mean(total, &[])?;
    }
    Ok(TestCase::new(graph)
        .test_name(format!("moments {:?}", axes))
        .expected(mean, expected_mean)
        .expected(variance, expected_variance))
}

pub fn moments() -> Vec<String> {
    let mut failures = Vec::new();
    for axes in [vec![0], vec![1], vec![0, 1]] {
        let name = format!("moments {:?}", axes);
        run(&mut failures, &name, moments_case(&axes));
    }
    failures
}

fn normalize_moments_case() -> Result<TestCase> {
    let data = linspace_matrix(1., 100., 10, 10);
    let sum = reduce_reference(&data, &[0], |lane| lane.iter().sum())?;
    let squared_sum = reduce_reference(&data, &[0], |lane| lane.iter().map(|x| x * x).sum())?;
    let expected_mean =
        reduce_reference(&data, &[0], |lane| reference_reduction(ReductionKind::Mean, lane))?;
    let expected_variance = reduce_reference(&data, &[0], |lane| {
        reference_reduction(
            ReductionKind::Variance {
                bias_corrected: false,
            },
            lane,
        )
    })?;

    let mut graph = Graph::new();
    let count = graph.constant("count", arr0(10.).into_dyn())?;
    let sum = graph.variable("sum", sum)?;
    let squared_sum = graph.variable("squared_sum", squared_sum)?;
    let (mean, variance) = graph.normalize_moments(count, sum, squared_sum, None)?;
    Ok(TestCase::new(graph)
        .test_name("normalize moments")
        .expected(mean, expected_mean)
        .expected(variance, expected_variance))
}

pub fn normalize_moments() -> Vec<String> {
    let mut failures = Vec::new();
    run(&mut failures, "normalize moments", normalize_moments_case());
    failures
}

fn all_any_case(name: &str, input: ArrayD<f64>, all: bool, any: bool) -> Result<TestCase> {
    let mut graph = Graph::new();
    let x = graph.variable("in", input)?;
    let all_variable = graph.all(x, &[])?;
    let any_variable = graph.any(x, &[])?;
    let indicator = |b: bool| arr0(if b { 1. } else { 0. }).into_dyn();
    Ok(TestCase::new(graph)
        .test_name(name)
        .gradient_check(false)
        .expected(all_variable, indicator(all))
        .expected(any_variable, indicator(any)))
}

pub fn all_any() -> Vec<String> {
    let mut failures = Vec::new();
    let mut mixed = Array2::<f64>::zeros((3, 4));
    mixed.row_mut(1).fill(1.);
    let cases = [
        ("all zeros", Array2::<f64>::zeros((3, 4)).into_dyn(), false, false),
        ("all ones", Array2::<f64>::ones((3, 4)).into_dyn(), true, true),
        ("mixed", mixed.into_dyn(), false, true),
    ];
    for (name, input, all, any) in cases {
        run(&mut failures, name, all_any_case(name, input, all, any));
    }
    failures
}

fn index_accumulation_case(
    name: &str,
    reduction: AxisReduction,
    input: &ArrayD<f64>,
    axes: &[usize],
) -> Result<TestCase> {
    let expected = reduce_reference(input, axes, |lane| reduction.reference(lane))?;
    let mut graph = Graph::new();
    let x = graph.variable("in", input.clone())?;
    let reduced = match reduction {
        AxisReduction::Reduce(kind) => graph.reduce(kind, x, axes, false)?,
        AxisReduction::Index(kind) => graph.index_accumulation(kind, x, axes, false)?,
    };
    if axes.len() == 1 {
        graph.standard_deviation(reduced, true, &[])?;
    } else {
        graph.mean(reduced, &[])?;
    }
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected(reduced, expected)
        .gradient_check(false))
}

/// Index accumulations and condition counts along rows, columns and
/// everything.
pub fn index_accumulations() -> Vec<String> {
    use IndexAccumulationKind::*;
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let input = uniform_array(&[3, 4], 0.05, 1., &mut rng);
    let positive = Condition::GreaterThan(0.);
    let reductions = [
        AxisReduction::Index(ArgMax),
        AxisReduction::Index(ArgMin),
        AxisReduction::Index(IAMax),
        AxisReduction::Index(IAMin),
        AxisReduction::Index(FirstIndex(positive)),
        AxisReduction::Index(LastIndex(positive)),
        AxisReduction::Reduce(ReductionKind::MatchConditionCount(positive)),
    ];
    for axes in [vec![0], vec![1], vec![0, 1], vec![]] {
        for reduction in reductions {
            let name = format!("{} - {:?}", reduction.name(), axes);
            info!("starting: {}", name);
            run(
                &mut failures,
                &name,
                index_accumulation_case(&name, reduction, &input, &axes),
            );
        }
    }
    failures
}

fn reductions_backwards_case(kind: ReductionKind, rng: &mut StdRng) -> Result<Vec<String>> {
    let (minibatch, n_out) = (3, 4);
    let mut graph = Graph::new();
    let input = graph.declare("in", &[Some(minibatch), Some(n_out)])?;
    let label = graph.declare("label", &[Some(minibatch), Some(n_out)])?;
    let squared_error = squared_error_per_example(&mut graph, input, label)?;
    graph.reduce(kind, squared_error, &[0], false)?;
    graph.associate_array(input, uniform_array(&[minibatch, n_out], 0., 1., rng))?;
    graph.associate_array(label, uniform_array(&[minibatch, n_out], 0., 1., rng))?;

    let mut problems = Vec::new();
    let (_, result) = graph.execute_final()?;
    if result.len() != 1 {
        problems.push(format!(
            "{}: expected a single loss value, got shape {:?}",
            kind.name(),
            result.shape()
        ));
    }
    let gradients = graph.execute_backward(&[])?;
    for variable in [input, label] {
        let shape = graph.array(variable)?.shape();
        match gradients.get(variable) {
            Some(gradient) if gradient.shape() == shape => {}
            Some(gradient) => problems.push(format!(
                "{}: gradient of {} has shape {:?}, expected {:?}",
                kind.name(),
                graph.identifier(variable)?,
                gradient.shape(),
                shape
            )),
            None => problems.push(format!(
                "{}: no gradient for {}",
                kind.name(),
                graph.identifier(variable)?
            )),
        }
    }
    Ok(problems)
}

/// Forward and backward passes through reductions of a per-example loss.
pub fn reductions_backwards() -> Vec<String> {
    use ReductionKind::*;
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let kinds = [
        Mean,
        Sum,
        StandardDeviation {
            bias_corrected: true,
        },
        Min,
        Max,
        Variance {
            bias_corrected: true,
        },
        Product,
    ];
    for (i, kind) in kinds.into_iter().enumerate() {
        info!("*** starting test: test: {} - {}", i, kind.name());
        match reductions_backwards_case(kind, &mut rng) {
            Ok(problems) => failures.extend(problems),
            Err(error) => failures.push(format!("{}: {}", kind.name(), error)),
        }
    }
    failures
}

/// `softmax(KᵗQ/√F + mask bias)` applied to `V`, computed one score at a
/// time over the leading (batch and head) axes.
fn reference_attention(
    queries: &ArrayD<f64>,
    keys: &ArrayD<f64>,
    values: &ArrayD<f64>,
    mask: Option<&ArrayD<f64>>,
    scaled: bool,
) -> ArrayD<f64> {
    let rank = queries.ndim();
    let leading = &queries.shape()[..rank - 2];
    let features = queries.shape()[rank - 2];
    let query_count = queries.shape()[rank - 1];
    let timesteps = keys.shape()[rank - 1];
    let value_features = values.shape()[rank - 2];
    let mut shape = leading.to_vec();
    shape.extend([value_features, query_count]);
    let mut output = ArrayD::zeros(IxDyn(&shape));

    for lead in ndarray::indices(IxDyn(leading)) {
        let at = |i: usize, j: usize| {
            let mut index = lead.slice().to_vec();
            index.extend([i, j]);
            index
        };
        for q in 0..query_count {
            let mut weights = (0..timesteps)
                .map(|t| {
                    let mut score = (0..features)
                        .map(|f| keys[at(f, t).as_slice()] * queries[at(f, q).as_slice()])
                        .sum::<f64>();
                    if scaled {
                        score /= (features as f64).sqrt();
                    }
                    if let Some(mask) = mask {
                        if mask[[lead[0], t]] == 0. {
                            score -= 1e9;
                        }
                    }
                    score
                })
                .collect::<Vec<_>>();
            let maximum = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let total = weights.iter().map(|w| (w - maximum).exp()).sum::<f64>();
            for weight in weights.iter_mut() {
                *weight = (*weight - maximum).exp() / total;
            }
            for c in 0..value_features {
                output[at(c, q).as_slice()] = (0..timesteps)
                    .map(|t| values[at(c, t).as_slice()] * weights[t])
                    .sum();
            }
        }
    }
    output
}

/// 0/1 mask with roughly 80% ones; the first timestep is never masked.
fn random_mask(batch: usize, timesteps: usize, rng: &mut StdRng) -> ArrayD<f64> {
    let mut mask = uniform_array(&[batch, timesteps], 0., 1., rng).mapv(|x| if x >= 0.2 { 1. } else { 0. });
    for b in 0..batch {
        mask[[b, 0]] = 1.;
    }
    mask
}

struct AttentionInputs {
    queries: ArrayD<f64>,
    keys: ArrayD<f64>,
    values: ArrayD<f64>,
    mask: Option<ArrayD<f64>>,
}

fn attention_case(name: &str, inputs: &AttentionInputs, mark_as_loss: bool) -> Result<TestCase> {
    let expected = reference_attention(
        &inputs.queries,
        &inputs.keys,
        &inputs.values,
        inputs.mask.as_ref(),
        true,
    )
    .mapv(f64::abs)
    .sum();

    let mut graph = Graph::new();
    let q = graph.variable("q", inputs.queries.clone())?;
    let k = graph.variable("k", inputs.keys.clone())?;
    let v = graph.variable("v", inputs.values.clone())?;
    let mask = match &inputs.mask {
        Some(mask) => Some(graph.constant("mask", mask.clone())?),
        None => None,
    };
    let attention = graph.dot_product_attention(q, k, v, mask, true)?;
    let out = graph.norm1(attention, &[])?;
    graph.rename(out, "out")?;
    if mark_as_loss {
        graph.mark_as_loss(out)?;
    }
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected_named("out", arr0(expected).into_dyn())
        .skip_gradient_check("mask"))
}

/// Scaled dot-product attention with and without a mask, with a heads axis,
/// and with inputs in every combination of memory orders.
pub fn dot_product_attention() -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();

    let single_head = |rng: &mut StdRng, masked: bool| AttentionInputs {
        keys: uniform_array(&[10, 4, 3], 0., 1., rng),
        values: uniform_array(&[10, 4, 3], 0., 1., rng),
        queries: uniform_array(&[10, 4, 1], 0., 1., rng),
        mask: masked.then(|| random_mask(10, 3, rng)),
    };
    let multi_head = |rng: &mut StdRng, masked: bool, query_count: usize| AttentionInputs {
        keys: uniform_array(&[2, 5, 4, 3], 0., 1., rng),
        values: uniform_array(&[2, 5, 4, 3], 0., 1., rng),
        queries: uniform_array(&[2, 5, 4, query_count], 0., 1., rng),
        mask: masked.then(|| random_mask(2, 3, rng)),
    };

    let cases = [
        ("dot product attention", single_head(&mut rng, false)),
        ("dot product attention with mask", single_head(&mut rng, true)),
        (
            "dot product attention, multi-head input with mask",
            multi_head(&mut rng, true, 2),
        ),
        (
            "dot product attention, multi-head input",
            multi_head(&mut rng, false, 1),
        ),
    ];
    for (name, inputs) in &cases {
        run(&mut failures, name, attention_case(name, inputs, false));
    }

    let inputs = single_head(&mut rng, true);
    for query_fortran in [true, false] {
        for key_fortran in [true, false] {
            for value_fortran in [true, false] {
                let order = |fortran: bool| if fortran { 'f' } else { 'c' };
                let name = format!(
                    "dot product attention, query order = {}, key order = {}, value order = {}",
                    order(query_fortran),
                    order(key_fortran),
                    order(value_fortran)
                );
                info!("-*- starting test: {} -*-", name);
                let reorder = |x: &ArrayD<f64>, fortran: bool| if fortran { fortran_copy(x) } else { x.clone() };
                let reordered = AttentionInputs {
                    queries: reorder(&inputs.queries, query_fortran),
                    keys: reorder(&inputs.keys, key_fortran),
                    values: reorder(&inputs.values, value_fortran),
                    mask: inputs.mask.clone(),
                };
                run(&mut failures, &name, attention_case(&name, &reordered, true));
            }
        }
    }
    failures
}

struct MultiHeadInputs {
    queries: ArrayD<f64>,
    keys: ArrayD<f64>,
    values: ArrayD<f64>,
    query_weights: ArrayD<f64>,
    key_weights: ArrayD<f64>,
    value_weights: ArrayD<f64>,
    output_weights: ArrayD<f64>,
    mask: ArrayD<f64>,
}

/// Projects `[b, nIn, L]` by head `head` of `[h, p, nIn]` weights.
fn reference_projection(x: &ArrayD<f64>, weights: &ArrayD<f64>, head: usize) -> ArrayD<f64> {
    let (batch, n_in, length) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let projected = weights.shape()[1];
    ArrayD::from_shape_fn(IxDyn(&[batch, projected, length]), |index| {
        (0..n_in)
            .map(|i| weights[[head, index[1], i]] * x[[index[0], i, index[2]]])
            .sum()
    })
}

fn reference_multi_head(inputs: &MultiHeadInputs) -> ArrayD<f64> {
    let batch = inputs.queries.shape()[0];
    let query_count = inputs.queries.shape()[2];
    let (heads, projected) = (inputs.value_weights.shape()[0], inputs.value_weights.shape()[1]);
    let n_out = inputs.output_weights.shape()[1];

    let mut concatenated = ArrayD::zeros(IxDyn(&[batch, heads * projected, query_count]));
    for head in 0..heads {
        let attended = reference_attention(
            &reference_projection(&inputs.queries, &inputs.query_weights, head),
            &reference_projection(&inputs.keys, &inputs.key_weights, head),
            &reference_projection(&inputs.values, &inputs.value_weights, head),
            Some(&inputs.mask),
            true,
        );
        for b in 0..batch {
            for p in 0..projected {
                for q in 0..query_count {
                    concatenated[[b, head * projected + p, q]] = attended[[b, p, q]];
                }
            }
        }
    }
    ArrayD::from_shape_fn(IxDyn(&[batch, n_out, query_count]), |index| {
        (0..heads * projected)
            .map(|j| inputs.output_weights[[j, index[1]]] * concatenated[[index[0], j, index[2]]])
            .sum()
    })
}

fn multi_head_case(name: &str, inputs: &MultiHeadInputs, gradient_check: bool) -> Result<TestCase> {
    let expected = reference_multi_head(inputs).mapv(|x| x * x).sum().sqrt();

    let mut graph = Graph::new();
    let q = graph.variable("q", inputs.queries.clone())?;
    let k = graph.variable("k", inputs.keys.clone())?;
    let v = graph.variable("v", inputs.values.clone())?;
    let wq = graph.variable("Wq", inputs.query_weights.clone())?;
    let wk = graph.variable("Wk", inputs.key_weights.clone())?;
    let wv = graph.variable("Wv", inputs.value_weights.clone())?;
    let wo = graph.variable("Wo", inputs.output_weights.clone())?;
    let mask = graph.constant("mask", inputs.mask.clone())?;
    let attention = graph.multi_head_dot_product_attention(q, k, v, wq, wk, wv, wo, Some(mask), true)?;
    let out = graph.norm2(attention, &[])?;
    graph.rename(out, "out")?;
    Ok(TestCase::new(graph)
        .test_name(name)
        .expected_named("out", arr0(expected).into_dyn())
        .gradient_check(gradient_check)
        .skip_gradient_check("mask"))
}

/// Multi-head attention, then the same inputs and weights in every
/// combination of memory orders.
pub fn multi_head_attention() -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut failures = Vec::new();
    let inputs = MultiHeadInputs {
        keys: uniform_array(&[10, 4, 5], 0., 1., &mut rng),
        values: uniform_array(&[10, 4, 5], 0., 1., &mut rng),
        queries: uniform_array(&[10, 4, 2], 0., 1., &mut rng),
        key_weights: uniform_array(&[2, 3, 4], 0., 1., &mut rng),
        value_weights: uniform_array(&[2, 3, 4], 0., 1., &mut rng),
        query_weights: uniform_array(&[2, 3, 4], 0., 1., &mut rng),
        output_weights: uniform_array(&[2 * 3, 8], 0., 1., &mut rng),
        mask: random_mask(10, 5, &mut rng),
    };
    run(
        &mut failures,
        "multi-head attention",
        multi_head_case("multi-head attention", &inputs, true),
    );

    for weights_fortran in [true, false] {
        for inputs_fortran in [true, false] {
            let order = |fortran: bool| if fortran { 'f' } else { 'c' };
            let name = format!(
                "multi-head attention, input order = {}, weight order = {}",
                order(inputs_fortran),
                order(weights_fortran)
            );
            info!("-*- starting test: {} -*-", name);
            let reorder = |x: &ArrayD<f64>, fortran: bool| if fortran { fortran_copy(x) } else { x.clone() };
            let reordered = MultiHeadInputs {
                queries: reorder(&inputs.queries, inputs_fortran),
                keys: reorder(&inputs.keys, inputs_fortran),
                values: reorder(&inputs.values, inputs_fortran),
                query_weights: reorder(&inputs.query_weights, weights_fortran),
                key_weights: reorder(&inputs.key_weights, weights_fortran),
                value_weights: reorder(&inputs.value_weights, weights_fortran),
                output_weights: reorder(&inputs.output_weights, weights_fortran),
                mask: inputs.mask.clone(),
            };
            run(&mut failures, &name, multi_head_case(&name, &reordered, false));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_lanes() {
        let x = Array::from_shape_fn((2, 3, 2), |(i, j, k)| (100 * i + 10 * j + k) as f64).into_dyn();
        let (shape, gathered) = lanes(&x, &[1]);
        assert_eq!(shape, vec![2, 2]);
        assert_eq!(gathered[1], vec![1., 11., 21.]);
        assert_eq!(gathered[2], vec![100., 110., 120.]);

        let (shape, gathered) = lanes(&x, &[]);
        assert!(shape.is_empty());
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered[0].len(), 12);
        assert_eq!(gathered[0][3], 11.);
    }

    #[test]
    fn test_reference_attention_without_mask_is_a_weighted_average() {
        let queries = array![[[0.], [0.]]].into_dyn();
        let keys = array![[[1., 2.], [3., 4.]]].into_dyn();
        let values = array![[[1., 3.]]].into_dyn();
        // all scores are zero, so the weights are uniform
        let output = reference_attention(&queries, &keys, &values, None, true);
        assert_eq!(output.shape(), &[1, 1, 1]);
        assert_abs_diff_eq!(output[[0, 0, 0]], 2., epsilon = 1e-12);

        let mask = array![[1., 0.]].into_dyn();
        let output = reference_attention(&queries, &keys, &values, Some(&mask), true);
        assert_abs_diff_eq!(output[[0, 0, 0]], 1., epsilon = 1e-12);
    }

    #[test]
    fn test_linspace_matrix() {
        let matrix = linspace_matrix(1., 12., 3, 4);
        assert_eq!(matrix.shape(), &[3, 4]);
        assert_abs_diff_eq!(matrix[[0, 0]], 1.);
        assert_abs_diff_eq!(matrix[[1, 2]], 7., epsilon = 1e-12);
        assert_abs_diff_eq!(matrix[[2, 3]], 12., epsilon = 1e-12);
    }

    #[test]
    fn test_suite_lookup() {
        assert!(suite("reduce3").is_some());
        assert!(suite("nonexistent").is_none());
        let names = suites().into_iter().map(|(name, _)| name).collect::<Vec<_>>();
        assert_eq!(names.len(), 14);
    }

    #[test]
    fn test_stdev() {
        init();
        let failures = stdev();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_zero_count() {
        let failures = zero_count();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_zero_fraction() {
        let failures = zero_fraction();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_reduction_gradients_simple() {
        init();
        let failures = reduction_gradients_simple();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_reduction_gradients_non_final() {
        let failures = reduction_gradients_non_final();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_non_final_variance_tolerates_rounding_noise() {
        init();
        let mut rng = StdRng::seed_from_u64(SEED);
        let input = normal_array(&[10, 4], 100., &mut rng);
        let label = normal_array(&[10, 4], 100., &mut rng);
        let kind = ReductionKind::Variance {
            bias_corrected: true,
        };
        let mut test_case = non_final_case("variance of per-example errors", kind, &[], input, label).unwrap();
        validate(&mut test_case).unwrap();
        assert_eq!(non_final_tolerances(ReductionKind::ASum), (1e-4, 1e-4));
    }

    #[test]
    fn test_reduction_gradients_along_axes() {
        let failures = reduction_gradients_along_axes();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_reduce3() {
        let failures = reduce3();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_moments() {
        let failures = moments();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_normalize_moments() {
        let failures = normalize_moments();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_all_any() {
        let failures = all_any();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_index_accumulations() {
        let failures = index_accumulations();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_reductions_backwards() {
        let failures = reductions_backwards();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_dot_product_attention() {
        let failures = dot_product_attention();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn test_multi_head_attention() {
        let failures = multi_head_attention();
        assert!(failures.is_empty(), "{:?}", failures);
    }
}
