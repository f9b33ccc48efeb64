use ndarray::prelude::*;
use ndarray::IxDyn;

use super::error::{GraphError, Result};
use super::lanes::{
    broadcast_with, inverse_permutation, resolve_axis, sign, standardize, unbroadcast,
};
use super::{Graph, Variable};

pub trait Operation {
    /// Kernel name, as registered in the kernel registry.
    fn name(&self) -> &'static str;
    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>>;
    /// Gradient of the loss with respect to `args[arg_index]`, given the
    /// gradient with respect to this operation's `output`.
    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>>;
    fn differentiable(&self) -> bool {
        true
    }
}

pub(super) fn unary_input<'a>(
    operation: &'static str,
    inputs: &[&'a ArrayD<f64>],
) -> Result<&'a ArrayD<f64>> {
    match inputs {
        [x] => Ok(*x),
        _ => Err(GraphError::invalid_argument(
            operation,
            format!("unary operation expected, got {} inputs", inputs.len()),
        )),
    }
}

pub(super) fn binary_inputs<'a>(
    operation: &'static str,
    inputs: &[&'a ArrayD<f64>],
) -> Result<(&'a ArrayD<f64>, &'a ArrayD<f64>)> {
    match inputs {
        [a, b] => Ok((*a, *b)),
        _ => Err(GraphError::invalid_argument(
            operation,
            format!("binary operation expected, got {} inputs", inputs.len()),
        )),
    }
}

fn other_arg_index(operation: &'static str, arg_index: usize) -> Result<usize> {
    match arg_index {
        0 => Ok(1),
        1 => Ok(0),
        _ => Err(GraphError::invalid_argument(
            operation,
            format!("no argument {}", arg_index),
        )),
    }
}

pub struct Addition {}

impl Operation for Addition {
    fn name(&self) -> &'static str {
        "add"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (a, b) = binary_inputs(self.name(), inputs)?;
        broadcast_with(self.name(), a, b, |x, y| x + y)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        // Addition just passes the gradient through to both branches.
        Ok(unbroadcast(out_gradient.clone(), args[arg_index].shape()))
    }
}

pub struct Subtraction {}

impl Operation for Subtraction {
    fn name(&self) -> &'static str {
        "subtract"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (a, b) = binary_inputs(self.name(), inputs)?;
        broadcast_with(self.name(), a, b, |x, y| x - y)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        let gradient = match arg_index {
            0 => out_gradient.clone(),
            _ => out_gradient.mapv(|g| -g),
        };
        Ok(unbroadcast(gradient, args[arg_index].shape()))
    }
}

pub struct Multiplication {}

impl Operation for Multiplication {
    fn name(&self) -> &'static str {
        "multiply"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (a, b) = binary_inputs(self.name(), inputs)?;
        broadcast_with(self.name(), a, b, |x, y| x * y)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        // d/dx(xy) = y
        let other = args[other_arg_index(self.name(), arg_index)?];
        let gradient = broadcast_with(self.name(), out_gradient, other, |g, y| g * y)?;
        Ok(unbroadcast(gradient, args[arg_index].shape()))
    }
}

pub struct Division {}

impl Operation for Division {
    fn name(&self) -> &'static str {
        "divide"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (a, b) = binary_inputs(self.name(), inputs)?;
        broadcast_with(self.name(), a, b, |x, y| x / y)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        let (numerator, denominator) = (args[0], args[1]);
        let gradient = match arg_index {
            0 => broadcast_with(self.name(), out_gradient, denominator, |g, y| g / y)?,
            1 => {
                // d/dy(x/y) = −x/y²
                let local = broadcast_with(self.name(), numerator, denominator, |x, y| {
                    -x / (y * y)
                })?;
                broadcast_with(self.name(), out_gradient, &local, |g, d| g * d)?
            }
            _ => return Err(GraphError::invalid_argument(self.name(), "no such argument")),
        };
        Ok(unbroadcast(gradient, args[arg_index].shape()))
    }
}

pub struct Negation {}

impl Operation for Negation {
    fn name(&self) -> &'static str {
        "negate"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)?.mapv(|x| -x))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        _args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient.mapv(|g| -g))
    }
}

pub struct ScalarMultiplication {
    factor: f64,
}

impl ScalarMultiplication {
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl Operation for ScalarMultiplication {
    fn name(&self) -> &'static str {
        "scalar_multiply"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)? * self.factor)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        _args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient * self.factor)
    }
}

pub struct ScalarAddition {
    shift: f64,
}

impl ScalarAddition {
    pub fn new(shift: f64) -> Self {
        Self { shift }
    }
}

impl Operation for ScalarAddition {
    fn name(&self) -> &'static str {
        "scalar_add"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)? + self.shift)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        _args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient.clone())
    }
}

pub struct Square {}

impl Operation for Square {
    fn name(&self) -> &'static str {
        "square"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)?.mapv(|x| x * x))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient * &args[0].mapv(|x| 2. * x))
    }
}

pub struct Exponentiation {}

impl Operation for Exponentiation {
    fn name(&self) -> &'static str {
        "exp"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)?.mapv(f64::exp))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        _args: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient * output)
    }
}

pub struct Logarithm {}

impl Operation for Logarithm {
    fn name(&self) -> &'static str {
        "log"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)?.mapv(f64::ln))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient / args[0])
    }
}

pub struct AbsoluteValue {}

impl Operation for AbsoluteValue {
    fn name(&self) -> &'static str {
        "abs"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        Ok(unary_input(self.name(), inputs)?.mapv(f64::abs))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(out_gradient * &args[0].mapv(sign))
    }
}

/// Views `x` as a stack of matrices: `(batch, rows, columns)`.
fn as_batches(x: &ArrayD<f64>) -> Result<Array3<f64>> {
    let rank = x.ndim();
    let batch = x.shape()[..rank - 2].iter().product::<usize>();
    let (rows, columns) = (x.shape()[rank - 2], x.shape()[rank - 1]);
    Ok(standardize(x.view()).into_shape_with_order((batch, rows, columns))?)
}

fn batched_matmul(
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<ArrayD<f64>> {
    let rank = a.ndim();
    if rank < 2 || b.ndim() != rank || a.shape()[..rank - 2] != b.shape()[..rank - 2] {
        return Err(GraphError::invalid_argument(
            "matmul",
            format!(
                "cannot multiply arrays of shapes {:?} and {:?}",
                a.shape(),
                b.shape()
            ),
        ));
    }
    let (a_batches, b_batches) = (as_batches(a)?, as_batches(b)?);
    let batch = a_batches.shape()[0];
    let mut products = Vec::with_capacity(batch);
    for i in 0..batch {
        let a_matrix = a_batches.index_axis(Axis(0), i);
        let a_matrix = if transpose_a { a_matrix.reversed_axes() } else { a_matrix };
        let b_matrix = b_batches.index_axis(Axis(0), i);
        let b_matrix = if transpose_b { b_matrix.reversed_axes() } else { b_matrix };
        if a_matrix.ncols() != b_matrix.nrows() {
            return Err(GraphError::invalid_argument(
                "matmul",
                format!(
                    "inner dimensions differ: {:?} · {:?}",
                    a_matrix.shape(),
                    b_matrix.shape()
                ),
            ));
        }
        products.push(a_matrix.dot(&b_matrix));
    }
    let (m, n) = match products.first() {
        Some(product) => product.dim(),
        None => (
            if transpose_a { a.shape()[rank - 1] } else { a.shape()[rank - 2] },
            if transpose_b { b.shape()[rank - 2] } else { b.shape()[rank - 1] },
        ),
    };
    let mut output = Array3::zeros((batch, m, n));
    for (i, product) in products.iter().enumerate() {
        output.index_axis_mut(Axis(0), i).assign(product);
    }
    let mut shape = a.shape()[..rank - 2].to_vec();
    shape.extend([m, n]);
    Ok(output.into_shape_with_order(shape)?)
}

/// Matrix product over the last two axes, with equal leading (batch) axes.
pub struct MatrixMultiplication {
    transpose_a: bool,
    transpose_b: bool,
}

impl MatrixMultiplication {
    pub fn new(transpose_a: bool, transpose_b: bool) -> Self {
        Self {
            transpose_a,
            transpose_b,
        }
    }
}

impl Operation for MatrixMultiplication {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (a, b) = binary_inputs(self.name(), inputs)?;
        batched_matmul(a, b, self.transpose_a, self.transpose_b)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        let (a, b) = (args[0], args[1]);
        let (ta, tb) = (self.transpose_a, self.transpose_b);
        // matrix multiplication is not commutative; with C = op(A)·op(B),
        // dL/dop(A) = G·op(B)ᵀ and dL/dop(B) = op(A)ᵀ·G
        match arg_index {
            0 if ta => batched_matmul(b, out_gradient, tb, true),
            0 => batched_matmul(out_gradient, b, false, !tb),
            1 if tb => batched_matmul(out_gradient, a, true, ta),
            1 => batched_matmul(a, out_gradient, !ta, false),
            _ => Err(GraphError::invalid_argument(self.name(), "no such argument")),
        }
    }
}

/// Tensor contraction: sums products over `axes_a` of the first input
/// paired with `axes_b` of the second. The output carries the free axes of
/// the first input followed by the free axes of the second.
pub struct TensorContraction {
    axes_a: Vec<usize>,
    axes_b: Vec<usize>,
}

struct ContractionPlan {
    permutation_a: Vec<usize>,
    permutation_b: Vec<usize>,
    free_a: usize,
    free_b: usize,
    contracted: usize,
    output_shape: Vec<usize>,
}

impl TensorContraction {
    pub fn new(axes_a: &[usize], axes_b: &[usize]) -> Self {
        Self {
            axes_a: axes_a.to_vec(),
            axes_b: axes_b.to_vec(),
        }
    }

    fn plan(&self, a: &[usize], b: &[usize]) -> Result<ContractionPlan> {
        if self.axes_a.len() != self.axes_b.len() {
            return Err(GraphError::invalid_argument(
                "tensor_mmul",
                "axis lists must have equal length",
            ));
        }
        for (&axis_a, &axis_b) in self.axes_a.iter().zip(&self.axes_b) {
            if axis_a >= a.len() {
                return Err(GraphError::InvalidAxis {
                    axis: axis_a as isize,
                    rank: a.len(),
                });
            }
            if axis_b >= b.len() {
                return Err(GraphError::InvalidAxis {
                    axis: axis_b as isize,
                    rank: b.len(),
                });
            }
            if a[axis_a] != b[axis_b] {
                return Err(GraphError::invalid_argument(
                    "tensor_mmul",
                    format!(
                        "contracted extents differ: axis {} of {:?} vs axis {} of {:?}",
                        axis_a, a, axis_b, b
                    ),
                ));
            }
        }
        let free_axes_a = (0..a.len())
            .filter(|axis| !self.axes_a.contains(axis))
            .collect::<Vec<_>>();
        let free_axes_b = (0..b.len())
            .filter(|axis| !self.axes_b.contains(axis))
            .collect::<Vec<_>>();
        let output_shape = free_axes_a
            .iter()
            .map(|&axis| a[axis])
            .chain(free_axes_b.iter().map(|&axis| b[axis]))
            .collect();
        Ok(ContractionPlan {
            free_a: free_axes_a.iter().map(|&axis| a[axis]).product(),
            free_b: free_axes_b.iter().map(|&axis| b[axis]).product(),
            contracted: self.axes_a.iter().map(|&axis| a[axis]).product(),
            permutation_a: free_axes_a.iter().chain(&self.axes_a).copied().collect(),
            permutation_b: self.axes_b.iter().chain(&free_axes_b).copied().collect(),
            output_shape,
        })
    }
}

fn permuted_matrix(
    x: &ArrayD<f64>,
    permutation: &[usize],
    rows: usize,
    columns: usize,
) -> Result<Array2<f64>> {
    let permuted = standardize(x.view().permuted_axes(permutation.to_vec()));
    Ok(permuted.into_shape_with_order((rows, columns))?)
}

fn unpermuted(matrix: Array2<f64>, shape: &[usize], permutation: &[usize]) -> Result<ArrayD<f64>> {
    let permuted_shape = permutation.iter().map(|&axis| shape[axis]).collect::<Vec<_>>();
    let permuted = standardize(matrix.view().into_dyn()).into_shape_with_order(permuted_shape)?;
    Ok(standardize(
        permuted
            .view()
            .permuted_axes(inverse_permutation(permutation)),
    ))
}

impl Operation for TensorContraction {
    fn name(&self) -> &'static str {
        "tensor_mmul"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (a, b) = binary_inputs(self.name(), inputs)?;
        let plan = self.plan(a.shape(), b.shape())?;
        let a_matrix = permuted_matrix(a, &plan.permutation_a, plan.free_a, plan.contracted)?;
        let b_matrix = permuted_matrix(b, &plan.permutation_b, plan.contracted, plan.free_b)?;
        Ok(a_matrix
            .dot(&b_matrix)
            .into_shape_with_order(plan.output_shape)?)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        let (a, b) = (args[0], args[1]);
        let plan = self.plan(a.shape(), b.shape())?;
        let g_matrix = standardize(out_gradient.view()).into_shape_with_order((plan.free_a, plan.free_b))?;
        match arg_index {
            0 => {
                let b_matrix =
                    permuted_matrix(b, &plan.permutation_b, plan.contracted, plan.free_b)?;
                unpermuted(g_matrix.dot(&b_matrix.t()), a.shape(), &plan.permutation_a)
            }
            1 => {
                let a_matrix =
                    permuted_matrix(a, &plan.permutation_a, plan.free_a, plan.contracted)?;
                unpermuted(a_matrix.t().dot(&g_matrix), b.shape(), &plan.permutation_b)
            }
            _ => Err(GraphError::invalid_argument(self.name(), "no such argument")),
        }
    }
}

pub struct Softmax {
    axis: isize,
}

impl Softmax {
    pub fn new(axis: isize) -> Self {
        Self { axis }
    }
}

impl Operation for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let x = unary_input(self.name(), inputs)?;
        let axis = Axis(resolve_axis(self.axis, x.ndim())?);
        // shift the maximum to zero so that exp cannot overflow
        let maximum = x
            .fold_axis(axis, f64::NEG_INFINITY, |&m, &v| m.max(v))
            .insert_axis(axis);
        let exponentiated = (x - &maximum).mapv(f64::exp);
        let total = exponentiated.sum_axis(axis).insert_axis(axis);
        Ok(exponentiated / &total)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        _args: &[&ArrayD<f64>],
        output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        // dS_i/dx_j = S_i·(δ_ij − S_j), so dL/dx_j = S_j·(g_j − Σ_i g_i·S_i)
        let axis = Axis(resolve_axis(self.axis, output.ndim())?);
        let weighted = (out_gradient * output).sum_axis(axis).insert_axis(axis);
        Ok(output * &(out_gradient - &weighted))
    }
}

pub struct Reshape {
    new_shape: Vec<usize>,
}

impl Reshape {
    pub fn new(new_shape: &[usize]) -> Self {
        Self {
            new_shape: new_shape.to_vec(),
        }
    }
}

impl Operation for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let x = unary_input(self.name(), inputs)?;
        Ok(standardize(x.view()).into_shape_with_order(self.new_shape.clone())?)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(standardize(out_gradient.view()).into_shape_with_order(args[0].shape().to_vec())?)
    }
}

pub struct Permute {
    axes: Vec<usize>,
}

impl Permute {
    pub fn new(axes: &[usize]) -> Self {
        Self {
            axes: axes.to_vec(),
        }
    }
}

impl Operation for Permute {
    fn name(&self) -> &'static str {
        "permute"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let x = unary_input(self.name(), inputs)?;
        let mut sorted = self.axes.clone();
        sorted.sort_unstable();
        if sorted != (0..x.ndim()).collect::<Vec<_>>() {
            return Err(GraphError::invalid_argument(
                self.name(),
                format!("{:?} is not a permutation of the axes of {:?}", self.axes, x.shape()),
            ));
        }
        Ok(standardize(x.view().permuted_axes(self.axes.clone())))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        _args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(standardize(
            out_gradient
                .view()
                .permuted_axes(inverse_permutation(&self.axes)),
        ))
    }
}

/// Merges every axis from `start` onwards into one.
pub struct FlattenTrailing {
    start: usize,
}

impl FlattenTrailing {
    pub fn new(start: usize) -> Self {
        Self { start }
    }
}

impl Operation for FlattenTrailing {
    fn name(&self) -> &'static str {
        "flatten_trailing"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let x = unary_input(self.name(), inputs)?;
        if self.start >= x.ndim() {
            return Err(GraphError::InvalidAxis {
                axis: self.start as isize,
                rank: x.ndim(),
            });
        }
        let mut shape = x.shape()[..self.start].to_vec();
        shape.push(x.shape()[self.start..].iter().product());
        Ok(standardize(x.view()).into_shape_with_order(shape)?)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(standardize(out_gradient.view()).into_shape_with_order(args[0].shape().to_vec())?)
    }
}

/// Scales its first input by `1/√n`, where `n` is the extent of `axis` of
/// the second (reference) input. The reference only contributes its shape.
pub struct DimensionScaling {
    axis: isize,
}

impl DimensionScaling {
    pub fn new(axis: isize) -> Self {
        Self { axis }
    }

    fn factor(&self, reference: &ArrayD<f64>) -> Result<f64> {
        let axis = resolve_axis(self.axis, reference.ndim())?;
        Ok(1. / (reference.shape()[axis] as f64).sqrt())
    }
}

impl Operation for DimensionScaling {
    fn name(&self) -> &'static str {
        "dimension_scaling"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (x, reference) = binary_inputs(self.name(), inputs)?;
        Ok(x * self.factor(reference)?)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        match arg_index {
            0 => Ok(out_gradient * self.factor(args[1])?),
            _ => Ok(ArrayD::zeros(IxDyn(args[arg_index].shape()))),
        }
    }
}

impl Graph {
    pub fn add(&mut self, a: Variable, b: Variable) -> Result<Variable> {
        self.record(Box::new(Addition {}), vec![a, b])
    }

    pub fn sub(&mut self, a: Variable, b: Variable) -> Result<Variable> {
        self.record(Box::new(Subtraction {}), vec![a, b])
    }

    pub fn mul(&mut self, a: Variable, b: Variable) -> Result<Variable> {
        self.record(Box::new(Multiplication {}), vec![a, b])
    }

    pub fn div(&mut self, a: Variable, b: Variable) -> Result<Variable> {
        self.record(Box::new(Division {}), vec![a, b])
    }

    pub fn neg(&mut self, x: Variable) -> Result<Variable> {
        self.record(Box::new(Negation {}), vec![x])
    }

    pub fn scalar_mul(&mut self, x: Variable, factor: f64) -> Result<Variable> {
        self.record(Box::new(ScalarMultiplication::new(factor)), vec![x])
    }

    pub fn scalar_add(&mut self, x: Variable, shift: f64) -> Result<Variable> {
        self.record(Box::new(ScalarAddition::new(shift)), vec![x])
    }

    pub fn square(&mut self, x: Variable) -> Result<Variable> {
        self.record(Box::new(Square {}), vec![x])
    }

    pub fn exp(&mut self, x: Variable) -> Result<Variable> {
        self.record(Box::new(Exponentiation {}), vec![x])
    }

    pub fn log(&mut self, x: Variable) -> Result<Variable> {
        self.record(Box::new(Logarithm {}), vec![x])
    }

    pub fn abs(&mut self, x: Variable) -> Result<Variable> {
        self.record(Box::new(AbsoluteValue {}), vec![x])
    }

    pub fn matmul(&mut self, a: Variable, b: Variable) -> Result<Variable> {
        self.matmul_with(a, b, false, false)
    }

    pub fn matmul_with(
        &mut self,
        a: Variable,
        b: Variable,
        transpose_a: bool,
        transpose_b: bool,
    ) -> Result<Variable> {
        self.record(
            Box::new(MatrixMultiplication::new(transpose_a, transpose_b)),
            vec![a, b],
        )
    }

    pub fn tensor_mmul(
        &mut self,
        a: Variable,
        b: Variable,
        axes_a: &[usize],
        axes_b: &[usize],
    ) -> Result<Variable> {
        self.record(Box::new(TensorContraction::new(axes_a, axes_b)), vec![a, b])
    }

    pub fn softmax(&mut self, x: Variable, axis: isize) -> Result<Variable> {
        self.record(Box::new(Softmax::new(axis)), vec![x])
    }

    pub fn reshape(&mut self, x: Variable, shape: &[usize]) -> Result<Variable> {
        self.record(Box::new(Reshape::new(shape)), vec![x])
    }

    pub fn permute(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.record(Box::new(Permute::new(axes)), vec![x])
    }

    pub fn flatten_trailing(&mut self, x: Variable, start: usize) -> Result<Variable> {
        self.record(Box::new(FlattenTrailing::new(start)), vec![x])
    }

    pub fn dimension_scaling(
        &mut self,
        x: Variable,
        reference: Variable,
        axis: isize,
    ) -> Result<Variable> {
        self.record(Box::new(DimensionScaling::new(axis)), vec![x, reference])
    }
}

/// Compares every analytic gradient of `operation` with central differences
/// of `Σ output·G` for a fixed, non-uniform `G`.
#[cfg(test)]
pub(crate) fn assert_gradients_match(operation: &dyn Operation, inputs: &[ArrayD<f64>], tolerance: f64) {
    let views = inputs.iter().collect::<Vec<_>>();
    let output = operation.forward(&views).unwrap();
    let out_gradient = Array::from_iter((0..output.len()).map(|i| (0.7 * i as f64 + 0.3).sin()))
        .into_shape_with_order(output.shape().to_vec())
        .unwrap();
    let objective = |inputs: &[ArrayD<f64>]| {
        let views = inputs.iter().collect::<Vec<_>>();
        (operation.forward(&views).unwrap() * &out_gradient).sum()
    };
    let h = 1e-6;
    for arg_index in 0..inputs.len() {
        let analytic = operation
            .backward(&out_gradient, &views, &output, arg_index)
            .unwrap();
        assert_eq!(analytic.shape(), inputs[arg_index].shape());
        for (j, &analytic_value) in analytic.iter().enumerate() {
            let mut plus = inputs.to_vec();
            if let Some(x) = plus[arg_index].iter_mut().nth(j) {
                *x += h;
            }
            let mut minus = inputs.to_vec();
            if let Some(x) = minus[arg_index].iter_mut().nth(j) {
                *x -= h;
            }
            let numeric = (objective(&plus) - objective(&minus)) / (2. * h);
            assert!(
                (analytic_value - numeric).abs() <= tolerance * (1. + numeric.abs()),
                "{}: argument {} element {}: analytic {} vs numeric {}",
                operation.name(),
                arg_index,
                j,
                analytic_value,
                numeric
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_addition_forward() {
        let a = array![[1., 2.], [3., 4.]].into_dyn();
        let b = array![[5., 6.], [7., 8.]].into_dyn();
        assert_eq!(
            Addition {}.forward(&[&a, &b]).unwrap(),
            array![[6., 8.], [10., 12.]].into_dyn()
        );
        assert!(Addition {}.forward(&[&a]).is_err());
    }

    #[test]
    fn test_multiplication_backward() {
        let a = array![2.].into_dyn();
        let b = array![3.].into_dyn();
        let output = Multiplication {}.forward(&[&a, &b]).unwrap();
        let out_gradient = array![1.].into_dyn();
        assert_eq!(
            Multiplication {}
                .backward(&out_gradient, &[&a, &b], &output, 0)
                .unwrap(),
            array![3.].into_dyn()
        );
        assert_eq!(
            Multiplication {}
                .backward(&out_gradient, &[&a, &b], &output, 1)
                .unwrap(),
            array![2.].into_dyn()
        );
    }

    #[test]
    fn test_broadcasting_gradients() {
        let a = array![[1., 2., 3.], [4., 5., 6.]].into_dyn();
        let b = array![0.5, -1., 2.].into_dyn();
        for operation in [
            Box::new(Addition {}) as Box<dyn Operation>,
            Box::new(Subtraction {}),
            Box::new(Multiplication {}),
            Box::new(Division {}),
        ] {
            assert_gradients_match(operation.as_ref(), &[a.clone(), b.clone()], 1e-6);
        }
    }

    #[test]
    fn test_unary_gradients() {
        let x = array![[0.5, -1.5], [2., 0.25]].into_dyn();
        let positive = x.mapv(f64::abs);
        for operation in [
            Box::new(Negation {}) as Box<dyn Operation>,
            Box::new(ScalarMultiplication::new(-3.)),
            Box::new(ScalarAddition::new(7.)),
            Box::new(Square {}),
            Box::new(Exponentiation {}),
            Box::new(AbsoluteValue {}),
        ] {
            assert_gradients_match(operation.as_ref(), &[x.clone()], 1e-6);
        }
        assert_gradients_match(&Logarithm {}, &[positive], 1e-6);
    }

    #[test]
    fn test_negation() {
        let x = array![[0.5, -1.5], [2., 0.]].into_dyn();
        let negated = Negation {}.forward(&[&x]).unwrap();
        assert_eq!(negated, array![[-0.5, 1.5], [-2., 0.]].into_dyn());
        let gradient = Negation {}
            .backward(&Array::ones(IxDyn(&[2, 2])), &[&x], &negated, 0)
            .unwrap();
        assert_eq!(gradient, Array::from_elem(IxDyn(&[2, 2]), -1.));
    }

    #[test]
    fn test_matrix_multiplication() {
        let a = array![[1., 2.], [3., 4.]].into_dyn();
        let b = array![[5., 6.], [7., 8.]].into_dyn();
        let matmul = MatrixMultiplication::new(false, false);
        let output = matmul.forward(&[&a, &b]).unwrap();
        assert_eq!(output, array![[19., 22.], [43., 50.]].into_dyn());

        let out_gradient = array![[1., 1.], [1., 1.]].into_dyn();
        assert_eq!(
            matmul.backward(&out_gradient, &[&a, &b], &output, 0).unwrap(),
            array![[11., 15.], [11., 15.]].into_dyn()
        );
        assert_eq!(
            matmul.backward(&out_gradient, &[&a, &b], &output, 1).unwrap(),
            array![[4., 4.], [6., 6.]].into_dyn()
        );
    }

    #[test]
    fn test_matrix_multiplication_non_square() {
        let mut graph = Graph::new();
        let a = graph
            .variable("a", array![[1., 2., 3.], [4., 5., 6.]].into_dyn())
            .unwrap();
        let b = graph
            .variable("b", array![[7., 8.], [9., 10.], [11., 12.]].into_dyn())
            .unwrap();
        let product = graph.matmul(a, b).unwrap();
        let activations = graph.execute(&[product]).unwrap();
        assert_eq!(
            activations.array(product).unwrap(),
            &array![[58., 64.], [139., 154.]].into_dyn()
        );

        let gradients = graph.execute_backward(&[product]).unwrap();
        assert_eq!(
            gradients.array(a).unwrap(),
            &array![[15., 19., 23.], [15., 19., 23.]].into_dyn()
        );
        assert_eq!(
            gradients.array(b).unwrap(),
            &array![[5., 5.], [7., 7.], [9., 9.]].into_dyn()
        );
    }

    #[test]
    fn test_batched_transposed_matrix_multiplication() {
        let a = Array::from_shape_fn((2, 3, 4), |(i, j, k)| (i + 2 * j) as f64 - 0.5 * k as f64)
            .into_dyn();
        let b = Array::from_shape_fn((2, 5, 3), |(i, j, k)| ((i * j + k) as f64).cos()).into_dyn();
        // (4×3)·(3×5) per batch
        let matmul = MatrixMultiplication::new(true, true);
        let output = matmul.forward(&[&a, &b]).unwrap();
        assert_eq!(output.shape(), &[2, 4, 5]);
        let a1 = a.index_axis(Axis(0), 1).into_dimensionality::<Ix2>().unwrap();
        let b1 = b.index_axis(Axis(0), 1).into_dimensionality::<Ix2>().unwrap();
        let expected = a1.t().dot(&b1.t());
        assert_abs_diff_eq!(
            output.index_axis(Axis(0), 1).into_dimensionality::<Ix2>().unwrap(),
            expected.view(),
            epsilon = 1e-12
        );
        for (ta, tb, a_shape, b_shape) in [
            (false, false, (2, 4, 3), (2, 3, 5)),
            (true, false, (2, 3, 4), (2, 3, 5)),
            (false, true, (2, 4, 3), (2, 5, 3)),
            (true, true, (2, 3, 4), (2, 5, 3)),
        ] {
            let a = Array::from_shape_fn(a_shape, |(i, j, k)| ((i + j * k) as f64 * 0.3).sin())
                .into_dyn();
            let b = Array::from_shape_fn(b_shape, |(i, j, k)| ((2 * i + j + k) as f64 * 0.2).cos())
                .into_dyn();
            assert_gradients_match(&MatrixMultiplication::new(ta, tb), &[a, b], 1e-6);
        }
        assert!(matmul
            .forward(&[&a, &Array::zeros((3, 5, 3)).into_dyn()])
            .is_err());
    }

    #[test]
    fn test_tensor_contraction() {
        let a = Array::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64).into_dyn();
        let w = Array::from_shape_fn((5, 3), |(i, j)| (i as f64) - (j as f64) * 0.5).into_dyn();
        let contraction = TensorContraction::new(&[1], &[1]);
        let output = contraction.forward(&[&a, &w]).unwrap();
        assert_eq!(output.shape(), &[2, 4, 5]);
        let expected = (0..3)
            .map(|j| a[[1, j, 2]] * w[[4, j]])
            .sum::<f64>();
        assert_abs_diff_eq!(output[[1, 2, 4]], expected, epsilon = 1e-12);
        assert_gradients_match(&contraction, &[a, w], 1e-6);

        let mismatched = Array::zeros((5, 4)).into_dyn();
        assert!(contraction
            .forward(&[&Array::zeros((2, 3, 4)).into_dyn(), &mismatched])
            .is_err());
    }

    #[test]
    fn test_softmax() {
        let x = array![[1., 2., 3.], [1000., 1000., 1000.]].into_dyn();
        let softmaxed = Softmax::new(-1).forward(&[&x]).unwrap();
        for row in softmaxed.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1., epsilon = 1e-12);
        }
        assert_abs_diff_eq!(softmaxed[[1, 0]], 1. / 3., epsilon = 1e-12);
        let expected = 1. / (1. + 1f64.exp() + 2f64.exp());
        assert_abs_diff_eq!(softmaxed[[0, 0]], expected, epsilon = 1e-12);

        let moderate = array![[0.1, -0.4, 2.], [0.3, 0.3, -1.]].into_dyn();
        assert_gradients_match(&Softmax::new(0), &[moderate.clone()], 1e-6);
        assert_gradients_match(&Softmax::new(1), &[moderate], 1e-6);
    }

    #[test]
    fn test_structural_operations() {
        let x = Array::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64).into_dyn();
        let permuted = Permute::new(&[2, 0, 1]).forward(&[&x]).unwrap();
        assert_eq!(permuted.shape(), &[4, 2, 3]);
        assert_eq!(permuted[[3, 1, 2]], x[[1, 2, 3]]);
        assert!(Permute::new(&[0, 0, 1]).forward(&[&x]).is_err());
        assert_gradients_match(&Permute::new(&[2, 0, 1]), &[x.clone()], 1e-6);

        let flattened = FlattenTrailing::new(1).forward(&[&x]).unwrap();
        assert_eq!(flattened.shape(), &[2, 12]);
        assert_eq!(flattened[[1, 5]], 17.);

        let reshaped = Reshape::new(&[6, 4]).forward(&[&x]).unwrap();
        assert_eq!(reshaped[[5, 3]], 23.);
        assert!(Reshape::new(&[5, 5]).forward(&[&x]).is_err());

        // Fortran-ordered input reshapes by logical (row-major) order
        let fortran = x.t().as_standard_layout().into_owned().reversed_axes();
        assert_eq!(Reshape::new(&[6, 4]).forward(&[&fortran]).unwrap(), reshaped);
    }

    #[test]
    fn test_dimension_scaling() {
        let x = array![[2., 4.]].into_dyn();
        let reference = Array::zeros((3, 4, 9)).into_dyn();
        let scaling = DimensionScaling::new(-2);
        let output = scaling.forward(&[&x, &reference]).unwrap();
        assert_eq!(output, array![[1., 2.]].into_dyn());
        let out_gradient = array![[1., 1.]].into_dyn();
        assert_eq!(
            scaling
                .backward(&out_gradient, &[&x, &reference], &output, 1)
                .unwrap(),
            reference
        );
    }
}
