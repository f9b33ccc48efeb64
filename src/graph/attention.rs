use ndarray::prelude::*;
use ndarray::IxDyn;

use super::error::{GraphError, Result};
use super::lanes::standardize;
use super::operations::{binary_inputs, Operation};
use super::{Graph, Variable};

/// Large negative bias that removes masked timesteps from the softmax.
const MASK_BIAS: f64 = 1e9;

/// Turns a `[batch, timesteps]` 0/1 mask into the additive bias
/// `(mask − 1)·1e9`, shaped to broadcast against attention scores of shape
/// `[batch, (heads,) timesteps, queries]`. The second input (the scores)
/// only supplies the target rank.
pub struct AttentionMaskBias {}

impl Operation for AttentionMaskBias {
    fn name(&self) -> &'static str {
        "attention_mask_bias"
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let (mask, scores) = binary_inputs(self.name(), inputs)?;
        let rank = scores.ndim();
        if mask.ndim() != 2
            || rank < 3
            || mask.shape()[0] != scores.shape()[0]
            || mask.shape()[1] != scores.shape()[rank - 2]
        {
            return Err(GraphError::invalid_argument(
                self.name(),
                format!(
                    "mask of shape {:?} does not fit scores of shape {:?}",
                    mask.shape(),
                    scores.shape()
                ),
            ));
        }
        let mut shape = vec![mask.shape()[0]];
        shape.extend(std::iter::repeat(1).take(rank - 3));
        shape.extend([mask.shape()[1], 1]);
        Ok(standardize(mask.view())
            .mapv(|m| (m - 1.) * MASK_BIAS)
            .into_shape_with_order(shape)?)
    }

    fn backward(
        &self,
        _out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(ArrayD::zeros(IxDyn(args[arg_index].shape())))
    }

    fn differentiable(&self) -> bool {
        false
    }
}

impl Graph {
    /// Dot-product attention over `[batch, features, steps]` inputs (with an
    /// optional heads axis after the batch axis): queries `[b, F, Q]`, keys
    /// `[b, F, T]` and values `[b, Fv, T]` give `[b, Fv, Q]`.
    pub fn dot_product_attention(
        &mut self,
        queries: Variable,
        keys: Variable,
        values: Variable,
        mask: Option<Variable>,
        scaled: bool,
    ) -> Result<Variable> {
        // scores are [b, (h,) T, Q]
        let mut scores = self.matmul_with(keys, queries, true, false)?;
        if scaled {
            scores = self.dimension_scaling(scores, keys, -2)?;
        }
        if let Some(mask) = mask {
            let bias = self.record(Box::new(AttentionMaskBias {}), vec![mask, scores])?;
            scores = self.add(scores, bias)?;
        }
        let weights = self.softmax(scores, -2)?;
        self.matmul(values, weights)
    }

    /// `[b, nIn, L]` input times `[h, p, nIn]` weights, as `[b, h, p, L]`.
    fn project_heads(&mut self, x: Variable, weights: Variable) -> Result<Variable> {
        let projected = self.tensor_mmul(x, weights, &[1], &[2])?;
        self.permute(projected, &[0, 2, 3, 1])
    }

    /// Multi-head attention: every head projects the inputs with its slice
    /// of `Wq`, `Wk`, `Wv` (`[heads, projected, nIn]`), attends, and the
    /// concatenated heads are projected by `Wo` (`[heads·projected, nOut]`).
    /// The output is `[b, nOut, Q]`.
    #[allow(clippy::too_many_arguments)]
    pub fn multi_head_dot_product_attention(
        &mut self,
        queries: Variable,
        keys: Variable,
        values: Variable,
        query_weights: Variable,
        key_weights: Variable,
        value_weights: Variable,
        output_weights: Variable,
        mask: Option<Variable>,
        scaled: bool,
    ) -> Result<Variable> {
        let projected_queries = self.project_heads(queries, query_weights)?;
        let projected_keys = self.project_heads(keys, key_weights)?;
        let projected_values = self.project_heads(values, value_weights)?;
        let attended = self.dot_product_attention(
            projected_queries,
            projected_keys,
            projected_values,
            mask,
            scaled,
        )?;
        // [b, h, p, Q] -> [b, Q, h·p]
        let attended = self.permute(attended, &[0, 3, 1, 2])?;
        let concatenated = self.flatten_trailing(attended, 2)?;
        let output = self.tensor_mmul(concatenated, output_weights, &[2], &[0])?;
        self.permute(output, &[0, 2, 1])
    }
}
