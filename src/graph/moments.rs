use super::error::Result;
use super::reductions::ReductionKind;
use super::{Graph, Variable};

impl Graph {
    /// Mean and population variance of `x` along `axes`.
    pub fn moments(&mut self, x: Variable, axes: &[usize]) -> Result<(Variable, Variable)> {
        let mean = self.reduce(ReductionKind::Mean, x, axes, false)?;
        let variance = self.reduce(
            ReductionKind::Variance {
                bias_corrected: false,
            },
            x,
            axes,
            false,
        )?;
        Ok((mean, variance))
    }

    /// Mean and variance from sufficient statistics: `count`, the sum and the
    /// sum of squares of the (optionally `shift`ed) data.
    pub fn normalize_moments(
        &mut self,
        count: Variable,
        sum: Variable,
        squared_sum: Variable,
        shift: Option<Variable>,
    ) -> Result<(Variable, Variable)> {
        let shifted_mean = self.div(sum, count)?;
        let mean = match shift {
            Some(shift) => self.add(shifted_mean, shift)?,
            None => shifted_mean,
        };
        let second_moment = self.div(squared_sum, count)?;
        let squared_mean = self.square(shifted_mean)?;
        let variance = self.sub(second_moment, squared_mean)?;
        Ok((mean, variance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::prelude::*;

    #[test]
    fn test_moments() {
        let mut graph = Graph::new();
        let x = graph
            .variable("x", array![[1., 2., 3.], [4., 6., 8.]].into_dyn())
            .unwrap();
        let (mean, variance) = graph.moments(x, &[1]).unwrap();
        let activations = graph.execute(&[mean, variance]).unwrap();
        assert_abs_diff_eq!(
            activations.array(mean).unwrap(),
            &array![2., 6.].into_dyn(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            activations.array(variance).unwrap(),
            &array![2. / 3., 8. / 3.].into_dyn(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_normalize_moments() {
        let data = [1.5, -0.5, 2., 4.];
        let shift = 0.5;
        let shifted = data.iter().map(|x| x - shift).collect::<Vec<_>>();

        let mut graph = Graph::new();
        let count = graph.constant("count", arr0(4.).into_dyn()).unwrap();
        let sum = graph
            .variable("sum", arr0(shifted.iter().sum::<f64>()).into_dyn())
            .unwrap();
        let squared_sum = graph
            .variable("squared_sum", arr0(shifted.iter().map(|x| x * x).sum::<f64>()).into_dyn())
            .unwrap();
        let shift_variable = graph.constant("shift", arr0(shift).into_dyn()).unwrap();
        let (mean, variance) = graph
            .normalize_moments(count, sum, squared_sum, Some(shift_variable))
            .unwrap();
        let activations = graph.execute(&[mean, variance]).unwrap();

        let expected_mean = data.iter().sum::<f64>() / 4.;
        let expected_variance =
            data.iter().map(|x| (x - expected_mean).powi(2)).sum::<f64>() / 4.;
        assert_abs_diff_eq!(activations.item(mean).unwrap(), expected_mean, epsilon = 1e-12);
        assert_abs_diff_eq!(
            activations.item(variance).unwrap(),
            expected_variance,
            epsilon = 1e-12
        );

        // d(variance)/d(sum) = −2·sum/count²
        let gradients = graph.execute_backward(&[variance]).unwrap();
        let shifted_sum = shifted.iter().sum::<f64>();
        assert_abs_diff_eq!(
            gradients.array(sum).unwrap().sum(),
            -2. * shifted_sum / 16.,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(gradients.array(squared_sum).unwrap().sum(), 0.25, epsilon = 1e-12);
    }
}
