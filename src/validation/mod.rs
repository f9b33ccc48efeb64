//! Checking graph outputs against expectations, and analytic gradients
//! against finite differences.

use std::collections::HashSet;

use log::{info, warn};
use ndarray::prelude::*;
use ndarray::IxDyn;
use thiserror::Error;

use crate::graph::operations::Operation;
use crate::graph::{Graph, GraphError, Variable, VariableKind};

pub mod matrices;
pub mod suites;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{test}: {variable:?} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        test: String,
        variable: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{test}: {variable:?} differs from the expected output (largest difference {largest_difference:e})")]
    ValueMismatch {
        test: String,
        variable: String,
        largest_difference: f64,
    },

    #[error("{test}: gradient check failed for {failed} of {checked} elements; first failure {first}")]
    GradientCheck {
        test: String,
        failed: usize,
        checked: usize,
        first: String,
    },

    #[error("{test}: {source}")]
    Graph {
        test: String,
        #[source]
        source: GraphError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct GradientCheckConfiguration {
    /// Central-difference step.
    pub epsilon: f64,
    pub max_relative_error: f64,
    /// Elements whose absolute error is below this pass regardless of
    /// relative error.
    pub minimum_absolute_error: f64,
    /// Log every checked element.
    pub print: bool,
}

impl Default for GradientCheckConfiguration {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            max_relative_error: 1e-5,
            minimum_absolute_error: 1e-6,
            print: false,
        }
    }
}

enum Target {
    Handle(Variable),
    Named(String),
}

pub struct TestCase {
    graph: Graph,
    test_name: Option<String>,
    expected: Vec<(Target, ArrayD<f64>)>,
    gradient_check: bool,
    skipped: HashSet<String>,
    configuration: GradientCheckConfiguration,
    output_tolerance: f64,
}

impl TestCase {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            test_name: None,
            expected: Vec::new(),
            gradient_check: true,
            skipped: HashSet::new(),
            configuration: GradientCheckConfiguration::default(),
            output_tolerance: 1e-5,
        }
    }

    pub fn test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    pub fn expected(mut self, variable: Variable, array: ArrayD<f64>) -> Self {
        self.expected.push((Target::Handle(variable), array));
        self
    }

    pub fn expected_named(mut self, name: &str, array: ArrayD<f64>) -> Self {
        self.expected.push((Target::Named(name.to_owned()), array));
        self
    }

    pub fn gradient_check(mut self, gradient_check: bool) -> Self {
        self.gradient_check = gradient_check;
        self
    }

    /// Excludes a variable from the gradient check.
    pub fn skip_gradient_check(mut self, name: &str) -> Self {
        self.skipped.insert(name.to_owned());
        self
    }

    pub fn configuration(mut self, configuration: GradientCheckConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn max_relative_error(mut self, max_relative_error: f64) -> Self {
        self.configuration.max_relative_error = max_relative_error;
        self
    }

    pub fn minimum_absolute_error(mut self, minimum_absolute_error: f64) -> Self {
        self.configuration.minimum_absolute_error = minimum_absolute_error;
        self
    }

    /// Relative (and absolute) tolerance for comparing outputs.
    pub fn output_tolerance(mut self, tolerance: f64) -> Self {
        self.output_tolerance = tolerance;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn name(&self) -> &str {
        self.test_name.as_deref().unwrap_or("unnamed test case")
    }

    fn graph_error(&self, source: GraphError) -> ValidationError {
        ValidationError::Graph {
            test: self.name().to_owned(),
            source,
        }
    }
}

/// One element whose analytic and numeric gradients disagree.
#[derive(Debug, Clone)]
pub struct GradientFailure {
    pub variable: String,
    pub index: usize,
    pub analytic: f64,
    pub numeric: f64,
    pub relative_error: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GradientCheckReport {
    pub checked: usize,
    pub failures: Vec<GradientFailure>,
}

fn score(graph: &Graph, losses: &[Variable]) -> Result<f64, GraphError> {
    let activations = graph.execute(losses)?;
    losses
        .iter()
        .map(|&loss| activations.array(loss).map(|array| array.sum()))
        .sum()
}

/// Compares analytic gradients of the sum of the graph's losses with
/// central differences, element by element, for every trainable variable
/// not in `skipped`. Arrays are restored after perturbation.
pub fn check_gradients(
    graph: &mut Graph,
    skipped: &HashSet<String>,
    configuration: &GradientCheckConfiguration,
) -> Result<GradientCheckReport, GraphError> {
    let losses = graph.default_losses();
    let analytic = graph.execute_backward(&losses)?;
    let mut report = GradientCheckReport::default();

    let checked = graph
        .variables()
        .into_iter()
        .filter(|&variable| is_gradient_checked(graph, variable))
        .collect::<Vec<_>>();
    for variable in checked {
        let identifier = graph.identifier(variable)?.to_owned();
        if skipped.contains(&identifier) {
            continue;
        }
        let original = graph.array(variable)?.clone();
        // missing analytic gradients mean the losses do not depend on it
        let analytic_values = match analytic.get(variable) {
            Some(gradient) => gradient.iter().copied().collect::<Vec<_>>(),
            None => vec![0.; original.len()],
        };
        let perturbed = perturb_elements(
            graph,
            variable,
            &identifier,
            &original,
            &analytic_values,
            configuration,
            &mut report,
        );
        // restore before reporting any error, so the caller's graph is intact
        graph.associate_array(variable, original)?;
        perturbed?;
    }
    Ok(report)
}

/// Central differences for every element of `variable`, starting from
/// `original`. Leaves the variable perturbed; the caller restores it.
fn perturb_elements(
    graph: &mut Graph,
    variable: Variable,
    identifier: &str,
    original: &ArrayD<f64>,
    analytic_values: &[f64],
    configuration: &GradientCheckConfiguration,
    report: &mut GradientCheckReport,
) -> Result<(), GraphError> {
    let losses = graph.default_losses();
    let shape = original.shape().to_vec();
    let epsilon = configuration.epsilon;
    let mut values = original.iter().copied().collect::<Vec<_>>();

    for index in 0..values.len() {
        let value = values[index];
        values[index] = value + epsilon;
        graph.associate_array(variable, ArrayD::from_shape_vec(IxDyn(&shape), values.clone())?)?;
        let plus = score(graph, &losses)?;
        values[index] = value - epsilon;
        graph.associate_array(variable, ArrayD::from_shape_vec(IxDyn(&shape), values.clone())?)?;
        let minus = score(graph, &losses)?;
        values[index] = value;

        let numeric = (plus - minus) / (2. * epsilon);
        let analytic_value = analytic_values[index];
        let absolute_error = (analytic_value - numeric).abs();
        let relative_error = if analytic_value == 0. && numeric == 0. {
            0.
        } else {
            absolute_error / (analytic_value.abs() + numeric.abs())
        };
        let failed = !relative_error.is_finite()
            || (relative_error > configuration.max_relative_error
                && absolute_error > configuration.minimum_absolute_error);
        if configuration.print {
            info!(
                "{}[{}]: analytic {:e}, numeric {:e}, relative error {:e}",
                identifier, index, analytic_value, numeric, relative_error
            );
        }
        if failed {
            warn!(
                "gradient check failed for {}[{}]: analytic {:e}, numeric {:e}, relative error {:e}",
                identifier, index, analytic_value, numeric, relative_error
            );
            report.failures.push(GradientFailure {
                variable: identifier.to_owned(),
                index,
                analytic: analytic_value,
                numeric,
                relative_error,
            });
        }
        report.checked += 1;
    }
    Ok(())
}

fn largest_difference(expected: &ArrayD<f64>, actual: &ArrayD<f64>) -> f64 {
    expected
        .iter()
        .zip(actual.iter())
        .map(|(e, a)| (e - a).abs())
        .fold(0., f64::max)
}

/// Executes the test case's graph, compares every expected output, then runs
/// the gradient check if enabled.
pub fn validate(test_case: &mut TestCase) -> Result<(), ValidationError> {
    info!("*** starting test: {}", test_case.name());
    let mut targets = Vec::with_capacity(test_case.expected.len());
    for (target, _) in &test_case.expected {
        let variable = match target {
            Target::Handle(variable) => *variable,
            Target::Named(name) => test_case
                .graph
                .lookup(name)
                .map_err(|error| test_case.graph_error(error))?,
        };
        targets.push(variable);
    }

    if !targets.is_empty() {
        let activations = test_case
            .graph
            .execute(&targets)
            .map_err(|error| test_case.graph_error(error))?;
        for (&variable, (_, expected)) in targets.iter().zip(&test_case.expected) {
            let identifier = test_case
                .graph
                .identifier(variable)
                .map_err(|error| test_case.graph_error(error))?
                .to_owned();
            let actual = activations
                .array(variable)
                .map_err(|error| test_case.graph_error(error))?;
            if actual.shape() != expected.shape() {
                return Err(ValidationError::ShapeMismatch {
                    test: test_case.name().to_owned(),
                    variable: identifier,
                    expected: expected.shape().to_vec(),
                    actual: actual.shape().to_vec(),
                });
            }
            let tolerance = test_case.output_tolerance;
            if !expected.relative_eq(actual, tolerance, tolerance) {
                return Err(ValidationError::ValueMismatch {
                    test: test_case.name().to_owned(),
                    variable: identifier,
                    largest_difference: largest_difference(expected, actual),
                });
            }
        }
    }

    if test_case.gradient_check {
        let report = check_gradients(
            &mut test_case.graph,
            &test_case.skipped,
            &test_case.configuration,
        )
        .map_err(|error| test_case.graph_error(error))?;
        if let Some(first) = report.failures.first() {
            return Err(ValidationError::GradientCheck {
                test: test_case.name().to_owned(),
                failed: report.failures.len(),
                checked: report.checked,
                first: format!(
                    "{}[{}]: analytic {:e}, numeric {:e}",
                    first.variable, first.index, first.analytic, first.numeric
                ),
            });
        }
        info!(
            "{}: gradient check passed ({} elements)",
            test_case.name(),
            report.checked
        );
    }
    Ok(())
}

/// A single kernel applied directly to arrays, outside of any graph.
pub struct OpTestCase {
    operation: Box<dyn Operation>,
    inputs: Vec<ArrayD<f64>>,
    expected: Option<ArrayD<f64>>,
    expected_shape: Option<Vec<usize>>,
    test_name: Option<String>,
}

impl OpTestCase {
    pub fn new(operation: impl Operation + 'static) -> Self {
        Self {
            operation: Box::new(operation),
            inputs: Vec::new(),
            expected: None,
            expected_shape: None,
            test_name: None,
        }
    }

    pub fn input(mut self, array: ArrayD<f64>) -> Self {
        self.inputs.push(array);
        self
    }

    pub fn expected_output(mut self, array: ArrayD<f64>) -> Self {
        self.expected = Some(array);
        self
    }

    pub fn expected_shape(mut self, shape: &[usize]) -> Self {
        self.expected_shape = Some(shape.to_vec());
        self
    }

    pub fn test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    pub fn name(&self) -> &str {
        self.test_name
            .as_deref()
            .unwrap_or_else(|| self.operation.name())
    }
}

pub fn validate_op(test_case: &OpTestCase) -> Result<(), ValidationError> {
    let inputs = test_case.inputs.iter().collect::<Vec<_>>();
    let output = test_case
        .operation
        .forward(&inputs)
        .map_err(|source| ValidationError::Graph {
            test: test_case.name().to_owned(),
            source,
        })?;
    let variable = test_case.operation.name().to_owned();
    let expected_shape = test_case
        .expected_shape
        .clone()
        .or_else(|| test_case.expected.as_ref().map(|e| e.shape().to_vec()));
    if let Some(expected_shape) = expected_shape {
        if output.shape() != expected_shape.as_slice() {
            return Err(ValidationError::ShapeMismatch {
                test: test_case.name().to_owned(),
                variable,
                expected: expected_shape,
                actual: output.shape().to_vec(),
            });
        }
    }
    if let Some(expected) = &test_case.expected {
        if !expected.relative_eq(&output, 1e-5, 1e-5) {
            return Err(ValidationError::ValueMismatch {
                test: test_case.name().to_owned(),
                variable,
                largest_difference: largest_difference(expected, &output),
            });
        }
    }
    Ok(())
}

/// Whether `variable` takes part in gradient checks.
pub(crate) fn is_gradient_checked(graph: &Graph, variable: Variable) -> bool {
    matches!(graph.kind(variable), Ok(VariableKind::Variable))
}
