use std::collections::{HashMap, HashSet};
use std::fmt;

use log::debug;
use ndarray::prelude::*;

use topological_sort::TopologicalSort;

pub mod attention;
pub mod distances;
pub mod error;
pub mod index_accumulations;
pub mod lanes;
pub mod moments;
pub mod operations;
pub mod reductions;
pub mod registry;
pub mod serialization;

pub use self::error::{GraphError, Result};

use self::operations::Operation;
use self::registry::Framework;

/// Handle to a node of one `Graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(usize);

impl Variable {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Trainable; receives gradients and is perturbed by gradient checks.
    Variable,
    Constant,
    /// Declared up front, array supplied before execution.
    Placeholder,
    /// Output of an operation node.
    Operation,
}

struct Origin {
    operation: Box<dyn Operation>,
    parents: Vec<Variable>,
}

struct Node {
    identifier: String,
    kind: VariableKind,
    array: Option<ArrayD<f64>>,
    declared_shape: Option<Vec<Option<usize>>>,
    origin: Option<Origin>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("identifier", &self.identifier)
            .field("kind", &self.kind)
            .field("shape", &self.array.as_ref().map(|array| array.shape().to_vec()))
            .field(
                "operation",
                &self.origin.as_ref().map(|origin| origin.operation.name()),
            )
            .finish()
    }
}

pub struct VariableBuilder {
    identifier: String,
    kind: VariableKind,
    array: Option<ArrayD<f64>>,
    declared_shape: Option<Vec<Option<usize>>>,
}

impl VariableBuilder {
    pub fn new(identifier: &str) -> VariableBuilder {
        VariableBuilder {
            identifier: identifier.to_owned(),
            kind: VariableKind::Variable,
            array: None,
            declared_shape: None,
        }
    }

    pub fn array(mut self, array: ArrayD<f64>) -> VariableBuilder {
        self.array = Some(array);
        self
    }

    /// `None` entries match any extent.
    pub fn shape(mut self, shape: &[Option<usize>]) -> VariableBuilder {
        self.declared_shape = Some(shape.to_vec());
        self
    }

    pub fn kind(mut self, kind: VariableKind) -> VariableBuilder {
        self.kind = kind;
        self
    }
}

/// Arrays keyed by variable, as produced by forward and backward execution.
#[derive(Debug, Clone, Default)]
pub struct ArrayMap {
    arrays: HashMap<Variable, ArrayD<f64>>,
}

pub type Activations = ArrayMap;
pub type Gradients = ArrayMap;

impl ArrayMap {
    pub fn get(&self, variable: Variable) -> Option<&ArrayD<f64>> {
        self.arrays.get(&variable)
    }

    pub fn array(&self, variable: Variable) -> Result<&ArrayD<f64>> {
        self.arrays
            .get(&variable)
            .ok_or(GraphError::UnknownVariable(variable.0))
    }

    /// The single element of a 0-d (or one-element) result.
    pub fn item(&self, variable: Variable) -> Result<f64> {
        let array = self.array(variable)?;
        if array.len() != 1 {
            return Err(GraphError::shape_mismatch("item", &[], array.shape()));
        }
        array
            .iter()
            .next()
            .copied()
            .ok_or(GraphError::UnknownVariable(variable.0))
    }

    pub fn contains(&self, variable: Variable) -> bool {
        self.arrays.contains_key(&variable)
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &ArrayD<f64>)> {
        self.arrays.iter()
    }
}

fn accumulate(
    gradients: &mut HashMap<Variable, ArrayD<f64>>,
    variable: Variable,
    contribution: ArrayD<f64>,
) {
    match gradients.get_mut(&variable) {
        Some(gradient) => {
            *gradient += &contribution;
        }
        None => {
            gradients.insert(variable, contribution);
        }
    }
}

/// A symbolic computation graph. Nodes are stored in creation order, which is
/// always a topological order since an operation can only consume nodes that
/// already exist.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    identifiers: HashMap<String, Variable>,
    loss_variables: Vec<Variable>,
    log_execution: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, builder: VariableBuilder) -> Result<Variable> {
        if builder.kind == VariableKind::Operation {
            return Err(GraphError::invalid_argument(
                "insert",
                "operation outputs are created by recording an operation",
            ));
        }
        if self.identifiers.contains_key(&builder.identifier) {
            return Err(GraphError::DuplicateIdentifier(builder.identifier));
        }
        if let (Some(declared), Some(array)) = (&builder.declared_shape, &builder.array) {
            check_declared_shape(&builder.identifier, declared, array.shape())?;
        }
        let variable = Variable(self.nodes.len());
        self.identifiers.insert(builder.identifier.clone(), variable);
        self.nodes.push(Node {
            identifier: builder.identifier,
            kind: builder.kind,
            array: builder.array,
            declared_shape: builder.declared_shape,
            origin: None,
        });
        Ok(variable)
    }

    pub fn variable(&mut self, identifier: &str, array: ArrayD<f64>) -> Result<Variable> {
        self.insert(VariableBuilder::new(identifier).array(array))
    }

    pub fn constant(&mut self, identifier: &str, array: ArrayD<f64>) -> Result<Variable> {
        self.insert(
            VariableBuilder::new(identifier)
                .array(array)
                .kind(VariableKind::Constant),
        )
    }

    /// A trainable variable whose array is associated later.
    pub fn declare(&mut self, identifier: &str, shape: &[Option<usize>]) -> Result<Variable> {
        self.insert(VariableBuilder::new(identifier).shape(shape))
    }

    pub fn placeholder(&mut self, identifier: &str, shape: &[Option<usize>]) -> Result<Variable> {
        self.insert(
            VariableBuilder::new(identifier)
                .shape(shape)
                .kind(VariableKind::Placeholder),
        )
    }

    /// Appends an operation node consuming `parents`. Shapes are not checked
    /// until execution.
    pub fn record(
        &mut self,
        operation: Box<dyn Operation>,
        parents: Vec<Variable>,
    ) -> Result<Variable> {
        for &parent in &parents {
            self.node(parent)?;
        }
        let identifier = self.generate_identifier(operation.name());
        let variable = Variable(self.nodes.len());
        self.identifiers.insert(identifier.clone(), variable);
        self.nodes.push(Node {
            identifier,
            kind: VariableKind::Operation,
            array: None,
            declared_shape: None,
            origin: Some(Origin { operation, parents }),
        });
        Ok(variable)
    }

    fn generate_identifier(&self, base: &str) -> String {
        if !self.identifiers.contains_key(base) {
            return base.to_owned();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !self.identifiers.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn node(&self, variable: Variable) -> Result<&Node> {
        self.nodes
            .get(variable.0)
            .ok_or(GraphError::UnknownVariable(variable.0))
    }

    fn node_mut(&mut self, variable: Variable) -> Result<&mut Node> {
        self.nodes
            .get_mut(variable.0)
            .ok_or(GraphError::UnknownVariable(variable.0))
    }

    pub fn associate_array(&mut self, variable: Variable, array: ArrayD<f64>) -> Result<()> {
        let node = self.node_mut(variable)?;
        if node.kind == VariableKind::Operation {
            return Err(GraphError::invalid_argument(
                "associate_array",
                format!("{:?} is the output of an operation", node.identifier),
            ));
        }
        if let Some(declared) = &node.declared_shape {
            check_declared_shape(&node.identifier, declared, array.shape())?;
        }
        node.array = Some(array);
        Ok(())
    }

    pub fn identifier(&self, variable: Variable) -> Result<&str> {
        Ok(&self.node(variable)?.identifier)
    }

    pub fn lookup(&self, identifier: &str) -> Result<Variable> {
        self.identifiers
            .get(identifier)
            .copied()
            .ok_or_else(|| GraphError::UnknownIdentifier(identifier.to_owned()))
    }

    pub fn rename(&mut self, variable: Variable, identifier: &str) -> Result<()> {
        match self.identifiers.get(identifier) {
            Some(&existing) if existing == variable => return Ok(()),
            Some(_) => return Err(GraphError::DuplicateIdentifier(identifier.to_owned())),
            None => {}
        }
        let node = self.node_mut(variable)?;
        let previous = std::mem::replace(&mut node.identifier, identifier.to_owned());
        self.identifiers.remove(&previous);
        self.identifiers.insert(identifier.to_owned(), variable);
        Ok(())
    }

    pub fn kind(&self, variable: Variable) -> Result<VariableKind> {
        Ok(self.node(variable)?.kind)
    }

    /// The array associated with a leaf node (operation outputs have none;
    /// use `execute`).
    pub fn array(&self, variable: Variable) -> Result<&ArrayD<f64>> {
        let node = self.node(variable)?;
        node.array.as_ref().ok_or_else(|| GraphError::MissingArray {
            identifier: node.identifier.clone(),
        })
    }

    pub fn operation_name(&self, variable: Variable) -> Result<Option<&'static str>> {
        Ok(self
            .node(variable)?
            .origin
            .as_ref()
            .map(|origin| origin.operation.name()))
    }

    pub fn parents(&self, variable: Variable) -> Result<Vec<Variable>> {
        Ok(self
            .node(variable)?
            .origin
            .as_ref()
            .map(|origin| origin.parents.clone())
            .unwrap_or_default())
    }

    pub fn variables(&self) -> Vec<Variable> {
        (0..self.nodes.len()).map(Variable).collect()
    }

    pub fn trainable_variables(&self) -> Vec<Variable> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.kind == VariableKind::Variable)
            .map(|(index, _)| Variable(index))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn mark_as_loss(&mut self, variable: Variable) -> Result<()> {
        self.node(variable)?;
        if !self.loss_variables.contains(&variable) {
            self.loss_variables.push(variable);
        }
        Ok(())
    }

    pub fn loss_variables(&self) -> &[Variable] {
        &self.loss_variables
    }

    /// The marked loss variables, or else every operation output that no
    /// other operation consumes.
    pub fn default_losses(&self) -> Vec<Variable> {
        if !self.loss_variables.is_empty() {
            return self.loss_variables.clone();
        }
        let consumed = self
            .nodes
            .iter()
            .filter_map(|node| node.origin.as_ref())
            .flat_map(|origin| origin.parents.iter().copied())
            .collect::<HashSet<_>>();
        self.nodes
            .iter()
            .enumerate()
            .filter(|(index, node)| {
                node.kind == VariableKind::Operation && !consumed.contains(&Variable(*index))
            })
            .map(|(index, _)| Variable(index))
            .collect()
    }

    pub fn set_log_execution(&mut self, log_execution: bool) {
        self.log_execution = log_execution;
    }

    fn ancestors(&self, targets: &[Variable]) -> Result<HashSet<Variable>> {
        let mut seen = HashSet::new();
        let mut stack = targets.to_vec();
        while let Some(variable) = stack.pop() {
            if !seen.insert(variable) {
                continue;
            }
            if let Some(origin) = &self.node(variable)?.origin {
                stack.extend(origin.parents.iter().copied());
            }
        }
        Ok(seen)
    }

    fn evaluate(&self, targets: &[Variable]) -> Result<HashMap<Variable, ArrayD<f64>>> {
        let required = self.ancestors(targets)?;
        let mut values = HashMap::with_capacity(required.len());
        for (index, node) in self.nodes.iter().enumerate() {
            let variable = Variable(index);
            if !required.contains(&variable) {
                continue;
            }
            let value = match &node.origin {
                None => node
                    .array
                    .clone()
                    .ok_or_else(|| GraphError::MissingArray {
                        identifier: node.identifier.clone(),
                    })?,
                Some(origin) => {
                    let inputs = origin
                        .parents
                        .iter()
                        .map(|parent| {
                            values
                                .get(parent)
                                .ok_or(GraphError::UnknownVariable(parent.0))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let output = origin.operation.forward(&inputs)?;
                    if self.log_execution {
                        debug!(
                            "executed {} ({}) -> shape {:?}",
                            node.identifier,
                            origin.operation.name(),
                            output.shape()
                        );
                    }
                    output
                }
            };
            values.insert(variable, value);
        }
        Ok(values)
    }

    /// Evaluates the requested variables, computing only their ancestors.
    pub fn execute(&self, targets: &[Variable]) -> Result<Activations> {
        let mut values = self.evaluate(targets)?;
        let arrays = targets
            .iter()
            .map(|target| {
                values
                    .get(target)
                    .map(|array| (*target, array.clone()))
                    .ok_or(GraphError::UnknownVariable(target.0))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(ArrayMap { arrays })
    }

    pub fn execute_all(&self) -> Result<Activations> {
        let arrays = self.evaluate(&self.variables())?;
        Ok(ArrayMap { arrays })
    }

    /// Output of the most recently recorded operation.
    pub fn execute_final(&self) -> Result<(Variable, ArrayD<f64>)> {
        let last = self
            .nodes
            .iter()
            .rposition(|node| node.kind == VariableKind::Operation)
            .map(Variable)
            .ok_or_else(|| {
                GraphError::invalid_argument("execute_final", "graph has no operations")
            })?;
        let mut values = self.evaluate(&[last])?;
        let array = values
            .remove(&last)
            .ok_or(GraphError::UnknownVariable(last.0))?;
        Ok((last, array))
    }

    fn register_parents(
        &self,
        sorter: &mut TopologicalSort<Variable>,
        visited: &mut HashSet<Variable>,
        child: Variable,
    ) {
        if !visited.insert(child) {
            return;
        }
        if let Some(origin) = &self.nodes[child.0].origin {
            for &parent in &origin.parents {
                sorter.add_dependency(parent, child);
                self.register_parents(sorter, visited, parent);
            }
        }
    }

    fn sorted_computation_graph(&self, ends: &[Variable]) -> Vec<Variable> {
        let mut sorter = TopologicalSort::new();
        let mut visited = HashSet::new();
        for &end in ends {
            sorter.insert(end);
            self.register_parents(&mut sorter, &mut visited, end);
        }
        let mut sorted = Vec::new();
        while let Some(variable) = sorter.pop() {
            sorted.push(variable);
        }
        // reverse-topological order: every consumer before its inputs
        sorted.reverse();
        sorted
    }

    fn requires_gradient(&self, variable: Variable) -> bool {
        matches!(
            self.nodes[variable.0].kind,
            VariableKind::Variable | VariableKind::Operation
        )
    }

    /// Reverse-mode differentiation of the sum of `losses` (the default
    /// losses when empty). Returns gradients for trainable variables only.
    pub fn execute_backward(&self, losses: &[Variable]) -> Result<Gradients> {
        let losses = if losses.is_empty() {
            self.default_losses()
        } else {
            losses.to_vec()
        };
        if losses.is_empty() {
            return Err(GraphError::invalid_argument(
                "execute_backward",
                "graph has no loss variables",
            ));
        }
        let values = self.evaluate(&losses)?;
        let lookup = |variable: &Variable| {
            values
                .get(variable)
                .ok_or(GraphError::UnknownVariable(variable.0))
        };

        let mut pending = HashMap::new();
        for loss in &losses {
            accumulate(&mut pending, *loss, ArrayD::ones(lookup(loss)?.raw_dim()));
        }

        let mut gradients = HashMap::new();
        for variable in self.sorted_computation_graph(&losses) {
            let Some(gradient) = pending.remove(&variable) else {
                continue;
            };
            let node = &self.nodes[variable.0];
            let Some(origin) = &node.origin else {
                if node.kind == VariableKind::Variable {
                    gradients.insert(variable, gradient);
                }
                continue;
            };
            if !origin.operation.differentiable() {
                continue;
            }
            let args = origin
                .parents
                .iter()
                .map(lookup)
                .collect::<Result<Vec<_>>>()?;
            let output = lookup(&variable)?;
            for (i, &parent) in origin.parents.iter().enumerate() {
                if !self.requires_gradient(parent) {
                    continue;
                }
                let contribution = origin.operation.backward(&gradient, &args, output, i)?;
                if contribution.shape() != args[i].shape() {
                    return Err(GraphError::shape_mismatch(
                        format!("gradient of {} for argument {}", node.identifier, i),
                        args[i].shape(),
                        contribution.shape(),
                    ));
                }
                accumulate(&mut pending, parent, contribution);
            }
        }
        Ok(ArrayMap { arrays: gradients })
    }

    /// The `framework` name of every operation node, in creation order.
    pub fn export_names(&self, framework: Framework) -> Result<Vec<(String, &'static str)>> {
        self.nodes
            .iter()
            .filter_map(|node| node.origin.as_ref().map(|origin| (node, origin)))
            .map(|(node, origin)| {
                let name = registry::export_name(origin.operation.name(), framework)?;
                Ok((node.identifier.clone(), name))
            })
            .collect()
    }
}

fn check_declared_shape(identifier: &str, declared: &[Option<usize>], actual: &[usize]) -> Result<()> {
    let matches = declared.len() == actual.len()
        && declared
            .iter()
            .zip(actual)
            .all(|(expected, &extent)| expected.map_or(true, |expected| expected == extent));
    if matches {
        Ok(())
    } else {
        // wildcard extents are reported as 0
        let expected = declared
            .iter()
            .map(|extent| extent.unwrap_or(0))
            .collect::<Vec<_>>();
        Err(GraphError::shape_mismatch(
            format!("array for {:?}", identifier),
            &expected,
            actual,
        ))
    }
}
