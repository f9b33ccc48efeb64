use ndarray::prelude::*;
use ndarray::IxDyn;

use super::error::Result;
use super::lanes::fold_lanes;
use super::operations::{unary_input, Operation};
use super::{Graph, Variable};

/// Element predicate used by `first_index`, `last_index` and the
/// match-condition count. Comparisons are exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    GreaterThan(f64),
    GreaterThanOrEqual(f64),
    LessThan(f64),
    LessThanOrEqual(f64),
    EqualTo(f64),
    NotEqualTo(f64),
    AbsGreaterThan(f64),
    AbsLessThan(f64),
    IsNaN,
    IsInfinite,
}

impl Condition {
    pub fn matches(&self, x: f64) -> bool {
        match *self {
            Condition::GreaterThan(value) => x > value,
            Condition::GreaterThanOrEqual(value) => x >= value,
            Condition::LessThan(value) => x < value,
            Condition::LessThanOrEqual(value) => x <= value,
            Condition::EqualTo(value) => x == value,
            Condition::NotEqualTo(value) => x != value,
            Condition::AbsGreaterThan(value) => x.abs() > value,
            Condition::AbsLessThan(value) => x.abs() < value,
            Condition::IsNaN => x.is_nan(),
            Condition::IsInfinite => x.is_infinite(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexAccumulationKind {
    ArgMax,
    ArgMin,
    /// argmax of |x|
    IAMax,
    IAMin,
    FirstIndex(Condition),
    LastIndex(Condition),
}

/// Position of the first element strictly preferred by `better` to every
/// element before it, so ties resolve to the lowest index.
pub(super) fn position_of_best<F>(lane: ArrayView1<f64>, better: F) -> Option<usize>
where
    F: Fn(f64, f64) -> bool,
{
    let mut best: Option<(usize, f64)> = None;
    for (i, &x) in lane.iter().enumerate() {
        match best {
            Some((_, current)) if !better(x, current) => {}
            _ => best = Some((i, x)),
        }
    }
    best.map(|(i, _)| i)
}

impl IndexAccumulationKind {
    pub fn name(&self) -> &'static str {
        match self {
            IndexAccumulationKind::ArgMax => "argmax",
            IndexAccumulationKind::ArgMin => "argmin",
            IndexAccumulationKind::IAMax => "iamax",
            IndexAccumulationKind::IAMin => "iamin",
            IndexAccumulationKind::FirstIndex(_) => "first_index",
            IndexAccumulationKind::LastIndex(_) => "last_index",
        }
    }

    /// Index within the lane, or −1 when no element qualifies.
    pub fn index(&self, lane: ArrayView1<f64>) -> f64 {
        let position = match self {
            IndexAccumulationKind::ArgMax => position_of_best(lane, |x, best| x > best),
            IndexAccumulationKind::ArgMin => position_of_best(lane, |x, best| x < best),
            IndexAccumulationKind::IAMax => {
                position_of_best(lane, |x, best| x.abs() > best.abs())
            }
            IndexAccumulationKind::IAMin => {
                position_of_best(lane, |x, best| x.abs() < best.abs())
            }
            IndexAccumulationKind::FirstIndex(condition) => {
                lane.iter().position(|&x| condition.matches(x))
            }
            IndexAccumulationKind::LastIndex(condition) => {
                lane.iter().rposition(|&x| condition.matches(x))
            }
        };
        position.map_or(-1., |i| i as f64)
    }
}

pub struct IndexAccumulation {
    kind: IndexAccumulationKind,
    axes: Vec<usize>,
    keep_dims: bool,
}

impl IndexAccumulation {
    pub fn new(kind: IndexAccumulationKind, axes: &[usize], keep_dims: bool) -> Self {
        Self {
            kind,
            axes: axes.to_vec(),
            keep_dims,
        }
    }
}

impl Operation for IndexAccumulation {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn forward(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
        let x = unary_input(self.name(), inputs)?;
        fold_lanes(x, &self.axes, self.keep_dims, |lane| self.kind.index(lane))
    }

    fn backward(
        &self,
        _out_gradient: &ArrayD<f64>,
        args: &[&ArrayD<f64>],
        _output: &ArrayD<f64>,
        _arg_index: usize,
    ) -> Result<ArrayD<f64>> {
        Ok(ArrayD::zeros(IxDyn(args[0].shape())))
    }

    fn differentiable(&self) -> bool {
        false
    }
}

impl Graph {
    pub fn index_accumulation(
        &mut self,
        kind: IndexAccumulationKind,
        x: Variable,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<Variable> {
        self.record(Box::new(IndexAccumulation::new(kind, axes, keep_dims)), vec![x])
    }

    pub fn argmax(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.index_accumulation(IndexAccumulationKind::ArgMax, x, axes, false)
    }

    pub fn argmin(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.index_accumulation(IndexAccumulationKind::ArgMin, x, axes, false)
    }

    pub fn iamax(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.index_accumulation(IndexAccumulationKind::IAMax, x, axes, false)
    }

    pub fn iamin(&mut self, x: Variable, axes: &[usize]) -> Result<Variable> {
        self.index_accumulation(IndexAccumulationKind::IAMin, x, axes, false)
    }

    pub fn first_index(
        &mut self,
        x: Variable,
        condition: Condition,
        axes: &[usize],
    ) -> Result<Variable> {
        self.index_accumulation(IndexAccumulationKind::FirstIndex(condition), x, axes, false)
    }

    pub fn last_index(
        &mut self,
        x: Variable,
        condition: Condition,
        axes: &[usize],
    ) -> Result<Variable> {
        self.index_accumulation(IndexAccumulationKind::LastIndex(condition), x, axes, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(kind: IndexAccumulationKind, values: &[f64]) -> f64 {
        kind.index(ArrayView1::from(values))
    }

    #[test]
    fn test_ties_resolve_to_first_index() {
        use IndexAccumulationKind::*;
        let values = [1., 5., -5., 5., -1., 1.];
        assert_eq!(index(ArgMax, &values), 1.);
        assert_eq!(index(ArgMin, &values), 2.);
        assert_eq!(index(IAMax, &values), 1.);
        assert_eq!(index(IAMin, &values), 0.);
    }

    #[test]
    fn test_first_and_last_index() {
        use IndexAccumulationKind::*;
        let values = [0., 3., 1., 4., 1.];
        assert_eq!(index(FirstIndex(Condition::EqualTo(1.)), &values), 2.);
        assert_eq!(index(LastIndex(Condition::EqualTo(1.)), &values), 4.);
        assert_eq!(index(FirstIndex(Condition::GreaterThan(10.)), &values), -1.);
        assert_eq!(index(LastIndex(Condition::LessThan(0.)), &values), -1.);
        assert_eq!(
            index(FirstIndex(Condition::AbsGreaterThan(3.5)), &values),
            3.
        );
        assert_eq!(index(FirstIndex(Condition::IsNaN), &[1., f64::NAN]), 1.);
    }

    #[test]
    fn test_conditions() {
        assert!(Condition::GreaterThanOrEqual(2.).matches(2.));
        assert!(!Condition::GreaterThan(2.).matches(2.));
        assert!(Condition::LessThanOrEqual(2.).matches(2.));
        assert!(Condition::NotEqualTo(2.).matches(2.5));
        assert!(Condition::AbsLessThan(1.).matches(-0.5));
        assert!(Condition::IsInfinite.matches(f64::NEG_INFINITY));
        // exact equality: no tolerance
        assert!(!Condition::EqualTo(0.3).matches(0.1 + 0.2));
    }

    #[test]
    fn test_index_along_axes() {
        let x = array![[[1., 9.], [4., 2.]], [[7., 7.], [0., 3.]]].into_dyn();
        let along_last = IndexAccumulation::new(IndexAccumulationKind::ArgMax, &[2], false)
            .forward(&[&x])
            .unwrap();
        assert_eq!(along_last, array![[1., 0.], [0., 1.]].into_dyn());

        // flat C-order index over axes 1 and 2
        let over_trailing = IndexAccumulation::new(IndexAccumulationKind::ArgMin, &[1, 2], true)
            .forward(&[&x])
            .unwrap();
        assert_eq!(over_trailing, array![[[0.]], [[2.]]].into_dyn());

        let everywhere = IndexAccumulation::new(IndexAccumulationKind::ArgMax, &[], false)
            .forward(&[&x])
            .unwrap();
        assert_eq!(everywhere, arr0(1.).into_dyn());
    }

    #[test]
    fn test_graph_builders() {
        let mut graph = Graph::new();
        let x = graph
            .variable("x", array![[3., -8., 8.], [0., 0., 2.]].into_dyn())
            .unwrap();
        let iamax = graph.iamax(x, &[1]).unwrap();
        let last_zero = graph.last_index(x, Condition::EqualTo(0.), &[1]).unwrap();
        let activations = graph.execute(&[iamax, last_zero]).unwrap();
        assert_eq!(activations.array(iamax).unwrap(), &array![1., 2.].into_dyn());
        assert_eq!(activations.array(last_zero).unwrap(), &array![-1., 1.].into_dyn());
    }
}
