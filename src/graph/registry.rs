use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

use super::error::{GraphError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framework {
    Onnx,
    TensorFlow,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framework::Onnx => write!(f, "onnx"),
            Framework::TensorFlow => write!(f, "tensorflow"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelDescriptor {
    pub name: &'static str,
    pub opcode: u32,
    pub onnx_name: Option<&'static str>,
    pub tensorflow_name: Option<&'static str>,
    pub differentiable: bool,
}

impl KernelDescriptor {
    pub fn export_name(&self, framework: Framework) -> Option<&'static str> {
        match framework {
            Framework::Onnx => self.onnx_name,
            Framework::TensorFlow => self.tensorflow_name,
        }
    }
}

const fn kernel(
    name: &'static str,
    opcode: u32,
    onnx_name: Option<&'static str>,
    tensorflow_name: Option<&'static str>,
    differentiable: bool,
) -> KernelDescriptor {
    KernelDescriptor {
        name,
        opcode,
        onnx_name,
        tensorflow_name,
        differentiable,
    }
}

lazy_static! {
    // opcodes are grouped by family: pairwise 0.., transforms 10..,
    // structural 20.., linear algebra 30.., reductions 40..,
    // index accumulations 70.., reduce3 80.., attention helpers 90..
    static ref KERNELS: Vec<KernelDescriptor> = vec![
        kernel("add", 0, Some("Add"), Some("Add"), true),
        kernel("subtract", 1, Some("Sub"), Some("Sub"), true),
        kernel("divide", 2, Some("Div"), Some("RealDiv"), true),
        kernel("multiply", 3, Some("Mul"), Some("Mul"), true),
        kernel("negate", 10, Some("Neg"), Some("Neg"), true),
        kernel("scalar_multiply", 11, None, None, true),
        kernel("scalar_add", 12, None, None, true),
        kernel("square", 13, None, Some("Square"), true),
        kernel("exp", 14, Some("Exp"), Some("Exp"), true),
        kernel("log", 15, Some("Log"), Some("Log"), true),
        kernel("abs", 16, Some("Abs"), Some("Abs"), true),
        kernel("softmax", 17, Some("Softmax"), Some("Softmax"), true),
        kernel("reshape", 20, Some("Reshape"), Some("Reshape"), true),
        kernel("permute", 21, Some("Transpose"), Some("Transpose"), true),
        kernel("flatten_trailing", 22, None, None, true),
        kernel("matmul", 30, Some("MatMul"), Some("BatchMatMulV2"), true),
        kernel("tensor_mmul", 31, None, None, true),
        kernel("dimension_scaling", 32, None, None, true),
        kernel("reduce_mean", 40, Some("ReduceMean"), Some("Mean"), true),
        kernel("reduce_sum", 41, Some("ReduceSum"), Some("Sum"), true),
        kernel("reduce_stdev", 42, None, None, true),
        kernel("reduce_variance", 43, None, None, true),
        kernel("reduce_min", 44, Some("ReduceMin"), Some("Min"), true),
        kernel("reduce_max", 45, Some("ReduceMax"), Some("Max"), true),
        kernel("reduce_prod", 46, Some("ReduceProd"), Some("Prod"), true),
        kernel("reduce_norm1", 47, Some("ReduceL1"), None, true),
        kernel("reduce_norm2", 48, Some("ReduceL2"), Some("EuclideanNorm"), true),
        kernel("reduce_normmax", 49, None, None, true),
        kernel("reduce_sqnorm", 50, Some("ReduceSumSquare"), None, true),
        kernel("reduce_amax", 51, None, None, true),
        kernel("reduce_amin", 52, None, None, true),
        kernel("reduce_asum", 53, None, None, true),
        kernel("reduce_amean", 54, None, None, true),
        kernel("entropy", 55, None, None, true),
        kernel("log_entropy", 56, None, None, true),
        kernel("shannon_entropy", 57, None, None, true),
        kernel("reduce_logsumexp", 58, Some("ReduceLogSumExp"), None, true),
        kernel("count_non_zero", 59, None, None, false),
        kernel("count_zero", 60, None, None, false),
        kernel("zero_fraction", 61, None, None, false),
        kernel("all", 62, None, Some("All"), false),
        kernel("any", 63, None, Some("Any"), false),
        kernel("match_condition_count", 64, None, None, false),
        kernel("argmax", 70, Some("ArgMax"), Some("ArgMax"), false),
        kernel("argmin", 71, Some("ArgMin"), Some("ArgMin"), false),
        kernel("iamax", 72, None, None, false),
        kernel("iamin", 73, None, None, false),
        kernel("first_index", 74, None, None, false),
        kernel("last_index", 75, None, None, false),
        kernel("manhattan", 80, None, None, true),
        kernel("euclidean", 81, None, None, true),
        kernel("cosine_similarity", 82, None, None, true),
        kernel("cosine_distance", 83, None, None, true),
        kernel("hamming", 84, None, None, false),
        kernel("jaccard", 85, None, None, true),
        kernel("dot", 86, None, None, true),
        kernel("attention_mask_bias", 90, None, None, false),
    ];
    static ref BY_NAME: HashMap<&'static str, usize> = KERNELS
        .iter()
        .enumerate()
        .map(|(index, descriptor)| (descriptor.name, index))
        .collect();
    static ref BY_OPCODE: HashMap<u32, usize> = KERNELS
        .iter()
        .enumerate()
        .map(|(index, descriptor)| (descriptor.opcode, index))
        .collect();
}

pub fn lookup(name: &str) -> Result<&'static KernelDescriptor> {
    BY_NAME
        .get(name)
        .map(|&index| &KERNELS[index])
        .ok_or_else(|| GraphError::UnknownKernel(name.to_owned()))
}

pub fn lookup_opcode(opcode: u32) -> Result<&'static KernelDescriptor> {
    BY_OPCODE
        .get(&opcode)
        .map(|&index| &KERNELS[index])
        .ok_or_else(|| GraphError::UnknownKernel(format!("opcode {}", opcode)))
}

/// The name `framework` uses for the kernel `name`; failing to find one is
/// fatal for export.
pub fn export_name(name: &str, framework: Framework) -> Result<&'static str> {
    lookup(name)?
        .export_name(framework)
        .ok_or_else(|| GraphError::NoExportName {
            operation: name.to_owned(),
            framework,
        })
}

pub fn kernels() -> impl Iterator<Item = &'static KernelDescriptor> {
    KERNELS.iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::distances::DistanceKind;
    use crate::graph::index_accumulations::Condition;
    use crate::graph::reductions::ReductionKind;
    use crate::graph::Graph;
    use ndarray::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_multiply_opcode() {
        let multiply = lookup_opcode(3).unwrap();
        assert_eq!(multiply.name, "multiply");
        assert!(multiply.differentiable);
        assert_eq!(lookup("multiply").unwrap(), multiply);
    }

    #[test]
    fn test_names_and_opcodes_are_unique() {
        assert_eq!(BY_NAME.len(), KERNELS.len());
        assert_eq!(BY_OPCODE.len(), KERNELS.len());
    }

    #[test]
    fn test_export_names() {
        assert_eq!(export_name("reduce_mean", Framework::TensorFlow).unwrap(), "Mean");
        assert_eq!(export_name("reduce_norm1", Framework::Onnx).unwrap(), "ReduceL1");
        let error = export_name("reduce_amean", Framework::TensorFlow).unwrap_err();
        assert!(matches!(error, GraphError::NoExportName { .. }));
        assert_eq!(
            error.to_string(),
            "no tensorflow op name found for reduce_amean"
        );
        assert!(matches!(
            export_name("no_such_kernel", Framework::Onnx),
            Err(GraphError::UnknownKernel(_))
        ));
        assert!(lookup_opcode(9999).is_err());
    }

    #[test]
    fn test_every_graph_operation_is_registered() {
        let mut graph = Graph::new();
        let x = graph
            .variable("x", Array::from_shape_fn((2, 3), |(i, j)| (i + j) as f64 + 0.5).into_dyn())
            .unwrap();
        let y = graph
            .variable("y", Array::from_shape_fn((2, 3), |(i, j)| (i * j) as f64 + 1.).into_dyn())
            .unwrap();
        for kind in ReductionKind::all(Condition::GreaterThan(1.)) {
            graph.reduce(kind, x, &[1], false).unwrap();
        }
        for kind in DistanceKind::all() {
            graph.pairwise_distance(kind, x, y, &[1], false).unwrap();
        }
        graph.argmax(x, &[]).unwrap();
        graph.argmin(x, &[]).unwrap();
        graph.iamax(x, &[]).unwrap();
        graph.iamin(x, &[]).unwrap();
        graph.first_index(x, Condition::EqualTo(1.5), &[]).unwrap();
        graph.last_index(x, Condition::EqualTo(1.5), &[]).unwrap();
        graph.add(x, y).unwrap();
        graph.sub(x, y).unwrap();
        graph.mul(x, y).unwrap();
        graph.div(x, y).unwrap();
        graph.neg(x).unwrap();
        graph.scalar_mul(x, 2.).unwrap();
        graph.scalar_add(x, 2.).unwrap();
        graph.square(x).unwrap();
        graph.exp(x).unwrap();
        graph.log(x).unwrap();
        graph.abs(x).unwrap();
        graph.softmax(x, -1).unwrap();
        graph.reshape(x, &[3, 2]).unwrap();
        graph.permute(x, &[1, 0]).unwrap();
        graph.flatten_trailing(x, 0).unwrap();
        graph.matmul_with(x, y, false, true).unwrap();
        graph.tensor_mmul(x, y, &[0], &[0]).unwrap();
        graph.dimension_scaling(x, y, -2).unwrap();

        let queries = graph.constant("q", Array::ones((1, 2, 2)).into_dyn()).unwrap();
        let mask = graph.constant("mask", Array::ones((1, 2)).into_dyn()).unwrap();
        graph
            .dot_product_attention(queries, queries, queries, Some(mask), true)
            .unwrap();

        let mut covered = HashSet::new();
        for variable in graph.variables() {
            let Some(name) = graph.operation_name(variable).unwrap() else {
                continue;
            };
            if let Some(origin) = &graph.nodes[variable.0].origin {
                let descriptor = lookup(name).unwrap();
                assert_eq!(
                    descriptor.differentiable,
                    origin.operation.differentiable(),
                    "{} disagrees with the registry",
                    name
                );
                covered.insert(name);
            }
        }
        let registered = kernels().map(|descriptor| descriptor.name).collect::<HashSet<_>>();
        assert_eq!(covered, registered);
        graph.execute_all().unwrap();
    }
}
