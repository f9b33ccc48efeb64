use thiserror::Error;

use super::registry::Framework;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("no variable named {0:?} in graph")]
    UnknownIdentifier(String),

    #[error("variable index {0} does not belong to this graph")]
    UnknownVariable(usize),

    #[error("identifier {0:?} is already in use")]
    DuplicateIdentifier(String),

    #[error("variable {identifier:?} has no associated array")]
    MissingArray { identifier: String },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("axis {axis} is out of range for an array of rank {rank}")]
    InvalidAxis { axis: isize, rank: usize },

    #[error("{operation}: {message}")]
    InvalidArgument {
        operation: &'static str,
        message: String,
    },

    #[error("no {framework} op name found for {operation}")]
    NoExportName {
        operation: String,
        framework: Framework,
    },

    #[error("no kernel registered as {0:?}")]
    UnknownKernel(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl GraphError {
    pub fn invalid_argument(operation: &'static str, message: impl Into<String>) -> Self {
        GraphError::InvalidArgument {
            operation,
            message: message.into(),
        }
    }

    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        GraphError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
