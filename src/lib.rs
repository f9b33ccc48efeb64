//! Symbolic tensor graphs with reverse-mode differentiation: reductions,
//! index accumulations, pairwise distances, moments and dot-product
//! attention, plus a harness for validating kernels against reference values
//! and finite-difference gradients.

pub mod graph;
pub mod validation;
