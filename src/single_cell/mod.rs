//! Doublet detection for single cell count data.

pub mod embedding;
pub mod methods;
