//! Containers for the count data.

pub mod count_matrix;
