//! Neighbour search in embedding space.

pub mod knn;
