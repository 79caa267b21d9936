//! Basic statistics (medians, MADs, tail probabilities) and the SVD used for
//! the embedding.

pub mod pca_svd;
pub mod stats;
