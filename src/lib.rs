//! Doublet detection in single cell count data via the density of simulated
//! doublets.
//!
//! Artificial doublets are generated by summing the counts of random cell
//! pairs. Real cells and simulated doublets are projected into the same
//! embedding, every real cell is scored by how enriched its neighbourhood is
//! in simulated doublets, and the scores are thresholded per sample.

pub mod core;
pub mod single_cell;
pub mod utils;

#[cfg(feature = "r")]
mod r_bindings;

pub use crate::core::data::count_matrix::{CountMatrix, FeatureSelection};
pub use crate::single_cell::embedding::{
    EmbeddingProjector, LinearProjector, PcaParams, PcaProjector,
};
pub use crate::single_cell::methods::density_scoring::{DensityMethod, DensityScorer};
pub use crate::single_cell::methods::doublet_density::{
    DoubletDensity, DoubletDensityParams, DoubletDensityResult, DoubletScores,
};
pub use crate::single_cell::methods::doublet_simulation::{
    combine_pairs, DoubletSimulator, SimulatedDoublets, SimulationParams,
};
pub use crate::single_cell::methods::doublet_thresholding::{
    DoubletCalls, SampleThreshold, ThresholdCaller, ThresholdParams,
};
pub use crate::utils::errors::{DoubletError, Result};

#[cfg(feature = "r")]
use r_bindings::r_doublets;

#[cfg(feature = "r")]
extendr_api::extendr_module! {
    mod dbldensity;
    use r_doublets;
}
