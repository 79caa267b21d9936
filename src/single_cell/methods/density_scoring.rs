use faer::MatRef;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::graph::knn::ExactKnn;
use crate::utils::errors::{DoubletError, Result};
use crate::{check_same_ncols, ensure_input};

/// Smallest neighbour distance used in the density estimates. Zero distances
/// (identical embeddings) are clamped to this value.
pub const MIN_DISTANCE: f64 = 1e-8;

///////////
// Enums //
///////////

/// How the local densities around a cell are estimated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DensityMethod {
    /// `d / r^k` with `r` the distance to the d-th neighbour and `k` the
    /// number of embedding dimensions (volume of a k-ball).
    #[default]
    KBall,
    /// Number of simulated doublets within the distance to the d-th real
    /// neighbour.
    NeighbourCount,
}

/// Helper function to parse the density method
///
/// ### Params
///
/// * `s` - Name of the method.
///
/// ### Returns
///
/// Option of the `DensityMethod`
pub fn parse_density_method(s: &str) -> Option<DensityMethod> {
    match s.to_lowercase().as_str() {
        "kball" | "k_ball" => Some(DensityMethod::KBall),
        "count" | "neighbour_count" | "neighbor_count" => Some(DensityMethod::NeighbourCount),
        _ => None,
    }
}

/////////////
// Helpers //
/////////////

/// Clamp a neighbour distance, flagging whether the clamp kicked in
#[inline]
fn clamp_distance(dist: f64) -> (f64, bool) {
    if dist < MIN_DISTANCE {
        (MIN_DISTANCE, true)
    } else {
        (dist, false)
    }
}

/// Whether every entry of a matrix is finite
fn all_finite(mat: MatRef<f64>) -> bool {
    mat.col_iter().all(|col| col.iter().all(|v| v.is_finite()))
}

/// Collect the rows of an embedding as plain vectors
fn embedding_rows(embd: MatRef<f64>) -> Vec<Vec<f64>> {
    (0..embd.nrows())
        .map(|i| embd.row(i).iter().copied().collect())
        .collect()
}

////////////////////
// Main structure //
////////////////////

/// Scores every real cell by the density of simulated doublets relative to
/// the density of real cells in its neighbourhood
///
/// ### Fields
///
/// * `n_neighbours` - The neighbourhood size `d`.
/// * `method` - The density estimate to use.
#[derive(Clone, Debug)]
pub struct DensityScorer {
    n_neighbours: usize,
    method: DensityMethod,
}

impl DensityScorer {
    /// Generate a new instance
    pub fn new(n_neighbours: usize, method: DensityMethod) -> Self {
        Self {
            n_neighbours,
            method,
        }
    }

    /// Calculate the doublet scores
    ///
    /// A score of 1 means the cell's neighbourhood is as rich in simulated
    /// doublets as expected from the sizes of the two populations. Values
    /// well above 1 indicate doublet-like cells.
    ///
    /// ### Params
    ///
    /// * `real_embd` - Embedding of the real cells (N x k).
    /// * `sim_embd` - Embedding of the simulated doublets (S x k), produced by
    ///   the same projection.
    ///
    /// ### Returns
    ///
    /// One finite, non-negative score per real cell in input order.
    pub fn score(&self, real_embd: MatRef<f64>, sim_embd: MatRef<f64>) -> Result<Vec<f64>> {
        let start = Instant::now();

        let n_real = real_embd.nrows();
        let n_sim = sim_embd.nrows();
        let d = self.n_neighbours;

        check_same_ncols!(real_embd, sim_embd);
        ensure_input!(real_embd.ncols() >= 1, "The embedding has no dimensions");
        ensure_input!(d >= 1, "The number of neighbours needs to be at least 1");
        ensure_input!(
            all_finite(real_embd),
            "The embedding of the real cells contains non-finite values"
        );
        ensure_input!(
            all_finite(sim_embd),
            "The embedding of the simulated doublets contains non-finite values"
        );
        if d >= n_real || d >= n_sim {
            return Err(DoubletError::invalid(format!(
                "n_neighbours = {} needs to be smaller than the number of cells ({}) and of simulated doublets ({})",
                d, n_real, n_sim
            )));
        }

        let real_index = ExactKnn::new(real_embd);
        let sim_index = ExactKnn::new(sim_embd);
        let queries = embedding_rows(real_embd);

        let n_dims = real_embd.ncols() as f64;
        // (N - 1) / S: expected ratio of real to simulated neighbours
        let size_ratio = (n_real - 1) as f64 / n_sim as f64;

        let scores_clamped: Vec<(f64, bool)> = queries
            .par_iter()
            .enumerate()
            .map(|(cell, query)| {
                // d < n_real guarantees d other real cells exist
                let real_dist = real_index
                    .kth_distance(query, d, Some(cell))
                    .unwrap_or(MIN_DISTANCE);
                let (real_r, real_clamped) = clamp_distance(real_dist);

                match self.method {
                    DensityMethod::KBall => {
                        let sim_dist = sim_index.kth_distance(query, d, None).unwrap_or(MIN_DISTANCE);
                        let (sim_r, sim_clamped) = clamp_distance(sim_dist);

                        let log_score = n_dims * (real_r.ln() - sim_r.ln()) + size_ratio.ln();
                        let score = log_score.exp().min(f64::MAX);
                        (score, real_clamped || sim_clamped)
                    }
                    DensityMethod::NeighbourCount => {
                        let n_sim_within = sim_index.count_within(query, real_r) as f64;
                        let score = (n_sim_within / n_sim as f64) / (d as f64 / (n_real - 1) as f64);
                        (score, real_clamped)
                    }
                }
            })
            .collect();

        let n_clamped = scores_clamped.iter().filter(|(_, c)| *c).count();
        if n_clamped > 0 {
            debug!(
                "Clamped zero neighbour distances to {:e} for {} cells",
                MIN_DISTANCE, n_clamped
            );
        }

        info!(
            "Scored {} cells against {} simulated doublets (d = {}) in {:.2?}",
            n_real,
            n_sim,
            d,
            start.elapsed()
        );

        Ok(scores_clamped.into_iter().map(|(s, _)| s).collect())
    }
}
