use faer::Mat;
use log::info;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::data::count_matrix::CountMatrix;
use crate::ensure_input;
use crate::utils::errors::{DoubletError, Result};

/// Lower bound on the default number of simulated doublets
pub const MIN_DEFAULT_SIMULATIONS: usize = 10_000;

////////////
// Params //
////////////

/// Parameters for the doublet simulation
///
/// ### Fields
///
/// * `n_doublets` - Number of doublets to simulate. `None` resolves to
///   `max(10000, n_cells)`.
/// * `allow_self_pairs` - Whether a cell may be paired with itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct SimulationParams {
    pub n_doublets: Option<usize>,
    pub allow_self_pairs: bool,
}

impl SimulationParams {
    /// Resolve the number of doublets to simulate for `n_cells` cells
    pub fn resolve_n_doublets(&self, n_cells: usize) -> usize {
        self.n_doublets
            .unwrap_or_else(|| MIN_DEFAULT_SIMULATIONS.max(n_cells))
    }
}

/////////////
// Results //
/////////////

/// Simulated doublet profiles
///
/// Ephemeral; only lives for the duration of one scoring run.
///
/// ### Fields
///
/// * `profiles` - Summed raw counts, rows = doublets, columns = features.
/// * `pairs` - The (cell, cell) column indices each doublet was built from.
#[derive(Clone, Debug)]
pub struct SimulatedDoublets {
    pub profiles: Mat<f64>,
    pub pairs: Vec<(usize, usize)>,
}

impl SimulatedDoublets {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/////////////
// Helpers //
/////////////

/// Sum the profiles of explicit cell pairs
///
/// The two count vectors are added up on the feature subset without any
/// downscaling; a doublet carries roughly the content of two cells. The sums
/// are written straight into the output, one feature column per task.
///
/// ### Params
///
/// * `counts` - The count matrix.
/// * `features` - Row indices of the features to keep.
/// * `pairs` - Column indices of the cells to combine.
///
/// ### Returns
///
/// The `SimulatedDoublets` with one row per pair, in pair order.
pub fn combine_pairs(
    counts: &CountMatrix,
    features: &[usize],
    pairs: &[(usize, usize)],
) -> Result<SimulatedDoublets> {
    let n_cells = counts.n_cells();
    ensure_input!(!features.is_empty(), "The feature subset is empty");
    if let Some(&bad) = features.iter().find(|&&f| f >= counts.n_genes()) {
        return Err(DoubletError::invalid(format!(
            "Feature index {} out of range for {} genes",
            bad,
            counts.n_genes()
        )));
    }
    if let Some(&(i, j)) = pairs.iter().find(|&&(i, j)| i >= n_cells || j >= n_cells) {
        return Err(DoubletError::invalid(format!(
            "Pair ({}, {}) out of range for {} cells",
            i, j, n_cells
        )));
    }

    let mut profiles: Mat<f64> = Mat::zeros(pairs.len(), features.len());

    profiles
        .par_col_iter_mut()
        .enumerate()
        .for_each(|(f, mut col)| {
            let gene = features[f];
            for (d, &(i, j)) in pairs.iter().enumerate() {
                col[d] = counts.get(gene, i) + counts.get(gene, j);
            }
        });

    Ok(SimulatedDoublets {
        profiles,
        pairs: pairs.to_vec(),
    })
}

////////////////////
// Main structure //
////////////////////

/// Generator of artificial doublets from random cell pairs
#[derive(Clone, Debug)]
pub struct DoubletSimulator {
    params: SimulationParams,
}

impl DoubletSimulator {
    /// Generate a new instance
    pub fn new(params: SimulationParams) -> Self {
        Self { params }
    }

    /// Draw the random cell pairs
    ///
    /// Pairs are drawn sequentially from a single generator so the result
    /// only depends on the seed, never on the thread count.
    ///
    /// ### Params
    ///
    /// * `n_cells` - Number of real cells.
    /// * `n_doublets` - Number of pairs to draw.
    /// * `seed` - Seed for reproducibility.
    ///
    /// ### Returns
    ///
    /// Vector of (first, second) cell indices.
    pub fn sample_pairs(&self, n_cells: usize, n_doublets: usize, seed: u64) -> Result<Vec<(usize, usize)>> {
        ensure_input!(
            n_cells >= 2,
            "Need at least 2 cells to form doublets, got {}",
            n_cells
        );

        let mut rng = StdRng::seed_from_u64(seed);

        let pairs = (0..n_doublets)
            .map(|_| {
                let i = rng.random_range(0..n_cells);
                let mut j = rng.random_range(0..n_cells);
                while !self.params.allow_self_pairs && j == i {
                    j = rng.random_range(0..n_cells);
                }
                (i, j)
            })
            .collect();

        Ok(pairs)
    }

    /// Simulate doublets
    ///
    /// ### Params
    ///
    /// * `counts` - The count matrix of the real cells.
    /// * `features` - Row indices of the feature subset.
    /// * `seed` - Seed for reproducibility.
    ///
    /// ### Returns
    ///
    /// The `SimulatedDoublets`.
    pub fn simulate(&self, counts: &CountMatrix, features: &[usize], seed: u64) -> Result<SimulatedDoublets> {
        let start = Instant::now();
        ensure_input!(!features.is_empty(), "The feature subset is empty");

        let n_doublets = self.params.resolve_n_doublets(counts.n_cells());
        ensure_input!(n_doublets >= 1, "Need to simulate at least one doublet");

        let pairs = self.sample_pairs(counts.n_cells(), n_doublets, seed)?;
        let res = combine_pairs(counts, features, &pairs)?;

        info!(
            "Simulated {} doublets on {} features in {:.2?}",
            res.len(),
            features.len(),
            start.elapsed()
        );

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn toy_counts() -> CountMatrix {
        let counts = mat![
            [1.0, 2.0, 3.0, 4.0],
            [10.0, 20.0, 30.0, 40.0],
            [0.0, 0.0, 5.0, 0.0],
        ];
        CountMatrix::from_ref(counts.as_ref()).unwrap()
    }

    #[test]
    fn test_combine_pairs_sums_without_scaling() {
        let counts = toy_counts();
        let res = combine_pairs(&counts, &[0, 2], &[(0, 2), (1, 1)]).unwrap();

        assert_eq!(res.len(), 2);
        assert_eq!(res.profiles.nrows(), 2);
        assert_eq!(res.profiles.ncols(), 2);
        assert_eq!(res.profiles[(0, 0)], 4.0);
        assert_eq!(res.profiles[(0, 1)], 5.0);
        assert_eq!(res.profiles[(1, 0)], 4.0);
        assert_eq!(res.profiles[(1, 1)], 0.0);
    }

    #[test]
    fn test_combine_pairs_validation() {
        let counts = toy_counts();
        assert!(combine_pairs(&counts, &[], &[(0, 1)]).is_err());
        assert!(combine_pairs(&counts, &[3], &[(0, 1)]).is_err());
        assert!(combine_pairs(&counts, &[0], &[(0, 4)]).is_err());
    }

    #[test]
    fn test_simulation_is_reproducible() {
        let counts = toy_counts();
        let sim = DoubletSimulator::new(SimulationParams {
            n_doublets: Some(50),
            allow_self_pairs: false,
        });

        let a = sim.simulate(&counts, &[0, 1], 123).unwrap();
        let b = sim.simulate(&counts, &[0, 1], 123).unwrap();
        let c = sim.simulate(&counts, &[0, 1], 124).unwrap();

        assert_eq!(a.pairs, b.pairs);
        assert_eq!(a.profiles, b.profiles);
        assert_ne!(a.pairs, c.pairs);
        assert!(a.pairs.iter().all(|&(i, j)| i != j && i < 4 && j < 4));
    }

    #[test]
    fn test_default_number_of_doublets() {
        let params = SimulationParams::default();
        assert_eq!(params.resolve_n_doublets(10), 10_000);
        assert_eq!(params.resolve_n_doublets(25_000), 25_000);
    }

    #[test]
    fn test_needs_two_cells() {
        let counts = CountMatrix::from_ref(mat![[1.0], [2.0]].as_ref()).unwrap();
        let sim = DoubletSimulator::new(SimulationParams::default());
        assert!(matches!(
            sim.simulate(&counts, &[0], 1),
            Err(DoubletError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_self_pairs_allowed() {
        let sim = DoubletSimulator::new(SimulationParams {
            n_doublets: None,
            allow_self_pairs: true,
        });
        let pairs = sim.sample_pairs(2, 200, 7).unwrap();
        assert!(pairs.iter().any(|&(i, j)| i == j));
    }
}
