#[cfg(feature = "r")]
use extendr_api::List;
use faer::{Mat, MatRef};
use log::info;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::data::count_matrix::{CountMatrix, FeatureSelection};
use crate::ensure_input;
use crate::single_cell::embedding::{EmbeddingProjector, PcaParams, PcaProjector};
use crate::single_cell::methods::density_scoring::{DensityMethod, DensityScorer};
use crate::single_cell::methods::doublet_simulation::{
    DoubletSimulator, SimulatedDoublets, SimulationParams,
};
use crate::single_cell::methods::doublet_thresholding::{
    DoubletCalls, ThresholdCaller, ThresholdParams,
};
use crate::utils::errors::Result;

////////////////////////
// Params and results //
////////////////////////

/// Structure to store the doublet density parameters
///
/// ### Fields
///
/// * `features` - The feature subset used for the simulation and embedding.
/// * `simulation` - Number of simulated doublets and pairing rules.
/// * `pca` - Parameters of the PCA projection; only used when no projector
///   is supplied.
/// * `n_neighbours` - Neighbourhood size `d` for the density estimates.
/// * `density_method` - How local densities are estimated.
/// * `threshold` - Parameters of the per-sample doublet calling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoubletDensityParams {
    pub features: FeatureSelection,
    pub simulation: SimulationParams,
    pub pca: PcaParams,
    pub n_neighbours: usize,
    pub density_method: DensityMethod,
    pub threshold: ThresholdParams,
}

impl Default for DoubletDensityParams {
    fn default() -> Self {
        Self {
            features: FeatureSelection::All,
            simulation: SimulationParams::default(),
            pca: PcaParams::default(),
            n_neighbours: 50,
            density_method: DensityMethod::KBall,
            threshold: ThresholdParams::default(),
        }
    }
}

#[cfg(feature = "r")]
impl DoubletDensityParams {
    /// Generate DoubletDensityParams from an R list
    ///
    /// Should values not be found within the List, the parameters will default
    /// to the values of `DoubletDensityParams::default()`.
    ///
    /// ### Params
    ///
    /// * `r_list` - The list with the doublet density parameters.
    ///
    /// ### Returns
    ///
    /// The `DoubletDensityParams` or an error for unknown method names.
    pub fn from_r_list(r_list: List) -> Result<Self> {
        use crate::single_cell::methods::density_scoring::parse_density_method;
        use crate::utils::errors::DoubletError;

        let defaults = Self::default();
        let params_list = r_list.into_hashmap();

        let features = match params_list.get("n_top_features").and_then(|v| v.as_integer()) {
            Some(n) if n > 0 => FeatureSelection::TopVariable(n as usize),
            _ => FeatureSelection::All,
        };

        let n_doublets = params_list
            .get("n_doublets")
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0)
            .map(|n| n as usize);

        let allow_self_pairs = params_list
            .get("allow_self_pairs")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.simulation.allow_self_pairs);

        let no_pcs = params_list
            .get("no_pcs")
            .and_then(|v| v.as_integer())
            .map(|x| x as usize)
            .unwrap_or(defaults.pca.no_pcs);

        let log_transform = params_list
            .get("log_transform")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.pca.log_transform);

        let scale = params_list
            .get("scale")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.pca.scale);

        let target_size = params_list.get("target_size").and_then(|v| v.as_real());

        let random_svd = params_list
            .get("random_svd")
            .and_then(|v| v.as_bool())
            .unwrap_or(defaults.pca.random_svd);

        let n_neighbours = params_list
            .get("n_neighbours")
            .and_then(|v| v.as_integer())
            .map(|x| x as usize)
            .unwrap_or(defaults.n_neighbours);

        let density_method = match params_list.get("density_method").and_then(|v| v.as_str()) {
            Some(s) => parse_density_method(s)
                .ok_or_else(|| DoubletError::invalid(format!("Invalid density method: {}", s)))?,
            None => defaults.density_method,
        };

        let n_mads = params_list
            .get("n_mads")
            .and_then(|v| v.as_real())
            .unwrap_or(defaults.threshold.n_mads);

        let min_cells = params_list
            .get("min_cells")
            .and_then(|v| v.as_integer())
            .map(|x| x as usize)
            .unwrap_or(defaults.threshold.min_cells);

        Ok(Self {
            features,
            simulation: SimulationParams {
                n_doublets,
                allow_self_pairs,
            },
            pca: PcaParams {
                no_pcs,
                log_transform,
                scale,
                target_size,
                random_svd,
            },
            n_neighbours,
            density_method,
            threshold: ThresholdParams {
                n_mads,
                min_cells,
                log_floor: defaults.threshold.log_floor,
            },
        })
    }
}

/// Doublet scores of the real cells
///
/// ### Fields
///
/// * `scores` - One score per cell, in the column order of the counts.
/// * `n_simulated` - Number of simulated doublets.
/// * `n_features` - Size of the feature subset.
/// * `n_dims` - Number of embedding dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoubletScores {
    pub scores: Vec<f64>,
    pub n_simulated: usize,
    pub n_features: usize,
    pub n_dims: usize,
}

/// Result structure of the full doublet density workflow
///
/// ### Fields
///
/// * `scores` - One score per cell, in the column order of the counts.
/// * `calls` - Per-sample doublet calls.
/// * `n_simulated` - Number of simulated doublets.
/// * `n_features` - Size of the feature subset.
/// * `n_dims` - Number of embedding dimensions.
#[derive(Clone, Debug)]
pub struct DoubletDensityResult {
    pub scores: Vec<f64>,
    pub calls: DoubletCalls,
    pub n_simulated: usize,
    pub n_features: usize,
    pub n_dims: usize,
}

/////////////
// Helpers //
/////////////

/// A precomputed embedding is only comparable to the simulated doublets if
/// both went through the same projection
fn check_embedding_source(
    embedding: Option<MatRef<f64>>,
    projector: Option<&dyn EmbeddingProjector>,
) -> Result<()> {
    ensure_input!(
        embedding.is_none() || projector.is_some(),
        "A precomputed embedding needs the projector that produced it"
    );
    Ok(())
}

//////////
// Main //
//////////

/// Doublet detection via the density of simulated doublets
///
/// Runs simulation, projection, density scoring and (optionally) per-sample
/// thresholding once per dataset. All inputs are passed explicitly; nothing
/// is cached between runs.
#[derive(Clone, Debug)]
pub struct DoubletDensity {
    params: DoubletDensityParams,
}

impl DoubletDensity {
    /// Generate a new instance
    pub fn new(params: DoubletDensityParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DoubletDensityParams {
        &self.params
    }

    /// Calculate the doublet scores without calling doublets
    ///
    /// ### Params
    ///
    /// * `counts` - The genes x cells count matrix.
    /// * `embedding` - Optional precomputed embedding of the real cells. Needs
    ///   the `projector` that produced it, so the simulated doublets land in
    ///   the same coordinates.
    /// * `projector` - Optional projection. If `None`, a PCA is fitted on the
    ///   real cells (only allowed without `embedding`).
    /// * `seed` - Seed for the doublet simulation (and randomised SVD).
    ///
    /// ### Returns
    ///
    /// The `DoubletScores`.
    pub fn score_only(
        &self,
        counts: &CountMatrix,
        embedding: Option<MatRef<f64>>,
        projector: Option<&dyn EmbeddingProjector>,
        seed: u64,
    ) -> Result<DoubletScores> {
        let start = Instant::now();

        ensure_input!(
            counts.n_cells() >= 2,
            "Need at least 2 cells, got {}",
            counts.n_cells()
        );

        check_embedding_source(embedding, projector)?;

        let features = counts.resolve_features(&self.params.features)?;

        let simulated = DoubletSimulator::new(self.params.simulation.clone()).simulate(
            counts,
            &features,
            seed,
        )?;

        let res = self.score_with_doublets(counts, &features, &simulated, embedding, projector, seed)?;

        info!("Doublet density scoring done in {:.2?}", start.elapsed());

        Ok(res)
    }

    /// Calculate the doublet scores for a given set of simulated doublets
    ///
    /// Useful when the pairs are chosen by the caller, e.g. with
    /// `combine_pairs()`.
    ///
    /// ### Params
    ///
    /// * `counts` - The genes x cells count matrix.
    /// * `features` - Row indices of the feature subset the doublets were
    ///   built on.
    /// * `simulated` - The simulated doublets.
    /// * `embedding` - Optional precomputed embedding of the real cells;
    ///   requires `projector`.
    /// * `projector` - Optional projection; a PCA is fitted if `None`.
    /// * `seed` - Seed for the randomised SVD.
    ///
    /// ### Returns
    ///
    /// The `DoubletScores`.
    pub fn score_with_doublets(
        &self,
        counts: &CountMatrix,
        features: &[usize],
        simulated: &SimulatedDoublets,
        embedding: Option<MatRef<f64>>,
        projector: Option<&dyn EmbeddingProjector>,
        seed: u64,
    ) -> Result<DoubletScores> {
        ensure_input!(
            simulated.profiles.ncols() == features.len(),
            "Simulated doublets have {} features, expected {}",
            simulated.profiles.ncols(),
            features.len()
        );

        check_embedding_source(embedding, projector)?;

        let real_profiles = counts.feature_profiles(features);

        let fitted: PcaProjector;
        let projector: &dyn EmbeddingProjector = match projector {
            Some(p) => p,
            None => {
                fitted = PcaProjector::fit(real_profiles.as_ref(), &self.params.pca, seed)?;
                &fitted
            }
        };

        let real_embd: Mat<f64> = match embedding {
            Some(embd) => {
                ensure_input!(
                    embd.nrows() == counts.n_cells(),
                    "Embedding has {} rows for {} cells",
                    embd.nrows(),
                    counts.n_cells()
                );
                ensure_input!(
                    embd.ncols() == projector.n_dims(),
                    "Embedding has {} dimensions, the projection produces {}",
                    embd.ncols(),
                    projector.n_dims()
                );
                ensure_input!(
                    embd.col_iter().all(|col| col.iter().all(|v| v.is_finite())),
                    "The embedding contains non-finite values"
                );
                embd.to_owned()
            }
            None => projector.project(real_profiles.as_ref())?,
        };

        let sim_embd = projector.project(simulated.profiles.as_ref())?;

        let scores = DensityScorer::new(self.params.n_neighbours, self.params.density_method)
            .score(real_embd.as_ref(), sim_embd.as_ref())?;

        Ok(DoubletScores {
            scores,
            n_simulated: simulated.len(),
            n_features: features.len(),
            n_dims: real_embd.ncols(),
        })
    }

    /// Run the full workflow: scores and per-sample doublet calls
    ///
    /// ### Params
    ///
    /// * `counts` - The genes x cells count matrix.
    /// * `sample_ids` - Sample identifier per cell.
    /// * `embedding` - Optional precomputed embedding of the real cells;
    ///   requires `projector`.
    /// * `projector` - Optional projection; a PCA is fitted if `None`.
    /// * `seed` - Seed for reproducibility.
    ///
    /// ### Returns
    ///
    /// The `DoubletDensityResult`.
    pub fn run<S: AsRef<str>>(
        &self,
        counts: &CountMatrix,
        sample_ids: &[S],
        embedding: Option<MatRef<f64>>,
        projector: Option<&dyn EmbeddingProjector>,
        seed: u64,
    ) -> Result<DoubletDensityResult> {
        ensure_input!(
            sample_ids.len() == counts.n_cells(),
            "Got {} sample identifiers for {} cells",
            sample_ids.len(),
            counts.n_cells()
        );
        let caller = ThresholdCaller::new(self.params.threshold.clone())?;

        let scores = self.score_only(counts, embedding, projector, seed)?;
        let calls = caller.call(&scores.scores, sample_ids)?;

        Ok(DoubletDensityResult {
            scores: scores.scores,
            calls,
            n_simulated: scores.n_simulated,
            n_features: scores.n_features,
            n_dims: scores.n_dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single_cell::embedding::LinearProjector;
    use crate::single_cell::methods::doublet_simulation::combine_pairs;
    use crate::utils::errors::DoubletError;
    use faer::mat;
    use rand::prelude::*;
    use rand_distr::Gamma;

    /// 250 cells of type A (gene 0 high, gene 1 low), 250 of type B (reversed)
    /// and 50 doublets appended at the end, each the sum of one A and one B
    /// cell.
    fn singlets_with_doublets(seed: u64) -> CountMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let high = Gamma::new(10.0, 1.0).unwrap();
        let low = Gamma::new(4.0, 0.25).unwrap();

        let mut cells: Vec<[f64; 2]> = Vec::with_capacity(550);
        for _ in 0..250 {
            cells.push([high.sample(&mut rng), low.sample(&mut rng)]);
        }
        for _ in 0..250 {
            cells.push([low.sample(&mut rng), high.sample(&mut rng)]);
        }
        for i in 0..50 {
            let a = cells[i];
            let b = cells[250 + i];
            cells.push([a[0] + b[0], a[1] + b[1]]);
        }

        let counts = Mat::from_fn(2, cells.len(), |g, c| cells[c][g]);
        CountMatrix::from_ref(counts.as_ref()).unwrap()
    }

    fn test_params() -> DoubletDensityParams {
        DoubletDensityParams {
            simulation: SimulationParams {
                n_doublets: Some(2000),
                allow_self_pairs: false,
            },
            pca: PcaParams {
                no_pcs: 2,
                ..Default::default()
            },
            n_neighbours: 20,
            ..Default::default()
        }
    }

    fn quantile(x: &[f64], q: f64) -> f64 {
        let mut sorted = x.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[((sorted.len() - 1) as f64 * q).floor() as usize]
    }

    #[test]
    fn test_synthetic_doublets_score_high() {
        let counts = singlets_with_doublets(42);
        let res = DoubletDensity::new(test_params())
            .score_only(&counts, None, None, 123)
            .unwrap();

        assert_eq!(res.scores.len(), 550);
        assert_eq!(res.n_simulated, 2000);
        assert_eq!(res.n_features, 2);
        assert_eq!(res.n_dims, 2);
        assert!(res.scores.iter().all(|s| s.is_finite() && *s >= 0.0));

        let q75 = quantile(&res.scores, 0.75);
        let doublet_median = quantile(&res.scores[500..], 0.5);
        let singlet_median = quantile(&res.scores[..500], 0.5);
        assert!(doublet_median >= q75);
        assert!(doublet_median > singlet_median);

        // on average the appended doublets rank above the singlets
        let mut order: Vec<usize> = (0..550).collect();
        order.sort_by(|&a, &b| res.scores[a].total_cmp(&res.scores[b]));
        let mut ranks = vec![0usize; 550];
        for (rank, &cell) in order.iter().enumerate() {
            ranks[cell] = rank;
        }
        let mean_rank = |r: &[usize]| r.iter().sum::<usize>() as f64 / r.len() as f64;
        assert!(mean_rank(&ranks[500..]) > mean_rank(&ranks[..500]));
    }

    #[test]
    fn test_determinism() {
        let counts = singlets_with_doublets(7);
        let dd = DoubletDensity::new(test_params());

        let a = dd.score_only(&counts, None, None, 99).unwrap();
        let b = dd.score_only(&counts, None, None, 99).unwrap();
        let c = dd.score_only(&counts, None, None, 100).unwrap();

        assert_eq!(a.scores, b.scores);
        assert_ne!(a.scores, c.scores);
    }

    #[test]
    fn test_toy_cross_pairs() {
        // A = (10, 0) x3, B = (0, 10) x3, and a real doublet at (10, 10)
        let counts = mat![
            [10.0, 10.0, 10.0, 0.0, 0.0, 0.0, 10.0],
            [0.0, 0.0, 0.0, 10.0, 10.0, 10.0, 10.0],
        ];
        let counts = CountMatrix::from_ref(counts.as_ref()).unwrap();
        let features = vec![0, 1];

        let pairs: Vec<(usize, usize)> = (0..20).map(|i| (i % 3, 3 + (i / 3) % 3)).collect();
        let simulated = combine_pairs(&counts, &features, &pairs).unwrap();

        let params = DoubletDensityParams {
            pca: PcaParams {
                no_pcs: 2,
                ..Default::default()
            },
            n_neighbours: 3,
            ..Default::default()
        };
        let dd = DoubletDensity::new(params);

        let pca_scores = dd
            .score_with_doublets(&counts, &features, &simulated, None, None, 1)
            .unwrap();
        let raw_scores = dd
            .score_with_doublets(
                &counts,
                &features,
                &simulated,
                None,
                Some(&LinearProjector::identity(2)),
                1,
            )
            .unwrap();

        for scores in [&pca_scores.scores, &raw_scores.scores] {
            assert_eq!(scores.len(), 7);
            for &s in &scores[..6] {
                assert!(s <= 1.0);
                assert!((s - 6.0 / 20.0).abs() < 1e-6);
            }
            assert!(scores[6] > 1e3);
        }
    }

    #[test]
    fn test_precomputed_embedding_is_used() {
        let counts = singlets_with_doublets(3);
        let dd = DoubletDensity::new(test_params());

        let features = counts.resolve_features(&FeatureSelection::All).unwrap();
        let profiles = counts.feature_profiles(&features);
        let projector = PcaProjector::fit(profiles.as_ref(), &dd.params().pca, 5).unwrap();
        let embd = projector.project(profiles.as_ref()).unwrap();

        let with_embd = dd
            .score_only(&counts, Some(embd.as_ref()), Some(&projector), 11)
            .unwrap();
        let without = dd.score_only(&counts, None, Some(&projector), 11).unwrap();
        assert_eq!(with_embd.scores, without.scores);

        let too_short = embd.as_ref().submatrix(0, 0, 10, 2);
        assert!(matches!(
            dd.score_only(&counts, Some(too_short), Some(&projector), 11),
            Err(DoubletError::InvalidInput(_))
        ));
        let too_narrow = embd.as_ref().submatrix(0, 0, 550, 1);
        assert!(dd
            .score_only(&counts, Some(too_narrow), Some(&projector), 11)
            .is_err());
    }

    #[test]
    fn test_embedding_needs_its_projector() {
        let counts = singlets_with_doublets(3);
        let dd = DoubletDensity::new(test_params());

        let features = counts.resolve_features(&FeatureSelection::All).unwrap();
        let profiles = counts.feature_profiles(&features);
        let projector = PcaProjector::fit(profiles.as_ref(), &dd.params().pca, 5).unwrap();
        let embd = projector.project(profiles.as_ref()).unwrap();

        // a rescaled PCA has the right shape but lives in other coordinates
        // than a freshly fitted projection of the doublets
        let rescaled = Mat::from_fn(embd.nrows(), embd.ncols(), |i, j| embd[(i, j)] * 100.0);
        assert!(matches!(
            dd.score_only(&counts, Some(rescaled.as_ref()), None, 11),
            Err(DoubletError::InvalidInput(_))
        ));

        let samples = vec!["s1"; counts.n_cells()];
        assert!(matches!(
            dd.run(&counts, &samples, Some(embd.as_ref()), None, 11),
            Err(DoubletError::InvalidInput(_))
        ));

        let simulated = combine_pairs(&counts, &features, &[(0, 300), (1, 301)]).unwrap();
        assert!(dd
            .score_with_doublets(&counts, &features, &simulated, Some(embd.as_ref()), None, 11)
            .is_err());
    }

    #[test]
    fn test_non_finite_embedding_is_rejected() {
        let counts = singlets_with_doublets(4);
        let dd = DoubletDensity::new(test_params());

        let features = counts.resolve_features(&FeatureSelection::All).unwrap();
        let profiles = counts.feature_profiles(&features);
        let projector = PcaProjector::fit(profiles.as_ref(), &dd.params().pca, 5).unwrap();
        let mut embd = projector.project(profiles.as_ref()).unwrap();
        embd[(2, 0)] = f64::NAN;

        assert!(matches!(
            dd.score_only(&counts, Some(embd.as_ref()), Some(&projector), 11),
            Err(DoubletError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sparse_and_dense_input_agree() {
        let dense = mat![
            [10.0, 0.0, 9.0, 0.0, 1.0, 0.0, 10.0, 8.0],
            [0.0, 10.0, 1.0, 9.0, 0.0, 11.0, 10.0, 0.0],
            [0.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0, 1.0],
        ];
        let from_dense = CountMatrix::from_ref(dense.as_ref()).unwrap();

        let mut data = Vec::new();
        let mut rows = Vec::new();
        let mut ptrs = vec![0];
        for c in 0..dense.ncols() {
            for g in 0..dense.nrows() {
                if dense[(g, c)] != 0.0 {
                    data.push(dense[(g, c)]);
                    rows.push(g);
                }
            }
            ptrs.push(data.len());
        }
        let from_csc = CountMatrix::from_csc(
            data,
            rows,
            ptrs,
            from_dense.gene_ids().to_vec(),
            from_dense.cell_ids().to_vec(),
        )
        .unwrap();

        let dd = DoubletDensity::new(DoubletDensityParams {
            simulation: SimulationParams {
                n_doublets: Some(30),
                allow_self_pairs: false,
            },
            pca: PcaParams {
                no_pcs: 2,
                ..Default::default()
            },
            n_neighbours: 3,
            ..Default::default()
        });

        let a = dd.score_only(&from_dense, None, None, 8).unwrap();
        let b = dd.score_only(&from_csc, None, None, 8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_run_with_samples() {
        let counts = singlets_with_doublets(21);
        let samples: Vec<&str> = (0..550)
            .map(|i| if i % 2 == 0 { "s1" } else { "s2" })
            .collect();

        let res = DoubletDensity::new(test_params())
            .run(&counts, &samples, None, None, 5)
            .unwrap();

        assert_eq!(res.scores.len(), 550);
        assert_eq!(res.calls.calls.len(), 550);
        assert!(res.calls.failures.is_empty());
        assert_eq!(res.calls.samples.len(), 2);

        let called_doublets = res.calls.calls[500..]
            .iter()
            .filter(|c| **c == Some(true))
            .count();
        let called_singlets = res.calls.calls[..500]
            .iter()
            .filter(|c| **c == Some(true))
            .count();
        assert!(called_doublets >= 25);
        assert!(called_singlets < called_doublets);
    }

    #[test]
    fn test_invalid_inputs() {
        let counts = singlets_with_doublets(1);

        let too_many_neighbours = DoubletDensity::new(DoubletDensityParams {
            n_neighbours: 550,
            ..test_params()
        });
        assert!(matches!(
            too_many_neighbours.score_only(&counts, None, None, 1),
            Err(DoubletError::InvalidInput(_))
        ));

        let few_sims = DoubletDensity::new(DoubletDensityParams {
            simulation: SimulationParams {
                n_doublets: Some(10),
                allow_self_pairs: false,
            },
            ..test_params()
        });
        assert!(few_sims.score_only(&counts, None, None, 1).is_err());

        let dd = DoubletDensity::new(test_params());
        assert!(dd.run(&counts, &["a"; 3], None, None, 1).is_err());

        let single_cell = CountMatrix::from_ref(mat![[1.0], [2.0]].as_ref()).unwrap();
        assert!(dd.score_only(&single_cell, None, None, 1).is_err());

        let empty_features = DoubletDensity::new(DoubletDensityParams {
            features: FeatureSelection::Names(vec![]),
            ..test_params()
        });
        assert!(empty_features.score_only(&counts, None, None, 1).is_err());
    }
}
