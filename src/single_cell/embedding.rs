use faer::{Mat, MatRef};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::pca_svd::top_loadings;
use crate::ensure_input;
use crate::utils::errors::Result;

///////////
// Trait //
///////////

/// Projection of expression profiles into a shared low-dimensional space
///
/// Real cells and simulated doublets have to go through the *same* projection
/// so their neighbourhoods are comparable.
pub trait EmbeddingProjector: Sync {
    /// Number of embedding dimensions produced by `project`.
    fn n_dims(&self) -> usize;

    /// Project profiles into the embedding
    ///
    /// ### Params
    ///
    /// * `profiles` - Raw counts, rows = cells (real or simulated), columns =
    ///   the feature subset.
    ///
    /// ### Returns
    ///
    /// `nrow x n_dims` embedding with rows in input order.
    fn project(&self, profiles: MatRef<f64>) -> Result<Mat<f64>>;
}

////////////
// Params //
////////////

/// Parameters for the PCA based projection
///
/// ### Fields
///
/// * `no_pcs` - Number of principal components.
/// * `log_transform` - Apply `ln(1 + x)` after library size normalisation.
/// * `scale` - Scale each feature to unit variance (with the statistics of
///   the fitted cells).
/// * `target_size` - Library size the profiles are scaled to. Defaults to the
///   mean library size of the fitted cells.
/// * `random_svd` - Use randomised SVD instead of the exact thin SVD.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaParams {
    pub no_pcs: usize,
    pub log_transform: bool,
    pub scale: bool,
    pub target_size: Option<f64>,
    pub random_svd: bool,
}

impl Default for PcaParams {
    fn default() -> Self {
        Self {
            no_pcs: 10,
            log_transform: true,
            scale: false,
            target_size: None,
            random_svd: false,
        }
    }
}

/////////////
// Helpers //
/////////////

/// Library size normalisation (and optional log transform) of row profiles
///
/// Rows with a library size of zero stay zero.
fn normalise_rows(profiles: MatRef<f64>, target_size: f64, log_transform: bool) -> Mat<f64> {
    let n_features = profiles.ncols();

    let rows: Vec<Vec<f64>> = (0..profiles.nrows())
        .into_par_iter()
        .map(|i| {
            let lib_size: f64 = (0..n_features).map(|j| profiles[(i, j)]).sum();
            (0..n_features)
                .map(|j| {
                    if lib_size <= 0.0 {
                        return 0.0;
                    }
                    let val = profiles[(i, j)] / lib_size * target_size;
                    if log_transform {
                        val.ln_1p()
                    } else {
                        val
                    }
                })
                .collect()
        })
        .collect();

    Mat::from_fn(profiles.nrows(), n_features, |i, j| rows[i][j])
}

////////////////////
// PCA projection //
////////////////////

/// PCA projection fitted on the real cells
///
/// Stores the normalisation target, the per-feature statistics and the
/// loadings so that later calls to `project` (e.g. for simulated doublets)
/// reuse the identical transformation.
///
/// ### Fields
///
/// * `target_size` - Library size used for normalisation.
/// * `log_transform` - Whether `ln(1 + x)` is applied.
/// * `means` - Per-feature means of the fitted cells.
/// * `stds` - Per-feature scaling factors (all 1 if scaling is off).
/// * `loadings` - Features x PCs rotation.
#[derive(Clone, Debug)]
pub struct PcaProjector {
    target_size: f64,
    log_transform: bool,
    means: Vec<f64>,
    stds: Vec<f64>,
    loadings: Mat<f64>,
}

impl PcaProjector {
    /// Fit the projection
    ///
    /// ### Params
    ///
    /// * `real_profiles` - Raw counts of the real cells, rows = cells, columns
    ///   = features.
    /// * `params` - The PCA parameters.
    /// * `seed` - Seed for the randomised SVD.
    ///
    /// ### Returns
    ///
    /// The fitted `PcaProjector`.
    pub fn fit(real_profiles: MatRef<f64>, params: &PcaParams, seed: u64) -> Result<Self> {
        let start = Instant::now();
        let n_cells = real_profiles.nrows();
        let n_features = real_profiles.ncols();

        ensure_input!(n_cells >= 2, "PCA needs at least 2 cells, got {}", n_cells);
        ensure_input!(n_features >= 1, "PCA needs at least one feature");
        ensure_input!(params.no_pcs >= 1, "no_pcs needs to be at least 1");

        let target_size = match params.target_size {
            Some(t) => {
                ensure_input!(t > 0.0 && t.is_finite(), "target_size must be positive, got {}", t);
                t
            }
            None => {
                let total: f64 = (0..n_cells)
                    .map(|i| (0..n_features).map(|j| real_profiles[(i, j)]).sum::<f64>())
                    .sum();
                let mean_lib = total / n_cells as f64;
                if mean_lib > 0.0 {
                    mean_lib
                } else {
                    1.0
                }
            }
        };

        let normalised = normalise_rows(real_profiles, target_size, params.log_transform);

        let means: Vec<f64> = (0..n_features)
            .map(|j| normalised.col(j).iter().sum::<f64>() / n_cells as f64)
            .collect();

        let stds: Vec<f64> = if params.scale {
            (0..n_features)
                .map(|j| {
                    let var = normalised
                        .col(j)
                        .iter()
                        .map(|&x| (x - means[j]).powi(2))
                        .sum::<f64>()
                        / (n_cells - 1) as f64;
                    let sd = var.sqrt();
                    if sd > 0.0 {
                        sd
                    } else {
                        1.0
                    }
                })
                .collect()
        } else {
            vec![1.0; n_features]
        };

        let scaled = Mat::from_fn(n_cells, n_features, |i, j| {
            (normalised[(i, j)] - means[j]) / stds[j]
        });

        let max_pcs = n_cells.min(n_features);
        let no_pcs = if params.no_pcs > max_pcs {
            warn!(
                "Requested {} PCs, but only {} can be computed; using {}.",
                params.no_pcs, max_pcs, max_pcs
            );
            max_pcs
        } else {
            params.no_pcs
        };

        let loadings = top_loadings(scaled.as_ref(), no_pcs, params.random_svd, seed)?;

        info!(
            "Fitted PCA projection with {} PCs on {} cells x {} features in {:.2?}",
            no_pcs,
            n_cells,
            n_features,
            start.elapsed()
        );

        Ok(Self {
            target_size,
            log_transform: params.log_transform,
            means,
            stds,
            loadings,
        })
    }

    pub fn target_size(&self) -> f64 {
        self.target_size
    }

    pub fn loadings(&self) -> MatRef<'_, f64> {
        self.loadings.as_ref()
    }
}

impl EmbeddingProjector for PcaProjector {
    fn n_dims(&self) -> usize {
        self.loadings.ncols()
    }

    fn project(&self, profiles: MatRef<f64>) -> Result<Mat<f64>> {
        ensure_input!(
            profiles.ncols() == self.means.len(),
            "Profiles have {} features, the projection was fitted on {}",
            profiles.ncols(),
            self.means.len()
        );

        let normalised = normalise_rows(profiles, self.target_size, self.log_transform);
        let scaled = Mat::from_fn(profiles.nrows(), profiles.ncols(), |i, j| {
            (normalised[(i, j)] - self.means[j]) / self.stds[j]
        });

        Ok(&scaled * &self.loadings)
    }
}

///////////////////////
// Linear projection //
///////////////////////

/// Caller supplied linear projection `(x - center) * rotation`
///
/// Intended for externally computed rotations (for example the rotation of
/// a PCA that was run elsewhere). By default no normalisation is applied, so
/// the profiles need to be on the scale the rotation expects. With
/// `with_normalisation()` the raw counts are library size normalised (and
/// optionally log transformed) first, like `PcaProjector` does.
///
/// ### Fields
///
/// * `center` - Per-feature values subtracted before the rotation.
/// * `rotation` - Features x dims rotation matrix.
/// * `normalisation` - Optional `(target_size, log_transform)`.
#[derive(Clone, Debug)]
pub struct LinearProjector {
    center: Vec<f64>,
    rotation: Mat<f64>,
    normalisation: Option<(f64, bool)>,
}

impl LinearProjector {
    /// Generate a new instance
    ///
    /// ### Params
    ///
    /// * `center` - Per-feature values subtracted before the rotation.
    /// * `rotation` - Features x dims rotation matrix.
    pub fn new(center: Vec<f64>, rotation: Mat<f64>) -> Result<Self> {
        ensure_input!(
            center.len() == rotation.nrows(),
            "Center has {} entries, the rotation {} rows",
            center.len(),
            rotation.nrows()
        );
        ensure_input!(rotation.ncols() >= 1, "The rotation needs at least one column");
        ensure_input!(
            center.iter().all(|v| v.is_finite()),
            "The center contains non-finite values"
        );
        ensure_input!(
            rotation
                .col_iter()
                .all(|col| col.iter().all(|v| v.is_finite())),
            "The rotation contains non-finite values"
        );
        Ok(Self {
            center,
            rotation,
            normalisation: None,
        })
    }

    /// Normalise the raw profiles before centring and rotating
    ///
    /// ### Params
    ///
    /// * `target_size` - Library size the profiles are scaled to.
    /// * `log_transform` - Apply `ln(1 + x)` after the scaling.
    pub fn with_normalisation(mut self, target_size: f64, log_transform: bool) -> Result<Self> {
        ensure_input!(
            target_size > 0.0 && target_size.is_finite(),
            "target_size must be positive, got {}",
            target_size
        );
        self.normalisation = Some((target_size, log_transform));
        Ok(self)
    }

    /// Identity projection on `n` features
    pub fn identity(n: usize) -> Self {
        Self {
            center: vec![0.0; n],
            rotation: Mat::identity(n, n),
            normalisation: None,
        }
    }
}

impl EmbeddingProjector for LinearProjector {
    fn n_dims(&self) -> usize {
        self.rotation.ncols()
    }

    fn project(&self, profiles: MatRef<f64>) -> Result<Mat<f64>> {
        ensure_input!(
            profiles.ncols() == self.center.len(),
            "Profiles have {} features, the rotation expects {}",
            profiles.ncols(),
            self.center.len()
        );
        let normalised = self
            .normalisation
            .map(|(target_size, log_transform)| normalise_rows(profiles, target_size, log_transform));
        let input = normalised.as_ref().map(|m| m.as_ref()).unwrap_or(profiles);

        let centred = Mat::from_fn(input.nrows(), input.ncols(), |i, j| {
            input[(i, j)] - self.center[j]
        });
        Ok(&centred * &self.rotation)
    }
}
