use extendr_api::prelude::*;
use std::time::Instant;

use crate::single_cell::embedding::{EmbeddingProjector, LinearProjector};
use crate::single_cell::methods::doublet_density::{DoubletDensity, DoubletDensityParams};
use crate::single_cell::methods::doublet_thresholding::{
    DoubletCalls, ThresholdCaller, ThresholdParams,
};
use crate::utils::r_rust_interface::{
    option_bool_to_r, option_f64_to_r, r_csc_to_counts, r_matrix_to_faer,
};

/////////////
// Helpers //
/////////////

/// Transform the doublet calls into an R list
fn calls_to_r_list(calls: &DoubletCalls) -> List {
    let samples: Vec<String> = calls.samples.iter().map(|s| s.sample.clone()).collect();
    let n_cells: Vec<i32> = calls.samples.iter().map(|s| s.n_cells as i32).collect();
    let median: Vec<f64> = calls.samples.iter().map(|s| s.median).collect();
    let mad: Vec<f64> = calls.samples.iter().map(|s| s.mad).collect();
    let threshold: Vec<f64> = calls.samples.iter().map(|s| s.threshold).collect();
    let n_doublets: Vec<i32> = calls.samples.iter().map(|s| s.n_doublets as i32).collect();
    let failures: Vec<String> = calls.failures.iter().map(|e| e.to_string()).collect();

    list!(
        is_doublet = option_bool_to_r(&calls.calls),
        p_val = option_f64_to_r(&calls.p_values),
        fdr = option_f64_to_r(&calls.fdr),
        sample_summary = list!(
            sample = samples,
            n_cells = n_cells,
            median = median,
            mad = mad,
            threshold = threshold,
            n_doublets = n_doublets
        ),
        failures = failures
    )
}

/////////////////////
// Doublet density //
/////////////////////

/// Doublet detection via the density of simulated doublets
///
/// @description
/// Simulates doublets by summing the counts of random cell pairs, projects
/// real cells and simulated doublets into the same embedding and scores each
/// real cell by the local density of simulated doublets relative to real
/// cells. Doublets are then called per sample via a MAD-based threshold on
/// the log-scores.
///
/// @param counts_x Numeric. The non-zero counts (`@x` of a dgCMatrix with
/// genes as rows and cells as columns).
/// @param counts_i Integer. The 0-indexed row indices (`@i`).
/// @param counts_p Integer. The column pointers (`@p`).
/// @param n_genes Integer. Number of genes (rows).
/// @param sample_ids String vector. The sample identifier per cell.
/// @param embedding Optional numerical matrix. Precomputed embedding of the
/// cells (cells x dimensions). Needs `rotation`.
/// @param rotation Optional numerical matrix. The features x dimensions
/// rotation that produced `embedding`; used to project the simulated
/// doublets into the same coordinates.
/// @param center Optional numeric. Per-feature centre subtracted before the
/// rotation. Defaults to zeros.
/// @param params List. The parameter list, see `params_doublet_density()`.
/// If `target_size` is set, the rotation is applied to library size
/// normalised (and, per `log_transform`, log transformed) counts.
/// @param seed Integer. Seed for reproducibility.
/// @param verbose Boolean. Controls verbosity of the function.
///
/// @return A list with the following items
/// \itemize{
///   \item scores - The doublet score per cell.
///   \item calls - List with `is_doublet` (`NA` for cells of skipped
///   samples), `p_val`, `fdr`, `sample_summary` and `failures`.
///   \item n_simulated - Number of simulated doublets.
///   \item n_features - Number of features used.
///   \item n_dims - Number of embedding dimensions.
/// }
///
/// @export
#[extendr]
#[allow(clippy::too_many_arguments)]
fn rs_doublet_density(
    counts_x: Vec<f64>,
    counts_i: Vec<i32>,
    counts_p: Vec<i32>,
    n_genes: usize,
    sample_ids: Vec<String>,
    embedding: Nullable<RMatrix<f64>>,
    rotation: Nullable<RMatrix<f64>>,
    center: Nullable<Vec<f64>>,
    params: List,
    seed: usize,
    verbose: bool,
) -> extendr_api::Result<List> {
    let start = Instant::now();

    let params = DoubletDensityParams::from_r_list(params)?;
    let counts = r_csc_to_counts(counts_x, &counts_i, &counts_p, n_genes)?;

    let projector = match &rotation {
        Nullable::NotNull(rot) => {
            let rot = r_matrix_to_faer(rot).to_owned();
            let center = match center {
                Nullable::NotNull(c) => c,
                Nullable::Null => vec![0.0; rot.nrows()],
            };
            let projector = LinearProjector::new(center, rot)?;
            let projector = match params.pca.target_size {
                Some(target_size) => {
                    projector.with_normalisation(target_size, params.pca.log_transform)?
                }
                None => projector,
            };
            Some(projector)
        }
        Nullable::Null => None,
    };

    let embedding = match &embedding {
        Nullable::NotNull(embd) => Some(r_matrix_to_faer(embd)),
        Nullable::Null => None,
    };

    let res = DoubletDensity::new(params).run(
        &counts,
        &sample_ids,
        embedding,
        projector.as_ref().map(|p| p as &dyn EmbeddingProjector),
        seed as u64,
    )?;

    if verbose {
        println!(
            "Found {} doublets among {} cells in {:.2?}",
            res.calls.n_doublets(),
            res.scores.len(),
            start.elapsed()
        );
    }

    Ok(list!(
        scores = res.scores,
        calls = calls_to_r_list(&res.calls),
        n_simulated = res.n_simulated as i32,
        n_features = res.n_features as i32,
        n_dims = res.n_dims as i32
    ))
}

/// Call doublets from precomputed scores
///
/// @description
/// Applies the per-sample MAD threshold on the log-transformed doublet
/// scores. Only high scores are called.
///
/// @param scores Numerical vector. The doublet scores.
/// @param sample_ids String vector. The sample identifier per cell.
/// @param n_mads Numeric. Number of MADs above the median.
/// @param min_cells Integer. Minimum number of cells per sample.
///
/// @return A list with `is_doublet`, `p_val`, `fdr`, `sample_summary` and
/// `failures`.
///
/// @export
#[extendr]
fn rs_doublet_thresholding(
    scores: Vec<f64>,
    sample_ids: Vec<String>,
    n_mads: f64,
    min_cells: usize,
) -> extendr_api::Result<List> {
    let caller = ThresholdCaller::new(ThresholdParams {
        n_mads,
        min_cells,
        ..Default::default()
    })?;

    let calls = caller.call(&scores, &sample_ids)?;

    Ok(calls_to_r_list(&calls))
}

extendr_module! {
    mod r_doublets;
    fn rs_doublet_density;
    fn rs_doublet_thresholding;
}
