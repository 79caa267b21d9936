use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Consistency constant that turns a raw MAD into an estimate of the standard
/// deviation under normality.
pub const MAD_NORMAL_SCALE: f64 = 1.4826;

///////////
// Enums //
///////////

/// Direction of a MAD outlier test
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum OutlierDirection {
    /// Check if outlier is below the threshold
    Below,
    /// Check if outlier is above the threshold
    Above,
    /// Check if outlier is below OR above the thresholds
    Both,
}

///////////////
// Functions //
///////////////

/// Get the median
///
/// NaNs are ordered after all other values via `total_cmp`.
///
/// ### Params
///
/// * `x` - The slice for which to calculate the median for.
///
/// ### Results
///
/// The median (if the vector is not empty)
pub fn median(x: &[f64]) -> Option<f64> {
    if x.is_empty() {
        return None;
    }

    let mut data = x.to_vec();
    let len = data.len();

    if len % 2 == 0 {
        let (_, median1, right) = data.select_nth_unstable_by(len / 2 - 1, |a, b| a.total_cmp(b));
        let median1 = *median1;
        let median2 = right.iter().copied().fold(f64::INFINITY, f64::min);
        Some((median1 + median2) / 2.0)
    } else {
        let (_, median, _) = data.select_nth_unstable_by(len / 2, |a, b| a.total_cmp(b));
        Some(*median)
    }
}

/// Calculate the (raw) MAD
///
/// ### Params
///
/// * `x` - Slice for which to calculate the MAD for
///
/// ### Results
///
/// The MAD of the slice.
pub fn mad(x: &[f64]) -> Option<f64> {
    let median_val = median(x)?;
    let deviations: Vec<f64> = x.iter().map(|&x| (x - median_val).abs()).collect();

    median(&deviations)
}

/// Summary of a MAD-based outlier call
///
/// ### Fields
///
/// * `outliers` - Per value outlier flags.
/// * `median` - Median of the values.
/// * `mad` - MAD scaled by `MAD_NORMAL_SCALE`.
/// * `lower` - Lower bound of the accepted range.
/// * `upper` - Upper bound of the accepted range.
#[derive(Clone, Debug)]
pub struct MadOutlierRes {
    pub outliers: Vec<bool>,
    pub median: f64,
    pub mad: f64,
    pub lower: f64,
    pub upper: f64,
}

/// MAD outlier detection
///
/// Uses the normal-consistent MAD, i.e. the raw MAD multiplied by 1.4826.
/// Values exactly on a bound are not outliers.
///
/// ### Params
///
/// * `x` - Slice of values to check for outliers.
/// * `n_mads` - Number of MADs to accept as not being an outlier.
/// * `direction` - Direction to check for outliers (below, above, or both).
///
/// ### Returns
///
/// `None` for an empty slice, otherwise the `MadOutlierRes`.
pub fn mad_outlier(x: &[f64], n_mads: f64, direction: OutlierDirection) -> Option<MadOutlierRes> {
    let median_val = median(x)?;
    let mad_val = mad(x)? * MAD_NORMAL_SCALE;

    let margin = n_mads * mad_val;
    let lower = median_val - margin;
    let upper = median_val + margin;

    let outliers = x
        .iter()
        .map(|&v| match direction {
            OutlierDirection::Below => v < lower,
            OutlierDirection::Above => v > upper,
            OutlierDirection::Both => v < lower || v > upper,
        })
        .collect::<Vec<bool>>();

    Some(MadOutlierRes {
        outliers,
        median: median_val,
        mad: mad_val,
        lower,
        upper,
    })
}

/// Upper tail p-values under a normal distribution
///
/// A non-positive (or non-finite) `sd` degenerates to a step function: values
/// above `mean` get 0, everything else 1.
///
/// ### Params
///
/// * `x` - Values to test.
/// * `mean` - Location of the reference distribution.
/// * `sd` - Scale of the reference distribution.
///
/// ### Returns
///
/// The one-sided (greater) p-values.
pub fn upper_tail_pvals(x: &[f64], mean: f64, sd: f64) -> Vec<f64> {
    let normal = if sd.is_finite() && sd > 0.0 {
        Normal::new(mean, sd).ok()
    } else {
        None
    };

    match normal {
        Some(dist) => x.iter().map(|&v| dist.sf(v)).collect(),
        None => x
            .iter()
            .map(|&v| if v > mean { 0.0 } else { 1.0 })
            .collect(),
    }
}

/// Calculate the FDR (Benjamini-Hochberg)
///
/// ### Params
///
/// * `pvals` - P-values for which to calculate the FDR
///
/// ### Returns
///
/// The calculated FDRs
pub fn calc_fdr(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len();
    if n == 0 {
        return Vec::new();
    }
    let n_f64 = n as f64;

    let mut indexed_pval: Vec<(usize, f64)> =
        pvals.par_iter().enumerate().map(|(i, &x)| (i, x)).collect();

    indexed_pval.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let adj_pvals_tmp: Vec<f64> = indexed_pval
        .par_iter()
        .enumerate()
        .map(|(i, (_, p))| (n_f64 / (i + 1) as f64) * p)
        .collect();

    let mut current_min = adj_pvals_tmp[n - 1].min(1.0);
    let mut monotonic_adj = vec![current_min; n];

    for i in (0..n - 1).rev() {
        current_min = current_min.min(adj_pvals_tmp[i]).min(1.0);
        monotonic_adj[i] = current_min;
    }

    let mut adj_pvals = vec![0.0; n];

    for (i, &(original_idx, _)) in indexed_pval.iter().enumerate() {
        adj_pvals[original_idx] = monotonic_adj[i];
    }

    adj_pvals
}
