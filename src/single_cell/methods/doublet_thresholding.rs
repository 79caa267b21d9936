use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::base::stats::{calc_fdr, mad_outlier, upper_tail_pvals, OutlierDirection};
use crate::utils::errors::{DoubletError, Result};
use crate::{check_same_len, ensure_input};

////////////
// Params //
////////////

/// Parameters for the per-sample doublet calling
///
/// ### Fields
///
/// * `n_mads` - Number of MADs above the median log-score beyond which a cell
///   is called a doublet.
/// * `min_cells` - Minimum number of cells a sample needs for a robust MAD.
/// * `log_floor` - Scores are floored at this value before taking the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub n_mads: f64,
    pub min_cells: usize,
    pub log_floor: f64,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            n_mads: 3.0,
            min_cells: 10,
            log_floor: 1e-8,
        }
    }
}

/////////////
// Results //
/////////////

/// Threshold summary of one sample
///
/// ### Fields
///
/// * `sample` - The sample identifier.
/// * `n_cells` - Number of cells in the sample.
/// * `median` - Median of the log-scores.
/// * `mad` - Scaled MAD of the log-scores.
/// * `threshold` - Score (not log-score) above which cells are doublets.
/// * `n_doublets` - Number of cells called as doublets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleThreshold {
    pub sample: String,
    pub n_cells: usize,
    pub median: f64,
    pub mad: f64,
    pub threshold: f64,
    pub n_doublets: usize,
}

/// Binary doublet calls for a set of cells
///
/// All vectors follow the input cell order. Cells of samples that could not
/// be thresholded carry `None`.
///
/// ### Fields
///
/// * `calls` - `Some(true)` for doublets, `Some(false)` for singlets.
/// * `p_values` - Upper tail p-values of the log-scores within the sample.
/// * `fdr` - Benjamini-Hochberg adjusted p-values within the sample.
/// * `samples` - Per-sample thresholds (successful samples only).
/// * `failures` - Per-sample `InsufficientData` notices.
#[derive(Clone, Debug, PartialEq)]
pub struct DoubletCalls {
    pub calls: Vec<Option<bool>>,
    pub p_values: Vec<Option<f64>>,
    pub fdr: Vec<Option<f64>>,
    pub samples: Vec<SampleThreshold>,
    pub failures: Vec<DoubletError>,
}

impl DoubletCalls {
    /// Number of cells called as doublets
    pub fn n_doublets(&self) -> usize {
        self.calls.iter().filter(|c| **c == Some(true)).count()
    }

    /// Fraction of doublets among the cells that received a call
    pub fn doublet_rate(&self) -> Option<f64> {
        let n_called = self.calls.iter().filter(|c| c.is_some()).count();
        if n_called == 0 {
            None
        } else {
            Some(self.n_doublets() as f64 / n_called as f64)
        }
    }
}

////////////////////
// Main structure //
////////////////////

/// Per-sample outlier calling on log-transformed doublet scores
///
/// Within each sample the log-scores are summarised by their median and MAD;
/// cells above `median + n_mads * MAD` are doublets. Thresholds never mix
/// across samples.
#[derive(Clone, Debug)]
pub struct ThresholdCaller {
    params: ThresholdParams,
}

impl ThresholdCaller {
    /// Generate a new instance
    pub fn new(params: ThresholdParams) -> Result<Self> {
        ensure_input!(
            params.n_mads > 0.0 && params.n_mads.is_finite(),
            "n_mads needs to be positive, got {}",
            params.n_mads
        );
        ensure_input!(params.min_cells >= 1, "min_cells needs to be at least 1");
        ensure_input!(
            params.log_floor > 0.0 && params.log_floor.is_finite(),
            "log_floor needs to be positive, got {}",
            params.log_floor
        );
        Ok(Self { params })
    }

    /// Call doublets
    ///
    /// ### Params
    ///
    /// * `scores` - Doublet scores, one per cell.
    /// * `sample_ids` - Sample identifier per cell.
    ///
    /// ### Returns
    ///
    /// The `DoubletCalls`. Samples with too few cells are reported in
    /// `failures`; only malformed inputs produce an `Err`.
    pub fn call<S: AsRef<str>>(&self, scores: &[f64], sample_ids: &[S]) -> Result<DoubletCalls> {
        check_same_len!(scores, sample_ids);

        let n_cells = scores.len();
        let mut res = DoubletCalls {
            calls: vec![None; n_cells],
            p_values: vec![None; n_cells],
            fdr: vec![None; n_cells],
            samples: Vec::new(),
            failures: Vec::new(),
        };

        let mut groups: IndexMap<&str, Vec<usize>> = IndexMap::new();
        for (cell, sample) in sample_ids.iter().enumerate() {
            groups.entry(sample.as_ref()).or_default().push(cell);
        }

        for (sample, cells) in groups {
            if cells.len() < self.params.min_cells {
                warn!(
                    "Sample '{}' has only {} cells (< {}); no doublet calls for it.",
                    sample,
                    cells.len(),
                    self.params.min_cells
                );
                res.failures.push(DoubletError::InsufficientData {
                    sample: sample.to_string(),
                    n_cells: cells.len(),
                    min_cells: self.params.min_cells,
                });
                continue;
            }

            let log_scores: Vec<f64> = cells
                .iter()
                .map(|&c| scores[c].max(self.params.log_floor).ln())
                .collect();

            // non-empty by the min_cells check
            let Some(outliers) = mad_outlier(&log_scores, self.params.n_mads, OutlierDirection::Above)
            else {
                continue;
            };

            let p_values = upper_tail_pvals(&log_scores, outliers.median, outliers.mad);
            let fdr = calc_fdr(&p_values);

            for (pos, &cell) in cells.iter().enumerate() {
                res.calls[cell] = Some(outliers.outliers[pos]);
                res.p_values[cell] = Some(p_values[pos]);
                res.fdr[cell] = Some(fdr[pos]);
            }

            let n_doublets = outliers.outliers.iter().filter(|&&o| o).count();
            if outliers.mad == 0.0 {
                warn!(
                    "Sample '{}' has a MAD of zero; every cell above the median is called.",
                    sample
                );
            }

            res.samples.push(SampleThreshold {
                sample: sample.to_string(),
                n_cells: cells.len(),
                median: outliers.median,
                mad: outliers.mad,
                threshold: outliers.upper.exp(),
                n_doublets,
            });
        }

        info!(
            "Called {} doublets across {} samples ({} samples skipped)",
            res.n_doublets(),
            res.samples.len(),
            res.failures.len()
        );

        Ok(res)
    }
}
