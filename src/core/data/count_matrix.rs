use faer::{Mat, MatRef};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::ensure_input;
use crate::utils::errors::{DoubletError, Result};

///////////
// Enums //
///////////

/// Which genes enter the doublet simulation and the embedding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum FeatureSelection {
    /// Use every gene
    #[default]
    All,
    /// Row indices (0-indexed) into the count matrix
    Indices(Vec<usize>),
    /// Gene identifiers
    Names(Vec<String>),
    /// The `n` genes with the highest variance of the log-normalised counts
    TopVariable(usize),
}

/////////////
// Helpers //
/////////////

/// Check that a set of identifiers is unique
fn check_unique(ids: &[String], what: &str) -> Result<()> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for id in ids {
        ensure_input!(seen.insert(id.as_str()), "Duplicated {} identifier: {}", what, id);
    }
    Ok(())
}

/// Placeholder identifiers `{prefix}_{i}`
pub fn placeholder_ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}_{}", prefix, i)).collect()
}

//////////////////
// Count matrix //
//////////////////

/// Genes x cells count matrix in compressed sparse column format
///
/// Only non-zero counts are stored. Row indices are strictly increasing
/// within each column. The matrix is validated once on construction and
/// never mutated afterwards.
///
/// ### Fields
///
/// * `data` - The non-zero counts.
/// * `row_indices` - Gene (row) index of each stored count.
/// * `col_ptrs` - Start of each cell's counts in `data`; `n_cells + 1` long.
/// * `n_genes` - Number of genes (rows).
/// * `gene_ids` - Unique gene identifiers (one per row).
/// * `cell_ids` - Unique cell identifiers (one per column).
#[derive(Clone, Debug)]
pub struct CountMatrix {
    data: Vec<f64>,
    row_indices: Vec<usize>,
    col_ptrs: Vec<usize>,
    n_genes: usize,
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
}

impl CountMatrix {
    /// Generate a new instance from CSC components
    ///
    /// The vectors are moved in, nothing is copied.
    ///
    /// ### Params
    ///
    /// * `data` - The non-zero counts.
    /// * `row_indices` - Gene index per stored count.
    /// * `col_ptrs` - Column pointers, one more than the number of cells.
    /// * `gene_ids` - Gene identifiers, defines the number of rows.
    /// * `cell_ids` - Cell identifiers, defines the number of columns.
    ///
    /// ### Returns
    ///
    /// The validated `CountMatrix` or `InvalidInput` if the structure is
    /// malformed, identifiers repeat, or a count is negative or not finite.
    pub fn from_csc(
        data: Vec<f64>,
        row_indices: Vec<usize>,
        col_ptrs: Vec<usize>,
        gene_ids: Vec<String>,
        cell_ids: Vec<String>,
    ) -> Result<Self> {
        let n_genes = gene_ids.len();
        let n_cells = cell_ids.len();

        ensure_input!(
            col_ptrs.len() == n_cells + 1,
            "Got {} column pointers for {} cells",
            col_ptrs.len(),
            n_cells
        );
        ensure_input!(
            data.len() == row_indices.len(),
            "Got {} values but {} row indices",
            data.len(),
            row_indices.len()
        );
        ensure_input!(col_ptrs[0] == 0, "The first column pointer needs to be 0");
        ensure_input!(
            col_ptrs[n_cells] == data.len(),
            "The last column pointer ({}) does not match the number of values ({})",
            col_ptrs[n_cells],
            data.len()
        );
        check_unique(&gene_ids, "gene")?;
        check_unique(&cell_ids, "cell")?;

        for cell in 0..n_cells {
            let (start, end) = (col_ptrs[cell], col_ptrs[cell + 1]);
            ensure_input!(
                start <= end && end <= data.len(),
                "Invalid column pointers at cell '{}'",
                cell_ids[cell]
            );
            let rows = &row_indices[start..end];
            for (pos, &row) in rows.iter().enumerate() {
                ensure_input!(
                    row < n_genes,
                    "Row index {} out of range for {} genes",
                    row,
                    n_genes
                );
                ensure_input!(
                    pos == 0 || rows[pos - 1] < row,
                    "Row indices of cell '{}' are not strictly increasing",
                    cell_ids[cell]
                );
                let val = data[start + pos];
                ensure_input!(
                    val.is_finite() && val >= 0.0,
                    "Count for gene '{}' in cell '{}' is not a non-negative number: {}",
                    gene_ids[row],
                    cell_ids[cell],
                    val
                );
            }
        }

        Ok(Self {
            data,
            row_indices,
            col_ptrs,
            n_genes,
            gene_ids,
            cell_ids,
        })
    }

    /// Generate a new instance from a dense genes x cells matrix
    ///
    /// Only the non-zero entries are kept.
    ///
    /// ### Params
    ///
    /// * `counts` - The genes x cells counts.
    /// * `gene_ids` - Gene identifiers, same length as the number of rows.
    /// * `cell_ids` - Cell identifiers, same length as the number of columns.
    pub fn from_dense(counts: MatRef<f64>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        ensure_input!(
            gene_ids.len() == counts.nrows(),
            "Got {} gene identifiers for {} rows",
            gene_ids.len(),
            counts.nrows()
        );
        ensure_input!(
            cell_ids.len() == counts.ncols(),
            "Got {} cell identifiers for {} columns",
            cell_ids.len(),
            counts.ncols()
        );

        let mut data = Vec::new();
        let mut row_indices = Vec::new();
        let mut col_ptrs = Vec::with_capacity(counts.ncols() + 1);
        col_ptrs.push(0_usize);

        for col in 0..counts.ncols() {
            for row in 0..counts.nrows() {
                let val = counts[(row, col)];
                // NaN is kept so validation reports it
                if val != 0.0 {
                    data.push(val);
                    row_indices.push(row);
                }
            }
            col_ptrs.push(data.len());
        }

        Self::from_csc(data, row_indices, col_ptrs, gene_ids, cell_ids)
    }

    /// Generate a new instance from a dense matrix with placeholder identifiers
    ///
    /// Genes are named `gene_{i}` and cells `cell_{j}`.
    pub fn from_ref(counts: MatRef<f64>) -> Result<Self> {
        let gene_ids = placeholder_ids("gene", counts.nrows());
        let cell_ids = placeholder_ids("cell", counts.ncols());
        Self::from_dense(counts, gene_ids, cell_ids)
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Number of stored (non-zero) counts
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Row indices and values of one cell
    pub fn column(&self, cell: usize) -> (&[usize], &[f64]) {
        let (start, end) = (self.col_ptrs[cell], self.col_ptrs[cell + 1]);
        (&self.row_indices[start..end], &self.data[start..end])
    }

    /// Count of `gene` in `cell` (zero if not stored)
    pub fn get(&self, gene: usize, cell: usize) -> f64 {
        let (rows, values) = self.column(cell);
        match rows.binary_search(&gene) {
            Ok(pos) => values[pos],
            Err(_) => 0.0,
        }
    }

    /// Total counts per cell (column sums)
    pub fn library_sizes(&self) -> Vec<f64> {
        (0..self.n_cells())
            .map(|cell| self.column(cell).1.iter().sum())
            .collect()
    }

    /// Map gene identifiers to row indices
    ///
    /// ### Params
    ///
    /// * `names` - Gene identifiers to look up.
    ///
    /// ### Returns
    ///
    /// The row indices in the order of `names`, or `InvalidInput` for an
    /// unknown identifier.
    pub fn gene_indices(&self, names: &[String]) -> Result<Vec<usize>> {
        let lookup: FxHashMap<&str, usize> = self
            .gene_ids
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect();

        names
            .iter()
            .map(|name| {
                lookup
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| DoubletError::invalid(format!("Unknown gene identifier: {}", name)))
            })
            .collect()
    }

    /// Resolve a `FeatureSelection` into row indices
    ///
    /// ### Returns
    ///
    /// Sorted, de-duplicated and non-empty row indices.
    pub fn resolve_features(&self, selection: &FeatureSelection) -> Result<Vec<usize>> {
        let mut indices = match selection {
            FeatureSelection::All => (0..self.n_genes()).collect(),
            FeatureSelection::Indices(idx) => {
                if let Some(&bad) = idx.iter().find(|&&i| i >= self.n_genes()) {
                    return Err(DoubletError::invalid(format!(
                        "Feature index {} out of range for {} genes",
                        bad,
                        self.n_genes()
                    )));
                }
                idx.clone()
            }
            FeatureSelection::Names(names) => self.gene_indices(names)?,
            FeatureSelection::TopVariable(n) => {
                ensure_input!(*n > 0, "TopVariable needs at least one gene");
                self.top_variable_genes(*n)
            }
        };

        indices.sort_unstable();
        indices.dedup();

        ensure_input!(!indices.is_empty(), "The feature subset is empty");

        Ok(indices)
    }

    /// Identify the most variable genes
    ///
    /// Counts are scaled to the mean library size and log1p transformed before
    /// the per-gene variance is calculated. Zeros stay zero under the
    /// transform, so only the stored counts are visited. Ties keep the lower
    /// row index.
    ///
    /// ### Params
    ///
    /// * `n` - Number of genes to return (capped at the number of genes).
    ///
    /// ### Returns
    ///
    /// Row indices of the top `n` genes, sorted by index.
    pub fn top_variable_genes(&self, n: usize) -> Vec<usize> {
        let n_cells = self.n_cells();
        let lib_sizes = self.library_sizes();
        let target_size = if n_cells == 0 {
            0.0
        } else {
            lib_sizes.iter().sum::<f64>() / n_cells as f64
        };

        let mut sums = vec![0.0; self.n_genes];
        let mut sums_sq = vec![0.0; self.n_genes];

        for (cell, &lib_size) in lib_sizes.iter().enumerate() {
            if lib_size <= 0.0 {
                continue;
            }
            let (rows, values) = self.column(cell);
            for (&gene, &val) in rows.iter().zip(values) {
                let log_norm = (val / lib_size * target_size).ln_1p();
                sums[gene] += log_norm;
                sums_sq[gene] += log_norm * log_norm;
            }
        }

        let variances: Vec<f64> = sums
            .iter()
            .zip(&sums_sq)
            .map(|(&s, &sq)| {
                if n_cells < 2 {
                    return 0.0;
                }
                let n = n_cells as f64;
                let mean = s / n;
                ((sq - n * mean * mean) / (n - 1.0)).max(0.0)
            })
            .collect();

        let mut ranked: Vec<(usize, f64)> = variances.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n.min(self.n_genes()));

        let mut res: Vec<usize> = ranked.into_iter().map(|(i, _)| i).collect();
        res.sort_unstable();
        res
    }

    /// Dense cells x features profiles for the selected genes
    ///
    /// ### Params
    ///
    /// * `features` - Row indices of the genes to keep.
    ///
    /// ### Returns
    ///
    /// Matrix with one row per cell and one column per feature.
    pub fn feature_profiles(&self, features: &[usize]) -> Mat<f64> {
        let mut position: Vec<Option<usize>> = vec![None; self.n_genes];
        for (f, &gene) in features.iter().enumerate() {
            if let Some(slot) = position.get_mut(gene) {
                *slot = Some(f);
            }
        }

        let mut profiles: Mat<f64> = Mat::zeros(self.n_cells(), features.len());
        for cell in 0..self.n_cells() {
            let (rows, values) = self.column(cell);
            for (&gene, &val) in rows.iter().zip(values) {
                if let Some(f) = position[gene] {
                    profiles[(cell, f)] = val;
                }
            }
        }

        profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn toy() -> CountMatrix {
        // 3 genes x 4 cells; gene_1 varies a lot, gene_2 is flat
        let counts = mat![
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 20.0, 0.0, 20.0],
            [5.0, 5.0, 5.0, 5.0],
        ];
        CountMatrix::from_dense(
            counts.as_ref(),
            vec!["a".into(), "b".into(), "c".into()],
            (0..4).map(|j| format!("c{}", j)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_validation() {
        let neg = mat![[1.0, -1.0]];
        assert!(CountMatrix::from_ref(neg.as_ref()).is_err());

        let nan = mat![[1.0, f64::NAN]];
        assert!(CountMatrix::from_ref(nan.as_ref()).is_err());

        let dup = CountMatrix::from_dense(
            mat![[1.0, 2.0]].as_ref(),
            vec!["g".into()],
            vec!["x".into(), "x".into()],
        );
        assert!(matches!(dup, Err(DoubletError::InvalidInput(_))));

        let wrong_len = CountMatrix::from_dense(
            mat![[1.0, 2.0]].as_ref(),
            vec![],
            vec!["x".into(), "y".into()],
        );
        assert!(wrong_len.is_err());
    }

    #[test]
    fn test_sparse_storage() {
        let m = toy();
        assert_eq!(m.n_genes(), 3);
        assert_eq!(m.n_cells(), 4);
        // the two zeros of gene b are not stored
        assert_eq!(m.nnz(), 10);
        assert_eq!(m.column(1), (&[0_usize, 1, 2][..], &[1.0, 20.0, 5.0][..]));
        assert_eq!(m.column(0).0, &[0_usize, 2][..]);
        assert_eq!(m.get(1, 0), 0.0);
        assert_eq!(m.get(1, 3), 20.0);
    }

    #[test]
    fn test_from_csc() {
        let ids = |p: &str, n: usize| placeholder_ids(p, n);

        // 3 genes x 2 cells: cell_0 = (0, 2, 0), cell_1 = (1, 0, 4)
        let m = CountMatrix::from_csc(
            vec![2.0, 1.0, 4.0],
            vec![1, 0, 2],
            vec![0, 1, 3],
            ids("gene", 3),
            ids("cell", 2),
        )
        .unwrap();
        assert_eq!(m.library_sizes(), vec![2.0, 5.0]);
        assert_eq!(m.get(2, 1), 4.0);

        let unsorted = CountMatrix::from_csc(
            vec![1.0, 2.0],
            vec![2, 0],
            vec![0, 2],
            ids("gene", 3),
            ids("cell", 1),
        );
        assert!(unsorted.is_err());

        let out_of_range =
            CountMatrix::from_csc(vec![1.0], vec![3], vec![0, 1], ids("gene", 3), ids("cell", 1));
        assert!(out_of_range.is_err());

        let bad_ptrs =
            CountMatrix::from_csc(vec![1.0], vec![0], vec![0, 2], ids("gene", 3), ids("cell", 1));
        assert!(bad_ptrs.is_err());

        let overshooting_ptrs = CountMatrix::from_csc(
            vec![1.0, 2.0],
            vec![0, 1],
            vec![0, 7, 2],
            ids("gene", 3),
            ids("cell", 2),
        );
        assert!(overshooting_ptrs.is_err());

        let too_few_ptrs =
            CountMatrix::from_csc(vec![], vec![], vec![0], ids("gene", 3), ids("cell", 2));
        assert!(matches!(too_few_ptrs, Err(DoubletError::InvalidInput(_))));
    }

    #[test]
    fn test_library_sizes_and_profiles() {
        let m = toy();
        assert_eq!(m.library_sizes(), vec![6.0, 26.0, 6.0, 26.0]);

        let prof = m.feature_profiles(&[1, 2]);
        assert_eq!(prof.nrows(), 4);
        assert_eq!(prof.ncols(), 2);
        assert_eq!(prof[(0, 0)], 0.0);
        assert_eq!(prof[(1, 0)], 20.0);
        assert_eq!(prof[(3, 1)], 5.0);
    }

    #[test]
    fn test_resolve_features() {
        let m = toy();
        assert_eq!(m.resolve_features(&FeatureSelection::All).unwrap(), vec![0, 1, 2]);
        assert_eq!(
            m.resolve_features(&FeatureSelection::Indices(vec![2, 0, 2])).unwrap(),
            vec![0, 2]
        );
        assert_eq!(
            m.resolve_features(&FeatureSelection::Names(vec!["c".into(), "a".into()]))
                .unwrap(),
            vec![0, 2]
        );
        assert!(m.resolve_features(&FeatureSelection::Indices(vec![])).is_err());
        assert!(m.resolve_features(&FeatureSelection::Indices(vec![3])).is_err());
        assert!(m
            .resolve_features(&FeatureSelection::Names(vec!["zzz".into()]))
            .is_err());
        assert!(m.resolve_features(&FeatureSelection::TopVariable(0)).is_err());
    }

    #[test]
    fn test_top_variable() {
        let m = toy();
        assert_eq!(m.top_variable_genes(1), vec![1]);
        assert_eq!(m.resolve_features(&FeatureSelection::TopVariable(10)).unwrap().len(), 3);
    }
}
