use extendr_api::prelude::*;
use faer::MatRef;

use crate::core::data::count_matrix::{placeholder_ids, CountMatrix};
use crate::utils::errors::{DoubletError, Result};

/////////////////
// Conversions //
/////////////////

/// Transform an R matrix to a faer one
pub fn r_matrix_to_faer(x: &RMatrix<f64>) -> MatRef<'_, f64> {
    let ncol = x.ncols();
    let nrow = x.nrows();
    let data = x.data();

    MatRef::from_column_major_slice(data, nrow, ncol)
}

/// Transform the slots of a `dgCMatrix` into a `CountMatrix`
///
/// ### Params
///
/// * `x` - The non-zero values (`@x`).
/// * `i` - The 0-indexed row indices (`@i`).
/// * `p` - The column pointers (`@p`).
/// * `n_genes` - Number of rows (`@Dim[1]`).
///
/// ### Returns
///
/// The validated `CountMatrix` with placeholder identifiers.
pub fn r_csc_to_counts(x: Vec<f64>, i: &[i32], p: &[i32], n_genes: usize) -> Result<CountMatrix> {
    // negative R integers wrap to huge values and fail validation
    let row_indices: Vec<usize> = i.iter().map(|&r| r as usize).collect();
    let col_ptrs: Vec<usize> = p.iter().map(|&c| c as usize).collect();
    let n_cells = col_ptrs.len().saturating_sub(1);

    CountMatrix::from_csc(
        x,
        row_indices,
        col_ptrs,
        placeholder_ids("gene", n_genes),
        placeholder_ids("cell", n_cells),
    )
}

/// Transform optional booleans into an R logical vector (`None` -> `NA`)
pub fn option_bool_to_r(x: &[Option<bool>]) -> Logicals {
    Logicals::from_values(x.iter().map(|v| match v {
        Some(b) => Rbool::from(*b),
        None => Rbool::na(),
    }))
}

/// Transform optional floats into an R numeric vector (`None` -> `NA`)
pub fn option_f64_to_r(x: &[Option<f64>]) -> Doubles {
    Doubles::from_values(x.iter().map(|v| match v {
        Some(f) => Rfloat::from(*f),
        None => Rfloat::na(),
    }))
}

////////////
// Errors //
////////////

impl From<DoubletError> for extendr_api::Error {
    fn from(err: DoubletError) -> Self {
        extendr_api::Error::Other(err.to_string())
    }
}
