use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::utils::errors::{DoubletError, Result};

////////////////
// Structures //
////////////////

/// Structure for random SVD results
///
/// ### Fields
///
/// * `u` - Matrix u of the SVD decomposition
/// * `v` - Matrix v of the SVD decomposition
/// * `s` - Singular values of the SVD decomposition
#[derive(Clone, Debug)]
pub struct RandomSvdResults {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    pub s: Vec<f64>,
}

///////////////
// Functions //
///////////////

/// Randomised SVD
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `RandomSvdResults`.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: for each iteration, compute Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Reconstruct the final SVD: U = Q * U_B, V = V_B, S = S_B
pub fn randomised_svd(
    x: MatRef<f64>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<RandomSvdResults> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).map_err(|e| DoubletError::Linalg(e.to_string()))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng));

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * q;
        q = (x * z).qr().compute_thin_Q();
    }

    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| DoubletError::Linalg(format!("randomised SVD failed: {:?}", e)))?;

    Ok(RandomSvdResults {
        u: q * svd.U(),
        v: svd.V().cloned(),
        s: svd.S().column_vector().iter().copied().collect(),
    })
}

/// Get the top right singular vectors (the PCA loadings) of a matrix
///
/// ### Params
///
/// * `x` - The (already centred) data with samples as rows.
/// * `rank` - Number of components to return. Needs to be ≤ min(nrow, ncol).
/// * `random_svd` - Use the randomised SVD instead of the exact thin SVD.
/// * `seed` - Seed for the randomised SVD.
///
/// ### Returns
///
/// The loadings as a `ncol x rank` matrix.
pub fn top_loadings(x: MatRef<f64>, rank: usize, random_svd: bool, seed: u64) -> Result<Mat<f64>> {
    let n_features = x.ncols();
    if rank == 0 || rank > n_features.min(x.nrows()) {
        return Err(DoubletError::invalid(format!(
            "Cannot extract {} components from a {}x{} matrix",
            rank,
            x.nrows(),
            n_features
        )));
    }

    let loadings = if random_svd {
        let res = randomised_svd(x, rank, seed, Some(10), None)?;
        res.v.submatrix(0, 0, n_features, rank).to_owned()
    } else {
        let res = x
            .thin_svd()
            .map_err(|e| DoubletError::Linalg(format!("SVD failed: {:?}", e)))?;
        res.V().submatrix(0, 0, n_features, rank).to_owned()
    };

    Ok(loadings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank_one_plus_noise() -> Mat<f64> {
        // rows spread along (1, 1, 0) with a little variation on the third axis
        Mat::from_fn(20, 3, |i, j| {
            let t = i as f64 - 9.5;
            match j {
                0 | 1 => t,
                _ => 0.01 * ((i % 3) as f64 - 1.0),
            }
        })
    }

    #[test]
    fn test_top_loadings_exact() {
        let x = rank_one_plus_noise();
        let loadings = top_loadings(x.as_ref(), 1, false, 42).unwrap();

        assert_eq!(loadings.nrows(), 3);
        assert_eq!(loadings.ncols(), 1);

        let inv_sqrt2 = 1.0 / 2.0_f64.sqrt();
        assert!((loadings[(0, 0)].abs() - inv_sqrt2).abs() < 1e-3);
        assert!((loadings[(1, 0)].abs() - inv_sqrt2).abs() < 1e-3);
        assert!(loadings[(2, 0)].abs() < 1e-3);
    }

    #[test]
    fn test_randomised_matches_exact_direction() {
        let x = rank_one_plus_noise();
        let exact = top_loadings(x.as_ref(), 1, false, 42).unwrap();
        let random = top_loadings(x.as_ref(), 1, true, 42).unwrap();

        let dot: f64 = (0..3).map(|i| exact[(i, 0)] * random[(i, 0)]).sum();
        assert!((dot.abs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_top_loadings_rank_check() {
        let x = rank_one_plus_noise();
        assert!(top_loadings(x.as_ref(), 4, false, 1).is_err());
        assert!(top_loadings(x.as_ref(), 0, false, 1).is_err());
    }
}
