use faer::Mat;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand_distr::{Distribution, Normal, Uniform};

use crate::core::data::sparse_structures::SparseCooMatrix;

////////////////
// Structures //
////////////////

/// Structure for a synthetic alignment domain
///
/// ### Fields
///
/// * `weights` - Uniform point weights summing to 1.
/// * `features` - Feature matrix with rows = features and columns = points.
/// * `embedding` - Geometry embedding with rows = points and columns = rank.
#[derive(Clone, Debug)]
pub struct SyntheticDomain {
    pub weights: Vec<f64>,
    pub features: Mat<f64>,
    pub embedding: Mat<f64>,
}

///////////////////////
// Synthetic domains //
///////////////////////

/// Generate a random domain with uniform features and point coordinates
///
/// ### Params
///
/// * `n_features` - Number of feature channels.
/// * `n_points` - Number of points in the domain.
/// * `rank` - Rank of the geometry embedding (3 for voxel coordinates).
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The `SyntheticDomain`.
pub fn generate_domain(n_features: usize, n_points: usize, rank: usize, seed: u64) -> SyntheticDomain {
    let mut rng = StdRng::seed_from_u64(seed);

    let features = random_uniform_matrix(n_features, n_points, &mut rng);
    let embedding = random_uniform_matrix(n_points, rank, &mut rng);
    let weights = vec![1.0 / n_points as f64; n_points];

    SyntheticDomain {
        weights,
        features,
        embedding,
    }
}

/// Generate a matrix with values drawn from `U(0, 1)`
///
/// ### Params
///
/// * `nrow` - Number of rows.
/// * `ncol` - Number of columns.
/// * `rng` - The random number generator.
pub fn random_uniform_matrix(nrow: usize, ncol: usize, rng: &mut StdRng) -> Mat<f64> {
    let dist = Uniform::new(0.0, 1.0).unwrap();
    let values: Vec<f64> = (0..nrow * ncol).map(|_| dist.sample(rng)).collect();
    Mat::from_fn(nrow, ncol, |i, j| values[i * ncol + j])
}

/// Generate a noisy copy of a feature matrix with a permuted point order
///
/// Useful to build pairs of domains with a known correspondence.
/// Panics if `noise_sd` is negative or not finite.
///
/// ### Params
///
/// * `features` - Feature matrix with rows = features and columns = points.
/// * `noise_sd` - Standard deviation of the added Gaussian noise.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// Tuple of the noisy permuted features and the permutation, where
/// `permutation[j]` is the original column of output column `j`.
pub fn noisy_permuted_copy(features: &Mat<f64>, noise_sd: f64, seed: u64) -> (Mat<f64>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, noise_sd).unwrap();

    let mut permutation: Vec<usize> = (0..features.ncols()).collect();
    permutation.shuffle(&mut rng);

    let noise: Vec<f64> = (0..features.nrows() * features.ncols())
        .map(|_| normal.sample(&mut rng))
        .collect();
    let ncol = features.ncols();
    let noisy = Mat::from_fn(features.nrows(), ncol, |i, j| {
        features[(i, permutation[j])] + noise[i * ncol + j]
    });

    (noisy, permutation)
}

/// Generate a random sparse initial plan with a fixed number of targets per
/// source point
///
/// Every stored value equals `1 / nnz`.
///
/// ### Params
///
/// * `n_source` - Number of source points.
/// * `n_target` - Number of target points.
/// * `items_per_row` - Distinct targets drawn per source point. Capped at
///   `n_target`.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The initial plan in COO format.
pub fn random_sparse_init_plan(
    n_source: usize,
    n_target: usize,
    items_per_row: usize,
    seed: u64,
) -> SparseCooMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let k = items_per_row.min(n_target);

    let mut rows = Vec::with_capacity(n_source * k);
    let mut cols = Vec::with_capacity(n_source * k);

    for i in 0..n_source {
        for j in sample(&mut rng, n_target, k).into_iter() {
            rows.push(i);
            cols.push(j);
        }
    }

    let nnz = rows.len().max(1);
    let values = vec![1.0 / nnz as f64; rows.len()];

    SparseCooMatrix::new(&rows, &cols, &values, n_source, n_target)
}

///////////
// Tests //
///////////
