use faer::{Mat, MatRef};
use rayon::prelude::*;

use crate::core::base::utils::{khatri_rao_rows, normalise_embedding};
use crate::core::data::sparse_structures::{SparsePlan, Support};
use crate::error::Result;

/////////////
// Helpers //
/////////////

/// Weighted sum of the rows of a matrix
///
/// ### Params
///
/// * `mat` - Matrix with rows = points.
/// * `weights` - One weight per row.
///
/// ### Returns
///
/// `matᵀ · weights`
fn weighted_row_sum(mat: MatRef<f64>, weights: &[f64]) -> Vec<f64> {
    (0..mat.ncols())
        .map(|c| {
            weights
                .iter()
                .enumerate()
                .map(|(i, &w)| w * mat[(i, c)])
                .sum()
        })
        .collect()
}

/// Dot product of row `i` of a matrix with a vector
#[inline]
fn row_dot(mat: MatRef<f64>, i: usize, v: &[f64]) -> f64 {
    v.iter().enumerate().map(|(c, &x)| mat[(i, c)] * x).sum()
}

///////////////////
// Geometry cost //
///////////////////

/// Low-rank geometry (Gromov-Wasserstein) cost model
///
/// Intra-domain relations are the inner products of the normalised
/// embeddings, `d_ik = x_i · x_k`. The cost of a support pair for a plan π is
///
/// `C(π)_ij = Σ_kl (d_ik - d'_jl)² π_kl
///          = (D²π1)_i + (D'²π2)_j - 2 x_iᵀ (Σ_kl π_kl x_k y_lᵀ) y_j`
///
/// which only needs `O(n · rank²)` precomputed values and `O(|S| · rank)`
/// work per evaluation.
///
/// ### Fields
///
/// * `source` - Normalised source embedding (n_source x rank).
/// * `target` - Normalised target embedding (n_target x rank).
/// * `source_sq` - Row-wise Khatri-Rao square of `source`.
/// * `target_sq` - Row-wise Khatri-Rao square of `target`.
#[derive(Debug, Clone)]
pub struct GeometryCost {
    source: Mat<f64>,
    target: Mat<f64>,
    source_sq: Mat<f64>,
    target_sq: Mat<f64>,
}

impl GeometryCost {
    /// Generate the cost model from raw embeddings
    ///
    /// Both embeddings are centred and scaled, and the lower-rank one is
    /// zero-padded to the larger rank.
    ///
    /// ### Params
    ///
    /// * `source` - Source embedding with rows = points.
    /// * `target` - Target embedding with rows = points.
    pub fn new(source: MatRef<f64>, target: MatRef<f64>) -> Self {
        let rank = source.ncols().max(target.ncols());
        let source = normalise_embedding(source, rank);
        let target = normalise_embedding(target, rank);
        let source_sq = khatri_rao_rows(source.as_ref());
        let target_sq = khatri_rao_rows(target.as_ref());

        Self {
            source,
            target,
            source_sq,
            target_sq,
        }
    }

    /// Shared rank of both embeddings
    pub fn rank(&self) -> usize {
        self.source.ncols()
    }

    /// The normalised source embedding
    pub fn source_embedding(&self) -> MatRef<'_, f64> {
        self.source.as_ref()
    }

    /// The normalised target embedding
    pub fn target_embedding(&self) -> MatRef<'_, f64> {
        self.target.as_ref()
    }

    /// Evaluate the geometry cost on the support of `plan`
    ///
    /// ### Params
    ///
    /// * `plan` - The linearisation point.
    ///
    /// ### Returns
    ///
    /// One non-negative cost per support entry.
    pub fn evaluate(&self, plan: &SparsePlan) -> Vec<f64> {
        let support = plan.support();
        let r = self.rank();

        let row_mass = plan.row_sums();
        let col_mass = plan.col_sums();

        let a_vec = weighted_row_sum(self.source_sq.as_ref(), &row_mass);
        let b_vec = weighted_row_sum(self.target_sq.as_ref(), &col_mass);

        let a: Vec<f64> = (0..support.n_source())
            .into_par_iter()
            .map(|i| row_dot(self.source_sq.as_ref(), i, &a_vec))
            .collect();
        let b: Vec<f64> = (0..support.n_target())
            .into_par_iter()
            .map(|j| row_dot(self.target_sq.as_ref(), j, &b_vec))
            .collect();

        let cross = self.cross_moment(plan);

        // x_i ᵀ M, one rank-length row per source point
        let projected: Vec<Vec<f64>> = (0..support.n_source())
            .into_par_iter()
            .map(|i| {
                (0..r)
                    .map(|c| (0..r).map(|a_idx| self.source[(i, a_idx)] * cross[a_idx * r + c]).sum())
                    .collect()
            })
            .collect();

        (0..support.nnz())
            .into_par_iter()
            .map(|e| {
                let (i, j) = support.pair(e);
                let bilinear = row_dot(self.target.as_ref(), j, &projected[i]);
                (a[i] + b[j] - 2.0 * bilinear).max(0.0)
            })
            .collect()
    }

    /// `M = Σ_(k,l)∈S π_kl x_k y_lᵀ`, stored row-major (rank x rank)
    fn cross_moment(&self, plan: &SparsePlan) -> Vec<f64> {
        let support = plan.support();
        let values = plan.values();
        let r = self.rank();

        (0..support.nnz())
            .into_par_iter()
            .fold(
                || vec![0.0; r * r],
                |mut acc, e| {
                    let (k, l) = support.pair(e);
                    let p = values[e];
                    if p != 0.0 {
                        for a in 0..r {
                            let xa = p * self.source[(k, a)];
                            for c in 0..r {
                                acc[a * r + c] += xa * self.target[(l, c)];
                            }
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0; r * r],
                |mut left, right| {
                    left.iter_mut().zip(right.iter()).for_each(|(l, x)| *l += x);
                    left
                },
            )
    }
}

//////////////////
// Feature cost //
//////////////////

/// Squared Euclidean feature discrepancy on the support
///
/// ### Params
///
/// * `source_features` - Features with rows = features, columns = source
///   points.
/// * `target_features` - Features with rows = features, columns = target
///   points.
/// * `support` - The support.
/// * `normalise` - Divide by the maximum cost over the support.
///
/// ### Returns
///
/// One cost per support entry, or `DimensionMismatch` if the feature counts
/// or point counts disagree.
pub fn feature_cost(
    source_features: MatRef<f64>,
    target_features: MatRef<f64>,
    support: &Support,
    normalise: bool,
) -> Result<Vec<f64>> {
    crate::ensure_nrows!("feature dimension", source_features, target_features);
    crate::ensure_dim!("source feature points", support.n_source(), source_features.ncols());
    crate::ensure_dim!("target feature points", support.n_target(), target_features.ncols());

    let n_features = source_features.nrows();

    let mut cost: Vec<f64> = (0..support.nnz())
        .into_par_iter()
        .map(|e| {
            let (i, j) = support.pair(e);
            (0..n_features)
                .map(|d| {
                    let diff = source_features[(d, i)] - target_features[(d, j)];
                    diff * diff
                })
                .sum()
        })
        .collect();

    if normalise {
        let max = cost.iter().copied().fold(0.0_f64, f64::max);
        if max > 0.0 && max.is_finite() {
            cost.iter_mut().for_each(|c| *c /= max);
        }
    }

    Ok(cost)
}

///////////
// Tests //
///////////
