use faer::{Mat, MatRef};
use rayon::prelude::*;

use crate::core::data::sparse_structures::{SparseCooMatrix, SparsePlan};
use crate::core::methods::fugw::params::FugwParams;
use crate::core::methods::fugw::solver::{fit_sparse_fugw, FugwFit};
use crate::error::{FugwError, Result};

////////////////////
// Main structure //
////////////////////

/// Sparse FUGW mapping between a source and a target domain
///
/// Holds the hyperparameters and, after a successful `fit`, the fitted plan.
/// `transform`, `inverse_transform` and `score` only read the plan, so a fitted
/// model can be shared across threads.
#[derive(Clone, Debug)]
pub struct FugwSparse {
    params: FugwParams,
    fit: Option<FugwFit>,
}

impl FugwSparse {
    /// Generate a new, unfitted instance
    pub fn new(params: FugwParams) -> Self {
        Self { params, fit: None }
    }

    /// Fit the mapping with uniform point weights
    ///
    /// ### Params
    ///
    /// * `source_features` - Features with rows = features, columns = source
    ///   points.
    /// * `target_features` - Features with rows = features, columns = target
    ///   points.
    /// * `source_embedding` - Source geometry embedding with rows = points.
    /// * `target_embedding` - Target geometry embedding with rows = points.
    /// * `init_plan` - Optional initial plan defining the support.
    ///
    /// ### Returns
    ///
    /// The fit result. Any error leaves the model unfitted.
    pub fn fit(
        &mut self,
        source_features: MatRef<f64>,
        target_features: MatRef<f64>,
        source_embedding: MatRef<f64>,
        target_embedding: MatRef<f64>,
        init_plan: Option<&SparseCooMatrix>,
    ) -> Result<&FugwFit> {
        self.fit_weighted(
            source_features,
            target_features,
            source_embedding,
            target_embedding,
            init_plan,
            None,
            None,
        )
    }

    /// Fit the mapping with optional point weights
    ///
    /// Weights must be finite and positive; they are normalised to sum to 1.
    /// `None` means uniform.
    #[allow(clippy::too_many_arguments)]
    pub fn fit_weighted(
        &mut self,
        source_features: MatRef<f64>,
        target_features: MatRef<f64>,
        source_embedding: MatRef<f64>,
        target_embedding: MatRef<f64>,
        init_plan: Option<&SparseCooMatrix>,
        source_weights: Option<&[f64]>,
        target_weights: Option<&[f64]>,
    ) -> Result<&FugwFit> {
        self.fit = None;

        let fit = fit_sparse_fugw(
            source_features,
            target_features,
            source_embedding,
            target_embedding,
            init_plan,
            source_weights,
            target_weights,
            &self.params,
        )?;

        Ok(&*self.fit.insert(fit))
    }

    /// The hyperparameters
    pub fn params(&self) -> &FugwParams {
        &self.params
    }

    /// Has `fit` succeeded
    pub fn is_fitted(&self) -> bool {
        self.fit.is_some()
    }

    /// The full fit result
    pub fn fit_result(&self) -> Result<&FugwFit> {
        self.fit.as_ref().ok_or(FugwError::NotFitted)
    }

    /// The fitted plan
    pub fn plan(&self) -> Result<&SparsePlan> {
        Ok(&self.fit_result()?.plan)
    }

    /// Map source observations into the target domain
    ///
    /// Each target point receives the plan-weighted average over its support
    /// partners, `Y[o, j] = Σ_i X[o, i] π_ij / Σ_i π_ij`. Target points without
    /// mass map to 0.
    ///
    /// ### Params
    ///
    /// * `x` - Matrix with rows = observations, columns = source points.
    ///
    /// ### Returns
    ///
    /// Matrix with rows = observations, columns = target points.
    pub fn transform(&self, x: MatRef<f64>) -> Result<Mat<f64>> {
        let plan = self.plan()?;
        let support = plan.support();
        crate::ensure_dim!("transform columns (source points)", support.n_source(), x.ncols());

        let n_obs = x.nrows();
        let rows = support.row_indices();
        let values = plan.values();
        let masses = plan.col_sums();

        let columns: Vec<Vec<f64>> = (0..support.n_target())
            .into_par_iter()
            .map(|j| {
                let mut out = vec![0.0; n_obs];
                if masses[j] <= 0.0 {
                    return out;
                }
                for &e in support.col_entries(j) {
                    let i = rows[e];
                    let w = values[e] / masses[j];
                    for (o, val) in out.iter_mut().enumerate() {
                        *val += x[(o, i)] * w;
                    }
                }
                out
            })
            .collect();

        Ok(Mat::from_fn(n_obs, support.n_target(), |o, j| columns[j][o]))
    }

    /// Map target observations back into the source domain
    ///
    /// Same barycentric map as `transform` using the row masses of the plan.
    ///
    /// ### Params
    ///
    /// * `y` - Matrix with rows = observations, columns = target points.
    ///
    /// ### Returns
    ///
    /// Matrix with rows = observations, columns = source points.
    pub fn inverse_transform(&self, y: MatRef<f64>) -> Result<Mat<f64>> {
        let plan = self.plan()?;
        let support = plan.support();
        crate::ensure_dim!(
            "inverse transform columns (target points)",
            support.n_target(),
            y.ncols()
        );

        let n_obs = y.nrows();
        let cols = support.col_indices();
        let values = plan.values();
        let masses = plan.row_sums();

        let columns: Vec<Vec<f64>> = (0..support.n_source())
            .into_par_iter()
            .map(|i| {
                let mut out = vec![0.0; n_obs];
                if masses[i] <= 0.0 {
                    return out;
                }
                for e in support.row_range(i) {
                    let j = cols[e];
                    let w = values[e] / masses[i];
                    for (o, val) in out.iter_mut().enumerate() {
                        *val += y[(o, j)] * w;
                    }
                }
                out
            })
            .collect();

        Ok(Mat::from_fn(n_obs, support.n_source(), |o, i| columns[i][o]))
    }

    /// Held-out alignment score
    ///
    /// Mass-weighted mean squared difference between `transform(x)` and `y`,
    /// `Σ_o Σ_j m_j (Ŷ[o, j] - Y[o, j])² / (n_obs Σ_j m_j)` with `m_j` the
    /// target masses of the plan. Lower is better. Zero observations score 0
    /// and a result too large to represent saturates at `f64::MAX`.
    ///
    /// ### Params
    ///
    /// * `x` - Matrix with rows = observations, columns = source points.
    /// * `y` - Matrix with rows = observations, columns = target points.
    ///
    /// ### Returns
    ///
    /// The score.
    pub fn score(&self, x: MatRef<f64>, y: MatRef<f64>) -> Result<f64> {
        let predicted = self.transform(x)?;
        crate::ensure_nrows!("score observations", predicted, y);
        crate::ensure_dim!("score columns (target points)", predicted.ncols(), y.ncols());

        let n_obs = y.nrows();
        let masses = self.plan()?.col_sums();
        let total_mass: f64 = masses.iter().sum();
        if n_obs == 0 || total_mass <= 0.0 {
            return Ok(0.0);
        }

        // squares are taken on rescaled values so large finite inputs
        // cannot overflow
        let scale = (0..n_obs)
            .flat_map(|o| (0..y.ncols()).map(move |j| (o, j)))
            .fold(0.0_f64, |acc, (o, j)| {
                acc.max(predicted[(o, j)].abs()).max(y[(o, j)].abs())
            });
        if scale == 0.0 {
            return Ok(0.0);
        }
        if !scale.is_finite() {
            return Ok(f64::MAX);
        }

        let weighted: f64 = masses
            .par_iter()
            .enumerate()
            .map(|(j, &m)| {
                let sq: f64 = (0..n_obs)
                    .map(|o| {
                        let diff = predicted[(o, j)] / scale - y[(o, j)] / scale;
                        diff * diff
                    })
                    .sum();
                m * sq
            })
            .sum();

        let score = weighted / (n_obs as f64 * total_mass) * scale * scale;
        Ok(if score.is_finite() { score } else { f64::MAX })
    }
}

///////////
// Tests //
///////////
