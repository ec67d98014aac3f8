use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::core::base::utils::{log_sum_exp, max_abs, max_abs_diff};
use crate::core::data::sparse_structures::{SparsePlan, Support};
use crate::core::methods::fugw::params::FugwParams;

////////////////
// Structures //
////////////////

/// Log-domain dual potentials of the scaling problem
///
/// Both vectors are dimensionless (already divided by `ε`).
///
/// ### Fields
///
/// * `source` - One potential per source point.
/// * `target` - One potential per target point.
#[derive(Debug, Clone, PartialEq)]
pub struct DualPotentials {
    pub source: Vec<f64>,
    pub target: Vec<f64>,
}

impl DualPotentials {
    /// Zero potentials for both domains
    pub fn zeros(n_source: usize, n_target: usize) -> Self {
        Self {
            source: vec![0.0; n_source],
            target: vec![0.0; n_target],
        }
    }

    /// Check that all potentials are finite
    pub fn is_finite(&self) -> bool {
        self.source.iter().chain(self.target.iter()).all(|x| x.is_finite())
    }
}

/// Result of one scaling solve
///
/// ### Fields
///
/// * `plan` - The scaled plan on the support.
/// * `duals` - The final potentials, to warm start the next solve.
/// * `n_iter` - Number of scaling iterations run.
/// * `converged` - Did the potentials settle below the tolerance.
#[derive(Debug, Clone)]
pub struct ScalingResult {
    pub plan: SparsePlan,
    pub duals: DualPotentials,
    pub n_iter: usize,
    pub converged: bool,
}

impl ScalingResult {
    /// Check that potentials and plan values are all finite
    pub fn is_finite(&self) -> bool {
        self.duals.is_finite() && self.plan.is_finite()
    }
}

/////////////
// Helpers //
/////////////

/// Damping exponent of the KL-relaxed marginal update
#[inline]
fn damping(rho: f64, eps: f64) -> f64 {
    if rho.is_infinite() {
        1.0
    } else {
        rho / (rho + eps)
    }
}

//////////////////////
// Sinkhorn scaling //
//////////////////////

/// Unbalanced log-domain Sinkhorn restricted to a sparse support
///
/// Solves
///
/// `min_γ <c, γ> + ρ_s KL(γ1 | w_s) + ρ_t KL(γ2 | w_t) + ε KL(γ | w_s ⊗ w_t)`
///
/// over plans living on `support`. Each iteration performs one column and one
/// row update,
///
/// `v_j = -τ_t LSE_i(u_i + log w_s,i - c_ij / ε)` and
/// `u_i = -τ_s LSE_j(v_j + log w_t,j - c_ij / ε)`,
///
/// with `τ = ρ / (ρ + ε)`. Points without support entries keep a zero
/// potential. Hitting the iteration cap is not an error; the best-effort plan
/// is returned. Non-finite potentials stop the loop early and show up in
/// `ScalingResult::is_finite`.
///
/// ### Params
///
/// * `cost` - Linear cost per support entry.
/// * `support` - The shared support.
/// * `source_weights` - Source point weights.
/// * `target_weights` - Target point weights.
/// * `init_duals` - Warm start potentials.
/// * `params` - The hyperparameters (`rho_*`, `eps`, `max_scaling_iter`,
///   `tol_scaling`).
///
/// ### Returns
///
/// The `ScalingResult`.
pub fn sinkhorn_log_sparse(
    cost: &[f64],
    support: Arc<Support>,
    source_weights: &[f64],
    target_weights: &[f64],
    init_duals: DualPotentials,
    params: &FugwParams,
) -> ScalingResult {
    crate::assert_same_len!(cost, support.col_indices());

    let eps = params.eps;
    let tau_s = damping(params.rho_source, eps);
    let tau_t = damping(params.rho_target, eps);

    let log_ws: Vec<f64> = source_weights.iter().map(|w| w.ln()).collect();
    let log_wt: Vec<f64> = target_weights.iter().map(|w| w.ln()).collect();
    let scaled_cost: Vec<f64> = cost.iter().map(|c| c / eps).collect();

    let rows = support.row_indices();
    let cols = support.col_indices();

    let DualPotentials {
        source: mut u,
        target: mut v,
    } = init_duals;

    let mut n_iter = 0;
    let mut converged = false;

    for _ in 0..params.max_scaling_iter {
        n_iter += 1;

        let v_new: Vec<f64> = (0..support.n_target())
            .into_par_iter()
            .map(|j| {
                let entries = support.col_entries(j);
                if tau_t == 0.0 || entries.is_empty() {
                    return 0.0;
                }
                -tau_t
                    * log_sum_exp(
                        entries
                            .iter()
                            .map(|&e| u[rows[e]] + log_ws[rows[e]] - scaled_cost[e]),
                    )
            })
            .collect();

        let u_new: Vec<f64> = (0..support.n_source())
            .into_par_iter()
            .map(|i| {
                let range = support.row_range(i);
                if tau_s == 0.0 || range.is_empty() {
                    return 0.0;
                }
                -tau_s
                    * log_sum_exp(
                        range
                            .map(|e| v_new[cols[e]] + log_wt[cols[e]] - scaled_cost[e]),
                    )
            })
            .collect();

        let finite = u_new.iter().chain(v_new.iter()).all(|x| x.is_finite());
        let change = max_abs_diff(&u_new, &u).max(max_abs_diff(&v_new, &v));
        let scale = 1.0 + max_abs(&u_new).max(max_abs(&v_new));

        u = u_new;
        v = v_new;

        if !finite {
            debug!("Scaling produced non-finite potentials after {} iterations", n_iter);
            break;
        }
        if change / scale < params.tol_scaling {
            converged = true;
            break;
        }
    }

    if !converged {
        debug!(
            "Scaling stopped after {} iterations without reaching tol {:.1e}",
            n_iter, params.tol_scaling
        );
    }

    let values: Vec<f64> = (0..support.nnz())
        .into_par_iter()
        .map(|e| {
            let (i, j) = (rows[e], cols[e]);
            (u[i] + v[j] - scaled_cost[e] + log_ws[i] + log_wt[j]).exp()
        })
        .collect();

    ScalingResult {
        plan: SparsePlan::new(support, values),
        duals: DualPotentials {
            source: u,
            target: v,
        },
        n_iter,
        converged,
    }
}

///////////
// Tests //
///////////
