use rayon::prelude::*;

use crate::core::data::sparse_structures::SparsePlan;
use crate::core::methods::fugw::costs::GeometryCost;
use crate::core::methods::fugw::params::FugwParams;

////////////////////
// KL divergences //
////////////////////

/// `Σ p log(p / q)` with the convention `0 log 0 = 0`
///
/// ### Params
///
/// * `p` - The measure.
/// * `q` - The reference measure (strictly positive where `p > 0`).
pub fn approx_kl(p: &[f64], q: &[f64]) -> f64 {
    crate::assert_same_len!(p, q);
    p.iter()
        .zip(q.iter())
        .map(|(&pi, &qi)| if pi > 0.0 { pi * (pi / qi).ln() } else { 0.0 })
        .sum()
}

/// Generalised KL divergence between two non-negative measures
///
/// `KL(p | q) = Σ p log(p / q) - m(p) + m(q)`, which is non-negative for
/// measures of any total mass.
pub fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    let m_p: f64 = p.iter().sum();
    let m_q: f64 = q.iter().sum();
    approx_kl(p, q) - m_p + m_q
}

/// KL divergence between two tensor products of measures
///
/// `KL(μ ⊗ ν | α ⊗ β) = m(ν) KL(μ|α) + m(μ) KL(ν|β) + (m(μ) - m(α))(m(ν) - m(β))`
///
/// ### Params
///
/// * `mu` - First factor of the measure.
/// * `nu` - Second factor of the measure.
/// * `alpha` - First factor of the reference.
/// * `beta` - Second factor of the reference.
pub fn quad_kl(mu: &[f64], nu: &[f64], alpha: &[f64], beta: &[f64]) -> f64 {
    let m_mu: f64 = mu.iter().sum();
    let m_nu: f64 = nu.iter().sum();
    let m_alpha: f64 = alpha.iter().sum();
    let m_beta: f64 = beta.iter().sum();

    m_nu * kl_divergence(mu, alpha)
        + m_mu * kl_divergence(nu, beta)
        + (m_mu - m_alpha) * (m_nu - m_beta)
}

/// Multiply a relaxation weight with its term
///
/// Zero weights drop the term and infinite weights turn it into a hard
/// constraint, so neither contributes to the objective.
#[inline]
fn relaxation(rho: f64, value: f64) -> f64 {
    if rho == 0.0 || rho.is_infinite() {
        0.0
    } else {
        rho * value
    }
}

////////////////
// Structures //
////////////////

/// Breakdown of the surrogate FUGW objective
///
/// ### Fields
///
/// * `wasserstein` - Weighted feature term.
/// * `gromov_wasserstein` - Weighted geometry term.
/// * `marginal_source` - Weighted source marginal KL.
/// * `marginal_target` - Weighted target marginal KL.
/// * `entropic` - Weighted entropic KL.
/// * `total` - Sum of all terms.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FugwLoss {
    pub wasserstein: f64,
    pub gromov_wasserstein: f64,
    pub marginal_source: f64,
    pub marginal_target: f64,
    pub entropic: f64,
    pub total: f64,
}

/// Read-only inputs of the surrogate objective for one fit
///
/// With `R = w_s ⊗ w_t` restricted to the support, the objective of a pair of
/// plans is
///
/// ```text
/// F(π, γ) = α ½ (<C_f, π> m(γ) + <C_f, γ> m(π)) + (1 - α) <C_g(π), γ>
///         + ρ_s KL(π1 ⊗ γ1 | w_s ⊗ w_s) + ρ_t KL(π2 ⊗ γ2 | w_t ⊗ w_t)
///         + ε KL(π ⊗ γ | R ⊗ R)
/// ```
///
/// It is symmetric in (π, γ) and invariant under (tπ, γ / t).
///
/// ### Fields
///
/// * `feature_cost` - Feature cost per support entry.
/// * `geometry` - The geometry cost model.
/// * `source_weights` - Source point weights.
/// * `target_weights` - Target point weights.
/// * `reference` - `w_s ⊗ w_t` per support entry.
/// * `params` - The hyperparameters.
pub struct FusedObjective<'a> {
    pub feature_cost: &'a [f64],
    pub geometry: &'a GeometryCost,
    pub source_weights: &'a [f64],
    pub target_weights: &'a [f64],
    pub reference: Vec<f64>,
    pub params: &'a FugwParams,
}

impl<'a> FusedObjective<'a> {
    /// Generate the objective for a support
    ///
    /// ### Params
    ///
    /// * `plan` - Any plan on the support (only its support is used).
    /// * `feature_cost` - Feature cost per support entry.
    /// * `geometry` - The geometry cost model.
    /// * `source_weights` - Source point weights.
    /// * `target_weights` - Target point weights.
    /// * `params` - The hyperparameters.
    pub fn new(
        plan: &SparsePlan,
        feature_cost: &'a [f64],
        geometry: &'a GeometryCost,
        source_weights: &'a [f64],
        target_weights: &'a [f64],
        params: &'a FugwParams,
    ) -> Self {
        let reference = plan
            .support()
            .iter()
            .map(|(i, j)| source_weights[i] * target_weights[j])
            .collect();

        Self {
            feature_cost,
            geometry,
            source_weights,
            target_weights,
            reference,
            params,
        }
    }

    /// Geometry cost, skipped when the geometry term carries no weight
    fn geometry_cost(&self, plan: &SparsePlan) -> Vec<f64> {
        if self.params.alpha < 1.0 {
            self.geometry.evaluate(plan)
        } else {
            vec![0.0; plan.values().len()]
        }
    }

    /// Linearised cost of the block update with `fixed` frozen
    ///
    /// Returns `c(fixed) / m(fixed)` per support entry, so that the update is
    /// an unbalanced OT problem with the unscaled `ρ_s`, `ρ_t` and `ε`.
    ///
    /// ### Params
    ///
    /// * `fixed` - The plan held fixed.
    ///
    /// ### Returns
    ///
    /// Linear cost per support entry.
    pub fn local_cost(&self, fixed: &SparsePlan) -> Vec<f64> {
        let p = self.params;
        let values = fixed.values();
        let mass = fixed.mass();

        let feature_dot: f64 = dot(self.feature_cost, values);
        let geometry = self.geometry_cost(fixed);

        let constant = relaxation(p.rho_source, approx_kl(&fixed.row_sums(), self.source_weights))
            + relaxation(p.rho_target, approx_kl(&fixed.col_sums(), self.target_weights))
            + p.eps * approx_kl(values, &self.reference);

        let inv_mass = 1.0 / mass;

        self.feature_cost
            .par_iter()
            .zip(geometry.par_iter())
            .map(|(&cf, &cg)| {
                let wasserstein = 0.5 * p.alpha * (mass * cf + feature_dot);
                (wasserstein + (1.0 - p.alpha) * cg + constant) * inv_mass
            })
            .collect()
    }

    /// Evaluate the objective for a pair of plans on the same support
    ///
    /// ### Params
    ///
    /// * `pi` - First plan.
    /// * `gamma` - Second plan.
    ///
    /// ### Returns
    ///
    /// The `FugwLoss` breakdown.
    pub fn loss(&self, pi: &SparsePlan, gamma: &SparsePlan) -> FugwLoss {
        let p = self.params;
        let m_pi = pi.mass();
        let m_gamma = gamma.mass();

        let wasserstein = 0.5
            * p.alpha
            * (dot(self.feature_cost, pi.values()) * m_gamma
                + dot(self.feature_cost, gamma.values()) * m_pi);

        let gromov_wasserstein = if p.alpha < 1.0 {
            (1.0 - p.alpha) * dot(&self.geometry.evaluate(pi), gamma.values())
        } else {
            0.0
        };

        let marginal_source = relaxation(
            p.rho_source,
            quad_kl(
                &pi.row_sums(),
                &gamma.row_sums(),
                self.source_weights,
                self.source_weights,
            ),
        );
        let marginal_target = relaxation(
            p.rho_target,
            quad_kl(
                &pi.col_sums(),
                &gamma.col_sums(),
                self.target_weights,
                self.target_weights,
            ),
        );
        let entropic = p.eps * quad_kl(pi.values(), gamma.values(), &self.reference, &self.reference);

        FugwLoss {
            wasserstein,
            gromov_wasserstein,
            marginal_source,
            marginal_target,
            entropic,
            total: wasserstein + gromov_wasserstein + marginal_source + marginal_target + entropic,
        }
    }
}

/// Dot product of two entry-aligned slices
#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

///////////
// Tests //
///////////
