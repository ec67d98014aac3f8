use std::sync::Arc;

use crate::core::graph::knn::{KnnRule, SupportRule};
use crate::error::{FugwError, Result};

////////////
// Params //
////////////

/// Structure to store the sparse FUGW hyperparameters
///
/// Fixed for the lifetime of one `fit` call and passed explicitly to every
/// component.
///
/// ### Fields
///
/// **Objective:**
///
/// * `alpha` - Fusion weight in `[0, 1]`. `alpha` weighs the feature
///   (Wasserstein) cost, `1 - alpha` the geometry (Gromov-Wasserstein) cost.
/// * `rho_source` - KL relaxation weight on the source marginal. `f64::INFINITY`
///   enforces the marginal, `0` ignores it.
/// * `rho_target` - KL relaxation weight on the target marginal.
/// * `eps` - Entropic regularisation strength. Must be `> 0`.
/// * `normalise_feature_cost` - Divide the feature cost by its maximum over the
///   support.
///
/// **Block-coordinate loop:**
///
/// * `max_iter` - Maximum number of outer iterations.
/// * `tol_bcd` - Stop when the relative decrease of the objective falls below
///   this value.
/// * `divergence_margin` - Relative increase of the objective after which the
///   solver is considered diverged.
///
/// **Scaling loop:**
///
/// * `max_scaling_iter` - Maximum number of scaling iterations per update.
/// * `tol_scaling` - Stop when the relative change of both dual potentials
///   falls below this value.
///
/// **Support:**
///
/// * `support_rule` - Neighbour rule used when no initial plan is given.
#[derive(Clone, Debug)]
pub struct FugwParams {
    // objective
    pub alpha: f64,
    pub rho_source: f64,
    pub rho_target: f64,
    pub eps: f64,
    pub normalise_feature_cost: bool,
    // outer loop
    pub max_iter: usize,
    pub tol_bcd: f64,
    pub divergence_margin: f64,
    // scaling
    pub max_scaling_iter: usize,
    pub tol_scaling: f64,
    // support
    pub support_rule: Arc<dyn SupportRule>,
}

impl Default for FugwParams {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            rho_source: 1.0,
            rho_target: 1.0,
            eps: 1e-2,
            normalise_feature_cost: true,
            max_iter: 10,
            tol_bcd: 1e-7,
            divergence_margin: 0.1,
            max_scaling_iter: 1000,
            tol_scaling: 1e-6,
            support_rule: Arc::new(KnnRule::default()),
        }
    }
}

impl FugwParams {
    /// Create a new set of parameters with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fusion weight
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the same marginal relaxation on both sides
    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho_source = rho;
        self.rho_target = rho;
        self
    }

    /// Set the marginal relaxation per side
    pub fn with_rhos(mut self, rho_source: f64, rho_target: f64) -> Self {
        self.rho_source = rho_source;
        self.rho_target = rho_target;
        self
    }

    /// Set the entropic regularisation
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Set the outer iteration cap
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set the outer convergence tolerance
    pub fn with_tol_bcd(mut self, tol: f64) -> Self {
        self.tol_bcd = tol;
        self
    }

    /// Set the divergence guard
    pub fn with_divergence_margin(mut self, margin: f64) -> Self {
        self.divergence_margin = margin;
        self
    }

    /// Set the scaling iteration cap and tolerance
    pub fn with_scaling(mut self, max_iter: usize, tol: f64) -> Self {
        self.max_scaling_iter = max_iter;
        self.tol_scaling = tol;
        self
    }

    /// Toggle divide-by-max normalisation of the feature cost
    pub fn with_feature_cost_normalisation(mut self, normalise: bool) -> Self {
        self.normalise_feature_cost = normalise;
        self
    }

    /// Set the neighbour rule used to build the support
    pub fn with_support_rule<R: SupportRule + 'static>(mut self, rule: R) -> Self {
        self.support_rule = Arc::new(rule);
        self
    }

    /// Validate the parameters
    ///
    /// ### Returns
    ///
    /// `InvalidParameter` for the first out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(FugwError::invalid_parameter("alpha", "must lie in [0, 1]"));
        }
        if self.rho_source.is_nan() || self.rho_source < 0.0 {
            return Err(FugwError::invalid_parameter("rho_source", "must be >= 0"));
        }
        if self.rho_target.is_nan() || self.rho_target < 0.0 {
            return Err(FugwError::invalid_parameter("rho_target", "must be >= 0"));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(FugwError::invalid_parameter("eps", "must be finite and > 0"));
        }
        if self.max_iter == 0 {
            return Err(FugwError::invalid_parameter("max_iter", "must be > 0"));
        }
        if self.tol_bcd.is_nan() || self.tol_bcd < 0.0 {
            return Err(FugwError::invalid_parameter("tol_bcd", "must be >= 0"));
        }
        if self.divergence_margin.is_nan() || self.divergence_margin < 0.0 {
            return Err(FugwError::invalid_parameter(
                "divergence_margin",
                "must be >= 0",
            ));
        }
        if self.max_scaling_iter == 0 {
            return Err(FugwError::invalid_parameter("max_scaling_iter", "must be > 0"));
        }
        if self.tol_scaling.is_nan() || self.tol_scaling < 0.0 {
            return Err(FugwError::invalid_parameter("tol_scaling", "must be >= 0"));
        }
        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        assert!(FugwParams::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_params() {
        let cases = [
            FugwParams::new().with_alpha(1.5),
            FugwParams::new().with_rho(-1.0),
            FugwParams::new().with_eps(0.0),
            FugwParams::new().with_eps(f64::INFINITY),
            FugwParams::new().with_max_iter(0),
            FugwParams::new().with_scaling(0, 1e-6),
            FugwParams::new().with_divergence_margin(-0.1),
        ];
        for params in cases {
            assert!(matches!(
                params.validate(),
                Err(FugwError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn test_balanced_marginals_are_valid() {
        let params = FugwParams::new().with_rhos(f64::INFINITY, 0.0);
        assert!(params.validate().is_ok());
    }
}
