use faer::MatRef;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::core::base::utils::normalise_weights;
use crate::core::data::sparse_structures::{SparseCooMatrix, SparsePlan};
use crate::core::graph::knn::SupportRule;
use crate::core::methods::fugw::costs::{feature_cost, GeometryCost};
use crate::core::methods::fugw::losses::{FugwLoss, FusedObjective};
use crate::core::methods::fugw::params::FugwParams;
use crate::core::methods::fugw::scaling::{sinkhorn_log_sparse, DualPotentials, ScalingResult};
use crate::error::{FugwError, Result};

////////////////
// Structures //
////////////////

/// States of the block-coordinate optimiser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    /// Support, plan and potentials are being set up
    Initializing,
    /// Outer block-coordinate iterations are running
    Iterating,
    /// The relative decrease of the objective fell below `tol_bcd`
    Converged,
    /// The outer iteration cap was hit
    MaxItersReached,
    /// The objective increased beyond `divergence_margin`
    Diverged,
}

/// Result of a sparse FUGW fit
///
/// ### Fields
///
/// * `plan` - The fitted transport plan.
/// * `state` - Terminal state of the optimiser (`Converged` or
///   `MaxItersReached`).
/// * `n_iter` - Number of outer iterations run.
/// * `loss_history` - Objective after initialisation and after every outer
///   iteration.
/// * `duals` - Final potentials of the last plan update, for diagnostics and
///   warm starts. Not used by the fitted mapping.
#[derive(Debug, Clone)]
pub struct FugwFit {
    pub plan: SparsePlan,
    pub state: SolverState,
    pub n_iter: usize,
    pub loss_history: Vec<FugwLoss>,
    pub duals: DualPotentials,
}

impl FugwFit {
    /// The last evaluated objective
    pub fn final_loss(&self) -> Option<&FugwLoss> {
        self.loss_history.last()
    }
}

/////////////
// Helpers //
/////////////

/// Solve the scaling problem for one block with the other block frozen
fn block_update(
    objective: &FusedObjective,
    fixed: &SparsePlan,
    duals: DualPotentials,
    params: &FugwParams,
) -> ScalingResult {
    let cost = objective.local_cost(fixed);
    sinkhorn_log_sparse(
        &cost,
        fixed.support_arc(),
        objective.source_weights,
        objective.target_weights,
        duals,
        params,
    )
}

/// Rescale `(π, γ)` to `(tπ, γ / t)` so that both carry the same mass
///
/// The objective is invariant under this rescaling.
///
/// ### Returns
///
/// `false` if either mass is not strictly positive and finite.
fn equalise_masses(pi: &mut SparsePlan, gamma: &mut SparsePlan) -> bool {
    let m_pi = pi.mass();
    let m_gamma = gamma.mass();
    if !(m_pi > 0.0 && m_gamma > 0.0 && m_pi.is_finite() && m_gamma.is_finite()) {
        return false;
    }
    let t = (m_gamma / m_pi).sqrt();
    pi.scale(t);
    gamma.scale(1.0 / t);
    true
}

/// Error for non-finite values surfacing the last valid plan
fn instability(iteration: usize, last_plan: &SparsePlan) -> FugwError {
    warn!(
        "Non-finite values in sparse FUGW at outer iteration {}",
        iteration
    );
    FugwError::NumericalInstability {
        iteration,
        last_plan: Box::new(last_plan.clone()),
    }
}

////////////
// Solver //
////////////

/// Fit a sparse fused unbalanced Gromov-Wasserstein transport plan
///
/// Runs the block-coordinate optimiser: the pair (π, γ) is initialised to
/// the same plan, then each outer iteration updates γ with π frozen and π
/// with γ frozen, each time re-linearising the geometry cost and solving an
/// unbalanced scaling problem on the fixed support. After every block update
/// the two masses are equalised.
///
/// Shape, parameter and support errors are raised before any iteration.
///
/// ### Params
///
/// * `source_features` - Features with rows = features, columns = source
///   points.
/// * `target_features` - Features with rows = features, columns = target
///   points.
/// * `source_embedding` - Source geometry embedding with rows = points.
/// * `target_embedding` - Target geometry embedding with rows = points.
/// * `init_plan` - Optional initial plan. Its positive entries define the
///   support.
/// * `source_weights` - Optional source point weights (uniform if `None`).
/// * `target_weights` - Optional target point weights (uniform if `None`).
/// * `params` - The hyperparameters.
///
/// ### Returns
///
/// The `FugwFit`, or an error from the taxonomy in `crate::error`.
#[allow(clippy::too_many_arguments)]
pub fn fit_sparse_fugw(
    source_features: MatRef<f64>,
    target_features: MatRef<f64>,
    source_embedding: MatRef<f64>,
    target_embedding: MatRef<f64>,
    init_plan: Option<&SparseCooMatrix>,
    source_weights: Option<&[f64]>,
    target_weights: Option<&[f64]>,
    params: &FugwParams,
) -> Result<FugwFit> {
    let start_total = Instant::now();

    ////////////////////
    // Initialisation //
    ////////////////////

    let mut state = SolverState::Initializing;

    params.validate()?;

    let n_source = source_features.ncols();
    let n_target = target_features.ncols();

    crate::ensure_nrows!("feature dimension", source_features, target_features);
    crate::ensure_dim!("source embedding points", n_source, source_embedding.nrows());
    crate::ensure_dim!("target embedding points", n_target, target_embedding.nrows());

    let ws = normalise_weights(source_weights, n_source, "source_weights")?;
    let wt = normalise_weights(target_weights, n_target, "target_weights")?;

    let geometry = GeometryCost::new(source_embedding, target_embedding);

    let init = match init_plan {
        Some(coo) => SparsePlan::from_init_plan(coo, n_source, n_target)?,
        None => {
            let support = params
                .support_rule
                .build(geometry.source_embedding(), geometry.target_embedding())?;
            support.check_coverage()?;
            SparsePlan::product_on_support(Arc::new(support), &ws, &wt)
        }
    };

    let cf = feature_cost(
        source_features,
        target_features,
        init.support(),
        params.normalise_feature_cost,
    )?;

    info!(
        "Fitting sparse FUGW: {} source points, {} target points, {} support entries, rank {}",
        n_source,
        n_target,
        init.support().nnz(),
        geometry.rank()
    );

    let objective = FusedObjective::new(&init, &cf, &geometry, &ws, &wt, params);

    let mut pi = init;
    let mut gamma = pi.clone();
    let mut last_valid = pi.clone();
    let mut duals_pi = DualPotentials::zeros(n_source, n_target);
    let mut duals_gamma = DualPotentials::zeros(n_source, n_target);
    let mut loss_history: Vec<FugwLoss> = Vec::with_capacity(params.max_iter + 1);
    let mut n_iter = 0_usize;

    ////////////////////
    // State machine //
    ////////////////////

    loop {
        match state {
            SolverState::Initializing => {
                let loss = objective.loss(&pi, &gamma);
                if !loss.total.is_finite() {
                    return Err(instability(0, &pi));
                }
                debug!("Sparse FUGW initial objective {:.6e}", loss.total);
                loss_history.push(loss);
                state = SolverState::Iterating;
            }
            SolverState::Iterating => {
                let start_iter = Instant::now();
                n_iter += 1;
                last_valid.clone_from(&pi);

                let gamma_step = block_update(&objective, &pi, duals_gamma, params);
                if !gamma_step.is_finite() {
                    return Err(instability(n_iter, &last_valid));
                }
                duals_gamma = gamma_step.duals;
                gamma = gamma_step.plan;
                if !equalise_masses(&mut pi, &mut gamma) {
                    return Err(instability(n_iter, &last_valid));
                }

                let pi_step = block_update(&objective, &gamma, duals_pi, params);
                if !pi_step.is_finite() {
                    return Err(instability(n_iter, &last_valid));
                }
                duals_pi = pi_step.duals;
                pi = pi_step.plan;
                if !equalise_masses(&mut pi, &mut gamma) {
                    return Err(instability(n_iter, &last_valid));
                }

                let loss = objective.loss(&pi, &gamma);
                if !loss.total.is_finite() {
                    return Err(instability(n_iter, &last_valid));
                }

                let previous = loss_history.last().map_or(loss.total, |l| l.total);
                let reference = previous.abs().max(1e-12);
                loss_history.push(loss);

                debug!(
                    " Sparse FUGW iteration {}/{}: objective {:.6e} (scaling iters {} / {}) in {:.2?}",
                    n_iter,
                    params.max_iter,
                    loss.total,
                    gamma_step.n_iter,
                    pi_step.n_iter,
                    start_iter.elapsed()
                );

                if loss.total > previous + params.divergence_margin * reference {
                    state = SolverState::Diverged;
                } else if (previous - loss.total) / reference < params.tol_bcd {
                    state = SolverState::Converged;
                } else if n_iter >= params.max_iter {
                    state = SolverState::MaxItersReached;
                }
            }
            SolverState::Diverged => {
                let current = loss_history[loss_history.len() - 1].total;
                let previous = loss_history[loss_history.len() - 2].total;
                warn!(
                    "Sparse FUGW diverged at iteration {}: {:.6e} -> {:.6e}",
                    n_iter, previous, current
                );
                return Err(FugwError::SolverDiverged {
                    iteration: n_iter,
                    previous,
                    current,
                    last_plan: Box::new(last_valid),
                });
            }
            SolverState::Converged | SolverState::MaxItersReached => break,
        }
    }

    info!(
        "Sparse FUGW finished after {} iterations ({:?}) in {:.2?}",
        n_iter,
        state,
        start_total.elapsed()
    );

    Ok(FugwFit {
        plan: pi,
        state,
        n_iter,
        loss_history,
        duals: duals_pi,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{generate_domain, random_sparse_init_plan};
    use crate::core::graph::knn::KnnRule;
    use crate::error::Domain;

    #[test]
    fn test_fit_default_scenario() {
        let source = generate_domain(10, 105, 3, 100);
        let target = generate_domain(10, 95, 3, 101);

        let fit = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &FugwParams::default(),
        )
        .unwrap();

        assert!(matches!(
            fit.state,
            SolverState::Converged | SolverState::MaxItersReached
        ));
        assert!(fit.n_iter >= 1 && fit.n_iter <= FugwParams::default().max_iter);
        assert_eq!(fit.loss_history.len(), fit.n_iter + 1);
        assert!(fit.plan.values().iter().all(|&v| v >= 0.0 && v.is_finite()));
        assert!(fit.plan.mass() > 0.0);
    }

    #[test]
    fn test_objective_is_monotone() {
        let source = generate_domain(5, 40, 3, 1);
        let target = generate_domain(5, 30, 3, 2);
        let params = FugwParams::default()
            .with_max_iter(8)
            .with_scaling(3000, 1e-10);

        let fit = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &params,
        )
        .unwrap();

        for pair in fit.loss_history.windows(2) {
            let tolerance = 1e-5 * pair[0].total.abs().max(1e-12);
            assert!(
                pair[1].total <= pair[0].total + tolerance,
                "objective increased: {:?}",
                fit.loss_history.iter().map(|l| l.total).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_fit_respects_init_plan_support() {
        let source = generate_domain(10, 105, 3, 3);
        let target = generate_domain(10, 95, 3, 4);
        let init = random_sparse_init_plan(105, 95, 3, 5);

        let fit = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            Some(&init),
            None,
            None,
            &FugwParams::default(),
        )
        .unwrap();

        assert_eq!(fit.plan.support().nnz(), 315);
        for (i, j, v) in fit.plan.iter() {
            let in_init = init
                .rows
                .iter()
                .zip(init.cols.iter())
                .any(|(&r, &c)| r == i && c == j);
            assert!(in_init);
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn test_dimension_mismatch_before_iterating() {
        let source = generate_domain(10, 20, 3, 6);
        let target = generate_domain(8, 15, 3, 7);

        let res = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &FugwParams::default(),
        );

        match res {
            Err(FugwError::DimensionMismatch {
                what,
                expected,
                found,
            }) => {
                assert_eq!(what, "feature dimension");
                assert_eq!(expected, 10);
                assert_eq!(found, 8);
            }
            other => panic!("unexpected result: {:?}", other.map(|f| f.state)),
        }
    }

    #[test]
    fn test_embedding_mismatch() {
        let source = generate_domain(4, 20, 3, 8);
        let target = generate_domain(4, 15, 3, 9);

        let res = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            target.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &FugwParams::default(),
        );
        assert!(matches!(res, Err(FugwError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_empty_support_boundary() {
        let source = generate_domain(4, 20, 3, 10);
        let target = generate_domain(4, 15, 3, 11);
        let params = FugwParams::default().with_support_rule(KnnRule::new(5, Some(1e-9)));

        let res = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &params,
        );

        assert!(matches!(
            res,
            Err(FugwError::EmptySupport {
                domain: Domain::Source,
                index: 0
            })
        ));
    }

    #[test]
    fn test_empty_support_with_default_rule() {
        let mut source = generate_domain(4, 20, 3, 18);
        let target = generate_domain(4, 15, 3, 19);
        source.embedding[(0, 0)] = f64::NAN;

        let res = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &FugwParams::default(),
        );

        assert!(matches!(
            res,
            Err(FugwError::EmptySupport {
                domain: Domain::Source,
                index: 0
            })
        ));
    }

    #[test]
    fn test_numerical_instability_surfaces_last_plan() {
        let mut source = generate_domain(4, 20, 3, 12);
        let target = generate_domain(4, 15, 3, 13);
        source.features[(0, 0)] = 1e200;

        let res = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &FugwParams::default(),
        );

        match res {
            Err(err @ FugwError::NumericalInstability { .. }) => {
                let plan = err.last_plan().unwrap();
                assert!(plan.is_finite());
            }
            other => panic!("unexpected result: {:?}", other.map(|f| f.state)),
        }
    }

    #[test]
    fn test_divergence_guard() {
        // zero margin and one scaling step per block update: the objective
        // rises on the first outer iteration
        let source = generate_domain(3, 12, 2, 14);
        let target = generate_domain(3, 10, 2, 15);
        let params = FugwParams::default()
            .with_divergence_margin(0.0)
            .with_tol_bcd(0.0)
            .with_scaling(1, 0.0)
            .with_max_iter(50);

        let res = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            None,
            None,
            &params,
        );

        match res {
            Err(FugwError::SolverDiverged {
                iteration,
                previous,
                current,
                last_plan,
            }) => {
                assert_eq!(iteration, 1);
                assert!(current > previous);
                assert!(last_plan.is_finite());
                assert_eq!(last_plan.support().n_source(), 12);
            }
            other => panic!("expected divergence, got {:?}", other.map(|f| f.state)),
        }
    }

    #[test]
    fn test_weighted_fit() {
        let source = generate_domain(4, 20, 3, 16);
        let target = generate_domain(4, 15, 3, 17);
        let ws: Vec<f64> = (0..20).map(|i| 1.0 + i as f64).collect();

        let fit = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            Some(&ws),
            None,
            &FugwParams::default(),
        )
        .unwrap();
        assert!(fit.plan.is_finite());

        let bad = fit_sparse_fugw(
            source.features.as_ref(),
            target.features.as_ref(),
            source.embedding.as_ref(),
            target.embedding.as_ref(),
            None,
            Some(&ws[..5]),
            None,
            &FugwParams::default(),
        );
        assert!(matches!(bad, Err(FugwError::DimensionMismatch { .. })));
    }
}
