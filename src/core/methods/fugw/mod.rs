//! Sparse fused unbalanced Gromov-Wasserstein transport
//!
//! `params` holds the hyperparameters, `costs` the feature and low-rank
//! geometry costs, `losses` the surrogate objective, `scaling` the log-domain
//! Sinkhorn inner loop, `solver` the block-coordinate outer loop and `mapping`
//! the fitted model with its transform and score.

pub mod costs;
pub mod losses;
pub mod mapping;
pub mod params;
pub mod scaling;
pub mod solver;
