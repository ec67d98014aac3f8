use std::fmt;
use thiserror::Error;

use crate::core::data::sparse_structures::SparsePlan;

/// Which side of the alignment a point belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// The source domain (rows of the plan)
    Source,
    /// The target domain (columns of the plan)
    Target,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Source => write!(f, "source"),
            Domain::Target => write!(f, "target"),
        }
    }
}

/// Errors raised by the sparse FUGW solver and the fitted mapping
#[derive(Debug, Error)]
pub enum FugwError {
    /// A point of one domain has no eligible partner in the other domain
    #[error("{domain} point {index} has no eligible partner in the support")]
    EmptySupport { domain: Domain, index: usize },

    /// Feature, embedding, weight or plan shapes are inconsistent
    #[error("dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// The surrogate objective increased beyond the divergence margin
    #[error(
        "solver diverged at iteration {iteration}: objective went from {previous:.6e} to {current:.6e}"
    )]
    SolverDiverged {
        iteration: usize,
        previous: f64,
        current: f64,
        last_plan: Box<SparsePlan>,
    },

    /// `transform` or `score` called before a successful fit
    #[error("the mapping has not been fitted yet")]
    NotFitted,

    /// Non-finite values appeared during the scaling iterations
    #[error("non-finite values produced at outer iteration {iteration}")]
    NumericalInstability {
        iteration: usize,
        last_plan: Box<SparsePlan>,
    },

    /// A hyperparameter, weight vector or initial plan value is out of range
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl FugwError {
    /// Helper to generate an `InvalidParameter` error
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        FugwError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// The last valid plan, if the error carries one for diagnostics
    pub fn last_plan(&self) -> Option<&SparsePlan> {
        match self {
            FugwError::SolverDiverged { last_plan, .. }
            | FugwError::NumericalInstability { last_plan, .. } => Some(last_plan),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FugwError>;
