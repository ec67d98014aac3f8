//! Sparse fused unbalanced Gromov-Wasserstein (FUGW) transport.
//!
//! Aligns a source and a target domain, each given as a feature matrix
//! (features x points) and a low-rank geometry embedding (points x rank), by a
//! transport plan restricted to a sparse support of candidate pairs. The plan
//! is then used to map new observations between the two domains.

pub mod core;
pub mod error;
pub mod utils;

pub use crate::core::data::sparse_structures::{SparseCooMatrix, SparsePlan, Support};
pub use crate::core::graph::knn::{KnnRule, SupportRule};
pub use crate::core::methods::fugw::losses::FugwLoss;
pub use crate::core::methods::fugw::mapping::FugwSparse;
pub use crate::core::methods::fugw::params::FugwParams;
pub use crate::core::methods::fugw::solver::{fit_sparse_fugw, FugwFit, SolverState};
pub use crate::error::{Domain, FugwError, Result};
