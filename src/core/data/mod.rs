//! Module containing the sparse data structures and the synthetic data
//! generators

pub mod sparse_structures;
pub mod synthetic_data;
