//! Crate-wide helper macros

pub mod macros;
