//! Numerical core of the sparse FUGW solver

pub mod base;
pub mod data;
pub mod graph;
pub mod methods;
