//! Module containing basic numerical helpers shared by the solver

pub mod utils;
