//! Transport methods

pub mod fugw;
