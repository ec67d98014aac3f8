//! Neighbour graphs used to define the transport support

pub mod knn;
