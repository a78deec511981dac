//! Request guards applied ahead of the session layer.

pub mod blacklist;
