//! The Rust <> R interface. Only compiled with the `r` feature.

pub mod r_doublets;
