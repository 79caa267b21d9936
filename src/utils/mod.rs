//! Crate-wide error type, checking macros and the R interface helpers.

pub mod errors;
pub mod macros;
#[cfg(feature = "r")]
pub mod r_rust_interface;
