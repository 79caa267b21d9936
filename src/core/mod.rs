//! Generic numerical building blocks that are not specific to doublets.

pub mod base;
pub mod data;
pub mod graph;
