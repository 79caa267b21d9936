pub mod density_scoring;
pub mod doublet_density;
pub mod doublet_simulation;
pub mod doublet_thresholding;
