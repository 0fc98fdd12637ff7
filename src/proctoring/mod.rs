pub mod classifier;
pub mod risk;
