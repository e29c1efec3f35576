//! Core dh/dt processing modules

pub mod pile;
pub mod regression;
pub mod resample;
pub mod stack;

// Re-export main types
pub use pile::{DemPile, PixelTimeSeriesStore};
pub use regression::{weighted_line_fit, LineFit, PixelFit, RegressionParams, WeightedRegression};
pub use resample::{resample_array, ResampleMethod, Resampler};
pub use stack::{StackFitParams, StackMetadata, TimeSeriesStack};
