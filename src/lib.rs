//! dempile: per-pixel rates of surface-elevation change (dh/dt)
//!
//! Piles up a time-ordered set of partially overlapping elevation surveys on a
//! common reference grid and fits a weighted linear trend at every pixel.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    DhdtError, DhdtResult, FitGrids, GeoTransform, GridGeometry, Observation, PixelSeries, ReferenceGrid,
    StackFitGrids, Survey, NO_DATA,
};

pub use crate::core::{DemPile, PixelTimeSeriesStore, ResampleMethod, Resampler, TimeSeriesStack, WeightedRegression};
pub use io::DhdtConfig;
