pub mod config;
pub mod snapshot;

#[cfg(feature = "gdal")]
pub mod raster;

pub use config::{DhdtConfig, SurveyEntry};
pub use snapshot::{persist_snapshot, restore_snapshot};

#[cfg(feature = "gdal")]
pub use raster::{RasterReader, RasterWriter};
