use chrono::NaiveDate;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// No-data value written to every unset or invalid output cell
pub const NO_DATA: f64 = -9999.0;

/// Fill value for resampled cells that fall outside the source survey
pub const OUT_OF_RANGE: f64 = -9999.0;

/// Days per year used to annualize per-day rates
pub const DAYS_PER_YEAR: f64 = 365.25;

/// 2D elevation data (rows x columns)
pub type ElevationGrid = Array2<f32>;

/// 2D double-precision output grid (rows x columns)
pub type ValueGrid = Array2<f64>;

/// 2D validity mask; true where a rate estimate may be attempted
pub type ValidityMask = Array2<bool>;

/// 3D elevation stack (rows x columns x surveys)
pub type ElevationCube = Array3<f32>;

/// Geospatial transformation parameters (GDAL ordering, north-up grids)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Axis-aligned transform; `pixel_height` is usually negative
    pub fn new(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    /// Build from `[ulx, xres, xskew, uly, yskew, yres]`
    pub fn from_gdal(coeffs: [f64; 6]) -> Self {
        Self {
            top_left_x: coeffs[0],
            pixel_width: coeffs[1],
            rotation_x: coeffs[2],
            top_left_y: coeffs[3],
            rotation_y: coeffs[4],
            pixel_height: coeffs[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// X coordinate of a column's sample point (upper-left corner convention)
    pub fn column_x(&self, col: usize) -> f64 {
        self.top_left_x + col as f64 * self.pixel_width
    }

    /// Y coordinate of a row's sample point (upper-left corner convention)
    pub fn row_y(&self, row: usize) -> f64 {
        self.top_left_y + row as f64 * self.pixel_height
    }
}

/// Rectangular footprint: upper-left and lower-right corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub ulx: f64,
    pub uly: f64,
    pub lrx: f64,
    pub lry: f64,
}

impl Extent {
    pub fn min_x(&self) -> f64 {
        self.ulx.min(self.lrx)
    }

    pub fn max_x(&self) -> f64 {
        self.ulx.max(self.lrx)
    }

    pub fn min_y(&self) -> f64 {
        self.uly.min(self.lry)
    }

    pub fn max_y(&self) -> f64 {
        self.uly.max(self.lry)
    }

    /// True when the two footprints overlap or touch
    pub fn intersects(&self, other: &Extent) -> bool {
        self.min_x() <= other.max_x()
            && other.min_x() <= self.max_x()
            && self.min_y() <= other.max_y()
            && other.min_y() <= self.max_y()
    }
}

/// Pixel grid: geotransform plus dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
}

impl GridGeometry {
    pub fn new(transform: GeoTransform, rows: usize, cols: usize) -> Self {
        Self { transform, rows, cols }
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn extent(&self) -> Extent {
        let t = &self.transform;
        Extent {
            ulx: t.top_left_x,
            uly: t.top_left_y,
            lrx: t.top_left_x + self.cols as f64 * t.pixel_width,
            lry: t.top_left_y + self.rows as f64 * t.pixel_height,
        }
    }

    /// Sample x coordinates of every column, from `ulx` to `lrx - xres`
    pub fn column_coordinates(&self) -> Vec<f64> {
        (0..self.cols).map(|c| self.transform.column_x(c)).collect()
    }

    /// Sample y coordinates of every row, from `uly` to `lry - yres`
    pub fn row_coordinates(&self) -> Vec<f64> {
        (0..self.rows).map(|r| self.transform.row_y(r)).collect()
    }
}

/// One elevation survey: values, geometry, capture date and uncertainty
#[derive(Debug, Clone)]
pub struct Survey {
    pub label: String,
    pub data: ElevationGrid,
    pub transform: GeoTransform,
    pub no_data: Option<f64>,
    pub date: NaiveDate,
    /// 1-sigma uncertainty, same unit as elevation
    pub uncertainty: f64,
}

impl Survey {
    pub fn new(data: ElevationGrid, transform: GeoTransform, date: NaiveDate, uncertainty: f64) -> Self {
        Self {
            label: date.format("%Y-%m-%d").to_string(),
            data,
            transform,
            no_data: None,
            date,
            uncertainty,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_no_data(mut self, no_data: Option<f64>) -> Self {
        self.no_data = no_data;
        self
    }

    pub fn geometry(&self) -> GridGeometry {
        let (rows, cols) = self.data.dim();
        GridGeometry::new(self.transform, rows, cols)
    }
}

/// Target sampling geometry shared by every aligned slice and output grid
#[derive(Debug, Clone)]
pub struct ReferenceGrid {
    pub geometry: GridGeometry,
    pub mask: ValidityMask,
    pub no_data: Option<f64>,
    /// WKT projection carried through to the output rasters
    pub projection: Option<String>,
}

impl ReferenceGrid {
    pub fn new(transform: GeoTransform, mask: ValidityMask) -> Self {
        let (rows, cols) = mask.dim();
        Self {
            geometry: GridGeometry::new(transform, rows, cols),
            mask,
            no_data: None,
            projection: None,
        }
    }

    /// Every non-zero cell of `values` is valid, as is NaN
    pub fn from_values(values: &ElevationGrid, transform: GeoTransform) -> Self {
        Self::new(transform, values.mapv(|v| v != 0.0))
    }

    pub fn dim(&self) -> (usize, usize) {
        self.geometry.dim()
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// No-data value for written grids
    pub fn output_no_data(&self) -> f64 {
        self.no_data.unwrap_or(NO_DATA)
    }
}

/// One (time offset, uncertainty, value) record of a pixel series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Days since the reference date; negative before it
    pub date: i64,
    pub uncertainty: f64,
    pub value: f64,
}

/// Observations accumulated for one pixel, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelSeries {
    observations: Vec<Observation>,
}

impl PixelSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_observations(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.observations.iter()
    }

    pub fn last(&self) -> Option<&Observation> {
        self.observations.last()
    }

    /// Number of distinct time offsets
    pub fn distinct_dates(&self) -> usize {
        let mut dates: Vec<i64> = self.observations.iter().map(|o| o.date).collect();
        dates.sort_unstable();
        dates.dedup();
        dates.len()
    }

    /// Range of time offsets in days (max - min), 0 when empty
    pub fn date_span(&self) -> i64 {
        let min = self.observations.iter().map(|o| o.date).min();
        let max = self.observations.iter().map(|o| o.date).max();
        match (min, max) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        }
    }
}

/// Per-pixel outputs of the store fit
#[derive(Debug, Clone)]
pub struct FitGrids {
    /// Rate of elevation change, units/year
    pub slope: ValueGrid,
    pub slope_err: ValueGrid,
    pub residual: ValueGrid,
    pub count: ValueGrid,
}

impl FitGrids {
    /// Rate/error/residual start at NO_DATA, count at zero
    pub fn new(dim: (usize, usize)) -> Self {
        Self {
            slope: Array2::from_elem(dim, NO_DATA),
            slope_err: Array2::from_elem(dim, NO_DATA),
            residual: Array2::from_elem(dim, NO_DATA),
            count: Array2::zeros(dim),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.slope.dim()
    }
}

/// Outputs of the dense stack fit; unfitted cells hold NaN
#[derive(Debug, Clone)]
pub struct StackFitGrids {
    pub slope: ValueGrid,
    pub intercept: ValueGrid,
    pub slope_err: ValueGrid,
    pub intercept_err: ValueGrid,
}

/// Parse a survey date in `YYYY-MM-DD`, `YYYYMMDD` or `YYMMMDD` (e.g. `16Jul27`) form
pub fn parse_survey_date(date: &str) -> DhdtResult<NaiveDate> {
    let date = date.trim();
    let format = match date.len() {
        10 => "%Y-%m-%d",
        8 => "%Y%m%d",
        7 => "%y%b%d",
        _ => {
            return Err(DhdtError::InvalidDate(format!(
                "unsupported date string '{}'; use YYYY-MM-DD, YYYYMMDD, or YYMMMDD",
                date
            )))
        }
    };

    NaiveDate::parse_from_str(date, format)
        .map_err(|e| DhdtError::InvalidDate(format!("'{}' ({}): {}", date, format, e)))
}

/// Parse a reference date, which must be `YYYY-MM-DD`
pub fn parse_reference_date(date: &str) -> DhdtResult<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| DhdtError::InvalidDate(format!("reference date '{}': {}", date, e)))
}

/// Error types for dh/dt processing
#[derive(Debug, thiserror::Error)]
pub enum DhdtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Grid size mismatch: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Singular weighted fit: {0}")]
    SingularFit(String),

    #[error("Snapshot serialization error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for dh/dt operations
pub type DhdtResult<T> = Result<T, DhdtError>;
