use crate::core::regression::{PixelFit, WeightedRegression};
use crate::core::resample::{ResampleMethod, Resampler};
use crate::types::{
    parse_reference_date, DhdtError, DhdtResult, FitGrids, Observation, PixelSeries, ReferenceGrid, Survey,
    ValidityMask, NO_DATA,
};
use chrono::NaiveDate;
use ndarray::Array2;
use num_traits::Float;
use std::path::PathBuf;
use std::time::Instant;

/// Per-pixel observation series for every cell of the reference grid.
///
/// Cells are stored row-major in one flat vector; an empty series holds no
/// heap allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelTimeSeriesStore {
    rows: usize,
    cols: usize,
    series: Vec<PixelSeries>,
}

impl PixelTimeSeriesStore {
    /// One empty series per cell
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            series: vec![PixelSeries::new(); rows * cols],
        }
    }

    /// Empty store shaped like the reference grid
    pub fn initialize(reference: &ReferenceGrid) -> Self {
        let (rows, cols) = reference.dim();
        log::info!(
            "Total number of pixels to be processed: {}",
            reference.valid_pixel_count()
        );
        Self::new(rows, cols)
    }

    /// Rebuild from row-major series, e.g. a restored snapshot
    pub fn from_series(rows: usize, cols: usize, series: Vec<PixelSeries>) -> DhdtResult<Self> {
        if series.len() != rows * cols {
            return Err(DhdtError::InvalidFormat(format!(
                "{} series cannot fill a {}x{} grid",
                series.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, series })
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&PixelSeries> {
        if row < self.rows && col < self.cols {
            self.series.get(row * self.cols + col)
        } else {
            None
        }
    }

    /// All series in row-major order
    pub fn series(&self) -> &[PixelSeries] {
        &self.series
    }

    pub fn total_observations(&self) -> usize {
        self.series.iter().map(PixelSeries::len).sum()
    }

    /// Resample each survey onto the reference grid and append one observation
    /// per valid cell. Surveys should be sorted by ascending date.
    pub fn accumulate(
        &mut self,
        surveys: &[Survey],
        reference: &ReferenceGrid,
        reference_date: NaiveDate,
        resampler: &Resampler,
    ) -> DhdtResult<()> {
        self.check_dim(reference.dim())?;

        for (i, survey) in surveys.iter().enumerate() {
            let offset = survey.date.signed_duration_since(reference_date).num_days();
            log::info!("{}) {} (offset {} days)", i + 1, survey.label, offset);

            let aligned = resampler.resample_survey(survey, &reference.geometry)?;
            let appended = self.accumulate_slice(&aligned, &reference.mask, offset, survey.uncertainty)?;
            log::debug!("Appended {} observations from {}", appended, survey.label);
        }
        Ok(())
    }

    /// Append one aligned slice: every cell that is strictly positive and
    /// valid in `mask` receives `(offset, uncertainty, value)`.
    /// Returns the number of observations appended.
    pub fn accumulate_slice<T>(
        &mut self,
        aligned: &Array2<T>,
        mask: &ValidityMask,
        offset: i64,
        uncertainty: f64,
    ) -> DhdtResult<usize>
    where
        T: Float + Send + Sync,
    {
        self.check_dim(aligned.dim())?;
        self.check_dim(mask.dim())?;
        let cols = self.cols;
        let zero = T::zero();

        let append_row = |row: usize, row_series: &mut [PixelSeries]| -> usize {
            let mut appended = 0;
            for (col, series) in row_series.iter_mut().enumerate() {
                let value = aligned[[row, col]];
                if value > zero && mask[[row, col]] {
                    series.push(Observation {
                        date: offset,
                        uncertainty,
                        value: value.to_f64().unwrap_or(f64::NAN),
                    });
                    appended += 1;
                }
            }
            appended
        };

        if cols == 0 {
            return Ok(0);
        }

        #[cfg(feature = "parallel")]
        let appended = {
            use rayon::prelude::*;
            self.series
                .par_chunks_mut(cols)
                .enumerate()
                .map(|(row, row_series)| append_row(row, row_series))
                .sum()
        };

        #[cfg(not(feature = "parallel"))]
        let appended = self
            .series
            .chunks_mut(cols)
            .enumerate()
            .map(|(row, row_series)| append_row(row, row_series))
            .sum();

        Ok(appended)
    }

    /// Fit every pixel. Counts outside `mask` are forced to [`NO_DATA`];
    /// pixels whose fit fails numerically keep [`NO_DATA`] outputs.
    pub fn polyfit(&self, mask: &ValidityMask, regression: &WeightedRegression) -> DhdtResult<FitGrids> {
        self.check_dim(mask.dim())?;
        let mut fitdata = FitGrids::new(self.dim());
        if self.series.is_empty() {
            return Ok(fitdata);
        }

        log::info!("Fitting {} rows of {} pixels", self.rows, self.cols);
        let cols = self.cols;

        let fit_row = |row: usize, row_series: &[PixelSeries]| -> Vec<PixelFit> {
            if row % 100 == 0 {
                log::info!("Fitting row {} of {}", row, self.rows);
            }
            row_series
                .iter()
                .enumerate()
                .map(|(col, series)| match regression.fit_pixel(series) {
                    Ok(fit) => fit,
                    Err(e) => {
                        log::warn!("Skipping pixel ({}, {}): {}", row, col, e);
                        PixelFit::unfitted(series.len())
                    }
                })
                .collect()
        };

        #[cfg(feature = "parallel")]
        let fits: Vec<Vec<PixelFit>> = {
            use rayon::prelude::*;
            self.series
                .par_chunks(cols)
                .enumerate()
                .map(|(row, row_series)| fit_row(row, row_series))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let fits: Vec<Vec<PixelFit>> = self
            .series
            .chunks(cols)
            .enumerate()
            .map(|(row, row_series)| fit_row(row, row_series))
            .collect();

        for (row, row_fits) in fits.into_iter().enumerate() {
            for (col, fit) in row_fits.into_iter().enumerate() {
                fitdata.count[[row, col]] = fit.count as f64;
                if fit.is_fitted() {
                    fitdata.slope[[row, col]] = fit.rate;
                    fitdata.slope_err[[row, col]] = fit.rate_error;
                    fitdata.residual[[row, col]] = fit.residual;
                }
            }
        }

        fitdata
            .count
            .zip_mut_with(mask, |count, &valid| {
                if !valid {
                    *count = NO_DATA;
                }
            });

        Ok(fitdata)
    }

    fn check_dim(&self, found: (usize, usize)) -> DhdtResult<()> {
        if found != self.dim() {
            return Err(DhdtError::ShapeMismatch {
                expected: self.dim(),
                found,
            });
        }
        Ok(())
    }
}

/// Drives a complete dh/dt run: collects surveys, piles them up on the
/// reference grid, and fits a rate at every pixel.
#[derive(Debug, Default)]
pub struct DemPile {
    pub snapshot_path: Option<PathBuf>,
    pub dhdt_prefix: Option<String>,
    dems: Vec<Survey>,
    refdate: Option<NaiveDate>,
    refgeo: Option<ReferenceGrid>,
    ts: Option<PixelTimeSeriesStore>,
    fitdata: Option<FitGrids>,
    resampler: Resampler,
    regression: WeightedRegression,
}

impl DemPile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resample_method(mut self, method: ResampleMethod) -> Self {
        self.resampler = Resampler::new(method);
        self
    }

    pub fn with_regression(mut self, regression: WeightedRegression) -> Self {
        self.regression = regression;
        self
    }

    pub fn add_dem(&mut self, dem: Survey) {
        self.dems.push(dem);
    }

    pub fn add_dems(&mut self, dems: impl IntoIterator<Item = Survey>) {
        self.dems.extend(dems);
    }

    /// Stable sort by ascending capture date
    pub fn sort_by_date(&mut self) {
        self.dems.sort_by_key(|dem| dem.date);
    }

    pub fn dems(&self) -> &[Survey] {
        &self.dems
    }

    pub fn set_ref_geo(&mut self, refgeo: ReferenceGrid) {
        self.refgeo = Some(refgeo);
    }

    pub fn ref_geo(&self) -> Option<&ReferenceGrid> {
        self.refgeo.as_ref()
    }

    pub fn set_ref_date(&mut self, date: NaiveDate) {
        self.refdate = Some(date);
    }

    /// Set the reference date from a `YYYY-MM-DD` string
    pub fn set_ref_date_str(&mut self, date: &str) -> DhdtResult<()> {
        self.refdate = Some(parse_reference_date(date)?);
        Ok(())
    }

    pub fn ref_date(&self) -> Option<NaiveDate> {
        self.refdate
    }

    /// Allocate an empty series for every reference-grid cell
    pub fn init_ts(&mut self) -> DhdtResult<()> {
        let refgeo = self.require_refgeo()?;
        self.ts = Some(PixelTimeSeriesStore::initialize(refgeo));
        Ok(())
    }

    pub fn ts(&self) -> Option<&PixelTimeSeriesStore> {
        self.ts.as_ref()
    }

    pub fn set_ts(&mut self, ts: PixelTimeSeriesStore) {
        self.ts = Some(ts);
    }

    pub fn fitdata(&self) -> Option<&FitGrids> {
        self.fitdata.as_ref()
    }

    /// Read every survey onto the reference grid. Initializes the store when
    /// `init_ts` has not been called; any survey failure aborts the pass.
    pub fn pile_up(&mut self) -> DhdtResult<()> {
        let start = Instant::now();
        log::info!("Pile-up start: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

        let refdate = self
            .refdate
            .ok_or_else(|| DhdtError::Config("reference date is not set".to_string()))?;
        if self.ts.is_none() {
            self.init_ts()?;
        }

        let refgeo = self
            .refgeo
            .as_ref()
            .ok_or_else(|| DhdtError::Config("reference geometry is not set".to_string()))?;
        let ts = self
            .ts
            .as_mut()
            .ok_or_else(|| DhdtError::Processing("time series store is not initialized".to_string()))?;
        ts.accumulate(&self.dems, refgeo, refdate, &self.resampler)?;

        log::info!("Pile-up end: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        log::info!("Time taken: {:?}", start.elapsed());
        Ok(())
    }

    /// Fit every pixel of the piled-up store
    pub fn polyfit(&mut self) -> DhdtResult<&FitGrids> {
        let start = Instant::now();
        log::info!("Polyfit start: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

        let refgeo = self.require_refgeo()?;
        let ts = self
            .ts
            .as_ref()
            .ok_or_else(|| DhdtError::Processing("no time series to fit; run pile_up or load a snapshot".to_string()))?;
        let fitdata = ts.polyfit(&refgeo.mask, &self.regression)?;

        log::info!("Polyfit end: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        log::info!("Time taken: {:?}", start.elapsed());
        Ok(self.fitdata.insert(fitdata))
    }

    /// Persist the store to `snapshot_path`
    pub fn dump_snapshot(&self) -> DhdtResult<()> {
        let path = self.require_snapshot_path()?;
        let ts = self
            .ts
            .as_ref()
            .ok_or_else(|| DhdtError::Processing("no time series to persist".to_string()))?;
        crate::io::snapshot::persist_snapshot(ts, path)
    }

    /// Restore the store from `snapshot_path`
    pub fn load_snapshot(&mut self) -> DhdtResult<()> {
        let path = self.require_snapshot_path()?;
        let ts = crate::io::snapshot::restore_snapshot(path)?;
        if let Some(refgeo) = &self.refgeo {
            if refgeo.dim() != ts.dim() {
                return Err(DhdtError::ShapeMismatch {
                    expected: refgeo.dim(),
                    found: ts.dim(),
                });
            }
        }
        self.ts = Some(ts);
        Ok(())
    }

    /// Populate surveys, reference geometry and dates from a configuration
    #[cfg(feature = "gdal")]
    pub fn read_config(&mut self, config: &crate::io::config::DhdtConfig) -> DhdtResult<()> {
        use crate::io::raster::RasterReader;

        config.validate()?;
        self.snapshot_path = Some(config.snapshot_path.clone());
        self.dhdt_prefix = Some(config.output_prefix.clone());
        self.resampler = Resampler::new(config.resample_method);
        self.regression = WeightedRegression::new(crate::core::regression::RegressionParams {
            min_time_span: config.min_time_span_days,
            ..Default::default()
        });

        for entry in &config.surveys {
            let survey = RasterReader::read_survey(&entry.path, &entry.date, entry.uncertainty)?;
            self.add_dem(survey);
        }
        self.sort_by_date();
        self.set_ref_geo(RasterReader::read_reference_grid(&config.reference_geometry)?);
        self.set_ref_date_str(&config.reference_date)?;
        Ok(())
    }

    /// Write the four fit grids as `{prefix}_dhdt*.tif`
    #[cfg(feature = "gdal")]
    pub fn fitdata_to_files(&self) -> DhdtResult<Vec<PathBuf>> {
        use crate::io::raster::RasterWriter;

        let prefix = self
            .dhdt_prefix
            .as_ref()
            .ok_or_else(|| DhdtError::Config("output prefix is not set".to_string()))?;
        let refgeo = self.require_refgeo()?;
        let fitdata = self
            .fitdata
            .as_ref()
            .ok_or_else(|| DhdtError::Processing("no fit results; run polyfit first".to_string()))?;

        let outputs = [
            ("_dhdt.tif", &fitdata.slope),
            ("_dhdt_error.tif", &fitdata.slope_err),
            ("_dhdt_residual.tif", &fitdata.residual),
            ("_dhdt_count.tif", &fitdata.count),
        ];

        let mut written = Vec::with_capacity(outputs.len());
        for (suffix, grid) in outputs {
            let path = PathBuf::from(format!("{}{}", prefix, suffix));
            RasterWriter::write_grid(&path, grid, refgeo)?;
            written.push(path);
        }
        Ok(written)
    }

    fn require_refgeo(&self) -> DhdtResult<&ReferenceGrid> {
        self.refgeo
            .as_ref()
            .ok_or_else(|| DhdtError::Config("reference geometry is not set".to_string()))
    }

    fn require_snapshot_path(&self) -> DhdtResult<&PathBuf> {
        self.snapshot_path
            .as_ref()
            .ok_or_else(|| DhdtError::Config("snapshot path is not set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_accumulate_slice_filters_mask_and_sign() {
        let mut store = PixelTimeSeriesStore::new(2, 3);
        let slice = Array2::from_shape_vec((2, 3), vec![5.0f32, -1.0, 0.0, 7.0, 8.0, 9.0]).unwrap();
        let mut mask = Array2::from_elem((2, 3), true);
        mask[[1, 2]] = false;

        let appended = store.accumulate_slice(&slice, &mask, -12, 1.5).unwrap();
        assert_eq!(appended, 3);
        assert_eq!(store.get(0, 0).unwrap().len(), 1);
        assert!(store.get(0, 1).unwrap().is_empty());
        assert!(store.get(0, 2).unwrap().is_empty());
        assert!(store.get(1, 2).unwrap().is_empty());

        let obs = store.get(1, 1).unwrap().observations()[0];
        assert_eq!(obs, Observation { date: -12, uncertainty: 1.5, value: 8.0 });
    }

    #[test]
    fn test_accumulate_slice_rejects_wrong_shape() {
        let mut store = PixelTimeSeriesStore::new(2, 2);
        let slice = Array2::<f32>::ones((3, 2));
        let mask = Array2::from_elem((2, 2), true);
        let result = store.accumulate_slice(&slice, &mask, 0, 1.0);
        assert!(matches!(result, Err(DhdtError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_polyfit_counts_and_mask() {
        let mut store = PixelTimeSeriesStore::new(1, 3);
        let mut mask = Array2::from_elem((1, 3), true);
        mask[[0, 2]] = false;
        for (offset, value) in [(0, 100.0f64), (300, 99.0), (600, 98.0)] {
            let slice = Array2::from_elem((1, 3), value);
            store.accumulate_slice(&slice, &Array2::from_elem((1, 3), true), offset, 1.0).unwrap();
        }

        let fitdata = store.polyfit(&mask, &WeightedRegression::standard()).unwrap();
        assert_eq!(fitdata.count[[0, 0]], 3.0);
        assert_eq!(fitdata.count[[0, 2]], NO_DATA);
        assert_relative_eq!(fitdata.slope[[0, 0]], -365.25 / 300.0, max_relative = 1e-9);
        // Fitting ignores the mask; only the count is overridden
        assert_relative_eq!(fitdata.slope[[0, 2]], -365.25 / 300.0, max_relative = 1e-9);
    }

    #[test]
    fn test_polyfit_skips_failing_pixel_only() {
        let dates = [0, 100, 200, 300, 400];
        let make = |sigma: f64| {
            PixelSeries::from_observations(
                dates
                    .iter()
                    .map(|&date| Observation { date, uncertainty: sigma, value: 50.0 + 0.01 * date as f64 })
                    .collect(),
            )
        };
        // Zero uncertainty gives an infinite weight and a singular fit
        let store = PixelTimeSeriesStore::from_series(1, 3, vec![make(1.0), make(0.0), make(1.0)]).unwrap();
        let mask = Array2::from_elem((1, 3), true);

        let fitdata = store.polyfit(&mask, &WeightedRegression::standard()).unwrap();
        assert_eq!(fitdata.slope[[0, 1]], NO_DATA);
        assert_eq!(fitdata.slope_err[[0, 1]], NO_DATA);
        assert_eq!(fitdata.residual[[0, 1]], NO_DATA);
        assert_eq!(fitdata.count.row(0).to_vec(), vec![5.0, 5.0, 5.0]);
        for col in [0, 2] {
            assert_relative_eq!(fitdata.slope[[0, col]], 0.01 * 365.25, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_dem_pile_requires_reference_date() {
        let mut pile = DemPile::new();
        pile.set_ref_geo(ReferenceGrid::new(
            GeoTransform::new(0.0, 10.0, 1.0, -1.0),
            Array2::from_elem((10, 10), true),
        ));
        assert!(matches!(pile.pile_up(), Err(DhdtError::Config(_))));
    }

    #[test]
    fn test_sort_by_date_is_ascending() {
        let transform = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        let mut pile = DemPile::new();
        for d in [date(2014, 5, 1), date(2012, 1, 1), date(2013, 3, 3)] {
            pile.add_dem(Survey::new(Array2::ones((2, 2)), transform, d, 1.0));
        }
        pile.sort_by_date();
        let dates: Vec<NaiveDate> = pile.dems().iter().map(|s| s.date).collect();
        assert_eq!(dates, vec![date(2012, 1, 1), date(2013, 3, 3), date(2014, 5, 1)]);
    }
}
