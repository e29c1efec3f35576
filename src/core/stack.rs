//! Dense time-series layout: every survey is one slice of a
//! `rows x cols x surveys` cube sharing date and uncertainty vectors.
//! Missing cells hold NaN.

use crate::core::regression::weighted_line_fit;
use crate::types::{
    DhdtError, DhdtResult, ElevationCube, ElevationGrid, StackFitGrids, Survey, ValueGrid, DAYS_PER_YEAR,
};
use chrono::NaiveDate;
use ndarray::{concatenate, s, Array2, Axis};

/// Parameters for [`TimeSeriesStack::polyfit`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackFitParams {
    /// Minimum number of usable observations at a pixel
    pub min_count: usize,
    /// Minimum day span of the usable observations
    pub min_time_span: i64,
    /// Observations dated before January 1 of this year are ignored
    pub min_year: i32,
    /// Observations dated on or after January 1 of this year are ignored
    pub max_year: i32,
}

impl Default for StackFitParams {
    fn default() -> Self {
        Self {
            min_count: 5,
            min_time_span: 365,
            min_year: 2000,
            max_year: 2016,
        }
    }
}

/// Per-slice metadata; `weight` and `day_delta` are derived on demand
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackMetadata {
    pub dates: Vec<NaiveDate>,
    pub uncertainty: Vec<f64>,
    /// `1 / sigma^2` per slice
    pub weight: Option<Vec<f64>>,
    /// Days since the earliest date per slice
    pub day_delta: Option<Vec<i64>>,
}

impl StackMetadata {
    fn len(&self) -> usize {
        self.dates.len()
    }

    fn compute_day_delta(&self) -> Vec<i64> {
        match self.dates.iter().min() {
            Some(&first) => self
                .dates
                .iter()
                .map(|d| d.signed_duration_since(first).num_days())
                .collect(),
            None => Vec::new(),
        }
    }

    fn compute_weight(&self) -> Vec<f64> {
        self.uncertainty.iter().map(|s| 1.0 / (s * s)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TimeSeriesStack {
    data: ElevationCube,
    meta: StackMetadata,
}

impl TimeSeriesStack {
    /// Single-slice stack; the survey's no-data value becomes NaN
    pub fn from_survey(survey: &Survey) -> Self {
        let slice = nan_for_no_data(survey);
        Self {
            data: slice.insert_axis(Axis(2)),
            meta: StackMetadata {
                dates: vec![survey.date],
                uncertainty: vec![survey.uncertainty],
                ..Default::default()
            },
        }
    }

    /// Stack from a prepared cube; one date and uncertainty per slice
    pub fn from_parts(data: ElevationCube, dates: Vec<NaiveDate>, uncertainty: Vec<f64>) -> DhdtResult<Self> {
        let depth = data.dim().2;
        if dates.len() != depth || uncertainty.len() != depth {
            return Err(DhdtError::InvalidFormat(format!(
                "{} slices but {} dates and {} uncertainties",
                depth,
                dates.len(),
                uncertainty.len()
            )));
        }
        Ok(Self {
            data,
            meta: StackMetadata {
                dates,
                uncertainty,
                ..Default::default()
            },
        })
    }

    /// Append one survey as a new slice. Derived weight and day delta are cleared.
    pub fn add_survey(&mut self, survey: &Survey) -> DhdtResult<()> {
        let (rows, cols, _) = self.data.dim();
        if survey.data.dim() != (rows, cols) {
            return Err(DhdtError::ShapeMismatch {
                expected: (rows, cols),
                found: survey.data.dim(),
            });
        }

        let slice = nan_for_no_data(survey).insert_axis(Axis(2));
        self.data = concatenate(Axis(2), &[self.data.view(), slice.view()])
            .map_err(|e| DhdtError::Processing(format!("cannot append slice: {}", e)))?;
        self.meta.dates.push(survey.date);
        self.meta.uncertainty.push(survey.uncertainty);
        self.meta.weight = None;
        self.meta.day_delta = None;
        Ok(())
    }

    pub fn data(&self) -> &ElevationCube {
        &self.data
    }

    pub fn metadata(&self) -> &StackMetadata {
        &self.meta
    }

    /// Number of slices
    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.len() == 0
    }

    /// Set `day_delta` to `date - min(date)` in days
    pub fn date_to_day_delta(&mut self) {
        self.meta.day_delta = Some(self.meta.compute_day_delta());
    }

    /// Set `weight` to `1 / sigma^2`
    pub fn set_weight(&mut self) {
        self.meta.weight = Some(self.meta.compute_weight());
    }

    /// Fit a line through every pixel's usable observations.
    ///
    /// Observations are usable when finite and dated inside
    /// `[min_year-01-01, max_year-01-01)`. Pixels with fewer than `min_count`
    /// usable observations, or a span below `min_time_span`, are NaN in all
    /// four outputs. Slope and slope error are per year; the intercept is the
    /// value at the earliest date of the stack.
    ///
    /// Legacy stack fits reported slope and slope error per day; multiply
    /// by 1/365.25 to compare against them.
    pub fn polyfit(&self, params: &StackFitParams) -> DhdtResult<StackFitGrids> {
        let (rows, cols, depth) = self.data.dim();
        let day_delta = self
            .meta
            .day_delta
            .clone()
            .unwrap_or_else(|| self.meta.compute_day_delta());
        let weight = self.meta.weight.clone().unwrap_or_else(|| self.meta.compute_weight());
        if day_delta.len() != depth || weight.len() != depth {
            return Err(DhdtError::Processing(format!(
                "metadata describes {} slices but the stack holds {}",
                day_delta.len().min(weight.len()),
                depth
            )));
        }

        let window_start = year_start(params.min_year)?;
        let window_end = year_start(params.max_year)?;
        let in_window: Vec<bool> = self
            .meta
            .dates
            .iter()
            .map(|d| *d >= window_start && *d < window_end)
            .collect();

        let pixel_count = rows * cols;
        log::info!(
            "Fitting {} pixels over {} slices ({} inside {}..{})",
            pixel_count,
            depth,
            in_window.iter().filter(|&&b| b).count(),
            params.min_year,
            params.max_year
        );

        let fit_one = |index: usize| -> [f64; 4] {
            if index % 10_000 == 0 {
                log::info!("processing {} pixels out of {} pixels", index, pixel_count);
            }
            let (row, col) = (index / cols, index % cols);
            let lane = self.data.slice(s![row, col, ..]);

            let mut x = Vec::with_capacity(depth);
            let mut y = Vec::with_capacity(depth);
            let mut w = Vec::with_capacity(depth);
            for (k, &value) in lane.iter().enumerate() {
                if in_window[k] && value.is_finite() {
                    x.push(day_delta[k] as f64);
                    y.push(value as f64);
                    w.push(weight[k].sqrt());
                }
            }
            fit_lane(&x, &y, &w, params, row, col)
        };

        #[cfg(feature = "parallel")]
        let fits: Vec<[f64; 4]> = {
            use rayon::prelude::*;
            (0..pixel_count).into_par_iter().map(fit_one).collect()
        };

        #[cfg(not(feature = "parallel"))]
        let fits: Vec<[f64; 4]> = (0..pixel_count).map(fit_one).collect();

        let grid = |component: usize| -> ValueGrid {
            Array2::from_shape_fn((rows, cols), |(r, c)| fits[r * cols + c][component])
        };
        Ok(StackFitGrids {
            slope: grid(0),
            intercept: grid(1),
            slope_err: grid(2),
            intercept_err: grid(3),
        })
    }
}

/// `[slope, intercept, slope_err, intercept_err]`, NaN when gated out
fn fit_lane(x: &[f64], y: &[f64], w: &[f64], params: &StackFitParams, row: usize, col: usize) -> [f64; 4] {
    let unfitted = [f64::NAN; 4];
    if x.len() < params.min_count || x.is_empty() {
        return unfitted;
    }
    let span = x.iter().cloned().fold(f64::MIN, f64::max) - x.iter().cloned().fold(f64::MAX, f64::min);
    if span < params.min_time_span as f64 {
        return unfitted;
    }

    let fit = match weighted_line_fit(x, y, w) {
        Ok(fit) => fit,
        Err(e) => {
            log::warn!("Skipping pixel ({}, {}): {}", row, col, e);
            return unfitted;
        }
    };
    match fit.scaled_covariance() {
        Some(cov) => [
            fit.slope * DAYS_PER_YEAR,
            fit.intercept,
            cov[0][0].sqrt() * DAYS_PER_YEAR,
            cov[1][1].sqrt(),
        ],
        None => {
            log::warn!(
                "Skipping pixel ({}, {}): {} observations cannot support a covariance estimate",
                row,
                col,
                x.len()
            );
            unfitted
        }
    }
}

fn year_start(year: i32) -> DhdtResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| DhdtError::Config(format!("year {} is out of range", year)))
}

fn nan_for_no_data(survey: &Survey) -> ElevationGrid {
    match survey.no_data {
        Some(no_data) => {
            let no_data = no_data as f32;
            survey.data.mapv(|v| if v == no_data { f32::NAN } else { v })
        }
        None => survey.data.clone(),
    }
}
