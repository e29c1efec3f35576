//! Weighted first-degree regression of elevation against time.

use crate::types::{DhdtError, DhdtResult, Observation, PixelSeries, DAYS_PER_YEAR, NO_DATA};

/// Residual multiplier given to observations injected by small-sample augmentation
pub const AUGMENTED_WEIGHT: f64 = f64::EPSILON;

/// Weighted least-squares line `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
    /// `(G_w^T G_w)^-1`, ordered `[slope, intercept]`
    pub unscaled_covariance: [[f64; 2]; 2],
    /// Weighted residual sum of squares, `sum((w * (y - y_hat))^2)`
    pub rss: f64,
    /// Number of observations in the fit
    pub n: usize,
}

impl LineFit {
    /// Covariance scaled the way the legacy polynomial fit reports it:
    /// `unscaled * rss / (n - 4)`. `None` when `n <= 4`.
    pub fn scaled_covariance(&self) -> Option<[[f64; 2]; 2]> {
        if self.n <= 4 {
            return None;
        }
        let factor = self.rss / (self.n - 4) as f64;
        let c = &self.unscaled_covariance;
        Some([
            [c[0][0] * factor, c[0][1] * factor],
            [c[1][0] * factor, c[1][1] * factor],
        ])
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Fit a line minimising `sum((w_i * (y_i - slope * x_i - intercept))^2)`.
///
/// `w` multiplies each residual, so pass `1 / sigma` for inverse-variance
/// weighting. Abscissae are centred on their weighted mean before solving.
pub fn weighted_line_fit(x: &[f64], y: &[f64], w: &[f64]) -> DhdtResult<LineFit> {
    let n = x.len();
    if y.len() != n || w.len() != n {
        return Err(DhdtError::Processing(format!(
            "Regression inputs differ in length: x={}, y={}, w={}",
            n,
            y.len(),
            w.len()
        )));
    }
    if n < 2 {
        return Err(DhdtError::SingularFit(format!("{} observation(s)", n)));
    }

    let sw: f64 = w.iter().map(|wi| wi * wi).sum();
    if !(sw > 0.0) || !sw.is_finite() {
        return Err(DhdtError::SingularFit("weights sum to zero".to_string()));
    }
    let x_mean = x.iter().zip(w).map(|(xi, wi)| wi * wi * xi).sum::<f64>() / sw;
    let y_mean = y.iter().zip(w).map(|(yi, wi)| wi * wi * yi).sum::<f64>() / sw;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut x_scale = 0.0;
    for ((xi, yi), wi) in x.iter().zip(y).zip(w) {
        let w2 = wi * wi;
        let dx = xi - x_mean;
        sxx += w2 * dx * dx;
        sxy += w2 * dx * (yi - y_mean);
        x_scale += w2 * xi * xi;
    }

    if !(sxx > f64::EPSILON * x_scale.max(f64::MIN_POSITIVE)) {
        return Err(DhdtError::SingularFit(format!(
            "abscissae have no weighted spread (sxx = {:e})",
            sxx
        )));
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;

    let var_slope = 1.0 / sxx;
    let var_intercept = 1.0 / sw + x_mean * x_mean / sxx;
    let cov = -x_mean / sxx;

    let rss = x
        .iter()
        .zip(y)
        .zip(w)
        .map(|((xi, yi), wi)| {
            let r = wi * (yi - (slope * xi + intercept));
            r * r
        })
        .sum();

    Ok(LineFit {
        slope,
        intercept,
        unscaled_covariance: [[var_slope, cov], [cov, var_intercept]],
        rss,
        n,
    })
}

/// Fit outcome for one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelFit {
    /// Units per year, [`NO_DATA`] when not fitted
    pub rate: f64,
    pub rate_error: f64,
    /// Sum of squared deviations over the genuine observations
    pub residual: f64,
    /// Number of observations in the series, fitted or not
    pub count: usize,
    /// False when the series was gated out
    pub fitted: bool,
}

impl PixelFit {
    pub fn unfitted(count: usize) -> Self {
        Self {
            rate: NO_DATA,
            rate_error: NO_DATA,
            residual: NO_DATA,
            count,
            fitted: false,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }
}

/// Gating parameters for the per-pixel fit
#[derive(Debug, Clone)]
pub struct RegressionParams {
    /// Minimum number of distinct time offsets
    pub min_distinct_dates: usize,
    /// The offset range (days) must exceed this
    pub min_time_span: i64,
}

impl Default for RegressionParams {
    fn default() -> Self {
        Self {
            min_distinct_dates: 3,
            min_time_span: 200,
        }
    }
}

/// Per-pixel weighted rate estimator with small-sample augmentation
#[derive(Debug, Clone, Default)]
pub struct WeightedRegression {
    params: RegressionParams,
}

impl WeightedRegression {
    pub fn new(params: RegressionParams) -> Self {
        Self { params }
    }

    /// Regression with the default 3-date / 200-day gate
    pub fn standard() -> Self {
        Self::new(RegressionParams::default())
    }

    pub fn params(&self) -> &RegressionParams {
        &self.params
    }

    /// True when the series has enough distinct dates over a long enough span
    pub fn passes_gate(&self, series: &PixelSeries) -> bool {
        series.distinct_dates() >= self.params.min_distinct_dates
            && series.date_span() > self.params.min_time_span
    }

    /// Estimate the rate of change for one pixel.
    ///
    /// Gated-out series return [`PixelFit::unfitted`]. An ill-conditioned fit
    /// returns `Err(DhdtError::SingularFit)`; callers fitting a grid skip the pixel.
    pub fn fit_pixel(&self, series: &PixelSeries) -> DhdtResult<PixelFit> {
        let count = series.len();
        if !self.passes_gate(series) {
            return Ok(PixelFit::unfitted(count));
        }

        let observations = series.observations();
        let duplicates = match series.distinct_dates() {
            3 => 2,
            4 => 1,
            _ => 0,
        };

        let total = count + duplicates;
        let mut x = Vec::with_capacity(total);
        let mut y = Vec::with_capacity(total);
        let mut w = Vec::with_capacity(total);
        for obs in observations {
            x.push(obs.date as f64);
            y.push(obs.value);
            w.push(1.0 / obs.uncertainty);
        }
        if let Some(last) = series.last() {
            for _ in 0..duplicates {
                x.push(last.date as f64);
                y.push(last.value);
                w.push(AUGMENTED_WEIGHT);
            }
        }

        let fit = weighted_line_fit(&x, &y, &w)?;
        let slope_variance = rescaled_slope_variance(&fit);
        if !slope_variance.is_finite() || slope_variance < 0.0 {
            return Err(DhdtError::SingularFit(format!(
                "slope variance {} is not usable",
                slope_variance
            )));
        }

        Ok(PixelFit {
            rate: fit.slope * DAYS_PER_YEAR,
            rate_error: slope_variance.sqrt() * DAYS_PER_YEAR,
            residual: genuine_residual(&fit, observations),
            count,
            fitted: true,
        })
    }
}

/// Slope variance after rescaling the reported covariance by `(n - 4) / rss`.
/// A zero residual (exact fit) leaves nothing to rescale, so the unscaled
/// covariance is used directly.
fn rescaled_slope_variance(fit: &LineFit) -> f64 {
    let rescale = (fit.n as f64 - 4.0) / fit.rss;
    match fit.scaled_covariance() {
        Some(cov) if rescale.is_finite() && fit.rss > 0.0 => cov[0][0] * rescale,
        _ => fit.unscaled_covariance[0][0],
    }
}

fn genuine_residual(fit: &LineFit, observations: &[Observation]) -> f64 {
    observations
        .iter()
        .map(|obs| {
            let d = fit.predict(obs.date as f64) - obs.value;
            d * d
        })
        .sum()
}
