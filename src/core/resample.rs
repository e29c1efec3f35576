use crate::types::{DhdtError, DhdtResult, GeoTransform, GridGeometry, Survey, OUT_OF_RANGE};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interpolation used to bring a survey onto the reference grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    /// Nearest source sample; never fills with the out-of-range value
    Nearest,
    /// Bilinear spline, the best representation of a flat ice surface
    #[default]
    Linear,
    /// Bicubic interpolating spline
    Cubic,
    /// Biquintic interpolating spline
    Quintic,
}

impl ResampleMethod {
    /// Spline degree for the smooth methods
    pub fn spline_degree(&self) -> Option<usize> {
        match self {
            ResampleMethod::Nearest => None,
            ResampleMethod::Linear => Some(1),
            ResampleMethod::Cubic => Some(3),
            ResampleMethod::Quintic => Some(5),
        }
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleMethod::Nearest => write!(f, "nearest"),
            ResampleMethod::Linear => write!(f, "linear"),
            ResampleMethod::Cubic => write!(f, "cubic"),
            ResampleMethod::Quintic => write!(f, "quintic"),
        }
    }
}

impl FromStr for ResampleMethod {
    type Err = DhdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(ResampleMethod::Nearest),
            "linear" => Ok(ResampleMethod::Linear),
            "cubic" => Ok(ResampleMethod::Cubic),
            "quintic" => Ok(ResampleMethod::Quintic),
            _ => Err(DhdtError::Config(format!("Invalid resampling method: {}", s))),
        }
    }
}

/// Grid resampler: aligns a surface to the extent and spacing of another grid
#[derive(Debug, Clone, Default)]
pub struct Resampler {
    method: ResampleMethod,
}

impl Resampler {
    pub fn new(method: ResampleMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> ResampleMethod {
        self.method
    }

    /// Resample a survey onto `target`
    pub fn resample_survey(&self, survey: &Survey, target: &GridGeometry) -> DhdtResult<Array2<f32>> {
        self.resample(survey.data.view(), &survey.transform, target)
    }

    /// Resample `source` (sampled on `source_transform`) onto `target`.
    ///
    /// Sample points sit on the upper-left corner of each pixel, for both grids.
    /// Disjoint footprints are not an error: the result is filled with
    /// [`OUT_OF_RANGE`].
    pub fn resample<T>(
        &self,
        source: ArrayView2<T>,
        source_transform: &GeoTransform,
        target: &GridGeometry,
    ) -> DhdtResult<Array2<T>>
    where
        T: Float + Send + Sync,
    {
        let (rows, cols) = source.dim();
        let source_geometry = GridGeometry::new(*source_transform, rows, cols);
        let fill = num_traits::cast::<f64, T>(OUT_OF_RANGE).unwrap_or_else(T::nan);

        if rows == 0 || cols == 0 || !source_geometry.extent().intersects(&target.extent()) {
            log::debug!("Source and target extents do not intersect, filling with {}", OUT_OF_RANGE);
            return Ok(Array2::from_elem(target.dim(), fill));
        }

        log::debug!(
            "Resampling {}x{} source onto {}x{} grid ({})",
            rows,
            cols,
            target.rows,
            target.cols,
            self.method
        );

        match self.method.spline_degree() {
            None => Ok(nearest(source, &source_geometry, target)),
            Some(degree) => {
                let surface = SplineSurface::fit(source, &source_geometry, degree)?;
                Ok(surface.evaluate_on(target, fill))
            }
        }
    }
}

/// Convenience wrapper: resample a survey with the given method
pub fn resample_array(survey: &Survey, target: &GridGeometry, method: ResampleMethod) -> DhdtResult<Array2<f32>> {
    Resampler::new(method).resample_survey(survey, target)
}

/// Index of the nearest sample on a regular axis, clamped to the axis
fn nearest_index(coord: f64, origin: f64, step: f64, len: usize) -> usize {
    let pos = ((coord - origin) / step).round();
    if pos.is_nan() || pos <= 0.0 {
        0
    } else {
        (pos as usize).min(len - 1)
    }
}

/// Nearest-neighbour lookup. On a rectilinear source grid the Euclidean
/// nearest sample is the per-axis nearest row and column.
fn nearest<T: Float>(source: ArrayView2<T>, source_geometry: &GridGeometry, target: &GridGeometry) -> Array2<T> {
    let st = &source_geometry.transform;
    let col_index: Vec<usize> = target
        .column_coordinates()
        .iter()
        .map(|&x| nearest_index(x, st.top_left_x, st.pixel_width, source_geometry.cols))
        .collect();
    let row_index: Vec<usize> = target
        .row_coordinates()
        .iter()
        .map(|&y| nearest_index(y, st.top_left_y, st.pixel_height, source_geometry.rows))
        .collect();

    Array2::from_shape_fn(target.dim(), |(i, j)| source[[row_index[i], col_index[j]]])
}

/// Knot vector and factored collocation matrix of a 1-D interpolating spline
#[derive(Debug, Clone)]
struct SplineAxis {
    coords: Vec<f64>,
    knots: Vec<f64>,
    degree: usize,
    /// Banded LU factors, row-major, `2 * degree + 1` entries per row
    lu: Vec<f64>,
}

impl SplineAxis {
    /// Interpolating knots for odd `degree`: the end points repeated
    /// `degree + 1` times, then the data sites minus `(degree + 1) / 2` at each end.
    fn new(coords: Vec<f64>, degree: usize) -> DhdtResult<Self> {
        let m = coords.len();
        if m <= degree {
            return Err(DhdtError::Processing(format!(
                "{} samples along an axis cannot support a degree {} spline",
                m, degree
            )));
        }

        let half = (degree + 1) / 2;
        let mut knots = Vec::with_capacity(m + degree + 1);
        knots.extend(std::iter::repeat(coords[0]).take(degree + 1));
        knots.extend_from_slice(&coords[half..m - half]);
        knots.extend(std::iter::repeat(coords[m - 1]).take(degree + 1));

        let mut axis = Self {
            coords,
            knots,
            degree,
            lu: Vec::new(),
        };
        axis.factor()?;
        Ok(axis)
    }

    fn len(&self) -> usize {
        self.coords.len()
    }

    fn width(&self) -> usize {
        2 * self.degree + 1
    }

    fn band_index(&self, i: usize, j: usize) -> usize {
        i * self.width() + (j + self.degree - i)
    }

    /// Knot span containing `u`, clamped to the valid spans
    fn find_span(&self, u: f64) -> usize {
        let n = self.len() - 1;
        let k = self.degree;
        if u >= self.knots[n + 1] {
            return n;
        }
        if u <= self.knots[k] {
            return k;
        }

        let (mut low, mut high) = (k, n + 1);
        let mut mid = (low + high) / 2;
        while u < self.knots[mid] || u >= self.knots[mid + 1] {
            if u < self.knots[mid] {
                high = mid;
            } else {
                low = mid;
            }
            mid = (low + high) / 2;
        }
        mid
    }

    /// The `degree + 1` non-zero basis values at `u`, with the index of the first
    fn basis(&self, u: f64) -> (usize, Vec<f64>) {
        let k = self.degree;
        let span = self.find_span(u);
        let mut values = vec![0.0; k + 1];
        let mut left = vec![0.0; k + 1];
        let mut right = vec![0.0; k + 1];
        values[0] = 1.0;

        for j in 1..=k {
            left[j] = u - self.knots[span + 1 - j];
            right[j] = self.knots[span + j] - u;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom != 0.0 { values[r] / denom } else { 0.0 };
                values[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            values[j] = saved;
        }

        (span - k, values)
    }

    /// Build the banded collocation matrix and factor it in place. B-spline
    /// collocation matrices are totally positive, so no pivoting is needed.
    fn factor(&mut self) -> DhdtResult<()> {
        let m = self.len();
        let k = self.degree;
        self.lu = vec![0.0; m * self.width()];

        for i in 0..m {
            let (first, values) = self.basis(self.coords[i]);
            for (offset, value) in values.into_iter().enumerate() {
                let j = first + offset;
                if j + k >= i && j <= i + k {
                    let idx = self.band_index(i, j);
                    self.lu[idx] = value;
                }
            }
        }

        for p in 0..m {
            let pivot = self.lu[self.band_index(p, p)];
            if pivot.abs() < f64::MIN_POSITIVE {
                return Err(DhdtError::Processing(
                    "Singular spline collocation matrix".to_string(),
                ));
            }
            let end = (p + k + 1).min(m);
            for i in p + 1..end {
                let idx = self.band_index(i, p);
                let l = self.lu[idx] / pivot;
                self.lu[idx] = l;
                for j in p + 1..end {
                    let upper = self.lu[self.band_index(p, j)];
                    let target = self.band_index(i, j);
                    self.lu[target] -= l * upper;
                }
            }
        }
        Ok(())
    }

    /// Solve for spline coefficients interpolating `values` in place
    fn solve(&self, values: &mut [f64]) {
        let m = self.len();
        let k = self.degree;

        for i in 0..m {
            let start = i.saturating_sub(k);
            let mut sum = values[i];
            for p in start..i {
                sum -= self.lu[self.band_index(i, p)] * values[p];
            }
            values[i] = sum;
        }

        for i in (0..m).rev() {
            let end = (i + k + 1).min(m);
            let mut sum = values[i];
            for j in i + 1..end {
                sum -= self.lu[self.band_index(i, j)] * values[j];
            }
            values[i] = sum / self.lu[self.band_index(i, i)];
        }
    }

    fn contains(&self, u: f64) -> bool {
        u >= self.coords[0] && u <= self.coords[self.len() - 1]
    }
}

/// Tensor-product interpolating spline over a regular source grid, with both
/// axes in ascending coordinate order
#[derive(Debug, Clone)]
struct SplineSurface {
    x_axis: SplineAxis,
    y_axis: SplineAxis,
    /// Coefficients, rows follow ascending y
    coefficients: Array2<f64>,
}

impl SplineSurface {
    fn fit<T: Float>(source: ArrayView2<T>, geometry: &GridGeometry, degree: usize) -> DhdtResult<Self> {
        let mut xs = geometry.column_coordinates();
        let mut ys = geometry.row_coordinates();

        // Spline axes must ascend; north-up rasters have descending y, so the
        // rows are flipped here and output rows are written back in grid order.
        let mut values = source.mapv(|v| v.to_f64().unwrap_or(f64::NAN));
        if xs.len() > 1 && xs[0] > xs[xs.len() - 1] {
            xs.reverse();
            values.invert_axis(Axis(1));
        }
        if ys.len() > 1 && ys[0] > ys[ys.len() - 1] {
            ys.reverse();
            values.invert_axis(Axis(0));
        }

        let x_axis = SplineAxis::new(xs, degree)?;
        let y_axis = SplineAxis::new(ys, degree)?;

        let mut coefficients = values.as_standard_layout().to_owned();
        let mut line = vec![0.0; x_axis.len()];
        for mut row in coefficients.axis_iter_mut(Axis(0)) {
            line.iter_mut().zip(row.iter()).for_each(|(l, v)| *l = *v);
            x_axis.solve(&mut line);
            row.iter_mut().zip(line.iter()).for_each(|(v, l)| *v = *l);
        }

        let mut column = vec![0.0; y_axis.len()];
        for mut col in coefficients.axis_iter_mut(Axis(1)) {
            column.iter_mut().zip(col.iter()).for_each(|(c, v)| *c = *v);
            y_axis.solve(&mut column);
            col.iter_mut().zip(column.iter()).for_each(|(v, c)| *v = *c);
        }

        Ok(Self {
            x_axis,
            y_axis,
            coefficients,
        })
    }

    fn evaluate_row<T: Float>(&self, y: f64, x_basis: &[Option<(usize, Vec<f64>)>], out: &mut [T], fill: T) {
        if !self.y_axis.contains(y) {
            out.iter_mut().for_each(|v| *v = fill);
            return;
        }

        let (y_first, y_values) = self.y_axis.basis(y);
        for (value, basis) in out.iter_mut().zip(x_basis.iter()) {
            *value = match basis {
                None => fill,
                Some((x_first, x_values)) => {
                    let mut sum = 0.0;
                    for (a, by) in y_values.iter().enumerate() {
                        let coeff_row = self.coefficients.row(y_first + a);
                        for (b, bx) in x_values.iter().enumerate() {
                            sum += by * bx * coeff_row[x_first + b];
                        }
                    }
                    num_traits::cast::<f64, T>(sum).unwrap_or(fill)
                }
            };
        }
    }

    /// Evaluate on every target sample; points outside the source's sample
    /// range get `fill` instead of being extrapolated
    fn evaluate_on<T>(&self, target: &GridGeometry, fill: T) -> Array2<T>
    where
        T: Float + Send + Sync,
    {
        let x_basis: Vec<Option<(usize, Vec<f64>)>> = target
            .column_coordinates()
            .into_iter()
            .map(|x| if self.x_axis.contains(x) { Some(self.x_axis.basis(x)) } else { None })
            .collect();
        let ys = Array1::from(target.row_coordinates());
        let mut output = Array2::from_elem(target.dim(), fill);

        #[cfg(feature = "parallel")]
        Zip::from(output.rows_mut()).and(&ys).par_for_each(|mut row, &y| {
            if let Some(slice) = row.as_slice_mut() {
                self.evaluate_row(y, &x_basis, slice, fill);
            }
        });

        #[cfg(not(feature = "parallel"))]
        Zip::from(output.rows_mut()).and(&ys).for_each(|mut row, &y| {
            if let Some(slice) = row.as_slice_mut() {
                self.evaluate_row(y, &x_basis, slice, fill);
            }
        });

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    fn plane(rows: usize, cols: usize, transform: &GeoTransform) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            let x = transform.column_x(j);
            let y = transform.row_y(i);
            100.0 + 0.5 * x - 0.25 * y
        })
    }

    #[test]
    fn test_disjoint_extents_fill_sentinel() {
        let source_transform = GeoTransform::new(0.0, 100.0, 10.0, -10.0);
        let source = Array2::<f32>::from_elem((10, 10), 50.0);
        let target = GridGeometry::new(GeoTransform::new(1000.0, 2000.0, 10.0, -10.0), 6, 7);

        for method in [ResampleMethod::Nearest, ResampleMethod::Linear, ResampleMethod::Cubic] {
            let result = Resampler::new(method)
                .resample(source.view(), &source_transform, &target)
                .unwrap();
            assert_eq!(result.dim(), (6, 7));
            assert!(result.iter().all(|&v| v == OUT_OF_RANGE as f32));
        }
    }

    #[test]
    fn test_nearest_identity_is_exact() {
        let transform = GeoTransform::new(500.0, 900.0, 30.0, -30.0);
        let source = Array2::from_shape_fn((8, 9), |(i, j)| (i * 9 + j) as f32 + 0.5);
        let target = GridGeometry::new(transform, 8, 9);

        let result = Resampler::new(ResampleMethod::Nearest)
            .resample(source.view(), &transform, &target)
            .unwrap();
        assert_eq!(result, source);
    }

    #[test]
    fn test_smooth_identity_within_tolerance() {
        let transform = GeoTransform::new(0.0, 0.0, 2.0, -2.0);
        let source = Array2::from_shape_fn((9, 11), |(i, j)| ((i as f64) * 0.7).sin() * 5.0 + (j as f64).cos() * 3.0 + 20.0);
        let target = GridGeometry::new(transform, 9, 11);

        for method in [ResampleMethod::Linear, ResampleMethod::Cubic, ResampleMethod::Quintic] {
            let result = Resampler::new(method)
                .resample(source.view(), &transform, &target)
                .unwrap();
            for (a, b) in result.iter().zip(source.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_linear_reproduces_plane_at_half_pixel_shift() {
        let source_transform = GeoTransform::new(0.0, 100.0, 10.0, -10.0);
        let source = plane(10, 10, &source_transform);
        let target_transform = GeoTransform::new(5.0, 95.0, 10.0, -10.0);
        let target = GridGeometry::new(target_transform, 9, 9);

        for method in [ResampleMethod::Linear, ResampleMethod::Cubic] {
            let result = Resampler::new(method)
                .resample(source.view(), &source_transform, &target)
                .unwrap();
            let expected = plane(9, 9, &target_transform);
            for (a, b) in result.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_smooth_fills_outside_sample_range() {
        let source_transform = GeoTransform::new(0.0, 100.0, 10.0, -10.0);
        let source = plane(10, 10, &source_transform);
        // Shifted half a grid to the east: samples past x = 90 are outside the source
        let target = GridGeometry::new(GeoTransform::new(50.0, 100.0, 10.0, -10.0), 10, 10);

        let result = Resampler::new(ResampleMethod::Linear)
            .resample(source.view(), &source_transform, &target)
            .unwrap();
        assert_abs_diff_eq!(result[[0, 4]], 120.0, epsilon = 1e-9);
        for col in 5..10 {
            assert!(result.column(col).iter().all(|&v| v == OUT_OF_RANGE));
        }
    }

    #[test]
    fn test_nearest_does_not_fill_inside_overlap() {
        let source_transform = GeoTransform::new(0.0, 100.0, 10.0, -10.0);
        let source = Array2::<f32>::from_elem((10, 10), 42.0);
        let target = GridGeometry::new(GeoTransform::new(50.0, 100.0, 10.0, -10.0), 10, 10);

        let result = Resampler::new(ResampleMethod::Nearest)
            .resample(source.view(), &source_transform, &target)
            .unwrap();
        assert!(result.iter().all(|&v| v == 42.0));
    }

    #[test]
    fn test_source_too_small_for_degree() {
        let transform = GeoTransform::new(0.0, 100.0, 10.0, -10.0);
        let source = Array2::<f32>::from_elem((3, 3), 1.0);
        let target = GridGeometry::new(transform, 3, 3);

        let result = Resampler::new(ResampleMethod::Quintic).resample(source.view(), &transform, &target);
        assert!(matches!(result, Err(DhdtError::Processing(_))));
    }

    #[test]
    fn test_resample_survey_keeps_dtype() {
        let transform = GeoTransform::new(0.0, 100.0, 10.0, -10.0);
        let survey = Survey::new(
            Array2::<f32>::from_elem((5, 5), 7.0),
            transform,
            NaiveDate::from_ymd_opt(2015, 6, 1).unwrap(),
            2.0,
        );
        let target = GridGeometry::new(transform, 5, 5);

        let aligned: Array2<f32> = resample_array(&survey, &target, ResampleMethod::Linear).unwrap();
        assert!(aligned.iter().all(|&v| (v - 7.0).abs() < 1e-5));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("Cubic".parse::<ResampleMethod>().unwrap(), ResampleMethod::Cubic);
        assert_eq!(ResampleMethod::default(), ResampleMethod::Linear);
        assert!("spline".parse::<ResampleMethod>().is_err());
    }
}
