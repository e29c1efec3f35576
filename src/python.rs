use crate::core::{resample, DemPile, ResampleMethod};
use crate::types::{DhdtError, GeoTransform, GridGeometry, ReferenceGrid, Survey, parse_survey_date};
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::path::PathBuf;

type PyGeoTransform = (f64, f64, f64, f64, f64, f64);

fn to_py_err(e: DhdtError) -> PyErr {
    match e {
        DhdtError::Config(_) | DhdtError::InvalidDate(_) | DhdtError::ShapeMismatch { .. } => {
            PyValueError::new_err(e.to_string())
        }
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

fn geo_transform(gt: PyGeoTransform) -> GeoTransform {
    GeoTransform::from_gdal([gt.0, gt.1, gt.2, gt.3, gt.4, gt.5])
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyDemPile>()?;
    m.add_function(wrap_pyfunction!(resample_array, m)?)?;
    Ok(())
}

/// Resample `array` (with GDAL geotransform `source_gt`) onto a
/// `rows x cols` grid with geotransform `target_gt`
#[pyfunction]
#[pyo3(signature = (array, source_gt, target_gt, rows, cols, method = "linear"))]
fn resample_array<'py>(
    py: Python<'py>,
    array: PyReadonlyArray2<f32>,
    source_gt: PyGeoTransform,
    target_gt: PyGeoTransform,
    rows: usize,
    cols: usize,
    method: &str,
) -> PyResult<&'py PyArray2<f32>> {
    let method: ResampleMethod = method.parse().map_err(to_py_err)?;
    let target = GridGeometry::new(geo_transform(target_gt), rows, cols);
    let resampled = resample::Resampler::new(method)
        .resample(array.as_array(), &geo_transform(source_gt), &target)
        .map_err(to_py_err)?;
    Ok(resampled.into_pyarray(py))
}

/// Python wrapper for DemPile
#[pyclass(name = "DemPile")]
struct PyDemPile {
    inner: DemPile,
}

#[pymethods]
impl PyDemPile {
    #[new]
    #[pyo3(signature = (snapshot_path = None, output_prefix = None, method = "linear"))]
    fn new(snapshot_path: Option<String>, output_prefix: Option<String>, method: &str) -> PyResult<Self> {
        let method: ResampleMethod = method.parse().map_err(to_py_err)?;
        let mut inner = DemPile::new().with_resample_method(method);
        inner.snapshot_path = snapshot_path.map(PathBuf::from);
        inner.dhdt_prefix = output_prefix;
        Ok(PyDemPile { inner })
    }

    /// Add one survey from an array, its geotransform, date string and uncertainty
    #[pyo3(signature = (array, geotransform, date, uncertainty, no_data = None))]
    fn add_dem(
        &mut self,
        array: PyReadonlyArray2<f32>,
        geotransform: PyGeoTransform,
        date: &str,
        uncertainty: f64,
        no_data: Option<f64>,
    ) -> PyResult<()> {
        let date = parse_survey_date(date).map_err(to_py_err)?;
        let survey = Survey::new(array.as_array().to_owned(), geo_transform(geotransform), date, uncertainty)
            .with_no_data(no_data);
        self.inner.add_dem(survey);
        Ok(())
    }

    fn sort_by_date(&mut self) {
        self.inner.sort_by_date();
    }

    /// Reference geometry from an array whose non-zero cells are valid
    fn set_ref_geo(&mut self, array: PyReadonlyArray2<f32>, geotransform: PyGeoTransform) {
        let values = array.as_array().to_owned();
        self.inner
            .set_ref_geo(ReferenceGrid::from_values(&values, geo_transform(geotransform)));
    }

    fn set_ref_date(&mut self, date: &str) -> PyResult<()> {
        self.inner.set_ref_date_str(date).map_err(to_py_err)
    }

    fn init_ts(&mut self) -> PyResult<()> {
        self.inner.init_ts().map_err(to_py_err)
    }

    fn pile_up(&mut self, py: Python) -> PyResult<()> {
        py.allow_threads(|| self.inner.pile_up()).map_err(to_py_err)
    }

    fn polyfit(&mut self, py: Python) -> PyResult<()> {
        py.allow_threads(|| self.inner.polyfit().map(|_| ())).map_err(to_py_err)
    }

    fn dump_snapshot(&self) -> PyResult<()> {
        self.inner.dump_snapshot().map_err(to_py_err)
    }

    fn load_snapshot(&mut self) -> PyResult<()> {
        self.inner.load_snapshot().map_err(to_py_err)
    }

    /// Number of observations accumulated at `(row, col)`
    fn series_len(&self, row: usize, col: usize) -> PyResult<usize> {
        self.inner
            .ts()
            .and_then(|ts| ts.get(row, col))
            .map(|series| series.len())
            .ok_or_else(|| PyValueError::new_err(format!("no series at ({}, {})", row, col)))
    }

    #[getter]
    fn slope<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f64>> {
        self.fit_grid(py, |f| &f.slope)
    }

    #[getter]
    fn slope_err<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f64>> {
        self.fit_grid(py, |f| &f.slope_err)
    }

    #[getter]
    fn residual<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f64>> {
        self.fit_grid(py, |f| &f.residual)
    }

    #[getter]
    fn count<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f64>> {
        self.fit_grid(py, |f| &f.count)
    }

    fn __repr__(&self) -> String {
        format!(
            "DemPile(dems={}, ref_date={:?}, fitted={})",
            self.inner.dems().len(),
            self.inner.ref_date().map(|d| d.to_string()),
            self.inner.fitdata().is_some()
        )
    }
}

impl PyDemPile {
    fn fit_grid<'py>(
        &self,
        py: Python<'py>,
        select: impl Fn(&crate::types::FitGrids) -> &crate::types::ValueGrid,
    ) -> PyResult<&'py PyArray2<f64>> {
        let fitdata = self
            .inner
            .fitdata()
            .ok_or_else(|| PyRuntimeError::new_err("no fit results; call polyfit first"))?;
        Ok(select(fitdata).clone().into_pyarray(py))
    }
}
