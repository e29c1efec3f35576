use crate::types::{
    parse_survey_date, DhdtError, DhdtResult, ElevationGrid, GeoTransform, ReferenceGrid, Survey, ValueGrid,
};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Reads single-band elevation rasters
pub struct RasterReader;

impl RasterReader {
    /// Read band 1 as f32 together with its geotransform and no-data value
    pub fn read_band<P: AsRef<Path>>(path: P) -> DhdtResult<(ElevationGrid, GeoTransform, Option<f64>, String)> {
        let path = path.as_ref();
        log::debug!("Reading raster: {}", path.display());

        let dataset = Dataset::open(path)?;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (width, height) = dataset.raster_size();

        let rasterband = dataset.rasterband(1)?;
        let no_data = rasterband.no_data_value();
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

        let grid = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| DhdtError::InvalidFormat(format!("{}: {}", path.display(), e)))?;

        log::debug!("Raster size: {}x{}, geotransform: {:?}", width, height, geo_transform);
        Ok((grid, geo_transform, no_data, dataset.projection()))
    }

    /// Load one survey; the label is the file stem
    pub fn read_survey<P: AsRef<Path>>(path: P, date: &str, uncertainty: f64) -> DhdtResult<Survey> {
        let path = path.as_ref();
        let date = parse_survey_date(date)?;
        let (data, transform, no_data, _) = Self::read_band(path)?;

        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Survey::new(data, transform, date, uncertainty)
            .with_label(label)
            .with_no_data(no_data))
    }

    /// Load the reference geometry; non-zero cells form the validity mask
    pub fn read_reference_grid<P: AsRef<Path>>(path: P) -> DhdtResult<ReferenceGrid> {
        let path = path.as_ref();
        log::info!("Reading reference geometry from {}", path.display());

        let (values, transform, no_data, projection) = Self::read_band(path)?;
        let mut reference = ReferenceGrid::from_values(&values, transform);
        reference.no_data = no_data;
        reference.projection = (!projection.is_empty()).then_some(projection);
        Ok(reference)
    }
}

/// Writes output grids on the reference geometry
pub struct RasterWriter;

impl RasterWriter {
    /// Single-band f32 GeoTIFF; NaN cells are written as the reference no-data value
    pub fn write_grid<P: AsRef<Path>>(path: P, grid: &ValueGrid, reference: &ReferenceGrid) -> DhdtResult<()> {
        let path = path.as_ref();
        if grid.dim() != reference.dim() {
            return Err(DhdtError::ShapeMismatch {
                expected: reference.dim(),
                found: grid.dim(),
            });
        }
        log::info!("Writing {}", path.display());

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = grid.dim();
        let no_data = reference.output_no_data();

        let mut dataset = driver.create_with_band_type::<f32, _>(path, width as isize, height as isize, 1)?;
        dataset.set_geo_transform(&reference.geometry.transform.to_gdal())?;
        if let Some(projection) = &reference.projection {
            dataset.set_projection(projection)?;
        }

        let flat_data: Vec<f32> = grid
            .iter()
            .map(|&v| if v.is_nan() { no_data as f32 } else { v as f32 })
            .collect();
        let mut rasterband = dataset.rasterband(1)?;
        let buffer = gdal::raster::Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        rasterband.set_no_data_value(Some(no_data))?;

        Ok(())
    }
}
