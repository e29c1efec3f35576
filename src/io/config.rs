use crate::core::resample::ResampleMethod;
use crate::types::{parse_reference_date, parse_survey_date, DhdtError, DhdtResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// One input survey: raster path, capture date and 1-sigma uncertainty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyEntry {
    pub path: PathBuf,
    /// `YYYY-MM-DD`, `YYYYMMDD` or `YYMMMDD`
    pub date: String,
    pub uncertainty: f64,
}

/// Run configuration for a dh/dt computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhdtConfig {
    pub surveys: Vec<SurveyEntry>,
    /// Raster whose non-zero cells define the validity mask
    pub reference_geometry: PathBuf,
    /// `YYYY-MM-DD`
    pub reference_date: String,
    pub snapshot_path: PathBuf,
    pub output_prefix: String,
    #[serde(default)]
    pub resample_method: ResampleMethod,
    #[serde(default = "default_min_time_span")]
    pub min_time_span_days: i64,
}

fn default_min_time_span() -> i64 {
    200
}

impl DhdtConfig {
    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> DhdtResult<Self> {
        let path = path.as_ref();
        log::info!("Reading configuration from {}", path.display());

        let reader = BufReader::new(File::open(path)?);
        let config: DhdtConfig = serde_json::from_reader(reader)
            .map_err(|e| DhdtError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required values; reports the first problem found
    pub fn validate(&self) -> DhdtResult<()> {
        if self.surveys.is_empty() {
            return Err(DhdtError::Config("no surveys listed".to_string()));
        }
        if self.reference_geometry.as_os_str().is_empty() {
            return Err(DhdtError::Config("reference_geometry path is empty".to_string()));
        }
        if self.snapshot_path.as_os_str().is_empty() {
            return Err(DhdtError::Config("snapshot_path is empty".to_string()));
        }
        if self.output_prefix.trim().is_empty() {
            return Err(DhdtError::Config("output_prefix is empty".to_string()));
        }
        if self.min_time_span_days < 0 {
            return Err(DhdtError::Config(format!(
                "min_time_span_days must not be negative, got {}",
                self.min_time_span_days
            )));
        }
        parse_reference_date(&self.reference_date)?;

        for entry in &self.surveys {
            if entry.path.as_os_str().is_empty() {
                return Err(DhdtError::Config("survey with empty path".to_string()));
            }
            parse_survey_date(&entry.date)?;
            if !(entry.uncertainty > 0.0) || !entry.uncertainty.is_finite() {
                return Err(DhdtError::Config(format!(
                    "{}: uncertainty must be positive, got {}",
                    entry.path.display(),
                    entry.uncertainty
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "surveys": [
            {"path": "dems/a.tif", "date": "2012-08-01", "uncertainty": 2.0},
            {"path": "dems/b.tif", "date": "20140715", "uncertainty": 3.5},
            {"path": "dems/c.tif", "date": "16Jul27", "uncertainty": 1.0}
        ],
        "reference_geometry": "refgeo.tif",
        "reference_date": "2012-01-01",
        "snapshot_path": "ts.json",
        "output_prefix": "out/site"
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config: DhdtConfig = serde_json::from_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.surveys.len(), 3);
        assert_eq!(config.resample_method, ResampleMethod::Linear);
        assert_eq!(config.min_time_span_days, 200);
    }

    #[test]
    fn test_rejects_bad_dates() {
        let mut config: DhdtConfig = serde_json::from_str(SAMPLE).unwrap();
        config.reference_date = "2012/01/01".to_string();
        assert!(matches!(config.validate(), Err(DhdtError::InvalidDate(_))));

        let mut config: DhdtConfig = serde_json::from_str(SAMPLE).unwrap();
        config.surveys[1].date = "July 2014".to_string();
        assert!(matches!(config.validate(), Err(DhdtError::InvalidDate(_))));
    }

    #[test]
    fn test_rejects_missing_values() {
        let mut config: DhdtConfig = serde_json::from_str(SAMPLE).unwrap();
        config.output_prefix = String::new();
        assert!(matches!(config.validate(), Err(DhdtError::Config(_))));

        let mut config: DhdtConfig = serde_json::from_str(SAMPLE).unwrap();
        config.surveys[0].uncertainty = 0.0;
        assert!(matches!(config.validate(), Err(DhdtError::Config(_))));

        let missing = r#"{"surveys": [], "reference_geometry": "r.tif"}"#;
        assert!(serde_json::from_str::<DhdtConfig>(missing).is_err());
    }

    #[test]
    fn test_method_from_json() {
        let json = SAMPLE.replace(r#""output_prefix": "out/site""#, r#""output_prefix": "out/site", "resample_method": "cubic""#);
        let config: DhdtConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.resample_method, ResampleMethod::Cubic);
    }
}
