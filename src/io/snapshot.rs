//! Persisted snapshot of a piled-up [`PixelTimeSeriesStore`].
//!
//! The snapshot is a versioned JSON document holding the store as `rows`
//! nested lists of `cols` records, each with parallel `date`, `uncertainty`
//! and `value` sequences in insertion order.

use crate::core::pile::PixelTimeSeriesStore;
use crate::types::{DhdtError, DhdtResult, Observation, PixelSeries};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const SNAPSHOT_FORMAT: &str = "dempile-pixel-series";
const SNAPSHOT_VERSION: u32 = 1;

/// One pixel's series as three parallel sequences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub date: Vec<i64>,
    pub uncertainty: Vec<f64>,
    pub value: Vec<f64>,
}

impl From<&PixelSeries> for SeriesRecord {
    fn from(series: &PixelSeries) -> Self {
        let mut record = SeriesRecord::default();
        for obs in series.iter() {
            record.date.push(obs.date);
            record.uncertainty.push(obs.uncertainty);
            record.value.push(obs.value);
        }
        record
    }
}

impl TryFrom<SeriesRecord> for PixelSeries {
    type Error = DhdtError;

    fn try_from(record: SeriesRecord) -> Result<Self, Self::Error> {
        let n = record.date.len();
        if record.uncertainty.len() != n || record.value.len() != n {
            return Err(DhdtError::InvalidFormat(format!(
                "series record lengths differ: date={}, uncertainty={}, value={}",
                n,
                record.uncertainty.len(),
                record.value.len()
            )));
        }

        let observations = record
            .date
            .into_iter()
            .zip(record.uncertainty)
            .zip(record.value)
            .map(|((date, uncertainty), value)| Observation { date, uncertainty, value })
            .collect();
        Ok(PixelSeries::from_observations(observations))
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: String,
    version: u32,
    rows: usize,
    cols: usize,
    ts: Vec<Vec<SeriesRecord>>,
}

/// Write the whole store to `path`, replacing any existing file
pub fn persist_snapshot<P: AsRef<Path>>(store: &PixelTimeSeriesStore, path: P) -> DhdtResult<()> {
    let path = path.as_ref();
    let (rows, cols) = store.dim();
    log::info!("Writing time series snapshot ({}x{}) to {}", rows, cols, path.display());

    let ts = if cols == 0 {
        vec![Vec::new(); rows]
    } else {
        store
            .series()
            .chunks(cols)
            .map(|row| row.iter().map(SeriesRecord::from).collect())
            .collect()
    };
    let snapshot = Snapshot {
        format: SNAPSHOT_FORMAT.to_string(),
        version: SNAPSHOT_VERSION,
        rows,
        cols,
        ts,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, &snapshot)?;
    writer.flush()?;
    Ok(())
}

/// Read a store written by [`persist_snapshot`]
pub fn restore_snapshot<P: AsRef<Path>>(path: P) -> DhdtResult<PixelTimeSeriesStore> {
    let path = path.as_ref();
    log::info!("Loading time series snapshot from {}", path.display());

    let reader = BufReader::new(File::open(path)?);
    let snapshot: Snapshot = serde_json::from_reader(reader)?;

    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(DhdtError::InvalidFormat(format!(
            "{}: expected format '{}', found '{}'",
            path.display(),
            SNAPSHOT_FORMAT,
            snapshot.format
        )));
    }
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(DhdtError::InvalidFormat(format!(
            "{}: unsupported snapshot version {}",
            path.display(),
            snapshot.version
        )));
    }
    if snapshot.ts.len() != snapshot.rows || snapshot.ts.iter().any(|row| row.len() != snapshot.cols) {
        return Err(DhdtError::InvalidFormat(format!(
            "{}: nested series do not form a {}x{} grid",
            path.display(),
            snapshot.rows,
            snapshot.cols
        )));
    }

    let series = snapshot
        .ts
        .into_iter()
        .flatten()
        .map(PixelSeries::try_from)
        .collect::<DhdtResult<Vec<_>>>()?;
    PixelTimeSeriesStore::from_series(snapshot.rows, snapshot.cols, series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_preserves_order_and_bits() {
        let mut store = PixelTimeSeriesStore::new(2, 2);
        let mask = Array2::from_elem((2, 2), true);
        let first = Array2::from_shape_vec((2, 2), vec![1.1f64, 2.0, 0.0, 1.0 / 3.0]).unwrap();
        let second = Array2::from_shape_vec((2, 2), vec![0.1f64 + 0.2, -4.0, 5.5, 6.25]).unwrap();
        store.accumulate_slice(&second, &mask, 410, 0.7).unwrap();
        store.accumulate_slice(&first, &mask, -35, 2.0).unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ts.json");
        persist_snapshot(&store, &path).unwrap();
        let restored = restore_snapshot(&path).unwrap();

        assert_eq!(restored, store);
        let dates: Vec<i64> = restored.get(0, 0).unwrap().iter().map(|o| o.date).collect();
        assert_eq!(dates, vec![410, -35]);
    }

    #[test]
    fn test_rejects_mismatched_record() {
        let record = SeriesRecord {
            date: vec![1, 2],
            uncertainty: vec![1.0],
            value: vec![3.0, 4.0],
        };
        assert!(matches!(PixelSeries::try_from(record), Err(DhdtError::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_foreign_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.json");
        std::fs::write(&path, r#"{"format":"something-else","version":1,"rows":0,"cols":0,"ts":[]}"#).unwrap();
        assert!(matches!(restore_snapshot(&path), Err(DhdtError::InvalidFormat(_))));
    }
}
