use approx::assert_relative_eq;
use chrono::NaiveDate;
use dempile::core::{DemPile, ResampleMethod};
use dempile::io::{persist_snapshot, restore_snapshot};
use dempile::types::{GeoTransform, ReferenceGrid, Survey, NO_DATA};
use ndarray::Array2;
use tempfile::TempDir;

const RATE: f64 = -2.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn refdate() -> NaiveDate {
    NaiveDate::from_ymd_opt(2010, 1, 1).unwrap()
}

fn reference_grid() -> ReferenceGrid {
    let mut mask = Array2::from_elem((10, 10), true);
    mask.row_mut(9).fill(false);
    ReferenceGrid::new(GeoTransform::new(0.0, 100.0, 10.0, -10.0), mask)
}

/// Survey `offset` days after the reference date covering the first `cols` columns
fn survey(offset: i64, cols: usize, sigma: f64) -> Survey {
    let value = 1000.0 + RATE * offset as f64 / 365.25;
    let date = refdate() + chrono::Duration::days(offset);
    Survey::new(
        Array2::from_elem((10, cols), value as f32),
        GeoTransform::new(0.0, 100.0, 10.0, -10.0),
        date,
        sigma,
    )
    .with_label(format!("survey_{}", offset))
}

/// Full-coverage surveys at days 0 and 730, left-half surveys at 365 and 1095
fn piled_up(method: ResampleMethod) -> DemPile {
    let mut pile = DemPile::new().with_resample_method(method);
    pile.add_dems(vec![survey(1095, 5, 2.0), survey(0, 10, 1.0), survey(730, 10, 1.5), survey(365, 5, 1.0)]);
    pile.sort_by_date();
    pile.set_ref_geo(reference_grid());
    pile.set_ref_date(refdate());

    let result = pile.pile_up();
    assert!(result.is_ok());
    pile
}

#[test]
fn test_pile_up_partial_footprints() {
    init_logging();
    let pile = piled_up(ResampleMethod::Linear);
    let ts = pile.ts().unwrap();

    assert_eq!(ts.dim(), (10, 10));
    assert_eq!(ts.get(0, 0).unwrap().len(), 4);
    assert_eq!(ts.get(3, 4).unwrap().len(), 4);
    assert_eq!(ts.get(3, 5).unwrap().len(), 2);
    assert!(ts.get(9, 0).unwrap().is_empty());

    let dates: Vec<i64> = ts.get(0, 0).unwrap().iter().map(|o| o.date).collect();
    assert_eq!(dates, vec![0, 365, 730, 1095]);
    assert_eq!(ts.total_observations(), 9 * 5 * 4 + 9 * 5 * 2);
}

#[test]
fn test_polyfit_rates_counts_and_gating() {
    init_logging();
    let mut pile = piled_up(ResampleMethod::Linear);
    let fitdata = pile.polyfit().unwrap().clone();

    for row in 0..9 {
        for col in 0..5 {
            assert_relative_eq!(fitdata.slope[[row, col]], RATE, max_relative = 1e-3);
            assert!(fitdata.slope_err[[row, col]].is_finite());
            assert!(fitdata.slope_err[[row, col]] != NO_DATA);
            assert!(fitdata.residual[[row, col]] < 1e-6);
            assert_eq!(fitdata.count[[row, col]], 4.0);
        }
        for col in 5..10 {
            // Two distinct dates never pass the gate
            assert_eq!(fitdata.slope[[row, col]], NO_DATA);
            assert_eq!(fitdata.slope_err[[row, col]], NO_DATA);
            assert_eq!(fitdata.residual[[row, col]], NO_DATA);
            assert_eq!(fitdata.count[[row, col]], 2.0);
        }
    }
    for col in 0..10 {
        assert_eq!(fitdata.count[[9, col]], NO_DATA);
        assert_eq!(fitdata.slope[[9, col]], NO_DATA);
    }
}

#[test]
fn test_disjoint_survey_adds_nothing() {
    init_logging();
    let mut pile = DemPile::new();
    let far_away = Survey::new(
        Array2::from_elem((4, 4), 500.0),
        GeoTransform::new(10_000.0, 10_000.0, 10.0, -10.0),
        refdate(),
        1.0,
    );
    pile.add_dem(far_away);
    pile.set_ref_geo(reference_grid());
    pile.set_ref_date(refdate());

    pile.pile_up().unwrap();
    assert_eq!(pile.ts().unwrap().total_observations(), 0);
}

#[test]
fn test_snapshot_round_trip_through_pile() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut pile = piled_up(ResampleMethod::Cubic);
    pile.snapshot_path = Some(dir.path().join("ts.json"));
    pile.dump_snapshot().unwrap();

    let mut restored = DemPile::new();
    restored.snapshot_path = pile.snapshot_path.clone();
    restored.set_ref_geo(reference_grid());
    restored.load_snapshot().unwrap();
    assert_eq!(restored.ts(), pile.ts());

    let original = pile.polyfit().unwrap().clone();
    let refit = restored.polyfit().unwrap();
    assert_eq!(refit.slope, original.slope);
    assert_eq!(refit.count, original.count);
}

#[test]
fn test_snapshot_shape_must_match_reference() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("small.json");
    persist_snapshot(&dempile::PixelTimeSeriesStore::new(3, 3), &path).unwrap();
    assert_eq!(restore_snapshot(&path).unwrap().dim(), (3, 3));

    let mut pile = DemPile::new();
    pile.snapshot_path = Some(path);
    pile.set_ref_geo(reference_grid());
    assert!(pile.load_snapshot().is_err());
}
