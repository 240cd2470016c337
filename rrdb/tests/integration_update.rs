//! Integration tests for the update path: samples through datasources and
//! archives down to stored rows.

use rrdb::error::{NotFoundError, OrderingError, ValidationError};
use rrdb::{
    ArcDef, ConsolidationFn, DsDef, DsType, FileBackendFactory, MemoryBackendFactory,
    MmapBackendFactory, RrdDb, RrdDef, RrdError,
};
use tempfile::tempdir;

const STEP: u64 = 300;

/// A multiple of 900 so three-step rows start on the boundary.
const START: u64 = 1_699_999_200;

/// One GAUGE datasource bounded to `[0, 100]`, one AVERAGE archive of three
/// single-step rows, created one step before `t0`.
fn scenario_def(path: impl Into<std::path::PathBuf>, t0: u64) -> RrdDef {
    let mut def = RrdDef::new(path, t0 - STEP, STEP);
    def.add_datasource(DsDef::new("ds", DsType::Gauge, 2 * STEP, 0.0, 100.0))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 3));
    def
}

fn fetch(db: &RrdDb, cf: ConsolidationFn, start: u64, end: u64, resolution: u64) -> Vec<f64> {
    db.create_fetch_request(cf, start, end)
        .unwrap()
        .with_resolution(resolution)
        .fetch_data()
        .unwrap()
        .values(0)
        .unwrap()
        .to_vec()
}

fn assert_values(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        if e.is_nan() {
            assert!(a.is_nan(), "{actual:?} vs {expected:?}");
        } else {
            assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
        }
    }
}

#[test]
fn test_three_gauge_updates_fill_three_rows() {
    let dir = tempdir().unwrap();
    let t0 = START + 900;
    let factory = FileBackendFactory::new();
    let db = RrdDb::create(&scenario_def(dir.path().join("scenario.rrd"), t0), &factory).unwrap();

    db.update(t0, &[("ds", 10.0)]).unwrap();
    db.update(t0 + 300, &[("ds", 20.0)]).unwrap();
    db.update(t0 + 600, &[("ds", 30.0)]).unwrap();

    let data = db
        .create_fetch_request(ConsolidationFn::Average, t0, t0 + 900)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(data.timestamps(), &[t0, t0 + 300, t0 + 600]);
    assert_eq!(data.values_by_name("ds").unwrap(), &[10.0, 20.0, 30.0]);
    db.close().unwrap();
}

#[test]
fn test_fourth_update_overwrites_oldest_row() {
    let t0 = START + 900;
    let factory = MemoryBackendFactory::new();
    let db = RrdDb::create(&scenario_def("/wrap.rrd", t0), &factory).unwrap();
    for (i, v) in [10.0, 20.0, 30.0, 40.0].into_iter().enumerate() {
        db.update(t0 + 300 * i as u64, &[("ds", v)]).unwrap();
    }

    assert_values(
        &fetch(&db, ConsolidationFn::Average, t0, t0 + 1200, 1),
        &[f64::NAN, 20.0, 30.0, 40.0],
    );
}

#[test]
fn test_out_of_range_value_is_unknown() {
    let t0 = START + 900;
    let factory = MemoryBackendFactory::new();
    let db = RrdDb::create(&scenario_def("/range.rrd", t0), &factory).unwrap();

    db.update(t0, &[("ds", 10.0)]).unwrap();
    db.update(t0 + 300, &[("ds", 150.0)]).unwrap();
    db.update(t0 + 600, &[("ds", 30.0)]).unwrap();

    assert_values(
        &fetch(&db, ConsolidationFn::Average, t0, t0 + 900, 1),
        &[10.0, f64::NAN, 30.0],
    );
}

#[test]
fn test_non_monotonic_update_changes_nothing() {
    let t0 = START + 900;
    let factory = MemoryBackendFactory::new();
    let db = RrdDb::create(&scenario_def("/order.rrd", t0), &factory).unwrap();
    db.update(t0, &[("ds", 10.0)]).unwrap();
    let image = db.bytes().unwrap();

    for t in [t0, t0 - 1, t0 - 600] {
        let err = db.update(t, &[("ds", 20.0)]).unwrap_err();
        assert!(matches!(
            err,
            RrdError::Ordering(OrderingError::NonMonotonic { last_update, .. }) if last_update == t0
        ));
    }
    assert_eq!(db.bytes().unwrap(), image);
    assert_eq!(db.last_update_time(), t0);
}

#[test]
fn test_storage_stays_bounded() {
    let dir = tempdir().unwrap();
    let mut def = RrdDef::new(dir.path().join("bounded.rrd"), START, STEP);
    def.add_datasource(DsDef::gauge("load", STEP))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 5))
        .add_archive(ArcDef::new(ConsolidationFn::Max, 0.5, 4, 5));
    let expected_size = def.estimated_size();

    let factory = MmapBackendFactory::new();
    let db = RrdDb::create(&def, &factory).unwrap();
    for i in 1..=100u32 {
        db.update(START + u64::from(i) * STEP, &[("load", f64::from(i))]).unwrap();
    }
    assert_eq!(db.bytes().unwrap().len() as u64, expected_size);

    let end = db.last_update_time() + STEP;
    let values = fetch(&db, ConsolidationFn::Average, START, end, 1);
    let known: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
    assert_eq!(known, vec![96.0, 97.0, 98.0, 99.0, 100.0]);
}

#[test]
fn test_multi_step_consolidation_functions() {
    let factory = MemoryBackendFactory::new();
    let mut def = RrdDef::new("/cf.rrd", START, STEP);
    def.add_datasource(DsDef::gauge("v", STEP));
    for cf in ConsolidationFn::ALL {
        def.add_archive(ArcDef::new(cf, 0.5, 3, 10));
    }
    def.add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 10));
    let db = RrdDb::create(&def, &factory).unwrap();

    for (i, v) in [1.0, 5.0, 3.0].into_iter().enumerate() {
        db.update(START + 300 * (i as u64 + 1), &[("v", v)]).unwrap();
    }

    let row = START + 900;
    let expected = [
        (ConsolidationFn::Average, 3.0),
        (ConsolidationFn::Min, 1.0),
        (ConsolidationFn::Max, 5.0),
        (ConsolidationFn::Last, 3.0),
    ];
    for (cf, value) in expected {
        assert_values(&fetch(&db, cf, row, row + 900, 900), &[value]);
    }

    // The single-step archive is the closer match at fine resolution.
    assert_values(
        &fetch(&db, ConsolidationFn::Average, START + 300, START + 900, 300),
        &[1.0, 5.0],
    );
}

#[test]
fn test_xff_limits_unknown_steps() {
    let factory = MemoryBackendFactory::new();
    let mut def = RrdDef::new("/xff.rrd", START, STEP);
    def.add_datasource(DsDef::gauge("v", STEP))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 3, 10));
    let db = RrdDb::create(&def, &factory).unwrap();

    // One unknown of three is tolerated, two are not.
    let samples = [1.0, f64::NAN, 3.0, 4.0, f64::NAN, f64::NAN];
    for (i, v) in samples.into_iter().enumerate() {
        db.store_values(START + 300 * (i as u64 + 1), &[v]).unwrap();
    }

    assert_values(
        &fetch(&db, ConsolidationFn::Average, START + 900, START + 2700, 900),
        &[2.0, f64::NAN],
    );
}

#[test]
fn test_heartbeat_gap_is_unknown() {
    let factory = MemoryBackendFactory::new();
    let mut def = RrdDef::new("/gap.rrd", START, STEP);
    def.add_datasource(DsDef::new("v", DsType::Gauge, 600, f64::NAN, f64::NAN))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 10));
    let db = RrdDb::create(&def, &factory).unwrap();

    db.update(START + 300, &[("v", 1.0)]).unwrap();
    db.update(START + 1500, &[("v", 5.0)]).unwrap();

    assert_values(
        &fetch(&db, ConsolidationFn::Average, START + 300, START + 1800, 1),
        &[1.0, f64::NAN, f64::NAN, f64::NAN, f64::NAN],
    );
}

#[test]
fn test_counter_rate() {
    let factory = MemoryBackendFactory::new();
    let mut def = RrdDef::new("/counter.rrd", START, STEP);
    def.add_datasource(DsDef::new("bytes", DsType::Counter, 600, 0.0, f64::NAN))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 10));
    let db = RrdDb::create(&def, &factory).unwrap();

    db.update(START + 300, &[("bytes", 1_000.0)]).unwrap();
    db.update(START + 600, &[("bytes", 4_000.0)]).unwrap();
    db.update(START + 900, &[("bytes", 10_000.0)]).unwrap();

    // No previous value for the first sample.
    assert_values(
        &fetch(&db, ConsolidationFn::Average, START + 300, START + 1200, 1),
        &[f64::NAN, 10.0, 20.0],
    );
}

#[test]
fn test_sample_api() {
    let factory = MemoryBackendFactory::new();
    let mut def = RrdDef::new("/sample.rrd", START, STEP);
    def.add_datasource(DsDef::gauge("a", STEP))
        .add_datasource(DsDef::gauge("b", STEP))
        .add_archive(ArcDef::new(ConsolidationFn::Last, 0.5, 1, 10));
    let db = RrdDb::create(&def, &factory).unwrap();

    let mut sample = db.create_sample(START + 300);
    assert!(sample.values().iter().all(|v| v.is_nan()));
    sample.set_value("b", 2.0).unwrap().set_value_at(0, 1.0).unwrap();
    assert_eq!(sample.to_string(), format!("{}:1:2", START + 300));
    sample.update().unwrap();

    sample.clear().set_time(START + 600);
    sample.set_values(&[3.0]).unwrap();
    assert_eq!(sample.to_string(), format!("{}:3:U", START + 600));
    sample.update().unwrap();

    sample.set_and_update(&format!("{}:5:U", START + 900)).unwrap();

    let data = db
        .create_fetch_request(ConsolidationFn::Last, START + 300, START + 1200)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_values(data.values_by_name("a").unwrap(), &[1.0, 3.0, 5.0]);
    assert_values(data.values_by_name("b").unwrap(), &[2.0, f64::NAN, f64::NAN]);
}

#[test]
fn test_sample_errors() {
    let factory = MemoryBackendFactory::new();
    let mut def = RrdDef::new("/sample_err.rrd", START, STEP);
    def.add_datasource(DsDef::gauge("a", STEP))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 10));
    let db = RrdDb::create(&def, &factory).unwrap();
    let mut sample = db.create_sample(START + 300);

    assert!(matches!(
        sample.set_value("nope", 1.0),
        Err(RrdError::NotFound(NotFoundError::Datasource { .. }))
    ));
    assert!(matches!(
        sample.set_value_at(1, 1.0),
        Err(RrdError::Validation(ValidationError::ValueCount { .. }))
    ));
    assert!(matches!(
        sample.set_values(&[1.0, 2.0]),
        Err(RrdError::Validation(ValidationError::ValueCount { .. }))
    ));
    for bad in ["", "abc:1", "100:1:2", "100:x"] {
        assert!(
            matches!(
                sample.set_and_update(bad),
                Err(RrdError::Validation(ValidationError::InvalidUpdateString { .. }))
            ),
            "{bad}"
        );
    }
    assert_eq!(db.last_update_time(), START);
}
