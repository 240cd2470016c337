//! Integration tests for queries: archive selection, filters, aggregation.

use rrdb::error::{NotFoundError, ValidationError};
use rrdb::{
    ArcDef, ConsolidationFn, DsDef, Expression, MemoryBackendFactory, RrdDb, RrdDef, RrdError,
};

const STEP: u64 = 60;
const START: u64 = 1_700_002_800;

/// Two datasources; a fine AVERAGE archive holding 10 rows of one step and
/// a coarse one holding 10 rows of ten steps.
fn populated(factory: &MemoryBackendFactory, path: &str) -> RrdDb {
    let mut def = RrdDef::new(path, START, STEP);
    def.add_datasource(DsDef::gauge("rx", STEP))
        .add_datasource(DsDef::gauge("tx", STEP))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 10))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 10, 10));
    let db = RrdDb::create(&def, factory).unwrap();

    for i in 1..=30u32 {
        let t = START + u64::from(i) * STEP;
        db.store_values(t, &[f64::from(i), f64::from(i) * 2.0]).unwrap();
    }
    db
}

#[test]
fn test_full_match_preferred_over_partial() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/select.rrd");
    let last = db.last_update_time();

    // The fine archive only reaches back ten minutes; the coarse one covers
    // the whole window.
    let request = db
        .create_fetch_request(ConsolidationFn::Average, last - 1200, last)
        .unwrap();
    assert_eq!(db.find_matching_archive(&request).unwrap(), 1);
    let data = request.fetch_data().unwrap();
    assert_eq!(data.arc_index(), 1);
    assert_eq!(data.step(), 600);

    // Inside the fine archive's span, the fine archive is the closer step.
    let request = db
        .create_fetch_request(ConsolidationFn::Average, last - 300, last)
        .unwrap();
    assert_eq!(request.fetch_data().unwrap().arc_index(), 0);
    let coarse = request.clone().with_resolution(600).fetch_data().unwrap();
    assert_eq!(coarse.arc_index(), 1);
}

#[test]
fn test_missing_consolidation_fn_is_not_found() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/missing.rrd");
    let err = db
        .create_fetch_request(ConsolidationFn::Max, START, START + 600)
        .unwrap()
        .fetch_data()
        .unwrap_err();
    assert!(matches!(
        err,
        RrdError::NotFound(NotFoundError::NoMatchingArchive {
            consolidation_fn: ConsolidationFn::Max
        })
    ));
}

#[test]
fn test_invalid_time_range() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/range.rrd");
    for (start, end) in [(START, START), (START + 60, START)] {
        assert!(matches!(
            db.create_fetch_request(ConsolidationFn::Average, start, end),
            Err(RrdError::Validation(ValidationError::InvalidTimeRange { .. }))
        ));
    }
}

#[test]
fn test_values_and_rows() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/values.rrd");
    let last = db.last_update_time();

    let data = db
        .create_fetch_request(ConsolidationFn::Average, last - 120, last + 60)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(data.timestamps(), &[last - 120, last - 60, last]);
    assert_eq!(data.ds_names(), &["rx".to_string(), "tx".to_string()]);
    assert_eq!(data.values_by_name("rx").unwrap(), &[28.0, 29.0, 30.0]);
    assert_eq!(data.values(1).unwrap(), &[56.0, 58.0, 60.0]);

    let row = data.row(2).unwrap();
    assert_eq!(row.timestamp, last);
    assert_eq!(row.values, vec![30.0, 60.0]);
    assert_eq!(data.first_timestamp(), last - 120);
    assert_eq!(data.last_timestamp(), last);
}

#[test]
fn test_coarse_rows_average_fine_steps() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/coarse.rrd");

    // Rows of ten steps each: (1..=10), (11..=20), (21..=30).
    let data = db
        .create_fetch_request(ConsolidationFn::Average, START + 600, START + 2400)
        .unwrap()
        .with_resolution(600)
        .fetch_data()
        .unwrap();
    assert_eq!(
        data.timestamps(),
        &[START + 600, START + 1200, START + 1800]
    );
    assert_eq!(data.values_by_name("rx").unwrap(), &[5.5, 15.5, 25.5]);
}

#[test]
fn test_filter_selects_and_orders_columns() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/filter.rrd");
    let last = db.last_update_time();

    let data = db
        .create_fetch_request(ConsolidationFn::Average, last - 60, last + 60)
        .unwrap()
        .with_filter(["tx"])
        .fetch_data()
        .unwrap();
    assert_eq!(data.column_count(), 1);
    assert_eq!(data.ds_names(), &["tx".to_string()]);
    assert_eq!(data.values(0).unwrap(), &[58.0, 60.0]);
    assert!(matches!(
        data.values_by_name("rx"),
        Err(RrdError::NotFound(NotFoundError::Datasource { .. }))
    ));

    let err = db
        .create_fetch_request(ConsolidationFn::Average, last - 60, last + 60)
        .unwrap()
        .with_filter(["rx", "bogus"])
        .fetch_data()
        .unwrap_err();
    assert!(matches!(
        err,
        RrdError::NotFound(NotFoundError::Datasource { ref name }) if name == "bogus"
    ));
}

#[test]
fn test_window_without_history_is_all_unknown() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/empty.rrd");

    let data = db
        .create_fetch_request(ConsolidationFn::Average, START - 36_000, START - 30_000)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert!(data.row_count() > 0);
    assert!(data.values(0).unwrap().iter().all(|v| v.is_nan()));
    assert!(data.aggregate("rx", ConsolidationFn::Average).unwrap().is_nan());
}

#[test]
fn test_aggregates() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/aggregate.rrd");
    let last = db.last_update_time();

    let data = db
        .create_fetch_request(ConsolidationFn::Average, last - 240, last + 60)
        .unwrap()
        .fetch_data()
        .unwrap();
    // rx rows: 26, 27, 28, 29, 30
    assert_eq!(data.aggregate("rx", ConsolidationFn::Average).unwrap(), 28.0);
    assert_eq!(data.aggregate("rx", ConsolidationFn::Min).unwrap(), 26.0);
    assert_eq!(data.aggregate("rx", ConsolidationFn::Max).unwrap(), 30.0);
    assert_eq!(data.aggregate("rx", ConsolidationFn::Last).unwrap(), 30.0);

    let to_bits = Expression::compile("value,8,*").unwrap();
    assert_eq!(
        data.aggregate_with("tx", ConsolidationFn::Max, &to_bits).unwrap(),
        480.0
    );
    assert!(data.aggregate("nope", ConsolidationFn::Max).is_err());
}

#[test]
fn test_start_match_and_arc_index() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/start.rrd");
    let last = db.last_update_time();

    assert_eq!(db.find_start_match_archive(ConsolidationFn::Average, last - 300, 1).unwrap(), 0);
    assert_eq!(db.find_start_match_archive(ConsolidationFn::Average, last - 3000, 1).unwrap(), 1);
    assert!(db.find_start_match_archive(ConsolidationFn::Last, last, 1).is_err());

    assert_eq!(db.arc_index(ConsolidationFn::Average, 10).unwrap(), 1);
    assert!(matches!(
        db.arc_index(ConsolidationFn::Average, 5),
        Err(RrdError::NotFound(NotFoundError::Archive { steps: 5, .. }))
    ));
}

#[test]
fn test_json_output() {
    let factory = MemoryBackendFactory::new();
    let db = populated(&factory, "/json.rrd");
    let last = db.last_update_time();

    let data = db
        .create_fetch_request(ConsolidationFn::Average, last - 60, last + 60)
        .unwrap()
        .fetch_data()
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&data.to_json().unwrap()).unwrap();
    assert_eq!(json["step"], 60);
    assert_eq!(json["ds_names"][1], "tx");
    assert_eq!(json["rows"][1]["timestamp"], last);
    assert_eq!(json["rows"][1]["values"][0], 30.0);
}
