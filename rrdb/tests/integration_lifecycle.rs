//! Integration tests for the database lifecycle: create, reopen, locking,
//! close, and state copies.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rrdb::backend::LOCK_DELAY;
use rrdb::error::{BackendError, FormatError, LockError, ValidationError};
use rrdb::{
    ArcDef, ConsolidationFn, DsDef, FileBackendFactory, LockMode, MmapBackendFactory, RrdDb,
    RrdDef, RrdError, State, WriterRegistry,
};
use tempfile::tempdir;

const STEP: u64 = 60;
const START: u64 = 1_700_000_040;

fn def(path: impl Into<std::path::PathBuf>) -> RrdDef {
    let mut def = RrdDef::new(path, START, STEP);
    def.add_datasource(DsDef::gauge("cpu", STEP))
        .add_datasource(DsDef::gauge("mem", STEP))
        .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 60))
        .add_archive(ArcDef::new(ConsolidationFn::Max, 0.5, 5, 24));
    def
}

fn fill(db: &RrdDb, from: u32, to: u32) {
    for i in from..=to {
        let t = START + u64::from(i) * STEP;
        db.store_values(t, &[f64::from(i), f64::from(i % 7)]).unwrap();
    }
}

fn fetch_all(db: &RrdDb, cf: ConsolidationFn) -> Vec<Vec<f64>> {
    let last = db.last_update_time();
    let data = db
        .create_fetch_request(cf, START, last + STEP)
        .unwrap()
        .fetch_data()
        .unwrap();
    (0..data.column_count())
        .map(|i| data.values(i).unwrap().to_vec())
        .collect()
}

fn same(a: &[Vec<f64>], b: &[Vec<f64>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|(p, q)| (p.is_nan() && q.is_nan()) || p == q)
        })
}

#[test]
fn test_reopen_persists_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.rrd");
    let factory = FileBackendFactory::new();

    let (average, max) = {
        let db = RrdDb::create(&def(&path), &factory).unwrap();
        assert_eq!(db.state(), State::Created);
        fill(&db, 1, 40);
        let snapshot = (
            fetch_all(&db, ConsolidationFn::Average),
            fetch_all(&db, ConsolidationFn::Max),
        );
        db.close().unwrap();
        snapshot
    };

    let db = RrdDb::open(&path, false, &factory).unwrap();
    assert_eq!(db.state(), State::Open);
    assert_eq!(db.last_update_time(), START + 40 * STEP);
    assert_eq!(db.ds_names(), vec!["cpu".to_string(), "mem".to_string()]);
    assert!(same(&fetch_all(&db, ConsolidationFn::Average), &average));
    assert!(same(&fetch_all(&db, ConsolidationFn::Max), &max));

    // Keeps accumulating where it left off.
    fill(&db, 41, 45);
    assert_eq!(db.last_update_time(), START + 45 * STEP);
}

#[test]
fn test_definition_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("def.rrd");
    let original = def(&path);
    let db = RrdDb::create(&original, &MmapBackendFactory::new()).unwrap();

    let restored = db.definition();
    assert_eq!(restored.path, path);
    assert_eq!(restored.step, original.step);
    assert_eq!(restored.start_time, START);
    assert_eq!(restored.datasources.len(), 2);
    assert_eq!(restored.archives, original.archives);
    assert_eq!(restored.estimated_size(), original.estimated_size());
}

#[test]
fn test_close_is_idempotent_and_final() {
    let dir = tempdir().unwrap();
    let factory = FileBackendFactory::new();
    let db = RrdDb::create(&def(dir.path().join("close.rrd")), &factory).unwrap();
    fill(&db, 1, 3);

    db.close().unwrap();
    db.close().unwrap();
    assert!(db.is_closed());

    assert!(matches!(
        db.store_values(START + 600, &[1.0, 1.0]),
        Err(RrdError::Closed { .. })
    ));
    let request = db
        .create_fetch_request(ConsolidationFn::Average, START, START + 600)
        .unwrap();
    assert!(matches!(request.fetch_data(), Err(RrdError::Closed { .. })));
    assert!(matches!(db.sync(), Err(RrdError::Closed { .. })));
    assert!(factory.registry().is_empty());
}

#[test]
fn test_second_writer_in_process_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("twice.rrd");
    let factory = FileBackendFactory::new();
    let db = RrdDb::create(&def(&path), &factory).unwrap();

    assert!(matches!(
        RrdDb::open(&path, false, &factory),
        Err(RrdError::Lock(LockError::AlreadyOpen { .. }))
    ));

    // Readers do not claim the path.
    let reader = RrdDb::open(&path, true, &factory).unwrap();
    assert_eq!(reader.ds_count(), 2);

    // Dropping the writer releases its claim.
    drop(db);
    assert!(!factory.registry().is_claimed(&path));
    RrdDb::open(&path, false, &factory).unwrap();
}

#[test]
fn test_shared_registry_spans_factories() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.rrd");
    let registry = WriterRegistry::new();
    let files = FileBackendFactory::with_registry(registry.clone());
    let mapped = MmapBackendFactory::with_registry(registry.clone());

    let _db = RrdDb::create(&def(&path), &files).unwrap();
    assert!(matches!(
        RrdDb::open(&path, false, &mapped),
        Err(RrdError::Lock(LockError::AlreadyOpen { .. }))
    ));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_exception_if_locked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.rrd");
    let _holder = RrdDb::create_with_lock_mode(
        &def(&path),
        &FileBackendFactory::new(),
        LockMode::ExceptionIfLocked,
    )
    .unwrap();

    // A separate registry stands in for another process.
    let other = FileBackendFactory::new();
    assert!(matches!(
        RrdDb::open_with_lock_mode(&path, false, &other, LockMode::ExceptionIfLocked),
        Err(RrdError::Lock(LockError::Contended { .. }))
    ));
    assert!(other.registry().is_empty());
}

#[test]
fn test_wait_if_locked_blocks_until_release() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wait.rrd");
    let holder = RrdDb::create_with_lock_mode(
        &def(&path),
        &FileBackendFactory::new(),
        LockMode::ExceptionIfLocked,
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let path = path.clone();
        thread::spawn(move || {
            let result = RrdDb::open_with_lock_mode(
                &path,
                false,
                &FileBackendFactory::new(),
                LockMode::WaitIfLocked,
            );
            let opened = result.is_ok();
            drop(result);
            tx.send(opened).unwrap();
        })
    };

    // Still waiting after several polling intervals.
    assert!(rx.recv_timeout(LOCK_DELAY * 3).is_err());

    holder.close().unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    waiter.join().unwrap();
}

#[test]
fn test_crossed_copies_do_not_deadlock() {
    let dir = tempdir().unwrap();
    let factory = FileBackendFactory::new();
    let a = Arc::new(RrdDb::create(&def(dir.path().join("a.rrd")), &factory).unwrap());
    let b = Arc::new(RrdDb::create(&def(dir.path().join("b.rrd")), &factory).unwrap());
    fill(&a, 1, 10);

    let forward = {
        let (a, b) = (Arc::clone(&a), Arc::clone(&b));
        thread::spawn(move || {
            for _ in 0..200 {
                a.copy_state_to(&b).unwrap();
            }
        })
    };
    let backward = {
        let (a, b) = (Arc::clone(&a), Arc::clone(&b));
        thread::spawn(move || {
            for _ in 0..200 {
                b.copy_state_to(&a).unwrap();
            }
        })
    };
    forward.join().unwrap();
    backward.join().unwrap();

    assert_eq!(a.last_update_time(), START + 10 * STEP);
    assert_eq!(b.last_update_time(), START + 10 * STEP);
}

#[test]
fn test_validation_happens_before_allocation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("invalid.rrd");
    let mut bad = def(&path);
    bad.archives.push(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 10));

    assert!(matches!(
        RrdDb::create(&bad, &FileBackendFactory::new()),
        Err(RrdError::Validation(ValidationError::DuplicateArchive { .. }))
    ));
    assert!(!path.exists());
}

#[test]
fn test_open_errors() {
    let dir = tempdir().unwrap();
    let factory = FileBackendFactory::new();

    let missing = dir.path().join("missing.rrd");
    assert!(matches!(
        RrdDb::open(&missing, true, &factory),
        Err(RrdError::Io(BackendError::Missing { .. }))
    ));

    let garbage = dir.path().join("garbage.rrd");
    std::fs::write(&garbage, vec![0xAB; 512]).unwrap();
    assert!(matches!(
        RrdDb::open(&garbage, false, &factory),
        Err(RrdError::Format(FormatError::BadMagic { .. }))
    ));
    // A failed open releases its claim.
    assert!(factory.registry().is_empty());

    let tiny = dir.path().join("tiny.rrd");
    std::fs::write(&tiny, b"RRDB").unwrap();
    assert!(matches!(
        RrdDb::open(&tiny, true, &factory),
        Err(RrdError::Format(FormatError::TooSmall { .. }))
    ));
}

#[test]
fn test_copy_state_between_backends() {
    let dir = tempdir().unwrap();
    let source = RrdDb::create(&def(dir.path().join("src.rrd")), &FileBackendFactory::new()).unwrap();
    fill(&source, 1, 50);

    let target = RrdDb::create(&def(dir.path().join("dst.rrd")), &MmapBackendFactory::new()).unwrap();
    source.copy_state_to(&target).unwrap();
    source.copy_state_to(&source).unwrap();

    assert_eq!(target.last_update_time(), source.last_update_time());
    assert_eq!(
        target.datasource(0).unwrap().last_value(),
        source.datasource(0).unwrap().last_value()
    );
    for cf in [ConsolidationFn::Average, ConsolidationFn::Max] {
        assert!(same(&fetch_all(&target, cf), &fetch_all(&source, cf)));
    }
    assert_eq!(
        target.archive(1).unwrap().cdps(),
        source.archive(1).unwrap().cdps()
    );

    // Both continue identically.
    fill(&source, 51, 53);
    fill(&target, 51, 53);
    assert!(same(
        &fetch_all(&target, ConsolidationFn::Max),
        &fetch_all(&source, ConsolidationFn::Max)
    ));
}

#[test]
fn test_read_only_copy_target_is_rejected() {
    let dir = tempdir().unwrap();
    let factory = FileBackendFactory::new();
    let source = RrdDb::create(&def(dir.path().join("a.rrd")), &factory).unwrap();
    let path = dir.path().join("b.rrd");
    RrdDb::create(&def(&path), &factory).unwrap().close().unwrap();
    let target = RrdDb::open(&path, true, &factory).unwrap();

    assert!(matches!(
        source.copy_state_to(&target),
        Err(RrdError::ReadOnly { .. })
    ));
}

#[test]
fn test_concurrent_stores_and_fetches() {
    let dir = tempdir().unwrap();
    let db = Arc::new(RrdDb::create(&def(dir.path().join("threads.rrd")), &FileBackendFactory::new()).unwrap());

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || fill(&db, 1, 200))
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..50 {
                    let last = db.last_update_time();
                    let data = db
                        .create_fetch_request(ConsolidationFn::Average, START, last + STEP)
                        .unwrap()
                        .fetch_data()
                        .unwrap();
                    assert_eq!(data.column_count(), 2);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.last_update_time(), START + 200 * STEP);
}
