//! The top-level database handle.
//!
//! An [`RrdDb`] owns one backend plus the decoded header, datasources and
//! archives. It exposes the whole lifecycle: create or open, store samples,
//! fetch consolidated data, dump and import, close.
//!
//! # Concurrency
//!
//! Every operation runs under one mutex, so a fetch never observes a
//! half-applied store and two stores never interleave. Separate processes
//! coordinate only through the backend's [`LockMode`].
//!
//! # Durability
//!
//! A store computes all new state on copies, writes the changed records, and
//! writes the header's last update time last. If any write fails the in-memory
//! state is left untouched and the stored last update time does not advance.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::archive::{Archive, CdpStatus};
use crate::backend::{Access, Backend, BackendFactory, LockMode};
use crate::datasource::Datasource;
use crate::error::{
    DumpError, FormatError, NotFoundError, OrderingError, Result, RrdError, ValidationError,
};
use crate::export::{ArcDump, CdpDump, DsDump, RowDump, RrdDump};
use crate::fetch::FetchData;
use crate::layout::{
    ARC_RECORD_SIZE, CDP_RECORD_SIZE, DS_RECORD_SIZE, HEADER_SIZE, Header, LAST_UPDATE_OFFSET,
    Layout, VALUE_SIZE, VERSION, decode_values, encode_values,
};
use crate::query::{ArchiveSpan, FetchRequest, fetch_timestamps, select_archive, select_start_match};
use crate::ring::RingCursor;
use crate::sample::Sample;
use crate::schema::{ConsolidationFn, RrdDef, now_seconds};

/// Lifecycle of a database handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly created from a definition, no history yet.
    Created,
    /// Restored from an existing backend.
    Open,
    /// Released. Every further store or fetch fails.
    Closed,
}

/// Positional writes collected before anything touches the backend.
#[derive(Debug, Default)]
struct WriteBatch {
    writes: Vec<(u64, Vec<u8>)>,
}

impl WriteBatch {
    fn push(&mut self, offset: u64, bytes: Vec<u8>) {
        self.writes.push((offset, bytes));
    }

    fn apply(self, backend: &mut dyn Backend) -> Result<()> {
        for (offset, bytes) in &self.writes {
            backend.write(*offset, bytes)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    read_only: bool,
    backend: Box<dyn Backend>,
    layout: Layout,
    header: Header,
    datasources: Vec<Datasource>,
    archives: Vec<Archive>,
}

impl Inner {
    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.state == State::Closed {
            return Err(RrdError::Closed { operation });
        }
        Ok(())
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        self.ensure_open(operation)?;
        if self.read_only {
            return Err(RrdError::ReadOnly { operation });
        }
        Ok(())
    }

    fn ds_index(&self, name: &str) -> Result<usize> {
        self.datasources
            .iter()
            .position(|ds| ds.name() == name)
            .ok_or_else(|| {
                NotFoundError::Datasource {
                    name: name.to_string(),
                }
                .into()
            })
    }

    fn spans(&self) -> Vec<ArchiveSpan> {
        let step = self.header.step;
        let last_update = self.header.last_update;
        self.archives
            .iter()
            .map(|arc| ArchiveSpan {
                consolidation_fn: arc.consolidation_fn(),
                arc_step: arc.arc_step(step),
                start: arc.start_time(last_update, step),
                end: arc.end_time(last_update, step) + arc.arc_step(step),
            })
            .collect()
    }

    /// Adds every record except row values to `batch`, header last.
    fn push_records(&self, batch: &mut WriteBatch) {
        for (index, ds) in self.datasources.iter().enumerate() {
            batch.push(self.layout.ds_offset(index), ds.encode());
        }
        for (index, arc) in self.archives.iter().enumerate() {
            Self::push_archive(&self.layout, batch, index, arc);
        }
        batch.push(self.layout.header_offset(), self.header.encode());
    }

    fn push_archive(layout: &Layout, batch: &mut WriteBatch, index: usize, arc: &Archive) {
        batch.push(layout.archive_offset(index), arc.encode());
        for (ds, cdp) in arc.cdps().iter().enumerate() {
            batch.push(layout.cdp_offset(index, ds), cdp.encode());
        }
    }

    #[allow(clippy::cast_possible_truncation)] // row counts are u32
    fn read_column(&mut self, arc: usize, ds: usize) -> Result<Vec<f64>> {
        let rows = self.archives[arc].rows() as usize;
        let bytes = self
            .backend
            .read(self.layout.values_offset(arc, ds), rows * VALUE_SIZE)?;
        Ok(decode_values(&bytes))
    }

    /// Values of one column, oldest row first.
    fn chronological_column(&mut self, arc: usize, ds: usize) -> Result<Vec<f64>> {
        let physical = self.read_column(arc, ds)?;
        let cursor = self.archives[arc].cursor();
        Ok(cursor
            .chronological()
            .map(|row| physical[row as usize])
            .collect())
    }

    /// Reads and validates every record of an existing backend.
    fn load(backend: &mut dyn Backend) -> Result<(Header, Layout, Vec<Datasource>, Vec<Archive>)> {
        let length = backend.length()?;
        let mut read = |offset: u64, size: usize| -> Result<Vec<u8>> {
            let expected = offset + size as u64;
            if expected > length {
                return Err(FormatError::SizeMismatch { length, expected }.into());
            }
            backend.read(offset, size)
        };

        if length < HEADER_SIZE as u64 {
            return Err(FormatError::TooSmall {
                length,
                expected: HEADER_SIZE as u64,
            }
            .into());
        }
        let header = Header::decode(&read(0, HEADER_SIZE)?)?;
        let records = records_size(header.ds_count, header.arc_count);
        match records {
            Some(expected) if expected <= length => {}
            _ => {
                return Err(FormatError::SizeMismatch {
                    length,
                    expected: records.unwrap_or(u64::MAX),
                }
                .into());
            }
        }
        let ds_count = header.ds_count as usize;

        let mut datasources = Vec::with_capacity(ds_count);
        for index in 0..ds_count {
            let offset = (HEADER_SIZE + index * DS_RECORD_SIZE) as u64;
            datasources.push(Datasource::decode(&read(offset, DS_RECORD_SIZE)?)?);
        }

        let mut archives = Vec::with_capacity(header.arc_count as usize);
        let mut rows = Vec::with_capacity(header.arc_count as usize);
        let mut offset = (HEADER_SIZE + ds_count * DS_RECORD_SIZE) as u64;
        for _ in 0..header.arc_count {
            let record = read(offset, ARC_RECORD_SIZE)?;
            let mut cdps = Vec::with_capacity(ds_count);
            for ds in 0..ds_count {
                let cdp_offset = offset + (ARC_RECORD_SIZE + ds * CDP_RECORD_SIZE) as u64;
                cdps.push(CdpStatus::decode(&read(cdp_offset, CDP_RECORD_SIZE)?)?);
            }
            let archive = Archive::decode(&record, cdps)?;
            offset += (ARC_RECORD_SIZE + ds_count * CDP_RECORD_SIZE) as u64
                + (ds_count * VALUE_SIZE) as u64 * u64::from(archive.rows());
            rows.push(archive.rows());
            archives.push(archive);
        }

        let layout = Layout::new(ds_count, &rows);
        if layout.total_size() != length {
            return Err(FormatError::SizeMismatch {
                length,
                expected: layout.total_size(),
            }
            .into());
        }
        Ok((header, layout, datasources, archives))
    }
}

/// Bytes taken by the header plus every fixed-size record, before any rows.
///
/// `None` when the counts cannot describe a real image.
fn records_size(ds_count: u32, arc_count: u32) -> Option<u64> {
    let ds_count = u64::from(ds_count);
    let per_archive = ds_count
        .checked_mul(CDP_RECORD_SIZE as u64)?
        .checked_add(ARC_RECORD_SIZE as u64)?;
    u64::from(arc_count)
        .checked_mul(per_archive)?
        .checked_add(ds_count.checked_mul(DS_RECORD_SIZE as u64)?)?
        .checked_add(HEADER_SIZE as u64)
}

/// A round-robin database backed by one storage medium.
///
/// ```rust
/// use rrdb::{ArcDef, ConsolidationFn, DsDef, DsType, MemoryBackendFactory, RrdDb, RrdDef};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let t0 = 1_700_000_100;
/// let mut def = RrdDef::new("/db/demo.rrd", t0 - 300, 300);
/// def.add_datasource(DsDef::new("ds", DsType::Gauge, 600, 0.0, 100.0))
///     .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 3));
///
/// let factory = MemoryBackendFactory::new();
/// let db = RrdDb::create(&def, &factory)?;
/// db.update(t0, &[("ds", 10.0)])?;
/// db.update(t0 + 300, &[("ds", 20.0)])?;
/// db.update(t0 + 600, &[("ds", 30.0)])?;
///
/// let data = db
///     .create_fetch_request(ConsolidationFn::Average, t0, t0 + 900)?
///     .fetch_data()?;
/// assert_eq!(data.values_by_name("ds")?, &[10.0, 20.0, 30.0]);
/// db.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RrdDb {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl RrdDb {
    /// Creates a new database from `def`, overwriting any existing medium at
    /// `def.path`.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Validation`] if the definition is invalid (before
    /// anything is allocated), otherwise backend and lock errors.
    pub fn create(def: &RrdDef, factory: &dyn BackendFactory) -> Result<Self> {
        Self::create_with_lock_mode(def, factory, LockMode::default())
    }

    /// Like [`create`](Self::create) with an explicit lock mode.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_with_lock_mode(def: &RrdDef, factory: &dyn BackendFactory, lock_mode: LockMode) -> Result<Self> {
        def.validate()?;
        let too_many = |what: &str| ValidationError::InvalidDefinition {
            reason: format!("too many {what}"),
        };
        let header = Header {
            step: def.step,
            ds_count: u32::try_from(def.datasources.len()).map_err(|_| too_many("datasources"))?,
            arc_count: u32::try_from(def.archives.len()).map_err(|_| too_many("archives"))?,
            last_update: def.start_time,
        };
        let ds_count = def.datasources.len();
        let datasources = def
            .datasources
            .iter()
            .map(|ds| Datasource::new(ds.clone(), def.start_time, def.step))
            .collect();
        let archives = def
            .archives
            .iter()
            .map(|arc| Archive::new(arc.clone(), ds_count, def.start_time, def.step))
            .collect();

        let backend = factory.open(&def.path, Access::Create, lock_mode)?;
        let mut inner = Inner {
            state: State::Created,
            read_only: false,
            backend,
            layout: def.layout(),
            header,
            datasources,
            archives,
        };

        if let Err(err) = Self::write_initial_image(&mut inner) {
            if let Err(close_err) = inner.backend.close() {
                warn!(path = %def.path.display(), error = %close_err, "failed to release backend after create error");
            }
            return Err(err);
        }

        debug!(
            path = %def.path.display(),
            backend = factory.name(),
            size = inner.layout.total_size(),
            datasources = inner.datasources.len(),
            archives = inner.archives.len(),
            "created database"
        );
        Ok(Self {
            path: def.path.clone(),
            inner: Mutex::new(inner),
        })
    }

    fn write_initial_image(inner: &mut Inner) -> Result<()> {
        inner.backend.set_length(inner.layout.total_size())?;
        let mut batch = WriteBatch::default();
        inner.push_records(&mut batch);
        for (index, arc) in inner.archives.iter().enumerate() {
            let unknown = encode_values(&vec![f64::NAN; arc.rows() as usize]);
            for ds in 0..inner.datasources.len() {
                batch.push(inner.layout.values_offset(index, ds), unknown.clone());
            }
        }
        batch.apply(inner.backend.as_mut())?;
        inner.backend.sync()
    }

    /// Opens an existing database without OS-level locking.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Format`] if the stored bytes are not a valid
    /// database, otherwise backend and lock errors.
    pub fn open(path: impl AsRef<Path>, read_only: bool, factory: &dyn BackendFactory) -> Result<Self> {
        Self::open_with_lock_mode(path, read_only, factory, LockMode::default())
    }

    /// Like [`open`](Self::open) with an explicit lock mode. Read-only
    /// handles never lock.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_lock_mode(
        path: impl AsRef<Path>,
        read_only: bool,
        factory: &dyn BackendFactory,
        lock_mode: LockMode,
    ) -> Result<Self> {
        let path = path.as_ref();
        let access = if read_only { Access::ReadOnly } else { Access::ReadWrite };
        let mut backend = factory.open(path, access, lock_mode)?;

        let (header, layout, datasources, archives) = match Inner::load(backend.as_mut()) {
            Ok(loaded) => loaded,
            Err(err) => {
                if let Err(close_err) = backend.close() {
                    warn!(path = %path.display(), error = %close_err, "failed to release backend after open error");
                }
                return Err(err);
            }
        };

        debug!(
            path = %path.display(),
            backend = factory.name(),
            read_only,
            last_update = header.last_update,
            "opened database"
        );
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                state: State::Open,
                read_only,
                backend,
                layout,
                header,
                datasources,
                archives,
            }),
        })
    }

    /// Builds a new database at `path` holding exactly the state in `dump`.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::Inconsistent`] if the dump is invalid, otherwise
    /// as [`create`](Self::create).
    pub fn import(path: impl Into<PathBuf>, dump: &RrdDump, factory: &dyn BackendFactory) -> Result<Self> {
        dump.validate()?;
        let def = dump.to_def(path);
        let db = Self::create(&def, factory)?;

        {
            let mut guard = db.lock();
            let inner = &mut *guard;
            inner.datasources = def
                .datasources
                .iter()
                .zip(&dump.datasources)
                .map(|(ds_def, ds)| Datasource::from_state(ds_def.clone(), ds.last_value, ds.accum_value, ds.nan_seconds))
                .collect();
            inner.archives = def
                .archives
                .iter()
                .zip(&dump.archives)
                .map(|(arc_def, arc)| {
                    let cdps = arc
                        .cdps
                        .iter()
                        .map(|cdp| CdpStatus::new(cdp.accum_value, cdp.nan_steps))
                        .collect();
                    Archive::from_state(arc_def.clone(), RingCursor::new(arc.rows), cdps)
                })
                .collect();

            let mut batch = WriteBatch::default();
            for (index, arc) in dump.archives.iter().enumerate() {
                for ds in 0..dump.datasources.len() {
                    batch.push(inner.layout.values_offset(index, ds), encode_values(&arc.column(ds)));
                }
            }
            inner.push_records(&mut batch);
            batch.apply(inner.backend.as_mut())?;
            inner.backend.sync()?;
        }

        debug!(path = %def.path.display(), last_update = dump.last_update, "imported database");
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the backing medium.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Whether the handle was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.lock().read_only
    }

    /// Copy of the header.
    pub fn header(&self) -> Header {
        self.lock().header
    }

    /// Base step in seconds.
    pub fn step(&self) -> u64 {
        self.lock().header.step
    }

    /// Timestamp of the last accepted update.
    pub fn last_update_time(&self) -> u64 {
        self.lock().header.last_update
    }

    /// Number of datasources.
    pub fn ds_count(&self) -> usize {
        self.lock().datasources.len()
    }

    /// Number of archives.
    pub fn arc_count(&self) -> usize {
        self.lock().archives.len()
    }

    /// Datasource names in definition order.
    pub fn ds_names(&self) -> Vec<String> {
        self.lock()
            .datasources
            .iter()
            .map(|ds| ds.name().to_string())
            .collect()
    }

    /// Index of datasource `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`] if there is no such datasource.
    pub fn ds_index(&self, name: &str) -> Result<usize> {
        self.lock().ds_index(name)
    }

    /// Index of the archive with `consolidation_fn` and `steps`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Archive`] if there is no such archive.
    pub fn arc_index(&self, consolidation_fn: ConsolidationFn, steps: u32) -> Result<usize> {
        self.lock()
            .archives
            .iter()
            .position(|arc| arc.consolidation_fn() == consolidation_fn && arc.steps() == steps)
            .ok_or_else(|| {
                NotFoundError::Archive {
                    consolidation_fn,
                    steps,
                }
                .into()
            })
    }

    /// Snapshot of datasource `index`.
    pub fn datasource(&self, index: usize) -> Option<Datasource> {
        self.lock().datasources.get(index).cloned()
    }

    /// Snapshot of archive `index`.
    pub fn archive(&self, index: usize) -> Option<Archive> {
        self.lock().archives.get(index).cloned()
    }

    /// The definition this database would be created from, starting at the
    /// current last update time.
    pub fn definition(&self) -> RrdDef {
        let inner = self.lock();
        let mut def = RrdDef::new(&self.path, inner.header.last_update, inner.header.step);
        for ds in &inner.datasources {
            def.add_datasource(ds.def().clone());
        }
        for arc in &inner.archives {
            def.add_archive(arc.def().clone());
        }
        def
    }

    /// Starts a sample at `time` with every value unknown.
    pub fn create_sample(&self, time: u64) -> Sample<'_> {
        Sample::new(self, time)
    }

    /// Starts a sample at the current time.
    pub fn create_sample_now(&self) -> Sample<'_> {
        Sample::new(self, now_seconds())
    }

    /// Stores a sample.
    ///
    /// # Errors
    ///
    /// See [`store_values`](Self::store_values).
    pub fn store(&self, sample: &Sample<'_>) -> Result<()> {
        self.store_values(sample.time(), sample.values())
    }

    /// Stores a sample given by name/value pairs; unnamed datasources are
    /// unknown.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`] for an unknown name, otherwise
    /// as [`store_values`](Self::store_values).
    pub fn update(&self, time: u64, values: &[(&str, f64)]) -> Result<()> {
        let mut sample = self.create_sample(time);
        for &(name, value) in values {
            sample.set_value(name, value)?;
        }
        self.store(&sample)
    }

    /// Stores one value per datasource at `time`.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, [`RrdError::ReadOnly`] on a
    /// read-only handle, [`ValidationError::ValueCount`] if `values` does not
    /// match the datasources, [`OrderingError::NonMonotonic`] if `time` does
    /// not advance past the last update, and backend errors. On any error
    /// the database is unchanged.
    pub fn store_values(&self, time: u64, values: &[f64]) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.ensure_writable("store")?;

        if values.len() != inner.datasources.len() {
            return Err(ValidationError::ValueCount {
                given: values.len(),
                expected: inner.datasources.len(),
            }
            .into());
        }
        let last_update = inner.header.last_update;
        if time <= last_update {
            return Err(OrderingError::NonMonotonic {
                timestamp: time,
                last_update,
            }
            .into());
        }

        let step = inner.header.step;
        let mut datasources = inner.datasources.clone();
        let mut archives = inner.archives.clone();
        let mut batch = WriteBatch::default();

        let pdps: Vec<_> = datasources
            .iter_mut()
            .zip(values)
            .map(|(ds, &value)| ds.process(last_update, time, value, step))
            .collect();

        let mut rows_written = 0usize;
        if let Some(pdps) = pdps.into_iter().collect::<Option<Vec<_>>>() {
            let num_steps = pdps.first().map_or(0, |pdp| pdp.steps);
            let pdp_values: Vec<f64> = pdps.iter().map(|pdp| pdp.value).collect();

            for (index, arc) in archives.iter_mut().enumerate() {
                for write in arc.consume(&pdp_values, num_steps, last_update, step) {
                    for (ds, value) in write.values.iter().enumerate() {
                        batch.push(inner.layout.row_offset(index, ds, write.row), value.to_le_bytes().to_vec());
                    }
                    rows_written += 1;
                }
                Inner::push_archive(&inner.layout, &mut batch, index, arc);
            }
        }

        for (index, ds) in datasources.iter().enumerate() {
            batch.push(inner.layout.ds_offset(index), ds.encode());
        }
        batch.push(LAST_UPDATE_OFFSET, time.to_le_bytes().to_vec());
        batch.apply(inner.backend.as_mut())?;

        inner.datasources = datasources;
        inner.archives = archives;
        inner.header.last_update = time;

        trace!(path = %self.path.display(), time, rows_written, "stored sample");
        Ok(())
    }

    /// Starts a fetch request for `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidTimeRange`] if `start >= end`.
    pub fn create_fetch_request(
        &self,
        consolidation_fn: ConsolidationFn,
        start: u64,
        end: u64,
    ) -> Result<FetchRequest<'_>> {
        FetchRequest::new(self, consolidation_fn, start, end)
    }

    /// Index of the archive that would answer `request`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::NoMatchingArchive`] if no archive uses the
    /// requested consolidation function.
    pub fn find_matching_archive(&self, request: &FetchRequest<'_>) -> Result<usize> {
        let spans = self.lock().spans();
        Ok(select_archive(
            &spans,
            request.consolidation_fn(),
            request.start(),
            request.end(),
            request.resolution(),
        )?)
    }

    /// Index of the archive with the step closest to `resolution` among those
    /// whose history reaches back to `start`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::NoMatchingArchive`] if no archive uses
    /// `consolidation_fn`.
    pub fn find_start_match_archive(&self, consolidation_fn: ConsolidationFn, start: u64, resolution: u64) -> Result<usize> {
        let spans = self.lock().spans();
        Ok(select_start_match(&spans, consolidation_fn, start, resolution)?)
    }

    /// Answers a fetch request.
    ///
    /// Rows outside the chosen archive's history come back as NaN.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close,
    /// [`NotFoundError::NoMatchingArchive`] if no archive uses the requested
    /// consolidation function, [`NotFoundError::Datasource`] for an unknown
    /// filter name, and backend errors.
    pub fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchData> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.ensure_open("fetch")?;

        let arc_index = select_archive(
            &inner.spans(),
            request.consolidation_fn(),
            request.start(),
            request.end(),
            request.resolution(),
        )?;

        let columns: Vec<usize> = match request.filter() {
            Some(names) => names
                .iter()
                .map(|name| inner.ds_index(name))
                .collect::<Result<_>>()?,
            None => (0..inner.datasources.len()).collect(),
        };

        let step = inner.header.step;
        let arc = &inner.archives[arc_index];
        let consolidation_fn = arc.consolidation_fn();
        let arc_step = arc.arc_step(step);
        let newest = arc.end_time(inner.header.last_update, step);
        let cursor = arc.cursor();
        let timestamps = fetch_timestamps(request.start(), request.end(), arc_step);

        let physical_rows: Vec<Option<u32>> = timestamps
            .iter()
            .map(|&t| {
                if t > newest {
                    return None;
                }
                let age = u32::try_from((newest - t) / arc_step)
                    .ok()
                    .filter(|&age| age < cursor.rows())?;
                Some(cursor.row_at(cursor.rows() - 1 - age))
            })
            .collect();

        let mut names = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len());
        for ds in columns {
            let column = inner.read_column(arc_index, ds)?;
            values.push(
                physical_rows
                    .iter()
                    .map(|row| row.map_or(f64::NAN, |row| column[row as usize]))
                    .collect(),
            );
            names.push(inner.datasources[ds].name().to_string());
        }

        trace!(
            path = %self.path.display(),
            consolidation_fn = %consolidation_fn,
            arc_index,
            rows = timestamps.len(),
            "fetched"
        );
        Ok(FetchData::new(
            consolidation_fn,
            (request.start(), request.end()),
            arc_index,
            arc_step,
            timestamps,
            names,
            values,
        ))
    }

    /// Copies this database's state into `other`.
    ///
    /// The last update time is copied as is. Datasources are matched by name
    /// and archives by consolidation function and step count; rows are
    /// aligned newest to newest, and rows `other` has beyond this
    /// database's history become unknown.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] if either database is closed,
    /// [`RrdError::ReadOnly`] if `other` is read-only, and backend errors.
    pub fn copy_state_to(&self, other: &RrdDb) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        // Both locks are always taken in address order.
        let (mut source, mut target_guard) = if std::ptr::from_ref(self) < std::ptr::from_ref(other) {
            let source = self.lock();
            (source, other.lock())
        } else {
            let target = other.lock();
            (self.lock(), target)
        };
        let target = &mut *target_guard;
        source.ensure_open("copy state")?;
        target.ensure_writable("copy state")?;

        let mut datasources = target.datasources.clone();
        for ds in &mut datasources {
            if let Some(from) = source.datasources.iter().find(|s| s.name() == ds.name()) {
                ds.copy_state_from(from);
            }
        }

        let ds_map: Vec<Option<usize>> = datasources
            .iter()
            .map(|ds| source.ds_index(ds.name()).ok())
            .collect();

        let mut archives = target.archives.clone();
        let mut batch = WriteBatch::default();
        for (index, arc) in archives.iter_mut().enumerate() {
            let Some(from) = source
                .archives
                .iter()
                .position(|s| s.consolidation_fn() == arc.consolidation_fn() && s.steps() == arc.steps())
            else {
                continue;
            };

            let rows = arc.rows() as usize;
            let source_rows = source.archives[from].rows() as usize;
            for (ds, mapped) in ds_map.iter().enumerate() {
                let column = match mapped {
                    Some(source_ds) => {
                        arc.copy_cdp_from(ds, &source.archives[from], *source_ds);
                        let history = source.chronological_column(from, *source_ds)?;
                        (0..rows)
                            .map(|i| {
                                (i + source_rows)
                                    .checked_sub(rows)
                                    .map_or(f64::NAN, |j| history[j])
                            })
                            .collect()
                    }
                    None => target.chronological_column(index, ds)?,
                };
                batch.push(target.layout.values_offset(index, ds), encode_values(&column));
            }
            arc.set_cursor(RingCursor::new(arc.rows()));
            Inner::push_archive(&target.layout, &mut batch, index, arc);
        }

        for (index, ds) in datasources.iter().enumerate() {
            batch.push(target.layout.ds_offset(index), ds.encode());
        }
        let last_update = source.header.last_update;
        batch.push(LAST_UPDATE_OFFSET, last_update.to_le_bytes().to_vec());
        batch.apply(target.backend.as_mut())?;

        target.datasources = datasources;
        target.archives = archives;
        target.header.last_update = last_update;
        debug!(from = %self.path.display(), to = %other.path.display(), "copied state");
        Ok(())
    }

    /// Flushes pending writes.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close and backend sync errors.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open("sync")?;
        inner.backend.sync()
    }

    /// The raw backend image.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close and backend read errors.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        inner.ensure_open("read bytes")?;
        inner.backend.read_all()
    }

    /// Captures the whole database as an [`RrdDump`].
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close and backend read errors.
    pub fn export(&self) -> Result<RrdDump> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.ensure_open("export")?;

        let step = inner.header.step;
        let last_update = inner.header.last_update;
        let datasources = inner
            .datasources
            .iter()
            .map(|ds| DsDump {
                name: ds.name().to_string(),
                ds_type: ds.ds_type(),
                heartbeat: ds.heartbeat(),
                min_value: ds.min_value(),
                max_value: ds.max_value(),
                last_value: ds.last_value(),
                accum_value: ds.accum_value(),
                nan_seconds: ds.nan_seconds(),
            })
            .collect();

        let mut archives = Vec::with_capacity(inner.archives.len());
        for index in 0..inner.archives.len() {
            let columns = (0..inner.datasources.len())
                .map(|ds| inner.chronological_column(index, ds))
                .collect::<Result<Vec<_>>>()?;
            let arc = &inner.archives[index];
            let start = arc.start_time(last_update, step);
            let arc_step = arc.arc_step(step);
            let database = (0..arc.rows() as usize)
                .map(|row| RowDump {
                    timestamp: start + row as u64 * arc_step,
                    values: columns.iter().map(|column| column[row]).collect(),
                })
                .collect();
            archives.push(ArcDump {
                consolidation_fn: arc.consolidation_fn(),
                xff: arc.xff(),
                steps: arc.steps(),
                rows: arc.rows(),
                cdps: arc
                    .cdps()
                    .iter()
                    .map(|cdp| CdpDump {
                        accum_value: cdp.accum_value(),
                        nan_steps: cdp.nan_steps(),
                    })
                    .collect(),
                database,
            });
        }

        Ok(RrdDump {
            version: VERSION,
            step,
            last_update,
            datasources,
            archives,
        })
    }

    /// Human-readable text dump.
    ///
    /// # Errors
    ///
    /// See [`export`](Self::export).
    pub fn dump(&self) -> Result<String> {
        Ok(self.export()?.to_string())
    }

    /// JSON dump.
    ///
    /// # Errors
    ///
    /// See [`export`](Self::export) and [`RrdDump::to_json`].
    pub fn export_json(&self) -> Result<String> {
        self.export()?.to_json()
    }

    /// Writes the JSON dump to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::File`] if the file cannot be written, otherwise as
    /// [`export_json`](Self::export_json).
    pub fn export_json_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.export_json()?;
        std::fs::write(path, json).map_err(|source| DumpError::File {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Releases the backend. Further stores and fetches fail with
    /// [`RrdError::Closed`]; closing again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns backend errors from the final flush. The handle is closed
    /// regardless.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == State::Closed {
            return Ok(());
        }
        inner.state = State::Closed;
        let result = inner.backend.close();
        debug!(path = %self.path.display(), "closed database");
        result
    }
}

impl Drop for RrdDb {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), error = %err, "failed to close database on drop");
        }
    }
}

impl fmt::Display for RrdDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        writeln!(f, "filename = \"{}\"", self.path.display())?;
        writeln!(f, "step = {}", inner.header.step)?;
        writeln!(f, "last_update = {}", inner.header.last_update)?;
        for ds in &inner.datasources {
            writeln!(
                f,
                "ds[{}]: {} heartbeat={} min={} max={}",
                ds.name(),
                ds.ds_type(),
                ds.heartbeat(),
                ds.min_value(),
                ds.max_value()
            )?;
        }
        for (index, arc) in inner.archives.iter().enumerate() {
            writeln!(
                f,
                "rra[{index}]: {} xff={} steps={} rows={}",
                arc.consolidation_fn(),
                arc.xff(),
                arc.steps(),
                arc.rows()
            )?;
        }
        Ok(())
    }
}
