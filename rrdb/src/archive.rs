//! Consolidation of primary data points into archive rows.
//!
//! An archive folds `steps` consecutive primary data points per datasource
//! into one consolidated data point (CDP) using its consolidation function,
//! then writes it to the next slot of a circular buffer of `rows` rows.

use tracing::trace;

use crate::error::FormatError;
use crate::layout::{ARC_RECORD_SIZE, CDP_RECORD_SIZE, RecordReader, RecordWriter};
use crate::ring::RingCursor;
use crate::schema::{ArcDef, ConsolidationFn, normalize};

/// In-progress consolidation state for one datasource in one archive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdpStatus {
    accum_value: f64,
    nan_steps: u64,
}

impl Default for CdpStatus {
    fn default() -> Self {
        Self {
            accum_value: f64::NAN,
            nan_steps: 0,
        }
    }
}

impl CdpStatus {
    pub(crate) fn new(accum_value: f64, nan_steps: u64) -> Self {
        Self {
            accum_value,
            nan_steps,
        }
    }

    /// Running statistic for the current row, NaN if nothing known yet.
    pub fn accum_value(&self) -> f64 {
        self.accum_value
    }

    /// Unknown primary data points folded into the current row.
    pub fn nan_steps(&self) -> u64 {
        self.nan_steps
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new(CDP_RECORD_SIZE);
        w.f64(self.accum_value);
        w.u64(self.nan_steps);
        w.finish()
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        let mut r = RecordReader::new("cdp status", buf);
        Ok(Self {
            accum_value: r.f64()?,
            nan_steps: r.u64()?,
        })
    }
}

/// One consolidated row to persist: a physical slot and a value per datasource.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RowWrite {
    pub row: u32,
    pub values: Vec<f64>,
}

/// Definition, write pointer and CDP state of one archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    def: ArcDef,
    cursor: RingCursor,
    cdps: Vec<CdpStatus>,
}

impl Archive {
    /// Creates an empty archive for a database starting at `start_time`.
    ///
    /// Base steps of the first row that precede `start_time` count as unknown.
    pub(crate) fn new(def: ArcDef, ds_count: usize, start_time: u64, step: u64) -> Self {
        let cursor = RingCursor::new(def.rows);
        let arc_step = step.saturating_mul(u64::from(def.steps));
        let nan_steps = (normalize(start_time, step) - normalize(start_time, arc_step)) / step;
        Self {
            def,
            cursor,
            cdps: vec![CdpStatus::new(f64::NAN, nan_steps); ds_count],
        }
    }

    pub(crate) fn from_state(def: ArcDef, cursor: RingCursor, cdps: Vec<CdpStatus>) -> Self {
        Self { def, cursor, cdps }
    }

    /// The definition this archive was created from.
    pub fn def(&self) -> &ArcDef {
        &self.def
    }

    /// Consolidation function.
    pub fn consolidation_fn(&self) -> ConsolidationFn {
        self.def.consolidation_fn
    }

    /// X-files factor.
    pub fn xff(&self) -> f64 {
        self.def.xff
    }

    /// Primary data points per row.
    pub fn steps(&self) -> u32 {
        self.def.steps
    }

    /// Row capacity.
    pub fn rows(&self) -> u32 {
        self.def.rows
    }

    /// Write pointer.
    pub fn cursor(&self) -> RingCursor {
        self.cursor
    }

    /// CDP state for datasource `ds`.
    pub fn cdp(&self, ds: usize) -> Option<&CdpStatus> {
        self.cdps.get(ds)
    }

    /// CDP state for every datasource, in datasource order.
    pub fn cdps(&self) -> &[CdpStatus] {
        &self.cdps
    }

    /// Seconds covered by one row.
    pub fn arc_step(&self, step: u64) -> u64 {
        step.saturating_mul(u64::from(self.def.steps))
    }

    /// Timestamp of the newest row.
    pub fn end_time(&self, last_update: u64, step: u64) -> u64 {
        normalize(last_update, self.arc_step(step))
    }

    /// Timestamp of the oldest row.
    pub fn start_time(&self, last_update: u64, step: u64) -> u64 {
        let span = self
            .arc_step(step)
            .saturating_mul(u64::from(self.def.rows.saturating_sub(1)));
        self.end_time(last_update, step).saturating_sub(span)
    }

    /// Folds `num_steps` repetitions of one primary data point per datasource.
    ///
    /// `last_update` is the database's last update time *before* the sample
    /// being stored. Returns the rows to persist, oldest first; at most one
    /// finished row plus at most `rows` bulk rows.
    pub(crate) fn consume(&mut self, values: &[f64], num_steps: u64, last_update: u64, step: u64) -> Vec<RowWrite> {
        let arc_step = self.arc_step(step);
        let steps = u64::from(self.def.steps);
        let mut update_time = normalize(last_update, step) + step;
        let mut remaining = num_steps;
        let mut writes = Vec::new();

        // Finish the row in progress.
        while remaining > 0 {
            self.accumulate(values);
            remaining -= 1;
            if update_time % arc_step == 0 {
                writes.push(self.finalize_row());
                break;
            }
            update_time += step;
        }

        // Whole rows of the same value.
        let bulk = (remaining / steps).min(u64::from(self.def.rows));
        for _ in 0..bulk {
            let row = self.cursor.advance();
            writes.push(RowWrite {
                row,
                values: values.to_vec(),
            });
        }

        // Start of the next row.
        for _ in 0..remaining % steps {
            self.accumulate(values);
        }

        writes
    }

    fn accumulate(&mut self, values: &[f64]) {
        let cf = self.def.consolidation_fn;
        for (cdp, &value) in self.cdps.iter_mut().zip(values) {
            if value.is_nan() {
                cdp.nan_steps += 1;
            } else {
                cdp.accum_value = cf.fold(cdp.accum_value, value);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)] // step counts are far below 2^52
    fn finalize_row(&mut self) -> RowWrite {
        let steps = u64::from(self.def.steps);
        let tolerated = self.def.xff * steps as f64;
        let cf = self.def.consolidation_fn;

        let values = self
            .cdps
            .iter_mut()
            .map(|cdp| {
                let known = steps.saturating_sub(cdp.nan_steps);
                let value = if cdp.nan_steps as f64 <= tolerated && !cdp.accum_value.is_nan() {
                    match cf {
                        ConsolidationFn::Average => cdp.accum_value / known as f64,
                        _ => cdp.accum_value,
                    }
                } else {
                    f64::NAN
                };
                *cdp = CdpStatus::default();
                value
            })
            .collect();

        let row = self.cursor.advance();
        trace!(
            consolidation_fn = %cf,
            steps = self.def.steps,
            row,
            "finalized row"
        );
        RowWrite { row, values }
    }

    /// Copies CDP state for datasource `to` from datasource `from` of `other`.
    pub(crate) fn copy_cdp_from(&mut self, to: usize, other: &Self, from: usize) {
        if let (Some(target), Some(source)) = (self.cdps.get_mut(to), other.cdps.get(from)) {
            *target = *source;
        }
    }

    pub(crate) fn set_cursor(&mut self, cursor: RingCursor) {
        self.cursor = cursor;
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new(ARC_RECORD_SIZE);
        w.u8(self.def.consolidation_fn.code());
        w.pad_to(8);
        w.f64(self.def.xff);
        w.u32(self.def.steps);
        w.u32(self.def.rows);
        w.u32(self.cursor.current());
        w.finish()
    }

    /// Decodes an archive record; CDP records are read separately.
    pub(crate) fn decode(buf: &[u8], cdps: Vec<CdpStatus>) -> Result<Self, FormatError> {
        let mut r = RecordReader::new("archive", buf);
        let code = r.u8()?;
        let consolidation_fn = ConsolidationFn::from_code(code)
            .ok_or_else(|| r.corrupt(format!("unknown consolidation function code {code}")))?;
        r.seek(8);
        let xff = r.f64()?;
        let steps = r.u32()?;
        let rows = r.u32()?;
        let current = r.u32()?;

        let def = ArcDef::new(consolidation_fn, xff, steps, rows);
        if def.validate().is_err() {
            return Err(r.corrupt(format!("xff {xff}, steps {steps}, rows {rows}")));
        }
        let cursor = RingCursor::from_parts(current, rows)?;
        Ok(Self { def, cursor, cdps })
    }
}
