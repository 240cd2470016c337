//! Per-datasource accumulation of primary data points.
//!
//! Each datasource turns raw samples into a per-second rate, weights that
//! rate by the seconds it covers, and emits one primary data point (PDP) per
//! base step. A gap longer than the heartbeat, an unknown sample or a rate
//! outside `[min, max]` contributes unknown seconds instead of a value.

use tracing::trace;

use crate::error::FormatError;
use crate::layout::{DS_RECORD_SIZE, NAME_SIZE, RecordReader, RecordWriter};
use crate::schema::{DsDef, DsType, normalize};

const MAX_32_BIT: f64 = 4_294_967_296.0;
const MAX_64_BIT: f64 = 18_446_744_073_709_551_616.0;

/// A finished primary data point, repeated once per base step it spans.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Pdp {
    /// Per-second value, NaN if unknown.
    pub value: f64,
    /// Number of base steps this value fills.
    pub steps: u64,
}

/// Definition and live accumulator state of one datasource.
#[derive(Debug, Clone, PartialEq)]
pub struct Datasource {
    def: DsDef,
    last_value: f64,
    accum_value: f64,
    nan_seconds: u64,
}

impl Datasource {
    /// Creates a datasource with no history.
    ///
    /// Seconds between the start of the base step and `start_time` count as
    /// unknown.
    pub(crate) fn new(def: DsDef, start_time: u64, step: u64) -> Self {
        Self {
            def,
            last_value: f64::NAN,
            accum_value: 0.0,
            nan_seconds: start_time % step,
        }
    }

    pub(crate) fn from_state(def: DsDef, last_value: f64, accum_value: f64, nan_seconds: u64) -> Self {
        Self {
            def,
            last_value,
            accum_value,
            nan_seconds,
        }
    }

    /// The definition this datasource was created from.
    pub fn def(&self) -> &DsDef {
        &self.def
    }

    /// Datasource name.
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Datasource type.
    pub fn ds_type(&self) -> DsType {
        self.def.ds_type
    }

    /// Heartbeat in seconds.
    pub fn heartbeat(&self) -> u64 {
        self.def.heartbeat
    }

    /// Lower bound, NaN if unbounded.
    pub fn min_value(&self) -> f64 {
        self.def.min_value
    }

    /// Upper bound, NaN if unbounded.
    pub fn max_value(&self) -> f64 {
        self.def.max_value
    }

    /// Last raw value seen, NaN if unknown.
    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    /// Time-weighted sum accumulated for the in-progress base step.
    pub fn accum_value(&self) -> f64 {
        self.accum_value
    }

    /// Unknown seconds accumulated for the in-progress base step.
    pub fn nan_seconds(&self) -> u64 {
        self.nan_seconds
    }

    /// Folds a sample taken at `new_time` into the accumulator.
    ///
    /// Returns the finished primary data point when `new_time` reaches or
    /// crosses a step boundary. `old_time` is the database's last update time
    /// and must be strictly less than `new_time`.
    pub(crate) fn process(&mut self, old_time: u64, new_time: u64, value: f64, step: u64) -> Option<Pdp> {
        let start = normalize(old_time, step);
        let end = start + step;
        let rate = self.update_value(old_time, new_time, value);

        if new_time < end {
            self.accumulate(old_time, new_time, rate);
            return None;
        }

        let boundary = normalize(new_time, step);
        self.accumulate(old_time, boundary, rate);
        let pdp = Pdp {
            value: self.total(start, boundary),
            steps: (boundary - end) / step + 1,
        };

        trace!(
            ds = %self.def.name,
            value = pdp.value,
            steps = pdp.steps,
            "primary data point"
        );

        self.nan_seconds = 0;
        self.accum_value = 0.0;
        self.accumulate(boundary, new_time, rate);
        Some(pdp)
    }

    /// Per-second contribution of a sample, NaN if unknown or out of range.
    #[allow(clippy::cast_precision_loss)] // elapsed seconds are far below 2^52
    fn update_value(&mut self, old_time: u64, new_time: u64, value: f64) -> f64 {
        let elapsed = new_time - old_time;
        let mut rate = f64::NAN;

        if elapsed <= self.def.heartbeat {
            let seconds = elapsed as f64;
            rate = match self.def.ds_type {
                DsType::Gauge => value,
                DsType::Absolute => value / seconds,
                DsType::Derive => (value - self.last_value) / seconds,
                DsType::Counter => {
                    let mut diff = value - self.last_value;
                    if diff < 0.0 {
                        diff += MAX_32_BIT;
                    }
                    if diff < 0.0 {
                        diff += MAX_64_BIT - MAX_32_BIT;
                    }
                    if diff >= 0.0 { diff / seconds } else { f64::NAN }
                }
            };

            let below = !self.def.min_value.is_nan() && rate < self.def.min_value;
            let above = !self.def.max_value.is_nan() && rate > self.def.max_value;
            if below || above {
                rate = f64::NAN;
            }
        }

        self.last_value = value;
        rate
    }

    #[allow(clippy::cast_precision_loss)]
    fn accumulate(&mut self, from: u64, to: u64, rate: f64) {
        let seconds = to - from;
        if rate.is_nan() {
            self.nan_seconds += seconds;
        } else {
            self.accum_value += rate * seconds as f64;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn total(&self, start: u64, boundary: u64) -> f64 {
        let known = (boundary - start).saturating_sub(self.nan_seconds);
        if self.nan_seconds <= self.def.heartbeat && known > 0 {
            self.accum_value / known as f64
        } else {
            f64::NAN
        }
    }

    /// Copies accumulator state from another datasource of the same name.
    pub(crate) fn copy_state_from(&mut self, other: &Self) {
        self.last_value = other.last_value;
        self.accum_value = other.accum_value;
        self.nan_seconds = other.nan_seconds;
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut name = [0u8; NAME_SIZE];
        let bytes = self.def.name.as_bytes();
        let len = bytes.len().min(NAME_SIZE);
        name[..len].copy_from_slice(&bytes[..len]);

        let mut w = RecordWriter::new(DS_RECORD_SIZE);
        w.bytes(&name);
        w.u8(self.def.ds_type.code());
        w.pad_to(40);
        w.u64(self.def.heartbeat);
        w.f64(self.def.min_value);
        w.f64(self.def.max_value);
        w.f64(self.last_value);
        w.f64(self.accum_value);
        w.u64(self.nan_seconds);
        w.finish()
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        let mut r = RecordReader::new("datasource", buf);
        let raw_name = r.array::<NAME_SIZE>()?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let name = std::str::from_utf8(&raw_name[..end])
            .map_err(|e| r.corrupt(format!("name is not UTF-8: {e}")))?
            .to_string();
        if name.is_empty() {
            return Err(r.corrupt("empty name"));
        }

        let code = r.u8()?;
        let ds_type = DsType::from_code(code).ok_or_else(|| r.corrupt(format!("unknown type code {code}")))?;
        r.seek(40);
        let heartbeat = r.u64()?;
        if heartbeat == 0 {
            return Err(r.corrupt(format!("datasource '{name}' has zero heartbeat")));
        }

        let def = DsDef::new(name, ds_type, heartbeat, r.f64()?, r.f64()?);
        Ok(Self {
            def,
            last_value: r.f64()?,
            accum_value: r.f64()?,
            nan_seconds: r.u64()?,
        })
    }
}
