//! Update samples.
//!
//! A [`Sample`] is one timestamp plus one value per datasource, all unknown
//! until set. It is the unit of an update transaction: nothing reaches the
//! backend until [`Sample::update`] (or [`RrdDb::store`]) commits it.

use std::fmt;

use crate::error::{Result, ValidationError};
use crate::schema::now_seconds;
use crate::RrdDb;

/// Pending update for one database.
///
/// Created by [`RrdDb::create_sample`].
///
/// ```rust,no_run
/// # use rrdb::{MemoryBackendFactory, RrdDb};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let factory = MemoryBackendFactory::new();
/// # let db = RrdDb::open("/db/a.rrd", false, &factory)?;
/// let mut sample = db.create_sample(1_700_000_000);
/// sample.set_value("inbound", 1024.0)?.set_value("outbound", 512.0)?;
/// sample.update()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Sample<'a> {
    db: &'a RrdDb,
    time: u64,
    values: Vec<f64>,
}

impl<'a> Sample<'a> {
    pub(crate) fn new(db: &'a RrdDb, time: u64) -> Self {
        Self {
            db,
            time,
            values: vec![f64::NAN; db.ds_count()],
        }
    }

    /// Sample timestamp in seconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Sets the sample timestamp.
    pub fn set_time(&mut self, time: u64) -> &mut Self {
        self.time = time;
        self
    }

    /// One value per datasource, NaN if unknown.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Sets the value of datasource `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`](crate::error::NotFoundError::Datasource)
    /// if the database has no such datasource.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<&mut Self> {
        let index = self.db.ds_index(name)?;
        self.values[index] = value;
        Ok(self)
    }

    /// Sets the value of the datasource at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ValueCount`] if `index` is out of range.
    pub fn set_value_at(&mut self, index: usize, value: f64) -> Result<&mut Self> {
        let expected = self.values.len();
        let slot = self.values.get_mut(index).ok_or(ValidationError::ValueCount {
            given: index + 1,
            expected,
        })?;
        *slot = value;
        Ok(self)
    }

    /// Sets values in datasource order; datasources past the end of `values`
    /// keep their current value.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ValueCount`] if more values than
    /// datasources are given.
    pub fn set_values(&mut self, values: &[f64]) -> Result<&mut Self> {
        if values.len() > self.values.len() {
            return Err(ValidationError::ValueCount {
                given: values.len(),
                expected: self.values.len(),
            }
            .into());
        }
        self.values[..values.len()].copy_from_slice(values);
        Ok(self)
    }

    /// Resets every value to unknown.
    pub fn clear(&mut self) -> &mut Self {
        self.values.fill(f64::NAN);
        self
    }

    /// Parses `time:value:value...` into this sample and stores it.
    ///
    /// `N` as the time means now; `U` as a value means unknown. There must be
    /// exactly one value per datasource.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidUpdateString`] if the string is
    /// malformed, otherwise whatever [`update`](Self::update) returns.
    pub fn set_and_update(&mut self, update: &str) -> Result<()> {
        let invalid = |reason: String| ValidationError::InvalidUpdateString {
            input: update.to_string(),
            reason,
        };

        let mut tokens = update.split(':');
        let time = match tokens.next().map(str::trim) {
            Some("N") => now_seconds(),
            Some(t) => t
                .parse::<u64>()
                .map_err(|e| invalid(format!("bad timestamp '{t}': {e}")))?,
            None => return Err(invalid("missing timestamp".to_string()).into()),
        };

        let values = tokens
            .map(|token| match token.trim() {
                "U" => Ok(f64::NAN),
                v => v
                    .parse::<f64>()
                    .map_err(|e| invalid(format!("bad value '{v}': {e}"))),
            })
            .collect::<std::result::Result<Vec<f64>, _>>()?;

        if values.len() != self.values.len() {
            return Err(invalid(format!(
                "expected {} values, found {}",
                self.values.len(),
                values.len()
            ))
            .into());
        }

        self.time = time;
        self.values = values;
        self.update()
    }

    /// Stores this sample in its database.
    ///
    /// # Errors
    ///
    /// See [`RrdDb::store`].
    pub fn update(&self) -> Result<()> {
        self.db.store(self)
    }
}

impl fmt::Display for Sample<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.time)?;
        for v in &self.values {
            if v.is_nan() {
                write!(f, ":U")?;
            } else {
                write!(f, ":{v}")?;
            }
        }
        Ok(())
    }
}
