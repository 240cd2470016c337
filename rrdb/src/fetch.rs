//! Fetch results.
//!
//! [`FetchData`] is an immutable table: one row per synthesized timestamp and
//! one column per selected datasource. Values are consolidated data points as
//! stored in the chosen archive, with NaN for unknown or uncovered slots.

use std::fmt;

use serde::Serialize;

use crate::error::{DumpError, NotFoundError, Result};
use crate::rpn::Expression;
use crate::schema::{ConsolidationFn, nan_as_null, nan_min, nan_max, nan_vec_as_null};

/// One row of a fetch result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchPoint {
    /// Start of the interval the values describe.
    pub timestamp: u64,
    /// One value per column, NaN if unknown.
    #[serde(with = "nan_vec_as_null")]
    pub values: Vec<f64>,
}

impl fmt::Display for FetchPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.timestamp)?;
        for v in &self.values {
            write!(f, " {v}")?;
        }
        Ok(())
    }
}

/// Result of a fetch request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchData {
    consolidation_fn: ConsolidationFn,
    start: u64,
    end: u64,
    arc_index: usize,
    step: u64,
    timestamps: Vec<u64>,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl FetchData {
    pub(crate) fn new(
        consolidation_fn: ConsolidationFn,
        (start, end): (u64, u64),
        arc_index: usize,
        step: u64,
        timestamps: Vec<u64>,
        names: Vec<String>,
        columns: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            consolidation_fn,
            start,
            end,
            arc_index,
            step,
            timestamps,
            names,
            columns,
        }
    }

    /// Consolidation function of the archive the data came from.
    pub fn consolidation_fn(&self) -> ConsolidationFn {
        self.consolidation_fn
    }

    /// Requested window start.
    pub fn request_start(&self) -> u64 {
        self.start
    }

    /// Requested window end (exclusive).
    pub fn request_end(&self) -> u64 {
        self.end
    }

    /// Index of the archive that answered the request.
    pub fn arc_index(&self) -> usize {
        self.arc_index
    }

    /// Seconds between rows.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Number of datasource columns.
    pub fn column_count(&self) -> usize {
        self.names.len()
    }

    /// Row timestamps, oldest first.
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    /// Datasource names in column order.
    pub fn ds_names(&self) -> &[String] {
        &self.names
    }

    /// Timestamp of the first row.
    pub fn first_timestamp(&self) -> u64 {
        self.timestamps.first().copied().unwrap_or(self.start)
    }

    /// Timestamp of the last row.
    pub fn last_timestamp(&self) -> u64 {
        self.timestamps.last().copied().unwrap_or(self.start)
    }

    /// Column index of datasource `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`] if `name` is not in the result.
    pub fn ds_index(&self, name: &str) -> Result<usize> {
        self.names.iter().position(|n| n == name).ok_or_else(|| {
            NotFoundError::Datasource {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Values of column `index`.
    pub fn values(&self, index: usize) -> Option<&[f64]> {
        self.columns.get(index).map(Vec::as_slice)
    }

    /// Values of datasource `name`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`] if `name` is not in the result.
    pub fn values_by_name(&self, name: &str) -> Result<&[f64]> {
        let index = self.ds_index(name)?;
        Ok(&self.columns[index])
    }

    /// Row `index` as a timestamp plus one value per column.
    pub fn row(&self, index: usize) -> Option<FetchPoint> {
        let timestamp = *self.timestamps.get(index)?;
        Some(FetchPoint {
            timestamp,
            values: self.columns.iter().map(|c| c[index]).collect(),
        })
    }

    /// All rows in order.
    pub fn rows(&self) -> impl Iterator<Item = FetchPoint> + '_ {
        (0..self.row_count()).filter_map(|i| self.row(i))
    }

    /// Aggregates datasource `name` over the requested window.
    ///
    /// `Average` weights each row by the seconds its interval overlaps the
    /// window and skips unknown rows; `Min` and `Max` ignore unknown rows;
    /// `Last` returns the final row's value.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`] if `name` is not in the result.
    pub fn aggregate(&self, name: &str, consolidation_fn: ConsolidationFn) -> Result<f64> {
        let values = self.values_by_name(name)?;
        Ok(self.aggregate_values(values.iter().copied(), consolidation_fn))
    }

    /// Like [`aggregate`](Self::aggregate), applying `transform` to every value
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError::Datasource`] if `name` is not in the result.
    pub fn aggregate_with(&self, name: &str, consolidation_fn: ConsolidationFn, transform: &Expression) -> Result<f64> {
        let values = self.values_by_name(name)?;
        Ok(self.aggregate_values(values.iter().map(|&v| transform.eval(v)), consolidation_fn))
    }

    #[allow(clippy::cast_precision_loss)] // window lengths are far below 2^52
    fn aggregate_values(&self, values: impl Iterator<Item = f64>, consolidation_fn: ConsolidationFn) -> f64 {
        match consolidation_fn {
            ConsolidationFn::Average => {
                let mut total = 0.0;
                let mut seconds = 0u64;
                for (&t, v) in self.timestamps.iter().zip(values) {
                    let from = t.max(self.start);
                    let to = (t + self.step).min(self.end);
                    if to > from && !v.is_nan() {
                        let dt = to - from;
                        seconds += dt;
                        total += v * dt as f64;
                    }
                }
                if seconds > 0 {
                    total / seconds as f64
                } else {
                    f64::NAN
                }
            }
            ConsolidationFn::Min => values.fold(f64::NAN, nan_min),
            ConsolidationFn::Max => values.fold(f64::NAN, nan_max),
            ConsolidationFn::Last => values.last().unwrap_or(f64::NAN),
        }
    }

    /// Serializes the request parameters and all rows as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::Serialize`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Export<'a> {
            consolidation_fn: ConsolidationFn,
            start: u64,
            end: u64,
            step: u64,
            ds_names: &'a [String],
            rows: Vec<FetchPoint>,
        }

        let export = Export {
            consolidation_fn: self.consolidation_fn,
            start: self.start,
            end: self.end,
            step: self.step,
            ds_names: &self.names,
            rows: self.rows().collect(),
        };
        serde_json::to_string_pretty(&export).map_err(|source| DumpError::Serialize { source }.into())
    }

    /// Serializes one aggregate per column as JSON, `null` when unknown.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::Serialize`] if serialization fails.
    pub fn aggregates_json(&self, consolidation_fn: ConsolidationFn) -> Result<String> {
        #[derive(Serialize)]
        struct Aggregate<'a> {
            name: &'a str,
            #[serde(with = "nan_as_null")]
            value: f64,
        }

        let aggregates: Vec<Aggregate<'_>> = self
            .names
            .iter()
            .zip(&self.columns)
            .map(|(name, column)| Aggregate {
                name,
                value: self.aggregate_values(column.iter().copied(), consolidation_fn),
            })
            .collect();
        serde_json::to_string_pretty(&aggregates).map_err(|source| DumpError::Serialize { source }.into())
    }
}

impl fmt::Display for FetchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>12}", "")?;
        for name in &self.names {
            write!(f, " {name:>14}")?;
        }
        writeln!(f)?;
        for point in self.rows() {
            write!(f, "{:>11}:", point.timestamp)?;
            for v in &point.values {
                write!(f, " {v:>14.6}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
