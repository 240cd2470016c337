//! Portable dumps of a whole database.
//!
//! An [`RrdDump`] carries the header fields, every datasource's accumulator
//! state, and every archive's CDP state plus its rows in chronological order.
//! It serializes to JSON for backup and migration and can be turned back into
//! a binary instance with [`RrdDb::import`](crate::RrdDb::import). Unknown
//! values are written as `null`.
//!
//! # Example
//!
//! ```rust,no_run
//! use rrdb::{MemoryBackendFactory, RrdDb, RrdDump};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = MemoryBackendFactory::new();
//! let db = RrdDb::open("/db/a.rrd", false, &factory)?;
//! let json = db.export_json()?;
//! let dump = RrdDump::from_json(&json)?;
//! let copy = RrdDb::import("/db/b.rrd", &dump, &factory)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DumpError, Result};
use crate::layout::VERSION;
use crate::schema::{
    ArcDef, ConsolidationFn, DsDef, DsType, RrdDef, nan_as_null, nan_vec_as_null,
};

/// Serializable image of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrdDump {
    /// Binary format version the dump was taken from.
    pub version: u32,
    /// Base step in seconds.
    pub step: u64,
    /// Timestamp of the last accepted update.
    pub last_update: u64,
    /// Datasource state, in definition order.
    pub datasources: Vec<DsDump>,
    /// Archive state, in definition order.
    pub archives: Vec<ArcDump>,
}

/// Definition and accumulator state of one datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsDump {
    /// Datasource name.
    pub name: String,
    /// Datasource type.
    pub ds_type: DsType,
    /// Maximum seconds between updates.
    pub heartbeat: u64,
    /// Lower bound, `null` when unbounded.
    #[serde(with = "nan_as_null")]
    pub min_value: f64,
    /// Upper bound, `null` when unbounded.
    #[serde(with = "nan_as_null")]
    pub max_value: f64,
    /// Last raw value seen.
    #[serde(with = "nan_as_null")]
    pub last_value: f64,
    /// Time-weighted sum for the step in progress.
    #[serde(with = "nan_as_null")]
    pub accum_value: f64,
    /// Unknown seconds in the step in progress.
    pub nan_seconds: u64,
}

/// In-progress consolidation state of one datasource in one archive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CdpDump {
    /// Running statistic for the row in progress.
    #[serde(with = "nan_as_null")]
    pub accum_value: f64,
    /// Unknown primary data points folded into the row in progress.
    pub nan_steps: u64,
}

/// One archive row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDump {
    /// Start of the interval the row describes.
    pub timestamp: u64,
    /// One value per datasource.
    #[serde(with = "nan_vec_as_null")]
    pub values: Vec<f64>,
}

/// Definition, CDP state and rows of one archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcDump {
    /// Consolidation function.
    pub consolidation_fn: ConsolidationFn,
    /// X-files factor.
    pub xff: f64,
    /// Primary data points per row.
    pub steps: u32,
    /// Row count.
    pub rows: u32,
    /// One entry per datasource.
    pub cdps: Vec<CdpDump>,
    /// Rows, oldest first.
    pub database: Vec<RowDump>,
}

impl ArcDump {
    /// Values of datasource `ds`, oldest first.
    pub fn column(&self, ds: usize) -> Vec<f64> {
        self.database
            .iter()
            .map(|row| row.values.get(ds).copied().unwrap_or(f64::NAN))
            .collect()
    }

    fn def(&self) -> ArcDef {
        ArcDef::new(self.consolidation_fn, self.xff, self.steps, self.rows)
    }
}

impl RrdDump {
    /// Parses a dump from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::Parse`] for malformed JSON and
    /// [`DumpError::Inconsistent`] if the parsed dump fails
    /// [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let dump: Self = serde_json::from_str(json).map_err(|source| DumpError::Parse { source })?;
        dump.validate()?;
        Ok(dump)
    }

    /// Reads and parses a dump file.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::File`] if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| DumpError::File {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Serializes the dump as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::Serialize`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|source| DumpError::Serialize { source }.into())
    }

    /// Checks that the dump describes a database that can be rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::Inconsistent`] if the version is unsupported,
    /// counts disagree, or the embedded definition is invalid.
    pub fn validate(&self) -> Result<()> {
        let inconsistent = |reason: String| -> crate::RrdError { DumpError::Inconsistent { reason }.into() };

        if self.version != VERSION {
            return Err(inconsistent(format!(
                "unsupported version {}, expected {VERSION}",
                self.version
            )));
        }

        let ds_count = self.datasources.len();
        for (index, arc) in self.archives.iter().enumerate() {
            if arc.cdps.len() != ds_count {
                return Err(inconsistent(format!(
                    "archive {index} has {} cdp entries for {ds_count} datasources",
                    arc.cdps.len()
                )));
            }
            if arc.database.len() != arc.rows as usize {
                return Err(inconsistent(format!(
                    "archive {index} declares {} rows but holds {}",
                    arc.rows,
                    arc.database.len()
                )));
            }
            if let Some(row) = arc.database.iter().find(|row| row.values.len() != ds_count) {
                return Err(inconsistent(format!(
                    "archive {index} row at {} has {} values for {ds_count} datasources",
                    row.timestamp,
                    row.values.len()
                )));
            }
        }

        self.to_def(PathBuf::new())
            .validate()
            .map_err(|e| inconsistent(format!("invalid definition: {e}")))
    }

    /// The definition of the dumped database, rooted at `path`, starting at
    /// the dump's last update time.
    pub fn to_def(&self, path: impl Into<PathBuf>) -> RrdDef {
        let mut def = RrdDef::new(path, self.last_update, self.step);
        for ds in &self.datasources {
            def.add_datasource(DsDef::new(
                ds.name.clone(),
                ds.ds_type,
                ds.heartbeat,
                ds.min_value,
                ds.max_value,
            ));
        }
        for arc in &self.archives {
            def.add_archive(arc.def());
        }
        def
    }
}

impl fmt::Display for RrdDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "version = {}", self.version)?;
        writeln!(f, "step = {}", self.step)?;
        writeln!(f, "last_update = {}", self.last_update)?;

        for ds in &self.datasources {
            writeln!(f)?;
            writeln!(f, "ds[{}].type = {}", ds.name, ds.ds_type)?;
            writeln!(f, "ds[{}].minimal_heartbeat = {}", ds.name, ds.heartbeat)?;
            writeln!(f, "ds[{}].min = {}", ds.name, ds.min_value)?;
            writeln!(f, "ds[{}].max = {}", ds.name, ds.max_value)?;
            writeln!(f, "ds[{}].last_ds = {}", ds.name, ds.last_value)?;
            writeln!(f, "ds[{}].value = {}", ds.name, ds.accum_value)?;
            writeln!(f, "ds[{}].unknown_sec = {}", ds.name, ds.nan_seconds)?;
        }

        for (index, arc) in self.archives.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "rra[{index}].cf = {}", arc.consolidation_fn)?;
            writeln!(f, "rra[{index}].rows = {}", arc.rows)?;
            writeln!(f, "rra[{index}].pdp_per_row = {}", arc.steps)?;
            writeln!(f, "rra[{index}].xff = {}", arc.xff)?;
            for (ds, cdp) in self.datasources.iter().zip(&arc.cdps) {
                writeln!(f, "rra[{index}].cdp_prep[{}].value = {}", ds.name, cdp.accum_value)?;
                writeln!(
                    f,
                    "rra[{index}].cdp_prep[{}].unknown_datapoints = {}",
                    ds.name, cdp.nan_steps
                )?;
            }
            for row in &arc.database {
                write!(f, "{}:", row.timestamp)?;
                for v in &row.values {
                    write!(f, " {v}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
