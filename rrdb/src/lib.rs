//! # rrdb
//!
//! Fixed-size round-robin time-series database engine.
//!
//! rrdb stores timestamped numeric samples for a fixed set of named
//! datasources in a single storage medium whose size never changes. Samples
//! are turned into per-step primary data points, consolidated into coarser
//! rows by each archive, and kept in bounded circular buffers. Queries pick
//! the archive that best covers the requested window.
//!
//! ## Key Properties
//!
//! - Size is fixed at creation by the definition, not by data volume
//! - Consolidation (AVERAGE, MIN, MAX, LAST) happens at write time
//! - Unknown data is a first-class value (NaN), never an error
//! - Pluggable backends: plain file, memory-mapped file, in-process memory
//! - Advisory cross-process locking plus an in-process single-writer registry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rrdb::{ArcDef, ConsolidationFn, DsDef, DsType, FileBackendFactory, RrdDb, RrdDef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut def = RrdDef::starting_now("./traffic.rrd", 300);
//! def.add_datasource(DsDef::new("inbound", DsType::Counter, 600, 0.0, f64::NAN))
//!     .add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 288))
//!     .add_archive(ArcDef::new(ConsolidationFn::Max, 0.5, 12, 168));
//!
//! let factory = FileBackendFactory::new();
//! let db = RrdDb::create(&def, &factory)?;
//!
//! let mut sample = db.create_sample_now();
//! sample.set_value("inbound", 1_234_567.0)?;
//! sample.update()?;
//!
//! let now = db.last_update_time();
//! let data = db
//!     .create_fetch_request(ConsolidationFn::Average, now - 86_400, now)?
//!     .fetch_data()?;
//! println!("{data}");
//! db.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RrdDb`]: top-level handle; create, open, store, fetch, dump, close
//! - [`RrdDef`]: datasource and archive definitions, loadable from JSON
//! - [`Sample`]: one pending update
//! - [`FetchRequest`] / [`FetchData`]: queries and their results
//! - [`BackendFactory`]: where the bytes live
//!
//! ## Modules
//!
//! - [`db`]: lifecycle and the update and fetch transactions
//! - [`schema`]: definitions, consolidation functions, datasource types
//! - [`datasource`]: rate computation and primary data points
//! - [`archive`]: consolidation into rows
//! - [`ring`]: circular buffer indexing
//! - [`layout`]: binary record layout
//! - [`backend`]: storage media and locking
//! - [`query`]: archive selection
//! - [`fetch`]: fetch results and aggregation
//! - [`rpn`]: post-fetch value expressions
//! - [`export`]: portable dumps
//! - [`error`]: error types

pub mod archive;
pub mod backend;
pub mod datasource;
pub mod db;
pub mod error;
pub mod export;
pub mod fetch;
pub mod layout;
pub mod query;
pub mod ring;
pub mod rpn;
pub mod sample;
pub mod schema;

// Re-export primary API types at crate root for convenience.
pub use backend::{
    Access, Backend, BackendFactory, FileBackendFactory, LockMode, MemoryBackendFactory,
    MmapBackendFactory, WriterRegistry,
};
pub use db::{RrdDb, State};
pub use error::{Result, RrdError};
pub use export::RrdDump;
pub use fetch::{FetchData, FetchPoint};
pub use layout::Header;
pub use query::FetchRequest;
pub use rpn::Expression;
pub use sample::Sample;
pub use schema::{ArcDef, ConsolidationFn, DsDef, DsType, RrdDef};
