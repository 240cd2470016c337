//! Error types for the rrdb round-robin database engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::ConsolidationFn;

/// The main error type for all rrdb operations.
///
/// Every failure surfaces to the caller through one of these variants. The
/// only conditions absorbed internally are out-of-range values and heartbeat
/// gaps, which become unknown (NaN) data instead of errors.
#[derive(Error, Debug)]
pub enum RrdError {
    /// A definition failed validation before any backend allocation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An update timestamp did not advance past the last update.
    #[error("ordering error: {0}")]
    Ordering(#[from] OrderingError),

    /// The backend medium failed a read, write, allocate or sync.
    #[error("backend I/O error: {0}")]
    Io(#[from] BackendError),

    /// A write lock could not be obtained.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// A datasource, archive or consolidation function was not found.
    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    /// The database was already closed.
    #[error("database is closed, cannot {operation}")]
    Closed {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The database was opened read-only.
    #[error("database is open read-only, cannot {operation}")]
    ReadOnly {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// Stored bytes do not describe a valid database.
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// A post-fetch expression could not be compiled.
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// A dump could not be produced or parsed.
    #[error("dump error: {0}")]
    Dump(#[from] DumpError),
}

/// Errors raised while validating a database definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The base step must be at least one second.
    #[error("step must be greater than zero")]
    InvalidStep,

    /// No datasources were defined.
    #[error("at least one datasource must be defined")]
    NoDatasources,

    /// No archives were defined.
    #[error("at least one archive must be defined")]
    NoArchives,

    /// Datasource name is empty or too long.
    #[error("invalid datasource name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two datasources share a name.
    #[error("duplicate datasource name '{name}'")]
    DuplicateDatasource {
        /// The repeated name.
        name: String,
    },

    /// Heartbeat must be at least one second.
    #[error("datasource '{name}' has invalid heartbeat {heartbeat}")]
    InvalidHeartbeat {
        /// The datasource name.
        name: String,
        /// The rejected heartbeat.
        heartbeat: u64,
    },

    /// Minimum is not below the maximum.
    #[error("datasource '{name}' has min {min} >= max {max}")]
    InvalidRange {
        /// The datasource name.
        name: String,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// X-files factor outside `[0, 1)`.
    #[error("invalid xff {xff}: must be in [0, 1)")]
    InvalidXff {
        /// The rejected value.
        xff: f64,
    },

    /// Primary data points per row must be positive.
    #[error("archive steps must be greater than zero")]
    InvalidSteps,

    /// Row count must be positive.
    #[error("archive rows must be greater than zero")]
    InvalidRows,

    /// The seconds spanned by an archive do not fit in a timestamp.
    #[error("archive {consolidation_fn}/{steps} with {rows} rows spans more seconds than a timestamp holds")]
    ArchiveTooLong {
        /// Consolidation function of the archive.
        consolidation_fn: ConsolidationFn,
        /// Primary data points per row.
        steps: u32,
        /// Row count.
        rows: u32,
    },

    /// Two archives share a consolidation function and step count.
    #[error("duplicate archive {consolidation_fn}/{steps}")]
    DuplicateArchive {
        /// Consolidation function of the repeated archive.
        consolidation_fn: ConsolidationFn,
        /// Step count of the repeated archive.
        steps: u32,
    },

    /// Unknown consolidation function name.
    #[error("unsupported consolidation function '{0}'")]
    UnknownConsolidationFn(String),

    /// Unknown datasource type name.
    #[error("unsupported datasource type '{0}'")]
    UnknownDsType(String),

    /// Fetch window is empty or inverted.
    #[error("invalid fetch range: start {start} >= end {end}")]
    InvalidTimeRange {
        /// Requested start.
        start: u64,
        /// Requested end.
        end: u64,
    },

    /// Sample values do not line up with the datasources.
    #[error("sample has {given} values, database has {expected} datasources")]
    ValueCount {
        /// Number of values supplied.
        given: usize,
        /// Number of datasources.
        expected: usize,
    },

    /// An rrdtool-style update string could not be parsed.
    #[error("invalid update string '{input}': {reason}")]
    InvalidUpdateString {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A definition file could not be read or parsed.
    #[error("invalid definition: {reason}")]
    InvalidDefinition {
        /// What went wrong.
        reason: String,
    },
}

/// Errors raised when update timestamps are not strictly increasing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderingError {
    /// The timestamp is not greater than the last update time.
    #[error("bad sample timestamp {timestamp}: last update time was {last_update}, at least one second step is required")]
    NonMonotonic {
        /// Rejected timestamp.
        timestamp: u64,
        /// Current last update time.
        last_update: u64,
    },
}

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The medium could not be opened or created.
    #[error("failed to open '{}': {source}", path.display())]
    Open {
        /// Backend path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No backend exists at the given path.
    #[error("no database exists at '{}'", path.display())]
    Missing {
        /// Backend path.
        path: PathBuf,
    },

    /// A read failed.
    #[error("failed to read '{}' at offset {offset}: {source}", path.display())]
    Read {
        /// Backend path.
        path: PathBuf,
        /// Byte offset of the read.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fewer bytes were available than requested.
    #[error("short read on '{}': wanted {length} bytes at offset {offset}, backend length is {available}", path.display())]
    ShortRead {
        /// Backend path.
        path: PathBuf,
        /// Byte offset of the read.
        offset: u64,
        /// Requested length.
        length: usize,
        /// Actual backend length.
        available: u64,
    },

    /// A write failed.
    #[error("failed to write '{}' at offset {offset}: {source}", path.display())]
    Write {
        /// Backend path.
        path: PathBuf,
        /// Byte offset of the write.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A write went past the allocated length of a fixed-size medium.
    #[error("write beyond end of '{}': offset {offset} + length {length} > size {size}", path.display())]
    OutOfBounds {
        /// Backend path.
        path: PathBuf,
        /// Byte offset of the write.
        offset: u64,
        /// Write length.
        length: usize,
        /// Allocated size.
        size: u64,
    },

    /// Pre-allocation failed.
    #[error("failed to set length of '{}' to {length}: {source}", path.display())]
    SetLength {
        /// Backend path.
        path: PathBuf,
        /// Requested length.
        length: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Flushing to the medium failed.
    #[error("failed to sync '{}': {source}", path.display())]
    Sync {
        /// Backend path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backend was used after `close`.
    #[error("backend '{}' is closed", path.display())]
    Closed {
        /// Backend path.
        path: PathBuf,
    },
}

/// Errors raised when exclusive write access cannot be obtained.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another holder owns the OS-level lock.
    #[error("access denied: '{}' is already locked", path.display())]
    Contended {
        /// Backend path.
        path: PathBuf,
    },

    /// The same path is already open for writing in this process.
    #[error("'{}' is already open for R/W access, it cannot be opened for R/W twice", path.display())]
    AlreadyOpen {
        /// Canonical backend path.
        path: PathBuf,
    },

    /// Acquiring the OS-level lock failed for another reason.
    #[error("failed to lock '{}': {source}", path.display())]
    Failed {
        /// Backend path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised when a named entity does not exist.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    /// Unknown datasource name.
    #[error("datasource '{name}' not found")]
    Datasource {
        /// The requested name.
        name: String,
    },

    /// No archive with this consolidation function and step count.
    #[error("archive {consolidation_fn}/{steps} not found")]
    Archive {
        /// Requested consolidation function.
        consolidation_fn: ConsolidationFn,
        /// Requested step count.
        steps: u32,
    },

    /// No archive uses the requested consolidation function.
    #[error("database does not contain a {consolidation_fn} archive")]
    NoMatchingArchive {
        /// Requested consolidation function.
        consolidation_fn: ConsolidationFn,
    },
}

/// Errors raised when stored bytes are not a valid database image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The backend is shorter than a header.
    #[error("backend too small: {length} bytes, expected at least {expected}")]
    TooSmall {
        /// Actual length.
        length: u64,
        /// Minimum length.
        expected: u64,
    },

    /// Wrong magic bytes.
    #[error("invalid magic bytes: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// Expected magic.
        expected: [u8; 4],
        /// Stored magic.
        found: [u8; 4],
    },

    /// Unknown format version.
    #[error("unsupported version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Supported version.
        expected: u32,
        /// Stored version.
        found: u32,
    },

    /// Backend length does not match the layout described by the header.
    #[error("size mismatch: backend is {length} bytes, layout requires {expected}")]
    SizeMismatch {
        /// Actual length.
        length: u64,
        /// Length computed from the stored definition.
        expected: u64,
    },

    /// A record holds an impossible value.
    #[error("corrupt {record} record: {reason}")]
    CorruptRecord {
        /// Record kind.
        record: &'static str,
        /// Description of the problem.
        reason: String,
    },
}

/// Errors raised while compiling a post-fetch expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    /// The expression has no tokens.
    #[error("expression is empty")]
    Empty,

    /// A token is neither a number nor a known operator.
    #[error("unknown token '{token}'")]
    UnknownToken {
        /// The offending token.
        token: String,
    },

    /// An operator needs more operands than the stack holds.
    #[error("stack underflow at token '{token}'")]
    StackUnderflow {
        /// The operator that underflowed.
        token: String,
    },

    /// The expression leaves more or less than one value.
    #[error("expression leaves {depth} values on the stack, expected exactly 1")]
    UnbalancedStack {
        /// Final stack depth.
        depth: usize,
    },
}

/// Errors raised while exporting or importing a dump.
#[derive(Error, Debug)]
pub enum DumpError {
    /// Serializing the dump failed.
    #[error("failed to serialize dump: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Parsing the dump failed.
    #[error("failed to parse dump: {source}")]
    Parse {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing a dump file failed.
    #[error("failed to access dump file '{}': {source}", path.display())]
    File {
        /// The dump file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The dump is internally inconsistent.
    #[error("inconsistent dump: {reason}")]
    Inconsistent {
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Type alias for `Result<T, RrdError>`.
pub type Result<T> = std::result::Result<T, RrdError>;
