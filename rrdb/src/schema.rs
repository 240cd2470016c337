//! Definition types for rrdb databases.
//!
//! An [`RrdDef`] fixes everything about a database at creation time: the base
//! step, the ordered datasources and the ordered archives. None of it can be
//! changed afterwards; the backend length is computed from the definition once
//! and never grows.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::layout::{Layout, NAME_SIZE};

/// Default heartbeat multiplier used by [`DsDef::gauge`] and friends.
const DEFAULT_HEARTBEAT_STEPS: u64 = 2;

/// Seconds subtracted from "now" when no explicit start time is given.
const DEFAULT_START_OFFSET: u64 = 10;

/// Returns the current Unix time in whole seconds, rounded to nearest.
pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| {
            #[allow(clippy::cast_possible_truncation)] // millis since epoch fit in u64
            let millis = d.as_millis() as u64;
            (millis + 500) / 1000
        })
        .unwrap_or(0)
}

/// Aligns `timestamp` down to a multiple of `step`.
///
/// ```rust
/// assert_eq!(rrdb::schema::normalize(1_000_123, 300), 999_900);
/// ```
#[inline]
pub fn normalize(timestamp: u64, step: u64) -> u64 {
    timestamp - timestamp % step
}

/// Consolidation function applied when folding primary data points into rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolidationFn {
    /// Mean of the known primary data points.
    Average,
    /// Smallest known primary data point.
    Min,
    /// Largest known primary data point.
    Max,
    /// Most recent known primary data point.
    Last,
}

impl ConsolidationFn {
    /// All consolidation functions, in on-disk code order.
    pub const ALL: [Self; 4] = [Self::Average, Self::Min, Self::Max, Self::Last];

    /// Returns the canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Average => 0,
            Self::Min => 1,
            Self::Max => 2,
            Self::Last => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Folds `value` into a running accumulator.
    ///
    /// NaN on either side is ignored, so an accumulator that starts as NaN
    /// takes the first known value.
    ///
    /// ```rust
    /// use rrdb::ConsolidationFn;
    ///
    /// assert_eq!(ConsolidationFn::Average.fold(f64::NAN, 2.0), 2.0);
    /// assert_eq!(ConsolidationFn::Average.fold(2.0, 3.0), 5.0);
    /// assert_eq!(ConsolidationFn::Min.fold(2.0, 3.0), 2.0);
    /// assert_eq!(ConsolidationFn::Max.fold(2.0, f64::NAN), 2.0);
    /// assert_eq!(ConsolidationFn::Last.fold(2.0, 3.0), 3.0);
    /// ```
    pub fn fold(self, acc: f64, value: f64) -> f64 {
        match self {
            Self::Average => nan_sum(acc, value),
            Self::Min => nan_min(acc, value),
            Self::Max => nan_max(acc, value),
            Self::Last => {
                if value.is_nan() {
                    acc
                } else {
                    value
                }
            }
        }
    }
}

impl fmt::Display for ConsolidationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsolidationFn {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnknownConsolidationFn(s.to_string()))
    }
}

/// Minimum that ignores NaN operands.
pub(crate) fn nan_min(x: f64, y: f64) -> f64 {
    if x.is_nan() {
        y
    } else if y.is_nan() {
        x
    } else {
        x.min(y)
    }
}

/// Maximum that ignores NaN operands.
pub(crate) fn nan_max(x: f64, y: f64) -> f64 {
    if x.is_nan() {
        y
    } else if y.is_nan() {
        x
    } else {
        x.max(y)
    }
}

/// Sum that ignores NaN operands.
pub(crate) fn nan_sum(x: f64, y: f64) -> f64 {
    if x.is_nan() {
        y
    } else if y.is_nan() {
        x
    } else {
        x + y
    }
}

/// How raw samples turn into per-second contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsType {
    /// The value itself is the rate (temperatures, queue depths).
    Gauge,
    /// Monotonic counter; the rate is the wrap-corrected delta over time.
    Counter,
    /// Like a counter but negative deltas are kept.
    Derive,
    /// Counter that resets on every read; the rate is value over time.
    Absolute,
}

impl DsType {
    /// All datasource types, in on-disk code order.
    pub const ALL: [Self; 4] = [Self::Gauge, Self::Counter, Self::Derive, Self::Absolute];

    /// Returns the canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "GAUGE",
            Self::Counter => "COUNTER",
            Self::Derive => "DERIVE",
            Self::Absolute => "ABSOLUTE",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Gauge => 0,
            Self::Counter => 1,
            Self::Derive => 2,
            Self::Absolute => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DsType {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnknownDsType(s.to_string()))
    }
}

/// Definition of a single datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsDef {
    /// Unique name, 1 to 32 bytes.
    pub name: String,

    /// Accumulation semantics.
    pub ds_type: DsType,

    /// Largest gap in seconds between updates before data becomes unknown.
    pub heartbeat: u64,

    /// Lower bound for contributions; NaN means unbounded.
    #[serde(with = "nan_as_null", default = "nan")]
    pub min_value: f64,

    /// Upper bound for contributions; NaN means unbounded.
    #[serde(with = "nan_as_null", default = "nan")]
    pub max_value: f64,
}

impl DsDef {
    /// Creates a datasource definition.
    pub fn new(
        name: impl Into<String>,
        ds_type: DsType,
        heartbeat: u64,
        min_value: f64,
        max_value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            ds_type,
            heartbeat,
            min_value,
            max_value,
        }
    }

    /// Creates an unbounded GAUGE datasource with a heartbeat of two steps.
    pub fn gauge(name: impl Into<String>, step: u64) -> Self {
        Self::new(
            name,
            DsType::Gauge,
            step * DEFAULT_HEARTBEAT_STEPS,
            f64::NAN,
            f64::NAN,
        )
    }

    /// Validates this definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for a bad name, heartbeat or value range.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ValidationError::InvalidName {
                name: self.name.clone(),
                reason: "name cannot be empty".to_string(),
            }
            .into());
        }
        if self.name.len() > NAME_SIZE {
            return Err(ValidationError::InvalidName {
                name: self.name.clone(),
                reason: format!("name longer than {NAME_SIZE} bytes"),
            }
            .into());
        }
        if self.name.contains(['\0', ':']) {
            return Err(ValidationError::InvalidName {
                name: self.name.clone(),
                reason: "name cannot contain NUL or ':'".to_string(),
            }
            .into());
        }
        if self.heartbeat == 0 {
            return Err(ValidationError::InvalidHeartbeat {
                name: self.name.clone(),
                heartbeat: self.heartbeat,
            }
            .into());
        }
        if !self.min_value.is_nan() && !self.max_value.is_nan() && self.min_value >= self.max_value
        {
            return Err(ValidationError::InvalidRange {
                name: self.name.clone(),
                min: self.min_value,
                max: self.max_value,
            }
            .into());
        }
        Ok(())
    }
}

/// Definition of a single archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcDef {
    /// Consolidation function.
    pub consolidation_fn: ConsolidationFn,

    /// Largest tolerated fraction of unknown primary data points per row.
    pub xff: f64,

    /// Primary data points consolidated into one row.
    pub steps: u32,

    /// Circular buffer capacity.
    pub rows: u32,
}

impl ArcDef {
    /// Creates an archive definition.
    pub fn new(consolidation_fn: ConsolidationFn, xff: f64, steps: u32, rows: u32) -> Self {
        Self {
            consolidation_fn,
            xff,
            steps,
            rows,
        }
    }

    /// Validates this definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if xff, steps or rows are out of range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.xff) {
            return Err(ValidationError::InvalidXff { xff: self.xff }.into());
        }
        if self.steps == 0 {
            return Err(ValidationError::InvalidSteps.into());
        }
        if self.rows == 0 {
            return Err(ValidationError::InvalidRows.into());
        }
        Ok(())
    }
}

/// Complete, immutable description of a database.
///
/// # Example
///
/// ```rust
/// use rrdb::schema::{ArcDef, ConsolidationFn, DsDef, DsType, RrdDef};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut def = RrdDef::new("traffic.rrd", 1_000_000_000, 300);
/// def.add_datasource(DsDef::new("input", DsType::Counter, 600, 0.0, f64::NAN));
/// def.add_datasource(DsDef::new("output", DsType::Counter, 600, 0.0, f64::NAN));
/// def.add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 600));
/// def.add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 6, 700));
/// def.add_archive(ArcDef::new(ConsolidationFn::Max, 0.5, 6, 700));
/// def.validate()?;
/// assert!(def.estimated_size() > 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrdDef {
    /// Backend path.
    pub path: PathBuf,

    /// Initial last-update time in seconds.
    pub start_time: u64,

    /// Seconds between primary data points.
    pub step: u64,

    /// Ordered datasource definitions.
    #[serde(default)]
    pub datasources: Vec<DsDef>,

    /// Ordered archive definitions.
    #[serde(default)]
    pub archives: Vec<ArcDef>,
}

impl RrdDef {
    /// Creates an empty definition.
    pub fn new(path: impl Into<PathBuf>, start_time: u64, step: u64) -> Self {
        Self {
            path: path.into(),
            start_time,
            step,
            datasources: Vec::new(),
            archives: Vec::new(),
        }
    }

    /// Creates an empty definition starting ten seconds before now.
    pub fn starting_now(path: impl Into<PathBuf>, step: u64) -> Self {
        Self::new(
            path,
            now_seconds().saturating_sub(DEFAULT_START_OFFSET),
            step,
        )
    }

    /// Appends a datasource.
    pub fn add_datasource(&mut self, ds: DsDef) -> &mut Self {
        self.datasources.push(ds);
        self
    }

    /// Appends an archive.
    pub fn add_archive(&mut self, arc: ArcDef) -> &mut Self {
        self.archives.push(arc);
        self
    }

    /// Validates the whole definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the step is zero, a list is empty,
    /// any entry is invalid, an archive spans more seconds than fit in a
    /// timestamp, or names/archives repeat.
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(ValidationError::InvalidStep.into());
        }
        if self.datasources.is_empty() {
            return Err(ValidationError::NoDatasources.into());
        }
        if self.archives.is_empty() {
            return Err(ValidationError::NoArchives.into());
        }

        let mut names = HashSet::new();
        for ds in &self.datasources {
            ds.validate()?;
            if !names.insert(ds.name.as_str()) {
                return Err(ValidationError::DuplicateDatasource {
                    name: ds.name.clone(),
                }
                .into());
            }
        }

        let mut archives = HashSet::new();
        for arc in &self.archives {
            arc.validate()?;
            let span = self
                .step
                .checked_mul(u64::from(arc.steps))
                .and_then(|arc_step| arc_step.checked_mul(u64::from(arc.rows)));
            if span.is_none() {
                return Err(ValidationError::ArchiveTooLong {
                    consolidation_fn: arc.consolidation_fn,
                    steps: arc.steps,
                    rows: arc.rows,
                }
                .into());
            }
            if !archives.insert((arc.consolidation_fn, arc.steps)) {
                return Err(ValidationError::DuplicateArchive {
                    consolidation_fn: arc.consolidation_fn,
                    steps: arc.steps,
                }
                .into());
            }
        }

        Ok(())
    }

    /// Exact backend length in bytes for this definition.
    pub fn estimated_size(&self) -> u64 {
        self.layout().total_size()
    }

    pub(crate) fn layout(&self) -> Layout {
        let rows: Vec<u32> = self.archives.iter().map(|a| a.rows).collect();
        Layout::new(self.datasources.len(), &rows)
    }

    /// Parses a definition from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidDefinition`] if the JSON is malformed.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            ValidationError::InvalidDefinition {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Reads and parses a JSON definition file.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidDefinition`] if the file cannot be
    /// read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidDefinition {
            reason: format!("cannot read '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Serializes the definition as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidDefinition`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ValidationError::InvalidDefinition {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn nan() -> f64 {
    f64::NAN
}

/// One float in JSON form: a number, or a token for the infinities.
///
/// NaN has no JSON number; callers write it as `null`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JsonFloat {
    Number(f64),
    Token(String),
}

const POSITIVE_INFINITY: &str = "Infinity";
const NEGATIVE_INFINITY: &str = "-Infinity";

impl JsonFloat {
    fn encode(value: f64) -> Option<Self> {
        if value.is_nan() {
            None
        } else if value.is_infinite() {
            let token = if value.is_sign_positive() {
                POSITIVE_INFINITY
            } else {
                NEGATIVE_INFINITY
            };
            Some(Self::Token(token.to_string()))
        } else {
            Some(Self::Number(value))
        }
    }

    fn decode<E: serde::de::Error>(value: Option<Self>) -> std::result::Result<f64, E> {
        match value {
            None => Ok(f64::NAN),
            Some(Self::Number(value)) => Ok(value),
            Some(Self::Token(token)) => match token.as_str() {
                POSITIVE_INFINITY => Ok(f64::INFINITY),
                NEGATIVE_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("invalid number '{other}'"))),
            },
        }
    }
}

/// Serde support for optional bounds and unknown values.
///
/// NaN is written as `null` and infinities as `"Infinity"`/`"-Infinity"`,
/// so every stored value survives a JSON round trip.
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::JsonFloat;

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        JsonFloat::encode(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        JsonFloat::decode(Option::<JsonFloat>::deserialize(deserializer)?)
    }
}

/// Same as [`nan_as_null`] for whole columns of values.
pub(crate) mod nan_vec_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::JsonFloat;

    pub fn serialize<S>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        values
            .iter()
            .map(|v| JsonFloat::encode(*v))
            .collect::<Vec<Option<JsonFloat>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<Option<JsonFloat>>::deserialize(deserializer)?
            .into_iter()
            .map(JsonFloat::decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RrdError;

    fn valid_def() -> RrdDef {
        let mut def = RrdDef::new("test.rrd", 1_000, 300);
        def.add_datasource(DsDef::new("ds", DsType::Gauge, 600, 0.0, 100.0));
        def.add_archive(ArcDef::new(ConsolidationFn::Average, 0.5, 1, 3));
        def
    }

    fn validation_err(def: &RrdDef) -> ValidationError {
        match def.validate().unwrap_err() {
            RrdError::Validation(e) => e,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_definition() {
        assert!(valid_def().validate().is_ok());
    }

    #[test]
    fn test_duplicate_datasource_rejected() {
        let mut def = valid_def();
        def.add_datasource(DsDef::gauge("ds", 300));
        assert_eq!(
            validation_err(&def),
            ValidationError::DuplicateDatasource {
                name: "ds".to_string()
            }
        );
    }

    #[test]
    fn test_xff_bounds() {
        let mut def = valid_def();
        def.archives[0].xff = 1.0;
        assert!(matches!(validation_err(&def), ValidationError::InvalidXff { .. }));

        def.archives[0].xff = -0.1;
        assert!(matches!(validation_err(&def), ValidationError::InvalidXff { .. }));

        def.archives[0].xff = 0.0;
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_zero_rows_and_steps_rejected() {
        let mut def = valid_def();
        def.archives[0].rows = 0;
        assert_eq!(validation_err(&def), ValidationError::InvalidRows);

        let mut def = valid_def();
        def.archives[0].steps = 0;
        assert_eq!(validation_err(&def), ValidationError::InvalidSteps);

        let mut def = valid_def();
        def.step = 0;
        assert_eq!(validation_err(&def), ValidationError::InvalidStep);
    }

    #[test]
    fn test_duplicate_archive_rejected() {
        let mut def = valid_def();
        def.add_archive(ArcDef::new(ConsolidationFn::Average, 0.1, 1, 10));
        assert!(matches!(
            validation_err(&def),
            ValidationError::DuplicateArchive { steps: 1, .. }
        ));
    }

    #[test]
    fn test_name_rules() {
        let mut def = valid_def();
        def.datasources[0].name = "x".repeat(NAME_SIZE + 1);
        assert!(matches!(validation_err(&def), ValidationError::InvalidName { .. }));

        def.datasources[0].name = String::new();
        assert!(matches!(validation_err(&def), ValidationError::InvalidName { .. }));

        def.datasources[0].name = "x".repeat(NAME_SIZE);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_min_max_order() {
        let mut def = valid_def();
        def.datasources[0].min_value = 100.0;
        assert!(matches!(validation_err(&def), ValidationError::InvalidRange { .. }));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("average".parse::<ConsolidationFn>().unwrap(), ConsolidationFn::Average);
        assert_eq!("MAX".parse::<ConsolidationFn>().unwrap(), ConsolidationFn::Max);
        assert!("MEDIAN".parse::<ConsolidationFn>().is_err());
        assert_eq!("counter".parse::<DsType>().unwrap(), DsType::Counter);
        assert!("HISTOGRAM".parse::<DsType>().is_err());
    }

    #[test]
    fn test_codes_round_trip() {
        for f in ConsolidationFn::ALL {
            assert_eq!(ConsolidationFn::from_code(f.code()), Some(f));
        }
        for t in DsType::ALL {
            assert_eq!(DsType::from_code(t.code()), Some(t));
        }
        assert_eq!(ConsolidationFn::from_code(9), None);
    }

    #[test]
    fn test_json_keeps_unbounded_limits() {
        let mut def = valid_def();
        def.datasources[0].max_value = f64::NAN;
        let json = def.to_json().unwrap();
        assert!(json.contains("\"max_value\": null"));
        assert!(json.contains("\"consolidation_fn\": \"AVERAGE\""));

        let parsed = RrdDef::from_json_str(&json).unwrap();
        assert!(parsed.datasources[0].max_value.is_nan());
        assert_eq!(parsed.datasources[0].min_value, 0.0);
        assert_eq!(parsed.archives, def.archives);
    }

    #[test]
    fn test_json_missing_bounds_default_to_unbounded() {
        let json = r#"{
            "path": "x.rrd",
            "start_time": 0,
            "step": 60,
            "datasources": [{"name": "a", "ds_type": "GAUGE", "heartbeat": 120}],
            "archives": [{"consolidation_fn": "LAST", "xff": 0.0, "steps": 1, "rows": 10}]
        }"#;
        let def = RrdDef::from_json_str(json).unwrap();
        assert!(def.datasources[0].min_value.is_nan());
        assert!(def.datasources[0].max_value.is_nan());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_archive_span_must_fit_in_timestamp() {
        let mut def = valid_def();
        def.step = u64::MAX / 2;
        def.archives[0].steps = 4;
        assert!(matches!(
            def.validate(),
            Err(RrdError::Validation(ValidationError::ArchiveTooLong { steps: 4, .. }))
        ));

        let mut def = valid_def();
        def.step = u64::from(u32::MAX);
        def.archives[0].steps = u32::MAX;
        def.archives[0].rows = u32::MAX;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_json_keeps_infinities() {
        let mut def = valid_def();
        def.datasources[0].min_value = f64::NEG_INFINITY;
        def.datasources[0].max_value = f64::INFINITY;
        let json = def.to_json().unwrap();
        assert!(json.contains("\"min_value\": \"-Infinity\""));
        assert!(json.contains("\"max_value\": \"Infinity\""));

        let parsed = RrdDef::from_json_str(&json).unwrap();
        assert_eq!(parsed.datasources[0].min_value, f64::NEG_INFINITY);
        assert_eq!(parsed.datasources[0].max_value, f64::INFINITY);

        let bad = json.replace("\"Infinity\"", "\"lots\"");
        assert!(RrdDef::from_json_str(&bad).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(0, 300), 0);
        assert_eq!(normalize(299, 300), 0);
        assert_eq!(normalize(300, 300), 300);
        assert_eq!(normalize(1_000_000_123, 60), 1_000_000_080);
    }
}
