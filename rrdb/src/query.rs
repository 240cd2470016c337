//! Fetch requests and archive selection.
//!
//! A [`FetchRequest`] names a consolidation function, a half-open time window
//! `[start, end)` and a desired resolution. Answering it means choosing one
//! archive: preferably one that covers the whole window at the closest step,
//! otherwise the one that overlaps the window the most.
//!
//! # Coverage
//!
//! A row stamped `t` holds the value for `[t, t + arc_step)`, so an archive
//! whose newest row is stamped `newest` and oldest `oldest` covers
//! `[oldest, newest + arc_step)`.

use crate::error::{NotFoundError, Result, ValidationError};
use crate::fetch::FetchData;
use crate::schema::{ConsolidationFn, normalize};
use crate::RrdDb;

/// Time range an archive can answer for, used during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSpan {
    /// Consolidation function of the archive.
    pub consolidation_fn: ConsolidationFn,
    /// Seconds per row.
    pub arc_step: u64,
    /// Timestamp of the oldest row.
    pub start: u64,
    /// End of the newest row's interval (exclusive).
    pub end: u64,
}

/// How an archive's span relates to a requested window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// The whole window lies inside the archive's span.
    Full,
    /// Seconds of the window the archive covers; may be negative when the
    /// span and the window are disjoint.
    Partial(i64),
}

/// Classifies how `span` covers the window `[start, end)`.
///
/// ```rust
/// use rrdb::query::{analyze_coverage, ArchiveSpan, Coverage};
/// use rrdb::ConsolidationFn;
///
/// let span = ArchiveSpan {
///     consolidation_fn: ConsolidationFn::Average,
///     arc_step: 60,
///     start: 1000,
///     end: 5000,
/// };
/// assert_eq!(analyze_coverage(&span, 2000, 4000), Coverage::Full);
/// assert_eq!(analyze_coverage(&span, 500, 4000), Coverage::Partial(3000));
/// ```
pub fn analyze_coverage(span: &ArchiveSpan, start: u64, end: u64) -> Coverage {
    if span.start <= start && span.end >= end {
        return Coverage::Full;
    }

    let signed = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
    let mut overlap = signed(end) - signed(start);
    if span.start > start {
        overlap -= signed(span.start - start);
    }
    if span.end < end {
        overlap -= signed(end - span.end);
    }
    Coverage::Partial(overlap)
}

/// Picks the archive that best answers `[start, end)` at `resolution`.
///
/// Full matches win over partial ones. Among full matches the step closest to
/// `resolution` wins; among partial matches the largest overlap wins. Ties go
/// to the archive defined first.
///
/// # Errors
///
/// Returns [`NotFoundError::NoMatchingArchive`] if no archive uses
/// `consolidation_fn`.
pub fn select_archive(
    spans: &[ArchiveSpan],
    consolidation_fn: ConsolidationFn,
    start: u64,
    end: u64,
    resolution: u64,
) -> std::result::Result<usize, NotFoundError> {
    let mut best_full: Option<(usize, u64)> = None;
    let mut best_partial: Option<(usize, i64)> = None;

    for (index, span) in spans.iter().enumerate() {
        if span.consolidation_fn != consolidation_fn {
            continue;
        }
        match analyze_coverage(span, start, end) {
            Coverage::Full => {
                let diff = span.arc_step.abs_diff(resolution);
                if best_full.is_none_or(|(_, best)| diff < best) {
                    best_full = Some((index, diff));
                }
            }
            Coverage::Partial(overlap) => {
                if best_partial.is_none_or(|(_, best)| overlap > best) {
                    best_partial = Some((index, overlap));
                }
            }
        }
    }

    best_full
        .map(|(index, _)| index)
        .or(best_partial.map(|(index, _)| index))
        .ok_or(NotFoundError::NoMatchingArchive { consolidation_fn })
}

/// Picks the archive whose history reaches back to `start` with the step
/// closest to `resolution`, falling back to the closest step overall.
///
/// # Errors
///
/// Returns [`NotFoundError::NoMatchingArchive`] if no archive uses
/// `consolidation_fn`.
pub fn select_start_match(
    spans: &[ArchiveSpan],
    consolidation_fn: ConsolidationFn,
    start: u64,
    resolution: u64,
) -> std::result::Result<usize, NotFoundError> {
    let mut covering: Option<(usize, u64)> = None;
    let mut fallback: Option<(usize, u64)> = None;

    for (index, span) in spans.iter().enumerate() {
        if span.consolidation_fn != consolidation_fn {
            continue;
        }
        let diff = span.arc_step.abs_diff(resolution);
        let slot = if start >= span.start {
            &mut covering
        } else {
            &mut fallback
        };
        if slot.is_none_or(|(_, best)| diff < best) {
            *slot = Some((index, diff));
        }
    }

    covering
        .or(fallback)
        .map(|(index, _)| index)
        .ok_or(NotFoundError::NoMatchingArchive { consolidation_fn })
}

/// Aligned timestamps `t` with `normalize(start) <= t < end`, at least one.
pub fn fetch_timestamps(start: u64, end: u64, arc_step: u64) -> Vec<u64> {
    let first = normalize(start, arc_step);
    let mut timestamps = vec![first];
    let mut t = first + arc_step;
    while t < end {
        timestamps.push(t);
        t += arc_step;
    }
    timestamps
}

/// A query against one database.
///
/// Created by [`RrdDb::create_fetch_request`].
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    db: &'a RrdDb,
    consolidation_fn: ConsolidationFn,
    start: u64,
    end: u64,
    resolution: u64,
    filter: Option<Vec<String>>,
}

impl<'a> FetchRequest<'a> {
    pub(crate) fn new(db: &'a RrdDb, consolidation_fn: ConsolidationFn, start: u64, end: u64) -> Result<Self> {
        if start >= end {
            return Err(ValidationError::InvalidTimeRange { start, end }.into());
        }
        Ok(Self {
            db,
            consolidation_fn,
            start,
            end,
            resolution: 1,
            filter: None,
        })
    }

    /// Sets the desired seconds per output point; 1 means the finest available.
    #[must_use]
    pub fn with_resolution(mut self, resolution: u64) -> Self {
        self.resolution = resolution.max(1);
        self
    }

    /// Restricts the result to the named datasources, in the given order.
    #[must_use]
    pub fn with_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Requested consolidation function.
    pub fn consolidation_fn(&self) -> ConsolidationFn {
        self.consolidation_fn
    }

    /// Window start (inclusive).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Window end (exclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Desired seconds per output point.
    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// Datasource filter, if any.
    pub fn filter(&self) -> Option<&[String]> {
        self.filter.as_deref()
    }

    /// Runs the request against the database it was created from.
    ///
    /// # Errors
    ///
    /// See [`RrdDb::fetch`].
    pub fn fetch_data(&self) -> Result<FetchData> {
        self.db.fetch(self)
    }
}
