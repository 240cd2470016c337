//! Circular row indexing for archives.
//!
//! Archives store a fixed number of rows and overwrite the oldest one when a
//! new row is finalized. [`RingCursor`] keeps that pointer arithmetic in one
//! place and away from any I/O, so wraparound can be tested in isolation.
//!
//! # Design
//!
//! - `current` is the physical index of the newest row
//! - the oldest row is `(current + 1) % rows`
//! - logical index `0` is the oldest row, `rows - 1` the newest
//!
//! A fresh cursor starts at `rows - 1`, so the first row written lands at
//! physical index 0 and reads come back in write order.

use crate::error::FormatError;

/// Write pointer of an archive's circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    current: u32,
    rows: u32,
}

impl RingCursor {
    /// Creates a cursor for an empty buffer of `rows` rows.
    ///
    /// `rows` must be positive; definitions are validated before any cursor
    /// is built.
    pub fn new(rows: u32) -> Self {
        Self {
            current: rows.saturating_sub(1),
            rows,
        }
    }

    /// Restores a cursor read from storage.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::CorruptRecord`] if `current` is not a valid row.
    pub fn from_parts(current: u32, rows: u32) -> Result<Self, FormatError> {
        if rows == 0 || current >= rows {
            return Err(FormatError::CorruptRecord {
                record: "archive",
                reason: format!("row pointer {current} outside buffer of {rows} rows"),
            });
        }
        Ok(Self { current, rows })
    }

    /// Physical index of the newest row.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Buffer capacity.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Physical index of the oldest row.
    pub fn oldest(&self) -> u32 {
        self.row_at(0)
    }

    /// Moves to the next slot and returns its physical index.
    ///
    /// The returned slot previously held the oldest row.
    pub fn advance(&mut self) -> u32 {
        self.current = self.row_at(0);
        self.current
    }

    /// Maps a logical index (0 = oldest) to a physical row index.
    ///
    /// Indices past the end wrap around.
    ///
    /// ```rust
    /// use rrdb::ring::RingCursor;
    ///
    /// let mut cursor = RingCursor::new(3);
    /// cursor.advance();
    /// cursor.advance();
    /// assert_eq!(cursor.current(), 1);
    /// assert_eq!(cursor.row_at(0), 2);
    /// assert_eq!(cursor.row_at(2), 1);
    /// ```
    #[allow(clippy::cast_possible_truncation)] // result < rows <= u32::MAX
    pub fn row_at(&self, logical: u32) -> u32 {
        let rows = u64::from(self.rows.max(1));
        ((u64::from(self.current) + 1 + u64::from(logical)) % rows) as u32
    }

    /// Physical indices from oldest to newest.
    pub fn chronological(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.rows).map(|logical| self.row_at(logical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_cursor() {
        let cursor = RingCursor::new(4);
        assert_eq!(cursor.current(), 3);
        assert_eq!(cursor.oldest(), 0);
        assert_eq!(cursor.chronological().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_first_write_lands_at_zero() {
        let mut cursor = RingCursor::new(4);
        assert_eq!(cursor.advance(), 0);
        assert_eq!(cursor.advance(), 1);
        assert_eq!(cursor.oldest(), 2);
    }

    #[test]
    fn test_wraparound() {
        let mut cursor = RingCursor::new(3);
        let written: Vec<u32> = (0..7).map(|_| cursor.advance()).collect();
        assert_eq!(written, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(cursor.current(), 0);
        assert_eq!(cursor.oldest(), 1);
        assert_eq!(cursor.chronological().collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn test_row_at_wraps_past_end() {
        let cursor = RingCursor::from_parts(1, 3).unwrap();
        assert_eq!(cursor.row_at(0), 2);
        assert_eq!(cursor.row_at(1), 0);
        assert_eq!(cursor.row_at(2), 1);
        assert_eq!(cursor.row_at(3), 2);
    }

    #[test]
    fn test_single_row() {
        let mut cursor = RingCursor::new(1);
        assert_eq!(cursor.current(), 0);
        assert_eq!(cursor.advance(), 0);
        assert_eq!(cursor.oldest(), 0);
    }

    #[test]
    fn test_from_parts_rejects_bad_pointer() {
        assert!(RingCursor::from_parts(3, 3).is_err());
        assert!(RingCursor::from_parts(0, 0).is_err());
        assert!(RingCursor::from_parts(2, 3).is_ok());
    }

    #[test]
    fn test_large_buffer_no_overflow() {
        let cursor = RingCursor::from_parts(u32::MAX - 1, u32::MAX).unwrap();
        assert_eq!(cursor.oldest(), 0);
        assert_eq!(cursor.row_at(u32::MAX - 1), u32::MAX - 1);
    }
}
