//! Binary layout of an rrdb backend.
//!
//! Every record lives at a fixed offset computed from the datasource count and
//! the per-archive row counts. The same [`Layout`] is used by the writer at
//! creation time and by the reader on open, so the two cannot drift apart.
//!
//! # File Format
//!
//! ```text
//! [0..64)                     Header
//! [64..64+96*N)               Datasource records (N = datasource count)
//! for each archive a:
//!   [arc..arc+32)             Archive record
//!   [..+16*N)                 CDP status, one per datasource
//!   [..+8*N*rows(a))          Row values, one column of rows(a) f64 per datasource
//! ```
//!
//! All integers and floats are little-endian.

use crate::error::FormatError;

/// Magic bytes identifying an rrdb backend.
pub const MAGIC: [u8; 4] = *b"RRDB";

/// Current format version.
pub const VERSION: u32 = 1;

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Size of one datasource record in bytes.
pub const DS_RECORD_SIZE: usize = 96;

/// Size of one archive record in bytes.
pub const ARC_RECORD_SIZE: usize = 32;

/// Size of one CDP status record in bytes.
pub const CDP_RECORD_SIZE: usize = 16;

/// Size of one stored value in bytes.
pub const VALUE_SIZE: usize = 8;

/// Fixed width of a datasource name, NUL-padded.
pub const NAME_SIZE: usize = 32;

/// Header fields describing the whole database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Seconds between primary data points.
    pub step: u64,
    /// Number of datasources.
    pub ds_count: u32,
    /// Number of archives.
    pub arc_count: u32,
    /// Timestamp of the last successful update.
    pub last_update: u64,
}

impl Header {
    /// Encodes the header into its on-disk form.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = RecordWriter::new(HEADER_SIZE);
        w.bytes(&MAGIC);
        w.u32(VERSION);
        w.u64(self.step);
        w.u32(self.ds_count);
        w.u32(self.arc_count);
        w.u64(self.last_update);
        w.finish()
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the buffer is short, the magic or version is
    /// wrong, or the counts are zero.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::TooSmall {
                length: buf.len() as u64,
                expected: HEADER_SIZE as u64,
            });
        }

        let mut r = RecordReader::new("header", buf);
        let magic = r.array::<4>()?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion {
                expected: VERSION,
                found: version,
            });
        }

        let header = Self {
            step: r.u64()?,
            ds_count: r.u32()?,
            arc_count: r.u32()?,
            last_update: r.u64()?,
        };

        if header.step == 0 || header.ds_count == 0 || header.arc_count == 0 {
            return Err(FormatError::CorruptRecord {
                record: "header",
                reason: format!(
                    "step {}, {} datasources, {} archives",
                    header.step, header.ds_count, header.arc_count
                ),
            });
        }

        Ok(header)
    }
}

/// Byte offset of the last-update field inside the header.
pub(crate) const LAST_UPDATE_OFFSET: u64 = 24;

/// Offsets of every record in a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    ds_count: usize,
    rows: Vec<u32>,
    archive_offsets: Vec<u64>,
    total_size: u64,
}

impl Layout {
    /// Computes the layout for `ds_count` datasources and one archive per
    /// entry of `rows`.
    pub fn new(ds_count: usize, rows: &[u32]) -> Self {
        let mut offset = (HEADER_SIZE + ds_count * DS_RECORD_SIZE) as u64;
        let mut archive_offsets = Vec::with_capacity(rows.len());

        for &row_count in rows {
            archive_offsets.push(offset);
            offset += Self::archive_size(ds_count, row_count);
        }

        Self {
            ds_count,
            rows: rows.to_vec(),
            archive_offsets,
            total_size: offset,
        }
    }

    fn archive_size(ds_count: usize, rows: u32) -> u64 {
        (ARC_RECORD_SIZE + ds_count * CDP_RECORD_SIZE) as u64
            + (ds_count * VALUE_SIZE) as u64 * u64::from(rows)
    }

    /// Total backend length in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Offset of the header.
    pub fn header_offset(&self) -> u64 {
        0
    }

    /// Offset of datasource record `ds`.
    pub fn ds_offset(&self, ds: usize) -> u64 {
        (HEADER_SIZE + ds * DS_RECORD_SIZE) as u64
    }

    /// Offset of archive record `arc`.
    pub fn archive_offset(&self, arc: usize) -> u64 {
        self.archive_offsets[arc]
    }

    /// Offset of the CDP status of datasource `ds` in archive `arc`.
    pub fn cdp_offset(&self, arc: usize, ds: usize) -> u64 {
        self.archive_offsets[arc] + (ARC_RECORD_SIZE + ds * CDP_RECORD_SIZE) as u64
    }

    /// Offset of the first row value of datasource `ds` in archive `arc`.
    pub fn values_offset(&self, arc: usize, ds: usize) -> u64 {
        let column = (ds * VALUE_SIZE) as u64 * u64::from(self.rows[arc]);
        self.archive_offsets[arc] + (ARC_RECORD_SIZE + self.ds_count * CDP_RECORD_SIZE) as u64 + column
    }

    /// Offset of physical row `row` of datasource `ds` in archive `arc`.
    pub fn row_offset(&self, arc: usize, ds: usize, row: u32) -> u64 {
        self.values_offset(arc, ds) + u64::from(row) * VALUE_SIZE as u64
    }
}

/// Sequential little-endian encoder for a fixed-size record.
#[derive(Debug)]
pub(crate) struct RecordWriter {
    buf: Vec<u8>,
    size: usize,
}

impl RecordWriter {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(size),
            size,
        }
    }

    pub(crate) fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    pub(crate) fn f64(&mut self, v: f64) {
        self.bytes(&v.to_le_bytes());
    }

    /// Zero-pads up to `offset`.
    pub(crate) fn pad_to(&mut self, offset: usize) {
        if self.buf.len() < offset {
            self.buf.resize(offset, 0);
        }
    }

    /// Pads to the record size and returns the bytes.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        let size = self.size;
        self.pad_to(size);
        self.buf
    }
}

/// Sequential little-endian decoder for a fixed-size record.
#[derive(Debug)]
pub(crate) struct RecordReader<'a> {
    record: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(record: &'static str, buf: &'a [u8]) -> Self {
        Self { record, buf, pos: 0 }
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| FormatError::CorruptRecord {
                record: self.record,
                reason: format!("truncated at byte {} of {}", self.pos, self.buf.len()),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64, FormatError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }

    pub(crate) fn corrupt(&self, reason: impl Into<String>) -> FormatError {
        FormatError::CorruptRecord {
            record: self.record,
            reason: reason.into(),
        }
    }
}

/// Encodes a column of values.
pub(crate) fn encode_values(values: &[f64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * VALUE_SIZE);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Decodes a column of values; trailing partial values are ignored.
pub(crate) fn decode_values(buf: &[u8]) -> Vec<f64> {
    buf.chunks_exact(VALUE_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; VALUE_SIZE];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect()
}
