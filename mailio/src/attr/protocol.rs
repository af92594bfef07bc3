//! Pure record encoding and parsing.
//!
//! These functions operate on byte buffers and never perform I/O, except for
//! [`RecordReader::read_from`] which pulls one chunk from a reader.

use std::io::{self, Read};

use super::types::{ParseResult, Record};
use crate::error::*;

/// Default ceiling on the size of one incoming record.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Serialize a record: `name NUL value NUL` per attribute, then a lone NUL.
///
/// # Example
///
/// ```
/// use mailio::attr::{encode_record, Record};
///
/// let record = Record::new().num("status", 0);
/// assert_eq!(encode_record(&record).unwrap(), b"status\x000\x00\x00");
/// ```
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for (name, value) in record.iter() {
        if name.is_empty() {
            return Err(Error::InvalidAttribute {
                name: name.to_string(),
                reason: "empty attribute name",
            });
        }
        if name.as_bytes().contains(&0) {
            return Err(Error::InvalidAttribute {
                name: name.to_string(),
                reason: "NUL in attribute name",
            });
        }
        if value.as_bytes().contains(&0) {
            return Err(Error::InvalidAttribute {
                name: name.to_string(),
                reason: "NUL in attribute value",
            });
        }
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
    }
    bytes.push(0); // end of record
    Ok(bytes)
}

/// Parse one record from the front of `buf`.
///
/// # Example
///
/// ```
/// use mailio::attr::{parse_record, ParseResult};
///
/// let buf = b"status\x003\x00\x00trailing";
/// match parse_record(buf) {
///     ParseResult::Complete { record, consumed } => {
///         assert_eq!(consumed, 10);
///         assert_eq!(record.get("status"), Some("3"));
///     }
///     _ => panic!("Expected complete record"),
/// }
/// ```
pub fn parse_record(buf: &[u8]) -> ParseResult {
    let mut record = Record::new();
    let mut pos = 0;
    loop {
        let name_end = match next_nul(buf, pos) {
            Some(end) => end,
            None => return ParseResult::Incomplete,
        };
        if name_end == pos {
            return ParseResult::Complete {
                record,
                consumed: pos + 1,
            };
        }
        let value_end = match next_nul(buf, name_end + 1) {
            Some(end) => end,
            None => return ParseResult::Incomplete,
        };
        let name = match std::str::from_utf8(&buf[pos..name_end]) {
            Ok(name) => name,
            Err(_) => {
                return ParseResult::Invalid {
                    error: "attribute name is not valid UTF-8".to_string(),
                }
            }
        };
        let value = match std::str::from_utf8(&buf[name_end + 1..value_end]) {
            Ok(value) => value,
            Err(_) => {
                return ParseResult::Invalid {
                    error: format!("value of attribute '{}' is not valid UTF-8", name),
                }
            }
        };
        record.push(name.to_string(), value.to_string());
        pos = value_end + 1;
    }
}

fn next_nul(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == 0)
        .map(|p| from + p)
}

/// Accumulates bytes from successive reads until a record is complete.
#[derive(Debug)]
pub struct RecordReader {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for RecordReader {
    fn default() -> Self {
        Self::new(MAX_RECORD_SIZE)
    }
}

impl RecordReader {
    /// A reader that rejects records longer than `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Read one chunk from `reader` into the buffer. Returns the byte count;
    /// zero means end of file.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Bytes buffered and not yet returned in a record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Return the next complete record, removing its bytes from the buffer.
    pub fn poll(&mut self) -> ParseResult {
        match parse_record(&self.buf) {
            ParseResult::Complete { record, consumed } => {
                self.buf.drain(..consumed);
                ParseResult::Complete { record, consumed }
            }
            ParseResult::Incomplete if self.buf.len() > self.limit => ParseResult::Invalid {
                error: format!("record exceeds {} bytes", self.limit),
            },
            other => other,
        }
    }
}
