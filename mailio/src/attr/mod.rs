//! Attribute record codec for mail service requests.
//!
//! A record is an ordered list of named values. On the wire each attribute is
//! written as the name and the value, each followed by a NUL byte, and the
//! record ends with one extra NUL:
//!
//! ```text
//! nrequest\0 1\0 flags\0 0\0 queue_name\0 active\0 ... \0
//! ```
//!
//! The receiving service reads fields by name in a fixed order, so writers
//! must keep the order and types of their fields stable.
//!
//! Like the rest of the codec layers in this crate, parsing is sans-io: feed
//! bytes in, get [`ParseResult`]s out.

pub mod protocol;
pub mod types;

pub use self::protocol::{encode_record, parse_record, RecordReader, MAX_RECORD_SIZE};
pub use self::types::{ParseResult, Record};
