//! Core types for the attribute codec.

use crate::error::*;

/// One attribute record: named values in wire order.
///
/// The wire format carries no type tags, so values are kept as text and
/// numbers are rendered as unsigned decimal when they are added.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    attrs: Vec<(String, String)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a numeric attribute.
    pub fn num(mut self, name: &str, value: u32) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    /// Append a string attribute.
    pub fn str(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub(crate) fn push(&mut self, name: String, value: String) {
        self.attrs.push((name, value));
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Attributes in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First value named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::Protocol(format!("missing attribute '{}'", name)))
    }

    pub fn get_num(&self, name: &str) -> Result<u32> {
        let value = self.get_str(name)?;
        parse_num(name, value)
    }

    /// Strict scan for a record that must hold exactly one numeric
    /// attribute called `name`. Missing, extra or non-numeric attributes are
    /// errors.
    pub fn scan_num(&self, name: &str) -> Result<u32> {
        match self.attrs.as_slice() {
            [(n, v)] if n == name => parse_num(name, v),
            [] => Err(Error::Protocol(format!("missing attribute '{}'", name))),
            [(n, _)] => Err(Error::Protocol(format!(
                "unexpected attribute '{}', expected '{}'",
                n, name
            ))),
            _ => Err(Error::Protocol(format!(
                "expected only '{}', got {} attributes",
                name,
                self.attrs.len()
            ))),
        }
    }
}

fn parse_num(name: &str, value: &str) -> Result<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Protocol(format!(
            "attribute '{}': bad numerical value '{}'",
            name, value
        )));
    }
    value.parse::<u32>().map_err(|_| {
        Error::Protocol(format!(
            "attribute '{}': numerical value out of range '{}'",
            name, value
        ))
    })
}

/// Result of parsing an attribute record from a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A complete record was parsed
    Complete {
        record: Record,
        /// Bytes consumed, including the end marker
        consumed: usize,
    },
    /// The end marker has not arrived yet
    Incomplete,
    /// The buffer cannot hold a valid record
    Invalid { error: String },
}
