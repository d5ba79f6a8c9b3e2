//! Text protocol result sets
//!
//! A COM_QUERY result set arrives as: column count, one definition per column,
//! EOF, zero or more rows, EOF (or ERR if the query fails mid-stream).

use bytes::Buf;
use thiserror::Error;

/// Column type codes that carry numbers in the text protocol
#[allow(dead_code)]
pub mod column_type {
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const LONGLONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const YEAR: u8 = 0x0d;
    pub const NEWDECIMAL: u8 = 0xf6;
    pub const VAR_STRING: u8 = 0xfd;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unexpected end of packet")]
    Truncated,
    #[error("Invalid length encoding: 0x{0:02x}")]
    InvalidLength(u8),
    #[error("Row has {found} values, expected {expected}")]
    ColumnMismatch { expected: usize, found: usize },
}

/// Read a length-encoded integer, advancing the buffer
///
/// Returns Ok(None) for the 0xFB NULL marker.
pub fn read_lenenc_int(buf: &mut &[u8]) -> Result<Option<u64>, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::Truncated);
    }
    let first = buf.get_u8();
    let width = match first {
        0..=0xFA => return Ok(Some(first as u64)),
        0xFB => return Ok(None),
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        other => return Err(DecodeError::InvalidLength(other)),
    };
    if buf.remaining() < width {
        return Err(DecodeError::Truncated);
    }
    let value = (0..width).fold(0u64, |acc, i| acc | (buf[i] as u64) << (8 * i));
    buf.advance(width);
    Ok(Some(value))
}

/// Read a length-encoded string, advancing the buffer
pub fn read_lenenc_bytes<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, DecodeError> {
    let len = match read_lenenc_int(buf)? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    if buf.len() < len {
        return Err(DecodeError::Truncated);
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok(Some(value))
}

fn read_lenenc_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    Ok(read_lenenc_bytes(buf)?
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default())
}

/// Parse the first packet of a result set
pub fn parse_column_count(payload: &[u8]) -> Result<usize, DecodeError> {
    let mut buf = payload;
    match read_lenenc_int(&mut buf)? {
        Some(n) if n > 0 => Ok(n as usize),
        _ => Err(DecodeError::InvalidLength(payload.first().copied().unwrap_or(0))),
    }
}

/// Protocol::ColumnDefinition41, reduced to what row decoding needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: u8,
}

impl ColumnDefinition {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = payload;
        // catalog, schema, table, org_table
        for _ in 0..4 {
            read_lenenc_bytes(&mut buf)?;
        }
        let name = read_lenenc_string(&mut buf)?;
        // org_name
        read_lenenc_bytes(&mut buf)?;
        // length of fixed fields (always 0x0c), charset(2), column_length(4), then type
        read_lenenc_int(&mut buf)?;
        if buf.remaining() < 2 + 4 + 1 {
            return Err(DecodeError::Truncated);
        }
        buf.advance(6);
        let column_type = buf.get_u8();
        Ok(Self { name, column_type })
    }

    pub fn is_integer(&self) -> bool {
        use column_type::*;
        matches!(
            self.column_type,
            TINY | SHORT | LONG | LONGLONG | INT24 | YEAR
        )
    }

    /// Binary floating point; DECIMAL stays textual to keep its precision
    pub fn is_float(&self) -> bool {
        use column_type::*;
        matches!(self.column_type, FLOAT | DOUBLE)
    }
}

/// One text-protocol row; `None` is SQL NULL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRow {
    pub values: Vec<Option<String>>,
}

impl TextRow {
    pub fn parse(payload: &[u8], column_count: usize) -> Result<Self, DecodeError> {
        let mut buf = payload;
        let mut values = Vec::with_capacity(column_count);
        while !buf.is_empty() {
            let value = read_lenenc_bytes(&mut buf)?;
            values.push(value.map(|b| String::from_utf8_lossy(b).into_owned()));
        }
        if values.len() != column_count {
            return Err(DecodeError::ColumnMismatch {
                expected: column_count,
                found: values.len(),
            });
        }
        Ok(Self { values })
    }
}
