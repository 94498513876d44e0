//! RESP wire protocol decoding.
//!
//! Requests on the wire are arrays of bulk strings (one per command token);
//! replies may be any RESP type. The parser here is pure: it borrows a byte
//! slice and reports how many bytes one complete value consumed, so callers
//! can decode reassembled messages without retaining parser state.

use memchr::memchr;

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Extract the command tokens of a request.
    ///
    /// Returns `None` unless the value is a non-nil array whose elements are
    /// all non-nil bulk strings. Tokens are decoded lossily; Redis command
    /// names and key arguments are ASCII in practice.
    pub fn command_tokens(&self) -> Option<Vec<String>> {
        match self {
            RespValue::Array(Some(items)) => items
                .iter()
                .map(|item| match item {
                    RespValue::BulkString(Some(data)) => {
                        Some(String::from_utf8_lossy(data).into_owned())
                    }
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

/// Decode failure. `Incomplete` covers truncation; the other variants cover
/// byte sequences that can never become valid RESP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Incomplete,
    InvalidType(u8),
    InvalidLength,
    InvalidInteger,
}

impl std::fmt::Display for RespError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RespError::Incomplete => write!(f, "truncated RESP value"),
            RespError::InvalidType(byte) => write!(f, "invalid RESP type byte 0x{:02x}", byte),
            RespError::InvalidLength => write!(f, "invalid RESP length prefix"),
            RespError::InvalidInteger => write!(f, "invalid RESP integer"),
        }
    }
}

impl std::error::Error for RespError {}

pub struct RespParser;

impl RespParser {
    /// Parse one RESP value from the front of `input`.
    ///
    /// Returns the value and the number of bytes it consumed. Never panics on
    /// malformed input.
    pub fn parse(input: &[u8]) -> Result<(RespValue, usize), RespError> {
        let (value, rest) = parse_value(input)?;
        Ok((value, input.len() - rest.len()))
    }
}

fn parse_value(input: &[u8]) -> Result<(RespValue, &[u8]), RespError> {
    let (&type_byte, rest) = input.split_first().ok_or(RespError::Incomplete)?;
    match type_byte {
        b'+' => {
            let (line, rest) = read_line(rest)?;
            Ok((
                RespValue::SimpleString(String::from_utf8_lossy(line).into_owned()),
                rest,
            ))
        }
        b'-' => {
            let (line, rest) = read_line(rest)?;
            Ok((
                RespValue::Error(String::from_utf8_lossy(line).into_owned()),
                rest,
            ))
        }
        b':' => {
            let (line, rest) = read_line(rest)?;
            let n = parse_i64(line).ok_or(RespError::InvalidInteger)?;
            Ok((RespValue::Integer(n), rest))
        }
        b'$' => {
            let (line, rest) = read_line(rest)?;
            match parse_length(line)? {
                None => Ok((RespValue::BulkString(None), rest)),
                Some(len) => {
                    if rest.len() < len + 2 {
                        return Err(RespError::Incomplete);
                    }
                    if &rest[len..len + 2] != b"\r\n" {
                        return Err(RespError::InvalidLength);
                    }
                    Ok((
                        RespValue::BulkString(Some(rest[..len].to_vec())),
                        &rest[len + 2..],
                    ))
                }
            }
        }
        b'*' => {
            let (line, rest) = read_line(rest)?;
            match parse_length(line)? {
                None => Ok((RespValue::Array(None), rest)),
                Some(count) => {
                    let mut items = Vec::with_capacity(count.min(64));
                    let mut rest = rest;
                    for _ in 0..count {
                        let (item, next) = parse_value(rest)?;
                        items.push(item);
                        rest = next;
                    }
                    Ok((RespValue::Array(Some(items)), rest))
                }
            }
        }
        other => Err(RespError::InvalidType(other)),
    }
}

/// Read up to the next CRLF, returning the line body and the remainder.
fn read_line(input: &[u8]) -> Result<(&[u8], &[u8]), RespError> {
    let cr = memchr(b'\r', input).ok_or(RespError::Incomplete)?;
    if cr + 1 >= input.len() {
        return Err(RespError::Incomplete);
    }
    if input[cr + 1] != b'\n' {
        return Err(RespError::InvalidLength);
    }
    Ok((&input[..cr], &input[cr + 2..]))
}

fn parse_i64(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

/// Length prefix for bulk strings and arrays. `-1` encodes nil.
fn parse_length(line: &[u8]) -> Result<Option<usize>, RespError> {
    let n = parse_i64(line).ok_or(RespError::InvalidLength)?;
    if n == -1 {
        Ok(None)
    } else if n < 0 {
        Err(RespError::InvalidLength)
    } else {
        Ok(Some(n as usize))
    }
}
