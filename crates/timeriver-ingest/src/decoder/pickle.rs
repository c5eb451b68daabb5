//! Graphite pickle protocol.
//!
//! A connection carries one pickled sequence of records:
//!
//! ```text
//! [(name, (timestamp, value)), ...]
//! ```
//!
//! Lists and tuples are interchangeable at every level. Python 2 clients pickle
//! metric names as byte strings; those are decoded as UTF-8.

use serde_pickle::{DeOptions, Value};

use crate::error::DecodeError;
use crate::types::DataPoint;

/// Deserialization options shared by every pickle read.
pub(crate) fn de_options() -> DeOptions {
    DeOptions::new().decode_strings()
}

/// Decode a complete pickle payload into its records.
pub fn decode_pickle(payload: &[u8]) -> Result<PickleRecords, DecodeError> {
    let value = serde_pickle::value_from_slice(payload, de_options())?;
    decode_value(value)
}

/// Interpret an already unpickled value as a batch of records.
///
/// Fails only if the top level is not a sequence; per-record errors are
/// yielded by the returned iterator.
pub fn decode_value(value: Value) -> Result<PickleRecords, DecodeError> {
    let items = into_sequence(value, "batch")?;
    Ok(PickleRecords {
        items: items.into_iter(),
        failed: false,
    })
}

/// Lazily decoded records of one batch.
///
/// Yields every well-formed record in order. The first malformed record is
/// yielded as an error and ends the iteration.
#[derive(Debug)]
pub struct PickleRecords {
    items: std::vec::IntoIter<Value>,
    failed: bool,
}

impl PickleRecords {
    /// Records not yet decoded.
    pub fn remaining(&self) -> usize {
        if self.failed {
            0
        } else {
            self.items.len()
        }
    }
}

impl Iterator for PickleRecords {
    type Item = Result<DataPoint, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let record = decode_record(self.items.next()?);
        self.failed = record.is_err();
        Some(record)
    }
}

fn decode_record(item: Value) -> Result<DataPoint, DecodeError> {
    let [name, datapoint] = into_pair(item, "record")?;
    let name = match name {
        Value::String(name) => name,
        other => return Err(DecodeError::wrong_type("name", "string", type_name(&other))),
    };

    let [timestamp, value] = into_pair(datapoint, "datapoint")?;
    let timestamp = match timestamp {
        Value::I64(timestamp) => timestamp,
        other => return Err(DecodeError::wrong_type("timestamp", "int", type_name(&other))),
    };
    let value = match value {
        Value::F64(value) => value,
        // Integer samples are widened.
        Value::I64(value) => value as f64,
        other => return Err(DecodeError::wrong_type("value", "float", type_name(&other))),
    };

    DataPoint::from_unix(name, timestamp, value)
}

fn into_sequence(value: Value, what: &'static str) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::List(items) | Value::Tuple(items) => Ok(items),
        other => Err(DecodeError::wrong_type(what, "list or tuple", type_name(&other))),
    }
}

fn into_pair(value: Value, what: &'static str) -> Result<[Value; 2], DecodeError> {
    let items = into_sequence(value, what)?;
    <[Value; 2]>::try_from(items).map_err(|items| DecodeError::WrongLength {
        what,
        len: items.len(),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::None => "None",
        Value::Bool(_) => "bool",
        Value::I64(_) | Value::Int(_) => "int",
        Value::F64(_) => "float",
        Value::Bytes(_) => "bytes",
        Value::String(_) => "str",
        Value::List(_) => "list",
        Value::Tuple(_) => "tuple",
        Value::Set(_) | Value::FrozenSet(_) => "set",
        Value::Dict(_) => "dict",
    }
}

/// Where the pickle in a growing buffer ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// More bytes are needed.
    Incomplete,
    /// The STOP opcode ends the pickle at this length.
    Complete(usize),
    /// Not a pickle opcode stream; the parser reports why.
    Invalid,
}

/// How an opcode's argument is laid out after the opcode byte.
enum Arg {
    Fixed(usize),
    /// Little-endian length prefix of this many bytes, then that many bytes.
    Counted(usize),
    /// Signed 4-byte length prefix (`BINSTRING`).
    SignedCounted,
    /// Newline-terminated lines.
    Lines(u8),
}

fn opcode_arg(op: u8) -> Option<Arg> {
    use Arg::*;
    let arg = match op {
        // No argument.
        b'(' | b'.' | b'0' | b'1' | b'2' | b'N' | b'Q' | b'R' | b'a' | b'b' | b'd' | b'}'
        | b'e' | b'l' | b']' | b'o' | b's' | b't' | b')' | b'u' => Fixed(0),
        0x81 | 0x85..=0x89 | 0x8f..=0x94 | 0x97 | 0x98 => Fixed(0),
        b'K' | b'h' | b'q' | 0x80 | 0x82 => Fixed(1),
        b'M' | 0x83 => Fixed(2),
        b'J' | b'j' | b'r' | 0x84 => Fixed(4),
        b'G' | 0x95 => Fixed(8),
        b'U' | b'C' | 0x8a | 0x8c => Counted(1),
        b'X' | b'B' | 0x8b => Counted(4),
        0x8d | 0x8e | 0x96 => Counted(8),
        b'T' => SignedCounted,
        b'F' | b'I' | b'L' | b'P' | b'S' | b'V' | b'g' | b'p' => Lines(1),
        b'c' | b'i' => Lines(2),
        _ => return None,
    };
    Some(arg)
}

/// Finds the end of one pickle in a buffer that only ever grows.
///
/// Each call resumes where the previous one stopped, so every byte is looked
/// at a bounded number of times no matter how the stream is chunked. Argument
/// bytes are skipped, so a `.` inside a metric name is never taken for STOP.
#[derive(Debug, Default)]
pub struct PickleFramer {
    /// Offset of the next opcode.
    pos: usize,
    /// Newlines already found for the current line-argument opcode.
    lines_seen: u8,
    /// Where the newline search resumes.
    line_from: usize,
}

impl PickleFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `buf`, which must extend every buffer passed before.
    pub fn scan(&mut self, buf: &[u8]) -> Frame {
        while let Some(&op) = buf.get(self.pos) {
            let Some(arg) = opcode_arg(op) else {
                return Frame::Invalid;
            };
            let body = self.pos + 1;

            let end = match arg {
                Arg::Fixed(n) => body + n,
                Arg::Counted(width) => {
                    let Some(prefix) = buf.get(body..body + width) else {
                        return Frame::Incomplete;
                    };
                    let mut le = [0u8; 8];
                    le[..width].copy_from_slice(prefix);
                    match usize::try_from(u64::from_le_bytes(le))
                        .ok()
                        .and_then(|len| (body + width).checked_add(len))
                    {
                        Some(end) => end,
                        None => return Frame::Invalid,
                    }
                }
                Arg::SignedCounted => {
                    let Some(prefix) = buf.get(body..body + 4) else {
                        return Frame::Incomplete;
                    };
                    let mut le = [0u8; 4];
                    le.copy_from_slice(prefix);
                    match usize::try_from(i32::from_le_bytes(le)) {
                        Ok(len) => body + 4 + len,
                        Err(_) => return Frame::Invalid,
                    }
                }
                Arg::Lines(count) => {
                    let mut from = self.line_from.max(body);
                    loop {
                        let Some(offset) = buf[from..].iter().position(|&b| b == b'\n') else {
                            self.line_from = buf.len();
                            return Frame::Incomplete;
                        };
                        from += offset + 1;
                        self.lines_seen += 1;
                        self.line_from = from;
                        if self.lines_seen == count {
                            break from;
                        }
                    }
                }
            };

            if end > buf.len() {
                return Frame::Incomplete;
            }
            if op == b'.' {
                return Frame::Complete(end);
            }
            self.pos = end;
            self.lines_seen = 0;
            self.line_from = 0;
        }
        Frame::Incomplete
    }
}
