//! Graphite plaintext protocol.
//!
//! ```text
//! <metric.name> <value> <unix-seconds>\n
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::DecodeError;
use crate::types::DataPoint;

/// Parse one line into a data point.
///
/// The line must hold exactly three whitespace-separated fields: a name, a
/// float value and an integer timestamp in Unix seconds.
pub fn parse_line(line: &str) -> Result<DataPoint, DecodeError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let &[name, value, timestamp] = fields.as_slice() else {
        return Err(DecodeError::FieldCount {
            found: fields.len(),
        });
    };

    let value: f64 = value.parse().map_err(|source| DecodeError::Value {
        token: value.to_string(),
        source,
    })?;
    let timestamp: i64 = timestamp.parse().map_err(|source| DecodeError::Timestamp {
        token: timestamp.to_string(),
        source,
    })?;

    DataPoint::from_unix(name, timestamp, value)
}

/// Decode every line of one datagram. Blank lines are ignored.
pub fn decode_datagram(
    payload: &[u8],
) -> impl Iterator<Item = Result<DataPoint, DecodeError>> + '_ {
    payload
        .split(|b| *b == b'\n')
        .map(strip_carriage_return)
        .filter(|line| !is_blank(line))
        .map(|line| {
            let line = std::str::from_utf8(line).map_err(|_| DecodeError::Utf8)?;
            parse_line(line)
        })
}

/// Splits a byte stream into lines of at most `max_length` bytes.
///
/// Unlike a plain lines codec, an oversized or non-UTF-8 line is yielded as a
/// `DecodeError` item instead of failing the stream, so the connection keeps
/// going with the next line. Blank lines are skipped.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already searched for a newline.
    next_index: usize,
    /// Inside an oversized line, dropping bytes up to the next newline.
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn too_long(&self) -> DecodeError {
        DecodeError::LineTooLong {
            max: self.max_length,
        }
    }
}

impl Decoder for LineCodec {
    type Item = Result<String, DecodeError>;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Err(self.too_long())));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    let line = strip_carriage_return(&line[..end]);
                    if is_blank(line) {
                        continue;
                    }
                    return Ok(Some(to_string(line)));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(Err(self.too_long())));
        }

        let line = buf.split_to(buf.len());
        let line = strip_carriage_return(&line);
        if is_blank(line) {
            return Ok(None);
        }
        Ok(Some(to_string(line)))
    }
}

fn to_string(line: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| DecodeError::Utf8)
}

fn strip_carriage_return(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, input: &[u8]) -> Vec<Result<String, DecodeError>> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        while let Some(item) = codec.decode_eof(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_parse_valid_line() {
        let point = parse_line("server.cpu.load 0.5 1700000000").unwrap();
        assert_eq!(point.name(), "server.cpu.load");
        assert_eq!(point.value(), 0.5);
        assert_eq!(point.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_tolerates_extra_whitespace() {
        let point = parse_line("  a.b\t-12.25   42 ").unwrap();
        assert_eq!(point.name(), "a.b");
        assert_eq!(point.value(), -12.25);
        assert_eq!(point.unix_timestamp(), 42);
    }

    #[test]
    fn test_parse_integer_value() {
        let point = parse_line("requests 7 1700000000").unwrap();
        assert_eq!(point.value(), 7.0);
    }

    #[test]
    fn test_parse_wrong_field_count() {
        assert!(matches!(
            parse_line("only.name 1.0"),
            Err(DecodeError::FieldCount { found: 2 })
        ));
        assert!(matches!(
            parse_line("a 1 2 extra"),
            Err(DecodeError::FieldCount { found: 4 })
        ));
    }

    #[test]
    fn test_parse_non_numeric_fields() {
        assert!(matches!(
            parse_line("a notanumber 1700000000"),
            Err(DecodeError::Value { .. })
        ));
        assert!(matches!(
            parse_line("a 1.0 yesterday"),
            Err(DecodeError::Timestamp { .. })
        ));
        assert!(matches!(
            parse_line("a 1.0 1700000000.5"),
            Err(DecodeError::Timestamp { .. })
        ));
    }

    #[test]
    fn test_datagram_skips_bad_lines() {
        let payload = b"a 1 100\nbroken line\nb 2 200\r\n\n";
        let results: Vec<_> = decode_datagram(payload).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().name(), "a");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().name(), "b");
    }

    #[test]
    fn test_datagram_without_trailing_newline() {
        let results: Vec<_> = decode_datagram(b"a 1 100").collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_codec_splits_lines_and_strips_cr() {
        let mut codec = LineCodec::new(64);
        let items = decode_all(&mut codec, b"a 1 1\r\n\nb 2 2\nc 3 3");
        let lines: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(lines, ["a 1 1", "b 2 2", "c 3 3"]);
    }

    #[test]
    fn test_codec_partial_line_waits_for_more() {
        let mut codec = LineCodec::new(64);
        let mut buf = BytesMut::from(&b"a 1 "[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"1\n");
        let line = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(line, "a 1 1");
    }

    #[test]
    fn test_codec_skips_oversized_line_and_continues() {
        let mut codec = LineCodec::new(16);
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\nok 1 1\n");

        let items = decode_all(&mut codec, &input);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(DecodeError::LineTooLong { max: 16 })));
        assert_eq!(items[1].as_ref().unwrap(), "ok 1 1");
    }

    #[test]
    fn test_codec_oversized_line_across_reads() {
        let mut codec = LineCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"abcdef\nz 1 1\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(DecodeError::LineTooLong { .. })));
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second, "z 1 1");
    }

    #[test]
    fn test_codec_accepts_line_at_limit() {
        let mut codec = LineCodec::new(64 * 1024);
        let name = "m".repeat(64 * 1024 - 4);
        let input = format!("{name} 1 1\n");
        assert_eq!(input.len() - 1, 64 * 1024);

        let items = decode_all(&mut codec, input.as_bytes());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().len(), 64 * 1024);
    }

    #[test]
    fn test_codec_invalid_utf8_is_item_error() {
        let mut codec = LineCodec::new(64);
        let items = decode_all(&mut codec, b"\xff\xfe 1 1\ngood 1 1\n");
        assert!(matches!(items[0], Err(DecodeError::Utf8)));
        assert_eq!(items[1].as_ref().unwrap(), "good 1 1");
    }
}
