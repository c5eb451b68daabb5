//! Wire-format decoders.
//!
//! Both formats reduce to the same contract: bytes in, a finite sequence of
//! `Result<DataPoint, DecodeError>` out.
//!
//! - [`text`]: Graphite plaintext, `<name> <value> <timestamp>` per line.
//!   A bad line is reported and decoding continues with the next one.
//! - [`pickle`]: Graphite pickle, one pickled list of
//!   `(name, (timestamp, value))` records. The first bad record ends the batch.

pub mod pickle;
pub mod text;

pub use pickle::{decode_pickle, decode_value, Frame, PickleFramer, PickleRecords};
pub use text::{decode_datagram, parse_line, LineCodec};
