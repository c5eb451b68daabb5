//! Error types for the ingest layer.

use std::num::{ParseFloatError, ParseIntError};
use std::time::Duration;

use thiserror::Error;
use timeriver_ecdysis::SocketError;

/// Errors from decoding a line, datagram or pickle batch.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A text line did not split into `<name> <value> <timestamp>`.
    #[error("expected 3 fields, found {found}")]
    FieldCount { found: usize },

    /// The value field is not a float.
    #[error("invalid value {token:?}: {source}")]
    Value {
        token: String,
        #[source]
        source: ParseFloatError,
    },

    /// The timestamp field is not an integer.
    #[error("invalid timestamp {token:?}: {source}")]
    Timestamp {
        token: String,
        #[source]
        source: ParseIntError,
    },

    /// The timestamp cannot be represented as a date.
    #[error("timestamp {0} out of range")]
    TimestampRange(i64),

    /// A text line is longer than the scanner allows.
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    /// A text line is not valid UTF-8.
    #[error("line is not valid UTF-8")]
    Utf8,

    /// The pickle stream itself is malformed.
    #[error("pickle: {0}")]
    Pickle(#[from] serde_pickle::Error),

    /// A pickled element has the wrong type.
    #[error("{what}: expected {expected}, found {found}")]
    WrongType {
        what: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// A pickled record or data point pair does not have two elements.
    #[error("{what} wrong length: {len}")]
    WrongLength { what: &'static str, len: usize },

    /// The pickle payload grew past the configured limit.
    #[error("pickle payload exceeds {max} bytes")]
    PayloadTooLarge { max: usize },
}

impl DecodeError {
    pub(crate) fn wrong_type(
        what: &'static str,
        expected: &'static str,
        found: &'static str,
    ) -> Self {
        Self::WrongType {
            what,
            expected,
            found,
        }
    }
}

/// Ingest layer errors.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A service could not bind or adopt its socket.
    #[error("Error starting {protocol} service: {source}")]
    Start {
        protocol: &'static str,
        #[source]
        source: SocketError,
    },

    /// Inherited descriptors could not be adopted or sockets exported.
    #[error("Socket handoff error: {0}")]
    Handoff(#[from] SocketError),

    /// IO error on a connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding a connection's payload failed.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The peer sent nothing within the idle deadline.
    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),
}

impl IngestError {
    pub(crate) fn start(protocol: &'static str, source: SocketError) -> Self {
        Self::Start { protocol, source }
    }
}
