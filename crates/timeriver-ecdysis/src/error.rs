//! Error types for socket binding and handoff.

use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::socket::{SocketKind, SocketState};

/// Errors raised while binding, adopting, or exporting a listening socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The listen spec could not be resolved to a socket address.
    #[error("invalid listen spec {spec:?}: {source}")]
    Resolve {
        spec: String,
        #[source]
        source: std::io::Error,
    },

    /// Binding a fresh socket failed.
    #[error("failed to bind {kind} socket on {spec}: {source}")]
    Bind {
        kind: SocketKind,
        spec: String,
        #[source]
        source: std::io::Error,
    },

    /// An inherited descriptor is closed or is not a socket.
    #[error("inherited fd {fd} ({protocol}) is not a valid socket")]
    NotASocket { fd: RawFd, protocol: String },

    /// An inherited descriptor is a socket of the wrong type.
    #[error("inherited fd {fd} is not a {expected} socket")]
    WrongSocketType { fd: RawFd, expected: SocketKind },

    /// The requested operation is not allowed in the socket's current state.
    #[error("cannot {operation} a socket in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SocketState,
    },

    /// IO error (fcntl, dup, conversion to a tokio socket)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
