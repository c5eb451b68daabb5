//! Restart manifest: which protocol owns which inherited descriptor.
//!
//! The successor receives its listening sockets as consecutive descriptors
//! starting at [`LISTEN_FDS_START`], together with a comma-separated list of
//! protocol keys in `TIMERIVER_GRACEFUL_PROTOS`. Position N in the list names
//! the protocol bound to fd `LISTEN_FDS_START + N`.

use std::fmt;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use tracing::info;

use crate::error::SocketError;
use crate::socket::validate_fd;

/// First inherited descriptor (after stdin, stdout, stderr).
pub const LISTEN_FDS_START: RawFd = 3;

/// Environment variable carrying the manifest to the successor.
pub const GRACEFUL_PROTOS_ENV: &str = "TIMERIVER_GRACEFUL_PROTOS";

/// Ordered list of protocol keys, one per inherited descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    protocols: Vec<String>,
}

impl Manifest {
    /// Parse a comma-separated manifest. An empty string is a cold start.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }
        Self {
            protocols: raw.split(',').map(|p| p.trim().to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Take ownership of the inherited descriptors named by this manifest.
    ///
    /// Entry N is adopted from fd `base + N`. Fails if any descriptor is not
    /// an open socket; a half-inherited set means the parent handed us the
    /// wrong descriptors.
    ///
    /// Each descriptor must be adopted once per process: the returned
    /// [`OwnedFd`]s close their descriptors on drop.
    pub fn adopt(self, base: RawFd) -> Result<Vec<(String, OwnedFd)>, SocketError> {
        let mut adopted = Vec::with_capacity(self.protocols.len());

        for (n, protocol) in self.protocols.into_iter().enumerate() {
            let fd = base + n as RawFd;

            if !validate_fd(fd) {
                return Err(SocketError::NotASocket { fd, protocol });
            }

            // SAFETY: fd was validated as an open socket via fstat, and the
            // manifest hands each position to exactly one protocol.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            info!(fd, protocol = %protocol, "Inherited socket from parent process");
            adopted.push((protocol, owned));
        }

        Ok(adopted)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocols.join(","))
    }
}

impl FromIterator<String> for Manifest {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            protocols: iter.into_iter().collect(),
        }
    }
}

/// Exported sockets paired with their protocol keys, in descriptor order.
#[derive(Debug, Default)]
pub struct Handoff {
    entries: Vec<(String, OwnedFd)>,
}

impl Handoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, protocol: impl Into<String>, fd: OwnedFd) {
        self.entries.push((protocol.into(), fd));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The manifest matching this handoff's descriptor order.
    pub fn manifest(&self) -> Manifest {
        self.entries.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn entries(&self) -> &[(String, OwnedFd)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(String, OwnedFd)> {
        self.entries
    }
}

impl From<Vec<(String, OwnedFd)>> for Handoff {
    fn from(entries: Vec<(String, OwnedFd)>) -> Self {
        Self { entries }
    }
}
