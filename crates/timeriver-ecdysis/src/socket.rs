//! Listening sockets that can be stopped gracefully and handed to a successor.
//!
//! A [`GracefulSocket`] moves through `Unbound → Bound → Draining → Closed`.
//! The accept loop that serves the socket holds its own reference
//! ([`BoundSocket`]); stopping the socket cancels that loop and drops the
//! socket's reference, so the descriptor closes once the loop has let go.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SocketError;

/// Transport of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connection-oriented TCP listener.
    Stream,
    /// Connectionless UDP socket.
    Datagram,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Stream => write!(f, "tcp"),
            SocketKind::Datagram => write!(f, "udp"),
        }
    }
}

/// Lifecycle state of a [`GracefulSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No socket bound yet.
    Unbound,
    /// Bound (fresh or inherited) and accepting.
    Bound,
    /// Stopped, but the serving loop still holds the socket.
    Draining,
    /// Stopped and released. Terminal.
    Closed,
}

/// Shared handle to a bound socket, held by the loop that serves it.
#[derive(Debug, Clone)]
pub enum BoundSocket {
    Stream(Arc<TcpListener>),
    Datagram(Arc<UdpSocket>),
}

impl BoundSocket {
    pub fn kind(&self) -> SocketKind {
        match self {
            BoundSocket::Stream(_) => SocketKind::Stream,
            BoundSocket::Datagram(_) => SocketKind::Datagram,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            BoundSocket::Stream(listener) => listener.local_addr(),
            BoundSocket::Datagram(socket) => socket.local_addr(),
        }
    }

    fn downgrade(&self) -> WeakSocket {
        match self {
            BoundSocket::Stream(listener) => WeakSocket::Stream(Arc::downgrade(listener)),
            BoundSocket::Datagram(socket) => WeakSocket::Datagram(Arc::downgrade(socket)),
        }
    }
}

impl AsFd for BoundSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            BoundSocket::Stream(listener) => listener.as_fd(),
            BoundSocket::Datagram(socket) => socket.as_fd(),
        }
    }
}

#[derive(Debug)]
enum WeakSocket {
    Stream(Weak<TcpListener>),
    Datagram(Weak<UdpSocket>),
}

impl WeakSocket {
    fn is_alive(&self) -> bool {
        match self {
            WeakSocket::Stream(listener) => listener.strong_count() > 0,
            WeakSocket::Datagram(socket) => socket.strong_count() > 0,
        }
    }
}

#[derive(Debug)]
enum Inner {
    Unbound,
    Bound(BoundSocket),
    Stopped(WeakSocket),
}

/// A listening socket with a stop signal and descriptor export.
#[derive(Debug)]
pub struct GracefulSocket {
    inner: Inner,
    stop: CancellationToken,
    local_addr: Option<SocketAddr>,
}

impl Default for GracefulSocket {
    fn default() -> Self {
        Self::unbound()
    }
}

impl GracefulSocket {
    /// Create a socket in the `Unbound` state.
    pub fn unbound() -> Self {
        Self {
            inner: Inner::Unbound,
            stop: CancellationToken::new(),
            local_addr: None,
        }
    }

    /// Bind a fresh socket of the given kind on `spec`.
    ///
    /// `spec` is `host:port`; a bare `:port` listens on all interfaces.
    pub async fn bind(&mut self, kind: SocketKind, spec: &str) -> Result<SocketAddr, SocketError> {
        self.ensure_unbound("bind")?;

        let addr = resolve_listen_spec(spec).await?;
        let bind_err = |source| SocketError::Bind {
            kind,
            spec: spec.to_string(),
            source,
        };

        let socket = match kind {
            SocketKind::Stream => {
                BoundSocket::Stream(Arc::new(TcpListener::bind(addr).await.map_err(bind_err)?))
            }
            SocketKind::Datagram => {
                BoundSocket::Datagram(Arc::new(UdpSocket::bind(addr).await.map_err(bind_err)?))
            }
        };

        let local = socket.local_addr()?;
        info!(%kind, addr = %local, "Bound fresh socket");
        self.set_bound(socket, local);
        Ok(local)
    }

    /// Adopt an inherited descriptor as this socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn adopt(&mut self, kind: SocketKind, fd: OwnedFd) -> Result<SocketAddr, SocketError> {
        self.ensure_unbound("adopt")?;

        let raw = fd.as_raw_fd();
        if socket_type(raw) != Some(expected_type(kind)) {
            return Err(SocketError::WrongSocketType {
                fd: raw,
                expected: kind,
            });
        }

        let socket = match kind {
            SocketKind::Stream => {
                let std_listener = std::net::TcpListener::from(fd);
                std_listener.set_nonblocking(true)?;
                BoundSocket::Stream(Arc::new(TcpListener::from_std(std_listener)?))
            }
            SocketKind::Datagram => {
                let std_socket = std::net::UdpSocket::from(fd);
                std_socket.set_nonblocking(true)?;
                BoundSocket::Datagram(Arc::new(UdpSocket::from_std(std_socket)?))
            }
        };

        let local = socket.local_addr()?;
        info!(fd = raw, %kind, addr = %local, "Adopted inherited socket");
        self.set_bound(socket, local);
        Ok(local)
    }

    pub fn state(&self) -> SocketState {
        match &self.inner {
            Inner::Unbound => SocketState::Unbound,
            Inner::Bound(_) => SocketState::Bound,
            Inner::Stopped(weak) if weak.is_alive() => SocketState::Draining,
            Inner::Stopped(_) => SocketState::Closed,
        }
    }

    /// Address the socket was bound to, kept after stop for reporting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Handle for the serving loop, if the socket is bound.
    pub fn listener(&self) -> Option<BoundSocket> {
        match &self.inner {
            Inner::Bound(socket) => Some(socket.clone()),
            _ => None,
        }
    }

    /// Token cancelled when the socket is stopped.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Duplicate the backing descriptor for handoff.
    ///
    /// Returns `None` when the socket is not bound. The socket stays open; the
    /// duplicate carries `FD_CLOEXEC`.
    pub fn export_file(&self) -> Result<Option<OwnedFd>, SocketError> {
        match &self.inner {
            Inner::Bound(socket) => Ok(Some(socket.as_fd().try_clone_to_owned()?)),
            _ => Ok(None),
        }
    }

    /// Stop accepting and release this socket's reference.
    ///
    /// In-flight connections are not touched. Idempotent.
    pub fn stop(&mut self) {
        if let Inner::Bound(socket) = &self.inner {
            let weak = socket.downgrade();
            self.stop.cancel();
            self.inner = Inner::Stopped(weak);
            debug!(addr = ?self.local_addr, "Socket stopped accepting");
        }
    }

    fn ensure_unbound(&self, operation: &'static str) -> Result<(), SocketError> {
        match self.state() {
            SocketState::Unbound => Ok(()),
            state => Err(SocketError::InvalidState { operation, state }),
        }
    }

    fn set_bound(&mut self, socket: BoundSocket, local: SocketAddr) {
        self.inner = Inner::Bound(socket);
        self.local_addr = Some(local);
    }
}

async fn resolve_listen_spec(spec: &str) -> Result<SocketAddr, SocketError> {
    let normalized = if spec.starts_with(':') {
        format!("0.0.0.0{spec}")
    } else {
        spec.to_string()
    };

    let resolve_err = |source| SocketError::Resolve {
        spec: spec.to_string(),
        source,
    };

    let mut addrs = tokio::net::lookup_host(normalized.as_str())
        .await
        .map_err(resolve_err)?;
    addrs.next().ok_or_else(|| {
        resolve_err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no addresses resolved",
        ))
    })
}

fn expected_type(kind: SocketKind) -> libc::c_int {
    match kind {
        SocketKind::Stream => libc::SOCK_STREAM,
        SocketKind::Datagram => libc::SOCK_DGRAM,
    }
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn socket_type(fd: RawFd) -> Option<libc::c_int> {
    let mut ty: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut ty as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    (result == 0).then_some(ty)
}
