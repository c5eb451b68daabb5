//! Protocol services.
//!
//! A [`Service`] ties one [`Protocol`] to one [`GracefulSocket`] and the task
//! that serves it. Services are created once by the manager and only ever
//! started and stopped.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use timeriver_ecdysis::{BoundSocket, DrainTracker, GracefulSocket, SocketKind, SocketState};

use crate::accept::{run_accept_loop, AcceptLoopExit};
use crate::config::{HandlerSettings, ListenConfig};
use crate::error::IngestError;
use crate::handler::{handle_pickle_stream, handle_text_stream, serve_datagrams};
use crate::http;
use crate::types::SharedSink;

/// The closed set of listener protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Graphite plaintext over TCP (`gt`).
    GraphiteText,
    /// Graphite plaintext over UDP (`gu`).
    GraphiteUdp,
    /// Graphite pickle over TCP (`gp`).
    GraphitePickle,
    /// HTTP health and server info (`www`).
    Http,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::GraphiteText,
        Protocol::GraphiteUdp,
        Protocol::GraphitePickle,
        Protocol::Http,
    ];

    /// Key used in the restart manifest.
    pub fn key(self) -> &'static str {
        match self {
            Protocol::GraphiteText => "gt",
            Protocol::GraphiteUdp => "gu",
            Protocol::GraphitePickle => "gp",
            Protocol::Http => "www",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|protocol| protocol.key() == key)
    }

    pub fn socket_kind(self) -> SocketKind {
        match self {
            Protocol::GraphiteUdp => SocketKind::Datagram,
            _ => SocketKind::Stream,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::GraphiteText => write!(f, "Graphite text protocol"),
            Protocol::GraphiteUdp => write!(f, "Graphite UDP protocol"),
            Protocol::GraphitePickle => write!(f, "Graphite pickle protocol"),
            Protocol::Http => write!(f, "HTTP server"),
        }
    }
}

/// State shared by every service of one manager.
#[derive(Clone)]
pub(crate) struct ServiceContext {
    pub sink: SharedSink,
    pub settings: HandlerSettings,
    pub drain: DrainTracker,
    pub listen: Arc<ListenConfig>,
}

#[derive(Debug, Clone, Copy)]
enum StreamFormat {
    Text,
    Pickle,
}

/// One protocol listener.
#[derive(Debug)]
pub struct Service {
    protocol: Protocol,
    listen_spec: String,
    socket: GracefulSocket,
    /// Serving loops not yet awaited, oldest first. A resumed service keeps
    /// the loop of its stopped socket here until it exits.
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    pub fn new(protocol: Protocol, listen_spec: impl Into<String>) -> Self {
        Self {
            protocol,
            listen_spec: listen_spec.into(),
            socket: GracefulSocket::unbound(),
            tasks: Vec::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn listen_spec(&self) -> &str {
        &self.listen_spec
    }

    pub fn state(&self) -> SocketState {
        self.socket.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    /// Bind a fresh socket, or adopt `inherited`, and start serving.
    ///
    /// A blank listen spec disables the service: nothing is bound and an
    /// inherited descriptor is closed.
    pub(crate) async fn start(
        &mut self,
        inherited: Option<OwnedFd>,
        ctx: &ServiceContext,
    ) -> Result<(), IngestError> {
        let key = self.protocol.key();

        if self.listen_spec.is_empty() {
            if inherited.is_some() {
                warn!(protocol = key, "Closing inherited socket, listen spec is blank");
            }
            info!(protocol = key, "Not starting {} because its listen spec is blank", self.protocol);
            return Ok(());
        }

        // A stopped socket never rebinds; resuming after a failed handoff
        // starts over with a new one.
        if matches!(self.state(), SocketState::Draining | SocketState::Closed) {
            self.socket = GracefulSocket::unbound();
        }

        let kind = self.protocol.socket_kind();
        let inheriting = inherited.is_some();
        let addr = match inherited {
            Some(fd) => self.socket.adopt(kind, fd),
            None => self.socket.bind(kind, &self.listen_spec).await,
        }
        .map_err(|source| IngestError::start(key, source))?;

        let Some(socket) = self.socket.listener() else {
            return Err(IngestError::start(
                key,
                timeriver_ecdysis::SocketError::InvalidState {
                    operation: "serve",
                    state: self.state(),
                },
            ));
        };

        info!(
            protocol = key,
            addr = %addr,
            inherited = inheriting,
            "{} listening on {}",
            self.protocol,
            addr
        );

        let stop = self.socket.stop_token();
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(spawn_serving(self.protocol, socket, stop, ctx.clone()));
        Ok(())
    }

    /// Duplicate the socket's descriptor for handoff, if bound.
    pub fn export_file(&self) -> Result<Option<OwnedFd>, IngestError> {
        Ok(self.socket.export_file()?)
    }

    /// Stop accepting. Connections already dispatched keep running. Idempotent.
    pub fn stop(&mut self) {
        if self.socket.state() == SocketState::Bound {
            info!(protocol = self.protocol.key(), "Stopping {}", self.protocol);
        }
        self.socket.stop();
    }

    /// The serving tasks, for awaiting their exit after `stop`.
    pub(crate) fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.tasks)
    }
}

fn spawn_serving(
    protocol: Protocol,
    socket: BoundSocket,
    stop: CancellationToken,
    ctx: ServiceContext,
) -> JoinHandle<()> {
    match socket {
        BoundSocket::Datagram(socket) => tokio::spawn(serve_datagrams(
            socket,
            ctx.sink.clone(),
            stop,
            ctx.settings.backoff,
        )),
        BoundSocket::Stream(listener) => match protocol {
            Protocol::Http => tokio::spawn(http::serve(listener, stop, ctx)),
            Protocol::GraphitePickle => {
                tokio::spawn(accept_streams(protocol, listener, stop, ctx, StreamFormat::Pickle))
            }
            Protocol::GraphiteText | Protocol::GraphiteUdp => {
                tokio::spawn(accept_streams(protocol, listener, stop, ctx, StreamFormat::Text))
            }
        },
    }
}

async fn accept_streams(
    protocol: Protocol,
    listener: Arc<TcpListener>,
    stop: CancellationToken,
    ctx: ServiceContext,
    format: StreamFormat,
) {
    let backoff = ctx.settings.backoff;
    let exit = run_accept_loop(
        protocol,
        listener,
        stop,
        backoff,
        move |(stream, peer): (TcpStream, SocketAddr)| {
            let guard = ctx.drain.connection_guard();
            let ctx = ctx.clone();
            async move {
                let _guard = guard;
                handle_connection(format, stream, &ctx).await;
            }
            .instrument(info_span!(
                "ingest.connection",
                protocol = protocol.key(),
                peer = %peer,
            ))
        },
    )
    .await;

    if let AcceptLoopExit::Failed(error) = exit {
        warn!(protocol = protocol.key(), error = %error, "Listener loop ended");
    }
}

async fn handle_connection(format: StreamFormat, stream: TcpStream, ctx: &ServiceContext) {
    let settings = &ctx.settings;
    let sink = ctx.sink.as_ref();

    let result = match format {
        StreamFormat::Text => {
            handle_text_stream(stream, sink, settings.idle_timeout, settings.max_line_length).await
        }
        StreamFormat::Pickle => {
            handle_pickle_stream(stream, sink, settings.idle_timeout, settings.max_pickle_bytes).await
        }
    };

    match result {
        Ok(summary) => debug!(
            points = summary.points,
            skipped = summary.skipped,
            "Connection closed"
        ),
        Err(error) => warn!(error = %error, "Closing connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_keys_round_trip() {
        for protocol in Protocol::ALL {
            assert_eq!(Protocol::from_key(protocol.key()), Some(protocol));
        }
        assert_eq!(Protocol::from_key("carbon"), None);
        assert_eq!(Protocol::from_key(""), None);
    }

    #[test]
    fn test_socket_kinds() {
        assert_eq!(Protocol::GraphiteUdp.socket_kind(), SocketKind::Datagram);
        assert_eq!(Protocol::GraphiteText.socket_kind(), SocketKind::Stream);
        assert_eq!(Protocol::GraphitePickle.socket_kind(), SocketKind::Stream);
        assert_eq!(Protocol::Http.socket_kind(), SocketKind::Stream);
    }

    #[test]
    fn test_new_service_is_unbound() {
        let service = Service::new(Protocol::GraphiteText, "127.0.0.1:0");
        assert_eq!(service.state(), SocketState::Unbound);
        assert_eq!(service.local_addr(), None);
        assert!(service.export_file().unwrap().is_none());
    }

    #[test]
    fn test_stop_never_started_is_noop() {
        let mut service = Service::new(Protocol::GraphitePickle, "");
        service.stop();
        service.stop();
        assert_eq!(service.state(), SocketState::Unbound);
    }

    fn test_context() -> ServiceContext {
        ServiceContext {
            sink: crate::types::sink_fn(|_| {}),
            settings: HandlerSettings::default(),
            drain: DrainTracker::new(),
            listen: Arc::new(ListenConfig::loopback()),
        }
    }

    #[tokio::test]
    async fn test_resume_keeps_previous_loop_tracked() {
        let ctx = test_context();
        let mut service = Service::new(Protocol::GraphiteText, "127.0.0.1:0");
        service.start(None, &ctx).await.unwrap();
        let addr = service.local_addr().unwrap();

        // Stop and resume on the exported descriptor before the first loop
        // has had a chance to observe the stop.
        let fd = service.export_file().unwrap().unwrap();
        service.stop();
        service.start(Some(fd), &ctx).await.unwrap();
        assert_eq!(service.local_addr(), Some(addr));

        service.stop();
        let tasks = service.take_tasks();
        assert_eq!(tasks.len(), 2);
        for task in tasks {
            task.await.unwrap();
        }
        assert!(service.take_tasks().is_empty());
    }
}
