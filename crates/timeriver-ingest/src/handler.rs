//! Connection handlers.
//!
//! A handler owns one connection (or, for UDP, the socket), feeds it to a
//! decoder and forwards every decoded point to the sink as soon as it is
//! decoded. TCP reads are bounded by an idle deadline that is re-armed for
//! every line or read.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use serde_pickle::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accept::is_transient;
use crate::backoff::{Backoff, BackoffConfig};
use crate::decoder::pickle::de_options;
use crate::decoder::{decode_datagram, decode_value, parse_line, Frame, LineCodec, PickleFramer};
use crate::error::{DecodeError, IngestError};
use crate::types::{DataPointSink, SharedSink};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 64 * 1024;

const PICKLE_READ_CHUNK: usize = 8 * 1024;

/// Outcome of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Points forwarded to the sink.
    pub points: usize,
    /// Lines dropped as malformed.
    pub skipped: usize,
}

/// Run `fut` under the idle deadline, if any.
pub(crate) async fn with_deadline<F: Future>(
    idle: Option<Duration>,
    fut: F,
) -> Result<F::Output, IngestError> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| IngestError::IdleTimeout(limit)),
        None => Ok(fut.await),
    }
}

/// Handle a Graphite plaintext stream until EOF.
///
/// Malformed and oversized lines are logged and skipped. Returns an error only
/// for IO failures and idle timeouts.
pub async fn handle_text_stream<S>(
    stream: S,
    sink: &dyn DataPointSink,
    idle: Option<Duration>,
    max_line_length: usize,
) -> Result<ConnectionSummary, IngestError>
where
    S: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, LineCodec::new(max_line_length));
    let mut summary = ConnectionSummary::default();

    while let Some(line) = with_deadline(idle, lines.next()).await? {
        match line?.and_then(|line| parse_line(&line)) {
            Ok(point) => {
                sink.ingest(point);
                summary.points += 1;
            }
            Err(error) => {
                summary.skipped += 1;
                warn!(error = %error, "Skipping malformed line");
            }
        }
    }

    Ok(summary)
}

/// Handle a Graphite pickle connection: one pickled batch, then done.
///
/// Points decoded before a malformed record have already been forwarded when
/// the error is returned.
pub async fn handle_pickle_stream<S>(
    mut stream: S,
    sink: &dyn DataPointSink,
    idle: Option<Duration>,
    max_payload: usize,
) -> Result<ConnectionSummary, IngestError>
where
    S: AsyncRead + Unpin,
{
    let mut summary = ConnectionSummary::default();
    let Some(batch) = read_pickle(&mut stream, idle, max_payload).await? else {
        return Ok(summary);
    };

    for point in decode_value(batch)? {
        sink.ingest(point?);
        summary.points += 1;
    }
    Ok(summary)
}

/// Read one pickled value, ending at the STOP opcode or at EOF.
///
/// Returns `None` if the peer closed without sending anything.
async fn read_pickle<S>(
    stream: &mut S,
    idle: Option<Duration>,
    max_payload: usize,
) -> Result<Option<Value>, IngestError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(PICKLE_READ_CHUNK);
    let mut framer = PickleFramer::new();

    loop {
        buf.reserve(PICKLE_READ_CHUNK);
        let read = with_deadline(idle, stream.read_buf(&mut buf)).await??;

        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return unpickle(buf).await.map(Some);
        }

        if buf.len() > max_payload {
            return Err(DecodeError::PayloadTooLarge { max: max_payload }.into());
        }

        match framer.scan(&buf) {
            Frame::Incomplete => {}
            Frame::Complete(end) => {
                buf.truncate(end);
                return unpickle(buf).await.map(Some);
            }
            Frame::Invalid => return unpickle(buf).await.map(Some),
        }
    }
}

/// Parse a whole payload off the runtime's worker threads.
async fn unpickle(buf: BytesMut) -> Result<Value, IngestError> {
    let parsed = tokio::task::spawn_blocking(move || {
        serde_pickle::value_from_slice(&buf, de_options())
    })
    .await
    .map_err(std::io::Error::other)?;
    Ok(parsed.map_err(DecodeError::from)?)
}

/// Receive Graphite plaintext datagrams until `stop` is cancelled.
///
/// Each datagram holds one or more lines. There is no idle deadline. Receive
/// errors back off like accept errors but never end the loop.
pub async fn serve_datagrams(
    socket: Arc<UdpSocket>,
    sink: SharedSink,
    stop: CancellationToken,
    config: BackoffConfig,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut backoff = Backoff::new(config);

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, peer)) => {
                backoff.reset();
                ingest_datagram(&buf[..len], peer, sink.as_ref());
            }
            Err(error) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %error,
                    transient = is_transient(&error),
                    delay_ms = delay.as_millis() as u64,
                    "UDP receive error, backing off"
                );
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("UDP receive loop stopped");
}

fn ingest_datagram(payload: &[u8], peer: SocketAddr, sink: &dyn DataPointSink) {
    for point in decode_datagram(payload) {
        match point {
            Ok(point) => sink.ingest(point),
            Err(error) => warn!(peer = %peer, error = %error, "Skipping malformed line"),
        }
    }
}
