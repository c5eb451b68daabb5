//! Per-listener accept loop.
//!
//! Each TCP service runs one loop. Every accepted connection is dispatched to
//! its own task so a slow client never holds up the next accept. Transient
//! errors back off with [`Backoff`]; the loop ends when the socket's stop
//! token is cancelled or accept fails permanently.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::service::Protocol;

/// Source of incoming connections.
pub trait Accept: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

impl Accept for TcpListener {
    type Conn = (TcpStream, SocketAddr);

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send {
        TcpListener::accept(self)
    }
}

/// Why an accept loop returned.
#[derive(Debug)]
pub enum AcceptLoopExit {
    /// The stop token was cancelled.
    Stopped,
    /// Accept failed with a non-transient error.
    Failed(io::Error),
}

/// Whether an accept error is worth retrying after a backoff.
pub fn is_transient(error: &io::Error) -> bool {
    if let Some(code) = error.raw_os_error() {
        if matches!(
            code,
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
        ) {
            return true;
        }
    }
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Accept connections until `stop` is cancelled.
///
/// `dispatch` turns each connection into a future that is spawned and never
/// awaited. Holding `acceptor` keeps the socket open until the loop returns.
pub async fn run_accept_loop<A, F, Fut>(
    protocol: Protocol,
    acceptor: Arc<A>,
    stop: CancellationToken,
    config: BackoffConfig,
    mut dispatch: F,
) -> AcceptLoopExit
where
    A: Accept,
    F: FnMut(A::Conn) -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = Backoff::new(config);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            accepted = acceptor.accept() => Some(accepted),
        };
        let Some(accepted) = accepted else {
            debug!(protocol = protocol.key(), "Accept loop stopped");
            return AcceptLoopExit::Stopped;
        };

        match accepted {
            Ok(conn) => {
                backoff.reset();
                tokio::spawn(dispatch(conn));
            }
            Err(error) if is_transient(&error) => {
                let delay = backoff.next_delay();
                warn!(
                    protocol = protocol.key(),
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient accept error, backing off"
                );
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        debug!(protocol = protocol.key(), "Accept loop stopped during backoff");
                        return AcceptLoopExit::Stopped;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            // Reported by the caller.
            Err(error) => return AcceptLoopExit::Failed(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    /// Replays canned accept results, then waits forever.
    struct Scripted {
        script: Mutex<VecDeque<io::Result<u32>>>,
    }

    impl Scripted {
        fn new(script: Vec<io::Result<u32>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl Accept for Scripted {
        type Conn = u32;

        fn accept(&self) -> impl Future<Output = io::Result<u32>> + Send {
            let next = self.script.lock().unwrap().pop_front();
            async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }
    }

    fn emfile() -> io::Result<u32> {
        Err(io::Error::from_raw_os_error(libc::EMFILE))
    }

    #[test]
    fn test_transient_classification() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(is_transient(&io::Error::from_raw_os_error(code)), "errno {code}");
        }
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_reset_after_success() {
        let acceptor = Scripted::new(vec![
            emfile(),
            emfile(),
            Ok(1),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Ok(2),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let start = Instant::now();

        let handle = tokio::spawn(run_accept_loop(
            Protocol::GraphiteText,
            acceptor,
            stop.clone(),
            BackoffConfig::default(),
            move |conn| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((conn, Instant::now()));
                }
            },
        ));

        let (first, at_first) = rx.recv().await.unwrap();
        let (second, at_second) = rx.recv().await.unwrap();
        assert_eq!((first, second), (1, 2));

        // 5 ms + 10 ms before the first success.
        let first_wait = at_first - start;
        assert!(first_wait >= Duration::from_millis(15), "{first_wait:?}");
        assert!(first_wait < Duration::from_millis(20), "{first_wait:?}");

        // Backoff restarted at 5 ms after the success.
        let second_wait = at_second - at_first;
        assert!(second_wait >= Duration::from_millis(5), "{second_wait:?}");
        assert!(second_wait < Duration::from_millis(10), "{second_wait:?}");

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), AcceptLoopExit::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_does_not_block_accepts() {
        let acceptor = Scripted::new(vec![Ok(1), Ok(2), Ok(3)]);
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        let stop = CancellationToken::new();

        let handle = tokio::spawn(run_accept_loop(
            Protocol::GraphitePickle,
            acceptor,
            stop.clone(),
            BackoffConfig::default(),
            move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600))
            },
        ));

        while dispatched.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), AcceptLoopExit::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff_sleep() {
        let acceptor = Scripted::new((0..20).map(|_| emfile()).collect());
        let stop = CancellationToken::new();

        let handle = tokio::spawn(run_accept_loop(
            Protocol::GraphiteText,
            acceptor,
            stop.clone(),
            BackoffConfig::default(),
            |_conn| async {},
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        assert!(matches!(handle.await.unwrap(), AcceptLoopExit::Stopped));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_permanent_error_exits() {
        let acceptor = Scripted::new(vec![Err(io::Error::from_raw_os_error(libc::EBADF))]);

        let exit = run_accept_loop(
            Protocol::GraphiteText,
            acceptor,
            CancellationToken::new(),
            BackoffConfig::default(),
            |_conn| async {},
        )
        .await;

        match exit {
            AcceptLoopExit::Failed(error) => assert_eq!(error.raw_os_error(), Some(libc::EBADF)),
            AcceptLoopExit::Stopped => panic!("expected permanent failure"),
        }
        // The caller reports the failure; the loop itself stays quiet.
        logs_assert(|lines: &[&str]| {
            match lines.iter().find(|line| line.contains("ERROR") || line.contains("WARN")) {
                Some(line) => Err(format!("unexpected log line: {line}")),
                None => Ok(()),
            }
        });
    }

    #[tokio::test]
    async fn test_tcp_listener_dispatches_connections() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let handle = tokio::spawn(run_accept_loop(
            Protocol::GraphiteText,
            Arc::clone(&listener),
            stop.clone(),
            BackoffConfig::default(),
            move |(_stream, peer): (TcpStream, SocketAddr)| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(peer);
                }
            },
        ));

        let client = TcpStream::connect(addr).await.unwrap();
        let peer = rx.recv().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        stop.cancel();
        assert!(matches!(handle.await.unwrap(), AcceptLoopExit::Stopped));
        assert_eq!(Arc::strong_count(&listener), 1);
    }
}
