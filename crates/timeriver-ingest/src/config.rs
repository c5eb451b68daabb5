//! Listener and handler configuration.
//!
//! Listen specs are `host:port` strings; a bare `:port` listens on all
//! interfaces and an empty string disables the service.
//!
//! Graceful restart reuses inherited sockets as they are: a listen spec that
//! changed since the socket was first bound takes effect only after a full
//! (non-graceful) restart.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::backoff::BackoffConfig;
use crate::service::Protocol;

/// Default TCP and UDP port for Graphite plaintext.
pub const DEFAULT_GRAPHITE_TEXT_LISTEN: &str = "0.0.0.0:2003";
/// Default TCP port for Graphite pickle.
pub const DEFAULT_GRAPHITE_PICKLE_LISTEN: &str = "0.0.0.0:2004";
/// Default port for the HTTP listener.
pub const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:8088";

/// Per-protocol listen specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenConfig {
    pub graphite_text: String,
    pub graphite_udp: String,
    pub graphite_pickle: String,
    pub http: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            graphite_text: DEFAULT_GRAPHITE_TEXT_LISTEN.to_string(),
            graphite_udp: DEFAULT_GRAPHITE_TEXT_LISTEN.to_string(),
            graphite_pickle: DEFAULT_GRAPHITE_PICKLE_LISTEN.to_string(),
            http: DEFAULT_HTTP_LISTEN.to_string(),
        }
    }
}

impl ListenConfig {
    /// Every service disabled.
    pub fn disabled() -> Self {
        Self {
            graphite_text: String::new(),
            graphite_udp: String::new(),
            graphite_pickle: String::new(),
            http: String::new(),
        }
    }

    /// Every service on an ephemeral loopback port.
    pub fn loopback() -> Self {
        Self {
            graphite_text: "127.0.0.1:0".to_string(),
            graphite_udp: "127.0.0.1:0".to_string(),
            graphite_pickle: "127.0.0.1:0".to_string(),
            http: "127.0.0.1:0".to_string(),
        }
    }

    pub fn spec(&self, protocol: Protocol) -> &str {
        match protocol {
            Protocol::GraphiteText => &self.graphite_text,
            Protocol::GraphiteUdp => &self.graphite_udp,
            Protocol::GraphitePickle => &self.graphite_pickle,
            Protocol::Http => &self.http,
        }
    }

    /// Log the effective listen configuration.
    pub fn log_config(&self) {
        for protocol in Protocol::ALL {
            let spec = self.spec(protocol);
            if spec.is_empty() {
                info!(protocol = protocol.key(), "{}: disabled", protocol);
            } else {
                info!(protocol = protocol.key(), listen = %spec, "{}: {}", protocol, spec);
            }
        }
    }
}

/// Connection handling parameters shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    /// Idle deadline for TCP connections. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Backoff for transient accept and receive errors.
    pub backoff: BackoffConfig,
    /// Longest accepted plaintext line.
    pub max_line_length: usize,
    /// Largest accepted pickle payload per connection.
    pub max_pickle_bytes: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(10)),
            backoff: BackoffConfig::default(),
            max_line_length: 64 * 1024,
            max_pickle_bytes: 64 * 1024 * 1024,
        }
    }
}

impl HandlerSettings {
    /// Settings with the given idle timeout in seconds; zero disables it.
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }
}
