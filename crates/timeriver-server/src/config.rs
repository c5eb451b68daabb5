//! Command line and environment configuration.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use timeriver_ecdysis::GRACEFUL_PROTOS_ENV;
use timeriver_ingest::config::{
    DEFAULT_GRAPHITE_PICKLE_LISTEN, DEFAULT_GRAPHITE_TEXT_LISTEN, DEFAULT_HTTP_LISTEN,
};
use timeriver_ingest::{HandlerSettings, ListenConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// timeriver: Graphite-compatible metrics ingestion front end.
///
/// An empty listen spec disables that protocol. Send SIGQUIT for a graceful
/// restart and SIGTERM or SIGINT to stop.
#[derive(Debug, Parser)]
#[command(name = "timeriver", author, version, about, long_about = None)]
pub struct Args {
    /// Graphite plaintext TCP listen spec (`host:port` or `:port`)
    #[arg(long, env = "TIMERIVER_GRAPHITE_TEXT_LISTEN", default_value = DEFAULT_GRAPHITE_TEXT_LISTEN)]
    pub graphite_text_listen: String,

    /// Graphite plaintext UDP listen spec
    #[arg(long, env = "TIMERIVER_GRAPHITE_UDP_LISTEN", default_value = DEFAULT_GRAPHITE_TEXT_LISTEN)]
    pub graphite_udp_listen: String,

    /// Graphite pickle TCP listen spec
    #[arg(long, env = "TIMERIVER_GRAPHITE_PICKLE_LISTEN", default_value = DEFAULT_GRAPHITE_PICKLE_LISTEN)]
    pub graphite_pickle_listen: String,

    /// HTTP listen spec
    #[arg(long, env = "TIMERIVER_HTTP_LISTEN", default_value = DEFAULT_HTTP_LISTEN)]
    pub http_listen: String,

    /// Protocol keys of inherited sockets, set by the parent on graceful restart
    #[arg(long, env = GRACEFUL_PROTOS_ENV, default_value = "", hide = true)]
    pub graceful_protos: String,

    /// Seconds a TCP client may stay silent before it is disconnected (0 disables)
    #[arg(long, env = "TIMERIVER_IDLE_TIMEOUT_SECS", default_value_t = 10)]
    pub idle_timeout_secs: u64,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long, env = "TIMERIVER_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Log output format
    #[arg(long, env = "TIMERIVER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    pub fn listen_config(&self) -> ListenConfig {
        ListenConfig {
            graphite_text: self.graphite_text_listen.clone(),
            graphite_udp: self.graphite_udp_listen.clone(),
            graphite_pickle: self.graphite_pickle_listen.clone(),
            http: self.http_listen.clone(),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings::default().with_idle_timeout_secs(self.idle_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
