//! # timeriver-ingest
//!
//! Protocol service layer for the timeriver metrics front end.
//!
//! Monitoring agents push data points over the Graphite wire protocols; this
//! crate listens for them, decodes each connection or datagram into
//! [`DataPoint`]s and forwards every point to a [`DataPointSink`].
//!
//! ## Architecture
//!
//! - **ServiceManager**: registry of one [`Service`] per [`Protocol`]; cold
//!   start, graceful-restart handoff and coordinated shutdown
//! - **Service**: one protocol bound to one `GracefulSocket` and its serving loop
//! - **Accept loop**: per TCP listener, exponential backoff on transient errors
//! - **Connection handlers**: one task per connection with an idle deadline
//! - **Decoders**: Graphite plaintext lines and Graphite pickle batches
//!
//! ## Protocols
//!
//! | key   | protocol                   | transport |
//! |-------|----------------------------|-----------|
//! | `gt`  | Graphite plaintext         | TCP       |
//! | `gu`  | Graphite plaintext         | UDP       |
//! | `gp`  | Graphite pickle            | TCP       |
//! | `www` | HTTP health / server info  | TCP       |

pub mod accept;
pub mod backoff;
pub mod config;
pub mod decoder;
pub mod handler;
pub mod http;
pub mod manager;
pub mod service;

mod error;
mod types;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{HandlerSettings, ListenConfig};
pub use error::{DecodeError, IngestError};
pub use manager::{ServiceManager, ServiceStatus};
pub use service::{Protocol, Service};
pub use types::{sink_fn, DataPoint, DataPointSink, FnSink, SharedSink};
