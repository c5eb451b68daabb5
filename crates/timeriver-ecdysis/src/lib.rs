//! # timeriver-ecdysis
//!
//! Graceful restart support for timeriver, following the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! A graceful restart hands every bound listening socket from the running
//! process to its successor without closing it:
//! 1. The old process stops accepting on each socket and exports a duplicate
//!    of its descriptor ([`GracefulSocket::export_file`])
//! 2. The successor is spawned with those descriptors placed at fd 3, 4, ...
//!    and a comma-separated manifest of protocol keys ([`spawn_successor`])
//! 3. The successor adopts each descriptor by position ([`Manifest::adopt`])
//!    and starts accepting immediately
//! 4. The old process drains in-flight connections ([`DrainTracker`]) and exits
//!
//! ## Signal Conventions
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown (drain connections, then exit)
//! - `SIGQUIT`: graceful restart (spawn successor with fd inheritance, then drain and exit)
//!
//! ## Environment Variables
//!
//! - `TIMERIVER_GRACEFUL_PROTOS`: comma-separated protocol keys, one per
//!   inherited fd starting at fd 3
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("timeriver-ecdysis requires a Unix platform (Linux or macOS)");

mod error;
mod manifest;
mod restart;
mod shutdown;
mod socket;

pub use error::SocketError;
pub use manifest::{Handoff, Manifest, GRACEFUL_PROTOS_ENV, LISTEN_FDS_START};
pub use restart::{spawn_successor, RestartError};
pub use shutdown::{wait_for_signal, ConnectionGuard, DrainTracker, ShutdownSignal};
pub use socket::{BoundSocket, GracefulSocket, SocketKind, SocketState};
