//! Service registry and lifecycle.
//!
//! The [`ServiceManager`] owns one [`Service`] per [`Protocol`], fixed at
//! construction. It drives three flows:
//!
//! - **Cold start**: every service binds a fresh socket from its listen spec.
//! - **Graceful restart**: the old process exports a [`Handoff`] and spawns a
//!   successor; the successor adopts each inherited descriptor by position.
//! - **Shutdown**: every socket stops accepting, then in-flight connections
//!   are drained.
//!
//! Inherited sockets are reused as they are. A listen spec that changed since
//! the socket was first bound takes effect only after a full restart.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use timeriver_ecdysis::{DrainTracker, Handoff, Manifest, SocketState, LISTEN_FDS_START};

use crate::config::{HandlerSettings, ListenConfig};
use crate::error::IngestError;
use crate::service::{Protocol, Service, ServiceContext};
use crate::types::SharedSink;

/// Snapshot of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub protocol: Protocol,
    pub listen_spec: String,
    pub state: SocketState,
    pub local_addr: Option<SocketAddr>,
}

/// Registry of protocol services.
pub struct ServiceManager {
    services: BTreeMap<Protocol, Service>,
    ctx: ServiceContext,
}

impl ServiceManager {
    pub fn new(listen: ListenConfig, settings: HandlerSettings, sink: SharedSink) -> Self {
        let services = Protocol::ALL
            .into_iter()
            .map(|protocol| (protocol, Service::new(protocol, listen.spec(protocol))))
            .collect();

        Self {
            services,
            ctx: ServiceContext {
                sink,
                settings,
                drain: DrainTracker::new(),
                listen: Arc::new(listen),
            },
        }
    }

    /// Start every service.
    ///
    /// An empty manifest is a cold start. Otherwise the Nth key of the
    /// manifest names the socket inherited at fd `LISTEN_FDS_START + N`.
    pub async fn run(&mut self, manifest: Manifest) -> Result<(), IngestError> {
        self.run_with_base(manifest, LISTEN_FDS_START).await
    }

    /// [`run`](Self::run) with inherited descriptors starting at `base`.
    pub async fn run_with_base(
        &mut self,
        manifest: Manifest,
        base: RawFd,
    ) -> Result<(), IngestError> {
        if manifest.is_empty() {
            info!("Cold start, binding fresh sockets");
            for service in self.services.values_mut() {
                service.start(None, &self.ctx).await?;
            }
            return Ok(());
        }

        info!(manifest = %manifest, base, "Graceful restart, adopting inherited sockets");
        warn!("Inherited sockets keep their original addresses; listen spec changes need a full restart");

        let inherited = manifest.adopt(base)?;
        self.start_inherited(Handoff::from(inherited)).await
    }

    /// Start services on descriptors this process already owns.
    ///
    /// Used by a successor after adopting its inherited fds, and by a process
    /// whose successor failed to spawn to resume on its own exported sockets.
    /// Unknown protocol keys are skipped and their descriptors closed.
    /// Services not named in the handoff stay stopped.
    pub async fn start_inherited(&mut self, handoff: Handoff) -> Result<(), IngestError> {
        for (key, fd) in handoff.into_entries() {
            let Some(service) = Protocol::from_key(&key).and_then(|p| self.services.get_mut(&p))
            else {
                warn!(protocol = %key, "Ignoring inherited socket for unknown protocol");
                continue;
            };
            service.start(Some(fd), &self.ctx).await?;
        }
        Ok(())
    }

    /// Export a duplicate descriptor of every bound socket, in a fixed order.
    ///
    /// The handoff's manifest lists the matching protocol keys in the same
    /// order; position N is the socket a successor finds at fd
    /// `LISTEN_FDS_START + N`.
    pub fn export_manifest(&self) -> Result<Handoff, IngestError> {
        let mut handoff = Handoff::new();
        for service in self.services.values() {
            if let Some(fd) = service.export_file()? {
                handoff.push(service.protocol().key(), fd);
            }
        }
        Ok(handoff)
    }

    /// Stop accepting on every service. Idempotent.
    pub fn shutdown(&mut self) {
        for service in self.services.values_mut() {
            service.stop();
        }
    }

    /// Wait for serving loops and in-flight connections to finish.
    ///
    /// Call after [`shutdown`](Self::shutdown). Returns `false` if anything was
    /// still running when `timeout` elapsed.
    pub async fn drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut clean = true;

        for service in self.services.values_mut() {
            for task in service.take_tasks() {
                match tokio::time::timeout_at(deadline, task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(protocol = service.protocol().key(), error = %e, "Serving task failed");
                    }
                    Err(_) => {
                        warn!(protocol = service.protocol().key(), "Serving task still running at drain deadline");
                        clean = false;
                    }
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.ctx.drain.drain(remaining).await && clean
    }

    /// Address a protocol's socket is bound to, if it was ever bound.
    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.services.get(&protocol).and_then(Service::local_addr)
    }

    /// Connections currently being handled.
    pub fn active_connections(&self) -> usize {
        self.ctx.drain.active_connections()
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services
            .values()
            .map(|service| ServiceStatus {
                protocol: service.protocol(),
                listen_spec: service.listen_spec().to_string(),
                state: service.state(),
                local_addr: service.local_addr(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sink_fn;

    fn manager(listen: ListenConfig) -> ServiceManager {
        ServiceManager::new(listen, HandlerSettings::default(), sink_fn(|_| {}))
    }

    #[tokio::test]
    async fn test_blank_specs_bind_nothing() {
        let mut manager = manager(ListenConfig::disabled());
        manager.run(Manifest::default()).await.unwrap();

        for status in manager.status() {
            assert_eq!(status.state, SocketState::Unbound, "{:?}", status.protocol);
            assert_eq!(status.local_addr, None);
        }
        assert!(manager.export_manifest().unwrap().is_empty());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_cold_start_binds_every_service() {
        let mut manager = manager(ListenConfig::loopback());
        manager.run(Manifest::default()).await.unwrap();

        for protocol in Protocol::ALL {
            let addr = manager.local_addr(protocol).unwrap();
            assert!(addr.ip().is_loopback());
            assert_ne!(addr.port(), 0);
        }

        let handoff = manager.export_manifest().unwrap();
        assert_eq!(handoff.manifest().to_string(), "gt,gu,gp,www");

        manager.shutdown();
        assert!(manager.drain(Duration::from_secs(5)).await);
        assert!(manager
            .status()
            .iter()
            .all(|status| status.state == SocketState::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_safe_before_run() {
        let mut manager = manager(ListenConfig::loopback());
        manager.shutdown();
        manager.shutdown();
        assert!(manager.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_bind_failure_surfaces() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut listen = ListenConfig::disabled();
        listen.graphite_text = taken.local_addr().unwrap().to_string();

        let mut manager = manager(listen);
        let err = manager.run(Manifest::default()).await.unwrap_err();
        assert!(matches!(err, IngestError::Start { protocol: "gt", .. }), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_keys_are_skipped() {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut handoff = Handoff::new();
        handoff.push("carbon-v2", socket.into());

        let mut manager = manager(ListenConfig::loopback());
        manager.start_inherited(handoff).await.unwrap();
        assert!(manager
            .status()
            .iter()
            .all(|status| status.state == SocketState::Unbound));
    }

    #[tokio::test]
    async fn test_resume_after_stop() {
        let mut manager = manager(ListenConfig::loopback());
        manager.run(Manifest::default()).await.unwrap();
        let before = manager.local_addr(Protocol::GraphitePickle).unwrap();

        let handoff = manager.export_manifest().unwrap();
        manager.shutdown();
        manager.start_inherited(handoff).await.unwrap();

        assert_eq!(manager.local_addr(Protocol::GraphitePickle), Some(before));
        assert!(manager
            .status()
            .iter()
            .all(|status| status.state == SocketState::Bound));

        manager.shutdown();
        assert!(manager.drain(Duration::from_secs(5)).await);
    }
}
