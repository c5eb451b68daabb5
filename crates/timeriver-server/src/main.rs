use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use timeriver_ecdysis::{spawn_successor, wait_for_signal, Manifest, RestartError, ShutdownSignal};
use timeriver_ingest::ServiceManager;
use tracing::{error, info, warn};

mod config;
mod sink;
mod telemetry;

use config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    telemetry::init(args.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("timeriver starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let listen = args.listen_config();
    listen.log_config();

    let (sink, consumer) = sink::logging_sink();
    let mut manager = ServiceManager::new(listen, args.handler_settings(), sink);

    let manifest = Manifest::parse(&args.graceful_protos);
    if !manifest.is_empty() {
        info!(protocols = %manifest, "Inherited sockets from parent process (Ecdysis graceful restart)");
    }
    manager
        .run(manifest)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start services: {}", e))?;

    for status in manager.status() {
        info!(
            protocol = status.protocol.key(),
            state = ?status.state,
            addr = ?status.local_addr,
            "Service status"
        );
    }

    run_until_shutdown(&mut manager).await?;

    let clean = manager.drain(args.drain_timeout()).await;
    drop(manager);

    match tokio::time::timeout(Duration::from_secs(1), consumer).await {
        Ok(Ok(count)) => info!(points = count, "Sink closed"),
        Ok(Err(e)) => warn!(error = %e, "Sink task failed"),
        Err(_) => warn!("Sink still referenced by unfinished connections"),
    }

    if clean {
        info!("Graceful shutdown complete");
    } else {
        warn!("Shutdown finished with connections still open");
    }
    Ok(())
}

/// Serve until a terminate signal, or until a successor has taken over.
async fn run_until_shutdown(manager: &mut ServiceManager) -> Result<()> {
    loop {
        let signal = wait_for_signal()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install signal handlers: {}", e))?;

        match signal {
            ShutdownSignal::Terminate => {
                manager.shutdown();
                return Ok(());
            }
            ShutdownSignal::Restart => {
                let handoff = manager
                    .export_manifest()
                    .map_err(|e| anyhow::anyhow!("Failed to export sockets: {}", e))?;
                manager.shutdown();

                match spawn_successor(handoff) {
                    Ok(child) => {
                        info!(pid = child.id(), "Successor started, draining");
                        return Ok(());
                    }
                    Err(RestartError { handoff, error }) => {
                        error!(error = %error, "Failed to start successor, resuming service");
                        manager
                            .start_inherited(handoff)
                            .await
                            .map_err(|e| anyhow::anyhow!("Failed to resume services: {}", e))?;
                    }
                }
            }
        }
    }
}
