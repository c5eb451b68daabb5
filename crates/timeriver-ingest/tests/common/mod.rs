//! Shared helpers for ingest integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use timeriver_ecdysis::Manifest;
use timeriver_ingest::{DataPoint, HandlerSettings, ListenConfig, ServiceManager, SharedSink};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A sink that records every point on a channel.
pub fn recording_sink() -> (SharedSink, mpsc::UnboundedReceiver<DataPoint>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: SharedSink = Arc::new(tx);
    (sink, rx)
}

/// Cold-start a manager on loopback ephemeral ports.
pub async fn start_manager(
    listen: ListenConfig,
    settings: HandlerSettings,
) -> (ServiceManager, mpsc::UnboundedReceiver<DataPoint>) {
    let (sink, rx) = recording_sink();
    let mut manager = ServiceManager::new(listen, settings, sink);
    manager
        .run(Manifest::default())
        .await
        .expect("cold start failed");
    (manager, rx)
}

/// Wait for the next point or fail the test.
pub async fn next_point(rx: &mut mpsc::UnboundedReceiver<DataPoint>) -> DataPoint {
    timeout(DEFAULT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a data point")
        .expect("sink closed")
}

/// Stop everything and return every point the manager ever forwarded.
pub async fn finish(
    mut manager: ServiceManager,
    mut rx: mpsc::UnboundedReceiver<DataPoint>,
) -> Vec<DataPoint> {
    manager.shutdown();
    assert!(manager.drain(DEFAULT_TIMEOUT).await, "drain timed out");
    drop(manager);

    let mut points = Vec::new();
    while let Some(point) = timeout(DEFAULT_TIMEOUT, rx.recv())
        .await
        .expect("sink senders still alive after drain")
    {
        points.push(point);
    }
    points
}
