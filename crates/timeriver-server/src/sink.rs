//! Stand-in downstream for decoded points.
//!
//! The aggregation and storage engine is a separate component. Until it is
//! wired in, points are logged at debug level and counted.

use std::sync::Arc;

use timeriver_ingest::{DataPoint, SharedSink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A channel sink and the task consuming it. The task returns the number of
/// points seen once every sender is gone.
pub fn logging_sink() -> (SharedSink, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<DataPoint>();

    let consumer = tokio::spawn(async move {
        let mut count = 0u64;
        while let Some(point) = rx.recv().await {
            count += 1;
            debug!(
                name = %point.name(),
                value = point.value(),
                timestamp = point.unix_timestamp(),
                "Data point"
            );
        }
        count
    });

    let sink: SharedSink = Arc::new(tx);
    (sink, consumer)
}
