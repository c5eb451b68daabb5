//! Data points and the downstream sink seam.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::DecodeError;

/// One decoded metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    name: String,
    timestamp: DateTime<Utc>,
    value: f64,
}

impl DataPoint {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
        }
    }

    /// Build a data point from Unix seconds.
    pub fn from_unix(name: impl Into<String>, seconds: i64, value: f64) -> Result<Self, DecodeError> {
        let timestamp =
            DateTime::from_timestamp(seconds, 0).ok_or(DecodeError::TimestampRange(seconds))?;
        Ok(Self::new(name, timestamp, value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Timestamp as Unix seconds.
    pub fn unix_timestamp(&self) -> i64 {
        self.timestamp.timestamp()
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.value, self.unix_timestamp())
    }
}

/// Downstream ingestion call.
///
/// Called concurrently from every connection handler; implementations must
/// not block and must tolerate arbitrary interleaving across connections.
pub trait DataPointSink: Send + Sync + 'static {
    fn ingest(&self, point: DataPoint);
}

/// Sink shared by every service and connection.
pub type SharedSink = Arc<dyn DataPointSink>;

impl DataPointSink for mpsc::UnboundedSender<DataPoint> {
    fn ingest(&self, point: DataPoint) {
        if let Err(mpsc::error::SendError(point)) = self.send(point) {
            trace!(name = %point.name(), "Sink receiver dropped, discarding data point");
        }
    }
}

/// Sink backed by a closure.
pub struct FnSink<F>(F);

impl<F> DataPointSink for FnSink<F>
where
    F: Fn(DataPoint) + Send + Sync + 'static,
{
    fn ingest(&self, point: DataPoint) {
        (self.0)(point)
    }
}

/// Wrap a closure as a [`SharedSink`].
pub fn sink_fn<F>(f: F) -> SharedSink
where
    F: Fn(DataPoint) + Send + Sync + 'static,
{
    Arc::new(FnSink(f))
}
