//! Measurement sinks.
//!
//! A sink is shared by every watcher task, so implementations must accept
//! concurrent writes. Delivery is at-least-once: a line replayed after a
//! restart is written again with the same timestamp, which the time-series
//! store treats as an overwrite.

mod influx;

use std::future::Future;

use thiserror::Error;

use crate::record::Measurement;

pub use influx::{InfluxConfig, InfluxSink};

/// Errors writing a measurement.
#[derive(Debug, Error)]
pub enum SinkError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The server rejected the write.
    #[error("write rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Timeout waiting for response.
    #[error("request timed out")]
    Timeout,

    /// The sink was closed.
    #[error("sink closed")]
    Closed,
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SinkError::Timeout
        } else if err.is_connect() {
            SinkError::Connection(err.to_string())
        } else {
            SinkError::Http(err.to_string())
        }
    }
}

/// Destination for parsed measurements.
pub trait Sink: Send + Sync + 'static {
    /// Write one measurement. Failures are returned to the caller, not retried.
    fn write(&self, measurement: &Measurement) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Release the underlying connection. Later writes fail with [`SinkError::Closed`].
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
