//! InfluxDB v2 sink using the HTTP write API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, error, info};

use super::{Sink, SinkError};
use crate::record::Measurement;

/// Request timeout for a single write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for [`InfluxSink`].
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// Writes measurements as line protocol with nanosecond precision.
#[derive(Debug)]
pub struct InfluxSink {
    client: Client,
    write_url: String,
    config: InfluxConfig,
    closed: AtomicBool,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(WRITE_TIMEOUT).build()?;
        let write_url = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        Ok(Self {
            client,
            write_url,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

impl Sink for InfluxSink {
    async fn write(&self, measurement: &Measurement) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let Some(line) = measurement.to_line_protocol() else {
            debug!(measurement = %measurement.name, "no fields, skipping write");
            return Ok(());
        };

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.config.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .inspect_err(|e| error!(error = %e, "InfluxDB write failed"))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), body = %body, "InfluxDB write failed");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SinkError::Auth(body)),
            _ => Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            }),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(url = %self.config.url, "InfluxDB sink closed");
        }
    }
}
