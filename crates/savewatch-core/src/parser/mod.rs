//! Per-file log line parser.
//!
//! Two line shapes matter:
//! - timestamp announcements (`[DSM SaveURL] Generated URL`), which carry the
//!   local wall-clock time the next save-data URL belongs to;
//! - save-data URL lines, which become `mpp-savedata` measurements.
//!
//! Everything else is ignored. The parser keeps the last announced timestamp
//! and a [`SpeedEstimator`] for `credit_all`, so one instance must only ever
//! see the lines of one file, in file order.

pub mod payload;
pub mod timestamp;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::record::Measurement;
use crate::speed::SpeedEstimator;

use payload::{as_counter, decode_payload, flatten_fields};
use timestamp::{LeadingTimestamp, parse_leading_timestamp};

/// Marker of the line announcing the timestamp of the upcoming save.
pub const TIMESTAMP_MARKER: &str = "[DSM SaveURL] Generated URL";

/// URL prefix identifying save-data lines.
pub const SAVEDATA_URL_PREFIX: &str = "https://push.trap.games/api/v3/data";

/// Name of the emitted measurement.
pub const MEASUREMENT_NAME: &str = "mpp-savedata";

/// Counter fed to the speed estimator.
pub const CREDIT_FIELD: &str = "credit_all";

/// Field carrying the estimated one-minute change of [`CREDIT_FIELD`].
pub const CREDIT_DELTA_FIELD: &str = "credit_all_delta_1m";

/// Parser state for one log file.
pub struct LineParser {
    file_name: String,
    tz: Tz,
    last_timestamp: Option<DateTime<Utc>>,
    credit_speed: SpeedEstimator,
}

impl LineParser {
    pub fn new(file_name: impl Into<String>, tz: Tz) -> Self {
        Self {
            file_name: file_name.into(),
            tz,
            last_timestamp: None,
            credit_speed: SpeedEstimator::new(),
        }
    }

    /// Last timestamp captured from an announcement line.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    /// Parse one line, using the current wall clock when no timestamp has
    /// been announced yet.
    pub fn parse_line(&mut self, line: &str) -> Option<Measurement> {
        self.parse_line_at(line, Utc::now())
    }

    /// Parse one line with an explicit fallback clock.
    pub fn parse_line_at(&mut self, line: &str, now: DateTime<Utc>) -> Option<Measurement> {
        let line = line.trim();

        if line.contains(TIMESTAMP_MARKER) {
            self.capture_timestamp(line);
            return None;
        }

        let marker_pos = line.find(SAVEDATA_URL_PREFIX)?;
        let payload = match decode_payload(line, marker_pos) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(file = %self.file_name, error = %e, "dropping save-data line");
                return None;
            }
        };

        let timestamp = match self.last_timestamp {
            Some(ts) => ts,
            None => {
                warn!(file = %self.file_name, "no timestamp captured, falling back to now");
                now
            }
        };

        let mut record = Measurement::new(MEASUREMENT_NAME, timestamp).tag("user", payload.user_id);
        for (key, value) in flatten_fields(&payload.data) {
            record = record.field(key, value);
        }

        if let Some(credit) = payload.data.get(CREDIT_FIELD).and_then(as_counter)
            && let Some(delta) = self.credit_speed.add(credit, timestamp)
        {
            debug!(file = %self.file_name, credit, delta, "credit delta");
            record = record.field(CREDIT_DELTA_FIELD, delta);
        }

        Some(record)
    }

    fn capture_timestamp(&mut self, line: &str) {
        match parse_leading_timestamp(line, &self.tz) {
            LeadingTimestamp::Parsed(ts) => self.last_timestamp = Some(ts),
            LeadingTimestamp::Invalid(reason) => {
                warn!(file = %self.file_name, reason = %reason, "failed to parse timestamp");
            }
            LeadingTimestamp::Absent => {}
        }
    }
}
