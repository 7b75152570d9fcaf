//! Timestamp-announcement lines and source time zone handling.
//!
//! VRChat prefixes every log line with local wall-clock time in the form
//! `YYYY.MM.DD HH:MM:SS`. The zone is not written, so it has to be supplied.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// Zone used when none is configured or the configured one is unknown.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Tokyo;

const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";
const TIMESTAMP_LEN: usize = "YYYY.MM.DD HH:MM:SS".len();

/// Resolve an IANA zone name, falling back to [`DEFAULT_TIMEZONE`].
pub fn resolve_timezone(name: Option<&str>) -> Tz {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return DEFAULT_TIMEZONE;
    };
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(e) => {
            warn!(
                timezone = name,
                fallback = DEFAULT_TIMEZONE.name(),
                error = %e,
                "invalid timezone, using fallback"
            );
            DEFAULT_TIMEZONE
        }
    }
}

/// Outcome of reading the leading timestamp of a line.
#[derive(Debug, Clone, PartialEq)]
pub enum LeadingTimestamp {
    /// The line does not start with a `YYYY.MM.DD HH:MM:SS` shaped prefix.
    Absent,
    /// Shaped like a timestamp but not a valid local time in the zone.
    Invalid(String),
    Parsed(DateTime<Utc>),
}

/// Read the `YYYY.MM.DD HH:MM:SS` prefix of `line` as local time in `tz`.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant.
pub fn parse_leading_timestamp(line: &str, tz: &Tz) -> LeadingTimestamp {
    let Some(prefix) = line.get(..TIMESTAMP_LEN) else {
        return LeadingTimestamp::Absent;
    };
    if !has_timestamp_shape(prefix) {
        return LeadingTimestamp::Absent;
    }

    let naive = match NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT) {
        Ok(naive) => naive,
        Err(e) => return LeadingTimestamp::Invalid(format!("{prefix}: {e}")),
    };
    match tz.from_local_datetime(&naive).earliest() {
        Some(local) => LeadingTimestamp::Parsed(local.with_timezone(&Utc)),
        None => LeadingTimestamp::Invalid(format!("{prefix} does not exist in {}", tz.name())),
    }
}

/// `dddd.dd.dd dd:dd:dd`
fn has_timestamp_shape(s: &str) -> bool {
    const SHAPE: &[u8] = b"dddd.dd.dd dd:dd:dd";
    s.len() == SHAPE.len()
        && s.bytes().zip(SHAPE).all(|(b, &expected)| match expected {
            b'd' => b.is_ascii_digit(),
            other => b == other,
        })
}
