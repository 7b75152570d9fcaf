//! Measurement records and their InfluxDB line protocol form.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// One timestamped, tagged event bound for the sink.
///
/// Tags and fields are kept sorted so the encoded line is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Timestamp in nanoseconds since the Unix epoch.
    ///
    /// Saturates outside the ~1677..2262 range that fits in an i64.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or_else(|| {
            if self.timestamp.timestamp() < 0 {
                i64::MIN
            } else {
                i64::MAX
            }
        })
    }

    /// Encode as one line of InfluxDB line protocol.
    ///
    /// Returns `None` when no field survives encoding (line protocol requires
    /// at least one). Empty tag values and non-finite floats are dropped.
    pub fn to_line_protocol(&self) -> Option<String> {
        let mut line = String::with_capacity(128);
        escape_into(&mut line, &self.name, &[',', ' ']);

        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        let mut first = true;
        for (key, value) in &self.fields {
            if key.is_empty() {
                continue;
            }
            if let FieldValue::Float(f) = value
                && !f.is_finite()
            {
                continue;
            }
            line.push(if first { ' ' } else { ',' });
            first = false;
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            let _ = write!(line, "{value}");
        }
        if first {
            return None;
        }

        let _ = write!(line, " {}", self.timestamp_nanos());
        Some(line)
    }
}

impl fmt::Display for FieldValue {
    /// Line protocol field value syntax.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}i"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(s) => {
                f.write_char('"')?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_char('\\')?;
                    }
                    f.write_char(c)?;
                }
                f.write_char('"')
            }
        }
    }
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        match c {
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
}
