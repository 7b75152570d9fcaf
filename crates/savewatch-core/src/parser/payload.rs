//! Save-data URL payload extraction.
//!
//! Event lines carry a URL such as
//! `https://push.trap.games/api/v3/data?data=%7B...%7D&user_id=usr_...`.
//! The `data` parameter is a percent-encoded JSON object of counters and
//! per-category objects (`dc_*`).

use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::record::FieldValue;

/// Prefix of nested objects that are flattened into `{parent}_{child}` fields.
pub const FLATTEN_PREFIX: &str = "dc_";

/// Errors decoding a save-data URL.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("data is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

/// Decoded query parameters of one event line.
#[derive(Debug, Clone, PartialEq)]
pub struct SavePayload {
    pub user_id: String,
    pub data: Map<String, Value>,
}

/// Extract the URL starting at `marker_pos` and decode its `data` and `user_id`.
///
/// The URL runs to the next whitespace. Only the first occurrence of each
/// parameter is used; a missing `data` decodes as `{}`.
pub fn decode_payload(line: &str, marker_pos: usize) -> Result<SavePayload, PayloadError> {
    let raw_url = line[marker_pos..]
        .split_whitespace()
        .next()
        .unwrap_or_default();
    let url = Url::parse(raw_url)?;

    let mut data: Option<String> = None;
    let mut user_id: Option<String> = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "data" if data.is_none() => data = Some(value.into_owned()),
            "user_id" if user_id.is_none() => user_id = Some(value.into_owned()),
            _ => {}
        }
    }

    let data = match serde_json::from_str::<Value>(data.as_deref().unwrap_or("{}"))? {
        Value::Object(map) => map,
        other => return Err(PayloadError::NotAnObject(json_kind(&other))),
    };

    Ok(SavePayload {
        user_id: user_id.unwrap_or_default(),
        data,
    })
}

/// Flatten top-level scalars and `dc_*` objects into typed fields.
///
/// Nulls, arrays and objects without the prefix are skipped, as are
/// non-scalar children of `dc_*` objects. Later keys overwrite earlier ones
/// when a flattened name collides with a top-level key.
pub fn flatten_fields(data: &Map<String, Value>) -> Vec<(String, FieldValue)> {
    let mut fields = Vec::with_capacity(data.len());
    for (key, value) in data {
        if let Some(field) = scalar(value) {
            fields.push((key.clone(), field));
        } else if let Value::Object(children) = value
            && key.starts_with(FLATTEN_PREFIX)
        {
            for (child_key, child) in children {
                if let Some(field) = scalar(child) {
                    fields.push((format!("{key}_{child_key}"), field));
                }
            }
        }
    }
    fields
}

/// Numeric JSON value as an integer counter (floats truncate toward zero).
pub fn as_counter(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        _ => None,
    }
}

fn scalar(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FieldValue::Int(i)),
            None => n.as_f64().map(FieldValue::Float),
        },
        Value::String(s) => Some(FieldValue::Str(s.clone())),
        Value::Bool(b) => Some(FieldValue::Bool(*b)),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
