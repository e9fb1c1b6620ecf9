//! InfluxDB v2 persistence.
//!
//! Writes sensor readings through the v2 HTTP write API using line
//! protocol. Points are written one per request so that a failure on one
//! reading never discards the rest of a batch.

use std::fmt::Write as _;

use tracing::debug;

use crate::retry::{self, CallError, RetryPolicy};

/// A field value in line protocol. Floats are written bare, strings quoted,
/// booleans as true/false.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    String(String),
    Bool(bool),
}

impl FieldValue {
    fn write_to(&self, out: &mut String) {
        match self {
            FieldValue::Float(value) => {
                let _ = write!(out, "{value}");
            }
            FieldValue::String(value) => {
                out.push('"');
                for ch in value.chars() {
                    if ch == '"' || ch == '\\' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push('"');
            }
            FieldValue::Bool(value) => {
                let _ = write!(out, "{value}");
            }
        }
    }
}

/// One measurement point. Tag and field keys keep insertion order so the
/// emitted line is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp_ms: i64,
}

/// Measurement names, tag keys, tag values, and field keys share the same
/// escaping rules: commas, spaces, and equals signs are backslash-escaped.
fn escape_key(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        if ch == ',' || ch == ' ' || ch == '=' {
            out.push('\\');
        }
        out.push(ch);
    }
}

impl Point {
    pub fn new(measurement: &str, timestamp_ms: i64) -> Self {
        Point {
            measurement: measurement.to_string(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp_ms,
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    pub fn field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.push((key.to_string(), value));
        self
    }

    /// Render the point as one line of line protocol, millisecond
    /// precision, no trailing newline.
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::new();
        escape_key(&self.measurement, &mut line);
        for (key, value) in &self.tags {
            line.push(',');
            escape_key(key, &mut line);
            line.push('=');
            escape_key(value, &mut line);
        }
        line.push(' ');
        for (index, (key, value)) in self.fields.iter().enumerate() {
            if index > 0 {
                line.push(',');
            }
            escape_key(key, &mut line);
            line.push('=');
            value.write_to(&mut line);
        }
        let _ = write!(line, " {}", self.timestamp_ms);
        line
    }
}

pub struct Influx {
    url: String,
    org: String,
    bucket: String,
    token: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl Influx {
    pub fn new(
        url: String,
        org: String,
        bucket: String,
        token: String,
        http: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Influx {
            url,
            org,
            bucket,
            token,
            http,
            retry,
        }
    }

    /// Write a single point.
    pub async fn write(&self, point: &Point) -> Result<(), CallError> {
        let url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ms",
            self.url.trim_end_matches('/'),
            self.org,
            self.bucket
        );
        let line = point.to_line_protocol();
        retry::call(&self.retry, || async {
            let response = self
                .http
                .post(&url)
                .header("Authorization", format!("Token {}", self.token))
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(line.clone())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(())
        })
        .await?;
        debug!(measurement = %point.measurement, "wrote point");
        Ok(())
    }
}
