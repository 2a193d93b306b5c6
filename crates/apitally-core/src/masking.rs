//! Redaction of sensitive request and response data.
//!
//! The [`DataMasker`] is built once from a [`Config`] and applied to every
//! assembled [`Record`] before it is emitted. User supplied patterns are
//! checked ahead of the built-in ones; all patterns are case-insensitive
//! regular expressions searched anywhere in the subject.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::headers::find_header;
use crate::record::Record;
use bytes::Bytes;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Replacement for masked header values and body fields
pub const MASKED: &str = "******";

/// Health, readiness and liveness endpoints excluded by default
pub const EXCLUDE_PATH_PATTERNS: &[&str] = &[
    r"/_?healthz?$",
    r"/_?health[_-]?checks?$",
    r"/_?heart[_-]?beats?$",
    r"/ping$",
    r"/ready$",
    r"/live$",
];

/// Header names masked by default
pub const MASK_HEADER_PATTERNS: &[&str] = &[r"auth", r"api-?key", r"secret", r"token", r"cookie"];

/// Body field names masked by default
pub const MASK_BODY_FIELD_PATTERNS: &[&str] = &[
    r"password",
    r"pwd",
    r"token",
    r"secret",
    r"auth",
    r"card[-_ ]?number",
    r"ccv",
    r"ssn",
];

/// How a captured body is interpreted for field masking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyEncoding {
    /// A single JSON document
    Json,
    /// One JSON document per line
    Ndjson,
    /// Anything else, left untouched
    Opaque,
}

impl BodyEncoding {
    /// Pick the encoding from a declared content type.
    ///
    /// Bodies without a content type are tried as JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type.map(str::to_ascii_lowercase) {
            None => Self::Json,
            Some(content_type) if content_type.contains("ndjson") => Self::Ndjson,
            Some(content_type) if content_type.contains("json") => Self::Json,
            Some(_) => Self::Opaque,
        }
    }
}

/// Applies path exclusion, body suppression and header/body masking
#[derive(Clone, Debug)]
pub struct DataMasker {
    log_request_headers: bool,
    log_request_body: bool,
    log_response_headers: bool,
    log_response_body: bool,
    exclude_path_patterns: Vec<Regex>,
    mask_header_patterns: Vec<Regex>,
    mask_body_field_patterns: Vec<Regex>,
}

impl DataMasker {
    /// Compile the merged pattern lists of a config.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            log_request_headers: config.log_request_headers,
            log_request_body: config.log_request_body,
            log_response_headers: config.log_response_headers,
            log_response_body: config.log_response_body,
            exclude_path_patterns: compile_patterns(&config.exclude_paths, EXCLUDE_PATH_PATTERNS)?,
            mask_header_patterns: compile_patterns(&config.mask_headers, MASK_HEADER_PATTERNS)?,
            mask_body_field_patterns: compile_patterns(
                &config.mask_body_fields,
                MASK_BODY_FIELD_PATTERNS,
            )?,
        })
    }

    /// Mask a record in place.
    pub fn apply(&self, record: &mut Record) {
        if self.should_exclude_path(record.request.path.as_deref()) {
            record.request.headers = None;
            record.request.body = None;
            record.response.headers = None;
            record.response.body = None;
            record.exclude = true;
            return;
        }

        if !self.log_request_body {
            record.request.body = None;
        }
        if !self.log_response_body {
            record.response.body = None;
        }

        if let Some(body) = record.request.body.take() {
            let content_type = content_type(record.request.headers.as_deref());
            record.request.body = Some(self.mask_body_bytes(body, content_type));
        }
        if let Some(body) = record.response.body.take() {
            let content_type = content_type(record.response.headers.as_deref());
            record.response.body = Some(self.mask_body_bytes(body, content_type));
        }

        record.request.headers = match record.request.headers.take() {
            Some(headers) if self.log_request_headers => Some(self.mask_headers(headers)),
            _ => None,
        };
        record.response.headers = match record.response.headers.take() {
            Some(headers) if self.log_response_headers => Some(self.mask_headers(headers)),
            _ => None,
        };
    }

    /// Whether records for this path carry no content
    pub fn should_exclude_path(&self, path: Option<&str>) -> bool {
        path.is_some_and(|path| matches_any(&self.exclude_path_patterns, path))
    }

    /// Whether the value of this header is masked
    pub fn should_mask_header(&self, name: &str) -> bool {
        matches_any(&self.mask_header_patterns, name)
    }

    /// Whether string values under this key are masked
    pub fn should_mask_body_field(&self, name: &str) -> bool {
        matches_any(&self.mask_body_field_patterns, name)
    }

    /// Replace the values of sensitive headers with [`MASKED`].
    pub fn mask_headers(&self, headers: Vec<(String, String)>) -> Vec<(String, String)> {
        headers
            .into_iter()
            .map(|(name, value)| {
                if self.should_mask_header(&name) {
                    (name, MASKED.to_string())
                } else {
                    (name, value)
                }
            })
            .collect()
    }

    /// Mask the fields of a body according to its content type.
    ///
    /// Bodies that cannot be decoded are returned unchanged.
    pub fn mask_body_bytes(&self, body: Bytes, content_type: Option<&str>) -> Bytes {
        match BodyEncoding::from_content_type(content_type) {
            BodyEncoding::Json => self.mask_json_document(&body).unwrap_or(body),
            BodyEncoding::Ndjson => self.mask_ndjson_stream(&body).unwrap_or(body),
            BodyEncoding::Opaque => body,
        }
    }

    fn mask_json_document(&self, body: &[u8]) -> Option<Bytes> {
        let parsed: Value = serde_json::from_slice(body).ok()?;
        let masked = self.mask_value(parsed);
        serde_json::to_vec(&masked).ok().map(Bytes::from)
    }

    fn mask_ndjson_stream(&self, body: &[u8]) -> Option<Bytes> {
        let text = std::str::from_utf8(body).ok()?;
        let lines: Vec<String> = text
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|parsed| serde_json::to_string(&self.mask_value(parsed)).ok())
                    .unwrap_or_else(|| line.to_string())
            })
            .collect();
        Some(Bytes::from(lines.join("\n")))
    }

    /// Recursively mask string values under sensitive keys.
    ///
    /// Objects and arrays under sensitive keys are walked rather than
    /// replaced.
    pub fn mask_value(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| {
                        let value = match value {
                            Value::String(_) if self.should_mask_body_field(&key) => {
                                Value::String(MASKED.to_string())
                            }
                            other => self.mask_value(other),
                        };
                        (key, value)
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.mask_value(item)).collect())
            }
            other => other,
        }
    }
}

fn content_type(headers: Option<&[(String, String)]>) -> Option<&str> {
    headers.and_then(|headers| find_header(headers, "content-type"))
}

fn matches_any(patterns: &[Regex], subject: &str) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(subject))
}

/// Compile user patterns followed by built-ins, dropping duplicates while
/// keeping first-seen order.
fn compile_patterns(user: &[String], builtin: &[&str]) -> Result<Vec<Regex>> {
    let mut seen: Vec<&str> = Vec::with_capacity(user.len() + builtin.len());
    for pattern in user.iter().map(String::as_str).chain(builtin.iter().copied()) {
        if !seen.contains(&pattern) {
            seen.push(pattern);
        }
    }

    seen.into_iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| Error::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })
        })
        .collect()
}
