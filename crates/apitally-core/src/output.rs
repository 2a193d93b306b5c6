//! Encoding of records into log lines and writing them out.
//!
//! A log line is the literal prefix `apitally:` followed by the standard
//! base64 encoding of the gzip compressed, compact JSON form of a record.
//! Empty fields are left out of the JSON entirely.

use crate::error::{Error, Result};
use crate::record::Record;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Prefix of every emitted line
pub const LOG_PREFIX: &str = "apitally:";

/// Maximum length of an emitted line, in characters
pub const MAX_LOG_MESSAGE_LENGTH: usize = 15_000;

/// Remove null, `false`, empty string, empty array and empty object fields.
///
/// Only objects are walked; arrays are kept as they are.
pub fn strip_empty(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| !is_empty(value))
                .map(|(key, value)| (key, strip_empty(value)))
                .collect(),
        ),
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Encode a record into a log line.
pub fn create_log_message(record: &Record) -> Result<String> {
    let cleaned = strip_empty(serde_json::to_value(record)?);
    let serialized = serde_json::to_vec(&cleaned)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serialized)?;
    let compressed = encoder.finish()?;

    Ok(format!("{LOG_PREFIX}{}", STANDARD.encode(compressed)))
}

/// Decode a log line back into its JSON document.
pub fn decode_log_message(line: &str) -> Result<Value> {
    let encoded = line
        .trim_end()
        .strip_prefix(LOG_PREFIX)
        .ok_or_else(|| Error::MalformedLine(format!("missing {LOG_PREFIX:?} prefix")))?;
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| Error::MalformedLine(e.to_string()))?;

    let mut serialized = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut serialized)?;

    Ok(serde_json::from_slice(&serialized)?)
}

/// Destination of encoded log lines.
///
/// Implement this trait to ship lines somewhere other than stdout.
pub trait LogSink: Send + Sync + 'static {
    /// Write a single line, without its trailing newline.
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Writes each line to the process's standard output
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()
    }
}

/// Keeps lines in memory.
///
/// Clones share the same buffer, so a test can hand one clone to the
/// interceptor and inspect the other.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Decode every line written so far, skipping undecodable ones
    pub fn records(&self) -> Vec<Value> {
        self.lines
            .lock()
            .iter()
            .filter_map(|line| decode_log_message(line).ok())
            .collect()
    }

    /// Remove and return the lines written so far
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

/// Encodes records and writes them to a sink.
///
/// Emission never fails from the caller's point of view: errors are
/// reported through `tracing` and the record is dropped.
#[derive(Clone)]
pub struct LogEmitter {
    sink: Arc<dyn LogSink>,
}

impl LogEmitter {
    pub fn new(sink: impl LogSink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn from_arc(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Encode and write a record.
    ///
    /// Lines longer than [`MAX_LOG_MESSAGE_LENGTH`] are encoded once more
    /// without bodies. The record is left without bodies in that case.
    pub fn emit(&self, record: &mut Record) {
        let line = match self.encode(record) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(error = %error, request_uuid = %record.request_uuid, "Failed to encode apitally record");
                return;
            }
        };

        if let Err(error) = self.sink.write_line(&line) {
            tracing::warn!(error = %error, request_uuid = %record.request_uuid, "Failed to write apitally record");
        }
    }

    fn encode(&self, record: &mut Record) -> Result<String> {
        let line = create_log_message(record)?;
        if line.len() <= MAX_LOG_MESSAGE_LENGTH {
            return Ok(line);
        }

        tracing::debug!(
            length = line.len(),
            request_uuid = %record.request_uuid,
            "Log line too long, dropping bodies"
        );
        record.drop_bodies();
        create_log_message(record)
    }
}

impl Default for LogEmitter {
    fn default() -> Self {
        Self::new(StdoutSink)
    }
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter").finish_non_exhaustive()
    }
}
