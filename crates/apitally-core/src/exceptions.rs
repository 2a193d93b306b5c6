//! Normalization of unhandled errors into bounded-size records

use serde::Serialize;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt::Display;

/// Maximum length of an exception message, in characters
pub const MAX_EXCEPTION_MSG_LENGTH: usize = 2048;

/// Maximum length of an exception traceback, in characters
pub const MAX_EXCEPTION_TRACEBACK_LENGTH: usize = 65536;

const MSG_TRUNCATION_SUFFIX: &str = "... (truncated)";
const TRACEBACK_TRUNCATION_PREFIX: &str = "... (truncated) ...\n";

/// Type name reported for panics
pub const PANIC_TYPE: &str = "panic";

/// An unhandled error raised while serving a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExceptionRecord {
    /// Fully qualified type name of the error
    #[serde(rename = "type")]
    pub type_name: String,
    /// Error message, truncated to [`MAX_EXCEPTION_MSG_LENGTH`]
    pub msg: String,
    /// Backtrace and cause chain, truncated to [`MAX_EXCEPTION_TRACEBACK_LENGTH`]
    pub traceback: String,
}

impl ExceptionRecord {
    /// Create a record, truncating message and traceback.
    pub fn new(type_name: impl Into<String>, message: &str, traceback: &str) -> Self {
        Self {
            type_name: type_name.into(),
            msg: truncate_message(message.trim(), MAX_EXCEPTION_MSG_LENGTH),
            traceback: truncate_traceback(traceback, MAX_EXCEPTION_TRACEBACK_LENGTH),
        }
    }

    /// Record an error together with its chain of sources.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        let type_name = std::any::type_name::<E>();
        let message = error.to_string();

        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        let traceback = render_traceback(type_name, &message, &causes);
        Self::new(type_name, &message, &traceback)
    }

    /// Record an error that is only known to be displayable.
    pub fn from_display<E>(type_name: &str, error: &E) -> Self
    where
        E: Display + ?Sized,
    {
        let message = error.to_string();
        let traceback = render_traceback(type_name, &message, &[]);
        Self::new(type_name, &message, &traceback)
    }

    /// Record the payload of a caught panic.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        let traceback = render_traceback(PANIC_TYPE, &message, &[]);
        Self::new(PANIC_TYPE, &message, &traceback)
    }
}

/// Render the traceback text: an optional backtrace followed by the error
/// and its causes, so the most specific lines come last.
fn render_traceback(type_name: &str, message: &str, causes: &[String]) -> String {
    let mut traceback = String::new();

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        traceback.push_str("stack backtrace:\n");
        traceback.push_str(&backtrace.to_string());
        if !traceback.ends_with('\n') {
            traceback.push('\n');
        }
    }

    traceback.push_str(type_name);
    traceback.push_str(": ");
    traceback.push_str(message);
    traceback.push('\n');
    for cause in causes {
        traceback.push_str("Caused by: ");
        traceback.push_str(cause);
        traceback.push('\n');
    }

    traceback
}

pub(crate) fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let cutoff = max_chars.saturating_sub(MSG_TRUNCATION_SUFFIX.len());
    let mut truncated: String = message.chars().take(cutoff).collect();
    truncated.push_str(MSG_TRUNCATION_SUFFIX);
    truncated
}

/// Keep the trailing lines of a traceback that fit in `max_chars`.
pub(crate) fn truncate_traceback(traceback: &str, max_chars: usize) -> String {
    let cutoff = max_chars.saturating_sub(TRACEBACK_TRUNCATION_PREFIX.len());
    let mut lines = Vec::new();
    let mut length = 0;

    for line in traceback.split_inclusive('\n').rev() {
        let line_length = line.chars().count();
        if length + line_length > cutoff {
            lines.push(TRACEBACK_TRUNCATION_PREFIX);
            break;
        }
        lines.push(line);
        length += line_length;
    }

    lines.reverse();
    lines.concat().trim().to_string()
}
