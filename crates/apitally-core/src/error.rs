//! Error types for apitally-core

use thiserror::Error;

/// Result type alias for apitally operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while configuring the interceptor or encoding a record.
///
/// None of these ever reach the wrapped request handler: the per-request
/// pipeline logs and drops them.
#[derive(Debug, Error)]
pub enum Error {
    /// Environment variables could not be deserialized into a config.
    #[error("Configuration error: {0}")]
    Env(#[from] envy::Error),

    /// A configuration document had a field of the wrong type.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[source] serde_json::Error),

    /// A user supplied masking or exclusion pattern is not a valid regex.
    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// The regex compilation error
        #[source]
        source: regex::Error,
    },

    /// A record could not be serialized or a log line could not be parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Gzip compression, decompression or writing the log line failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A log line was not in the `apitally:<base64>` format.
    #[error("Malformed log line: {0}")]
    MalformedLine(String),
}
