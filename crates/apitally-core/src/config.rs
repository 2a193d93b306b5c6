//! Interceptor configuration.
//!
//! A [`Config`] is built once when the interceptor is installed and shared
//! read-only by every request afterwards.
//!
//! # Example
//!
//! ```rust
//! use apitally_core::Config;
//!
//! let config = Config::new()
//!     .log_request_body(true)
//!     .mask_body_field("card_holder")
//!     .exclude_path("/internal/");
//!
//! assert!(config.log_response_headers);
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;

/// Prefix of the environment variables read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "APITALLY_";

/// Interceptor configuration
///
/// Unknown keys are ignored when a config is deserialized, so the same
/// document can carry settings for other components.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether requests are captured at all
    pub enabled: bool,
    /// Whether request headers are included in records
    pub log_request_headers: bool,
    /// Whether request bodies are included in records
    pub log_request_body: bool,
    /// Whether response headers are included in records
    pub log_response_headers: bool,
    /// Whether response bodies are included in records
    pub log_response_body: bool,
    /// Extra header name patterns to mask, checked before the built-ins
    pub mask_headers: Vec<String>,
    /// Extra body field name patterns to mask, checked before the built-ins
    pub mask_body_fields: Vec<String>,
    /// Extra path patterns to exclude, checked before the built-ins
    pub exclude_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            log_request_headers: false,
            log_request_body: false,
            log_response_headers: true,
            log_response_body: false,
            mask_headers: Vec::new(),
            mask_body_fields: Vec::new(),
            exclude_paths: Vec::new(),
        }
    }
}

impl Config {
    /// Create a config with the default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from a JSON document, ignoring unknown keys.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(Error::InvalidConfig)
    }

    /// Build a config from `APITALLY_*` environment variables.
    ///
    /// Lists are comma separated, e.g.
    /// `APITALLY_EXCLUDE_PATHS=/internal/,/debug/`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a config from an explicit set of variables.
    ///
    /// Only keys starting with [`ENV_PREFIX`] are considered.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }

    /// Enable or disable capturing
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Include request headers in records
    pub fn log_request_headers(mut self, enabled: bool) -> Self {
        self.log_request_headers = enabled;
        self
    }

    /// Include request bodies in records
    pub fn log_request_body(mut self, enabled: bool) -> Self {
        self.log_request_body = enabled;
        self
    }

    /// Include response headers in records
    pub fn log_response_headers(mut self, enabled: bool) -> Self {
        self.log_response_headers = enabled;
        self
    }

    /// Include response bodies in records
    pub fn log_response_body(mut self, enabled: bool) -> Self {
        self.log_response_body = enabled;
        self
    }

    /// Add a header name pattern to mask
    pub fn mask_header(mut self, pattern: impl Into<String>) -> Self {
        self.mask_headers.push(pattern.into());
        self
    }

    /// Add a body field name pattern to mask
    pub fn mask_body_field(mut self, pattern: impl Into<String>) -> Self {
        self.mask_body_fields.push(pattern.into());
        self
    }

    /// Add a path pattern to exclude
    pub fn exclude_path(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_paths.push(pattern.into());
        self
    }
}
