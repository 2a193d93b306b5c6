//! # apitally-core
//!
//! Framework independent building blocks of the apitally-serverless
//! request interceptor: configuration, header canonicalization, consumer
//! identity, error normalization, masking and log line encoding.
//!
//! This crate is not meant to be used directly. Use `apitally-serverless`
//! instead, which wires these pieces into a `tower` layer.

pub mod config;
mod consumers;
mod error;
pub mod exceptions;
pub mod headers;
pub mod masking;
pub mod output;
pub mod record;

// Public API
pub use config::Config;
pub use consumers::{Consumer, ConsumerRegistry, MAX_IDENTIFIER_LENGTH, MAX_NAME_LENGTH};
pub use error::{Error, Result};
pub use exceptions::ExceptionRecord;
pub use masking::{BodyEncoding, DataMasker, MASKED};
pub use output::{
    create_log_message, decode_log_message, LogEmitter, LogSink, MemorySink, StdoutSink,
    LOG_PREFIX, MAX_LOG_MESSAGE_LENGTH,
};
pub use record::{
    ConsumerData, Endpoint, Record, RequestData, ResponseData, StartupData, ValidationError,
    BODY_TOO_LARGE, MAX_BODY_SIZE,
};
