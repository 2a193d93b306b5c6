//! The structured telemetry record emitted once per request

use crate::consumers::Consumer;
use crate::exceptions::ExceptionRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maximum number of body bytes captured per direction
pub const MAX_BODY_SIZE: usize = 10_000;

/// Stand-in for bodies that exceeded [`MAX_BODY_SIZE`]
pub const BODY_TOO_LARGE: &[u8] = b"<body too large>";

/// One emitted telemetry entry
#[derive(Clone, Debug, Serialize)]
pub struct Record {
    pub instance_uuid: Uuid,
    pub request_uuid: Uuid,
    pub startup: Option<StartupData>,
    pub consumer: Option<ConsumerData>,
    pub request: RequestData,
    pub response: ResponseData,
    pub validation_errors: Option<Vec<ValidationError>>,
    pub exception: Option<ExceptionRecord>,
    pub exclude: bool,
}

impl Record {
    /// Create a record with fresh identifiers and no optional sections.
    pub fn new(request: RequestData, response: ResponseData) -> Self {
        Self {
            instance_uuid: Uuid::new_v4(),
            request_uuid: Uuid::new_v4(),
            startup: None,
            consumer: None,
            request,
            response,
            validation_errors: None,
            exception: None,
            exclude: false,
        }
    }

    /// Drop both captured bodies
    pub fn drop_bodies(&mut self) {
        self.request.body = None;
        self.response.body = None;
    }
}

/// Request half of a record
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestData {
    /// Matched route template, absent when nothing matched
    pub path: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    /// Declared content length
    pub size: Option<u64>,
    /// Identifier of the attached consumer
    pub consumer: Option<String>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Option<Bytes>,
}

/// Response half of a record
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResponseData {
    /// Seconds between request start and response start
    pub response_time: f64,
    pub status_code: u16,
    pub headers: Option<Vec<(String, String)>>,
    /// Declared content length, or the measured size of chunked responses
    pub size: Option<u64>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Option<Bytes>,
}

/// Consumer metadata at the top level of a record
///
/// Only present while the consumer still carries a name or group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConsumerData {
    pub identifier: String,
    pub name: Option<String>,
    pub group: Option<String>,
}

impl ConsumerData {
    /// Metadata for a resolved consumer, `None` when there is nothing
    /// beyond the identifier to report.
    pub fn from_consumer(consumer: &Consumer) -> Option<Self> {
        consumer.has_metadata().then(|| Self {
            identifier: consumer.identifier.clone(),
            name: consumer.name.clone(),
            group: consumer.group.clone(),
        })
    }
}

/// A single field-level validation failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// Location of the offending value, outermost first
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

/// Process metadata sent with the first record only
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StartupData {
    pub paths: Vec<Endpoint>,
    pub versions: BTreeMap<String, String>,
    pub client: String,
}

/// A registered route
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
}

impl Endpoint {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

fn serialize_body<S>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match body {
        Some(body) => serializer.serialize_str(&STANDARD.encode(body)),
        None => serializer.serialize_none(),
    }
}
