//! # apitally-serverless
//!
//! A `tower` layer that records every request and response of the wrapped
//! service and writes one compressed log line per request to stdout, for
//! serverless platforms where the lines are picked up by a log drain.
//!
//! Each line carries timing, status, sizes, optionally headers and bodies,
//! the caller's identity, validation errors and unhandled errors. Sensitive
//! headers and body fields are masked before anything is written.
//!
//! ## Example
//!
//! ```rust,ignore
//! use apitally_serverless::{ApitallyLayer, Config, RequestContext, Routes};
//!
//! let layer = ApitallyLayer::builder(Config::from_env()?)
//!     .routes(Routes::new().route("/orders/{id}", [Method::GET]))
//!     .build()?;
//!
//! async fn get_order(req: Request<RequestBody<Incoming>>) -> Result<Response<Full<Bytes>>, Infallible> {
//!     if let Some(ctx) = RequestContext::from_extensions(req.extensions()) {
//!         ctx.set_consumer("customer-17", Some("ACME"), None);
//!     }
//!     // ...
//! }
//! ```

mod body;
mod context;
mod exchange;
mod layer;
pub mod routes;
mod startup;
mod state;
pub mod validation;

// Public API
pub use body::{RequestBody, ResponseBody};
pub use context::{set_consumer, RequestContext};
pub use layer::{ApitallyLayer, ApitallyLayerBuilder, ApitallyService};
pub use routes::Routes;
pub use startup::{startup_data, CLIENT_ID, PACKAGE_VERSION, RUNTIME_VERSION};
pub use state::ProcessState;
pub use validation::{extract_validation_errors, DefaultValidationExtractor, ValidationErrorExtractor};

pub use apitally_core::{
    decode_log_message, Config, Consumer, Error, ExceptionRecord, LogSink, MemorySink, Result,
    StdoutSink, ValidationError,
};
