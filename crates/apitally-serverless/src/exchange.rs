//! Per-request capture state and record assembly.
//!
//! An [`ExchangeGuard`] is created for every captured request. It travels
//! from the service future into the response body, and whichever way the
//! request ends (stream finished, error, panic, cancellation) dropping the
//! guard assembles the record, masks it and emits it.

use crate::body::BodyCapture;
use crate::context::RequestContext;
use crate::routes::Routes;
use crate::startup::startup_data;
use crate::state::ProcessState;
use crate::validation::ValidationErrorExtractor;
use apitally_core::headers::{find_header, header_pairs, is_supported_content_type, parse_content_length};
use apitally_core::{
    Config, ConsumerData, DataMasker, ExceptionRecord, LogEmitter, Record, RequestData,
    ResponseData,
};
use http::{header, request, HeaderMap, Response, StatusCode};
use http_body::Body;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Immutable state shared by every request of one layer
pub(crate) struct Interceptor {
    pub(crate) config: Config,
    pub(crate) masker: DataMasker,
    pub(crate) emitter: LogEmitter,
    pub(crate) instance_uuid: Uuid,
    pub(crate) state: Arc<ProcessState>,
    pub(crate) routes: Routes,
    pub(crate) versions: BTreeMap<String, String>,
    pub(crate) validation: Arc<dyn ValidationErrorExtractor>,
}

impl Interceptor {
    /// Start capturing a request.
    ///
    /// Inserts the [`RequestContext`] into the request's extensions and
    /// returns the guard together with the request body's capture buffer.
    pub(crate) fn begin(
        self: &Arc<Self>,
        start: Instant,
        parts: &mut request::Parts,
    ) -> (ExchangeGuard, Arc<Mutex<BodyCapture>>) {
        let context = RequestContext::new(self.state.clone());
        parts.extensions.insert(context.clone());

        let request_headers = header_pairs(&parts.headers);
        let request_size = parse_content_length(parts.headers.get(header::CONTENT_LENGTH));
        let capture_body = self.config.log_request_body
            && is_supported_content_type(find_header(&request_headers, "content-type"));
        let request_body = Arc::new(Mutex::new(BodyCapture::new(capture_body, request_size)));

        let exchange = Exchange {
            start,
            context,
            path: self.routes.resolve(&parts.method, parts.uri.path()),
            request_headers,
            request_size,
            request_body: request_body.clone(),
            response: None,
            response_body: BodyCapture::Disabled,
            exception: None,
        };

        let guard = ExchangeGuard {
            interceptor: self.clone(),
            exchange: Some(exchange),
        };
        (guard, request_body)
    }

    /// Assemble, mask and emit the record of a finished exchange.
    fn complete(&self, exchange: Exchange) {
        let Exchange {
            start,
            context,
            path,
            request_headers,
            request_size,
            request_body,
            response,
            mut response_body,
            exception,
        } = exchange;

        let exception = exception.or_else(|| context.take_exception());
        let (response_time, status_code, response_headers, response_size) = match response {
            Some(response) => (
                response.response_time,
                response.status_code,
                Some(response.headers),
                response.size,
            ),
            None => {
                let status_code = if exception.is_some() {
                    StatusCode::INTERNAL_SERVER_ERROR.as_u16()
                } else {
                    0
                };
                (start.elapsed().as_secs_f64(), status_code, None, None)
            }
        };

        let request_body = {
            let mut capture = request_body.lock();
            if capture.is_too_large() {
                tracing::debug!(path = ?path, "Request body exceeds capture limit");
            }
            capture.take_body()
        };
        let response_body = response_body.take_body();

        let validation_errors = if status_code == StatusCode::UNPROCESSABLE_ENTITY.as_u16() {
            response_body
                .as_deref()
                .filter(|body| !body.is_empty())
                .and_then(|body| self.validation.extract(body))
        } else {
            None
        };

        let startup = self
            .state
            .claim_startup()
            .then(|| startup_data(&self.routes, &self.versions));
        let consumer = context.consumer();

        let mut record = Record {
            instance_uuid: self.instance_uuid,
            request_uuid: Uuid::new_v4(),
            startup,
            consumer: consumer.as_ref().and_then(ConsumerData::from_consumer),
            request: RequestData {
                path,
                headers: Some(request_headers),
                size: request_size,
                consumer: consumer.map(|consumer| consumer.identifier),
                body: request_body,
            },
            response: ResponseData {
                response_time,
                status_code,
                headers: response_headers,
                size: response_size,
                body: response_body,
            },
            validation_errors,
            exception,
            exclude: false,
        };

        self.masker.apply(&mut record);
        self.emitter.emit(&mut record);
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("config", &self.config)
            .field("instance_uuid", &self.instance_uuid)
            .field("routes", &self.routes)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

/// What is known about one request so far
struct Exchange {
    start: Instant,
    context: RequestContext,
    path: Option<String>,
    request_headers: Vec<(String, String)>,
    request_size: Option<u64>,
    request_body: Arc<Mutex<BodyCapture>>,
    response: Option<ResponseStart>,
    response_body: BodyCapture,
    exception: Option<ExceptionRecord>,
}

struct ResponseStart {
    response_time: f64,
    status_code: u16,
    headers: Vec<(String, String)>,
    /// Declared size, or the running total of a chunked body
    size: Option<u64>,
    chunked: bool,
}

impl ResponseStart {
    fn new<B: Body>(elapsed: f64, status: StatusCode, headers: &HeaderMap, body: &B) -> Self {
        let declared = parse_content_length(headers.get(header::CONTENT_LENGTH));
        let transfer_chunked = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .any(|value| {
                String::from_utf8_lossy(value.as_bytes())
                    .to_ascii_lowercase()
                    .contains("chunked")
            });
        let exact = body.size_hint().exact();
        let chunked = transfer_chunked || (declared.is_none() && exact.is_none());

        Self {
            response_time: elapsed,
            status_code: status.as_u16(),
            headers: header_pairs(headers),
            size: if chunked { Some(0) } else { declared.or(exact) },
            chunked,
        }
    }
}

/// Emits the record of its request when dropped.
///
/// Panics raised while assembling or emitting are caught and logged so
/// that they never reach the wrapped service's caller.
pub struct ExchangeGuard {
    interceptor: Arc<Interceptor>,
    exchange: Option<Exchange>,
}

impl ExchangeGuard {
    /// The response head is available.
    pub(crate) fn on_response_start<B: Body>(&mut self, response: &Response<B>) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        let config = &self.interceptor.config;

        let start = ResponseStart::new(
            exchange.start.elapsed().as_secs_f64(),
            response.status(),
            response.headers(),
            response.body(),
        );
        let eligible = (config.log_response_body
            || response.status() == StatusCode::UNPROCESSABLE_ENTITY)
            && is_supported_content_type(find_header(&start.headers, "content-type"));
        let declared = if start.chunked { None } else { start.size };

        exchange.response_body = BodyCapture::new(eligible, declared);
        if exchange.exception.is_none() {
            exchange.exception = response.extensions().get::<ExceptionRecord>().cloned();
        }
        exchange.response = Some(start);
    }

    pub(crate) fn on_response_chunk(&mut self, data: &[u8]) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        if let Some(response) = exchange.response.as_mut() {
            if response.chunked {
                response.size = Some(response.size.unwrap_or(0) + data.len() as u64);
            }
        }
        exchange.response_body.push(data);
    }

    pub(crate) fn on_response_end(&mut self) {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.response_body.finish();
        }
    }

    /// The response body stream failed part way.
    pub(crate) fn on_body_error<E: Display + ?Sized>(&mut self, error: &E) {
        self.record_exception(ExceptionRecord::from_display(
            std::any::type_name::<E>(),
            error,
        ));
    }

    /// Attach an error returned by the wrapped service.
    ///
    /// Boxed trait objects such as `tower::BoxError` have no meaningful type
    /// name; for those an exception the handler captured on its
    /// [`RequestContext`] is reported instead when there is one.
    pub(crate) fn on_service_error<E: Display>(&mut self, error: &E) {
        let type_name = std::any::type_name::<E>();
        if is_opaque_type(type_name) {
            let captured = self
                .exchange
                .as_ref()
                .and_then(|exchange| exchange.context.take_exception());
            if let Some(captured) = captured {
                self.record_exception(captured);
                return;
            }
        }
        self.record_exception(ExceptionRecord::from_display(type_name, error));
    }

    /// Attach an error or panic of the wrapped service.
    ///
    /// Only the first one is kept.
    pub(crate) fn record_exception(&mut self, exception: ExceptionRecord) {
        if let Some(exchange) = self.exchange.as_mut() {
            if exchange.exception.is_none() {
                exchange.exception = Some(exception);
            }
        }
    }
}

fn is_opaque_type(type_name: &str) -> bool {
    type_name.starts_with("alloc::boxed::Box<dyn ")
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        let Some(exchange) = self.exchange.take() else {
            return;
        };
        let interceptor = &self.interceptor;

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| interceptor.complete(exchange))) {
            let panic = ExceptionRecord::from_panic(&*payload);
            tracing::error!(panic = %panic.msg, "Dropping apitally record after internal panic");
        }
    }
}

impl std::fmt::Debug for ExchangeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeGuard")
            .field("finished", &self.exchange.is_none())
            .finish_non_exhaustive()
    }
}
