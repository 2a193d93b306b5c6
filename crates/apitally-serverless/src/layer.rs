//! The tower layer wrapping an application.

use crate::body::{RequestBody, ResponseBody};
use crate::exchange::Interceptor;
use crate::routes::Routes;
use crate::state::ProcessState;
use crate::validation::{DefaultValidationExtractor, ValidationErrorExtractor};
use apitally_core::{Config, DataMasker, ExceptionRecord, LogEmitter, LogSink, Result, StdoutSink};
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::{Method, Request, Response};
use http_body::Body;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use uuid::Uuid;

/// Captures every request of the wrapped service and writes one log line
/// per request.
///
/// # Example
///
/// ```rust,ignore
/// use apitally_serverless::{ApitallyLayer, Config, Routes};
/// use http::Method;
///
/// let layer = ApitallyLayer::builder(Config::new().log_request_body(true))
///     .routes(Routes::new().route("/items/{id}", [Method::GET]))
///     .package_version("my-service", env!("CARGO_PKG_VERSION"))
///     .build()?;
///
/// let service = tower::ServiceBuilder::new().layer(layer).service(app);
/// ```
#[derive(Clone, Debug)]
pub struct ApitallyLayer {
    interceptor: Arc<Interceptor>,
}

impl ApitallyLayer {
    /// Create a layer writing to stdout, without a route catalog.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Create a layer configured from `APITALLY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?)
    }

    pub fn builder(config: Config) -> ApitallyLayerBuilder {
        ApitallyLayerBuilder::new(config)
    }

    /// Identifier shared by every record of this layer
    pub fn instance_uuid(&self) -> Uuid {
        self.interceptor.instance_uuid
    }

    pub fn config(&self) -> &Config {
        &self.interceptor.config
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.interceptor.state
    }
}

impl<S> Layer<S> for ApitallyLayer {
    type Service = ApitallyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApitallyService {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// Builder for [`ApitallyLayer`]
pub struct ApitallyLayerBuilder {
    config: Config,
    routes: Routes,
    sink: Option<Arc<dyn LogSink>>,
    state: Option<Arc<ProcessState>>,
    versions: BTreeMap<String, String>,
    validation: Option<Arc<dyn ValidationErrorExtractor>>,
}

impl ApitallyLayerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            routes: Routes::new(),
            sink: None,
            state: None,
            versions: BTreeMap::new(),
            validation: None,
        }
    }

    /// Routes of the wrapped application.
    ///
    /// Records only carry a path when the request matches one of them.
    pub fn routes(mut self, routes: Routes) -> Self {
        self.routes = routes;
        self
    }

    /// Write log lines somewhere other than stdout
    pub fn sink(mut self, sink: impl LogSink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Share startup and consumer state with other layers
    pub fn state(mut self, state: Arc<ProcessState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Report a package version in the startup metadata
    pub fn package_version(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.versions.insert(name.into(), version.into());
        self
    }

    /// Replace the default 422 body parser
    pub fn validation_extractor(mut self, extractor: impl ValidationErrorExtractor) -> Self {
        self.validation = Some(Arc::new(extractor));
        self
    }

    /// Compile the masking patterns and build the layer.
    pub fn build(self) -> Result<ApitallyLayer> {
        let masker = DataMasker::new(&self.config)?;
        let emitter = match self.sink {
            Some(sink) => LogEmitter::from_arc(sink),
            None => LogEmitter::new(StdoutSink),
        };

        let interceptor = Interceptor {
            config: self.config,
            masker,
            emitter,
            instance_uuid: Uuid::new_v4(),
            state: self.state.unwrap_or_default(),
            routes: self.routes,
            versions: self.versions,
            validation: self
                .validation
                .unwrap_or_else(|| Arc::new(DefaultValidationExtractor)),
        };

        tracing::debug!(
            instance_uuid = %interceptor.instance_uuid,
            enabled = interceptor.config.enabled,
            "Apitally layer initialized"
        );

        Ok(ApitallyLayer {
            interceptor: Arc::new(interceptor),
        })
    }
}

/// Service produced by [`ApitallyLayer`]
///
/// Errors returned by the inner service are reported with their type name.
/// For boxed errors such as `tower::BoxError` that name says nothing about
/// the cause, so handlers returning them should also call
/// [`RequestContext::capture_error`](crate::RequestContext::capture_error);
/// the captured exception is then reported in place of the boxed one.
#[derive(Clone, Debug)]
pub struct ApitallyService<S> {
    inner: S,
    interceptor: Arc<Interceptor>,
}

impl<S> ApitallyService<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ApitallyService<S>
where
    S: Service<Request<RequestBody<ReqBody>>, Response = Response<ResBody>>,
    S::Error: Display + Send + 'static,
    S::Future: Send + 'static,
    ResBody: Body<Data = Bytes>,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if !self.interceptor.config.enabled || req.method() == Method::OPTIONS {
            let future = self.inner.call(req.map(RequestBody::passthrough));
            return Box::pin(async move {
                future
                    .await
                    .map(|response| response.map(ResponseBody::passthrough))
            });
        }

        let start = Instant::now();
        let (mut parts, body) = req.into_parts();
        let (mut guard, capture) = self.interceptor.begin(start, &mut parts);
        let future = self
            .inner
            .call(Request::from_parts(parts, RequestBody::capturing(body, capture)));

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(response)) => {
                    guard.on_response_start(&response);
                    Ok(response.map(|body| ResponseBody::capturing(body, guard)))
                }
                Ok(Err(error)) => {
                    guard.on_service_error(&error);
                    drop(guard);
                    Err(error)
                }
                Err(payload) => {
                    guard.record_exception(ExceptionRecord::from_panic(&*payload));
                    drop(guard);
                    std::panic::resume_unwind(payload)
                }
            }
        })
    }
}
