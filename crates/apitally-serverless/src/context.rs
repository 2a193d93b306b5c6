//! Per-request handle given to handlers through request extensions

use crate::state::ProcessState;
use apitally_core::{Consumer, ExceptionRecord};
use http::Extensions;
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::sync::Arc;

/// Lets a handler attach a consumer or an error to the current request.
///
/// The interceptor inserts one into the extensions of every request it
/// captures. Cloning is cheap and clones refer to the same request.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(req: Request<RequestBody<Full<Bytes>>>) -> Result<Response<Full<Bytes>>, Infallible> {
///     if let Some(ctx) = RequestContext::from_extensions(req.extensions()) {
///         ctx.set_consumer("user-42", Some("Alice"), Some("admins"));
///     }
///     // ...
/// }
/// ```
#[derive(Clone, Debug)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    state: Arc<ProcessState>,
    consumer: Mutex<Option<Consumer>>,
    exception: Mutex<Option<ExceptionRecord>>,
}

impl RequestContext {
    pub(crate) fn new(state: Arc<ProcessState>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                state,
                consumer: Mutex::new(None),
                exception: Mutex::new(None),
            }),
        }
    }

    /// Find the context of a captured request
    pub fn from_extensions(extensions: &Extensions) -> Option<&Self> {
        extensions.get::<Self>()
    }

    /// Attribute the request to a consumer.
    ///
    /// Blank identifiers are ignored. Name and group are only reported the
    /// first time a given combination is seen.
    pub fn set_consumer(&self, identifier: &str, name: Option<&str>, group: Option<&str>) {
        let Some(consumer) = Consumer::new(identifier, name, group) else {
            tracing::debug!("Ignoring consumer with blank identifier");
            return;
        };
        let consumer = self.inner.state.consumers().resolve(consumer);
        *self.inner.consumer.lock() = Some(consumer);
    }

    /// Report an error the handler turned into a response itself.
    pub fn capture_error<E>(&self, error: &E)
    where
        E: StdError + ?Sized,
    {
        self.capture_exception(ExceptionRecord::from_error(error));
    }

    /// Report an already normalized error.
    ///
    /// The first report wins.
    pub fn capture_exception(&self, exception: ExceptionRecord) {
        let mut slot = self.inner.exception.lock();
        if slot.is_none() {
            *slot = Some(exception);
        }
    }

    pub(crate) fn consumer(&self) -> Option<Consumer> {
        self.inner.consumer.lock().clone()
    }

    pub(crate) fn take_exception(&self) -> Option<ExceptionRecord> {
        self.inner.exception.lock().take()
    }
}

/// Attribute a request to a consumer.
///
/// Does nothing when the request is not captured.
pub fn set_consumer(
    extensions: &Extensions,
    identifier: &str,
    name: Option<&str>,
    group: Option<&str>,
) {
    if let Some(context) = RequestContext::from_extensions(extensions) {
        context.set_consumer(identifier, name, group);
    }
}
