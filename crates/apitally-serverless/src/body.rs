//! Body wrappers that copy streamed bytes into a bounded buffer.
//!
//! Frames are forwarded unchanged and without extra buffering; capturing
//! only ever keeps up to [`MAX_BODY_SIZE`] bytes per direction.

use crate::exchange::ExchangeGuard;
use apitally_core::{BODY_TOO_LARGE, MAX_BODY_SIZE};
use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

/// Capture progress of one body direction
#[derive(Debug, Default)]
pub(crate) enum BodyCapture {
    /// Not captured at all
    #[default]
    Disabled,
    /// Eligible, no bytes seen yet
    Idle,
    Accumulating(BytesMut),
    Complete(Bytes),
    /// Over the cap; terminal
    TooLarge,
}

impl BodyCapture {
    /// Initial state for a body that may be captured.
    ///
    /// A declared size over the cap is too large whether or not the body is
    /// eligible, so the record can tell "too large" from "not captured".
    pub(crate) fn new(enabled: bool, declared_size: Option<u64>) -> Self {
        let max = MAX_BODY_SIZE as u64;
        if declared_size.is_some_and(|size| size > max) {
            Self::TooLarge
        } else if enabled {
            Self::Idle
        } else {
            Self::Disabled
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        match self {
            Self::Idle => {
                *self = Self::Accumulating(BytesMut::new());
                self.push(chunk);
            }
            Self::Accumulating(buffer) => {
                if buffer.len() + chunk.len() > MAX_BODY_SIZE {
                    *self = Self::TooLarge;
                } else {
                    buffer.extend_from_slice(chunk);
                }
            }
            Self::Disabled | Self::Complete(_) | Self::TooLarge => {}
        }
    }

    /// Mark the end of the stream
    pub(crate) fn finish(&mut self) {
        match self {
            Self::Idle => *self = Self::Complete(Bytes::new()),
            Self::Accumulating(buffer) => {
                *self = Self::Complete(std::mem::take(buffer).freeze());
            }
            Self::Disabled | Self::Complete(_) | Self::TooLarge => {}
        }
    }

    pub(crate) fn is_too_large(&self) -> bool {
        matches!(self, Self::TooLarge)
    }

    /// Body to report: what was captured so far, or the too-large sentinel.
    ///
    /// Empty bodies are reported as absent.
    pub(crate) fn into_body(self) -> Option<Bytes> {
        let body = match self {
            Self::Disabled | Self::Idle => return None,
            Self::Accumulating(buffer) => buffer.freeze(),
            Self::Complete(body) => body,
            Self::TooLarge => Bytes::from_static(BODY_TOO_LARGE),
        };
        (!body.is_empty()).then_some(body)
    }

    pub(crate) fn take_body(&mut self) -> Option<Bytes> {
        std::mem::take(self).into_body()
    }
}

pin_project! {
    /// Request body handed to the wrapped service.
    ///
    /// Behaves exactly like the original body; data frames are copied into
    /// the request's capture buffer as they are read.
    #[derive(Debug)]
    pub struct RequestBody<B> {
        #[pin]
        inner: B,
        capture: Option<Arc<Mutex<BodyCapture>>>,
    }
}

impl<B> RequestBody<B> {
    pub(crate) fn capturing(inner: B, capture: Arc<Mutex<BodyCapture>>) -> Self {
        Self {
            inner,
            capture: Some(capture),
        }
    }

    pub(crate) fn passthrough(inner: B) -> Self {
        Self {
            inner,
            capture: None,
        }
    }

    /// Wrap a body that is not being captured.
    ///
    /// Useful for calling a service behind the layer directly, e.g. in tests.
    pub fn new(inner: B) -> Self {
        Self::passthrough(inner)
    }

    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    /// Unwrap the original body, ending the capture
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B> Body for RequestBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = ready!(this.inner.poll_frame(cx));

        if let Some(capture) = this.capture {
            match &result {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        capture.lock().push(data);
                    }
                }
                Some(Err(_)) => {}
                None => capture.lock().finish(),
            }
        }

        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Response body returned by the layer.
    ///
    /// Owns the request's [`ExchangeGuard`]: the record is emitted when the
    /// stream ends, fails, or the body is dropped.
    #[derive(Debug)]
    pub struct ResponseBody<B> {
        #[pin]
        inner: B,
        guard: Option<ExchangeGuard>,
    }
}

impl<B> ResponseBody<B> {
    pub(crate) fn capturing(inner: B, guard: ExchangeGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }

    pub(crate) fn passthrough(inner: B) -> Self {
        Self { inner, guard: None }
    }

    pub fn get_ref(&self) -> &B {
        &self.inner
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = ready!(this.inner.poll_frame(cx));

        match &result {
            Some(Ok(frame)) => {
                if let (Some(guard), Some(data)) = (this.guard.as_mut(), frame.data_ref()) {
                    guard.on_response_chunk(data);
                }
            }
            Some(Err(error)) => {
                if let Some(mut guard) = this.guard.take() {
                    guard.on_body_error::<B::Error>(error);
                }
            }
            None => {
                if let Some(mut guard) = this.guard.take() {
                    guard.on_response_end();
                }
            }
        }

        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
