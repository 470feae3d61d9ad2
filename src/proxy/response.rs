//! Shared HTTP response helpers for error and tunnel responses

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

use crate::error::Error;

/// Error type of proxied bodies: upstream failures and stalls.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy hands back to its clients.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body wrapper that fails once `idle` passes without a new frame.
///
/// The timer restarts on every frame, so long transfers that keep making
/// progress are not cut off.
pub struct IdleTimeoutBody<B> {
    inner: Pin<Box<B>>,
    idle: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl<B> IdleTimeoutBody<B> {
    pub fn new(inner: B, idle: Duration) -> Self {
        Self {
            inner: Box::pin(inner),
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(frame) => {
                let deadline = Instant::now() + this.idle;
                this.sleep.as_mut().reset(deadline);
                Poll::Ready(frame.map(|res| res.map_err(Into::into)))
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    let err: BoxError = Box::new(Error::transport(format!(
                        "upstream body stalled for {:?}",
                        this.idle
                    )));
                    Poll::Ready(Some(Err(err)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut resp = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|e| match e {})
            .boxed_unsync(),
    );
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// Create an HTTP 502 Bad Gateway error response
pub fn error_response(message: &str) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, format!("Proxy error: {}\n", message))
}

/// Create an HTTP 400 response for requests the proxy cannot route
pub fn bad_request_response(message: &str) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_REQUEST, format!("Bad proxy request: {}\n", message))
}

/// Create the `200 Connection Established` reply to a CONNECT
pub fn connection_established_response() -> Response<ProxyBody> {
    let mut resp = Response::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed_unsync());
    resp.extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let resp = error_response("test error");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_bad_request_response() {
        let resp = bad_request_response("missing host");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_connection_established_response() {
        let resp = connection_established_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let reason = resp.extensions().get::<hyper::ext::ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Connection Established");
    }

    #[tokio::test]
    async fn test_idle_timeout_passes_complete_body() {
        let body = IdleTimeoutBody::new(
            Full::new(Bytes::from_static(b"done")),
            Duration::from_secs(5),
        );
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"done"));
    }

    /// Yields one data frame, then never makes progress again.
    struct StallingBody {
        sent: bool,
    }

    impl Body for StallingBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            if self.sent {
                return Poll::Pending;
            }
            self.sent = true;
            Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"partial")))))
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_stalled_body() {
        let mut body =
            IdleTimeoutBody::new(StallingBody { sent: false }, Duration::from_millis(100));
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"partial"));

        let started = std::time::Instant::now();
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("stalled"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
