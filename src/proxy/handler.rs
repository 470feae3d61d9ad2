//! HTTP request handler for the proxy: dispatch and plaintext forwarding

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use super::response::{bad_request_response, error_response, IdleTimeoutBody};
use super::tunnel::TunnelHandler;
use super::{ProxyBody, HOP_BY_HOP_HEADERS};
use crate::capture::codec;
use crate::capture::{CaptureSink, Request as CapturedRequest};
use crate::error::{Error, Result};

/// Main proxy request handler
pub struct ProxyHandler {
    tunnel_handler: Arc<TunnelHandler>,
    sink: Arc<dyn CaptureSink>,
    upstream_timeout: Duration,
    log_requests: bool,
}

impl ProxyHandler {
    pub fn new(tunnel_handler: Arc<TunnelHandler>, sink: Arc<dyn CaptureSink>) -> Self {
        Self {
            tunnel_handler,
            sink,
            upstream_timeout: Duration::from_secs(30),
            log_requests: true,
        }
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    /// Handle an incoming proxy request.
    ///
    /// Never fails: every problem is turned into an error response so that
    /// only this request is affected.
    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
        // Handle CONNECT requests (HTTPS tunneling)
        if req.method() == Method::CONNECT {
            return Ok(self.tunnel_handler.clone().handle_connect(req).await);
        }

        // Handle regular HTTP requests (non-HTTPS)
        Ok(self.handle_http(req).await)
    }

    async fn handle_http(self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();
        parts.headers.remove("proxy-connection");

        let method = parts.method.to_string();
        let target = parts.uri.to_string();

        let Some((host, port)) = upstream_target(&parts) else {
            tracing::warn!(method = %method, target = %target, "Request without a routable host");
            return bad_request_response("request target must include a host");
        };

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(target = %target, error = %e, "Failed to read client request body");
                return bad_request_response("unreadable request body");
            }
        };

        let captured_request = codec::parse_request(&parts, &body);

        if self.log_requests {
            tracing::info!(method = %method, url = %target, "HTTP");
        }

        let forwarded = tokio::time::timeout(
            self.upstream_timeout,
            forward_http_request(&host, port, &parts, body),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::transport(format!(
                "Upstream {}:{} did not respond within {:?}",
                host, port, self.upstream_timeout
            )))
        });

        match forwarded {
            Ok(resp) => {
                let (resp_parts, resp_body) = resp.into_parts();
                let mut capture = ResponseCapture {
                    sink: self.sink.clone(),
                    request: Some(captured_request),
                    status: resp_parts.status,
                    headers: resp_parts.headers.clone(),
                    body: BytesMut::new(),
                };
                // A stalled body ends the response; the capture keeps what arrived.
                let body = IdleTimeoutBody::new(resp_body, self.upstream_timeout)
                    .map_frame(move |frame: Frame<Bytes>| {
                        if let Some(data) = frame.data_ref() {
                            capture.body.extend_from_slice(data);
                        }
                        frame
                    })
                    .boxed_unsync();
                Response::from_parts(resp_parts, body)
            }
            Err(e) => {
                tracing::error!(host = %host, port = port, error = %e, "HTTP forwarding error");
                error_response(&e.to_string())
            }
        }
    }
}

/// Host and port to forward a plaintext request to: from the absolute URI,
/// falling back to the `Host` header for origin-form requests.
fn upstream_target(parts: &Parts) -> Option<(String, u16)> {
    if let Some(host) = parts.uri.host() {
        return Some((host.to_string(), parts.uri.port_u16().unwrap_or(80)));
    }

    let header = parts.headers.get(HOST)?.to_str().ok()?;
    let authority: hyper::http::uri::Authority = header.parse().ok()?;
    Some((authority.host().to_string(), authority.port_u16().unwrap_or(80)))
}

/// Forward a plain HTTP request to the upstream server.
///
/// Uses a bare HTTP/1.1 connection, so redirects reach the client as-is.
async fn forward_http_request(
    host: &str,
    port: u16,
    parts: &Parts,
    body: Bytes,
) -> Result<Response<Incoming>> {
    // Connect to upstream
    let addr = format!("{}:{}", host, port);
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::transport(format!("Failed to connect to {}: {}", addr, e)))?;
    let io = TokioIo::new(tcp);

    // HTTP/1.1 handshake
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| Error::transport(format!("HTTP handshake with {} failed: {}", addr, e)))?;

    // Spawn connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                tracing::error!(error = %e, "HTTP upstream connection error");
            }
        }
    });

    // Rebuild request: relative URI, strip hop-by-hop headers, ensure Host header
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let new_uri: hyper::Uri = path_and_query
        .parse()
        .map_err(|e| Error::invalid_url(format!("{}: {}", path_and_query, e)))?;

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(new_uri);

    // Copy headers, stripping hop-by-hop
    for (name, value) in &parts.headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    // Ensure Host header is present
    if !parts.headers.contains_key(HOST) {
        if port == 80 {
            builder = builder.header(HOST, host);
        } else {
            builder = builder.header(HOST, format!("{}:{}", host, port));
        }
    }

    let upstream_req = builder
        .body(Full::new(body))
        .map_err(|e| Error::transport(format!("Failed to build upstream request: {}", e)))?;

    sender
        .send_request(upstream_req)
        .await
        .map_err(|e| Error::transport(format!("Request to {} failed: {}", addr, e)))
}

/// Tee of a response body on its way to the client.
///
/// Lives inside the response body; when hyper drops the body (stream finished
/// or client gone) the captured exchange is persisted off the response path.
struct ResponseCapture {
    sink: Arc<dyn CaptureSink>,
    request: Option<CapturedRequest>,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Drop for ResponseCapture {
    fn drop(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        let body = std::mem::take(&mut self.body).freeze();
        let status = self.status;
        let headers = std::mem::take(&mut self.headers);
        let sink = self.sink.clone();

        let persist = move || {
            let text = codec::decode_entities(&String::from_utf8_lossy(&body));
            let response = codec::parse_response(status, &headers, text);
            let path = request.path.clone();
            match sink.put(request, response, None) {
                Ok(id) => tracing::debug!(id = %id, path = %path, "Exchange captured"),
                Err(e) => tracing::error!(path = %path, error = %e, "Failed to persist exchange"),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(persist);
            }
            Err(_) => persist(),
        }
    }
}
