//! CONNECT tunnel handling: opaque byte relay with capture

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::response::{bad_request_response, connection_established_response, error_response};
use super::ProxyBody;
use crate::capture::codec;
use crate::capture::{CaptureSink, OpaqueBytes, Response as CapturedResponse, TunnelPayload};
use crate::error::{Error, Result};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Handles CONNECT tunnels. The encrypted payload is relayed untouched and
/// captured as opaque bytes.
pub struct TunnelHandler {
    sink: Arc<dyn CaptureSink>,
    connect_timeout: Duration,
    max_capture_bytes: usize,
    log_requests: bool,
}

impl TunnelHandler {
    pub fn new(sink: Arc<dyn CaptureSink>) -> Self {
        Self {
            sink,
            connect_timeout: Duration::from_secs(10),
            max_capture_bytes: 1024 * 1024,
            log_requests: true,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_capture_bytes(mut self, max: usize) -> Self {
        self.max_capture_bytes = max;
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    /// Dial the CONNECT target, answer the client, and relay in the background.
    pub async fn handle_connect(
        self: Arc<Self>,
        mut req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let Some(host) = req.uri().host().map(|h| h.to_string()) else {
            tracing::warn!(uri = %req.uri(), "CONNECT without a target host");
            return bad_request_response("CONNECT target must be host:port");
        };
        let port = req.uri().port_u16().unwrap_or(443);

        let target = match dial(&host, port, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(host = %host, port = port, error = %e, "CONNECT dial failed");
                return error_response(&e.to_string());
            }
        };

        if self.log_requests {
            tracing::info!(host = %host, port = port, "CONNECT");
        }

        // Get the upgrade future before we take the request apart
        let upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();

        let mut captured_request = codec::parse_request(&parts, b"");
        captured_request.path = format!("https://{}/", host);

        let handler = self.clone();
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(host = %host, error = %e, "Failed to take over client connection");
                    return;
                }
            };

            let payload = relay(TokioIo::new(upgraded), target, handler.max_capture_bytes).await;

            tracing::debug!(
                host = %host,
                sent = payload.client_to_target.len(),
                received = payload.target_to_client.len(),
                "Tunnel closed"
            );

            let response = CapturedResponse {
                code: 200,
                message: "200 Connection Established".to_string(),
                headers: Default::default(),
                body: String::from_utf8_lossy(payload.target_to_client.as_bytes()).into_owned(),
            };

            let sink = handler.sink.clone();
            let result = tokio::task::spawn_blocking(move || {
                sink.put(captured_request, response, Some(payload))
            })
            .await;
            match result {
                Ok(Ok(id)) => tracing::debug!(id = %id, host = %host, "Tunnel captured"),
                Ok(Err(e)) => tracing::error!(host = %host, error = %e, "Failed to persist tunnel"),
                Err(e) => tracing::error!(host = %host, error = %e, "Tunnel persistence task failed"),
            }
        });

        connection_established_response()
    }
}

/// Open a TCP connection to `host:port`, giving up after `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::transport(format!("Failed to connect to {}: {}", addr, e))),
        Err(_) => Err(Error::transport(format!(
            "Timed out connecting to {} after {:?}",
            addr, timeout
        ))),
    }
}

/// Relay bytes between `client` and `target` until either side is done.
///
/// Each direction runs as its own task and tees what it forwards into a
/// capture buffer holding at most `max_capture` bytes (the tail is kept).
/// When one direction reaches end-of-stream or fails, it shuts down its
/// destination and stops the other direction, so both sockets are released
/// once this returns.
pub async fn relay<C, T>(client: C, target: T, max_capture: usize) -> TunnelPayload
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (target_rd, target_wr) = tokio::io::split(target);

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let upstream = tokio::spawn(copy_tee(
        client_rd,
        target_wr,
        max_capture,
        stop_tx.clone(),
        stop_rx.clone(),
        "client->target",
    ));
    let downstream = tokio::spawn(copy_tee(
        target_rd,
        client_wr,
        max_capture,
        stop_tx,
        stop_rx,
        "target->client",
    ));

    let client_to_target = upstream.await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "client->target relay task failed");
        Vec::new()
    });
    let target_to_client = downstream.await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "target->client relay task failed");
        Vec::new()
    });

    TunnelPayload {
        client_to_target: OpaqueBytes::from(client_to_target),
        target_to_client: OpaqueBytes::from(target_to_client),
    }
}

async fn copy_tee<R, W>(
    mut reader: R,
    mut writer: W,
    max_capture: usize,
    stop_tx: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
    direction: &'static str,
) -> Vec<u8>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut capture = TailBuffer::new(max_capture);
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    loop {
        let n = tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(direction, error = %e, "Relay read ended");
                    break;
                }
            },
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
        };

        tokio::select! {
            res = writer.write_all(&buf[..n]) => {
                if let Err(e) = res {
                    tracing::debug!(direction, error = %e, "Relay write ended");
                    break;
                }
            }
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
        }
        capture.extend(&buf[..n]);
    }

    let _ = writer.shutdown().await;
    stop_tx.send_replace(true);
    capture.into_inner()
}

/// Byte buffer that keeps only the last `max` bytes written to it.
struct TailBuffer {
    buf: Vec<u8>,
    max: usize,
}

impl TailBuffer {
    fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
        }
    }

    fn extend(&mut self, data: &[u8]) {
        if data.len() >= self.max {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.max..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.max);
        self.buf.drain(..overflow);
        self.buf.extend_from_slice(data);
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
