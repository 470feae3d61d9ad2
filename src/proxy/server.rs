//! Main proxy server

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use super::handler::ProxyHandler;
use super::tunnel::TunnelHandler;
use crate::capture::{CaptureSink, JsonlStore, MemoryStore};
use crate::config::Config;
use crate::error::{Error, Result};

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    sink: Arc<dyn CaptureSink>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration, opening the configured store
    pub fn new(config: Config) -> Result<Self> {
        let sink: Arc<dyn CaptureSink> = match &config.storage.path {
            Some(path) => {
                tracing::info!(path = %path, "Capturing to file");
                Arc::new(JsonlStore::open(path)?)
            }
            None => {
                tracing::info!("Capturing to memory only");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::with_sink(config, sink))
    }

    /// Create a server that captures into an existing sink
    pub fn with_sink(config: Config, sink: Arc<dyn CaptureSink>) -> Self {
        Self {
            config,
            sink,
            listener: None,
        }
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Bind the server to its configured address and return the local address.
    ///
    /// Useful when binding to port 0 to discover the assigned port.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_address = &self.config.proxy.bind_address;
        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            Error::config(format!("Invalid bind address '{}': {}", bind_address, e))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::transport(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::transport(format!("Failed to get local address: {}", e)))?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections using a previously bound listener, with graceful shutdown.
    ///
    /// Must call `bind()` first.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::config("serve() called before bind()"))?;

        let tunnel_handler = Arc::new(self.make_tunnel_handler());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    self.spawn_connection(stream, client_addr.to_string(), &tunnel_handler);
                }
            }
        }
    }

    /// Spawn a task to handle a single connection.
    ///
    /// Whatever happens on the connection stays inside its task.
    fn spawn_connection<S>(
        &self,
        stream: S,
        client_addr: String,
        tunnel_handler: &Arc<TunnelHandler>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tunnel_handler = tunnel_handler.clone();
        let sink = self.sink.clone();
        let upstream_timeout = self.config.proxy.upstream_timeout();
        let log_requests = self.config.logging.log_requests;

        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req| {
                let handler = ProxyHandler::new(tunnel_handler.clone(), sink.clone())
                    .with_upstream_timeout(upstream_timeout)
                    .with_request_logging(log_requests);
                async move { handler.handle(req).await }
            });

            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                if !e.to_string().contains("connection closed") {
                    tracing::debug!(client = %client_addr, error = %e, "Connection error");
                }
            }
        });
    }

    fn make_tunnel_handler(&self) -> TunnelHandler {
        TunnelHandler::new(self.sink.clone())
            .with_connect_timeout(self.config.proxy.connect_timeout())
            .with_max_capture_bytes(self.config.proxy.max_tunnel_capture_bytes)
            .with_request_logging(self.config.logging.log_requests)
    }

    /// Get the bind address
    pub fn bind_address(&self) -> &str {
        &self.config.proxy.bind_address
    }

    /// Get the capture sink
    pub fn sink(&self) -> &Arc<dyn CaptureSink> {
        &self.sink
    }
}
