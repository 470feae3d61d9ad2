//! Test infrastructure for e2e proxy tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tapline::{CaptureSink, CapturedExchange, Config, MemoryStore, ProxyServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// TestProxy — wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub addr: SocketAddr,
    pub sink: Arc<MemoryStore>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Start a proxy on an ephemeral port capturing into memory.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a proxy after letting the caller adjust the configuration.
    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::minimal("127.0.0.1:0".to_string());
        config.logging.log_requests = false;
        configure(&mut config);

        let sink = Arc::new(MemoryStore::new());
        let mut server = ProxyServer::with_sink(config, sink.clone());

        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self {
            addr,
            sink,
            shutdown_tx,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait until at least `count` exchanges have been captured.
    ///
    /// Capture completes after the response has been delivered, so tests poll.
    pub async fn wait_for_records(&self, count: usize) -> Vec<CapturedExchange> {
        for _ in 0..200 {
            if self.sink.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sink.get_all().unwrap()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// test_client — reqwest client that uses the proxy
// ---------------------------------------------------------------------------

/// Build a reqwest client that routes through the given proxy and never
/// follows redirects, so 3xx responses can be inspected.
pub fn test_client(proxy_addr: SocketAddr) -> reqwest::Client {
    let proxy_url = format!("http://{}", proxy_addr);
    let proxy = reqwest::Proxy::all(&proxy_url).unwrap();

    reqwest::Client::builder()
        .proxy(proxy)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Raw TCP helpers
// ---------------------------------------------------------------------------

/// A TCP server that echoes every byte back until the peer closes.
pub struct EchoServer {
    pub addr: SocketAddr,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Send a CONNECT for `authority` and return the stream plus the raw reply head.
pub async fn connect_through(proxy_addr: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        authority, authority
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Read bytes up to and including the blank line ending a response head.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("timed out reading response head")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
