//! HTTP proxy server implementation

mod handler;
mod response;
mod server;
mod tunnel;

pub use handler::ProxyHandler;
pub use response::ProxyBody;
pub use server::ProxyServer;
pub use tunnel::{dial, relay, TunnelHandler};

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];
