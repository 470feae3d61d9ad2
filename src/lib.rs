//! tapline - A capturing forward proxy
//!
//! This crate provides a forward proxy that records every exchange passing
//! through it, plus replay and command-injection scanning of what it recorded.
//!
//! # Features
//!
//! - **Plaintext capture**: absolute-URI requests are forwarded and the full
//!   request/response pair is stored as a canonical record
//! - **CONNECT tunnels**: relayed byte-for-byte; both directions are captured
//!   as opaque payloads (no TLS interception)
//! - **Replay**: any stored request can be re-issued natively
//! - **Scanning**: stored requests are mutated parameter by parameter with
//!   shell payloads and replayed, looking for command output
//!
//! # Example
//!
//! ```no_run
//! use tapline::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("tapline.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod ops;
pub mod proxy;
pub mod replay;

pub use capture::{CaptureSink, CapturedExchange, JsonlStore, MemoryStore, RecordId};
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::ProxyServer;
pub use replay::{Replayer, ScanReport, Scanner, Signature};
