//! TLS-intercepting HTTP/HTTPS debugging proxy
//!
//! Clients configure this as their HTTP proxy; plaintext requests are
//! re-originated through the configured upstream, and CONNECT tunnels are
//! sniffed to decide between TLS interception (with on-the-fly leaf
//! certificates signed by a local root CA), plaintext forwarding and an
//! opaque TCP relay. Upstreams can be direct, SOCKS5 or HTTP(S) CONNECT
//! relay proxies.
//!
//! # Features
//!
//! - Root CA persistence and automatic generation (single PEM file)
//! - Leaf certificates coalesced per wildcard base under a bounded LRU
//! - SNI sniffing over a rewindable connection
//! - NSS key-log output for decrypting captured traffic
//! - Graceful shutdown with a bounded connection drain
//!
//! # Example
//!
//! ```no_run
//! use spyglass::{CertAuthority, ProxyServer, UpstreamDialer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> spyglass::Result<()> {
//!   let ca = Arc::new(CertAuthority::open("~/.mitmproxy/mitmproxy-ca.pem", None)?);
//!   let dialer = Arc::new(UpstreamDialer::from_url("")?);
//!   let server = ProxyServer::new(ca, dialer, None);
//!   server.run("127.0.0.1:8080").await
//! }
//! ```

mod ca;
mod cache;
mod config;
mod conn;
mod dialer;
mod error;
mod handler;
mod http1;
mod keylog;
mod server;
mod sniff;

pub use ca::CertAuthority;
pub use cache::CertCache;
pub use config::ProxyConfig;
pub use conn::{BufferedConn, SniffingConn};
pub use dialer::{MaybeTlsStream, UpstreamDialer};
pub use error::{Error, ReplyError, Result};
pub use keylog::KeyLogWriter;
pub use server::ProxyServer;
