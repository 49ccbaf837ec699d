//! Per-connection state machine
//!
//! Every accepted connection reads one request head and routes on it:
//! host-less requests hit the in-process status endpoint, CONNECT opens a
//! tunnel that is re-sniffed to pick TLS interception, plaintext HTTP
//! forwarding or an opaque TCP relay, and everything else is forwarded as
//! plain HTTP. Sniffing failures always degrade to the opaque relay so the
//! client keeps working even when the proxy cannot look inside.

use crate::ca::CertAuthority;
use crate::conn::{BufferedConn, SniffingConn};
use crate::dialer::{UpstreamConn, UpstreamDialer};
use crate::error::{Error, Result};
use crate::http1::{self, RequestHead};
use crate::sniff;
use http::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// The exact bytes acknowledging an accepted CONNECT.
pub(crate) const CONNECT_ACK: &[u8] =
  b"HTTP/1.1 200 Connection established\r\nContent-Length: 0\r\n\r\n";

#[derive(Serialize)]
struct ServerStatus {
  #[serde(rename = "Goroutines")]
  tasks: usize,
  #[serde(rename = "CacheCap")]
  cache_cap: usize,
  #[serde(rename = "CacheLen")]
  cache_len: usize,
}

enum Route {
  Intercept,
  Http,
  Tunnel,
}

pub(crate) struct ConnectionHandler {
  ca: Arc<CertAuthority>,
  dialer: Arc<UpstreamDialer>,
  active: Arc<AtomicUsize>,
}

impl ConnectionHandler {
  pub fn new(ca: Arc<CertAuthority>, dialer: Arc<UpstreamDialer>, active: Arc<AtomicUsize>) -> Self {
    Self { ca, dialer, active }
  }

  /// Serve one accepted connection until it completes or the token fires.
  pub async fn handle<S>(&self, stream: S, cancel: CancellationToken)
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    tokio::select! {
      _ = cancel.cancelled() => {
        tracing::debug!("proxy: connection cancelled");
      }
      result = self.serve(stream) => {
        if let Err(e) = result {
          tracing::error!("proxy: serve: {e}");
        }
      }
    }
  }

  async fn serve<S>(&self, stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let mut conn = BufferedConn::new(stream);
    let head = http1::read_request_head(&mut conn).await?;

    if head.authority.is_none() && head.scheme.is_none() {
      // a client talking to the proxy itself
      self.handle_status(conn, head).await
    } else if head.method == Method::CONNECT {
      self.handle_connect(conn, head).await
    } else {
      self.handle_forward(conn, head).await
    }
  }

  /// `GET /status` returns a small JSON gauge; anything else host-less is
  /// a 400.
  async fn handle_status<S>(&self, mut conn: BufferedConn<S>, head: RequestHead) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let start = Instant::now();
    tracing::debug!(tag = "HTTP", method = %head.method, url = %head.path);

    let path = head.path.split('?').next().unwrap_or_default();
    if head.method == Method::GET && path == "/status" {
      let (cache_len, cache_cap) = self.ca.cache_status();
      let mut body = serde_json::to_vec(&ServerStatus {
        tasks: self.active.load(Ordering::Relaxed),
        cache_cap,
        cache_len,
      })?;
      body.push(b'\n');

      let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json;charset=utf-8\r\nContent-Length: {}\r\n\r\n",
        body.len()
      )
      .into_bytes();
      response.extend_from_slice(&body);
      conn.write_all(&response).await?;
    } else {
      conn
        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
        .await?;
    }
    conn.flush().await?;

    tracing::info!(
      tag = "HTTP",
      method = %head.method,
      url = %head.path,
      duration_ms = start.elapsed().as_millis() as u64,
    );
    Ok(())
  }

  /// Re-originate one request through the upstream dialer and relay the
  /// response verbatim. The client-to-upstream copy keeps running so
  /// request bodies and upgraded protocols (e.g. WebSocket) flow until
  /// either side ends.
  async fn handle_forward<C>(&self, mut client: C, head: RequestHead) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let start = Instant::now();
    let url = head.display_url();
    tracing::debug!(tag = "HTTP", method = %head.method, url = %url);

    let (addr, host, tls) = head.upstream_addr()?;
    let upstream = match self.dialer.dial(&addr).await {
      Ok(upstream) => upstream,
      Err(e) => {
        tracing::error!("proxy: dial {addr}: {e}");
        return Ok(());
      }
    };
    let mut upstream = if tls {
      match self.dialer.connect_tls(upstream, &host).await {
        Ok(upgraded) => UpstreamConn::Tls(Box::new(upgraded)),
        Err(e) => {
          tracing::error!("proxy: tls to {host}: {e}");
          return Ok(());
        }
      }
    } else {
      UpstreamConn::Plain(upstream)
    };

    upstream.write_all(&head.serialize_origin_form()).await?;
    upstream.flush().await?;
    relay(&mut client, &mut upstream).await;

    tracing::info!(
      tag = "HTTP",
      method = %head.method,
      url = %url,
      duration_ms = start.elapsed().as_millis() as u64,
    );
    Ok(())
  }

  /// Acknowledge the CONNECT, then route on the first bytes inside the
  /// tunnel.
  async fn handle_connect<S>(&self, mut conn: BufferedConn<S>, head: RequestHead) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    conn.write_all(CONNECT_ACK).await?;
    conn.flush().await?;

    let mut sniffed = SniffingConn::new(conn);
    let route = match sniffed.peek(8).await {
      Ok(prefix) => {
        if sniff::is_tls_handshake_prefix(prefix) {
          Route::Intercept
        } else if sniff::is_http_method_prefix(prefix) {
          Route::Http
        } else {
          tracing::warn!("proxy: fallback to tcp {:02x?}", prefix);
          Route::Tunnel
        }
      }
      Err(e) => {
        tracing::warn!("proxy: fallback to tcp: {e}");
        Route::Tunnel
      }
    };

    match route {
      Route::Intercept => self.handle_intercept(sniffed, head).await,
      Route::Http => {
        sniffed.rewind()?;
        let mut inner = BufferedConn::new(sniffed);
        let mut inner_head = http1::read_request_head(&mut inner).await?;
        inner_head.scheme = Some("http".to_string());
        if inner_head.authority.is_none() {
          inner_head.authority = inner_head.host_header().or_else(|| head.authority.clone());
        }
        self.handle_forward(inner, inner_head).await
      }
      Route::Tunnel => {
        sniffed.rewind()?;
        self.handle_tunnel(sniffed, &head, false).await
      }
    }
  }

  /// Opaque bidirectional relay to the CONNECT target; `secure` wraps the
  /// upstream side in client TLS first.
  async fn handle_tunnel<C>(&self, mut client: C, head: &RequestHead, secure: bool) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let start = Instant::now();
    let addr = head
      .authority
      .clone()
      .ok_or_else(|| Error::invalid_request("request has no host"))?;
    tracing::debug!(tag = "TCP", method = %head.method, url = %addr);

    let upstream = match self.dialer.dial(&addr).await {
      Ok(upstream) => upstream,
      Err(e) => {
        tracing::error!("proxy: dial {addr}: {e}");
        return Ok(());
      }
    };
    let mut upstream = if secure {
      let (host, _) = http1::split_host_port(&addr);
      match self.dialer.connect_tls(upstream, &host).await {
        Ok(upgraded) => UpstreamConn::Tls(Box::new(upgraded)),
        Err(e) => {
          tracing::error!("proxy: tls to {host}: {e}");
          return Ok(());
        }
      }
    } else {
      UpstreamConn::Plain(upstream)
    };

    relay(&mut client, &mut upstream).await;

    tracing::info!(
      tag = "TCP",
      method = %head.method,
      url = %addr,
      duration_ms = start.elapsed().as_millis() as u64,
    );
    Ok(())
  }

  /// Terminate TLS with a minted leaf, then route on the decrypted
  /// prefix. Certificate trouble degrades to an opaque tunnel carrying
  /// the recorded ClientHello.
  async fn handle_intercept<S>(
    &self,
    mut sniffed: SniffingConn<BufferedConn<S>>,
    head: RequestHead,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let sni = match sniff::extract_sni(&mut sniffed).await {
      Ok(sni) => sni,
      Err(e) => {
        tracing::error!("proxy: sni extraction: {e}");
        sniffed.rewind()?;
        return self.handle_tunnel(sniffed, &head, false).await;
      }
    };
    sniffed.rewind()?;

    let server_name = if sni.is_empty() {
      let authority = head
        .authority
        .clone()
        .or_else(|| head.host_header())
        .unwrap_or_default();
      http1::split_host_port(&authority).0
    } else {
      sni
    };

    let config = match self.ca.server_config(&server_name) {
      Ok(config) => config,
      Err(e) => {
        tracing::error!("proxy: leaf certificate for {server_name}: {e}");
        return self.handle_tunnel(sniffed, &head, false).await;
      }
    };

    let tls = TlsAcceptor::from(config).accept(sniffed).await?;
    let mut conn = BufferedConn::new(tls);

    if let Err(e) = conn.fill(8).await {
      tracing::warn!("proxy: fallback to tcp in tls: {e}");
      return self.handle_tunnel(conn, &head, true).await;
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&conn.buffer()[..8]);

    if sniff::is_http_method_prefix(&prefix) {
      let mut inner_head = http1::read_request_head(&mut conn).await?;
      inner_head.scheme = Some("https".to_string());
      if let Some(host) = inner_head.host_header() {
        inner_head.authority = Some(host);
      } else if inner_head.authority.is_none() {
        inner_head.authority = head.authority.clone();
      }
      self.handle_forward(conn, inner_head).await
    } else if sniff::is_gcm_login_prefix(&prefix) {
      self.handle_tunnel(conn, &head, true).await
    } else {
      tracing::warn!("proxy: fallback to tcp in tls {:02x?}", prefix);
      self.handle_tunnel(conn, &head, true).await
    }
  }
}

/// Copy both directions until each side has seen EOF. Early termination
/// (reset, cancelled peer) is routine here, not an error.
async fn relay<A, B>(a: &mut A, b: &mut B)
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  if let Err(e) = tokio::io::copy_bidirectional(a, b).await {
    tracing::debug!("proxy: relay ended: {e}");
  }
}
