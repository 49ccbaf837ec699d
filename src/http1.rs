//! HTTP/1.1 request-head parsing and origin-form serialization
//!
//! The proxy only ever parses heads; bodies and responses are relayed as
//! raw bytes. A parsed [`RequestHead`] keeps the scheme/authority/path
//! split so the handler can rewrite requests that arrive on a CONNECT
//! tunnel before re-originating them.

use crate::conn::BufferedConn;
use crate::error::{new_io_error, Error, Result};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use std::io::ErrorKind;
use tokio::io::AsyncRead;

pub(crate) const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed request line plus headers. The body, if any, stays on the
/// connection.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
  pub method: Method,
  pub scheme: Option<String>,
  pub authority: Option<String>,
  pub path: String,
  pub headers: HeaderMap,
}

impl RequestHead {
  pub fn host_header(&self) -> Option<String> {
    self
      .headers
      .get(header::HOST)
      .and_then(|value| value.to_str().ok())
      .map(str::to_string)
  }

  /// `host:port` dial target, bare host name and TLS flag for the
  /// re-originated request. The scheme decides the default port.
  pub fn upstream_addr(&self) -> Result<(String, String, bool)> {
    let authority = self
      .authority
      .clone()
      .or_else(|| self.host_header())
      .ok_or_else(|| Error::invalid_request("request has no host"))?;
    let tls = self.scheme.as_deref() == Some("https");
    let (host, port) = split_host_port(&authority);
    let port = port.unwrap_or(if tls { 443 } else { 80 });
    let addr = if host.contains(':') {
      format!("[{host}]:{port}")
    } else {
      format!("{host}:{port}")
    };
    Ok((addr, host, tls))
  }

  /// Rewritten URL for logging.
  pub fn display_url(&self) -> String {
    match (&self.scheme, &self.authority) {
      (Some(scheme), Some(authority)) => format!("{scheme}://{authority}{}", self.path),
      (None, Some(authority)) => format!("//{authority}{}", self.path),
      _ => self.path.clone(),
    }
  }

  fn is_upgrade(&self) -> bool {
    self
      .headers
      .get(header::CONNECTION)
      .and_then(|value| value.to_str().ok())
      .map(|value| value.to_ascii_lowercase().contains("upgrade"))
      .unwrap_or(false)
  }

  /// Serialize as an origin-form request for the upstream connection.
  /// Proxy hop headers are dropped; plain requests get `Connection: close`
  /// so the upstream ends the response by closing, while upgrade requests
  /// keep their `Connection`/`Upgrade` pair intact.
  pub fn serialize_origin_form(&self) -> Vec<u8> {
    let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(self.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !self.headers.contains_key(header::HOST) {
      if let Some(authority) = &self.authority {
        out.extend_from_slice(b"Host: ");
        out.extend_from_slice(authority.as_bytes());
        out.extend_from_slice(b"\r\n");
      }
    }

    let upgrading = self.is_upgrade();
    for (name, value) in &self.headers {
      if name == "proxy-connection" || name == header::PROXY_AUTHORIZATION {
        continue;
      }
      if !upgrading && name == header::CONNECTION {
        continue;
      }
      out.extend_from_slice(name.as_str().as_bytes());
      out.extend_from_slice(b": ");
      out.extend_from_slice(value.as_bytes());
      out.extend_from_slice(b"\r\n");
    }
    if !upgrading {
      out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
  }
}

/// Read and consume one request head off the connection. Anything past the
/// final CRLF pair stays buffered.
pub(crate) async fn read_request_head<S: AsyncRead + Unpin>(
  conn: &mut BufferedConn<S>,
) -> Result<RequestHead> {
  let head_len = fill_until_head_end(conn).await?;
  let head = parse_request_head(&conn.buffer()[..head_len])?;
  conn.consume(head_len);
  Ok(head)
}

/// Read and consume a response head, returning its status code. Used for
/// the CONNECT exchange with a relay proxy; over-read bytes stay buffered
/// and replayable.
pub(crate) async fn read_response_status<S: AsyncRead + Unpin>(
  conn: &mut BufferedConn<S>,
) -> Result<u16> {
  let head_len = fill_until_head_end(conn).await?;
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut response = httparse::Response::new(&mut headers);
  response
    .parse(&conn.buffer()[..head_len])
    .map_err(|e| Error::invalid_request(format!("relay response: {e}")))?;
  let code = response
    .code
    .ok_or_else(|| Error::invalid_request("relay response missing status"))?;
  conn.consume(head_len);
  Ok(code)
}

async fn fill_until_head_end<S: AsyncRead + Unpin>(conn: &mut BufferedConn<S>) -> Result<usize> {
  loop {
    if let Some(pos) = find_head_end(conn.buffer()) {
      return Ok(pos);
    }
    if conn.buffer().len() > MAX_HEAD_BYTES {
      return Err(Error::invalid_request("head exceeds maximum allowed size"));
    }
    if conn.fill_some().await? == 0 {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "eof while reading head",
      ));
    }
  }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
  data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
  let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut request = httparse::Request::new(&mut headers);
  let status = request
    .parse(raw)
    .map_err(|e| Error::invalid_request(e.to_string()))?;
  if status.is_partial() {
    return Err(Error::invalid_request("truncated request head"));
  }

  let method = request
    .method
    .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
    .ok_or_else(|| Error::invalid_request("unrecognized method"))?;
  let target = request.path.unwrap_or("/");

  let mut map = HeaderMap::new();
  for header in request.headers.iter() {
    let name = HeaderName::from_bytes(header.name.as_bytes())
      .map_err(|_| Error::invalid_request(format!("bad header name: {}", header.name)))?;
    let value = HeaderValue::from_bytes(header.value)
      .map_err(|_| Error::invalid_request(format!("bad value for header {}", header.name)))?;
    map.append(name, value);
  }

  let (scheme, authority, path) = split_target(&method, target);
  Ok(RequestHead {
    method,
    scheme,
    authority,
    path,
    headers: map,
  })
}

fn split_target(method: &Method, target: &str) -> (Option<String>, Option<String>, String) {
  if *method == Method::CONNECT {
    return (None, Some(target.to_string()), String::new());
  }
  for scheme in ["http", "https"] {
    if let Some(rest) = target.strip_prefix(scheme).and_then(|r| r.strip_prefix("://")) {
      let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
      };
      return (
        Some(scheme.to_string()),
        Some(authority.to_string()),
        path.to_string(),
      );
    }
  }
  (None, None, target.to_string())
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub(crate) fn split_host_port(authority: &str) -> (String, Option<u16>) {
  if let Some(rest) = authority.strip_prefix('[') {
    if let Some(end) = rest.find(']') {
      let host = rest[..end].to_string();
      let port = rest[end + 1..]
        .strip_prefix(':')
        .and_then(|p| p.parse().ok());
      return (host, port);
    }
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => match port.parse() {
      Ok(port) => (host.to_string(), Some(port)),
      Err(_) => (authority.to_string(), None),
    },
    _ => (authority.to_string(), None),
  }
}
