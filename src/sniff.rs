//! Protocol classification over a few peeked prefix bytes
//!
//! The dispatcher after a CONNECT only ever looks at a short prefix: three
//! bytes decide TLS, the token before the first space decides HTTP, and a
//! couple of known binary greetings are tunneled opaquely. SNI extraction
//! walks the ClientHello over a [`SniffingConn`] so the bytes stay
//! replayable for the TLS terminator.

use crate::conn::SniffingConn;
use crate::error::{Error, Result};
use tokio::io::AsyncRead;

const RECORD_HEADER_LEN: usize = 5;
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const MESSAGE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0;
const MAX_RECORD_LEN: usize = 16384;

const HTTP_METHODS: [&str; 9] = [
  "GET", "PUT", "POST", "HEAD", "TRACE", "DELETE", "OPTIONS", "CONNECT", "PATCH",
];

/// A TLS handshake record for protocol versions 1.0 through 1.3.
pub(crate) fn is_tls_handshake_prefix(data: &[u8]) -> bool {
  data.len() >= 3 && data[0] == RECORD_TYPE_HANDSHAKE && data[1] == 0x03 && data[2] < 0x05
}

/// An HTTP request line: a known method token before the first space within
/// the first eight bytes.
pub(crate) fn is_http_method_prefix(data: &[u8]) -> bool {
  let head = &data[..data.len().min(8)];
  match head.iter().position(|b| *b == b' ') {
    Some(pos) => match std::str::from_utf8(&head[..pos]) {
      Ok(token) => HTTP_METHODS.contains(&token),
      Err(_) => false,
    },
    None => false,
  }
}

/// The GCM login frame that push-notification clients send inside TLS:
/// version 0x29, LoginRequest tag 0x02, a varint length, then the 0x0a
/// field tag. Recognized so the stream can be tunneled opaquely.
pub(crate) fn is_gcm_login_prefix(data: &[u8]) -> bool {
  if data.len() < 3 || data[0] != 0x29 || data[1] != 0x02 {
    return false;
  }
  match read_uvarint(&data[2..]) {
    Some((_, n)) => 2 + n < data.len() && data[2 + n] == 0x0a,
    None => false,
  }
}

fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
  let mut value: u64 = 0;
  for (i, byte) in data.iter().enumerate() {
    if i >= 10 {
      return None;
    }
    value |= u64::from(byte & 0x7f) << (7 * i);
    if byte & 0x80 == 0 {
      return Some((value, i + 1));
    }
  }
  None
}

/// Peek the ClientHello off `conn` and return the first SNI host name, or
/// an empty string when the hello carries none. The walk starts at the
/// stream head, so bytes already recorded by the classification peek are
/// reused. The caller must rewind the connection afterwards so the
/// handshake bytes replay into the TLS server.
pub(crate) async fn extract_sni<S: AsyncRead + Unpin>(
  conn: &mut SniffingConn<S>,
) -> Result<String> {
  let header = conn.peek_head(RECORD_HEADER_LEN).await?;
  if header[0] != RECORD_TYPE_HANDSHAKE {
    return Err(Error::invalid_request("invalid TLS record type"));
  }
  let record_len = (header[3] as usize) << 8 | header[4] as usize;
  if record_len == 0 || record_len > MAX_RECORD_LEN {
    return Err(Error::invalid_request("invalid TLS record length"));
  }

  let record = conn.peek_head(RECORD_HEADER_LEN + record_len).await?;
  parse_client_hello(&record[RECORD_HEADER_LEN..])
}

fn parse_client_hello(record: &[u8]) -> Result<String> {
  let malformed = || Error::invalid_request("malformed client hello");

  if record.first() != Some(&MESSAGE_TYPE_CLIENT_HELLO) {
    return Err(Error::invalid_request("invalid client hello message type"));
  }
  // HandshakeType(1) + Length(3) + ProtocolVersion(2) + Random(32)
  if record.len() < 38 {
    return Err(malformed());
  }
  let mut data = &record[38..];

  // SessionID(1 + n)
  let session_len = *data.first().ok_or_else(malformed)? as usize;
  data = data.get(1 + session_len..).ok_or_else(malformed)?;

  // CipherSuites(2 + n)
  if data.len() < 2 {
    return Err(malformed());
  }
  let suites_len = (data[0] as usize) << 8 | data[1] as usize;
  data = data.get(2 + suites_len..).ok_or_else(malformed)?;

  // CompressionMethods(1 + n)
  let methods_len = *data.first().ok_or_else(malformed)? as usize;
  data = data.get(1 + methods_len..).ok_or_else(malformed)?;

  if data.is_empty() {
    return Ok(String::new());
  }

  // Extensions(2 + n), must fill the rest of the record
  if data.len() < 2 {
    return Err(malformed());
  }
  let extensions_len = (data[0] as usize) << 8 | data[1] as usize;
  data = &data[2..];
  if data.len() != extensions_len {
    return Err(Error::invalid_request("invalid client hello extensions length"));
  }

  while !data.is_empty() {
    if data.len() < 4 {
      return Err(malformed());
    }
    let ext_type = (data[0] as u16) << 8 | data[1] as u16;
    let ext_len = (data[2] as usize) << 8 | data[3] as usize;
    let ext = data.get(4..4 + ext_len).ok_or_else(malformed)?;

    if ext_type == EXTENSION_SERVER_NAME {
      if ext.len() < 2 {
        return Err(malformed());
      }
      let list_len = (ext[0] as usize) << 8 | ext[1] as usize;
      let mut names = ext.get(2..).ok_or_else(malformed)?;
      if names.len() != list_len {
        return Err(malformed());
      }
      while !names.is_empty() {
        if names.len() < 3 {
          return Err(malformed());
        }
        let name_type = names[0];
        let name_len = (names[1] as usize) << 8 | names[2] as usize;
        let name = names.get(3..3 + name_len).ok_or_else(malformed)?;
        if name_type == 0 && name_len > 0 {
          return Ok(String::from_utf8_lossy(name).into_owned());
        }
        names = &names[3 + name_len..];
      }
    }
    data = &data[4 + ext_len..];
  }

  Ok(String::new())
}

#[cfg(test)]
pub(crate) fn client_hello_with_sni(server_name: &str) -> Vec<u8> {
  // ClientHello body: version + random + empty session id + one cipher
  // suite + null compression
  let mut body = vec![0x03, 0x03];
  body.extend_from_slice(&[0u8; 32]);
  body.push(0); // session id
  body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
  body.extend_from_slice(&[0x01, 0x00]); // compression methods

  if !server_name.is_empty() {
    let name = server_name.as_bytes();
    let entry_len = 3 + name.len(); // name_type + length + host
    let list_len = entry_len;
    let ext_len = 2 + list_len;
    let mut extensions = Vec::new();
    extensions.extend_from_slice(&[0x00, 0x00]); // server_name extension
    extensions.extend_from_slice(&(ext_len as u16).to_be_bytes());
    extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
    extensions.push(0); // name_type host_name
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);

    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);
  }

  let mut handshake = vec![MESSAGE_TYPE_CLIENT_HELLO];
  handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
  handshake.extend_from_slice(&body);

  let mut record = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
  record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
  record.extend_from_slice(&handshake);
  record
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[test]
  fn classifier_is_deterministic() {
    assert!(is_http_method_prefix(b"GET / HT"));
    assert!(is_http_method_prefix(b"CONNECT "));
    assert!(is_tls_handshake_prefix(&[0x16, 0x03, 0x03, 0x00, 0x10]));
    assert!(!is_tls_handshake_prefix(&[0x16, 0x03, 0x05]));
    assert!(!is_http_method_prefix(b"SSH-2.0-"));
    assert!(!is_http_method_prefix(&[0x9f, 0x04, 0x1c, 0x22, 0x5b, 0x01, 0x7a, 0x33]));
    assert!(!is_tls_handshake_prefix(b"SSH-2.0-"));
  }

  #[test]
  fn http_method_needs_space_within_eight_bytes() {
    assert!(!is_http_method_prefix(b"GETTTTTT"));
    assert!(is_http_method_prefix(b"OPTIONS "));
    // PATCHY is not a method even though PATCH is
    assert!(!is_http_method_prefix(b"PATCHY /"));
  }

  #[test]
  fn gcm_login_frame_is_recognized() {
    assert!(is_gcm_login_prefix(b")\x02\x97\x01\x0a\x14ch"));
    assert!(is_gcm_login_prefix(b")\x02\xae\x01\x0a\x15ch"));
    assert!(!is_gcm_login_prefix(b")\x03\x97\x01\x0a\x14ch"));
    assert!(!is_gcm_login_prefix(b"GET / HT"));
  }

  #[tokio::test]
  async fn sni_round_trip_preserves_bytes() {
    let hello = client_hello_with_sni("example.test");
    let mut stream = hello.clone();
    stream.extend_from_slice(b"tail bytes");

    let (mut tx, rx) = tokio::io::duplex(32768);
    tx.write_all(&stream).await.unwrap();
    drop(tx);

    // the dispatcher classifies on an 8-byte prefix before the SNI walk;
    // extraction must pick up those same bytes from the stream head
    let mut conn = SniffingConn::new(rx);
    let prefix = conn.peek(8).await.unwrap();
    assert!(is_tls_handshake_prefix(prefix));

    let sni = extract_sni(&mut conn).await.unwrap();
    assert_eq!(sni, "example.test");

    conn.rewind().unwrap();
    let mut replayed = Vec::new();
    conn.read_to_end(&mut replayed).await.unwrap();
    assert_eq!(replayed, stream);
  }

  #[tokio::test]
  async fn hello_without_extensions_yields_empty_sni() {
    let hello = client_hello_with_sni("");
    let (mut tx, rx) = tokio::io::duplex(32768);
    tx.write_all(&hello).await.unwrap();
    drop(tx);

    let mut conn = SniffingConn::new(rx);
    assert_eq!(extract_sni(&mut conn).await.unwrap(), "");
  }

  #[tokio::test]
  async fn bogus_record_length_is_an_error() {
    let (mut tx, rx) = tokio::io::duplex(64);
    tx.write_all(&[0x16, 0x03, 0x01, 0x00, 0x00]).await.unwrap();
    drop(tx);

    let mut conn = SniffingConn::new(rx);
    assert!(extract_sni(&mut conn).await.is_err());
  }

  #[test]
  fn truncated_hello_is_an_error() {
    let mut hello = client_hello_with_sni("example.test");
    // strip the record header, then lie about an inner length
    hello.drain(..5);
    let last = hello.len() - 1;
    hello.truncate(last);
    assert!(parse_client_hello(&hello).is_err());
  }
}
