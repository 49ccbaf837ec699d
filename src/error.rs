//! Error types for the proxy

use std::io;
use thiserror::Error;

/// A `Result` alias where the `Err` case is `spyglass::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),

  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),

  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),

  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// CA material could not be loaded or does not hold together
  #[error("ca: {0}")]
  CaMaterial(String),

  /// Leaf certificate could not be minted
  #[error("cert: {0}")]
  CertGen(String),

  /// Malformed request from the client
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Peek was called on a connection that is already replaying
  #[error("sniff: connection is already replaying")]
  SniffRewound,

  /// The recording buffer cannot hold the requested prefix
  #[error("sniff: recording buffer full")]
  SniffBufferFull,

  /// Relay proxy URL carries a scheme we do not speak
  #[error("unknown proxy scheme: {0}")]
  UnknownProxyScheme(String),

  /// Relay proxy answered CONNECT with a non-200 status
  #[error("relay refused CONNECT with status {0}")]
  RelayRefused(u16),

  /// SOCKS5 reply error
  #[error(transparent)]
  Socks5(#[from] ReplyError),

  /// The server is already running an accept loop
  #[error("server already listening")]
  AlreadyListening,

  /// The server has been shut down
  #[error("server closed")]
  ServerClosed,

  /// Tracked connections did not drain before the deadline
  #[error("shutdown deadline elapsed")]
  ShutdownTimeout,
}

impl Error {
  pub(crate) fn ca_material(msg: impl Into<String>) -> Self {
    Error::CaMaterial(msg.into())
  }

  pub(crate) fn cert_gen(msg: impl Into<String>) -> Self {
    Error::CertGen(msg.into())
  }

  pub(crate) fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}

/// SOCKS5 REP field values other than 0x00 mapped to their meaning.
#[derive(Error, Debug)]
pub enum ReplyError {
  #[error("succeeded")]
  Succeeded,
  #[error("general failure")]
  GeneralFailure,
  #[error("connection not allowed by ruleset")]
  ConnectionNotAllowed,
  #[error("network unreachable")]
  NetworkUnreachable,
  #[error("host unreachable")]
  HostUnreachable,
  #[error("connection refused")]
  ConnectionRefused,
  #[error("TTL expired")]
  TtlExpired,
  #[error("command not supported")]
  CommandNotSupported,
  #[error("address type not supported")]
  AddressTypeNotSupported,
  #[error("unassigned reply code {0}")]
  Unassigned(u8),
}

impl From<u8> for ReplyError {
  fn from(value: u8) -> Self {
    match value {
      0x00 => ReplyError::Succeeded,
      0x01 => ReplyError::GeneralFailure,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Unassigned(other),
    }
  }
}
