//! engine error
use http::StatusCode;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `catapult::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying a `catapult` session.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Upstream SOCKS5 proxy ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// An endpoint could not be bound, fatal at start-up
  #[error("failed to bind endpoint {addr}: {source}")]
  Bind {
    /// offending endpoint
    addr: SocketAddr,
    /// cause
    source: std::io::Error,
  },
  /// A leaf certificate could not be issued for one host
  #[error("certificate error: {0}")]
  Certificate(String),
  /// The root authority cannot be loaded or sign anymore, so no TLS session can be served
  #[error("root authority unusable: {0}")]
  RootAuthority(String),
  /// Malformed HTTP on either leg
  #[error("invalid http: {0}")]
  InvalidHttp(String),
  /// The upstream could not be resolved, reached or handshaken with
  #[error("upstream {target} unreachable: {reason}")]
  Upstream {
    /// host:port that was being contacted
    target: String,
    /// cause
    reason: String,
  },
  /// An operation exceeded its deadline
  #[error("{0} timed out")]
  Timeout(&'static str),
  /// A buffered body grew past the configured limit
  #[error("body exceeds limit of {0} bytes")]
  BodyTooLarge(usize),
  /// Configuration could not be loaded or is inconsistent
  #[error("config error: {0}")]
  Config(String),
  /// Returned by interceptors to report a fault of their own.
  ///
  /// Any error an interceptor returns is logged and its changes to the
  /// session are rolled back; this variant is the one to use when the
  /// fault is not an I/O or body error bubbled up from the session.
  #[error("hook error: {0}")]
  Hook(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// Reply codes a SOCKS5 upstream answers a CONNECT with.
#[derive(ThisError, Debug)]
pub enum ReplyError {
  #[error("Succeeded")]
  /// 0x00
  Succeeded,
  #[error("General failure")]
  /// 0x01
  GeneralFailure,
  #[error("Connection not allowed by ruleset")]
  /// 0x02
  ConnectionNotAllowed,
  #[error("Network unreachable")]
  /// 0x03
  NetworkUnreachable,
  #[error("Host unreachable")]
  /// 0x04
  HostUnreachable,
  #[error("Connection refused")]
  /// 0x05
  ConnectionRefused,
  #[error("TTL expired")]
  /// 0x06
  TtlExpired,
  #[error("Command not supported")]
  /// 0x07
  CommandNotSupported,
  #[error("Address type not supported")]
  /// 0x08
  AddressTypeNotSupported,
  #[error("Unknown reply {0:#04x}")]
  /// anything else
  Unknown(u8),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::warn!("{}", error);
    error
  }
  /// Create a root authority error and log it
  pub fn root_authority_error(msg: impl Into<String>) -> Self {
    let error = Error::RootAuthority(msg.into());
    tracing::error!("{}", error);
    error
  }
  /// Create an upstream error and log it
  pub fn upstream_error(target: impl Into<String>, reason: impl ToString) -> Self {
    let error = Error::Upstream {
      target: target.into(),
      reason: reason.to_string(),
    };
    tracing::warn!("{}", error);
    error
  }
  /// Create a malformed http error and log it
  pub fn invalid_http(msg: impl Into<String>) -> Self {
    let error = Error::InvalidHttp(msg.into());
    tracing::debug!("{}", error);
    error
  }
  /// Create a config error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }
  /// Errors that stop the whole engine rather than a single session.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Error::Bind { .. } | Error::RootAuthority(_) | Error::Config(_)
    )
  }
  /// Status of the synthetic response sent to the client for an upstream failure.
  pub fn gateway_status(&self) -> StatusCode {
    match self {
      Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
      Error::IO(e) if e.kind() == ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
      _ => StatusCode::BAD_GATEWAY,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_error(value.to_string())
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(_: tokio::time::error::Elapsed) -> Self {
    Error::Timeout("operation")
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn gateway_status_for_timeouts() {
    assert_eq!(
      Error::Timeout("connect").gateway_status(),
      StatusCode::GATEWAY_TIMEOUT
    );
    assert_eq!(
      Error::upstream_error("example.com:443", "refused").gateway_status(),
      StatusCode::BAD_GATEWAY
    );
  }

  #[test]
  fn fatal_classes() {
    let bind = Error::Bind {
      addr: "127.0.0.1:80".parse().unwrap(),
      source: std::io::Error::from(ErrorKind::PermissionDenied),
    };
    assert!(bind.is_fatal());
    assert!(bind.to_string().contains("127.0.0.1:80"));
    assert!(!Error::invalid_http("bad line").is_fatal());
  }

  #[test]
  fn only_the_root_makes_certificates_fatal() {
    assert!(Error::root_authority_error("CA key unreadable").is_fatal());
    let bad_host = crate::ca::validate_hostname("bad host.example").unwrap_err();
    assert!(matches!(bad_host, Error::Certificate(_)));
    assert!(!bad_host.is_fatal());
  }
}
