//! Choosing and opening the upstream leg of an exchange.
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::proxy::{authority, Proxy};
use crate::request::Request;
use crate::socket::Socket;
use http::uri::Scheme;
use http::HeaderValue;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;

/// The origin server an exchange is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamTarget {
  /// `http` or `https`
  pub scheme: Scheme,
  /// Host name or IP literal, without brackets
  pub host: String,
  /// TCP port
  pub port: u16,
}

impl UpstreamTarget {
  /// Whether the upstream leg is TLS.
  pub fn is_tls(&self) -> bool {
    self.scheme == Scheme::HTTPS
  }
  /// `host:port`
  pub fn authority(&self) -> String {
    authority(&self.host, self.port)
  }
  /// Where `request` should go.
  ///
  /// The request URI is absolute by the time interceptors have run. The port
  /// defaults to 80 or 443 from the scheme. `override_target` replaces host
  /// and port but keeps the scheme.
  pub fn resolve(request: &Request, override_target: Option<&(String, u16)>) -> Result<Self> {
    let uri = request.uri();
    let scheme = match uri.scheme_str() {
      Some("https") | Some("wss") => Scheme::HTTPS,
      Some("http") | Some("ws") | None => Scheme::HTTP,
      Some(other) => return Err(Error::invalid_http(format!("unsupported scheme {other:?}"))),
    };
    if let Some((host, port)) = override_target {
      return Ok(Self {
        scheme,
        host: host.clone(),
        port: *port,
      });
    }
    let default_port = if scheme == Scheme::HTTPS { 443 } else { 80 };
    let (host, port) = match uri.host() {
      Some(host) => (host.to_string(), uri.port_u16().unwrap_or(default_port)),
      None => request
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse::<http::uri::Authority>().ok())
        .map(|a| (a.host().to_string(), a.port_u16().unwrap_or(default_port)))
        .ok_or_else(|| Error::invalid_http("request names no host"))?,
    };
    Ok(Self {
      scheme,
      host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
      port,
    })
  }
}

impl fmt::Display for UpstreamTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}", self.scheme, self.authority())
  }
}

/// What identifies an upstream connection for reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
  pub(crate) target: UpstreamTarget,
  pub(crate) local: Option<SocketAddr>,
}

/// An open upstream leg.
#[derive(Debug)]
pub(crate) struct UpstreamConnection {
  pub(crate) key: ConnectionKey,
  pub(crate) stream: BufReader<Socket>,
  /// Plain HTTP relayed through an HTTP proxy: requests go out in absolute-form
  /// carrying these credentials.
  pub(crate) forward_proxy: Option<Option<HeaderValue>>,
}

/// Opens upstream legs, directly or through the configured upstream proxies.
#[derive(Debug)]
pub struct Router {
  connector: Arc<Connector>,
  http_proxy: Option<Proxy>,
  https_proxy: Option<Proxy>,
}

impl Router {
  /// A router for plain targets through `http_proxy` and TLS targets through `https_proxy`.
  pub fn new(connector: Arc<Connector>, http_proxy: Option<Proxy>, https_proxy: Option<Proxy>) -> Self {
    Self {
      connector,
      http_proxy,
      https_proxy,
    }
  }
  pub(crate) async fn connect(&self, key: &ConnectionKey) -> Result<UpstreamConnection> {
    let target = &key.target;
    let result = self.open(key).await;
    result.map_err(|e| match e {
      Error::Timeout(_) => {
        tracing::warn!(upstream = %target, "{}", e);
        e
      }
      other => Error::upstream_error(target.authority(), other),
    })
  }
  async fn open(&self, key: &ConnectionKey) -> Result<UpstreamConnection> {
    let target = &key.target;
    let proxy = if target.is_tls() {
      self.https_proxy.as_ref()
    } else {
      self.http_proxy.as_ref()
    };
    let mut forward_proxy = None;
    let socket = match proxy {
      None => {
        self
          .connector
          .connect_host(&target.host, target.port, key.local)
          .await?
      }
      Some(proxy @ Proxy::HTTP(http)) if !target.is_tls() => {
        forward_proxy = Some(http.authorization().cloned());
        self.connector.connect_proxy(proxy, key.local).await?
      }
      Some(proxy) => {
        let mut socket = self.connector.connect_proxy(proxy, key.local).await?;
        proxy.handshake(&mut socket, &target.host, target.port).await?;
        socket
      }
    };
    let socket = if target.is_tls() {
      self.connector.upgrade_to_tls(socket, &target.host).await?
    } else {
      socket
    };
    Ok(UpstreamConnection {
      key: key.clone(),
      stream: BufReader::new(socket),
      forward_proxy,
    })
  }
  /// A raw byte pipe to `host:port` for connections relayed without interception.
  pub(crate) async fn tunnel(&self, host: &str, port: u16) -> Result<Socket> {
    let opened = async {
      match &self.https_proxy {
        None => self.connector.connect_host(host, port, None).await,
        Some(proxy) => {
          let mut socket = self.connector.connect_proxy(proxy, None).await?;
          proxy.handshake(&mut socket, host, port).await?;
          Ok(socket)
        }
      }
    };
    opened
      .await
      .map_err(|e| Error::upstream_error(authority(host, port), e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(uri: &str) -> Request {
    Request::from(Request::builder().uri(uri).body(Vec::new()).unwrap())
  }

  #[test]
  fn ports_follow_scheme() {
    let target = UpstreamTarget::resolve(&request("https://example.com/x"), None).unwrap();
    assert_eq!(target.port, 443);
    assert!(target.is_tls());
    let target = UpstreamTarget::resolve(&request("http://example.com:8080/x"), None).unwrap();
    assert_eq!(target.authority(), "example.com:8080");
    assert!(!target.is_tls());
  }

  #[test]
  fn host_header_fills_in_origin_form() {
    let mut req = request("/index.html");
    req
      .headers_mut()
      .insert(http::header::HOST, HeaderValue::from_static("example.org:81"));
    let target = UpstreamTarget::resolve(&req, None).unwrap();
    assert_eq!(target.host, "example.org");
    assert_eq!(target.port, 81);
    assert!(UpstreamTarget::resolve(&request("/"), None).is_err());
  }

  #[test]
  fn override_keeps_scheme() {
    let over = ("::1".to_string(), 8443);
    let target = UpstreamTarget::resolve(&request("https://example.com/"), Some(&over)).unwrap();
    assert_eq!(target.to_string(), "https://[::1]:8443");
  }
}
