use crate::errors::{Error, Result};
use crate::interceptor::{CertificateValidator, ClientCertificateSelector, DefaultValidator};
use crate::proxy::Proxy;
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::{self, Certificate, HookedClientCert, HookedVerifier, Identity, ALPN_HTTP1};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  handshake_timeout: Option<Duration>,
  min_tls_version: Option<tls::Version>,
  max_tls_version: Option<tls::Version>,
  nodelay: bool,
  keepalive: bool,
  native_roots: bool,
  identity: Option<Identity>,
  certificate: Vec<Certificate>,
  validator: Arc<dyn CertificateValidator>,
  selector: Option<Arc<dyn ClientCertificateSelector>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(60)),
      write_timeout: Some(Duration::from_secs(60)),
      connect_timeout: Some(Duration::from_secs(10)),
      handshake_timeout: Some(Duration::from_secs(10)),
      min_tls_version: None,
      max_tls_version: None,
      nodelay: true,
      keepalive: false,
      native_roots: true,
      identity: None,
      certificate: vec![],
      validator: Arc::new(DefaultValidator),
      selector: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Trust the platform's root store in addition to [`certificate`](Self::certificate).
  ///
  /// Default is `true`.
  pub fn native_roots(mut self, value: bool) -> ConnectorBuilder {
    self.native_roots = value;
    self
  }
  /// Adds certificates to the set of roots that upstream servers are validated against.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate = value;
    self
  }
  /// Client certificate offered when an upstream asks for one and no selector picks another.
  pub fn identity(mut self, value: Identity) -> ConnectorBuilder {
    self.identity = Some(value);
    self
  }
  /// Decides on upstream certificates, see [`CertificateValidator`].
  pub fn certificate_validator(mut self, value: Arc<dyn CertificateValidator>) -> ConnectorBuilder {
    self.validator = value;
    self
  }
  /// Picks client certificates, see [`ClientCertificateSelector`].
  pub fn client_certificate_selector(
    mut self,
    value: Option<Arc<dyn ClientCertificateSelector>>,
  ) -> ConnectorBuilder {
    self.selector = value;
    self
  }
  /// Enables a read timeout on upstream sockets.
  ///
  /// Default is 60 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout on upstream sockets.
  ///
  /// Default is 60 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for the TCP connect phase, per resolved address.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set a timeout for the upstream TLS handshake.
  ///
  /// Default is 10 seconds.
  pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.handshake_timeout = timeout;
    self
  }
  /// Set the minimum required TLS version for upstream connections.
  pub fn min_tls_version(mut self, version: Option<tls::Version>) -> ConnectorBuilder {
    self.min_tls_version = version;
    self
  }
  /// Set the maximum allowed TLS version for upstream connections.
  pub fn max_tls_version(mut self, version: Option<tls::Version>) -> ConnectorBuilder {
    self.max_tls_version = version;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let mut root_cert_store = RootCertStore::empty();
    if self.native_roots {
      let native = rustls_native_certs::load_native_certs();
      for e in &native.errors {
        tracing::debug!("skipping platform root: {}", e);
      }
      let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
      tracing::debug!(added, ignored, "loaded platform roots");
    }
    for cert in self.certificate.clone() {
      cert.add_to_tls(&mut root_cert_store)?;
    }
    let mut versions = rustls::ALL_VERSIONS.to_vec();
    if let Some(min_tls_version) = self.min_tls_version {
      versions.retain(|v| tls::Version::from_tls(v.version).is_none_or(|v| v >= min_tls_version));
    }
    if let Some(max_tls_version) = self.max_tls_version {
      versions.retain(|v| tls::Version::from_tls(v.version).is_some_and(|v| v <= max_tls_version));
    }
    if versions.is_empty() {
      return Err(crate::errors::builder("empty supported tls versions"));
    }
    let provider = CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let identity = match &self.identity {
      Some(id) => Some(id.to_certified_key()?),
      None => None,
    };
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      handshake_timeout: self.handshake_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      roots: Arc::new(root_cert_store),
      provider,
      versions,
      identity,
      validator: self.validator.clone(),
      selector: self.selector.clone(),
    })
  }
}

/// Opens upstream connections: DNS, optional local bind, TCP and TLS.
pub struct Connector {
  connect_timeout: Option<Duration>,
  handshake_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  roots: Arc<RootCertStore>,
  provider: Arc<CryptoProvider>,
  versions: Vec<&'static rustls::SupportedProtocolVersion>,
  identity: Option<Arc<CertifiedKey>>,
  validator: Arc<dyn CertificateValidator>,
  selector: Option<Arc<dyn ClientCertificateSelector>>,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("handshake_timeout", &self.handshake_timeout)
      .field("roots", &self.roots.len())
      .finish_non_exhaustive()
  }
}

impl Connector {
  /// A builder with the default settings.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }
  /// Connect to a remote endpoint with addr, optionally from the local address `local`.
  pub async fn connect_with_addr(&self, addr: SocketAddr, local: Option<SocketAddr>) -> Result<Socket> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    if let Some(local) = local {
      raw_socket.bind(&local.into())?;
    }
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| Error::Timeout("connect"))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }
  /// Resolve `host` and connect to the first address that answers.
  ///
  /// With a local bind address only addresses of the same family are tried.
  pub async fn connect_host(&self, host: &str, port: u16, local: Option<SocketAddr>) -> Result<Socket> {
    let lookup = tokio::net::lookup_host((host, port));
    let addrs = match self.connect_timeout {
      None => lookup.await?,
      Some(timeout) => tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| Error::Timeout("dns lookup"))??,
    };
    let mut last_error = None;
    for addr in addrs.filter(|a| local.is_none_or(|l| l.is_ipv4() == a.is_ipv4())) {
      match self.connect_with_addr(addr, local).await {
        Ok(socket) => {
          tracing::debug!(%addr, "connected upstream");
          return Ok(socket);
        }
        Err(e) => {
          tracing::debug!(%addr, "connect failed: {}", e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      Error::Other(format!("{host} has no usable address"))
    }))
  }
  /// Connect to an upstream proxy, wrapping the hop in TLS for `https://` proxies.
  pub(crate) async fn connect_proxy(&self, proxy: &Proxy, local: Option<SocketAddr>) -> Result<Socket> {
    let socket = self.connect_host(proxy.host(), proxy.port(), local).await?;
    if proxy.is_https() {
      return self.upgrade_to_tls(socket, proxy.host()).await;
    }
    Ok(socket)
  }
  /// Client side TLS toward `domain`, with the validation hooks installed.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let server_name = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::Other(format!("invalid server name {domain:?}: {e}")))?;
    let this = TlsConnector::from(self.client_config(domain)?);
    let handshake = stream.tls(move |t| async move { this.connect(server_name, t).await });
    let tls = match self.handshake_timeout {
      None => handshake.await?,
      Some(timeout) => tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| Error::Timeout("upstream tls handshake"))??,
    };
    Ok(tls)
  }
  /// A client config per host, since the client certificate resolver reports the host it serves.
  fn client_config(&self, domain: &str) -> Result<Arc<rustls::ClientConfig>> {
    let verifier = HookedVerifier::new(self.roots.clone(), &self.provider, self.validator.clone());
    let resolver = HookedClientCert::new(domain, self.selector.clone(), self.identity.clone());
    let mut config = rustls::ClientConfig::builder_with_provider(self.provider.clone())
      .with_protocol_versions(&self.versions)
      .map_err(|_| crate::errors::builder("invalid TLS versions"))?
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(verifier))
      .with_client_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
  }
}

impl Default for Connector {
  fn default() -> Self {
    Connector {
      connect_timeout: Some(Duration::from_secs(10)),
      handshake_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      read_timeout: Some(Duration::from_secs(60)),
      write_timeout: Some(Duration::from_secs(60)),
      roots: Arc::new(RootCertStore::empty()),
      provider: Arc::new(rustls::crypto::ring::default_provider()),
      versions: rustls::DEFAULT_VERSIONS.to_vec(),
      identity: None,
      validator: Arc::new(DefaultValidator),
      selector: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  #[tokio::test]
  async fn connects_from_a_local_address() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
      let (mut stream, peer) = listener.accept().await.unwrap();
      stream.write_all(b"hi").await.unwrap();
      peer
    });
    let connector = Connector::default();
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut socket = connector.connect_host("127.0.0.1", addr.port(), Some(local)).await.unwrap();
    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    let peer = accept.await.unwrap();
    assert_eq!(peer.ip(), local.ip());
  }

  #[tokio::test]
  async fn family_mismatch_has_no_address() {
    let connector = Connector::default();
    let local: SocketAddr = "[::1]:0".parse().unwrap();
    assert!(connector.connect_host("127.0.0.1", 9, Some(local)).await.is_err());
  }
}
