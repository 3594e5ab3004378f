//! Listening endpoints.
use crate::errors::{Error, Result};
use crate::tls::Identity;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// How clients reach an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
  /// The client is configured to use the proxy and sends `CONNECT` or absolute-form requests.
  #[default]
  Explicit,
  /// Traffic is redirected to the proxy at the network layer and the client
  /// believes it talks to the origin.
  Transparent,
}

/// An address the engine accepts client connections on.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
  addr: SocketAddr,
  mode: EndpointMode,
  decrypt_tls: bool,
  certificate: Option<Identity>,
}

impl ProxyEndpoint {
  /// An endpoint for proxy-aware clients, decrypting TLS.
  pub fn explicit(addr: SocketAddr) -> Self {
    Self {
      addr,
      mode: EndpointMode::Explicit,
      decrypt_tls: true,
      certificate: None,
    }
  }
  /// An endpoint for redirected traffic, decrypting TLS.
  pub fn transparent(addr: SocketAddr) -> Self {
    Self {
      mode: EndpointMode::Transparent,
      ..Self::explicit(addr)
    }
  }
  /// When false, TLS is relayed without decryption and no interceptor runs for it.
  pub fn with_decrypt_tls(mut self, decrypt_tls: bool) -> Self {
    self.decrypt_tls = decrypt_tls;
    self
  }
  /// Present this certificate to every client instead of minting one per host.
  pub fn with_certificate(mut self, certificate: Identity) -> Self {
    self.certificate = Some(certificate);
    self
  }
  /// The address, with the real port once bound.
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }
  /// Explicit or transparent.
  pub fn mode(&self) -> EndpointMode {
    self.mode
  }
  /// Whether TLS is intercepted on this endpoint.
  pub fn decrypt_tls(&self) -> bool {
    self.decrypt_tls
  }
  /// The fixed certificate, if one was configured.
  pub fn certificate(&self) -> Option<&Identity> {
    self.certificate.as_ref()
  }
  /// Shorthand for `mode() == EndpointMode::Transparent`.
  pub fn is_transparent(&self) -> bool {
    self.mode == EndpointMode::Transparent
  }
}

/// A bound endpoint.
#[derive(Debug)]
pub struct EndpointListener {
  endpoint: Arc<ProxyEndpoint>,
  listener: TcpListener,
}

impl EndpointListener {
  /// Bind the endpoint. Failing to bind is fatal and names the offending address.
  pub async fn bind(endpoint: ProxyEndpoint) -> Result<Self> {
    let addr = endpoint.addr;
    let listener = TcpListener::bind(addr).await.map_err(|source| {
      let error = Error::Bind { addr, source };
      tracing::error!("{}", error);
      error
    })?;
    let local_addr = listener
      .local_addr()
      .map_err(|source| Error::Bind { addr, source })?;
    tracing::info!(endpoint = %local_addr, mode = ?endpoint.mode, decrypt_tls = endpoint.decrypt_tls, "listening");
    Ok(Self {
      endpoint: Arc::new(ProxyEndpoint {
        addr: local_addr,
        ..endpoint
      }),
      listener,
    })
  }
  /// Wait for the next client connection.
  pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
    Ok(self.listener.accept().await?)
  }
  /// The address actually bound.
  pub fn local_addr(&self) -> SocketAddr {
    self.endpoint.addr
  }
  /// The endpoint this listener serves.
  pub fn endpoint(&self) -> &Arc<ProxyEndpoint> {
    &self.endpoint
  }
  /// Stop accepting. Connections already accepted are unaffected.
  pub fn close(self) {
    tracing::info!(endpoint = %self.endpoint.addr, "endpoint closed");
  }
}

/// Where a redirected connection was headed before the firewall sent it here.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn original_destination(stream: &TcpStream) -> Option<SocketAddr> {
  let socket = socket2::SockRef::from(stream);
  let local = stream.local_addr().ok()?;
  let original = if local.is_ipv4() {
    socket.original_dst()
  } else {
    socket.original_dst_ipv6()
  };
  let original = original.ok()?.as_socket()?;
  // without a redirect rule the lookup yields the listener itself
  (original != local).then_some(original)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn original_destination(_stream: &TcpStream) -> Option<SocketAddr> {
  None
}
