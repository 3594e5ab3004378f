//! MITM proxy server: endpoints, accept loops and shutdown.
use crate::ca::{CertificateAuthority, CertificateManager, SystemTrustStore, TrustStore};
use crate::config::MitmConfig;
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::{Error, Result};
use crate::interceptor::InterceptorHandler;
use crate::listener::{EndpointListener, ProxyEndpoint};
use crate::pipeline::{shutdown_signal, Connection, Engine};
use crate::router::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ConnectorConfig = Box<dyn FnOnce(ConnectorBuilder) -> ConnectorBuilder + Send>;

/// Proxy server implementation
///
/// Built with [`ProxyServer::builder`], started with [`ProxyServer::start`].
pub struct ProxyServer {
  config: MitmConfig,
  endpoints: Vec<ProxyEndpoint>,
  engine: Arc<Engine>,
  trust_store: Option<Arc<dyn TrustStore>>,
}

/// Builder for `ProxyServer`.
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<MitmConfig>,
  cert_manager: Option<Arc<CertificateManager>>,
  interceptor_handler: Option<InterceptorHandler>,
  trust_store: Option<Arc<dyn TrustStore>>,
  endpoints: Vec<ProxyEndpoint>,
  connector_config: Option<ConnectorConfig>,
}

impl ProxyServerBuilder {
  /// Set the `MitmConfig` to use.
  pub fn config(mut self, config: MitmConfig) -> Self {
    self.config = Some(config);
    self
  }

  /// Set the `CertificateManager` to use.
  pub fn cert_manager(mut self, cert_manager: Arc<CertificateManager>) -> Self {
    self.cert_manager = Some(cert_manager);
    self
  }

  /// Set the hooks.
  pub fn interceptor_handler(mut self, handler: InterceptorHandler) -> Self {
    self.interceptor_handler = Some(handler);
    self
  }

  /// Install the root into `store` at start-up, unless it is already there.
  pub fn trust_store(mut self, store: Arc<dyn TrustStore>) -> Self {
    self.trust_store = Some(store);
    self
  }

  /// Listen on `endpoint`. Once any endpoint is added here, the endpoints of
  /// the configuration are ignored.
  pub fn endpoint(mut self, endpoint: ProxyEndpoint) -> Self {
    self.endpoints.push(endpoint);
    self
  }

  /// Adjust the upstream connector beyond what `MitmConfig` covers.
  pub fn configure_connector<F>(mut self, f: F) -> Self
  where
    F: FnOnce(ConnectorBuilder) -> ConnectorBuilder + Send + 'static,
  {
    self.connector_config = Some(Box::new(f));
    self
  }

  /// Build the `ProxyServer`.
  ///
  /// Loading the root authority is async, so this needs a `CertificateManager`
  /// from [`cert_manager`](Self::cert_manager). Use
  /// [`build_async`](Self::build_async) to have one created from the configuration.
  pub fn build(self) -> Result<ProxyServer> {
    let config = self.config.unwrap_or_default();
    config.validate()?;
    let Some(certificates) = self.cert_manager else {
      return Err(Error::config_error(
        "CertificateManager not provided; use ProxyServer::builder().build_async().await",
      ));
    };
    let endpoints = if self.endpoints.is_empty() {
      config
        .endpoints
        .iter()
        .map(|endpoint| endpoint.to_endpoint())
        .collect::<Result<Vec<_>>>()?
    } else {
      self.endpoints
    };
    let handler = self.interceptor_handler.unwrap_or_default();
    let mut connector = Connector::builder()
      .connect_timeout(Some(config.connect_timeout()))
      .handshake_timeout(Some(config.handshake_timeout()))
      .read_timeout(Some(config.idle_timeout()))
      .write_timeout(Some(config.idle_timeout()))
      .certificate(config.root_certificates()?)
      .certificate_validator(handler.certificate_validator())
      .client_certificate_selector(handler.client_certificate_selector());
    if let Some(configure) = self.connector_config {
      connector = configure(connector);
    }
    let (http_proxy, https_proxy) = config.upstream_proxies()?;
    let router = Router::new(Arc::new(connector.build()?), http_proxy, https_proxy);
    let engine = Engine {
      handler,
      certificates,
      router,
      handshake_timeout: config.handshake_timeout(),
      idle_timeout: config.idle_timeout(),
      max_body_size: config.max_body_size,
    };
    Ok(ProxyServer {
      config,
      endpoints,
      engine: Arc::new(engine),
      trust_store: self.trust_store,
    })
  }

  /// Build the `ProxyServer`, loading or generating the root authority under
  /// `ca_storage_path` when no `CertificateManager` was given.
  pub async fn build_async(mut self) -> Result<ProxyServer> {
    if self.cert_manager.is_none() {
      let config = self.config.clone().unwrap_or_default();
      let authority = CertificateAuthority::new(&config.ca_storage_path).await?;
      self.cert_manager = Some(Arc::new(CertificateManager::with_authority(
        authority,
        config.cert_cache_capacity,
        Duration::from_secs(config.cert_cache_ttl),
        time::Duration::days(config.leaf_validity_days),
      )));
    }
    self.build()
  }
}

impl ProxyServer {
  /// Start configuring a server.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The configuration the server was built from.
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  /// The certificate manager minting leaf certificates for this server.
  pub fn certificate_manager(&self) -> &Arc<CertificateManager> {
    &self.engine.certificates
  }

  /// Bind every endpoint and start accepting clients.
  ///
  /// Any endpoint failing to bind fails the whole start; nothing keeps
  /// listening in that case.
  pub async fn start(self) -> Result<ProxyHandle> {
    let store = match (&self.trust_store, self.config.install_root_trust) {
      (Some(store), _) => Some(store.clone()),
      (None, true) => Some(Arc::new(SystemTrustStore) as Arc<dyn TrustStore>),
      (None, false) => None,
    };
    if let Some(store) = store {
      self.engine.certificates.ensure_root_trusted(store).await?;
    }
    let mut listeners = Vec::with_capacity(self.endpoints.len());
    for endpoint in self.endpoints {
      listeners.push(EndpointListener::bind(endpoint).await?);
    }
    let local_addrs: Vec<SocketAddr> = listeners.iter().map(EndpointListener::local_addr).collect();
    let (shutdown, _) = watch::channel(false);
    let sessions = Arc::new(Mutex::new(JoinSet::new()));
    let next_id = Arc::new(AtomicU64::new(1));
    let mut accept_loops = JoinSet::new();
    for listener in listeners {
      accept_loops.spawn(accept_loop(
        listener,
        self.engine.clone(),
        shutdown.subscribe(),
        sessions.clone(),
        next_id.clone(),
      ));
    }
    info!(endpoints = ?local_addrs, "proxy started");
    Ok(ProxyHandle {
      local_addrs,
      shutdown,
      accept_loops,
      sessions,
      grace: self.config.shutdown_grace(),
      certificates: self.engine.certificates.clone(),
    })
  }
}

/// A running server.
///
/// Dropping the handle without calling [`stop`](Self::stop) aborts every
/// listener and session at once.
pub struct ProxyHandle {
  local_addrs: Vec<SocketAddr>,
  shutdown: watch::Sender<bool>,
  accept_loops: JoinSet<()>,
  sessions: Arc<Mutex<JoinSet<()>>>,
  grace: Duration,
  certificates: Arc<CertificateManager>,
}

impl ProxyHandle {
  /// Addresses actually bound, in endpoint order.
  pub fn local_addrs(&self) -> &[SocketAddr] {
    &self.local_addrs
  }

  /// The certificate manager of the running server.
  pub fn certificate_manager(&self) -> &Arc<CertificateManager> {
    &self.certificates
  }

  /// Stop with the configured grace period.
  pub async fn stop(self) {
    let grace = self.grace;
    self.stop_with_grace(grace).await
  }

  /// Close every listener, let sessions finish the exchange in progress for up
  /// to `grace`, then abort the rest.
  pub async fn stop_with_grace(mut self, grace: Duration) {
    info!(?grace, "stopping proxy");
    self.shutdown.send_replace(true);
    while self.accept_loops.join_next().await.is_some() {}
    let mut sessions = std::mem::replace(&mut *lock(&self.sessions), JoinSet::new());
    let drained = tokio::time::timeout(grace, async {
      while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
      warn!(remaining = sessions.len(), "grace period over, aborting sessions");
      sessions.abort_all();
      while sessions.join_next().await.is_some() {}
    }
    info!("proxy stopped");
  }
}

fn lock(sessions: &Mutex<JoinSet<()>>) -> MutexGuard<'_, JoinSet<()>> {
  sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(
  listener: EndpointListener,
  engine: Arc<Engine>,
  mut shutdown: watch::Receiver<bool>,
  sessions: Arc<Mutex<JoinSet<()>>>,
  next_id: Arc<AtomicU64>,
) {
  loop {
    let accepted = tokio::select! {
      accepted = listener.accept() => accepted,
      _ = shutdown_signal(&mut shutdown) => break,
    };
    match accepted {
      Ok((stream, client_addr)) => {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
          engine.clone(),
          listener.endpoint().clone(),
          id,
          client_addr,
          shutdown.clone(),
        );
        let span = tracing::info_span!("session", id, client = %client_addr);
        let mut sessions = lock(&sessions);
        while sessions.try_join_next().is_some() {}
        sessions.spawn(serve(connection, stream).instrument(span));
      }
      Err(e) => {
        warn!(endpoint = %listener.local_addr(), "accept failed: {}", e);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
      }
    }
  }
  listener.close();
}

async fn serve(connection: Connection, stream: TcpStream) {
  debug!("session opened");
  match connection.run(stream).await {
    Ok(()) => debug!("session closed"),
    Err(e) if e.is_fatal() => error!("session failed: {}", e),
    Err(e) => debug!("session ended: {}", e),
  }
}
