//! Interception hooks an embedding application plugs into the engine.
//!
//! Request and response interceptors run once per exchange, in registration
//! order, and the pipeline awaits each one before moving on. Certificate hooks
//! are synchronous because they run inside the upstream TLS handshake.

use crate::errors::Result;
use crate::session::Session;
use crate::tls::{CertificateValidation, ClientCertificateRequest, Identity};
use std::sync::Arc;

/// Called once a request head has been parsed, before anything reaches the upstream.
///
/// The interceptor may read or replace the body, edit headers, attach typed
/// data for the response interceptor, answer the client directly with
/// [`Session::ok`], [`Session::respond`] or [`Session::redirect`], or choose the
/// outbound address with [`Session::set_upstream_endpoint`].
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Inspect or modify the current request.
  async fn on_request(&self, session: &mut Session) -> Result<()>;
}

/// Called once the upstream response head has arrived, before anything reaches the client.
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Inspect or modify the current response.
  async fn on_response(&self, session: &mut Session) -> Result<()>;
}

/// Decides whether an upstream certificate is acceptable.
pub trait CertificateValidator: Send + Sync {
  /// Return `true` to continue the handshake.
  fn validate(&self, validation: &CertificateValidation<'_>) -> bool;
}

impl<F> CertificateValidator for F
where
  F: Fn(&CertificateValidation<'_>) -> bool + Send + Sync,
{
  fn validate(&self, validation: &CertificateValidation<'_>) -> bool {
    self(validation)
  }
}

/// Accepts a certificate only when default validation found nothing wrong.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl CertificateValidator for DefaultValidator {
  fn validate(&self, validation: &CertificateValidation<'_>) -> bool {
    validation.policy_errors.is_empty()
  }
}

/// Supplies a client certificate when an upstream asks for mutual TLS.
pub trait ClientCertificateSelector: Send + Sync {
  /// Return `None` to continue without a certificate.
  fn select(&self, request: &ClientCertificateRequest<'_>) -> Option<Identity>;
}

impl<F> ClientCertificateSelector for F
where
  F: Fn(&ClientCertificateRequest<'_>) -> Option<Identity> + Send + Sync,
{
  fn select(&self, request: &ClientCertificateRequest<'_>) -> Option<Identity> {
    self(request)
  }
}

/// Handler that manages multiple interceptors
#[derive(Clone)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
  certificate_validator: Arc<dyn CertificateValidator>,
  client_certificate_selector: Option<Arc<dyn ClientCertificateSelector>>,
}

impl InterceptorHandler {
  /// Create a new interceptor handler
  pub fn new() -> Self {
    Self {
      request_interceptors: Vec::new(),
      response_interceptors: Vec::new(),
      certificate_validator: Arc::new(DefaultValidator),
      client_certificate_selector: None,
    }
  }

  /// Add a request interceptor
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }

  /// Add a response interceptor
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }

  /// Replace the [`DefaultValidator`]
  pub fn set_certificate_validator(&mut self, validator: Arc<dyn CertificateValidator>) {
    self.certificate_validator = validator;
  }

  /// Install a client certificate selector
  pub fn set_client_certificate_selector(&mut self, selector: Arc<dyn ClientCertificateSelector>) {
    self.client_certificate_selector = Some(selector);
  }

  pub(crate) fn certificate_validator(&self) -> Arc<dyn CertificateValidator> {
    self.certificate_validator.clone()
  }

  pub(crate) fn client_certificate_selector(&self) -> Option<Arc<dyn ClientCertificateSelector>> {
    self.client_certificate_selector.clone()
  }

  /// Run the request interceptors.
  ///
  /// A failing interceptor leaves the request as it found it. The chain stops
  /// early once an interceptor has answered the client.
  pub(crate) async fn process_request(&self, session: &mut Session) {
    for interceptor in &self.request_interceptors {
      let checkpoint = session.checkpoint();
      if let Err(e) = interceptor.on_request(session).await {
        tracing::warn!(session = session.id(), "request interceptor failed: {}", e);
        session.restore(checkpoint);
      }
      if session.is_poisoned() || session.has_reply() {
        break;
      }
    }
  }

  /// Run the response interceptors, with the same failure handling as requests.
  pub(crate) async fn process_response(&self, session: &mut Session) {
    for interceptor in &self.response_interceptors {
      let checkpoint = session.checkpoint();
      if let Err(e) = interceptor.on_response(session).await {
        tracing::warn!(session = session.id(), "response interceptor failed: {}", e);
        session.restore(checkpoint);
      }
      if session.is_poisoned() {
        break;
      }
    }
  }

  /// Check if any interceptors are registered
  pub fn has_interceptors(&self) -> bool {
    !self.request_interceptors.is_empty() || !self.response_interceptors.is_empty()
  }

  pub(crate) fn inspects_responses(&self) -> bool {
    !self.response_interceptors.is_empty()
  }
}

impl Default for InterceptorHandler {
  fn default() -> Self {
    Self::new()
  }
}

/// Logs every exchange that passes through.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

#[async_trait::async_trait]
impl RequestInterceptor for LoggingInterceptor {
  async fn on_request(&self, session: &mut Session) -> Result<()> {
    let request = session.request();
    tracing::info!(
      session = session.id(),
      client = %session.client_addr(),
      "{} {}",
      request.method(),
      request.uri()
    );
    Ok(())
  }
}

#[async_trait::async_trait]
impl ResponseInterceptor for LoggingInterceptor {
  async fn on_response(&self, session: &mut Session) -> Result<()> {
    if let Some(response) = session.response() {
      tracing::info!(
        session = session.id(),
        "{} {} -> {}",
        session.request().method(),
        session.request().uri(),
        response.status_code()
      );
    }
    Ok(())
  }
}
