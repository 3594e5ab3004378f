//! TLS configuration and types
//!
//! Both legs of an intercepted connection: the server side presented to the
//! client with a minted certificate, and the client side toward the real
//! upstream whose certificate decisions are handed to the
//! [`CertificateValidator`] and [`ClientCertificateSelector`] hooks.
use crate::ca::CertificateEntry;
use crate::interceptor::{CertificateValidator, ClientCertificateSelector};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::ResolvesClientCert;
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, CertificateError, DigitallySignedStruct, Error as TLSError,
  RootCertStore, ServerConfig, SignatureScheme,
};

/// ALPN id of the only application protocol spoken on either leg.
pub(crate) const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Represents a server X509 certificate.
#[derive(Clone, Debug)]
pub struct Certificate {
  original: Cert,
}
#[derive(Clone, Debug)]
enum Cert {
  Der(Vec<u8>),
  Pem(Vec<u8>),
}
impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      original: Cert::Der(der.to_owned()),
    })
  }

  /// Create a `Certificate` from a PEM encoded certificate
  ///
  /// # Examples
  ///
  /// ```
  /// # use std::fs::File;
  /// # use std::io::Read;
  /// # fn cert() -> Result<(), Box<dyn std::error::Error>> {
  /// let mut buf = Vec::new();
  /// File::open("corporate-root.pem")?
  ///     .read_to_end(&mut buf)?;
  /// let cert = catapult::tls::Certificate::from_pem(&buf)?;
  /// # drop(cert);
  /// # Ok(())
  /// # }
  /// ```
  pub fn from_pem(pem: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      original: Cert::Pem(pem.to_owned()),
    })
  }

  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> crate::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem_bundle);

    Self::read_pem_certs(&mut reader)?
      .iter()
      .map(|cert_vec| Certificate::from_der(cert_vec))
      .collect::<crate::Result<Vec<Certificate>>>()
  }

  pub(crate) fn add_to_tls(self, root_cert_store: &mut RootCertStore) -> crate::Result<()> {
    use std::io::Cursor;

    match self.original {
      Cert::Der(buf) => root_cert_store
        .add(buf.into())
        .map_err(crate::errors::builder)?,
      Cert::Pem(buf) => {
        let mut reader = Cursor::new(buf);
        let certs = Self::read_pem_certs(&mut reader)?;
        for c in certs {
          root_cert_store
            .add(c.into())
            .map_err(crate::errors::builder)?;
        }
      }
    }
    Ok(())
  }

  fn read_pem_certs(reader: &mut impl BufRead) -> crate::Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(reader)
      .map(|result| match result {
        Ok(cert) => Ok(cert.as_ref().to_vec()),
        Err(_) => Err(crate::errors::builder("invalid certificate encoding")),
      })
      .collect()
  }
}

/// A private key and X509 chain.
///
/// Used as a client certificate toward upstreams asking for mutual TLS, and
/// as the fixed certificate of an endpoint that does not mint per-host ones.
pub struct Identity {
  key: PrivateKeyDer<'static>,
  certs: Vec<CertificateDer<'static>>,
}
impl Clone for Identity {
  fn clone(&self) -> Self {
    Identity {
      key: self.key.clone_key(),
      certs: self.certs.clone(),
    }
  }
}
impl fmt::Debug for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Identity")
      .field("certs", &self.certs.len())
      .finish_non_exhaustive()
  }
}
impl Identity {
  /// Parses PEM encoded private key and certificate.
  ///
  /// The input should contain a PEM encoded private key
  /// and at least one PEM encoded certificate.
  ///
  /// Note: The private key must be in RSA, SEC1 Elliptic Curve or PKCS#8 format.
  pub fn from_pem(buf: &[u8]) -> crate::Result<Identity> {
    use rustls_pemfile::Item;
    use std::io::Cursor;

    let mut pem = Cursor::new(buf);
    let mut sk = Vec::<PrivateKeyDer>::new();
    let mut certs = Vec::<CertificateDer>::new();

    for result in rustls_pemfile::read_all(&mut pem) {
      match result {
        Ok(Item::X509Certificate(cert)) => certs.push(cert),
        Ok(Item::Pkcs1Key(key)) => sk.push(key.into()),
        Ok(Item::Pkcs8Key(key)) => sk.push(key.into()),
        Ok(Item::Sec1Key(key)) => sk.push(key.into()),
        Ok(_) => {
          return Err(crate::errors::builder(TLSError::General(String::from(
            "No valid certificate was found",
          ))))
        }
        Err(_) => {
          return Err(crate::errors::builder(TLSError::General(String::from(
            "Invalid identity PEM file",
          ))))
        }
      }
    }

    if let (Some(key), false) = (sk.pop(), certs.is_empty()) {
      Ok(Identity { key, certs })
    } else {
      Err(crate::errors::builder(TLSError::General(String::from(
        "private key or certificate not found",
      ))))
    }
  }
  /// An identity from parts already in DER form.
  pub fn from_der(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
    Identity { key, certs }
  }
  /// The certificate chain, leaf first.
  pub fn certs(&self) -> &[CertificateDer<'static>] {
    &self.certs
  }
  pub(crate) fn to_certified_key(&self) -> crate::Result<Arc<CertifiedKey>> {
    let key = rustls::crypto::ring::sign::any_supported_type(&self.key)?;
    Ok(Arc::new(CertifiedKey::new(self.certs.clone(), key)))
  }
}

impl From<&CertificateEntry> for Identity {
  fn from(entry: &CertificateEntry) -> Self {
    Identity {
      key: entry.private_key(),
      certs: entry.cert_chain().to_vec(),
    }
  }
}

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(InnerVersion);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
enum InnerVersion {
  Tls1_2,
  Tls1_3,
}
impl Version {
  /// Version 1.2 of the TLS protocol.
  pub const TLS_1_2: Version = Version(InnerVersion::Tls1_2);
  /// Version 1.3 of the TLS protocol.
  pub const TLS_1_3: Version = Version(InnerVersion::Tls1_3);
  pub(crate) fn from_tls(version: rustls::ProtocolVersion) -> Option<Self> {
    match version {
      rustls::ProtocolVersion::TLSv1_2 => Some(Self(InnerVersion::Tls1_2)),
      rustls::ProtocolVersion::TLSv1_3 => Some(Self(InnerVersion::Tls1_3)),
      _ => None,
    }
  }
}

/// Problems found with an upstream certificate before any hook weighs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyErrors {
  /// The certificate does not cover the host that was dialled.
  pub name_mismatch: bool,
  /// The chain does not lead to a trusted root, is expired, revoked or malformed.
  pub chain_errors: bool,
}

impl PolicyErrors {
  /// No problems were found.
  pub fn is_empty(&self) -> bool {
    !self.name_mismatch && !self.chain_errors
  }
}

/// What the certificate validation hook gets to decide on.
#[derive(Debug)]
pub struct CertificateValidation<'a> {
  /// Host the upstream connection was opened for.
  pub host: &'a str,
  /// Presented chain, leaf first.
  pub chain: &'a [CertificateDer<'a>],
  /// Summary of what default validation found.
  pub policy_errors: PolicyErrors,
  /// Detailed verifier errors, one per failed check.
  pub errors: &'a [TLSError],
}

/// An upstream's request for a client certificate.
#[derive(Debug)]
pub struct ClientCertificateRequest<'a> {
  /// Host the upstream connection was opened for.
  pub host: &'a str,
  /// DER encoded distinguished names of issuers the server accepts, possibly empty.
  pub acceptable_issuers: &'a [&'a [u8]],
  /// Signature schemes the server can verify.
  pub signature_schemes: &'a [SignatureScheme],
}

/// Upstream certificate verifier that reports its findings to a [`CertificateValidator`].
pub(crate) struct HookedVerifier {
  roots: Arc<RootCertStore>,
  signature_algorithms: WebPkiSupportedAlgorithms,
  validator: Arc<dyn CertificateValidator>,
}

impl fmt::Debug for HookedVerifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookedVerifier")
      .field("roots", &self.roots.len())
      .finish_non_exhaustive()
  }
}

impl HookedVerifier {
  pub(crate) fn new(
    roots: Arc<RootCertStore>,
    provider: &CryptoProvider,
    validator: Arc<dyn CertificateValidator>,
  ) -> Self {
    Self {
      roots,
      signature_algorithms: provider.signature_verification_algorithms,
      validator,
    }
  }
  /// Run the default checks, collecting every failure instead of stopping at the first.
  fn check(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    server_name: &ServerName<'_>,
    now: UnixTime,
  ) -> (PolicyErrors, Vec<TLSError>) {
    let mut policy = PolicyErrors::default();
    let mut errors = Vec::new();
    let cert = match ParsedCertificate::try_from(end_entity) {
      Ok(cert) => cert,
      Err(e) => {
        policy.chain_errors = true;
        errors.push(e);
        return (policy, errors);
      }
    };
    if let Err(e) = rustls::client::verify_server_cert_signed_by_trust_anchor(
      &cert,
      &self.roots,
      intermediates,
      now,
      self.signature_algorithms.all,
    ) {
      policy.chain_errors = true;
      errors.push(e);
    }
    if let Err(e) = rustls::client::verify_server_name(&cert, server_name) {
      match e {
        TLSError::InvalidCertificate(CertificateError::BadEncoding) => policy.chain_errors = true,
        _ => policy.name_mismatch = true,
      }
      errors.push(e);
    }
    (policy, errors)
  }
}

impl ServerCertVerifier for HookedVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    let (policy_errors, errors) = self.check(end_entity, intermediates, server_name, now);
    let mut chain = Vec::with_capacity(intermediates.len() + 1);
    chain.push(end_entity.clone());
    chain.extend(intermediates.iter().cloned());
    let host = server_name.to_str();
    let validation = CertificateValidation {
      host: &host,
      chain: &chain,
      policy_errors,
      errors: &errors,
    };
    if self.validator.validate(&validation) {
      if !policy_errors.is_empty() {
        tracing::warn!(host = %host, ?policy_errors, "upstream certificate accepted despite errors");
      }
      Ok(ServerCertVerified::assertion())
    } else {
      tracing::warn!(host = %host, ?policy_errors, "upstream certificate rejected");
      Err(
        errors
          .into_iter()
          .next()
          .unwrap_or_else(|| TLSError::General("certificate rejected by validator".to_string())),
      )
    }
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls12_signature(message, cert, dss, &self.signature_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    rustls::crypto::verify_tls13_signature(message, cert, dss, &self.signature_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.signature_algorithms.supported_schemes()
  }
}

/// Answers an upstream's client certificate request through a [`ClientCertificateSelector`].
pub(crate) struct HookedClientCert {
  host: String,
  selector: Option<Arc<dyn ClientCertificateSelector>>,
  fallback: Option<Arc<CertifiedKey>>,
}

impl fmt::Debug for HookedClientCert {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HookedClientCert")
      .field("host", &self.host)
      .field("selector", &self.selector.is_some())
      .finish()
  }
}

impl HookedClientCert {
  pub(crate) fn new(
    host: &str,
    selector: Option<Arc<dyn ClientCertificateSelector>>,
    fallback: Option<Arc<CertifiedKey>>,
  ) -> Self {
    Self {
      host: host.to_string(),
      selector,
      fallback,
    }
  }
}

impl ResolvesClientCert for HookedClientCert {
  fn resolve(
    &self,
    root_hint_subjects: &[&[u8]],
    sigschemes: &[SignatureScheme],
  ) -> Option<Arc<CertifiedKey>> {
    let Some(selector) = &self.selector else {
      return self.fallback.clone();
    };
    let request = ClientCertificateRequest {
      host: &self.host,
      acceptable_issuers: root_hint_subjects,
      signature_schemes: sigschemes,
    };
    match selector.select(&request) {
      Some(identity) => match identity.to_certified_key() {
        Ok(key) => Some(key),
        Err(e) => {
          tracing::warn!(host = %self.host, "selected client certificate unusable: {}", e);
          None
        }
      },
      None => self.fallback.clone(),
    }
  }

  fn has_certs(&self) -> bool {
    self.selector.is_some() || self.fallback.is_some()
  }
}

/// Server side configuration presenting `identity` to intercepted clients.
pub(crate) fn server_config(identity: &Identity) -> crate::Result<Arc<ServerConfig>> {
  let provider = CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let mut config = ServerConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(identity.certs.clone(), identity.key.clone_key())?;
  config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
  Ok(Arc::new(config))
}
