//! Root authority and per-host leaf certificates.
//!
//! The root key pair lives as two PEM files in the storage directory and is
//! generated on first start. Leaf certificates are minted on demand and kept in
//! a [`moka`] cache, which runs at most one issuance per hostname while other
//! hostnames proceed in parallel.
use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Root certificate file inside the storage directory.
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// Root private key file inside the storage directory.
pub const CA_KEY_FILE: &str = "ca_key.pem";
/// Records which root was last installed into the system trust store.
pub const TRUST_MARKER_FILE: &str = "ca_cert.trusted";

/// Leaf certificate validity in seconds (1 year)
pub(crate) const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (6 months)
pub(crate) const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root validity (10 years)
const ROOT_TTL_DAYS: i64 = 3650;

/// A leaf certificate issued for one hostname.
///
/// Entries are immutable once published to the cache and shared by every
/// session that terminates TLS for the same host.
#[derive(Debug)]
pub struct CertificateEntry {
  hostname: String,
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  issued_at: SystemTime,
  not_after: OffsetDateTime,
}

impl CertificateEntry {
  /// Hostname the certificate was issued for.
  pub fn hostname(&self) -> &str {
    &self.hostname
  }
  /// Leaf followed by the root.
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }
  /// The leaf certificate.
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }
  /// The leaf's private key.
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
  /// When the leaf was signed.
  pub fn issued_at(&self) -> SystemTime {
    self.issued_at
  }
  /// End of the leaf's validity window.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  /// Leaf certificates never outlive the root
  not_after: OffsetDateTime,
  /// Storage path for certificates
  storage_path: PathBuf,
  /// True when the root was created by this process
  generated: bool,
}

impl CertificateAuthority {
  /// Create a new Certificate Authority
  ///
  /// If a CA already exists at the storage path, it will be loaded.
  /// Otherwise, a new CA will be generated and persisted.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let ca_cert_path = storage_path.join(CA_CERT_FILE);
    let ca_key_path = storage_path.join(CA_KEY_FILE);

    let generated = !(ca_cert_path.exists() && ca_key_path.exists());
    let (issuer, ca_cert_pem, not_after) = if generated {
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    };
    let ca_cert_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::root_authority_error("No certificate found in PEM"))?
      .map_err(|e| Error::root_authority_error(format!("Failed to parse PEM: {}", e)))?;

    if generated {
      tracing::info!(path = %ca_cert_path.display(), "generated new root certificate");
    } else {
      tracing::debug!(path = %ca_cert_path.display(), "loaded root certificate");
    }

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      not_after,
      storage_path,
      generated,
    })
  }

  /// Load existing CA certificate and key
  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, String, OffsetDateTime)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::root_authority_error(format!("Failed to parse CA key: {}", e)))?;
    let not_after = root_not_after(&cert_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::root_authority_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;
    Ok((issuer, cert_pem, not_after))
  }

  /// Generate a new CA certificate and key
  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, String, OffsetDateTime)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Catapult MITM Root CA");
    dn.push(DnType::OrganizationName, "Emo-Crab");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);
    let not_after = params.not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::root_authority_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::root_authority_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut key_file = options.open(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::root_authority_error(format!("Failed to create issuer: {}", e)))?;

    Ok((issuer, cert_pem, not_after))
  }

  /// Generate a server certificate signed by this CA
  ///
  /// The validity window is `validity` long, clipped to the root's own expiry.
  pub fn generate_server_cert(&self, hostname: &str, validity: Duration) -> Result<CertificateEntry> {
    validate_hostname(hostname)?;
    let now = OffsetDateTime::now_utc();
    if self.not_after <= now {
      return Err(Error::root_authority_error("root certificate has expired"));
    }

    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(hostname)?;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = std::cmp::min(now + validity, self.not_after);
    let not_after = params.not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::root_authority_error(format!("Failed to sign server cert: {}", e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize server key"))?;

    Ok(CertificateEntry {
      hostname: hostname.to_string(),
      cert_chain: vec![cert.der().clone(), self.ca_cert_der.clone()],
      key,
      issued_at: SystemTime::now(),
      not_after,
    })
  }

  /// Root certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Path of the persisted root certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  /// Whether this process created the root rather than loading it
  pub fn is_generated(&self) -> bool {
    self.generated
  }
}

/// Expiry of a stored root, read back from its DER encoding.
fn root_not_after(cert_pem: &str) -> Result<OffsetDateTime> {
  let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
    .next()
    .ok_or_else(|| Error::root_authority_error("No certificate found in PEM"))?
    .map_err(|e| Error::root_authority_error(format!("Failed to parse PEM: {}", e)))?;
  let (_, cert) = x509_parser::parse_x509_certificate(&der)
    .map_err(|e| Error::root_authority_error(format!("Failed to parse CA cert: {}", e)))?;
  OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
    .map_err(|e| Error::root_authority_error(format!("CA cert expiry out of range: {}", e)))
}

fn subject_alt_names(hostname: &str) -> Result<Vec<SanType>> {
  let dns = |name: &str| {
    name
      .try_into()
      .map(SanType::DnsName)
      .map_err(|_| Error::certificate_error(format!("Invalid domain name: {}", name)))
  };
  if let Ok(ip) = hostname.parse::<IpAddr>() {
    // some clients match IP targets against dNSName instead of iPAddress
    let mut sans = vec![SanType::IpAddress(ip)];
    if let Ok(name) = dns(hostname) {
      sans.push(name);
    }
    return Ok(sans);
  }
  let mut sans = vec![dns(hostname)?];
  if let Some(base) = hostname.strip_prefix("*.") {
    sans.push(dns(base)?);
  }
  Ok(sans)
}

/// Reject names no certificate should be minted for.
pub fn validate_hostname(hostname: &str) -> Result<()> {
  if hostname.parse::<IpAddr>().is_ok() {
    return Ok(());
  }
  let name = hostname.strip_prefix("*.").unwrap_or(hostname);
  let valid = !name.is_empty()
    && hostname.len() <= 253
    && name.split('.').all(|label| {
      !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
          .bytes()
          .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });
  if valid {
    Ok(())
  } else {
    Err(Error::certificate_error(format!(
      "Invalid hostname: {:?}",
      hostname
    )))
  }
}

fn normalize(hostname: &str) -> String {
  hostname.trim_end_matches('.').to_ascii_lowercase()
}

/// Installs a root certificate into a trust store.
pub trait TrustStore: Send + Sync {
  /// Make `ca_cert_path` trusted. Called only when the root is not yet recorded as installed.
  fn install(&self, ca_cert_path: &Path) -> Result<()>;
}

/// The operating system's trust store, driven through its command line tool.
///
/// Usually needs elevated privileges.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTrustStore;

impl SystemTrustStore {
  fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = std::process::Command::new(program).args(args).output()?;
    if output.status.success() {
      Ok(())
    } else {
      Err(Error::certificate_error(format!(
        "{} failed: {}",
        program,
        String::from_utf8_lossy(&output.stderr).trim()
      )))
    }
  }
}

impl TrustStore for SystemTrustStore {
  #[cfg(target_os = "linux")]
  fn install(&self, ca_cert_path: &Path) -> Result<()> {
    let target = Path::new("/usr/local/share/ca-certificates/catapult-root.crt");
    std::fs::copy(ca_cert_path, target)?;
    Self::run("update-ca-certificates", &[])
  }
  #[cfg(target_os = "macos")]
  fn install(&self, ca_cert_path: &Path) -> Result<()> {
    let path = ca_cert_path.to_string_lossy();
    Self::run(
      "security",
      &[
        "add-trusted-cert",
        "-d",
        "-r",
        "trustRoot",
        "-k",
        "/Library/Keychains/System.keychain",
        &path,
      ],
    )
  }
  #[cfg(target_os = "windows")]
  fn install(&self, ca_cert_path: &Path) -> Result<()> {
    let path = ca_cert_path.to_string_lossy();
    Self::run("certutil", &["-addstore", "-f", "ROOT", &path])
  }
  #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
  fn install(&self, _ca_cert_path: &Path) -> Result<()> {
    Err(Error::certificate_error(
      "no trust store integration for this platform",
    ))
  }
}

/// Manager for caching generated server certificates
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<CertificateEntry>>,
  leaf_validity: Duration,
  issued: AtomicU64,
}

impl CertificateManager {
  /// Create a certificate manager with default cache settings
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    Ok(Self::with_authority(
      ca,
      1000,
      std::time::Duration::from_secs(CACHE_TTL),
      Duration::seconds(TTL_SECS),
    ))
  }

  /// Create a certificate manager around an already loaded root
  pub fn with_authority(
    ca: CertificateAuthority,
    capacity: u64,
    cache_ttl: std::time::Duration,
    leaf_validity: Duration,
  ) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(capacity)
      .time_to_live(cache_ttl)
      .build();
    Self {
      ca,
      cert_cache,
      leaf_validity,
      issued: AtomicU64::new(0),
    }
  }

  /// Get or generate the certificate for `hostname`.
  ///
  /// Concurrent callers for the same uncached hostname share one signing
  /// operation.
  pub async fn get_server_cert(&self, hostname: &str) -> Result<Arc<CertificateEntry>> {
    let key = normalize(hostname);
    self
      .cert_cache
      .try_get_with(key.clone(), async {
        let entry = self.ca.generate_server_cert(&key, self.leaf_validity)?;
        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(hostname = %key, "issued leaf certificate");
        Ok::<_, Error>(Arc::new(entry))
      })
      .await
      .map_err(|e: Arc<Error>| match e.as_ref() {
        Error::RootAuthority(msg) => Error::RootAuthority(msg.clone()),
        other => Error::Certificate(other.to_string()),
      })
  }

  /// Drop the cached certificate for `hostname`.
  pub async fn invalidate(&self, hostname: &str) {
    self.cert_cache.invalidate(&normalize(hostname)).await;
  }

  /// Drop every cached certificate.
  pub fn clear(&self) {
    self.cert_cache.invalidate_all();
  }

  /// Number of leaf certificates signed so far.
  pub fn issued_count(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }

  /// The root authority.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// Get the CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    self.ca.ca_cert_der()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }

  fn trust_marker_path(&self) -> PathBuf {
    self.ca.storage_path.join(TRUST_MARKER_FILE)
  }

  /// True when the current root has not been recorded as installed in the trust store.
  pub fn needs_trust_install(&self) -> bool {
    if self.ca.is_generated() {
      return true;
    }
    std::fs::read_to_string(self.trust_marker_path())
      .map(|installed| installed != self.ca.ca_cert_pem)
      .unwrap_or(true)
  }

  /// Install the root into `store` unless this exact root was installed before.
  ///
  /// Returns whether an installation happened.
  pub async fn ensure_root_trusted(&self, store: Arc<dyn TrustStore>) -> Result<bool> {
    let marker = self.trust_marker_path();
    if let Ok(installed) = fs::read_to_string(&marker).await {
      if installed == self.ca.ca_cert_pem {
        return Ok(false);
      }
    }
    let path = self.ca_cert_path();
    tokio::task::spawn_blocking(move || store.install(&path))
      .await
      .map_err(|e| Error::Other(e.to_string()))??;
    fs::write(&marker, self.ca.ca_cert_pem.as_bytes()).await?;
    tracing::info!("root certificate installed into trust store");
    Ok(true)
  }
}
